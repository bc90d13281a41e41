//! TileStream Tiler
//!
//! Offline tiling pipeline for large building models: deduplicates
//! geometry, computes oriented bounding boxes, batches buffers into
//! size-bounded tile files, and schedules many models in parallel under a
//! bounded worker budget.

pub mod dedup;
pub mod error;
pub mod mesh;
pub mod obb;
pub mod output;
pub mod scheduler;
pub mod tiler;

pub use dedup::{GeometryDeduplicator, Observation};
pub use error::{Error, Result};
pub use mesh::RawMesh;
pub use obb::obb_from_positions;
pub use output::{DirectoryOutput, MemoryOutput, SETTINGS_FILE, SUMMARY_FILE};
pub use scheduler::{JobEvent, JobMeta, ParseScheduler, SchedulerSettings, TileJob};
pub use tiler::{
    GeometryTiler, ModelInfo, SourceElement, SourceGeometry, TileOutput, TilerSettings,
};
