//! TileStream Streamer
//!
//! Runtime half of the pipeline: renders identification-colored bounding
//! box proxies off screen, turns the pixels into visibility decisions with
//! hysteresis, and streams the tiles of newly visible geometry best-first
//! over HTTP.

pub mod color;
pub mod engine;
pub mod error;
pub mod gpu;
pub mod loader;
pub mod occlusion;
pub mod worker;

pub use color::{ColorCode, ColorCodeAllocator, COLOR_SPACE};
pub use engine::{PriorityBuckets, StreamerSettings, VisibilityEngine, VisibilityUpdate};
pub use error::{Error, Result};
pub use gpu::GpuRenderer;
pub use loader::{
    BatchInstance, GeometryBatch, HttpTransport, LoadOutcome, TileLoader, TileTransport,
};
pub use occlusion::{CameraPose, OcclusionRenderer, OffscreenConfig, PixelBuffer, ProxyInstance};
pub use worker::{
    LoadModelRequest, RendererFactory, StreamerEvent, StreamerRequest, StreamerWorker,
};
