//! TileStream Codec
//!
//! Shared serialization layer for tiled building models: the binary tile
//! codec plus the manifest and fragment-group summary documents that the
//! tiler writes and the streaming runtime reads.

pub mod error;
pub mod manifest;
pub mod summary;
pub mod tile;

pub use error::{Error, Result};
pub use manifest::{
    signed_geometry_id, Asset, AssetGeometry, GeometryKeys, GeometryRecord, Manifest,
};
pub use summary::FragmentGroupSummary;
pub use tile::{decode_tile, encode_tile, GeometryBuffers};

/// File-name pattern for produced tiles: `geometries-<n>.bin`.
pub fn tile_file_name(index: usize) -> String {
    format!("geometries-{index}.bin")
}
