// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Manifest document for a tiled model.
//!
//! The manifest indexes everything the streaming runtime needs before any
//! tile is fetched: the per-element instance data (assets), the bounding
//! box and owning tile file of every unique geometry, and the opaque /
//! transparent render-batch key partitions.

use crate::error::Result;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// One instanced geometry reference inside an asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetGeometry {
    /// The unique identifier of the referenced geometry (model scoped).
    pub geometry_id: u32,
    /// Instance color as RGBA in `[0, 1]`. Alpha 1 means opaque.
    pub color: [f32; 4],
    /// Column-major 4x4 instance transform.
    pub transformation: [f32; 16],
}

impl AssetGeometry {
    /// Whether this instance belongs to the opaque partition.
    pub fn is_opaque(&self) -> bool {
        self.color[3] == 1.0
    }
}

/// One semantic building element and its geometry instances.
///
/// An asset may reference several geometries and may reuse the same
/// geometry more than once with different transforms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    /// The unique identifier of the asset (element id).
    pub id: u64,
    /// Ordered geometry instances of this element.
    pub geometries: Vec<AssetGeometry>,
}

/// Per-geometry manifest entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeometryRecord {
    /// Oriented bounding box as a unit-cube -> world 4x4 transform.
    pub bounding_box: [f32; 16],
    /// Name of the tile file holding this geometry's buffers.
    pub tile_file: String,
}

/// Signed-id partition tables.
///
/// The same base geometry id may appear in both partitions when an element
/// instances it once opaquely and once transparently; the transparent key
/// is stored under the negated id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeometryKeys {
    /// Positive signed id -> render-batch key.
    pub opaque: FxHashMap<i64, u32>,
    /// Negative signed id -> render-batch key.
    pub transparent: FxHashMap<i64, u32>,
}

impl GeometryKeys {
    /// Look up the render-batch key for a base geometry id in one partition.
    pub fn key_for(&self, geometry_id: u32, transparent: bool) -> Option<u32> {
        let signed = signed_geometry_id(geometry_id, transparent);
        if transparent {
            self.transparent.get(&signed).copied()
        } else {
            self.opaque.get(&signed).copied()
        }
    }

    pub fn insert(&mut self, signed_id: i64, key: u32) {
        if signed_id < 0 {
            self.transparent.insert(signed_id, key);
        } else {
            self.opaque.insert(signed_id, key);
        }
    }
}

/// Derive the signed geometry key used throughout tiling and streaming.
pub fn signed_geometry_id(geometry_id: u32, transparent: bool) -> i64 {
    let id = geometry_id as i64;
    if transparent {
        -id
    } else {
        id
    }
}

/// The manifest of one tiled model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// All streamed assets of the model.
    pub assets: Vec<Asset>,
    /// Unique geometry id -> bounding box + tile file.
    pub geometries: FxHashMap<u32, GeometryRecord>,
    /// Opaque / transparent render-batch key partitions.
    pub geometry_keys: GeometryKeys,
}

impl Manifest {
    /// Serialize to the opaque compressed on-disk form (gzip JSON).
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        write_document(self)
    }

    /// Deserialize from the on-disk form.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        read_document(data)
    }
}

pub(crate) fn write_document<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(value)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

pub(crate) fn read_document<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T> {
    let mut decoder = GzDecoder::new(data);
    let mut json = Vec::new();
    decoder.read_to_end(&mut json)?;
    Ok(serde_json::from_slice(&json)?)
}
