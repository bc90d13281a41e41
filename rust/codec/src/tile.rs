// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Binary tile codec.
//!
//! A tile is a batch of geometry buffers serialized as a length-prefixed
//! record sequence. The encoding is byte-exact on round trip: the decoded
//! position and index buffers are bit-identical to the encoded ones.
//!
//! Layout (all integers little endian):
//!
//! ```text
//! u32 record_count
//! repeated record_count times:
//!   u32 geometry_id
//!   u32 vertex_count          (number of f32 position values, multiple of 3)
//!   u32 index_count
//!   f32[vertex_count] positions
//!   u32[index_count]  indices
//! ```

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;

/// Position and index buffers of one unique geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct GeometryBuffers {
    /// Vertex positions (x, y, z triplets)
    pub positions: Vec<f32>,
    /// Triangle indices
    pub indices: Vec<u32>,
}

impl GeometryBuffers {
    pub fn new(positions: Vec<f32>, indices: Vec<u32>) -> Self {
        Self { positions, indices }
    }

    /// Number of vertices (position triplets)
    pub fn vertex_count(&self) -> usize {
        self.positions.len() / 3
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

/// Serialize a batch of geometries into a tile blob.
///
/// Records are written in ascending geometry-id order so the output is
/// deterministic for a given input map.
pub fn encode_tile(geometries: &FxHashMap<u32, GeometryBuffers>) -> Bytes {
    let payload: usize = geometries
        .values()
        .map(|g| 12 + g.positions.len() * 4 + g.indices.len() * 4)
        .sum();
    let mut buf = BytesMut::with_capacity(4 + payload);

    buf.put_u32_le(geometries.len() as u32);

    let mut ids: Vec<u32> = geometries.keys().copied().collect();
    ids.sort_unstable();

    for id in ids {
        let geometry = &geometries[&id];
        buf.put_u32_le(id);
        buf.put_u32_le(geometry.positions.len() as u32);
        buf.put_u32_le(geometry.indices.len() as u32);
        for &value in &geometry.positions {
            buf.put_f32_le(value);
        }
        for &index in &geometry.indices {
            buf.put_u32_le(index);
        }
    }

    buf.freeze()
}

/// Deserialize a tile blob back into its geometry buffers.
pub fn decode_tile(data: &[u8]) -> Result<FxHashMap<u32, GeometryBuffers>> {
    let mut buf = data;

    let record_count = read_u32(&mut buf)? as usize;
    // Every record carries at least a 12-byte header, so a count the
    // remaining payload cannot hold is rejected before any allocation
    // is sized from it.
    ensure_remaining(buf, record_count.saturating_mul(12))?;
    let mut geometries =
        FxHashMap::with_capacity_and_hasher(record_count, Default::default());

    for _ in 0..record_count {
        let id = read_u32(&mut buf)?;
        let vertex_len = read_u32(&mut buf)? as usize;
        let index_len = read_u32(&mut buf)? as usize;

        if vertex_len % 3 != 0 {
            return Err(Error::Malformed(format!(
                "geometry {id} has a position count not divisible by 3: {vertex_len}"
            )));
        }

        ensure_remaining(buf, (vertex_len + index_len) * 4)?;

        let mut positions = Vec::with_capacity(vertex_len);
        for _ in 0..vertex_len {
            positions.push(buf.get_f32_le());
        }
        let mut indices = Vec::with_capacity(index_len);
        for _ in 0..index_len {
            indices.push(buf.get_u32_le());
        }

        if geometries
            .insert(id, GeometryBuffers::new(positions, indices))
            .is_some()
        {
            return Err(Error::Malformed(format!("duplicate geometry id {id}")));
        }
    }

    Ok(geometries)
}

fn read_u32(buf: &mut &[u8]) -> Result<u32> {
    ensure_remaining(buf, 4)?;
    Ok(buf.get_u32_le())
}

fn ensure_remaining(buf: &[u8], needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        return Err(Error::Truncated {
            expected: needed,
            found: buf.remaining(),
        });
    }
    Ok(())
}
