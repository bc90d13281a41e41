// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Geometry deduplication and render-batch key assignment.
//!
//! Elements reference geometries by id, and the same geometry id shows up
//! once per instancing element. The deduplicator tracks which signed keys
//! (positive = opaque instance, negative = transparent instance) have been
//! seen, assigns each new key a dense render-batch index, and tells the
//! tiler when a base geometry id needs its buffers captured and bounds
//! computed for the first time.

use rustc_hash::{FxHashMap, FxHashSet};
use tilestream_codec::signed_geometry_id;

/// Outcome of observing one geometry instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    /// Signed geometry key (negated for transparent instances).
    pub signed_id: i64,
    /// Dense render-batch key of the signed geometry.
    pub batch_key: u32,
    /// First time this signed key was seen.
    pub new_partition_entry: bool,
    /// First time the base geometry id was seen at all; the caller must
    /// capture buffers and compute bounds.
    pub new_geometry: bool,
}

/// Tracks visited geometries across the whole model.
#[derive(Debug, Default)]
pub struct GeometryDeduplicator {
    visited: FxHashMap<i64, u32>,
    known_ids: FxHashSet<u32>,
}

impl GeometryDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe one instance of `geometry_id` with the given alpha.
    pub fn observe(&mut self, geometry_id: u32, alpha: f32) -> Observation {
        let transparent = alpha != 1.0;
        let signed_id = signed_geometry_id(geometry_id, transparent);

        let mut new_partition_entry = false;
        let mut new_geometry = false;

        let next_key = self.visited.len() as u32;
        let batch_key = *self.visited.entry(signed_id).or_insert_with(|| {
            new_partition_entry = true;
            next_key
        });
        if new_partition_entry {
            new_geometry = self.known_ids.insert(geometry_id);
        }

        Observation {
            signed_id,
            batch_key,
            new_partition_entry,
            new_geometry,
        }
    }

    /// Number of distinct signed keys seen so far.
    pub fn len(&self) -> usize {
        self.visited.len()
    }

    pub fn is_empty(&self) -> bool {
        self.visited.is_empty()
    }

    /// Signed key -> render-batch key table, consumed at manifest finalize.
    pub fn visited(&self) -> &FxHashMap<i64, u32> {
        &self.visited
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sighting_assigns_dense_keys_in_order() {
        let mut dedup = GeometryDeduplicator::new();

        let a = dedup.observe(10, 1.0);
        let b = dedup.observe(11, 1.0);
        assert_eq!(a.batch_key, 0);
        assert_eq!(b.batch_key, 1);
        assert!(a.new_partition_entry && a.new_geometry);

        // Same id, same alpha: nothing new
        let again = dedup.observe(10, 1.0);
        assert_eq!(again.batch_key, 0);
        assert!(!again.new_partition_entry);
        assert!(!again.new_geometry);
    }

    #[test]
    fn opaque_and_transparent_instances_get_separate_keys() {
        let mut dedup = GeometryDeduplicator::new();

        let opaque = dedup.observe(12, 1.0);
        let transparent = dedup.observe(12, 0.5);

        assert_eq!(opaque.signed_id, 12);
        assert_eq!(transparent.signed_id, -12);
        assert_ne!(opaque.batch_key, transparent.batch_key);

        // The buffers are only captured once for the base id
        assert!(opaque.new_geometry);
        assert!(transparent.new_partition_entry);
        assert!(!transparent.new_geometry);
    }
}
