// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fragment-group summary document.

use crate::error::Result;
use crate::manifest::{read_document, write_document};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Per-model metadata emitted once at the end of tiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentGroupSummary {
    /// External (global) id -> element id remap table. Elements without an
    /// identifiable global id are absent from this table.
    pub id_remap: FxHashMap<String, u64>,
    /// Column-major 4x4 coordination transform of the model.
    pub coordination_matrix: [f64; 16],
    /// Source schema tag (for example "IFC4").
    pub schema: String,
    /// Upper bound on element ids in the model.
    pub max_id: u64,
}

impl FragmentGroupSummary {
    pub fn new(schema: impl Into<String>) -> Self {
        let mut coordination_matrix = [0.0; 16];
        for i in 0..4 {
            coordination_matrix[i * 4 + i] = 1.0;
        }
        Self {
            id_remap: FxHashMap::default(),
            coordination_matrix,
            schema: schema.into(),
            max_id: 0,
        }
    }

    /// Serialize to the opaque compressed on-disk form (gzip JSON).
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        write_document(self)
    }

    /// Deserialize from the on-disk form.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        read_document(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_round_trips() {
        let mut summary = FragmentGroupSummary::new("IFC4");
        summary.id_remap.insert("2O2Fr$t4X7Zf8NOew3FLOH".into(), 31);
        summary.max_id = 5021;
        summary.coordination_matrix[12] = -412000.5;

        let bytes = summary.to_bytes().unwrap();
        let decoded = FragmentGroupSummary::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, summary);
    }
}
