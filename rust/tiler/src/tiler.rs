// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Geometry tiler.
//!
//! Consumes the source-element stream in chunks, deduplicates geometry,
//! computes bounds, and emits size-bounded tile files together with the
//! manifest and the fragment-group summary. The source of elements is a
//! plain iterator so the CAD reader stays an external collaborator.

use crate::dedup::GeometryDeduplicator;
use crate::error::{Error, Result};
use crate::mesh::RawMesh;
use crate::obb::obb_from_positions;
use bytes::Bytes;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use tilestream_codec::{
    encode_tile, tile_file_name, Asset, AssetGeometry, FragmentGroupSummary, GeometryBuffers,
    GeometryRecord, Manifest,
};

/// Tiling thresholds. All counts are "flush when exceeded".
#[derive(Debug, Clone)]
pub struct TilerSettings {
    /// Unique geometries accumulated before a geometry flush.
    pub min_geometry_size: usize,
    /// Assets accumulated before an asset flush.
    pub min_assets_size: usize,
    /// Input elements per processing chunk; flush checks run at chunk
    /// boundaries.
    pub max_chunk_elements: usize,
}

impl Default for TilerSettings {
    fn default() -> Self {
        Self {
            min_geometry_size: 50,
            min_assets_size: 1000,
            max_chunk_elements: 50,
        }
    }
}

/// One raw geometry instance of a source element.
#[derive(Debug, Clone)]
pub struct SourceGeometry {
    pub geometry_id: u32,
    /// Instance RGBA color; alpha 1 selects the opaque partition.
    pub color: [f32; 4],
    /// Column-major 4x4 instance transform.
    pub transformation: [f32; 16],
    /// Mesh buffers. Only the first sighting of a geometry id is captured;
    /// repeats may carry an empty mesh.
    pub mesh: RawMesh,
}

/// One source element as delivered by the model reader.
#[derive(Debug, Clone)]
pub struct SourceElement {
    pub id: u64,
    pub element_type: String,
    /// External identifier; elements without one are skipped from the
    /// id-remap table but still contribute geometry.
    pub global_id: Option<String>,
    pub geometries: Vec<SourceGeometry>,
}

/// Model-level metadata carried into the fragment-group summary.
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub schema: String,
    pub coordination_matrix: [f64; 16],
}

impl Default for ModelInfo {
    fn default() -> Self {
        let base = FragmentGroupSummary::new("");
        Self {
            schema: "IFC4".into(),
            coordination_matrix: base.coordination_matrix,
        }
    }
}

/// Sink for tiler outputs.
///
/// `on_completed` receives the manifest without its assets; implementations
/// attach the asset batches they collected through `on_assets`. A model is
/// only published once `on_completed` ran; tile and asset flushes alone
/// are not a publishable state.
pub trait TileOutput {
    fn on_assets(&mut self, assets: Vec<Asset>) -> Result<()>;
    fn on_tile(&mut self, file_name: &str, blob: Bytes) -> Result<()>;
    fn on_completed(&mut self, manifest: Manifest, summary: FragmentGroupSummary) -> Result<()>;
}

/// Streams one model's elements into tiles, manifest and summary.
pub struct GeometryTiler {
    settings: TilerSettings,
    dedup: GeometryDeduplicator,
    /// Meshes captured this chunk, waiting for parallel bounds computation.
    pending_meshes: Vec<(u32, RawMesh)>,
    /// Geometry buffers accumulated since the last flush.
    buffers: FxHashMap<u32, GeometryBuffers>,
    /// Bounds of accumulated geometries.
    bounds: FxHashMap<u32, [f32; 16]>,
    assets: Vec<Asset>,
    manifest: Manifest,
    tile_index: usize,
}

impl GeometryTiler {
    pub fn new(settings: TilerSettings) -> Self {
        Self {
            settings,
            dedup: GeometryDeduplicator::new(),
            pending_meshes: Vec::new(),
            buffers: FxHashMap::default(),
            bounds: FxHashMap::default(),
            assets: Vec::new(),
            manifest: Manifest::default(),
            tile_index: 0,
        }
    }

    /// Run the full tiling pipeline over the element stream.
    pub fn run<I>(
        mut self,
        elements: I,
        info: ModelInfo,
        output: &mut dyn TileOutput,
    ) -> Result<()>
    where
        I: IntoIterator<Item = SourceElement>,
    {
        let mut summary = FragmentGroupSummary::new(info.schema);
        summary.coordination_matrix = info.coordination_matrix;

        let mut chunk_len = 0usize;
        let mut element_count = 0usize;

        for element in elements {
            if chunk_len > self.settings.max_chunk_elements {
                self.finish_chunk(output)?;
                chunk_len = 0;
            }
            self.process_element(element, &mut summary);
            chunk_len += 1;
            element_count += 1;
        }

        self.finish_chunk(output)?;

        // Remainder flushes
        if !self.buffers.is_empty() {
            self.flush_geometries(output)?;
        }
        if !self.assets.is_empty() {
            self.flush_assets(output)?;
        }

        // Finalize the opaque/transparent partitions
        for (&signed_id, &batch_key) in self.dedup.visited() {
            self.manifest.geometry_keys.insert(signed_id, batch_key);
        }

        tracing::info!(
            elements = element_count,
            geometries = self.manifest.geometries.len(),
            tiles = self.tile_index,
            "Tiling complete"
        );

        output.on_completed(self.manifest, summary)
    }

    fn process_element(&mut self, element: SourceElement, summary: &mut FragmentGroupSummary) {
        match &element.global_id {
            Some(global_id) => {
                summary.id_remap.insert(global_id.clone(), element.id);
            }
            None => {
                tracing::debug!(
                    element = element.id,
                    element_type = %element.element_type,
                    "Element has no global id, left out of the id remap"
                );
            }
        }
        summary.max_id = summary.max_id.max(element.id);

        let mut asset = Asset {
            id: element.id,
            geometries: Vec::with_capacity(element.geometries.len()),
        };

        for geometry in element.geometries {
            let observation = self.dedup.observe(geometry.geometry_id, geometry.color[3]);
            if observation.new_geometry {
                self.pending_meshes
                    .push((geometry.geometry_id, geometry.mesh));
            }
            asset.geometries.push(AssetGeometry {
                geometry_id: geometry.geometry_id,
                color: geometry.color,
                transformation: geometry.transformation,
            });
        }

        self.assets.push(asset);
    }

    /// Compute bounds for the chunk's new geometries and run flush checks.
    fn finish_chunk(&mut self, output: &mut dyn TileOutput) -> Result<()> {
        if !self.pending_meshes.is_empty() {
            let meshes = std::mem::take(&mut self.pending_meshes);
            let computed: Result<Vec<(u32, RawMesh, [f32; 16])>> = meshes
                .into_par_iter()
                .map(|(geometry_id, mesh)| {
                    let obb = obb_from_positions(&mesh.positions).ok_or_else(|| Error::Bounds {
                        geometry_id,
                        reason: "mesh has no finite vertices".into(),
                    })?;
                    Ok((geometry_id, mesh, obb))
                })
                .collect();

            for (geometry_id, mesh, obb) in computed? {
                self.buffers
                    .insert(geometry_id, GeometryBuffers::new(mesh.positions, mesh.indices));
                self.bounds.insert(geometry_id, obb);
            }
        }

        if self.buffers.len() > self.settings.min_geometry_size {
            self.flush_geometries(output)?;
        }
        if self.assets.len() > self.settings.min_assets_size {
            self.flush_assets(output)?;
        }
        Ok(())
    }

    fn flush_geometries(&mut self, output: &mut dyn TileOutput) -> Result<()> {
        let file_name = tile_file_name(self.tile_index);
        self.tile_index += 1;

        let blob = encode_tile(&self.buffers);
        tracing::debug!(
            file = %file_name,
            geometries = self.buffers.len(),
            bytes = blob.len(),
            "Flushing geometry tile"
        );

        for (&geometry_id, _) in self.buffers.iter() {
            let bounding_box = self.bounds[&geometry_id];
            self.manifest
                .geometries
                .entry(geometry_id)
                .or_insert_with(|| GeometryRecord {
                    bounding_box,
                    tile_file: file_name.clone(),
                });
        }

        self.buffers.clear();
        self.bounds.clear();
        output.on_tile(&file_name, blob)
    }

    fn flush_assets(&mut self, output: &mut dyn TileOutput) -> Result<()> {
        let assets = std::mem::take(&mut self.assets);
        tracing::debug!(assets = assets.len(), "Flushing assets");
        output.on_assets(assets)
    }
}
