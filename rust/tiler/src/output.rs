// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tile output sinks.
//!
//! `DirectoryOutput` stages everything in a hidden directory and renames it
//! into place at completion, so a failed model never publishes partial
//! tiles. `MemoryOutput` collects everything for tests and in-process use.

use crate::error::{Error, Result};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tilestream_codec::{Asset, FragmentGroupSummary, Manifest};

use crate::tiler::TileOutput;

/// Manifest file name inside a published model directory.
pub const SETTINGS_FILE: &str = "settings.bin";
/// Fragment-group summary file name.
pub const SUMMARY_FILE: &str = "fragments-group.bin";

/// Collects all outputs in memory.
#[derive(Debug, Default)]
pub struct MemoryOutput {
    pub assets: Vec<Asset>,
    pub asset_batches: usize,
    pub tiles: Vec<(String, Bytes)>,
    pub manifest: Option<Manifest>,
    pub summary: Option<FragmentGroupSummary>,
}

impl TileOutput for MemoryOutput {
    fn on_assets(&mut self, assets: Vec<Asset>) -> Result<()> {
        self.asset_batches += 1;
        self.assets.extend(assets);
        Ok(())
    }

    fn on_tile(&mut self, file_name: &str, blob: Bytes) -> Result<()> {
        self.tiles.push((file_name.to_string(), blob));
        Ok(())
    }

    fn on_completed(
        &mut self,
        mut manifest: Manifest,
        summary: FragmentGroupSummary,
    ) -> Result<()> {
        manifest.assets = std::mem::take(&mut self.assets);
        self.manifest = Some(manifest);
        self.summary = Some(summary);
        Ok(())
    }
}

/// Writes tiles to a staging directory, publishing atomically on completion
/// under `<root>/<model_id>/`.
#[derive(Debug)]
pub struct DirectoryOutput {
    root: PathBuf,
    model_id: String,
    staging: PathBuf,
    assets: Vec<Asset>,
}

impl DirectoryOutput {
    pub fn new(root: impl AsRef<Path>, model_id: impl Into<String>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let model_id = model_id.into();
        let staging = root.join(format!(".staging-{model_id}"));
        std::fs::create_dir_all(&staging)?;
        Ok(Self {
            root,
            model_id,
            staging,
            assets: Vec::new(),
        })
    }

    /// Final published path of the model.
    pub fn model_dir(&self) -> PathBuf {
        self.root.join(&self.model_id)
    }
}

impl TileOutput for DirectoryOutput {
    fn on_assets(&mut self, assets: Vec<Asset>) -> Result<()> {
        self.assets.extend(assets);
        Ok(())
    }

    fn on_tile(&mut self, file_name: &str, blob: Bytes) -> Result<()> {
        std::fs::write(self.staging.join(file_name), &blob)?;
        Ok(())
    }

    fn on_completed(
        &mut self,
        mut manifest: Manifest,
        summary: FragmentGroupSummary,
    ) -> Result<()> {
        manifest.assets = std::mem::take(&mut self.assets);
        std::fs::write(self.staging.join(SETTINGS_FILE), manifest.to_bytes()?)?;
        std::fs::write(self.staging.join(SUMMARY_FILE), summary.to_bytes()?)?;

        let target = self.model_dir();
        if target.exists() {
            return Err(Error::Output(format!(
                "model directory already published: {}",
                target.display()
            )));
        }
        std::fs::rename(&self.staging, &target)?;
        tracing::info!(model = %self.model_id, path = %target.display(), "Model published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tiler::{GeometryTiler, ModelInfo, SourceElement, SourceGeometry, TilerSettings};
    use crate::RawMesh;

    fn elements(count: u64) -> Vec<SourceElement> {
        (0..count)
            .map(|i| SourceElement {
                id: i,
                element_type: "IfcSlab".into(),
                global_id: Some(format!("guid-{i}")),
                geometries: vec![SourceGeometry {
                    geometry_id: i as u32 + 1,
                    color: [0.5, 0.5, 0.5, 1.0],
                    transformation: {
                        let mut identity = [0.0; 16];
                        for d in 0..4 {
                            identity[d * 4 + d] = 1.0;
                        }
                        identity
                    },
                    mesh: RawMesh::new(vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0], vec![0, 1, 2]),
                }],
            })
            .collect()
    }

    #[test]
    fn directory_output_publishes_only_on_completion() {
        let root = std::env::temp_dir().join(format!("tilestream-test-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&root);

        let mut output = DirectoryOutput::new(&root, "model-a").unwrap();
        let model_dir = output.model_dir();

        GeometryTiler::new(TilerSettings::default())
            .run(elements(3), ModelInfo::default(), &mut output)
            .unwrap();

        assert!(model_dir.join(SETTINGS_FILE).exists());
        assert!(model_dir.join(SUMMARY_FILE).exists());
        assert!(model_dir.join("geometries-0.bin").exists());
        assert!(!root.join(".staging-model-a").exists());

        let manifest =
            Manifest::from_bytes(&std::fs::read(model_dir.join(SETTINGS_FILE)).unwrap()).unwrap();
        assert_eq!(manifest.assets.len(), 3);

        std::fs::remove_dir_all(&root).unwrap();
    }
}
