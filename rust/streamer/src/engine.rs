// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Visibility engine.
//!
//! Tracks which geometries are visible by counting identification-pass
//! pixels per color code. A geometry crossing the pixel threshold for the
//! first time is scheduled for loading with its full pixel count as
//! priority weight; a resident geometry seen again is shown; a resident
//! geometry unseen longer than `max_hidden_time_ms` is hidden; one unseen
//! longer than `max_lost_time_ms` has its residency released silently so
//! it can stream back in later.

use crate::color::{ColorCode, ColorCodeAllocator};
use crate::error::{Error, Result};
use crate::occlusion::{CameraPose, OcclusionRenderer, PixelBuffer, ProxyInstance};
use nalgebra::Matrix4;
use rustc_hash::{FxHashMap, FxHashSet};
use std::time::Instant;
use tilestream_codec::Manifest;

/// Visibility tuning knobs.
#[derive(Debug, Clone)]
pub struct StreamerSettings {
    /// Minimum pixel count for a geometry to count as seen.
    pub threshold: u32,
    /// Unseen for longer than this: hide the geometry.
    pub max_hidden_time_ms: u64,
    /// Unseen for longer than this: release residency, no output action.
    pub max_lost_time_ms: u64,
}

impl Default for StreamerSettings {
    fn default() -> Self {
        Self {
            threshold: 50,
            max_hidden_time_ms: 5000,
            max_lost_time_ms: 30_000,
        }
    }
}

/// Geometry ids bucketed by priority weight (pixel count).
pub type PriorityBuckets = FxHashMap<u32, FxHashSet<u32>>;

/// One visibility pass result, keyed by model.
#[derive(Debug, Default)]
pub struct VisibilityUpdate {
    /// Newly seen geometries to fetch, bucketed by pixel count.
    pub to_load: FxHashMap<String, PriorityBuckets>,
    /// Resident geometries unseen past the hidden deadline.
    pub to_hide: FxHashMap<String, FxHashSet<u32>>,
    /// Resident geometries seen again.
    pub to_show: FxHashMap<String, FxHashSet<u32>>,
}

impl VisibilityUpdate {
    pub fn is_empty(&self) -> bool {
        self.to_load.is_empty() && self.to_hide.is_empty() && self.to_show.is_empty()
    }
}

/// Per-code tracking state, created lazily when a geometry is first
/// registered during model load.
#[derive(Debug)]
struct VisibilityRecord {
    model_index: u32,
    geometry_id: u32,
    /// Ids of every asset instancing this geometry.
    asset_ids: FxHashSet<u64>,
    resident: bool,
    hidden: bool,
    last_seen_ms: u64,
}

/// GPU-assisted visibility tracker over any number of loaded models.
pub struct VisibilityEngine {
    settings: StreamerSettings,
    renderer: Box<dyn OcclusionRenderer>,
    colors: ColorCodeAllocator,
    next_model_index: u32,
    model_keys: FxHashMap<String, u32>,
    index_keys: FxHashMap<u32, String>,
    /// model index -> geometry id -> code
    codes: FxHashMap<u32, FxHashMap<u32, ColorCode>>,
    records: FxHashMap<ColorCode, VisibilityRecord>,
    resident: FxHashSet<ColorCode>,
    epoch: Instant,
}

impl VisibilityEngine {
    pub fn new(settings: StreamerSettings, renderer: Box<dyn OcclusionRenderer>) -> Self {
        Self {
            settings,
            renderer,
            colors: ColorCodeAllocator::default(),
            next_model_index: 0,
            model_keys: FxHashMap::default(),
            index_keys: FxHashMap::default(),
            codes: FxHashMap::default(),
            records: FxHashMap::default(),
            resident: FxHashSet::default(),
            epoch: Instant::now(),
        }
    }

    /// Milliseconds since engine creation, the clock for hysteresis.
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Register a model's proxy boxes for identification rendering.
    ///
    /// Every geometry instance gets (or reuses) a unique color code and a
    /// unit-cube transform mapping it onto the instance's oriented
    /// bounding box in world space.
    pub fn load_model(
        &mut self,
        model_key: &str,
        manifest: &Manifest,
        coordination: [f32; 16],
    ) -> Result<u32> {
        if self.model_keys.contains_key(model_key) {
            return Err(Error::ModelAlreadyLoaded(model_key.to_string()));
        }
        let index = self.next_model_index;
        self.next_model_index += 1;
        self.model_keys.insert(model_key.to_string(), index);
        self.index_keys.insert(index, model_key.to_string());

        let model_codes = self.codes.entry(index).or_default();
        let mut instances = Vec::new();
        for asset in &manifest.assets {
            for geometry in &asset.geometries {
                let Some(record) = manifest.geometries.get(&geometry.geometry_id) else {
                    tracing::debug!(
                        geometry = geometry.geometry_id,
                        "Instance references geometry missing from manifest"
                    );
                    continue;
                };
                let code = match model_codes.get(&geometry.geometry_id) {
                    Some(code) => *code,
                    None => {
                        let Some(code) = self.colors.next_code() else {
                            continue;
                        };
                        model_codes.insert(geometry.geometry_id, code);
                        self.records.insert(
                            code,
                            VisibilityRecord {
                                model_index: index,
                                geometry_id: geometry.geometry_id,
                                asset_ids: FxHashSet::default(),
                                resident: false,
                                hidden: false,
                                last_seen_ms: 0,
                            },
                        );
                        code
                    }
                };
                if let Some(record) = self.records.get_mut(&code) {
                    record.asset_ids.insert(asset.id);
                }
                let placement = Matrix4::from_column_slice(&geometry.transformation)
                    * Matrix4::from_column_slice(&record.bounding_box);
                let mut transform = [0.0f32; 16];
                transform.copy_from_slice(placement.as_slice());
                instances.push(ProxyInstance { transform, code });
            }
        }

        self.renderer.add_model(index, coordination, instances)?;
        tracing::info!(model = model_key, index, codes = self.colors.assigned(), "Model registered");
        Ok(index)
    }

    /// Drop a model's proxies and tracking state.
    pub fn unload_model(&mut self, model_key: &str) -> Result<()> {
        let Some(index) = self.model_keys.remove(model_key) else {
            return Err(Error::UnknownModel(model_key.to_string()));
        };
        self.index_keys.remove(&index);
        if let Some(codes) = self.codes.remove(&index) {
            for code in codes.values() {
                self.records.remove(code);
                self.resident.remove(code);
            }
        }
        self.renderer.remove_model(index);
        Ok(())
    }

    /// Ids of the assets instancing a geometry, for hosts mapping
    /// visibility changes back to elements.
    pub fn assets_of(&self, model_key: &str, geometry_id: u32) -> Option<&FxHashSet<u64>> {
        let index = self.model_keys.get(model_key)?;
        let code = self.codes.get(index)?.get(&geometry_id)?;
        self.records.get(code).map(|record| &record.asset_ids)
    }

    /// Render one identification pass for this pose.
    pub fn sample(&mut self, pose: &CameraPose) -> Result<PixelBuffer> {
        self.renderer.sample(pose)
    }

    /// Sample and classify in one step.
    pub fn update_camera(&mut self, pose: &CameraPose) -> Result<Option<VisibilityUpdate>> {
        let pixels = self.sample(pose)?;
        let now = self.now_ms();
        Ok(self.process_pixels(&pixels, now))
    }

    /// Classify one readback: histogram the pixels, then resolve every
    /// code against its record with final counts.
    pub fn process_pixels(
        &mut self,
        pixels: &PixelBuffer,
        now_ms: u64,
    ) -> Option<VisibilityUpdate> {
        let mut histogram: FxHashMap<[u8; 3], u32> = FxHashMap::default();
        for pixel in pixels.rgba.chunks_exact(4) {
            *histogram
                .entry([pixel[0], pixel[1], pixel[2]])
                .or_insert(0) += 1;
        }

        let mut unseen: FxHashSet<ColorCode> = self.resident.clone();
        let mut update = VisibilityUpdate::default();

        for (&rgb, &count) in &histogram {
            if count <= self.settings.threshold {
                continue;
            }
            let code = ColorCode(rgb);
            let Some(record) = self.records.get_mut(&code) else {
                // background or a stale pixel from an unloaded model
                continue;
            };
            unseen.remove(&code);
            let Some(model_key) = self.index_keys.get(&record.model_index) else {
                continue;
            };
            record.last_seen_ms = now_ms;
            if record.resident {
                record.hidden = false;
                update
                    .to_show
                    .entry(model_key.clone())
                    .or_default()
                    .insert(record.geometry_id);
            } else {
                record.resident = true;
                self.resident.insert(code);
                update
                    .to_load
                    .entry(model_key.clone())
                    .or_default()
                    .entry(count)
                    .or_default()
                    .insert(record.geometry_id);
            }
        }

        for code in unseen {
            let Some(record) = self.records.get_mut(&code) else {
                continue;
            };
            let elapsed = now_ms.saturating_sub(record.last_seen_ms);
            if elapsed > self.settings.max_lost_time_ms {
                // Long lost: release residency so the geometry streams
                // back in if it ever crosses the threshold again.
                record.resident = false;
                record.hidden = false;
                self.resident.remove(&code);
                continue;
            }
            if elapsed > self.settings.max_hidden_time_ms && !record.hidden {
                record.hidden = true;
                if let Some(model_key) = self.index_keys.get(&record.model_index) {
                    update
                        .to_hide
                        .entry(model_key.clone())
                        .or_default()
                        .insert(record.geometry_id);
                }
            }
        }

        if update.is_empty() {
            None
        } else {
            Some(update)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tilestream_codec::{Asset, AssetGeometry, GeometryRecord};

    struct FakeRenderer {
        samples: Arc<Mutex<usize>>,
    }

    impl OcclusionRenderer for FakeRenderer {
        fn add_model(
            &mut self,
            _model_index: u32,
            _coordination: [f32; 16],
            _instances: Vec<ProxyInstance>,
        ) -> Result<()> {
            Ok(())
        }

        fn remove_model(&mut self, _model_index: u32) {}

        fn sample(&mut self, _pose: &CameraPose) -> Result<PixelBuffer> {
            *self.samples.lock().unwrap() += 1;
            Ok(PixelBuffer::blank(16, 16))
        }
    }

    fn identity() -> [f32; 16] {
        let mut m = [0.0; 16];
        for d in 0..4 {
            m[d * 4 + d] = 1.0;
        }
        m
    }

    fn single_geometry_manifest() -> Manifest {
        let mut manifest = Manifest::default();
        manifest.geometries.insert(
            7,
            GeometryRecord {
                bounding_box: identity(),
                tile_file: "geometries-0.bin".into(),
            },
        );
        manifest.assets.push(Asset {
            id: 100,
            geometries: vec![AssetGeometry {
                geometry_id: 7,
                color: [0.4, 0.4, 0.4, 1.0],
                transformation: identity(),
            }],
        });
        manifest
    }

    fn engine() -> VisibilityEngine {
        VisibilityEngine::new(
            StreamerSettings::default(),
            Box::new(FakeRenderer {
                samples: Arc::new(Mutex::new(0)),
            }),
        )
    }

    fn buffer_with(code: ColorCode, pixels: u32) -> PixelBuffer {
        let mut buffer = PixelBuffer::blank(64, 64);
        for i in 0..pixels as usize {
            buffer.rgba[i * 4] = code.0[0];
            buffer.rgba[i * 4 + 1] = code.0[1];
            buffer.rgba[i * 4 + 2] = code.0[2];
        }
        buffer
    }

    #[test]
    fn first_sighting_loads_with_full_pixel_count() {
        let mut engine = engine();
        engine
            .load_model("model-a", &single_geometry_manifest(), identity())
            .unwrap();

        // first code handed out is 1 -> (0, 0, 1)
        let update = engine
            .process_pixels(&buffer_with(ColorCode([0, 0, 1]), 60), 0)
            .expect("update expected");

        let buckets = &update.to_load["model-a"];
        assert_eq!(buckets.len(), 1);
        assert!(buckets[&60].contains(&7));
        assert!(update.to_show.is_empty());
        assert!(update.to_hide.is_empty());
    }

    #[test]
    fn below_threshold_is_ignored() {
        let mut engine = engine();
        engine
            .load_model("model-a", &single_geometry_manifest(), identity())
            .unwrap();

        assert!(engine
            .process_pixels(&buffer_with(ColorCode([0, 0, 1]), 50), 0)
            .is_none());
    }

    #[test]
    fn hysteresis_hides_then_releases() {
        let mut engine = engine();
        engine
            .load_model("model-a", &single_geometry_manifest(), identity())
            .unwrap();
        let code = ColorCode([0, 0, 1]);

        // becomes resident at t=1000
        assert!(engine.process_pixels(&buffer_with(code, 60), 1000).is_some());

        // within the hidden grace window: nothing happens
        assert!(engine.process_pixels(&PixelBuffer::blank(64, 64), 5500).is_none());

        // past max_hidden_time: hidden once
        let update = engine
            .process_pixels(&PixelBuffer::blank(64, 64), 7000)
            .expect("hide expected");
        assert!(update.to_hide["model-a"].contains(&7));

        // still hidden, no repeated hide events
        assert!(engine.process_pixels(&PixelBuffer::blank(64, 64), 20_000).is_none());

        // past max_lost_time: residency released silently
        assert!(engine.process_pixels(&PixelBuffer::blank(64, 64), 32_000).is_none());

        // seen again afterwards: re-enters the load path
        let update = engine
            .process_pixels(&buffer_with(code, 80), 33_000)
            .expect("reload expected");
        assert!(update.to_load["model-a"][&80].contains(&7));
        assert!(update.to_show.is_empty());
    }

    #[test]
    fn resident_geometry_is_shown_again() {
        let mut engine = engine();
        engine
            .load_model("model-a", &single_geometry_manifest(), identity())
            .unwrap();
        let code = ColorCode([0, 0, 1]);

        engine.process_pixels(&buffer_with(code, 60), 0).unwrap();
        let update = engine
            .process_pixels(&buffer_with(code, 70), 1000)
            .expect("show expected");
        assert!(update.to_show["model-a"].contains(&7));
        assert!(update.to_load.is_empty());
    }

    #[test]
    fn records_remember_their_assets() {
        let mut engine = engine();
        let mut manifest = single_geometry_manifest();
        // a second element instancing the same geometry
        manifest.assets.push(Asset {
            id: 101,
            geometries: vec![AssetGeometry {
                geometry_id: 7,
                color: [0.4, 0.4, 0.4, 1.0],
                transformation: identity(),
            }],
        });
        engine.load_model("model-a", &manifest, identity()).unwrap();

        let assets = engine.assets_of("model-a", 7).unwrap();
        let expected: FxHashSet<u64> = [100, 101].into_iter().collect();
        assert_eq!(assets, &expected);
        assert!(engine.assets_of("model-a", 99).is_none());
        assert!(engine.assets_of("model-b", 7).is_none());
    }

    #[test]
    fn duplicate_model_key_is_rejected() {
        let mut engine = engine();
        let manifest = single_geometry_manifest();
        engine.load_model("model-a", &manifest, identity()).unwrap();
        assert!(matches!(
            engine.load_model("model-a", &manifest, identity()),
            Err(Error::ModelAlreadyLoaded(_))
        ));
    }

    #[test]
    fn unload_forgets_codes_and_records() {
        let mut engine = engine();
        engine
            .load_model("model-a", &single_geometry_manifest(), identity())
            .unwrap();
        engine.unload_model("model-a").unwrap();

        // pixels of the stale code no longer resolve to anything
        assert!(engine
            .process_pixels(&buffer_with(ColorCode([0, 0, 1]), 200), 0)
            .is_none());
        assert!(matches!(
            engine.unload_model("model-a"),
            Err(Error::UnknownModel(_))
        ));
    }

    #[test]
    fn exhausted_color_space_skips_tracking() {
        let mut engine = engine();
        engine.colors = {
            let mut colors = ColorCodeAllocator::default();
            // burn the whole space
            while colors.next_code().is_some() {}
            colors
        };
        engine
            .load_model("model-a", &single_geometry_manifest(), identity())
            .unwrap();
        assert!(engine.records.is_empty());
    }
}
