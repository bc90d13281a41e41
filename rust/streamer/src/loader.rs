// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Manifest-driven tile loader.
//!
//! Requested geometry ids are grouped by the tile file that holds them.
//! Files are scored by summing the priority weights of their requested
//! geometries and fetched best-first, with a URL-keyed cache of decoded
//! tiles. Decoded buffers become render batches: one opaque and one
//! transparent batch per geometry, each created at most once per model.

use crate::engine::PriorityBuckets;
use crate::error::{Error, Result};
use bytes::Bytes;
use futures::future::BoxFuture;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::{Arc, Mutex};
use tilestream_codec::{decode_tile, GeometryBuffers, GeometryKeys, GeometryRecord, Manifest};

/// Fetches raw tile bytes by URL.
pub trait TileTransport: Send + Sync {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Bytes>>;
}

/// HTTP transport over a shared client.
#[derive(Debug, Default, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl TileTransport for HttpTransport {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Bytes>> {
        Box::pin(async move {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .and_then(|response| response.error_for_status())
                .map_err(|error| Error::Transport(error.to_string()))?;
            response
                .bytes()
                .await
                .map_err(|error| Error::Transport(error.to_string()))
        })
    }
}

/// One instance inside a render batch.
#[derive(Debug, Clone)]
pub struct BatchInstance {
    pub asset_id: u64,
    pub color: [f32; 4],
    pub transformation: [f32; 16],
}

/// A ready-to-render geometry batch: shared buffers plus all instances of
/// one opacity partition.
#[derive(Debug, Clone)]
pub struct GeometryBatch {
    pub geometry_id: u32,
    /// Render-batch key from the manifest partition tables.
    pub batch_key: u32,
    pub transparent: bool,
    pub buffers: GeometryBuffers,
    pub instances: Vec<BatchInstance>,
}

/// Result of one load pass.
#[derive(Debug, Default)]
pub struct LoadOutcome {
    pub batches: Vec<GeometryBatch>,
    /// Every geometry id that was asked for, fetched or not.
    pub requested: FxHashSet<u32>,
}

struct ModelData {
    server_url: String,
    geometries: FxHashMap<u32, GeometryRecord>,
    keys: GeometryKeys,
    /// geometry id -> all instances referencing it
    instances: FxHashMap<u32, Vec<BatchInstance>>,
    /// batch keys already handed out, the idempotence guard
    created: FxHashSet<u32>,
}

type DecodedTile = Arc<FxHashMap<u32, GeometryBuffers>>;

/// Fetches, decodes and batches tiles for any number of models.
pub struct TileLoader {
    transport: Arc<dyn TileTransport>,
    cache: Mutex<FxHashMap<String, DecodedTile>>,
    models: FxHashMap<String, ModelData>,
}

impl TileLoader {
    pub fn new(transport: Arc<dyn TileTransport>) -> Self {
        Self {
            transport,
            cache: Mutex::new(FxHashMap::default()),
            models: FxHashMap::default(),
        }
    }

    /// Register a model's manifest so its geometries can be requested.
    pub fn register_model(
        &mut self,
        model_key: &str,
        server_url: &str,
        manifest: &Manifest,
    ) -> Result<()> {
        if self.models.contains_key(model_key) {
            return Err(Error::ModelAlreadyLoaded(model_key.to_string()));
        }
        let mut instances: FxHashMap<u32, Vec<BatchInstance>> = FxHashMap::default();
        for asset in &manifest.assets {
            for geometry in &asset.geometries {
                instances
                    .entry(geometry.geometry_id)
                    .or_default()
                    .push(BatchInstance {
                        asset_id: asset.id,
                        color: geometry.color,
                        transformation: geometry.transformation,
                    });
            }
        }
        self.models.insert(
            model_key.to_string(),
            ModelData {
                server_url: server_url.trim_end_matches('/').to_string(),
                geometries: manifest.geometries.clone(),
                keys: manifest.geometry_keys.clone(),
                instances,
                created: FxHashSet::default(),
            },
        );
        Ok(())
    }

    /// Forget a model. Cached tile bytes stay; they are keyed by URL and
    /// reused if the model is registered again.
    pub fn remove_model(&mut self, model_key: &str) {
        self.models.remove(model_key);
    }

    /// Fetch and batch the requested geometries of one model, best first.
    pub async fn load(&mut self, model_key: &str, to_load: &PriorityBuckets) -> Result<LoadOutcome> {
        let Some(model) = self.models.get(model_key) else {
            return Err(Error::UnknownModel(model_key.to_string()));
        };

        // Score each tile file by the summed weight of its requested ids.
        let mut scores: FxHashMap<String, u64> = FxHashMap::default();
        let mut requested: FxHashSet<u32> = FxHashSet::default();
        for (&weight, ids) in to_load {
            for &id in ids {
                let Some(record) = model.geometries.get(&id) else {
                    tracing::warn!(model = model_key, geometry = id, "Requested geometry missing from manifest");
                    continue;
                };
                *scores.entry(record.tile_file.clone()).or_insert(0) += u64::from(weight);
                requested.insert(id);
            }
        }
        let mut files: Vec<(String, u64)> = scores.into_iter().collect();
        files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let server_url = model.server_url.clone();
        let fetches = files
            .iter()
            .map(|(file, _)| self.fetch_tile(&server_url, file));
        let decoded = futures::future::join_all(fetches).await;

        let model = self
            .models
            .get_mut(model_key)
            .ok_or_else(|| Error::UnknownModel(model_key.to_string()))?;

        let mut outcome = LoadOutcome {
            requested,
            ..LoadOutcome::default()
        };
        for tile in decoded.into_iter().flatten() {
            for (&geometry_id, buffers) in tile.iter() {
                if !outcome.requested.contains(&geometry_id) {
                    continue;
                }
                let Some(instances) = model.instances.get(&geometry_id) else {
                    continue;
                };
                let (opaque, transparent): (Vec<_>, Vec<_>) = instances
                    .iter()
                    .cloned()
                    .partition(|instance| instance.color[3] == 1.0);
                for (subset, is_transparent) in [(opaque, false), (transparent, true)] {
                    if subset.is_empty() {
                        continue;
                    }
                    let Some(batch_key) = model.keys.key_for(geometry_id, is_transparent) else {
                        tracing::debug!(
                            model = model_key,
                            geometry = geometry_id,
                            transparent = is_transparent,
                            "No batch key in manifest partition, skipping"
                        );
                        continue;
                    };
                    if !model.created.insert(batch_key) {
                        continue;
                    }
                    outcome.batches.push(GeometryBatch {
                        geometry_id,
                        batch_key,
                        transparent: is_transparent,
                        buffers: buffers.clone(),
                        instances: subset,
                    });
                }
            }
        }
        Ok(outcome)
    }

    /// Fetch and decode one tile, through the cache. Transport and decode
    /// failures skip the file; its geometries can be requested again.
    async fn fetch_tile(&self, server_url: &str, file: &str) -> Option<DecodedTile> {
        let url = format!("{server_url}/{file}");
        if let Some(hit) = self.cache.lock().expect("cache poisoned").get(&url) {
            return Some(hit.clone());
        }
        let bytes = match self.transport.fetch(&url).await {
            Ok(bytes) => bytes,
            Err(error) => {
                tracing::warn!(url = %url, error = %error, "Tile fetch failed");
                return None;
            }
        };
        let tile = match decode_tile(&bytes) {
            Ok(tile) => Arc::new(tile),
            Err(error) => {
                tracing::warn!(url = %url, error = %error, "Tile decode failed");
                return None;
            }
        };
        Some(
            self.cache
                .lock()
                .expect("cache poisoned")
                .entry(url)
                .or_insert(tile)
                .clone(),
        )
    }
}
