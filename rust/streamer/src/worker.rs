// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Streaming worker.
//!
//! Owns the visibility engine and the tile loader behind a tagged message
//! protocol. Camera updates are coalesced: only the newest queued pose is
//! sampled, and a pose that arrives while a readback is in flight
//! supersedes it before any visibility state is mutated.

use crate::engine::{StreamerSettings, VisibilityEngine, VisibilityUpdate};
use crate::error::Result;
use crate::loader::{GeometryBatch, TileLoader, TileTransport};
use crate::occlusion::{CameraPose, OcclusionRenderer, OffscreenConfig};
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use tilestream_codec::Manifest;
use tokio::sync::mpsc;

/// Everything needed to start streaming one model.
#[derive(Debug)]
pub struct LoadModelRequest {
    pub model_key: String,
    /// Base URL the model's tile files are served under.
    pub server_url: String,
    pub manifest: Manifest,
    /// Column-major coordination matrix placing the model in the scene.
    pub coordination: [f32; 16],
}

/// Requests accepted by the worker.
#[derive(Debug)]
pub enum StreamerRequest {
    /// Create the renderer. Repeated inits are ignored.
    Init(OffscreenConfig),
    UpdateCamera(CameraPose),
    LoadModel(Box<LoadModelRequest>),
    UnloadModel { model_key: String },
    /// Tear down; no request is processed afterwards.
    Dispose,
}

/// Events emitted by the worker.
#[derive(Debug)]
pub enum StreamerEvent {
    /// Residency changed for already-loaded geometries.
    VisibilityChanged {
        to_hide: FxHashMap<String, FxHashSet<u32>>,
        to_show: FxHashMap<String, FxHashSet<u32>>,
    },
    /// Newly fetched render batches for one model.
    GeometriesReady {
        model_key: String,
        batches: Vec<GeometryBatch>,
        /// All geometry ids of the originating load request.
        requested: FxHashSet<u32>,
    },
    Error { message: String },
}

/// Builds the renderer on first `Init`, when the target size is known.
pub type RendererFactory =
    Box<dyn FnOnce(&OffscreenConfig) -> Result<Box<dyn OcclusionRenderer>> + Send>;

/// Message-driven streaming worker.
pub struct StreamerWorker {
    settings: StreamerSettings,
    factory: Option<RendererFactory>,
    engine: Option<VisibilityEngine>,
    loader: TileLoader,
    last_pose: Option<CameraPose>,
}

enum Flow {
    Continue,
    Stop,
}

impl StreamerWorker {
    pub fn new(
        settings: StreamerSettings,
        transport: Arc<dyn TileTransport>,
        factory: RendererFactory,
    ) -> Self {
        Self {
            settings,
            factory: Some(factory),
            engine: None,
            loader: TileLoader::new(transport),
            last_pose: None,
        }
    }

    /// Spawn the worker on the current runtime and return its channels.
    pub fn spawn(
        self,
    ) -> (
        mpsc::UnboundedSender<StreamerRequest>,
        mpsc::UnboundedReceiver<StreamerEvent>,
    ) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(self.run(request_rx, event_tx));
        (request_tx, event_rx)
    }

    /// Process requests until `Dispose` or channel closure.
    pub async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<StreamerRequest>,
        events: mpsc::UnboundedSender<StreamerEvent>,
    ) {
        while let Some(request) = requests.recv().await {
            let flow = match request {
                StreamerRequest::UpdateCamera(pose) => {
                    self.camera_pass(pose, &mut requests, &events).await
                }
                other => self.handle(other, &events).await,
            };
            if matches!(flow, Flow::Stop) {
                break;
            }
        }
        tracing::debug!("Streamer worker stopped");
    }

    /// Sample the newest queued pose and classify its pixels. Poses that
    /// arrive during the readback make it stale; the stale pixels are
    /// discarded without touching visibility state and the pass restarts.
    async fn camera_pass(
        &mut self,
        mut pose: CameraPose,
        requests: &mut mpsc::UnboundedReceiver<StreamerRequest>,
        events: &mpsc::UnboundedSender<StreamerEvent>,
    ) -> Flow {
        let Some(engine) = self.engine.as_mut() else {
            tracing::debug!("Camera update before init, ignored");
            return Flow::Continue;
        };

        let mut carried = None;
        let update = loop {
            drain_poses(requests, &mut pose, &mut carried);

            let pixels = match engine.sample(&pose) {
                Ok(pixels) => pixels,
                Err(error) => {
                    send_error(events, &error);
                    break None;
                }
            };

            if drain_poses(requests, &mut pose, &mut carried) {
                continue;
            }

            self.last_pose = Some(pose.clone());
            let now = engine.now_ms();
            break engine.process_pixels(&pixels, now);
        };

        if let Some(update) = update {
            self.publish(update, events).await;
        }
        match carried {
            Some(request) => self.handle(request, events).await,
            None => Flow::Continue,
        }
    }

    /// Emit residency changes, then fetch whatever the pass scheduled.
    async fn publish(&mut self, update: VisibilityUpdate, events: &mpsc::UnboundedSender<StreamerEvent>) {
        if !update.to_hide.is_empty() || !update.to_show.is_empty() {
            let _ = events.send(StreamerEvent::VisibilityChanged {
                to_hide: update.to_hide,
                to_show: update.to_show,
            });
        }
        for (model_key, buckets) in update.to_load {
            match self.loader.load(&model_key, &buckets).await {
                Ok(outcome) => {
                    if !outcome.requested.is_empty() {
                        let _ = events.send(StreamerEvent::GeometriesReady {
                            model_key,
                            batches: outcome.batches,
                            requested: outcome.requested,
                        });
                    }
                }
                Err(error) => send_error(events, &error),
            }
        }
    }

    async fn handle(
        &mut self,
        request: StreamerRequest,
        events: &mpsc::UnboundedSender<StreamerEvent>,
    ) -> Flow {
        match request {
            StreamerRequest::Init(config) => {
                if self.engine.is_some() {
                    tracing::debug!("Repeated init, ignored");
                    return Flow::Continue;
                }
                let Some(factory) = self.factory.take() else {
                    return Flow::Continue;
                };
                match factory(&config) {
                    Ok(renderer) => {
                        self.engine =
                            Some(VisibilityEngine::new(self.settings.clone(), renderer));
                    }
                    Err(error) => send_error(events, &error),
                }
                Flow::Continue
            }
            StreamerRequest::UpdateCamera(_) => {
                // handled by camera_pass in the run loop
                Flow::Continue
            }
            StreamerRequest::LoadModel(request) => {
                let Some(engine) = self.engine.as_mut() else {
                    tracing::debug!(model = %request.model_key, "Model load before init, ignored");
                    return Flow::Continue;
                };
                let loaded = engine
                    .load_model(&request.model_key, &request.manifest, request.coordination)
                    .and_then(|_| {
                        self.loader.register_model(
                            &request.model_key,
                            &request.server_url,
                            &request.manifest,
                        )
                    });
                if let Err(error) = loaded {
                    send_error(events, &error);
                    return Flow::Continue;
                }
                // Freshly loaded models should become visible without
                // waiting for the camera to move again.
                let update = match self.last_pose.clone() {
                    Some(pose) => match engine.update_camera(&pose) {
                        Ok(update) => update,
                        Err(error) => {
                            send_error(events, &error);
                            None
                        }
                    },
                    None => None,
                };
                if let Some(update) = update {
                    self.publish(update, events).await;
                }
                Flow::Continue
            }
            StreamerRequest::UnloadModel { model_key } => {
                if let Some(engine) = self.engine.as_mut() {
                    if let Err(error) = engine.unload_model(&model_key) {
                        send_error(events, &error);
                    }
                    self.loader.remove_model(&model_key);
                }
                Flow::Continue
            }
            StreamerRequest::Dispose => {
                // Dropping the engine releases the renderer and all
                // tracking state; queued requests are never processed.
                self.engine = None;
                Flow::Stop
            }
        }
    }
}

/// Pull newer poses off the queue, keeping only the newest. The first
/// non-camera request stops the drain and is carried for later handling.
/// Returns whether `pose` was replaced.
fn drain_poses(
    requests: &mut mpsc::UnboundedReceiver<StreamerRequest>,
    pose: &mut CameraPose,
    carried: &mut Option<StreamerRequest>,
) -> bool {
    let mut replaced = false;
    if carried.is_some() {
        return false;
    }
    while let Ok(next) = requests.try_recv() {
        match next {
            StreamerRequest::UpdateCamera(newer) => {
                *pose = newer;
                replaced = true;
            }
            other => {
                *carried = Some(other);
                break;
            }
        }
    }
    replaced
}

fn send_error(events: &mpsc::UnboundedSender<StreamerEvent>, error: &crate::error::Error) {
    tracing::error!(error = %error, "Streamer operation failed");
    let _ = events.send(StreamerEvent::Error {
        message: error.to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::ColorCode;
    use crate::error::Error;
    use crate::occlusion::{PixelBuffer, ProxyInstance};
    use bytes::Bytes;
    use futures::future::BoxFuture;
    use rustc_hash::FxHashMap;
    use std::sync::Mutex;
    use tilestream_codec::{
        encode_tile, signed_geometry_id, tile_file_name, Asset, AssetGeometry, GeometryBuffers,
        GeometryRecord,
    };

    const IDENTITY: [f32; 16] = [
        1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0,
    ];

    struct SharedRenderer {
        samples: Arc<Mutex<usize>>,
        buffer: PixelBuffer,
    }

    impl OcclusionRenderer for SharedRenderer {
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
            Ok(self.buffer.clone())
        }
    }

    /// Renderer whose first sample pushes new requests into the worker's
    /// queue while the readback is conceptually still in flight.
    struct InjectingRenderer {
        sender: mpsc::UnboundedSender<StreamerRequest>,
        samples: Arc<Mutex<usize>>,
        first: PixelBuffer,
    }

    impl OcclusionRenderer for InjectingRenderer {
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
            let mut samples = self.samples.lock().unwrap();
            *samples += 1;
            if *samples == 1 {
                let _ = self.sender.send(StreamerRequest::UpdateCamera(pose()));
                let _ = self.sender.send(StreamerRequest::Dispose);
                Ok(self.first.clone())
            } else {
                Ok(PixelBuffer::blank(32, 32))
            }
        }
    }

    struct FakeTransport {
        tiles: FxHashMap<String, Bytes>,
    }

    impl TileTransport for FakeTransport {
        fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Bytes>> {
            Box::pin(async move {
                self.tiles
                    .get(url.rsplit('/').next().unwrap_or(url))
                    .cloned()
                    .ok_or_else(|| Error::Transport(format!("not found: {url}")))
            })
        }
    }

    fn pose() -> CameraPose {
        CameraPose {
            position: [0.0, 0.0, 10.0],
            quaternion: [0.0, 0.0, 0.0, 1.0],
            viewport_width: 800,
            viewport_height: 600,
        }
    }

    fn buffer_with(code: ColorCode, pixels: u32) -> PixelBuffer {
        let mut buffer = PixelBuffer::blank(32, 32);
        for i in 0..pixels as usize {
            buffer.rgba[i * 4] = code.0[0];
            buffer.rgba[i * 4 + 1] = code.0[1];
            buffer.rgba[i * 4 + 2] = code.0[2];
        }
        buffer
    }

    fn fixture() -> (Manifest, FxHashMap<String, Bytes>) {
        let mut manifest = Manifest::default();
        manifest.geometries.insert(
            5,
            GeometryRecord {
                bounding_box: IDENTITY,
                tile_file: tile_file_name(0),
            },
        );
        manifest.assets.push(Asset {
            id: 100,
            geometries: vec![AssetGeometry {
                geometry_id: 5,
                color: [0.5, 0.5, 0.5, 1.0],
                transformation: IDENTITY,
            }],
        });
        manifest.geometry_keys.insert(signed_geometry_id(5, false), 0);

        let tile = encode_tile(
            &[(
                5,
                GeometryBuffers {
                    positions: vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
                    indices: vec![0, 1, 2],
                },
            )]
            .into_iter()
            .collect(),
        );
        (manifest, [(tile_file_name(0), tile)].into_iter().collect())
    }

    fn worker_with(
        buffer: PixelBuffer,
        tiles: FxHashMap<String, Bytes>,
    ) -> (StreamerWorker, Arc<Mutex<usize>>) {
        let samples = Arc::new(Mutex::new(0));
        let renderer_samples = samples.clone();
        let worker = StreamerWorker::new(
            StreamerSettings::default(),
            Arc::new(FakeTransport { tiles }),
            Box::new(move |_config| {
                Ok(Box::new(SharedRenderer {
                    samples: renderer_samples,
                    buffer,
                }) as Box<dyn OcclusionRenderer>)
            }),
        );
        (worker, samples)
    }

    #[tokio::test]
    async fn camera_bursts_collapse_into_one_sample() {
        let (worker, samples) = worker_with(PixelBuffer::blank(32, 32), FxHashMap::default());

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        request_tx
            .send(StreamerRequest::Init(OffscreenConfig::default()))
            .unwrap();
        for _ in 0..3 {
            request_tx
                .send(StreamerRequest::UpdateCamera(pose()))
                .unwrap();
        }
        request_tx.send(StreamerRequest::Dispose).unwrap();

        worker.run(request_rx, event_tx).await;
        assert_eq!(*samples.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn pose_arriving_mid_readback_discards_its_pixels() {
        let (manifest, tiles) = fixture();
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();

        let samples = Arc::new(Mutex::new(0));
        let renderer_samples = samples.clone();
        let injector = request_tx.clone();
        let worker = StreamerWorker::new(
            StreamerSettings::default(),
            Arc::new(FakeTransport { tiles }),
            Box::new(move |_config| {
                Ok(Box::new(InjectingRenderer {
                    sender: injector,
                    samples: renderer_samples,
                    // geometry 5 clearly visible in the superseded pass
                    first: buffer_with(ColorCode([0, 0, 1]), 60),
                }) as Box<dyn OcclusionRenderer>)
            }),
        );

        request_tx
            .send(StreamerRequest::Init(OffscreenConfig::default()))
            .unwrap();
        request_tx
            .send(StreamerRequest::LoadModel(Box::new(LoadModelRequest {
                model_key: "model-a".into(),
                server_url: "http://tiles.test/model-a".into(),
                manifest,
                coordination: IDENTITY,
            })))
            .unwrap();
        request_tx
            .send(StreamerRequest::UpdateCamera(pose()))
            .unwrap();

        worker.run(request_rx, event_tx).await;

        // The stale pixels never reached classification: only the empty
        // resample was processed, so nothing was scheduled for loading.
        assert_eq!(*samples.lock().unwrap(), 2);
        assert!(event_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn visible_geometry_streams_in_end_to_end() {
        let (manifest, tiles) = fixture();
        // first allocated code is 1 -> (0, 0, 1)
        let (worker, _samples) = worker_with(buffer_with(ColorCode([0, 0, 1]), 60), tiles);

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        request_tx
            .send(StreamerRequest::Init(OffscreenConfig::default()))
            .unwrap();
        request_tx
            .send(StreamerRequest::LoadModel(Box::new(LoadModelRequest {
                model_key: "model-a".into(),
                server_url: "http://tiles.test/model-a".into(),
                manifest,
                coordination: IDENTITY,
            })))
            .unwrap();
        request_tx
            .send(StreamerRequest::UpdateCamera(pose()))
            .unwrap();
        request_tx.send(StreamerRequest::Dispose).unwrap();

        worker.run(request_rx, event_tx).await;

        let event = event_rx.recv().await.expect("event expected");
        match event {
            StreamerEvent::GeometriesReady {
                model_key,
                batches,
                requested,
            } => {
                assert_eq!(model_key, "model-a");
                assert_eq!(requested, [5].into_iter().collect());
                assert_eq!(batches.len(), 1);
                assert_eq!(batches[0].geometry_id, 5);
                assert!(!batches[0].transparent);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_model_load_reports_an_error() {
        let (manifest, tiles) = fixture();
        let (worker, _samples) = worker_with(PixelBuffer::blank(32, 32), tiles);

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        request_tx
            .send(StreamerRequest::Init(OffscreenConfig::default()))
            .unwrap();
        for _ in 0..2 {
            request_tx
                .send(StreamerRequest::LoadModel(Box::new(LoadModelRequest {
                    model_key: "model-a".into(),
                    server_url: "http://tiles.test/model-a".into(),
                    manifest: manifest.clone(),
                    coordination: IDENTITY,
                })))
                .unwrap();
        }
        request_tx.send(StreamerRequest::Dispose).unwrap();

        worker.run(request_rx, event_tx).await;

        let event = event_rx.recv().await.expect("event expected");
        assert!(matches!(event, StreamerEvent::Error { message }
            if message.contains("already loaded")));
    }

    #[tokio::test]
    async fn requests_before_init_are_ignored() {
        let (manifest, tiles) = fixture();
        let (worker, samples) = worker_with(PixelBuffer::blank(32, 32), tiles);

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        request_tx
            .send(StreamerRequest::UpdateCamera(pose()))
            .unwrap();
        request_tx
            .send(StreamerRequest::LoadModel(Box::new(LoadModelRequest {
                model_key: "model-a".into(),
                server_url: "http://tiles.test/model-a".into(),
                manifest,
                coordination: IDENTITY,
            })))
            .unwrap();
        request_tx.send(StreamerRequest::Dispose).unwrap();

        worker.run(request_rx, event_tx).await;
        assert_eq!(*samples.lock().unwrap(), 0);
        assert!(event_rx.recv().await.is_none());
    }
}
