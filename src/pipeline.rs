use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::StreamConfig;
use crate::protocol::{RecordingMode, TrackKind};

/// One encoded media frame ready to be written to a local track.
pub struct EncodedFrame {
    pub data: Bytes,
    pub duration: Duration,
}

/// Everything a pipeline needs to know at creation time.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Unique id, shared with the processed output track.
    pub id: String,
    /// Prefix for recorded artifacts (timestamped, room/user qualified).
    pub file_prefix: String,
    pub kind: TrackKind,
    /// Codec name as negotiated ("opus", "VP8", "H264").
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    /// Opaque effect-graph descriptor.
    pub fx: String,
    pub recording_mode: RecordingMode,
    pub stream: StreamConfig,
}

#[derive(Debug)]
pub struct PipelineError(pub String);

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pipeline error: {}", self.0)
    }
}

impl std::error::Error for PipelineError {}

/// Narrow interface to the external media pipeline
/// (decode → effect graph → encode → optional recording).
#[async_trait]
pub trait Pipeline: Send + Sync {
    fn id(&self) -> &str;
    async fn start(&self) -> Result<(), PipelineError>;
    /// Idempotent: stopping twice is a no-op.
    async fn stop(&self);
    /// Feed one inbound RTP packet.
    async fn push(&self, data: &[u8]) -> Result<(), PipelineError>;
    /// Next processed frame; `None` once the pipeline has stopped and drained.
    async fn pull(&self) -> Option<EncodedFrame>;
    fn set_fx_property(&self, name: &str, property: &str, value: f32);
    fn get_fx_property(&self, name: &str, property: &str) -> f32;
    fn set_fx_poly_property(&self, name: &str, property: &str, value: &str);
    fn set_encoder_target_bitrate(&self, bps: u64);
    /// Names of recorded artifacts, known at creation.
    fn files(&self) -> Vec<String>;
}

pub trait PipelineFactory: Send + Sync {
    fn create(&self, config: PipelineConfig) -> Result<Arc<dyn Pipeline>, PipelineError>;
}

/// Process-wide index of live pipelines by id.
pub struct PipelineStore {
    index: DashMap<String, Arc<dyn Pipeline>>,
}

impl PipelineStore {
    pub fn new() -> Self {
        PipelineStore {
            index: DashMap::new(),
        }
    }

    pub fn add(&self, pipeline: Arc<dyn Pipeline>) {
        self.index.insert(pipeline.id().to_string(), pipeline);
    }

    pub fn find(&self, id: &str) -> Option<Arc<dyn Pipeline>> {
        self.index.get(id).map(|e| e.value().clone())
    }

    pub fn remove(&self, id: &str) {
        if self.index.remove(id).is_some() {
            info!(pipeline = %id, "pipeline_deleted");
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

impl Default for PipelineStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Default in-process pipeline: forwards inbound packets to the output side
/// untouched, stores fx properties, records nothing. The real encoder/effect
/// pipeline plugs in behind the same trait.
pub struct LoopbackPipeline {
    config: PipelineConfig,
    frame_tx: mpsc::Sender<EncodedFrame>,
    frame_rx: tokio::sync::Mutex<mpsc::Receiver<EncodedFrame>>,
    stopped: CancellationToken,
    target_bitrate: AtomicU64,
    fx_properties: Mutex<HashMap<(String, String), f32>>,
    fx_poly_properties: Mutex<HashMap<(String, String), String>>,
}

impl LoopbackPipeline {
    pub fn new(config: PipelineConfig) -> Arc<Self> {
        let (frame_tx, frame_rx) = mpsc::channel(256);
        Arc::new(LoopbackPipeline {
            target_bitrate: AtomicU64::new(config.stream.default_bitrate),
            config,
            frame_tx,
            frame_rx: tokio::sync::Mutex::new(frame_rx),
            stopped: CancellationToken::new(),
            fx_properties: Mutex::new(HashMap::new()),
            fx_poly_properties: Mutex::new(HashMap::new()),
        })
    }

    fn frame_duration(&self) -> Duration {
        match self.config.kind {
            // Opus default packet time
            TrackKind::Audio => Duration::from_millis(20),
            TrackKind::Video => Duration::from_millis(1_000 / u64::from(self.config.frame_rate.max(1))),
        }
    }

    fn lock_fx(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), f32>> {
        self.fx_properties.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Pipeline for LoopbackPipeline {
    fn id(&self) -> &str {
        &self.config.id
    }

    async fn start(&self) -> Result<(), PipelineError> {
        info!(
            pipeline = %self.config.id,
            kind = %self.config.kind,
            codec = %self.config.codec,
            "pipeline_started"
        );
        Ok(())
    }

    async fn stop(&self) {
        if !self.stopped.is_cancelled() {
            self.stopped.cancel();
            info!(pipeline = %self.config.id, "pipeline_stopped");
        }
    }

    async fn push(&self, data: &[u8]) -> Result<(), PipelineError> {
        if self.stopped.is_cancelled() {
            return Err(PipelineError("push on stopped pipeline".to_string()));
        }
        let frame = EncodedFrame {
            data: Bytes::copy_from_slice(data),
            duration: self.frame_duration(),
        };
        // Drop the frame rather than stall the RTP reader when the pull side lags.
        let _ = self.frame_tx.try_send(frame);
        Ok(())
    }

    async fn pull(&self) -> Option<EncodedFrame> {
        let mut rx = self.frame_rx.lock().await;
        tokio::select! {
            _ = self.stopped.cancelled() => None,
            frame = rx.recv() => frame,
        }
    }

    fn set_fx_property(&self, name: &str, property: &str, value: f32) {
        self.lock_fx()
            .insert((name.to_string(), property.to_string()), value);
    }

    fn get_fx_property(&self, name: &str, property: &str) -> f32 {
        self.lock_fx()
            .get(&(name.to_string(), property.to_string()))
            .copied()
            .unwrap_or(0.0)
    }

    fn set_fx_poly_property(&self, name: &str, property: &str, value: &str) {
        self.fx_poly_properties
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((name.to_string(), property.to_string()), value.to_string());
    }

    fn set_encoder_target_bitrate(&self, bps: u64) {
        self.target_bitrate.store(bps, Ordering::Relaxed);
    }

    fn files(&self) -> Vec<String> {
        Vec::new()
    }
}

pub struct LoopbackPipelineFactory;

impl PipelineFactory for LoopbackPipelineFactory {
    fn create(&self, config: PipelineConfig) -> Result<Arc<dyn Pipeline>, PipelineError> {
        Ok(LoopbackPipeline::new(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(kind: TrackKind) -> PipelineConfig {
        PipelineConfig {
            id: "p1".to_string(),
            file_prefix: "prefix".to_string(),
            kind,
            codec: "VP8".to_string(),
            width: 800,
            height: 600,
            frame_rate: 30,
            fx: String::new(),
            recording_mode: RecordingMode::None,
            stream: StreamConfig {
                min_bitrate: 150_000,
                default_bitrate: 1_000_000,
                max_bitrate: 2_500_000,
            },
        }
    }

    #[tokio::test]
    async fn test_loopback_push_pull() {
        let p = LoopbackPipeline::new(test_config(TrackKind::Video));
        p.start().await.unwrap();
        p.push(&[1, 2, 3]).await.unwrap();
        let frame = p.pull().await.expect("frame");
        assert_eq!(&frame.data[..], &[1, 2, 3]);
        assert_eq!(frame.duration, Duration::from_millis(33));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_ends_pull() {
        let p = LoopbackPipeline::new(test_config(TrackKind::Audio));
        p.stop().await;
        p.stop().await;
        assert!(p.pull().await.is_none());
        assert!(p.push(&[0]).await.is_err());
    }

    #[tokio::test]
    async fn test_fx_properties_round() {
        let p = LoopbackPipeline::new(test_config(TrackKind::Audio));
        assert_eq!(p.get_fx_property("reverb", "gain"), 0.0);
        p.set_fx_property("reverb", "gain", 0.7);
        assert_eq!(p.get_fx_property("reverb", "gain"), 0.7);
    }

    #[tokio::test]
    async fn test_store_add_find_remove() {
        let store = PipelineStore::new();
        let p = LoopbackPipeline::new(test_config(TrackKind::Video));
        store.add(p.clone());
        assert!(store.find("p1").is_some());
        store.remove("p1");
        assert!(store.find("p1").is_none());
        // removing again is a no-op
        store.remove("p1");
    }
}
