use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::Marshal;

use crate::config::StreamConfig;
use crate::id_types::UserId;
use crate::peer_conn::PeerConn;
use crate::pipeline::{Pipeline, PipelineError};
use crate::protocol::TrackKind;
use crate::sender_controller::SenderController;

/// Everything a slice needs from its surroundings at creation time.
pub struct SliceParams {
    pub from_user: UserId,
    /// Publisher connection: PLI fan-in target.
    pub origin_pc: Arc<PeerConn>,
    /// Closed when the publisher's session ends; stops the slice.
    pub origin_closed: CancellationToken,
    pub kind: TrackKind,
    pub capability: RTCRtpCodecCapability,
    pub pipeline: Arc<dyn Pipeline>,
    pub stream: StreamConfig,
    pub audio_max_bitrate: u64,
    pub encoder_control_period_ms: u64,
    pub gcc: bool,
}

/// One inbound-remote-track → processed-output-track pathway, plus the sender
/// controllers fanning the output out to every other peer.
pub struct MixerSlice {
    from_user: UserId,
    origin_pc: Arc<PeerConn>,
    origin_closed: CancellationToken,
    kind: TrackKind,
    output: Arc<TrackLocalStaticSample>,
    output_id: String,
    pipeline: Arc<dyn Pipeline>,
    stream: StreamConfig,
    audio_max_bitrate: u64,
    encoder_control_period_ms: u64,
    gcc: bool,
    controllers: Mutex<HashMap<UserId, Arc<SenderController>>>,
    /// Closed once the pipeline produced its first output frame.
    ready: CancellationToken,
    /// Closed when the slice stops; controllers exit on it.
    done: CancellationToken,
}

impl MixerSlice {
    pub fn new(params: SliceParams) -> Arc<MixerSlice> {
        // the processed track and its pipeline share one id
        let output_id = params.pipeline.id().to_string();
        let output = Arc::new(TrackLocalStaticSample::new(
            params.capability.clone(),
            output_id.clone(),
            params.from_user.to_string(),
        ));
        Arc::new(MixerSlice {
            from_user: params.from_user,
            origin_pc: params.origin_pc,
            origin_closed: params.origin_closed,
            kind: params.kind,
            output,
            output_id,
            pipeline: params.pipeline,
            stream: params.stream,
            audio_max_bitrate: params.audio_max_bitrate,
            encoder_control_period_ms: params.encoder_control_period_ms,
            gcc: params.gcc,
            controllers: Mutex::new(HashMap::new()),
            ready: CancellationToken::new(),
            done: CancellationToken::new(),
        })
    }

    pub fn from_user(&self) -> &UserId {
        &self.from_user
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn output_id(&self) -> &str {
        &self.output_id
    }

    pub fn pipeline(&self) -> Arc<dyn Pipeline> {
        self.pipeline.clone()
    }

    pub fn ready_token(&self) -> CancellationToken {
        self.ready.clone()
    }

    pub fn done_token(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Attach the processed output to a destination peer, once. Each
    /// attachment gets its own sender controller.
    pub async fn ensure_sender_for(
        self: &Arc<Self>,
        dest_user: &UserId,
        dest_pc: &Arc<PeerConn>,
    ) -> Result<(), webrtc::Error> {
        if *dest_user == self.from_user {
            return Ok(());
        }
        {
            let controllers = self.controllers.lock().unwrap_or_else(|e| e.into_inner());
            if controllers.contains_key(dest_user) {
                return Ok(());
            }
        }

        let sender = dest_pc
            .pc()
            .add_track(Arc::clone(&self.output) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        let params = sender.get_parameters().await;
        let ssrc = params
            .encodings
            .first()
            .map(|encoding| encoding.ssrc)
            .unwrap_or(0);

        let controller = SenderController::new(
            dest_user.clone(),
            self.kind,
            ssrc,
            sender,
            dest_pc.estimator(),
            self.origin_pc.clone(),
            self.stream,
            self.audio_max_bitrate,
            self.encoder_control_period_ms,
        );
        {
            let mut controllers = self.controllers.lock().unwrap_or_else(|e| e.into_inner());
            controllers.insert(dest_user.clone(), controller.clone());
        }
        controller.spawn_loops(self.ready.clone(), self.done.clone(), self.gcc);
        info!(
            from_user = %self.from_user,
            to_user = %dest_user,
            kind = %self.kind,
            track = %self.output_id,
            ssrc = ssrc,
            "sender_attached"
        );
        Ok(())
    }

    pub fn controllers(&self) -> Vec<Arc<SenderController>> {
        self.controllers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn has_sender_for(&self, dest_user: &UserId) -> bool {
        self.controllers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(dest_user)
    }

    /// Hand back all controllers for detachment from their destination peers.
    pub fn drain_controllers(&self) -> Vec<Arc<SenderController>> {
        let mut controllers = self.controllers.lock().unwrap_or_else(|e| e.into_inner());
        controllers.drain().map(|(_, c)| c).collect()
    }

    /// Conservative combiner across fan-out legs: the slowest destination
    /// dictates the encoder target.
    pub fn min_optimal_bitrate(&self) -> Option<u64> {
        let controllers = self.controllers.lock().unwrap_or_else(|e| e.into_inner());
        controllers
            .values()
            .map(|controller| controller.optimal_bitrate())
            .min()
    }

    pub async fn start_pipeline(&self) -> Result<(), PipelineError> {
        self.pipeline.start().await
    }

    /// Background halves of the slice: frame pull → output track (closing the
    /// `ready` latch on the first frame), and the encoder-control ticker.
    pub fn spawn_output_loops(self: &Arc<Self>) {
        let me = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = me.pipeline.pull().await {
                if !me.ready.is_cancelled() {
                    me.ready.cancel();
                    info!(track = %me.output_id, "slice_ready");
                }
                let sample = Sample {
                    data: frame.data,
                    duration: frame.duration,
                    ..Default::default()
                };
                if let Err(e) = me.output.write_sample(&sample).await {
                    debug!(track = %me.output_id, error = %e, "write_sample_failed");
                    break;
                }
            }
        });

        let me = self.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(me.encoder_control_period_ms));
            loop {
                tokio::select! {
                    _ = me.done.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Some(rate) = me.min_optimal_bitrate() {
                            me.pipeline.set_encoder_target_bitrate(rate);
                        }
                    }
                }
            }
        });
    }

    /// Feed the pipeline from the remote track until the room ends, the
    /// publisher leaves, or the track errors out. Blocks; always stops the
    /// slice on the way out.
    pub async fn run(self: &Arc<Self>, end: CancellationToken, input: Arc<TrackRemote>) {
        loop {
            tokio::select! {
                _ = end.cancelled() => break,
                _ = self.origin_closed.cancelled() => break,
                result = input.read_rtp() => match result {
                    Ok((packet, _)) => {
                        let data = match packet.marshal() {
                            Ok(data) => data,
                            Err(e) => {
                                error!(track = %self.output_id, error = %e, "rtp_marshal_failed");
                                break;
                            }
                        };
                        if let Err(e) = self.pipeline.push(&data).await {
                            error!(track = %self.output_id, error = %e, "pipeline_push_failed");
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        }
        self.stop().await;
    }

    /// Idempotent teardown: stop the pipeline and release every controller loop.
    pub async fn stop(&self) {
        self.pipeline.stop().await;
        self.done.cancel();
    }
}
