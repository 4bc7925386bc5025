use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_remote::TrackRemote;

use crate::bwe::BandwidthEstimator;
use crate::config::StreamsConfig;
use crate::engine;
use crate::id_types::UserId;
use crate::interpolator::{LinearInterpolator, DEFAULT_INTERPOLATOR_STEP_MS};
use crate::metrics::KEYFRAMES_REQUESTED_TOTAL;
use crate::peer_server::PeerServer;
use crate::pipeline::Pipeline;
use crate::protocol::{ControlPayload, JoinRequest, PolyControlPayload, ServerMessage, TrackKind};
use crate::room::Room;
use crate::ws::WsChannel;

/// Minimum spacing between PLIs sent upstream for one publisher.
pub const MIN_PLI_INTERVAL: Duration = Duration::from_millis(500);
/// Unconditional keyframe cadence while a remote track is live.
pub const PLI_TICKER_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Default)]
struct PipelineSlots {
    audio: Option<Arc<dyn Pipeline>>,
    video: Option<Arc<dyn Pipeline>>,
}

struct PliThrottle {
    last: Option<Instant>,
    pending: bool,
}

struct InterpolatorSlot {
    generation: u64,
    cancel: CancellationToken,
}

/// Augmented peer connection: one per connected user. Owns the PLI throttle,
/// the pipeline handles that control messages address, and the bandwidth
/// estimator sampled by sender controllers.
pub struct PeerConn {
    user_id: UserId,
    pc: Arc<RTCPeerConnection>,
    estimator: Arc<BandwidthEstimator>,
    pipelines: Mutex<PipelineSlots>,
    interpolators: Mutex<HashMap<String, InterpolatorSlot>>,
    interpolator_generation: AtomicU64,
    pli_throttle: Mutex<PliThrottle>,
    /// SSRC of the inbound video track, the target of upstream PLIs.
    video_ssrc: AtomicU32,
    pending_answer: Mutex<Option<oneshot::Sender<RTCSessionDescription>>>,
}

impl PeerConn {
    pub async fn new(
        join: &JoinRequest,
        streams: &StreamsConfig,
    ) -> Result<Arc<PeerConn>, webrtc::Error> {
        let api = engine::create_api(join.video_format())?;
        let pc = Arc::new(api.new_peer_connection(engine::rtc_configuration()).await?);

        // one inbound audio and one inbound video track per peer
        for codec_type in [RTPCodecType::Video, RTPCodecType::Audio] {
            pc.add_transceiver_from_kind(
                codec_type,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await?;
        }

        Ok(Arc::new(PeerConn {
            user_id: UserId::from(join.user_id.as_str()),
            pc,
            estimator: Arc::new(BandwidthEstimator::new(streams.video.default_bitrate)),
            pipelines: Mutex::new(PipelineSlots::default()),
            interpolators: Mutex::new(HashMap::new()),
            interpolator_generation: AtomicU64::new(0),
            pli_throttle: Mutex::new(PliThrottle {
                last: None,
                pending: false,
            }),
            video_ssrc: AtomicU32::new(0),
            pending_answer: Mutex::new(None),
        }))
    }

    pub fn pc(&self) -> Arc<RTCPeerConnection> {
        self.pc.clone()
    }

    pub fn estimator(&self) -> Arc<BandwidthEstimator> {
        self.estimator.clone()
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Wire the connection callbacks. Captures are weak: a closed peer must
    /// not be kept alive by its own handlers.
    pub fn register_handlers(self: &Arc<Self>, room: &Arc<Room>, ps: &Arc<PeerServer>, ws: &Arc<WsChannel>) {
        let user_id = self.user_id.clone();

        // trickle ICE: emit server candidates to the client
        let ws_for_ice = ws.clone();
        let ice_user = user_id.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let ws = ws_for_ice.clone();
                let user_id = ice_user.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        return;
                    };
                    let json = match candidate.to_json() {
                        Ok(init) => match serde_json::to_string(&init) {
                            Ok(json) => json,
                            Err(e) => {
                                error!(user = %user_id, error = %e, "marshal_candidate_failed");
                                return;
                            }
                        },
                        Err(e) => {
                            error!(user = %user_id, error = %e, "candidate_to_json_failed");
                            return;
                        }
                    };
                    let _ = ws.send(&ServerMessage::Candidate(json)).await;
                })
            }));

        let ps_weak = Arc::downgrade(ps);
        let pc_weak = Arc::downgrade(&self.pc);
        let state_user = user_id.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let ps_weak = ps_weak.clone();
                let pc_weak = pc_weak.clone();
                let user_id = state_user.clone();
                Box::pin(async move {
                    info!(user = %user_id, state = %state, "peer_connection_state_changed");
                    match state {
                        RTCPeerConnectionState::Failed => {
                            if let Some(pc) = pc_weak.upgrade() {
                                if let Err(e) = pc.close().await {
                                    error!(user = %user_id, error = %e, "peer_connection_close_failed");
                                }
                            }
                        }
                        RTCPeerConnectionState::Closed => {
                            if let Some(ps) = ps_weak.upgrade() {
                                ps.close("peer_connection_closed").await;
                            }
                        }
                        _ => {}
                    }
                })
            }));

        let room_weak = Arc::downgrade(room);
        let ps_weak = Arc::downgrade(ps);
        let me_weak = Arc::downgrade(self);
        self.pc
            .on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
                let room_weak = room_weak.clone();
                let ps_weak = ps_weak.clone();
                let me_weak = me_weak.clone();
                Box::pin(async move {
                    let (Some(room), Some(ps), Some(me)) =
                        (room_weak.upgrade(), ps_weak.upgrade(), me_weak.upgrade())
                    else {
                        return;
                    };
                    let Some(kind) = TrackKind::from_codec_type(track.kind()) else {
                        warn!(user = %me.user_id, "track_with_unspecified_kind");
                        return;
                    };
                    info!(
                        user = %me.user_id,
                        kind = %kind,
                        ssrc = %track.ssrc(),
                        mime = %track.codec().capability.mime_type,
                        "remote_track_received"
                    );

                    room.add_ssrc(track.ssrc(), kind, me.user_id.clone());
                    if kind == TrackKind::Video {
                        me.set_inbound_video_ssrc(track.ssrc());
                    }

                    // keep the publisher refreshing keyframes for the lifetime
                    // of the session
                    let pc_weak = Arc::downgrade(&me.pc);
                    let end = room.end_token();
                    let ticker_ssrc = track.ssrc();
                    tokio::spawn(async move {
                        let mut ticker = tokio::time::interval(PLI_TICKER_INTERVAL);
                        ticker.tick().await;
                        loop {
                            tokio::select! {
                                _ = end.cancelled() => return,
                                _ = ticker.tick() => {
                                    let Some(pc) = pc_weak.upgrade() else { return };
                                    let pli = PictureLossIndication {
                                        sender_ssrc: 0,
                                        media_ssrc: ticker_ssrc,
                                    };
                                    if let Err(e) = pc.write_rtcp(&[Box::new(pli)]).await {
                                        debug!(error = %e, "pli_ticker_write_failed");
                                        return;
                                    }
                                }
                            }
                        }
                    });

                    tokio::spawn(async move {
                        room.run_mixer_slice_from_remote(ps, track, kind).await;
                    });
                })
            }));
    }

    /// Remember which inbound SSRC upstream PLIs must target.
    pub(crate) fn set_inbound_video_ssrc(&self, ssrc: u32) {
        self.video_ssrc.store(ssrc, Ordering::Relaxed);
    }

    /// At most one PLI per publisher per [`MIN_PLI_INTERVAL`]; requests inside
    /// the window collapse into one send at the next available slot.
    pub fn throttled_pli_request(self: &Arc<Self>, reason: &'static str) {
        let now = Instant::now();
        let wait = {
            let mut throttle = self
                .pli_throttle
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            match throttle.last {
                Some(last) if now.duration_since(last) < MIN_PLI_INTERVAL => {
                    if throttle.pending {
                        return;
                    }
                    throttle.pending = true;
                    Some(MIN_PLI_INTERVAL - now.duration_since(last))
                }
                _ => {
                    throttle.last = Some(now);
                    None
                }
            }
        };

        let me = Arc::downgrade(self);
        tokio::spawn(async move {
            if let Some(wait) = wait {
                tokio::time::sleep(wait).await;
                let Some(strong) = me.upgrade() else { return };
                {
                    let mut throttle = strong
                        .pli_throttle
                        .lock()
                        .unwrap_or_else(|e| e.into_inner());
                    throttle.pending = false;
                    throttle.last = Some(Instant::now());
                }
                strong.send_pli(reason).await;
            } else if let Some(strong) = me.upgrade() {
                strong.send_pli(reason).await;
            }
        });
    }

    async fn send_pli(&self, reason: &'static str) {
        let ssrc = self.video_ssrc.load(Ordering::Relaxed);
        if ssrc == 0 {
            return;
        }
        KEYFRAMES_REQUESTED_TOTAL.inc();
        debug!(user = %self.user_id, reason = %reason, "pli_requested");
        let pli = PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc: ssrc,
        };
        if let Err(e) = self.pc.write_rtcp(&[Box::new(pli)]).await {
            debug!(user = %self.user_id, error = %e, "pli_write_failed");
        }
    }

    pub fn set_pipeline(&self, kind: TrackKind, pipeline: Arc<dyn Pipeline>) {
        let mut slots = self.pipelines.lock().unwrap_or_else(|e| e.into_inner());
        match kind {
            TrackKind::Audio => slots.audio = Some(pipeline),
            TrackKind::Video => slots.video = Some(pipeline),
        }
    }

    fn pipeline(&self, kind: TrackKind) -> Option<Arc<dyn Pipeline>> {
        let slots = self.pipelines.lock().unwrap_or_else(|e| e.into_inner());
        match kind {
            TrackKind::Audio => slots.audio.clone(),
            TrackKind::Video => slots.video.clone(),
        }
    }

    /// Apply an effect-property change, immediately or interpolated.
    /// A new request for the same (kind, fx, property) preempts the previous
    /// interpolation; requests for distinct properties run independently.
    pub async fn control_fx(self: Arc<Self>, payload: ControlPayload) {
        let Some(pipeline) = self.pipeline(payload.kind) else {
            return;
        };
        let interpolator_id = format!("{}{}{}", payload.kind, payload.name, payload.property);

        {
            let interpolators = self
                .interpolators
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(slot) = interpolators.get(&interpolator_id) {
                slot.cancel.cancel();
            }
        }

        if payload.duration == 0 {
            pipeline.set_fx_property(&payload.name, &payload.property, payload.value);
            return;
        }

        let old_value = pipeline.get_fx_property(&payload.name, &payload.property);
        let mut interpolator = LinearInterpolator::new(
            old_value,
            payload.value,
            payload.duration,
            DEFAULT_INTERPOLATOR_STEP_MS,
        );
        let generation = self
            .interpolator_generation
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        {
            let mut interpolators = self
                .interpolators
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            interpolators.insert(
                interpolator_id.clone(),
                InterpolatorSlot {
                    generation,
                    cancel: interpolator.cancel_token(),
                },
            );
        }

        while let Some(value) = interpolator.recv().await {
            if interpolator.cancel_token().is_cancelled() {
                break;
            }
            pipeline.set_fx_property(&payload.name, &payload.property, value);
        }

        let mut interpolators = self
            .interpolators
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if interpolators
            .get(&interpolator_id)
            .map(|slot| slot.generation)
            == Some(generation)
        {
            interpolators.remove(&interpolator_id);
        }
    }

    /// Untyped effect-property set, applied immediately.
    pub fn poly_control_fx(&self, payload: &PolyControlPayload) {
        let Some(pipeline) = self.pipeline(payload.kind) else {
            return;
        };
        pipeline.set_fx_poly_property(&payload.name, &payload.property, &payload.value_as_string());
    }

    /// Arm the rendezvous for the next inbound answer. Replaces any previous
    /// unanswered offer.
    pub fn expect_answer(&self) -> oneshot::Receiver<RTCSessionDescription> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self
            .pending_answer
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *pending = Some(tx);
        rx
    }

    /// Route an inbound answer to the in-flight signaling round, or apply it
    /// directly when no round is waiting.
    pub async fn handle_answer(&self, answer: RTCSessionDescription) {
        let taken = {
            let mut pending = self
                .pending_answer
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            pending.take()
        };
        match taken {
            Some(tx) => {
                if let Err(answer) = tx.send(answer) {
                    // round gone (timeout); apply anyway
                    if let Err(e) = self.pc.set_remote_description(answer).await {
                        warn!(user = %self.user_id, error = %e, "late_answer_rejected");
                    }
                }
            }
            None => {
                if let Err(e) = self.pc.set_remote_description(answer).await {
                    warn!(user = %self.user_id, error = %e, "unsolicited_answer_rejected");
                }
            }
        }
    }

    pub async fn add_ice_candidate(&self, payload: &str) {
        let init: RTCIceCandidateInit = match serde_json::from_str(payload) {
            Ok(init) => init,
            Err(e) => {
                warn!(user = %self.user_id, error = %e, "unparsable_candidate");
                return;
            }
        };
        if let Err(e) = self.pc.add_ice_candidate(init).await {
            warn!(user = %self.user_id, error = %e, "add_ice_candidate_failed");
        }
    }

    pub async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!(user = %self.user_id, error = %e, "peer_connection_close_failed");
        }
    }
}
