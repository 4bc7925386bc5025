use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::metrics::SIGNALING_ROUNDS_TOTAL;
use crate::mixer_slice::MixerSlice;
use crate::peer_server::PeerServer;
use crate::protocol::ServerMessage;
use crate::room::Room;
use crate::ws::TransportError;

/// Pause between attaching fresh senders and offering.
/// TODO FIX senders added immediately before an offer are sometimes missing
/// from it; remove once the underlying negotiation race is resolved.
pub const SIGNALING_WARMUP_DELAY: Duration = Duration::from_secs(1);
/// Bound on waiting for a client answer before abandoning the round for that peer.
const ANSWER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub enum SignalingError {
    Engine(webrtc::Error),
    Transport(TransportError),
    NoLocalDescription,
    AnswerTimeout,
    PeerGone,
}

impl std::fmt::Display for SignalingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalingError::Engine(e) => write!(f, "engine: {}", e),
            SignalingError::Transport(e) => write!(f, "transport: {}", e),
            SignalingError::NoLocalDescription => write!(f, "local description missing"),
            SignalingError::AnswerTimeout => write!(f, "answer timed out"),
            SignalingError::PeerGone => write!(f, "peer went away mid-round"),
        }
    }
}

impl std::error::Error for SignalingError {}

impl From<webrtc::Error> for SignalingError {
    fn from(e: webrtc::Error) -> Self {
        SignalingError::Engine(e)
    }
}

struct SignalingState {
    in_flight: bool,
    pending: bool,
}

/// Owns the room's slices and drives global signaling: every request funnels
/// into at most one running SDP round, with requests that arrive mid-round
/// coalescing into exactly one follow-up.
pub struct Mixer {
    room: Weak<Room>,
    slices: Mutex<HashMap<String, Arc<MixerSlice>>>,
    signaling: Mutex<SignalingState>,
}

impl Mixer {
    pub fn new(room: Weak<Room>) -> Arc<Mixer> {
        Arc::new(Mixer {
            room,
            slices: Mutex::new(HashMap::new()),
            signaling: Mutex::new(SignalingState {
                in_flight: false,
                pending: false,
            }),
        })
    }

    pub fn index_slice(&self, slice: Arc<MixerSlice>) {
        let mut slices = self.slices.lock().unwrap_or_else(|e| e.into_inner());
        slices.insert(slice.output_id().to_string(), slice);
    }

    pub fn slices(&self) -> Vec<Arc<MixerSlice>> {
        let slices = self.slices.lock().unwrap_or_else(|e| e.into_inner());
        slices.values().cloned().collect()
    }

    pub fn slice_count(&self) -> usize {
        self.slices.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Drop a slice: detach its senders from every destination peer and
    /// re-signal so clients drop the dead track.
    pub fn remove_slice(self: &Arc<Self>, slice: &Arc<MixerSlice>) {
        {
            let mut slices = self.slices.lock().unwrap_or_else(|e| e.into_inner());
            slices.remove(slice.output_id());
        }
        let Some(room) = self.room.upgrade() else {
            return;
        };
        for controller in slice.drain_controllers() {
            if let Some(ps) = room.peer_server(controller.to_user()) {
                let pc = ps.pc_wrapper().pc();
                let sender = controller.sender();
                tokio::spawn(async move {
                    let _ = pc.remove_track(&sender).await;
                });
            }
        }
        self.trigger_signaling("slice_removed", false);
    }

    /// Request a global signaling round. Single-flight: a round already in
    /// progress absorbs this request and guarantees one follow-up round.
    pub fn trigger_signaling(self: &Arc<Self>, cause: &'static str, delayed: bool) {
        let me = self.clone();
        tokio::spawn(async move {
            if delayed {
                tokio::time::sleep(SIGNALING_WARMUP_DELAY).await;
            }
            me.managed_global_signaling(cause).await;
        });
    }

    pub async fn managed_global_signaling(self: Arc<Self>, cause: &'static str) {
        {
            let mut state = self.signaling.lock().unwrap_or_else(|e| e.into_inner());
            if state.in_flight {
                state.pending = true;
                return;
            }
            state.in_flight = true;
        }
        loop {
            self.global_signaling_round(cause).await;
            let repeat = {
                let mut state = self.signaling.lock().unwrap_or_else(|e| e.into_inner());
                if state.pending {
                    state.pending = false;
                    true
                } else {
                    state.in_flight = false;
                    false
                }
            };
            if !repeat {
                break;
            }
        }
    }

    async fn global_signaling_round(&self, cause: &'static str) {
        let Some(room) = self.room.upgrade() else {
            return;
        };
        if room.end_token().is_cancelled() || room.is_deleted() {
            return;
        }
        info!(room = %room.id, cause = cause, "global_signaling");
        SIGNALING_ROUNDS_TOTAL.inc();

        let slices = self.slices();
        for ps in room.peer_servers() {
            for slice in &slices {
                if let Err(e) = slice.ensure_sender_for(ps.user_id(), &ps.pc_wrapper()).await {
                    error!(
                        user = %ps.user_id(),
                        track = %slice.output_id(),
                        error = %e,
                        "sender_attach_failed"
                    );
                }
            }
            if let Err(e) = self.negotiate(&ps).await {
                // this peer's round is abandoned; the rest of the room goes on
                warn!(user = %ps.user_id(), error = %e, "negotiation_failed");
            }
        }
    }

    /// offer → set-local → emit → await answer → set-remote, for one peer.
    async fn negotiate(&self, ps: &Arc<PeerServer>) -> Result<(), SignalingError> {
        let pc_wrapper = ps.pc_wrapper();
        let pc = pc_wrapper.pc();

        let offer = pc.create_offer(None).await?;
        let answer_rx = pc_wrapper.expect_answer();
        pc.set_local_description(offer).await?;
        let local = pc
            .local_description()
            .await
            .ok_or(SignalingError::NoLocalDescription)?;

        ps.ws()
            .send(&ServerMessage::Offer(local))
            .await
            .map_err(SignalingError::Transport)?;

        let answer = tokio::time::timeout(ANSWER_TIMEOUT, answer_rx)
            .await
            .map_err(|_| SignalingError::AnswerTimeout)?
            .map_err(|_| SignalingError::PeerGone)?;
        pc.set_remote_description(answer).await?;
        Ok(())
    }
}
