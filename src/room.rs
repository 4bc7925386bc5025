use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use webrtc::track::track_remote::TrackRemote;

use crate::helpers::random_hex_string;
use crate::id_types::{QualifiedRoomId, RoomId, UserId};
use crate::metrics::{ACTIVE_PEERS, ACTIVE_ROOMS, ROOMS_ENDED_TOTAL};
use crate::mixer::Mixer;
use crate::mixer_slice::{MixerSlice, SliceParams};
use crate::peer_server::PeerServer;
use crate::pipeline::PipelineConfig;
use crate::protocol::{JoinRequest, ServerMessage, TrackKind};
use crate::room_store::{JoinError, JoinKind, RoomStore};
use crate::ssrc_index::SsrcInfo;
use crate::types::AppContext;

pub const DEFAULT_SIZE: u32 = 2;
pub const MAX_SIZE: u32 = 8;
pub const TRACKS_PER_PEER: u32 = 2;
pub const DEFAULT_DURATION: u32 = 30;
pub const MAX_DURATION: u32 = 1200;
/// Seconds before the end at which clients are told the session is ending.
pub const ENDING: u64 = 15;
/// Grace left to slices between `end` fan-out and room deletion.
const END_GRACE: Duration = Duration::from_secs(3);

struct RoomState {
    peer_server_index: HashMap<UserId, Arc<PeerServer>>,
    /// true: connected, false: previously connected, absent: never seen.
    connected_index: HashMap<UserId, bool>,
    joined_count_index: HashMap<UserId, u32>,
    files_index: HashMap<UserId, Vec<String>>,
    running: bool,
    deleted: bool,
    started_at: Option<Instant>,
    in_tracks_ready_count: u32,
    out_tracks_ready_count: u32,
    ssrcs: Vec<u32>,
}

/// All the resources of one interaction, accepting exactly `size` attendees
/// for `duration` seconds.
pub struct Room {
    ctx: AppContext,
    store: Weak<RoomStore>,
    pub qualified_id: QualifiedRoomId,
    pub id: RoomId,
    /// Internal id, part of recorded file names.
    hid: String,
    pub namespace: String,
    pub size: u32,
    pub duration_secs: u32,
    needed_tracks: u32,
    created_at: Instant,
    mixer: Arc<Mixer>,
    /// Closed exactly once, when every expected inbound track is ready.
    wait_for_all: CancellationToken,
    /// Closed exactly once, when the countdown fires. Global cancellation signal.
    end: CancellationToken,
    state: RwLock<RoomState>,
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room").field("id", &self.id).finish()
    }
}

impl Room {
    pub fn new(
        ctx: AppContext,
        store: Weak<RoomStore>,
        qualified_id: QualifiedRoomId,
        join: &JoinRequest,
    ) -> Arc<Room> {
        let duration = if join.duration < 1 {
            DEFAULT_DURATION
        } else if join.duration > MAX_DURATION {
            MAX_DURATION
        } else {
            join.duration
        };
        let size = if join.size < 1 {
            DEFAULT_SIZE
        } else if join.size > MAX_SIZE {
            MAX_SIZE
        } else {
            join.size
        };

        // room starts out with its creator connected
        let creator = UserId::from(join.user_id.as_str());
        let mut connected_index = HashMap::new();
        connected_index.insert(creator.clone(), true);
        let mut joined_count_index = HashMap::new();
        joined_count_index.insert(creator, 1);

        let room = Arc::new_cyclic(|weak: &Weak<Room>| Room {
            ctx,
            store,
            qualified_id,
            id: RoomId::from(join.room_id.as_str()),
            hid: random_hex_string(12),
            namespace: join.namespace.clone(),
            size,
            duration_secs: duration,
            needed_tracks: size * TRACKS_PER_PEER,
            created_at: Instant::now(),
            mixer: Mixer::new(weak.clone()),
            wait_for_all: CancellationToken::new(),
            end: CancellationToken::new(),
            state: RwLock::new(RoomState {
                peer_server_index: HashMap::new(),
                connected_index,
                joined_count_index,
                files_index: HashMap::new(),
                running: false,
                deleted: false,
                started_at: None,
                in_tracks_ready_count: 0,
                out_tracks_ready_count: 0,
                ssrcs: Vec::new(),
            }),
        });
        ACTIVE_ROOMS.inc();
        info!(
            namespace = %room.namespace,
            room = %room.id,
            size = room.size,
            duration = room.duration_secs,
            "room_created"
        );
        room
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, RoomState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, RoomState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn mixer(&self) -> Arc<Mixer> {
        self.mixer.clone()
    }

    pub fn hid(&self) -> &str {
        &self.hid
    }

    pub fn end_token(&self) -> CancellationToken {
        self.end.clone()
    }

    pub fn wait_for_all_token(&self) -> CancellationToken {
        self.wait_for_all.clone()
    }

    pub fn is_running(&self) -> bool {
        self.read_state().running
    }

    pub fn is_deleted(&self) -> bool {
        self.read_state().deleted
    }

    pub fn in_tracks_ready_count(&self) -> u32 {
        self.read_state().in_tracks_ready_count
    }

    pub fn out_tracks_ready_count(&self) -> u32 {
        self.read_state().out_tracks_ready_count
    }

    pub fn needed_tracks(&self) -> u32 {
        self.needed_tracks
    }

    /// Users ever seen, connected or not.
    pub fn user_count(&self) -> usize {
        self.read_state().connected_index.len()
    }

    pub fn connected_user_count(&self) -> usize {
        self.read_state().peer_server_index.len()
    }

    pub fn connected(&self, user_id: &UserId) -> Option<bool> {
        self.read_state().connected_index.get(user_id).copied()
    }

    pub fn joined_count_for_user(&self, user_id: &UserId) -> u32 {
        self.read_state()
            .joined_count_index
            .get(user_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn peer_server(&self, user_id: &UserId) -> Option<Arc<PeerServer>> {
        self.read_state().peer_server_index.get(user_id).cloned()
    }

    pub fn peer_servers(&self) -> Vec<Arc<PeerServer>> {
        self.read_state()
            .peer_server_index
            .values()
            .cloned()
            .collect()
    }

    /// Called by the store, under the store mutex, while it still indexes this
    /// room. Existing-user policy for a subsequent join.
    pub(crate) fn register_user(&self, user_id: &UserId) -> Result<JoinKind, JoinError> {
        let mut state = self.write_state();
        match state.connected_index.get(user_id).copied() {
            // same user already live (second tab or device)
            Some(true) => Err(JoinError::Duplicate),
            Some(false) => {
                state.connected_index.insert(user_id.clone(), true);
                *state.joined_count_index.entry(user_id.clone()).or_insert(0) += 1;
                Ok(JoinKind::Reconnected)
            }
            None => {
                if state.connected_index.len() as u32 == self.size {
                    Err(JoinError::Full)
                } else {
                    state.connected_index.insert(user_id.clone(), true);
                    state.joined_count_index.insert(user_id.clone(), 1);
                    Ok(JoinKind::Joined)
                }
            }
        }
    }

    pub fn connect_peer_server(&self, ps: &Arc<PeerServer>) {
        let mut state = self.write_state();
        state
            .peer_server_index
            .insert(ps.user_id().clone(), ps.clone());
        ACTIVE_PEERS.inc();
    }

    /// Idempotent per connection: only acts while the user is marked connected.
    pub fn disconnect_user(self: &Arc<Self>, user_id: &UserId) {
        let should_delete = {
            let mut state = self.write_state();
            if state.connected_index.get(user_id).copied() != Some(true) {
                return;
            }
            state.peer_server_index.remove(user_id);
            state.connected_index.insert(user_id.clone(), false);
            ACTIVE_PEERS.dec();
            // users may have disconnected temporarily: delete only when the
            // room is empty and never started running
            state.peer_server_index.is_empty() && !state.running && !state.deleted
        };
        info!(
            namespace = %self.namespace,
            room = %self.id,
            user = %user_id,
            since_creation = ?self.created_at.elapsed(),
            "user_disconnected"
        );
        self.mixer.trigger_signaling("user_disconnected", false);
        if should_delete {
            if let Some(store) = self.store.upgrade() {
                let room = self.clone();
                tokio::spawn(async move {
                    store.delete_room(&room).await;
                });
            }
        }
    }

    pub fn add_files(&self, user_id: &UserId, files: Vec<String>) {
        if files.is_empty() {
            return;
        }
        let mut state = self.write_state();
        state
            .files_index
            .entry(user_id.clone())
            .or_default()
            .extend(files);
    }

    pub fn files(&self) -> HashMap<String, Vec<String>> {
        self.read_state()
            .files_index
            .iter()
            .map(|(user, files)| (user.to_string(), files.clone()))
            .collect()
    }

    /// Prefix for this user's recorded artifacts. Time reflects the moment the
    /// pipeline is initialized; rely on OS file properties when several files
    /// need synchronizing.
    pub fn file_prefix(&self, user_id: &UserId) -> String {
        let connection_count = self.joined_count_for_user(user_id);
        format!(
            "{}-n-{}-i-{}-r-{}-u-{}-c-{}",
            chrono::Local::now().format("%Y%m%d-%H%M%S%.3f"),
            self.namespace,
            self.hid,
            self.id,
            user_id,
            connection_count
        )
    }

    /// Seconds until clients should show their pre-end UI; always at least 1.
    pub fn ending_delay(&self) -> u64 {
        let state = self.read_state();
        let elapsed = state
            .started_at
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0);
        let remaining = i64::from(self.duration_secs) - elapsed as i64;
        let delay = remaining - ENDING as i64;
        if delay < 1 {
            1
        } else {
            delay as u64
        }
    }

    fn remaining_secs(&self) -> u64 {
        let state = self.read_state();
        let elapsed = state
            .started_at
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0);
        u64::from(self.duration_secs).saturating_sub(elapsed)
    }

    pub fn add_ssrc(&self, ssrc: u32, kind: TrackKind, user_id: UserId) {
        {
            let mut state = self.write_state();
            state.ssrcs.push(ssrc);
        }
        // SSRC index is a leaf lock, taken after the room lock is released
        self.ctx.ssrc_index.add(
            ssrc,
            SsrcInfo {
                kind,
                namespace: self.namespace.clone(),
                room_id: self.id.clone(),
                user_id,
            },
        );
    }

    /// Count one ready inbound track. Reaching the barrier starts the room:
    /// close `waitForAllCh`, fan `start` out, arm the countdown. Past the
    /// barrier (reconnection) only a single `start` goes back, keyed on the
    /// audio track so one peer never gets two.
    pub fn inc_in_tracks_ready(self: &Arc<Self>, from_ps: &Arc<PeerServer>, kind: TrackKind) {
        let to_notify: Vec<Arc<PeerServer>>;
        {
            let mut state = self.write_state();
            if state.in_tracks_ready_count == self.needed_tracks {
                if kind == TrackKind::Audio {
                    let ws = from_ps.ws();
                    tokio::spawn(async move {
                        let _ = ws.send(&ServerMessage::Start).await;
                    });
                }
                return;
            }

            state.in_tracks_ready_count += 1;
            info!(
                namespace = %self.namespace,
                room = %self.id,
                count = state.in_tracks_ready_count,
                since_creation = ?self.created_at.elapsed(),
                "in_track_added_to_room"
            );
            if state.in_tracks_ready_count < self.needed_tracks {
                return;
            }

            state.running = true;
            state.started_at = Some(Instant::now());
            self.wait_for_all.cancel();
            to_notify = state.peer_server_index.values().cloned().collect();
        }

        info!(
            namespace = %self.namespace,
            room = %self.id,
            since_creation = ?self.created_at.elapsed(),
            "room_started"
        );
        for ps in to_notify {
            let ws = ps.ws();
            tokio::spawn(async move {
                let _ = ws.send(&ServerMessage::Start).await;
            });
        }
        let room = self.clone();
        tokio::spawn(async move {
            room.countdown().await;
        });
        let room = self.clone();
        tokio::spawn(async move {
            room.ending_notifier().await;
        });
    }

    /// Whether this out-track readiness tick warrants a signaling round: once
    /// at warm-up when every expected output exists, and while running on each
    /// even count so reconnecting audio+video pairs come back atomically.
    pub fn inc_out_tracks_ready(&self) -> bool {
        let mut state = self.write_state();
        state.out_tracks_ready_count += 1;
        if state.out_tracks_ready_count == self.needed_tracks {
            return true;
        }
        if state.running && state.out_tracks_ready_count % 2 == 0 {
            return true;
        }
        false
    }

    pub fn dec_out_tracks_ready(&self) {
        let mut state = self.write_state();
        state.out_tracks_ready_count = state.out_tracks_ready_count.saturating_sub(1);
    }

    async fn countdown(self: Arc<Self>) {
        tokio::time::sleep(Duration::from_secs(u64::from(self.duration_secs))).await;

        let (recipients, files, started_at) = {
            let mut state = self.write_state();
            state.running = false;
            let recipients: Vec<Arc<PeerServer>> =
                state.peer_server_index.values().cloned().collect();
            let files: HashMap<String, Vec<String>> = state
                .files_index
                .iter()
                .map(|(user, files)| (user.to_string(), files.clone()))
                .collect();
            (recipients, files, state.started_at)
        };

        info!(
            namespace = %self.namespace,
            room = %self.id,
            since_creation = ?self.created_at.elapsed(),
            since_start = ?started_at.map(|t| t.elapsed()),
            "room_ended"
        );
        ROOMS_ENDED_TOTAL.inc();
        for ps in recipients {
            let ws = ps.ws();
            let files = files.clone();
            tokio::spawn(async move {
                let _ = ws.send(&ServerMessage::End(files)).await;
            });
        }

        // listened to by peer servers, the mixer and every slice
        self.end.cancel();

        tokio::time::sleep(END_GRACE).await;
        // most likely already deleted via disconnects, except when the room
        // emptied before running turned false
        if let Some(store) = self.store.upgrade() {
            store.delete_room(&self).await;
        }
    }

    async fn ending_notifier(self: Arc<Self>) {
        tokio::time::sleep(Duration::from_secs(self.ending_delay())).await;
        if self.end.is_cancelled() {
            return;
        }
        let remaining = self.remaining_secs();
        for ps in self.peer_servers() {
            let ws = ps.ws();
            tokio::spawn(async move {
                let _ = ws.send(&ServerMessage::Ending(remaining)).await;
            });
        }
    }

    /// Store-side cleanup, called under the store mutex. Returns false when
    /// the room was already deleted, making deletion idempotent.
    pub(crate) fn mark_deleted_and_cleanup(&self) -> bool {
        let (ssrcs, started_at) = {
            let mut state = self.write_state();
            if state.deleted {
                return false;
            }
            state.deleted = true;
            (std::mem::take(&mut state.ssrcs), state.started_at)
        };
        for ssrc in ssrcs {
            self.ctx.ssrc_index.remove(ssrc);
        }
        ACTIVE_ROOMS.dec();
        info!(
            namespace = %self.namespace,
            room = %self.id,
            since_creation = ?self.created_at.elapsed(),
            since_start = ?started_at.map(|t| t.elapsed()),
            "room_deleted"
        );
        true
    }

    /// Drain (and discard) inbound RTP until every peer has published every
    /// expected track, keeping ICE/DTLS warm. False when the track dies first.
    async fn read_remote_till_all_ready(&self, track: &Arc<TrackRemote>) -> bool {
        loop {
            tokio::select! {
                _ = self.wait_for_all.cancelled() => return true,
                result = track.read_rtp() => {
                    if let Err(e) = result {
                        error!(
                            namespace = %self.namespace,
                            room = %self.id,
                            error = %e,
                            "read_remote_till_all_ready_failed"
                        );
                        return false;
                    }
                }
            }
        }
    }

    /// The inbound-track pathway: count readiness, build the slice and its
    /// pipeline, hold at the barrier, then feed until the session ends.
    pub async fn run_mixer_slice_from_remote(
        self: Arc<Self>,
        ps: Arc<PeerServer>,
        track: Arc<TrackRemote>,
        kind: TrackKind,
    ) {
        self.inc_in_tracks_ready(&ps, kind);

        let join = ps.join();
        let capability = track.codec().capability.clone();
        let codec = capability
            .mime_type
            .split('/')
            .nth(1)
            .unwrap_or_default()
            .to_string();
        let stream = match kind {
            TrackKind::Audio => self.ctx.streams.audio,
            TrackKind::Video => self.ctx.streams.video,
        };
        let pipeline_config = PipelineConfig {
            id: format!("{}-{}-{}", kind, ps.user_id(), random_hex_string(8)),
            file_prefix: self.file_prefix(ps.user_id()),
            kind,
            codec,
            width: join.width(),
            height: join.height(),
            frame_rate: join.frame_rate(),
            fx: join.fx(kind).to_string(),
            recording_mode: join.recording_mode(),
            stream,
        };
        let pipeline = match self.ctx.pipeline_factory.create(pipeline_config) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                error!(
                    namespace = %self.namespace,
                    room = %self.id,
                    user = %ps.user_id(),
                    error = %e,
                    "new_mixer_slice_failed"
                );
                ps.close("pipeline_create_failed").await;
                self.mixer.trigger_signaling("pipeline_failure", false);
                return;
            }
        };
        self.ctx.pipeline_store.add(pipeline.clone());
        // control messages address pipelines through the peer connection
        ps.pc_wrapper().set_pipeline(kind, pipeline.clone());

        let slice = MixerSlice::new(SliceParams {
            from_user: ps.user_id().clone(),
            origin_pc: ps.pc_wrapper(),
            origin_closed: ps.closed_token(),
            kind,
            capability,
            pipeline,
            stream,
            audio_max_bitrate: self.ctx.streams.audio.max_bitrate,
            encoder_control_period_ms: self.ctx.streams.encoder_control_period_ms,
            gcc: self.ctx.config.gcc,
        });
        self.mixer.index_slice(slice.clone());

        if !self.read_remote_till_all_ready(&track).await {
            self.mixer.remove_slice(&slice);
            self.ctx.pipeline_store.remove(slice.output_id());
            slice.stop().await;
            return;
        }

        if let Err(e) = slice.start_pipeline().await {
            error!(
                namespace = %self.namespace,
                room = %self.id,
                user = %ps.user_id(),
                error = %e,
                "pipeline_start_failed"
            );
            self.mixer.remove_slice(&slice);
            self.ctx.pipeline_store.remove(slice.output_id());
            slice.stop().await;
            ps.close("pipeline_start_failed").await;
            return;
        }
        self.add_files(ps.user_id(), slice.pipeline().files());
        slice.spawn_output_loops();

        if self.inc_out_tracks_ready() {
            self.mixer.trigger_signaling("out_tracks_ready", true);
        }

        // blocks until the room ends or the publisher disconnects
        slice.run(self.end.clone(), track).await;

        self.mixer.remove_slice(&slice);
        self.ctx.pipeline_store.remove(slice.output_id());
        self.dec_out_tracks_ready();
    }
}
