use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::id_types::UserId;
use crate::peer_conn::PeerConn;
use crate::protocol::{ControlPayload, JoinRequest, PolyControlPayload, ServerMessage};
use crate::room::Room;
use crate::room_store::{JoinError, RoomStore};
use crate::ws::{JoinReadError, SignalingTransport, WsChannel};

/// Per-user controller binding one WebSocket, one peer connection and the
/// room for the lifetime of a connection.
pub struct PeerServer {
    user_id: UserId,
    join: JoinRequest,
    room: Arc<Room>,
    pc: Arc<PeerConn>,
    ws: Arc<WsChannel>,
    closed: CancellationToken,
    close_once: AtomicBool,
}

impl PeerServer {
    pub fn new(
        join: JoinRequest,
        room: Arc<Room>,
        pc: Arc<PeerConn>,
        ws: Arc<WsChannel>,
    ) -> Arc<PeerServer> {
        Arc::new(PeerServer {
            user_id: UserId::from(join.user_id.as_str()),
            join,
            room,
            pc,
            ws,
            closed: CancellationToken::new(),
            close_once: AtomicBool::new(false),
        })
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn join(&self) -> &JoinRequest {
        &self.join
    }

    pub fn ws(&self) -> Arc<WsChannel> {
        self.ws.clone()
    }

    pub fn pc_wrapper(&self) -> Arc<PeerConn> {
        self.pc.clone()
    }

    /// Closed when this user's session ends, whatever the cause.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Idempotent teardown: detach from the room, close the connection and
    /// the socket. Slices fed by this user observe `closed_token`.
    pub async fn close(self: &Arc<Self>, reason: &'static str) {
        if self.close_once.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(user = %self.user_id, reason = reason, "peer_server_closed");
        self.closed.cancel();
        self.room.disconnect_user(&self.user_id);
        self.pc.close().await;
        self.ws.close().await;
    }

    /// Sequential dispatch of inbound messages until the socket dies.
    pub async fn read_loop(self: &Arc<Self>) {
        loop {
            let message = tokio::select! {
                _ = self.closed.cancelled() => return,
                message = self.ws.receive() => message,
            };
            let Some(message) = message else {
                return;
            };
            match message.kind.as_str() {
                "candidate" => self.pc.add_ice_candidate(&message.payload).await,
                "answer" => {
                    match serde_json::from_str::<RTCSessionDescription>(&message.payload) {
                        Ok(answer) => self.pc.handle_answer(answer).await,
                        Err(e) => warn!(user = %self.user_id, error = %e, "unparsable_answer"),
                    }
                }
                "control" => match serde_json::from_str::<ControlPayload>(&message.payload) {
                    Ok(payload) => self.dispatch_control(payload),
                    Err(e) => warn!(user = %self.user_id, error = %e, "unparsable_control"),
                },
                "polyControl" => {
                    match serde_json::from_str::<PolyControlPayload>(&message.payload) {
                        Ok(payload) => self.pc.poly_control_fx(&payload),
                        Err(e) => warn!(user = %self.user_id, error = %e, "unparsable_poly_control"),
                    }
                }
                other => debug!(user = %self.user_id, kind = %other, "unknown_message_kind"),
            }
        }
    }

    /// `control.userId` selects whose pipeline is driven; absent or self means
    /// the sender's own.
    fn dispatch_control(&self, payload: ControlPayload) {
        let target_pc = match payload.user_id.as_deref() {
            Some(target) if target != self.user_id.as_ref() => {
                match self.room.peer_server(&UserId::from(target)) {
                    Some(target_ps) => target_ps.pc_wrapper(),
                    None => {
                        debug!(user = %self.user_id, target = %target, "control_target_absent");
                        return;
                    }
                }
            }
            _ => self.pc.clone(),
        };
        tokio::spawn(target_pc.control_fx(payload));
    }
}

/// Full lifetime of one client session: join handshake, room registration,
/// peer-connection wiring, then the dispatch loop.
pub async fn run_peer_server(
    origin: String,
    transport: Arc<dyn SignalingTransport>,
    store: Arc<RoomStore>,
) {
    let ws = Arc::new(WsChannel::new(transport));

    let join = match ws.read_join(&origin).await {
        Ok(join) => join,
        Err(JoinReadError::SocketClosed) => return,
        Err(e) => {
            warn!(error = %e, "join_rejected");
            let _ = ws.send(&ServerMessage::ErrorJoin).await;
            ws.close().await;
            return;
        }
    };

    let (room, _join_kind) = match store.join(&join).await {
        Ok(joined) => joined,
        Err(JoinError::Duplicate) => {
            let _ = ws.send(&ServerMessage::ErrorDuplicate).await;
            ws.close().await;
            return;
        }
        Err(JoinError::Full) => {
            let _ = ws.send(&ServerMessage::ErrorFull).await;
            ws.close().await;
            return;
        }
    };

    let streams = store.streams();
    let pc = match PeerConn::new(&join, &streams).await {
        Ok(pc) => pc,
        Err(e) => {
            error!(user = %join.user_id, error = %e, "peer_connection_setup_failed");
            // roll the registration back so the seat frees up
            room.disconnect_user(&UserId::from(join.user_id.as_str()));
            let _ = ws.send(&ServerMessage::ErrorJoin).await;
            ws.close().await;
            return;
        }
    };

    let ps = PeerServer::new(join, room.clone(), pc.clone(), ws);
    room.connect_peer_server(&ps);
    pc.register_handlers(&room, &ps, &ps.ws());
    room.mixer().trigger_signaling("peer_connected", false);

    ps.read_loop().await;
    ps.close("ws_ended").await;
}
