use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use crate::config::StreamsConfig;
use crate::helpers::ensure_dir;
use crate::id_types::{QualifiedRoomId, UserId};
use crate::protocol::JoinRequest;
use crate::room::Room;
use crate::types::AppContext;

/// How a join request related to existing room state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Created,
    Joined,
    Reconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinError {
    /// Same user already live in the room.
    Duplicate,
    /// Room already met its size.
    Full,
}

impl std::fmt::Display for JoinError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JoinError::Duplicate => write!(f, "duplicate"),
            JoinError::Full => write!(f, "full"),
        }
    }
}

impl std::error::Error for JoinError {}

/// Qualified-room-id → room map with the create-or-join policy.
/// Lock order: this mutex first, then the room's own lock — including on
/// deletion, which always enters here.
pub struct RoomStore {
    ctx: AppContext,
    index: Mutex<HashMap<QualifiedRoomId, Arc<Room>>>,
}

impl RoomStore {
    pub fn new(ctx: AppContext) -> Arc<RoomStore> {
        Arc::new(RoomStore {
            ctx,
            index: Mutex::new(HashMap::new()),
        })
    }

    pub fn streams(&self) -> Arc<StreamsConfig> {
        self.ctx.streams.clone()
    }

    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    /// Create-or-join, atomic under the store mutex.
    pub async fn join(
        self: &Arc<Self>,
        join: &JoinRequest,
    ) -> Result<(Arc<Room>, JoinKind), JoinError> {
        let qualified_id = join.qualified_room_id();
        let user_id = UserId::from(join.user_id.as_str());

        let room = {
            let mut index = self.index.lock().await;
            if let Some(room) = index.get(&qualified_id) {
                let kind = room.register_user(&user_id)?;
                info!(
                    namespace = %room.namespace,
                    room = %room.id,
                    user = %user_id,
                    kind = ?kind,
                    "user_joined"
                );
                return Ok((room.clone(), kind));
            }

            let room = Room::new(
                self.ctx.clone(),
                Arc::downgrade(self),
                qualified_id.clone(),
                join,
            );
            info!(
                namespace = %room.namespace,
                room = %room.id,
                user = %user_id,
                origin = %join.origin,
                "room_created_for_user"
            );
            index.insert(qualified_id, room.clone());
            room
        };

        // data directories for recordings and encoder multipass caches;
        // blocking fs work stays off the store lock
        let namespace = room.namespace.clone();
        tokio::task::spawn_blocking(move || {
            ensure_dir(&format!("./data/{}", namespace));
            ensure_dir(&format!("./data/{}/logs", namespace));
        });

        Ok((room, JoinKind::Created))
    }

    /// Idempotent: a second delete of the same room is a no-op. Frees the
    /// qualified id for a fresh room.
    pub async fn delete_room(&self, room: &Arc<Room>) {
        let mut index = self.index.lock().await;
        if room.mark_deleted_and_cleanup() {
            index.remove(&room.qualified_id);
        }
    }

    pub async fn find(&self, qualified_id: &QualifiedRoomId) -> Option<Arc<Room>> {
        self.index.lock().await.get(qualified_id).cloned()
    }

    pub async fn count(&self) -> usize {
        self.index.lock().await.len()
    }
}
