use std::fmt;
use std::sync::Arc;

/// A strongly typed identifier for a user.
/// Wraps an `Arc<str>` for cheap cloning across tasks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserId(pub Arc<str>);

/// A strongly typed identifier for a room, as requested by the client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomId(pub Arc<str>);

/// Store key for a room: `origin + "#" + roomId`. Two origins asking for the
/// same room id never share a room.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QualifiedRoomId(pub Arc<str>);

impl QualifiedRoomId {
    pub fn from_parts(origin: &str, room_id: &RoomId) -> Self {
        QualifiedRoomId(format!("{}#{}", origin, room_id).into())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for QualifiedRoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        UserId(s.into())
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        UserId(s.into())
    }
}

impl From<String> for RoomId {
    fn from(s: String) -> Self {
        RoomId(s.into())
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        RoomId(s.into())
    }
}

impl AsRef<str> for UserId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for RoomId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for QualifiedRoomId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
