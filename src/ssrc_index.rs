use dashmap::DashMap;

use crate::id_types::{RoomId, UserId};
use crate::protocol::TrackKind;

/// What a given RTP synchronization source belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsrcInfo {
    pub kind: TrackKind,
    pub namespace: String,
    pub room_id: RoomId,
    pub user_id: UserId,
}

/// Process-wide SSRC → stream-identity map.
///
/// A leaf in the lock hierarchy: never held while taking any other lock.
/// Constructed at startup and passed in, so tests get isolated instances.
pub struct SsrcIndex {
    index: DashMap<u32, SsrcInfo>,
}

impl SsrcIndex {
    pub fn new() -> Self {
        SsrcIndex {
            index: DashMap::new(),
        }
    }

    pub fn add(&self, ssrc: u32, info: SsrcInfo) {
        self.index.insert(ssrc, info);
    }

    pub fn remove(&self, ssrc: u32) {
        self.index.remove(&ssrc);
    }

    pub fn find(&self, ssrc: u32) -> Option<SsrcInfo> {
        self.index.get(&ssrc).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

impl Default for SsrcIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_find_remove() {
        let index = SsrcIndex::new();
        let info = SsrcInfo {
            kind: TrackKind::Video,
            namespace: "default".to_string(),
            room_id: RoomId::from("r1"),
            user_id: UserId::from("u1"),
        };
        index.add(42, info.clone());
        assert_eq!(index.find(42), Some(info));
        index.remove(42);
        assert_eq!(index.find(42), None);
        assert!(index.is_empty());
    }
}
