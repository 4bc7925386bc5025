use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

use crate::id_types::{QualifiedRoomId, RoomId};

pub const MAX_PARSED_LENGTH: usize = 50;
pub const MAX_NAMESPACE_LENGTH: usize = 30;
pub const DEFAULT_WIDTH: u32 = 800;
pub const DEFAULT_HEIGHT: u32 = 600;
pub const DEFAULT_FRAME_RATE: u32 = 30;

/// Media kind of a track, on the wire and in slice bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }

    pub fn from_codec_type(t: RTPCodecType) -> Option<TrackKind> {
        match t {
            RTPCodecType::Audio => Some(TrackKind::Audio),
            RTPCodecType::Video => Some(TrackKind::Video),
            _ => None,
        }
    }
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoFormat {
    Vp8,
    H264,
}

impl VideoFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            VideoFormat::Vp8 => "video/VP8",
            VideoFormat::H264 => "video/H264",
        }
    }

    pub fn codec_name(&self) -> &'static str {
        match self {
            VideoFormat::Vp8 => "VP8",
            VideoFormat::H264 => "H264",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingMode {
    Muxed,
    Split,
    Passthrough,
    None,
}

/// Strip anything outside `[a-zA-Z0-9-_]`, fall back to "default" when
/// nothing survives, and bound the length. Idempotent.
pub fn parse_string(input: &str) -> String {
    let clean: String = input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if clean.is_empty() {
        return "default".to_string();
    }
    clean.chars().take(MAX_PARSED_LENGTH).collect()
}

/// Namespace variant: underscores are also rejected and the bound is shorter.
pub fn parse_namespace(input: &str) -> String {
    let clean: String = input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect();
    if clean.is_empty() {
        return "default".to_string();
    }
    clean.chars().take(MAX_NAMESPACE_LENGTH).collect()
}

/// The payload of the first message of every session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JoinRequest {
    pub namespace: String,
    pub interaction_name: String,
    pub user_id: String,
    pub room_id: String,
    /// Server-assigned from the HTTP Origin header, never trusted from the client.
    #[serde(skip)]
    pub origin: String,
    pub size: u32,
    pub duration: u32,
    pub video_format: String,
    pub recording_mode: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub audio_fx: String,
    pub video_fx: String,
}

impl JoinRequest {
    /// Restrict client-supplied strings to authorized values and bind the
    /// server-side origin.
    pub fn sanitized(mut self, origin: &str) -> JoinRequest {
        self.namespace = parse_namespace(&self.namespace);
        self.interaction_name = parse_string(&self.interaction_name);
        self.user_id = parse_string(&self.user_id);
        self.origin = origin.to_string();
        self
    }

    pub fn qualified_room_id(&self) -> QualifiedRoomId {
        QualifiedRoomId::from_parts(&self.origin, &RoomId::from(self.room_id.as_str()))
    }

    pub fn video_format(&self) -> VideoFormat {
        match self.video_format.as_str() {
            "H264" => VideoFormat::H264,
            _ => VideoFormat::Vp8,
        }
    }

    pub fn recording_mode(&self) -> RecordingMode {
        match self.recording_mode.as_str() {
            "muxed" => RecordingMode::Muxed,
            "split" => RecordingMode::Split,
            "passthrough" => RecordingMode::Passthrough,
            "none" => RecordingMode::None,
            _ => RecordingMode::Muxed,
        }
    }

    pub fn width(&self) -> u32 {
        if self.width == 0 {
            DEFAULT_WIDTH
        } else {
            self.width
        }
    }

    pub fn height(&self) -> u32 {
        if self.height == 0 {
            DEFAULT_HEIGHT
        } else {
            self.height
        }
    }

    pub fn frame_rate(&self) -> u32 {
        if self.frame_rate == 0 {
            DEFAULT_FRAME_RATE
        } else {
            self.frame_rate
        }
    }

    pub fn fx(&self, kind: TrackKind) -> &str {
        match kind {
            TrackKind::Audio => &self.audio_fx,
            TrackKind::Video => &self.video_fx,
        }
    }
}

/// Inbound envelope. The payload is a JSON-encoded string whose shape depends
/// on `kind`.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageIn {
    pub kind: String,
    #[serde(default)]
    pub payload: String,
}

/// Outbound envelope, serialized as `{"kind": ..., "payload": ...}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "payload", rename_all = "camelCase")]
pub enum ServerMessage {
    Candidate(String),
    Offer(RTCSessionDescription),
    Start,
    Ending(u64),
    End(HashMap<String, Vec<String>>),
    #[serde(rename = "error-join")]
    ErrorJoin,
    #[serde(rename = "error-duplicate")]
    ErrorDuplicate,
    #[serde(rename = "error-full")]
    ErrorFull,
}

/// Typed effect-property change, optionally interpolated over `duration` ms.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlPayload {
    /// Target user whose pipeline is controlled; defaults to the sender.
    #[serde(default)]
    pub user_id: Option<String>,
    pub kind: TrackKind,
    pub name: String,
    pub property: String,
    pub value: f32,
    #[serde(default)]
    pub duration: u64,
}

/// Untyped effect-property change, applied immediately.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolyControlPayload {
    pub name: String,
    pub property: String,
    pub kind: TrackKind,
    pub value: serde_json::Value,
}

impl PolyControlPayload {
    /// String rendering handed to the pipeline; bare strings lose their quotes.
    pub fn value_as_string(&self) -> String {
        match &self.value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_string_strips_and_defaults() {
        assert_eq!(parse_string("user/../1*"), "user1");
        assert_eq!(parse_string("ok-id_9"), "ok-id_9");
        assert_eq!(parse_string("///"), "default");
        assert_eq!(parse_string(""), "default");
    }

    #[test]
    fn test_parse_string_truncates() {
        let long = "a".repeat(120);
        assert_eq!(parse_string(&long).len(), MAX_PARSED_LENGTH);
    }

    #[test]
    fn test_parse_string_idempotent() {
        for input in ["user/../1*", "", "x".repeat(200).as_str(), "plain"] {
            let once = parse_string(input);
            assert_eq!(parse_string(&once), once);
        }
    }

    #[test]
    fn test_parse_namespace_rejects_underscore() {
        assert_eq!(parse_namespace("my_ns"), "myns");
        assert_eq!(parse_namespace(&"n".repeat(99)).len(), MAX_NAMESPACE_LENGTH);
    }

    #[test]
    fn test_join_request_defaults() {
        let join: JoinRequest = serde_json::from_str(r#"{"roomId":"r1","userId":"u1"}"#).unwrap();
        let join = join.sanitized("https://origin.example");
        assert_eq!(join.namespace, "default");
        assert_eq!(join.width(), DEFAULT_WIDTH);
        assert_eq!(join.height(), DEFAULT_HEIGHT);
        assert_eq!(join.frame_rate(), DEFAULT_FRAME_RATE);
        assert_eq!(join.video_format(), VideoFormat::Vp8);
        assert_eq!(join.recording_mode(), RecordingMode::Muxed);
        assert_eq!(
            join.qualified_room_id().as_ref(),
            "https://origin.example#r1"
        );
    }

    #[test]
    fn test_join_request_invalid_enum_values_fall_back() {
        let join: JoinRequest = serde_json::from_str(
            r#"{"roomId":"r","userId":"u","videoFormat":"AV1","recordingMode":"weird"}"#,
        )
        .unwrap();
        assert_eq!(join.video_format(), VideoFormat::Vp8);
        assert_eq!(join.recording_mode(), RecordingMode::Muxed);
    }

    #[test]
    fn test_server_message_envelope_shape() {
        let text = serde_json::to_string(&ServerMessage::Ending(15)).unwrap();
        assert_eq!(text, r#"{"kind":"ending","payload":15}"#);
        let text = serde_json::to_string(&ServerMessage::ErrorDuplicate).unwrap();
        assert_eq!(text, r#"{"kind":"error-duplicate"}"#);
        let text = serde_json::to_string(&ServerMessage::Start).unwrap();
        assert_eq!(text, r#"{"kind":"start"}"#);
    }

    #[test]
    fn test_control_payload_parses() {
        let p: ControlPayload = serde_json::from_str(
            r#"{"kind":"audio","name":"reverb","property":"gain","value":0.5,"duration":800}"#,
        )
        .unwrap();
        assert_eq!(p.kind, TrackKind::Audio);
        assert_eq!(p.duration, 800);
        assert!(p.user_id.is_none());
    }

    #[test]
    fn test_poly_control_value_rendering() {
        let p: PolyControlPayload = serde_json::from_str(
            r#"{"kind":"video","name":"overlay","property":"text","value":"hello"}"#,
        )
        .unwrap();
        assert_eq!(p.value_as_string(), "hello");
        let p: PolyControlPayload = serde_json::from_str(
            r#"{"kind":"video","name":"overlay","property":"visible","value":true}"#,
        )
        .unwrap();
        assert_eq!(p.value_as_string(), "true");
    }
}
