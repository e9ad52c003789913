//! Wire protocol shared by the relay server and its peers.
//!
//! Every message on either transport is the same JSON envelope:
//! a `type` tag, a sender-side `timestamp` and an opaque `data` object.
//! The datagram transport adds `player_id` and `sequence` to the envelope.
//! How envelopes are delimited on the wire lives in [`codec`].

pub mod codec;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub use codec::CodecError;

/// Largest stream frame body accepted or produced (1 MiB).
pub const MAX_FRAME_LEN: u32 = 1024 * 1024;
/// Datagrams above this size are still sent, but risk IP fragmentation.
pub const DATAGRAM_SOFT_LIMIT: usize = 1400;
/// Members a room can hold.
pub const ROOM_CAPACITY: usize = 2;

/// Loosely-typed message body. The relay only reads a handful of keys from it.
pub type Payload = Map<String, Value>;

/// Machine-readable codes carried in `error` messages.
pub mod error_codes {
    pub const ROOM_EXISTS: &str = "ROOM_EXISTS";
    pub const ROOM_NOT_FOUND: &str = "ROOM_NOT_FOUND";
    pub const INVALID_PASSWORD: &str = "INVALID_PASSWORD";
    pub const ROOM_FULL: &str = "ROOM_FULL";
    pub const INVALID_ROOM_ID: &str = "INVALID_ROOM_ID";
    pub const ALREADY_IN_ROOM: &str = "ALREADY_IN_ROOM";
    pub const UNKNOWN_MESSAGE: &str = "UNKNOWN_MESSAGE";
    /// The requester was evicted while its room request was in flight.
    pub const SESSION_GONE: &str = "SESSION_GONE";
}

/// Message catalog. Tags outside the catalog survive decoding as `Other`
/// so the server can answer them with `UNKNOWN_MESSAGE` instead of treating
/// them as malformed input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    Connect,
    Disconnect,
    Heartbeat,
    CreateRoom,
    JoinRoom,
    LeaveRoom,
    ListRooms,
    RoomInfo,
    GameStart,
    GameState,
    PlayerAction,
    GameOver,
    ChatMessage,
    Error,
    Other(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Connect => "connect",
            MessageType::Disconnect => "disconnect",
            MessageType::Heartbeat => "heartbeat",
            MessageType::CreateRoom => "create_room",
            MessageType::JoinRoom => "join_room",
            MessageType::LeaveRoom => "leave_room",
            MessageType::ListRooms => "list_rooms",
            MessageType::RoomInfo => "room_info",
            MessageType::GameStart => "game_start",
            MessageType::GameState => "game_state",
            MessageType::PlayerAction => "player_action",
            MessageType::GameOver => "game_over",
            MessageType::ChatMessage => "chat_message",
            MessageType::Error => "error",
            MessageType::Other(tag) => tag,
        }
    }
}

impl From<String> for MessageType {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "connect" => MessageType::Connect,
            "disconnect" => MessageType::Disconnect,
            "heartbeat" => MessageType::Heartbeat,
            "create_room" => MessageType::CreateRoom,
            "join_room" => MessageType::JoinRoom,
            "leave_room" => MessageType::LeaveRoom,
            "list_rooms" => MessageType::ListRooms,
            "room_info" => MessageType::RoomInfo,
            "game_start" => MessageType::GameStart,
            "game_state" => MessageType::GameState,
            "player_action" => MessageType::PlayerAction,
            "game_over" => MessageType::GameOver,
            "chat_message" => MessageType::ChatMessage,
            "error" => MessageType::Error,
            _ => MessageType::Other(tag),
        }
    }
}

impl From<MessageType> for String {
    fn from(kind: MessageType) -> Self {
        match kind {
            MessageType::Other(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The protocol envelope exchanged on both transports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub timestamp: f64,
    #[serde(rename = "data", default, deserialize_with = "payload_or_null")]
    pub payload: Payload,
    /// Datagram envelope only.
    #[serde(
        rename = "player_id",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sender_id: Option<String>,
    /// Datagram envelope only; 0 means "no ordering requested".
    #[serde(default, skip_serializing_if = "is_zero")]
    pub sequence: u32,
}

fn is_zero(sequence: &u32) -> bool {
    *sequence == 0
}

fn payload_or_null<'de, D>(deserializer: D) -> Result<Payload, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Payload>::deserialize(deserializer)?.unwrap_or_default())
}

impl Message {
    /// Creates a message stamped with the current time.
    pub fn new(kind: MessageType, payload: Payload) -> Self {
        Self {
            kind,
            timestamp: now_timestamp(),
            payload,
            sender_id: None,
            sequence: 0,
        }
    }

    /// Builds a message from a `serde_json::json!` object. Non-object values
    /// produce an empty payload.
    pub fn with_data(kind: MessageType, data: Value) -> Self {
        let payload = match data {
            Value::Object(map) => map,
            _ => Payload::new(),
        };
        Self::new(kind, payload)
    }

    pub fn connect(player_name: &str) -> Self {
        Self::with_data(
            MessageType::Connect,
            serde_json::json!({ "player_name": player_name }),
        )
    }

    pub fn create_room(room_id: &str, password: Option<&str>) -> Self {
        Self::room_request(MessageType::CreateRoom, room_id, password)
    }

    pub fn join_room(room_id: &str, password: Option<&str>) -> Self {
        Self::room_request(MessageType::JoinRoom, room_id, password)
    }

    fn room_request(kind: MessageType, room_id: &str, password: Option<&str>) -> Self {
        let mut message = Self::with_data(kind, serde_json::json!({ "room_id": room_id }));
        if let Some(password) = password.filter(|p| !p.is_empty()) {
            message
                .payload
                .insert("password".to_string(), Value::from(password));
        }
        message
    }

    pub fn chat(text: &str) -> Self {
        Self::with_data(
            MessageType::ChatMessage,
            serde_json::json!({ "message": text }),
        )
    }

    pub fn error(error_code: &str, error_message: &str) -> Self {
        Self::with_data(
            MessageType::Error,
            serde_json::json!({
                "error_code": error_code,
                "error_message": error_message,
            }),
        )
    }

    /// Attaches the datagram envelope fields.
    pub fn sequenced(mut self, sender_id: Option<String>, sequence: u32) -> Self {
        self.sender_id = sender_id;
        self.sequence = sequence;
        self
    }

    /// Reads a string field from the payload.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// `error_code` of an `error` message.
    pub fn error_code(&self) -> Option<&str> {
        match self.kind {
            MessageType::Error => self.str_field("error_code"),
            _ => None,
        }
    }
}

/// Seconds since the Unix epoch as a float, the envelope's timestamp format.
pub fn now_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use serde_json::json;

    #[test]
    fn test_message_type_tags() {
        let kinds = [
            MessageType::Connect,
            MessageType::CreateRoom,
            MessageType::ListRooms,
            MessageType::PlayerAction,
            MessageType::ChatMessage,
            MessageType::Error,
        ];

        for kind in kinds {
            let tag: String = kind.clone().into();
            assert_eq!(MessageType::from(tag), kind);
        }
        assert_eq!(MessageType::GameState.as_str(), "game_state");
    }

    #[test]
    fn test_unknown_type_is_preserved() {
        let message: Message =
            serde_json::from_str(r#"{"type":"teleport","timestamp":1.5,"data":{}}"#).unwrap();

        assert_eq!(message.kind, MessageType::Other("teleport".to_string()));
        assert_eq!(message.kind.to_string(), "teleport");
    }

    #[test]
    fn test_envelope_field_names() {
        let message = Message::chat("hi").sequenced(Some("udp_player_1_ab".to_string()), 7);
        let value = serde_json::to_value(&message).unwrap();

        assert_eq!(value["type"], "chat_message");
        assert_eq!(value["data"]["message"], "hi");
        assert_eq!(value["player_id"], "udp_player_1_ab");
        assert_eq!(value["sequence"], 7);
    }

    #[test]
    fn test_stream_envelope_omits_datagram_fields() {
        let value = serde_json::to_value(Message::connect("alice")).unwrap();

        assert!(value.get("player_id").is_none());
        assert!(value.get("sequence").is_none());
    }

    #[test]
    fn test_missing_and_null_data() {
        let message: Message = serde_json::from_str(r#"{"type":"heartbeat"}"#).unwrap();
        assert!(message.payload.is_empty());
        assert_eq!(message.timestamp, 0.0);
        assert_eq!(message.sequence, 0);

        let message: Message =
            serde_json::from_str(r#"{"type":"heartbeat","timestamp":2.0,"data":null}"#).unwrap();
        assert!(message.payload.is_empty());
    }

    #[test]
    fn test_missing_type_is_rejected() {
        let result = serde_json::from_str::<Message>(r#"{"timestamp":1.0,"data":{}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_room_request_password() {
        let public = Message::create_room("r1", None);
        assert_eq!(public.str_field("room_id"), Some("r1"));
        assert!(public.payload.get("password").is_none());

        let empty = Message::join_room("r1", Some(""));
        assert!(empty.payload.get("password").is_none());

        let private = Message::join_room("r1", Some("abc"));
        assert_eq!(private.str_field("password"), Some("abc"));
    }

    #[test]
    fn test_error_message_shape() {
        let message = Message::error(error_codes::ROOM_FULL, "room is full");

        assert_eq!(message.kind, MessageType::Error);
        assert_eq!(message.error_code(), Some("ROOM_FULL"));
        assert_eq!(message.str_field("error_message"), Some("room is full"));
        assert_eq!(Message::chat("x").error_code(), None);
    }

    #[test]
    fn test_with_data_non_object() {
        let message = Message::with_data(MessageType::Heartbeat, json!([1, 2, 3]));
        assert!(message.payload.is_empty());
    }

    #[test]
    fn test_timestamp_is_current() {
        let before = now_timestamp();
        let message = Message::connect("bob");
        let after = now_timestamp();

        assert!(message.timestamp >= before && message.timestamp <= after);
        assert_approx_eq!(message.timestamp, after, 1.0);
    }
}
