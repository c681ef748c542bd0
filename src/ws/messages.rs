//! Event envelopes exchanged over a WebSocket connection.
//!
//! Inbound events keep their payload as an opaque JSON value; each handler
//! decodes the shape it expects with [`IncomingEvent::decode_payload`].

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::HubError;

// ---------------------------------------------------------------------------
// Event type tags
// ---------------------------------------------------------------------------

/// Every event type tag known to the server, inbound and outbound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SendMessage,
    UserConnected,
    UserDisconnected,
    CreateRoom,
    JoinRoom,
    LeaveRoom,
    RoomCreated,
    RoomJoined,
    RoomLeft,
    RoomClosed,
    Error,
}

impl EventType {
    pub const ALL: [EventType; 11] = [
        EventType::SendMessage,
        EventType::UserConnected,
        EventType::UserDisconnected,
        EventType::CreateRoom,
        EventType::JoinRoom,
        EventType::LeaveRoom,
        EventType::RoomCreated,
        EventType::RoomJoined,
        EventType::RoomLeft,
        EventType::RoomClosed,
        EventType::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::SendMessage => "send_message",
            EventType::UserConnected => "user_connected",
            EventType::UserDisconnected => "user_disconnected",
            EventType::CreateRoom => "create_room",
            EventType::JoinRoom => "join_room",
            EventType::LeaveRoom => "leave_room",
            EventType::RoomCreated => "room_created",
            EventType::RoomJoined => "room_joined",
            EventType::RoomLeft => "room_left",
            EventType::RoomClosed => "room_closed",
            EventType::Error => "error",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| HubError::UnsupportedEvent(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Client → Server
// ---------------------------------------------------------------------------

/// Envelope received from a client. The tag stays a raw string so that an
/// unknown tag surfaces as [`HubError::UnsupportedEvent`] at routing time
/// rather than as a decode failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl IncomingEvent {
    /// Parse an envelope from a text or binary frame body.
    pub fn decode(bytes: &[u8]) -> Result<Self, HubError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// The typed tag, if the wire tag is one the server knows.
    pub fn kind(&self) -> Result<EventType, HubError> {
        self.event_type.parse()
    }

    /// Decode the payload into the shape a handler expects.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, HubError> {
        T::deserialize(&self.payload).map_err(|source| HubError::InvalidPayload {
            event_type: self.event_type.clone(),
            source,
        })
    }
}

// ---------------------------------------------------------------------------
// Server → Client
// ---------------------------------------------------------------------------

/// Envelope sent to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub payload: serde_json::Value,
}

impl OutgoingEvent {
    pub fn new<P: Serialize>(event_type: EventType, payload: &P) -> Result<Self, HubError> {
        let payload = serde_json::to_value(payload)
            .map_err(|source| HubError::Encode { event_type, source })?;
        Ok(OutgoingEvent {
            event_type,
            payload,
        })
    }

    pub fn send_message(message: &str, username: &str) -> Result<Self, HubError> {
        Self::new(
            EventType::SendMessage,
            &SendMessagePayload {
                message: message.to_string(),
                username: username.to_string(),
            },
        )
    }

    pub fn room_created(room_code: &str, room_name: &str) -> Result<Self, HubError> {
        Self::new(
            EventType::RoomCreated,
            &RoomCreatedPayload {
                room_code: room_code.to_string(),
                room_name: room_name.to_string(),
            },
        )
    }

    pub fn room_joined(username: &str, room_name: &str) -> Result<Self, HubError> {
        Self::new(
            EventType::RoomJoined,
            &RoomJoinedPayload {
                username: username.to_string(),
                room_name: room_name.to_string(),
            },
        )
    }

    pub fn room_left(username: &str) -> Result<Self, HubError> {
        Self::new(
            EventType::RoomLeft,
            &RoomLeftPayload {
                username: username.to_string(),
            },
        )
    }

    pub fn user_connected(username: &str) -> Result<Self, HubError> {
        Self::new(
            EventType::UserConnected,
            &PresencePayload {
                username: username.to_string(),
            },
        )
    }

    pub fn user_disconnected(username: &str) -> Result<Self, HubError> {
        Self::new(
            EventType::UserDisconnected,
            &PresencePayload {
                username: username.to_string(),
            },
        )
    }

    pub fn error(message: &str) -> Result<Self, HubError> {
        Self::new(
            EventType::Error,
            &ErrorPayload {
                message: message.to_string(),
            },
        )
    }

    /// Serialize to JSON text for sending over WebSocket.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","payload":{"message":"serialization failed"}}"#.to_string()
        })
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessagePayload {
    pub message: String,
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRoomPayload {
    pub room_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomCreatedPayload {
    pub room_code: String,
    pub room_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRoomPayload {
    pub room_code: String,
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomJoinedPayload {
    pub username: String,
    pub room_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomLeftPayload {
    pub username: String,
}

/// Payload of `user_connected` / `user_disconnected`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresencePayload {
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
