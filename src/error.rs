use std::time::Duration;

use crate::ws::messages::EventType;

/// Errors raised by the hub, its handlers and the connection pumps.
///
/// Only [`HubError::Transport`] and [`HubError::Timeout`] end a connection;
/// everything else is logged by the read pump and the connection carries on.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("malformed event envelope: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid {event_type} payload: {source}")]
    InvalidPayload {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("event not supported: {0}")]
    UnsupportedEvent(String),

    #[error("handler already registered for {0}")]
    HandlerAlreadyRegistered(EventType),

    #[error("failed to encode {event_type} event: {source}")]
    Encode {
        event_type: EventType,
        #[source]
        source: serde_json::Error,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("no data received from peer within {0:?}")]
    Timeout(Duration),

    #[error("room not found: {0}")]
    RoomNotFound(String),

    #[error("client not in any room")]
    NotInRoom,

    #[error("connection is closing")]
    ConnectionClosed,

    #[error("could not allocate a free room code")]
    RoomCodeExhausted,

    #[error("hub is no longer running")]
    HubClosed,
}

impl HubError {
    /// Whether this error ends the connection it occurred on.
    pub fn is_fatal(&self) -> bool {
        matches!(self, HubError::Transport(_) | HubError::Timeout(_))
    }
}
