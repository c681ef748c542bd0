//! WebSocket module: connection hub and event routing.
//!
//! - [`messages`]: Event envelopes and payloads.
//! - [`connection`]: Per-client state and the read/write pumps.
//! - [`router`]: Event type → handler dispatch.
//! - [`hub`]: Connection registry and hub-wide broadcast.
//! - [`handler`]: Axum WebSocket upgrade handler.

pub mod connection;
pub mod handler;
pub mod hub;
pub mod messages;
pub mod router;

pub use connection::{Connection, ConnectionId};
pub use handler::ws_handler;
pub use hub::{DisconnectListener, Hub, HubHandle, HubSettings, WeakHubHandle};
pub use messages::{EventType, IncomingEvent, OutgoingEvent};
pub use router::{EventRouter, HandlerResult};
