use std::sync::Arc;

use tracing::debug;

use crate::error::HubError;
use crate::rooms::RoomRegistry;
use crate::ws::connection::Connection;
use crate::ws::hub::{HubHandle, WeakHubHandle};
use crate::ws::messages::{
    EventType, IncomingEvent, OutgoingEvent, PresencePayload, SendMessagePayload,
};
use crate::ws::router::HandlerResult;

// ---------------------------------------------------------------------------
// ChatService
// ---------------------------------------------------------------------------

/// Relays chat messages within a room and presence notices hub-wide.
#[derive(Debug, Clone)]
pub struct ChatService {
    hub: WeakHubHandle,
    rooms: Arc<RoomRegistry>,
}

impl ChatService {
    pub fn new(hub: &HubHandle, rooms: Arc<RoomRegistry>) -> Arc<Self> {
        Arc::new(Self {
            hub: hub.downgrade(),
            rooms,
        })
    }

    /// Register the chat handlers on the hub's router.
    pub fn install(self: &Arc<Self>, hub: &HubHandle) -> Result<(), HubError> {
        let svc = self.clone();
        hub.register_handler(EventType::SendMessage, move |event, conn| {
            let svc = svc.clone();
            async move { svc.send_message(event, conn).await }
        })?;

        for event_type in [EventType::UserConnected, EventType::UserDisconnected] {
            let svc = self.clone();
            hub.register_handler(event_type, move |event, conn| {
                let svc = svc.clone();
                async move { svc.relay_presence(event_type, event, conn).await }
            })?;
        }

        Ok(())
    }

    /// Forward a chat message to everyone else in the sender's room.
    ///
    /// A missing username is filled in with the sender's identity.
    pub async fn send_message(&self, event: IncomingEvent, conn: Arc<Connection>) -> HandlerResult {
        let payload: SendMessagePayload = event.decode_payload()?;
        let room = self
            .rooms
            .client_room(&conn)
            .await
            .ok_or(HubError::NotInRoom)?;

        let username = if payload.username.is_empty() {
            conn.user_id()
        } else {
            payload.username
        };
        let outgoing = OutgoingEvent::send_message(&payload.message, &username)?;
        let delivered = room
            .broadcast_to_clients_except(&outgoing, conn.id())
            .await;
        debug!(room_code = room.code(), delivered, "chat message relayed");
        Ok(())
    }

    /// Re-broadcast a client's presence notice to every other connection.
    async fn relay_presence(
        &self,
        event_type: EventType,
        event: IncomingEvent,
        conn: Arc<Connection>,
    ) -> HandlerResult {
        let username = event
            .decode_payload::<Option<PresencePayload>>()?
            .map(|p| p.username)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| conn.user_id());

        let outgoing = match event_type {
            EventType::UserDisconnected => OutgoingEvent::user_disconnected(&username)?,
            _ => OutgoingEvent::user_connected(&username)?,
        };
        self.hub.broadcast_all_except(&outgoing, conn.id()).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::hub::{Hub, HubSettings};
    use tokio::sync::mpsc;

    fn event(json: &str) -> IncomingEvent {
        IncomingEvent::decode(json.as_bytes()).unwrap()
    }

    fn next(rx: &mut mpsc::Receiver<String>) -> serde_json::Value {
        serde_json::from_str(&rx.try_recv().expect("expected a queued message")).unwrap()
    }

    #[tokio::test]
    async fn message_reaches_room_members_only() {
        let (_hub, handle) = Hub::new(HubSettings::default());
        let rooms = RoomRegistry::new();
        ChatService::new(&handle, rooms.clone())
            .install(&handle)
            .unwrap();

        let (a, mut rx_a) = handle.new_connection();
        let (b, mut rx_b) = handle.new_connection();
        let (outsider, mut rx_out) = handle.new_connection();
        let room = rooms.create_room("Quiz", &a).await.unwrap();
        rooms.join_room(room.code(), "bob", &b).await.unwrap();
        let _joined = next(&mut rx_a);

        handle
            .route_event(
                event(r#"{"type":"send_message","payload":{"message":"hi"}}"#),
                a.clone(),
            )
            .await
            .unwrap();

        let msg = next(&mut rx_b);
        assert_eq!(msg["type"], "send_message");
        assert_eq!(msg["payload"]["message"], "hi");
        assert_eq!(msg["payload"]["username"], a.user_id().as_str());
        assert!(rx_a.try_recv().is_err());
        assert!(rx_out.try_recv().is_err());
        drop(outsider);
    }

    #[tokio::test]
    async fn explicit_username_is_kept() {
        let (_hub, handle) = Hub::new(HubSettings::default());
        let rooms = RoomRegistry::new();
        ChatService::new(&handle, rooms.clone())
            .install(&handle)
            .unwrap();

        let (a, _rx_a) = handle.new_connection();
        let (b, mut rx_b) = handle.new_connection();
        let room = rooms.create_room("Quiz", &a).await.unwrap();
        rooms.join_room(room.code(), "bob", &b).await.unwrap();

        handle
            .route_event(
                event(r#"{"type":"send_message","payload":{"message":"yo","username":"alice"}}"#),
                a,
            )
            .await
            .unwrap();
        assert_eq!(next(&mut rx_b)["payload"]["username"], "alice");
    }

    #[tokio::test]
    async fn message_outside_room_is_rejected() {
        let (_hub, handle) = Hub::new(HubSettings::default());
        ChatService::new(&handle, RoomRegistry::new())
            .install(&handle)
            .unwrap();
        let (a, _rx) = handle.new_connection();

        let err = handle
            .route_event(
                event(r#"{"type":"send_message","payload":{"message":"hi"}}"#),
                a,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::NotInRoom));
    }

    #[tokio::test]
    async fn presence_notice_is_relayed_hub_wide() {
        let (hub, handle) = Hub::new(HubSettings::default());
        hub.spawn();
        ChatService::new(&handle, RoomRegistry::new())
            .install(&handle)
            .unwrap();

        let (a, mut rx_a) = handle.new_connection();
        let (b, mut rx_b) = handle.new_connection();
        handle.register(a.clone()).await.unwrap();
        handle.register(b.clone()).await.unwrap();

        handle
            .route_event(event(r#"{"type":"user_connected","payload":{"username":"alice"}}"#), a.clone())
            .await
            .unwrap();
        handle
            .route_event(event(r#"{"type":"user_disconnected"}"#), a.clone())
            .await
            .unwrap();
        handle.connection_count().await.unwrap();

        let first = next(&mut rx_b);
        assert_eq!(first["type"], "user_connected");
        assert_eq!(first["payload"]["username"], "alice");
        let second = next(&mut rx_b);
        assert_eq!(second["type"], "user_disconnected");
        assert_eq!(second["payload"]["username"], a.user_id().as_str());
        assert!(rx_a.try_recv().is_err());
    }
}
