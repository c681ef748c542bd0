//! Room event handlers: `create_room`, `join_room`, `leave_room`, plus
//! cleanup when a connection goes away.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::info;

use crate::error::HubError;
use crate::ws::connection::Connection;
use crate::ws::hub::{DisconnectListener, HubHandle};
use crate::ws::messages::{
    CreateRoomPayload, EventType, IncomingEvent, JoinRoomPayload, OutgoingEvent,
};
use crate::ws::router::HandlerResult;

use super::registry::RoomRegistry;

#[derive(Debug, Clone)]
pub struct RoomService {
    rooms: Arc<RoomRegistry>,
}

impl RoomService {
    pub fn new(rooms: Arc<RoomRegistry>) -> Arc<Self> {
        Arc::new(Self { rooms })
    }

    /// Register the room handlers on the hub's router.
    pub fn install(self: &Arc<Self>, hub: &HubHandle) -> Result<(), HubError> {
        let svc = self.clone();
        hub.register_handler(EventType::CreateRoom, move |event, conn| {
            let svc = svc.clone();
            async move { svc.create_room(event, conn).await }
        })?;

        let svc = self.clone();
        hub.register_handler(EventType::JoinRoom, move |event, conn| {
            let svc = svc.clone();
            async move { svc.join_room(event, conn).await }
        })?;

        let svc = self.clone();
        hub.register_handler(EventType::LeaveRoom, move |event, conn| {
            let svc = svc.clone();
            async move { svc.leave_room(event, conn).await }
        })?;

        Ok(())
    }

    pub async fn create_room(&self, event: IncomingEvent, conn: Arc<Connection>) -> HandlerResult {
        let payload: CreateRoomPayload = event.decode_payload()?;
        let room = self.rooms.create_room(&payload.room_name, &conn).await?;
        conn.send(&OutgoingEvent::room_created(room.code(), room.name())?);
        Ok(())
    }

    pub async fn join_room(&self, event: IncomingEvent, conn: Arc<Connection>) -> HandlerResult {
        let payload: JoinRoomPayload = event.decode_payload()?;
        self.rooms
            .join_room(&payload.room_code, &payload.username, &conn)
            .await?;
        Ok(())
    }

    pub async fn leave_room(&self, _event: IncomingEvent, conn: Arc<Connection>) -> HandlerResult {
        let left = self.rooms.leave_room(&conn).await?;
        info!(
            room_code = %left.room_code,
            connection_id = conn.id(),
            room_closed = left.room_closed,
            "client left room"
        );
        Ok(())
    }
}

impl DisconnectListener for RoomService {
    fn on_disconnect(&self, conn: Arc<Connection>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.rooms.handle_client_disconnect(&conn).await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::hub::{Hub, HubSettings};

    fn event(json: &str) -> IncomingEvent {
        IncomingEvent::decode(json.as_bytes()).unwrap()
    }

    #[tokio::test]
    async fn create_room_replies_with_code() {
        let (_hub, handle) = Hub::new(HubSettings::default());
        let rooms = RoomRegistry::new();
        RoomService::new(rooms.clone()).install(&handle).unwrap();
        let (a, mut rx_a) = handle.new_connection();

        handle
            .route_event(
                event(r#"{"type":"create_room","payload":{"room_name":"Quiz"}}"#),
                a.clone(),
            )
            .await
            .unwrap();

        let reply: serde_json::Value = serde_json::from_str(&rx_a.recv().await.unwrap()).unwrap();
        assert_eq!(reply["type"], "room_created");
        assert_eq!(reply["payload"]["room_name"], "Quiz");
        let code = reply["payload"]["room_code"].as_str().unwrap();
        assert_eq!(code.len(), 6);
        assert!(rooms.room(code).await.is_some());
    }

    #[tokio::test]
    async fn bad_payload_is_handler_error() {
        let (_hub, handle) = Hub::new(HubSettings::default());
        RoomService::new(RoomRegistry::new())
            .install(&handle)
            .unwrap();
        let (a, _rx) = handle.new_connection();

        let err = handle
            .route_event(event(r#"{"type":"join_room","payload":"oops"}"#), a)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::InvalidPayload { .. }));
    }

    #[tokio::test]
    async fn leave_outside_room_is_not_in_room() {
        let (_hub, handle) = Hub::new(HubSettings::default());
        RoomService::new(RoomRegistry::new())
            .install(&handle)
            .unwrap();
        let (a, _rx) = handle.new_connection();

        let err = handle
            .route_event(event(r#"{"type":"leave_room"}"#), a)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::NotInRoom));
    }

    #[tokio::test]
    async fn installing_twice_is_rejected() {
        let (_hub, handle) = Hub::new(HubSettings::default());
        let svc = RoomService::new(RoomRegistry::new());
        svc.install(&handle).unwrap();
        assert!(matches!(
            svc.install(&handle).unwrap_err(),
            HubError::HandlerAlreadyRegistered(EventType::CreateRoom)
        ));
    }

    #[tokio::test]
    async fn hub_disconnect_cleans_up_room() {
        let (mut hub, handle) = Hub::new(HubSettings::default());
        let rooms = RoomRegistry::new();
        let svc = RoomService::new(rooms.clone());
        svc.install(&handle).unwrap();
        hub.add_disconnect_listener(svc);
        hub.spawn();

        let (a, _rx_a) = handle.new_connection();
        let (b, mut rx_b) = handle.new_connection();
        handle.register(a.clone()).await.unwrap();
        handle.register(b.clone()).await.unwrap();

        let room = rooms.create_room("Quiz", &a).await.unwrap();
        rooms.join_room(room.code(), "bob", &b).await.unwrap();

        handle.unregister(b.id()).await.unwrap();
        handle.connection_count().await.unwrap();
        assert_eq!(room.client_count().await, 1);

        // The leave happened before b's queue was closed; b hears nothing
        // about itself and then sees the queue end.
        assert!(rx_b.recv().await.is_none());

        handle.unregister(a.id()).await.unwrap();
        handle.connection_count().await.unwrap();
        assert!(rooms.room(room.code()).await.is_none());
    }

    #[tokio::test]
    async fn events_after_unregister_are_refused() {
        let (mut hub, handle) = Hub::new(HubSettings::default());
        let rooms = RoomRegistry::new();
        let svc = RoomService::new(rooms.clone());
        svc.install(&handle).unwrap();
        hub.add_disconnect_listener(svc);
        hub.spawn();

        let (a, _rx_a) = handle.new_connection();
        handle.register(a.clone()).await.unwrap();
        handle.unregister(a.id()).await.unwrap();
        assert_eq!(handle.connection_count().await.unwrap(), 0);

        // The read pump may still deliver frames after the hub let go.
        let err = handle
            .route_event(
                event(r#"{"type":"create_room","payload":{"room_name":"Ghost"}}"#),
                a.clone(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::ConnectionClosed));
        assert!(rooms.is_empty().await);
        assert!(a.room_code().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn room_events_racing_disconnects_leave_nothing_behind() {
        let (mut hub, handle) = Hub::new(HubSettings::default());
        let rooms = RoomRegistry::new();
        let svc = RoomService::new(rooms.clone());
        svc.install(&handle).unwrap();
        hub.add_disconnect_listener(svc);
        hub.spawn();

        let (owner, _rx_owner) = handle.new_connection();
        handle.register(owner.clone()).await.unwrap();
        let lobby = rooms.create_room("Lobby", &owner).await.unwrap();
        let lobby_code = lobby.code().to_string();

        let mut receivers = Vec::new();
        let mut tasks = Vec::new();
        for i in 0..32 {
            let (conn, rx) = handle.new_connection();
            receivers.push(rx);
            handle.register(conn.clone()).await.unwrap();

            let json = if i % 2 == 0 {
                r#"{"type":"create_room","payload":{"room_name":"Side"}}"#.to_string()
            } else {
                format!(r#"{{"type":"join_room","payload":{{"room_code":"{lobby_code}"}}}}"#)
            };
            let routed = {
                let handle = handle.clone();
                let conn = conn.clone();
                tokio::spawn(async move {
                    let _ = handle.route_event(event(&json), conn).await;
                })
            };
            let dropped = {
                let handle = handle.clone();
                tokio::spawn(async move { handle.unregister(conn.id()).await })
            };
            tasks.push((routed, dropped));
        }
        for (routed, dropped) in tasks {
            routed.await.unwrap();
            dropped.await.unwrap().unwrap();
        }

        assert_eq!(handle.connection_count().await.unwrap(), 1);
        assert_eq!(rooms.len().await, 1);
        assert_eq!(lobby.client_count().await, 1);
        assert!(lobby.has_client(owner.id()).await);
    }
}
