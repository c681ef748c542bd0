use std::sync::Arc;
use std::time::Instant;

use crate::chat::ChatService;
use crate::config::AppConfig;
use crate::error::HubError;
use crate::rooms::{RoomRegistry, RoomService};
use crate::ws::{Hub, HubHandle, HubSettings};

/// Shared application state passed to all handlers via Axum's State extractor.
#[derive(Debug)]
pub struct AppState {
    pub hub: HubHandle,
    pub rooms: Arc<RoomRegistry>,
    pub config: AppConfig,
    pub start_time: Instant,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Wire the hub, room and chat handlers together and start the hub loop.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: AppConfig) -> Result<SharedState, HubError> {
        let rooms = RoomRegistry::new();
        let (hub, handle) = Self::wire_hub(&config, rooms.clone())?;
        hub.spawn();

        Ok(Arc::new(AppState {
            hub: handle,
            rooms,
            config,
            start_time: Instant::now(),
        }))
    }

    /// Build a hub with every service installed, without starting it.
    pub fn wire_hub(config: &AppConfig, rooms: Arc<RoomRegistry>) -> Result<(Hub, HubHandle), HubError> {
        let (mut hub, handle) = Hub::new(HubSettings::from_config(config));

        let room_service = RoomService::new(rooms.clone());
        room_service.install(&handle)?;
        hub.add_disconnect_listener(room_service);

        ChatService::new(&handle, rooms).install(&handle)?;
        Ok((hub, handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::EventType;

    #[tokio::test]
    async fn every_client_event_has_a_handler() {
        let state = AppState::new(AppConfig::default()).unwrap();
        let router = state.hub.router();
        for event_type in [
            EventType::SendMessage,
            EventType::UserConnected,
            EventType::UserDisconnected,
            EventType::CreateRoom,
            EventType::JoinRoom,
            EventType::LeaveRoom,
        ] {
            assert!(router.is_registered(event_type), "{event_type} unhandled");
        }
        assert!(!router.is_registered(EventType::RoomCreated));
        assert_eq!(state.hub.connection_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn wired_hub_stops_when_handles_drop() {
        let rooms = RoomRegistry::new();
        let (hub, handle) = AppState::wire_hub(&AppConfig::default(), rooms.clone()).unwrap();
        let task = hub.spawn();

        let (conn, mut outbound) = handle.new_connection();
        handle.register(conn.clone()).await.unwrap();
        rooms.create_room("Quiz", &conn).await.unwrap();
        drop(handle);

        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .expect("hub loop still running")
            .unwrap();
        assert!(conn.is_closed());
        assert!(outbound.recv().await.is_none());
    }
}
