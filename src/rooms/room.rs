use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::ws::connection::{Connection, ConnectionId};
use crate::ws::messages::OutgoingEvent;

pub const ROOM_CODE_LENGTH: usize = 6;
pub const ROOM_CODE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Random room code: [`ROOM_CODE_LENGTH`] characters from
/// [`ROOM_CODE_CHARSET`].
pub fn generate_room_code() -> String {
    let mut rng = rand::thread_rng();
    (0..ROOM_CODE_LENGTH)
        .map(|_| ROOM_CODE_CHARSET[rng.gen_range(0..ROOM_CODE_CHARSET.len())] as char)
        .collect()
}

/// A named group of connections sharing a broadcast scope.
///
/// Membership has its own lock. The registry may call in here while holding
/// its map lock, never the other way round.
#[derive(Debug)]
pub struct Room {
    code: String,
    name: String,
    owner_id: String,
    created_at: DateTime<Utc>,
    pub(super) members: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
}

/// Read-only view of a room for listings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub code: String,
    pub name: String,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    pub member_count: usize,
}

impl Room {
    pub fn new(code: String, name: &str, owner_id: &str) -> Self {
        Room {
            code,
            name: name.to_string(),
            owner_id: owner_id.to_string(),
            created_at: Utc::now(),
            members: RwLock::new(HashMap::new()),
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Returns `false` if the connection was already a member.
    pub(crate) async fn add_client(&self, conn: Arc<Connection>) -> bool {
        self.members.write().await.insert(conn.id(), conn).is_none()
    }

    /// Remove a member. Returns how many members remain, or `None` if `id`
    /// was not a member.
    pub(crate) async fn remove_client(&self, id: ConnectionId) -> Option<usize> {
        let mut members = self.members.write().await;
        members.remove(&id).map(|_| members.len())
    }

    pub async fn has_client(&self, id: ConnectionId) -> bool {
        self.members.read().await.contains_key(&id)
    }

    pub async fn client_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn members(&self) -> Vec<Arc<Connection>> {
        self.members.read().await.values().cloned().collect()
    }

    /// Send to every member. Returns how many queued it.
    pub async fn broadcast_to_clients(&self, event: &OutgoingEvent) -> usize {
        let members = self.members().await;
        self.deliver(members, event)
    }

    /// Send to every member except `except`.
    pub async fn broadcast_to_clients_except(
        &self,
        event: &OutgoingEvent,
        except: ConnectionId,
    ) -> usize {
        let members: Vec<_> = {
            let guard = self.members.read().await;
            guard
                .values()
                .filter(|c| c.id() != except)
                .cloned()
                .collect()
        };
        self.deliver(members, event)
    }

    // Runs on a snapshot, after the membership lock is released.
    fn deliver(&self, members: Vec<Arc<Connection>>, event: &OutgoingEvent) -> usize {
        let text = event.to_json();
        let delivered = members
            .iter()
            .filter(|conn| conn.send_text(text.clone()))
            .count();
        debug!(
            room_code = %self.code,
            event_type = %event.event_type,
            delivered,
            "room broadcast"
        );
        delivered
    }

    pub async fn summary(&self) -> RoomSummary {
        RoomSummary {
            code: self.code.clone(),
            name: self.name.clone(),
            owner_id: self.owner_id.clone(),
            created_at: self.created_at,
            member_count: self.client_count().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::hub::{Hub, HubSettings};

    #[test]
    fn room_codes_use_the_charset() {
        for _ in 0..100 {
            let code = generate_room_code();
            assert_eq!(code.len(), ROOM_CODE_LENGTH);
            assert!(code.bytes().all(|b| ROOM_CODE_CHARSET.contains(&b)));
        }
    }

    #[tokio::test]
    async fn membership_add_remove() {
        let (_hub, handle) = Hub::new(HubSettings::default());
        let (a, _rx) = handle.new_connection();
        let room = Room::new("ABC123".into(), "Quiz", &a.user_id());

        assert!(room.add_client(a.clone()).await);
        assert!(!room.add_client(a.clone()).await);
        assert!(room.has_client(a.id()).await);
        assert_eq!(room.client_count().await, 1);

        assert_eq!(room.remove_client(a.id()).await, Some(0));
        assert_eq!(room.remove_client(a.id()).await, None);
        assert_eq!(room.client_count().await, 0);
    }

    #[tokio::test]
    async fn broadcast_except_skips_excluded_and_non_members() {
        let (_hub, handle) = Hub::new(HubSettings::default());
        let (a, mut rx_a) = handle.new_connection();
        let (b, mut rx_b) = handle.new_connection();
        let (c, mut rx_c) = handle.new_connection();
        let (outsider, mut rx_out) = handle.new_connection();
        drop(outsider);

        let room = Room::new("ABC123".into(), "Quiz", &a.user_id());
        room.add_client(a.clone()).await;
        room.add_client(b.clone()).await;
        room.add_client(c.clone()).await;

        let event = OutgoingEvent::send_message("hi", "alice").unwrap();
        assert_eq!(room.broadcast_to_clients_except(&event, a.id()).await, 2);

        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_c.try_recv().is_ok());
        assert!(rx_out.try_recv().is_err());

        assert_eq!(room.broadcast_to_clients(&event).await, 3);
        assert!(rx_a.try_recv().is_ok());
    }

    #[tokio::test]
    async fn summary_reflects_membership() {
        let (_hub, handle) = Hub::new(HubSettings::default());
        let (a, _rx) = handle.new_connection();
        let room = Room::new("XYZ789".into(), "Trivia", "owner-1");
        room.add_client(a).await;

        let summary = room.summary().await;
        assert_eq!(summary.code, "XYZ789");
        assert_eq!(summary.name, "Trivia");
        assert_eq!(summary.owner_id, "owner-1");
        assert_eq!(summary.member_count, 1);

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["memberCount"], 1);
        assert_eq!(json["ownerId"], "owner-1");
    }
}
