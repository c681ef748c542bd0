//! Room registry: owns the code → room map and the room lifecycle.
//!
//! Lock order is always registry map first, then a room's membership lock.
//! Each connection's room back-reference is only written while the map lock
//! is held for writing, so it always agrees with room membership.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::HubError;
use crate::ws::connection::Connection;
use crate::ws::messages::OutgoingEvent;

use super::room::{Room, RoomSummary, generate_room_code};

/// How many fresh codes to try before giving up on a collision streak.
const MAX_CODE_ATTEMPTS: usize = 16;

/// Outcome of a connection leaving its room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeftRoom {
    pub room_code: String,
    pub username: String,
    /// The room was empty afterwards and has been removed.
    pub room_closed: bool,
}

// A departure computed under the map lock, announced after it is released.
struct Departure {
    room: Arc<Room>,
    left: LeftRoom,
}

impl Departure {
    async fn announce(self) -> LeftRoom {
        if !self.left.room_closed {
            match OutgoingEvent::room_left(&self.left.username) {
                Ok(event) => {
                    self.room.broadcast_to_clients(&event).await;
                }
                Err(e) => warn!(error = %e, "room_left not sent"),
            }
        }
        self.left
    }
}

pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    generate_code: fn() -> String,
}

impl RoomRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registry with a custom code source.
    pub fn with_code_generator(generate_code: fn() -> String) -> Arc<Self> {
        Arc::new(Self {
            rooms: RwLock::new(HashMap::new()),
            generate_code,
        })
    }

    /// Create a room owned by `conn` and make it the first member. Any room
    /// `conn` was in before is left first.
    pub async fn create_room(&self, name: &str, conn: &Arc<Connection>) -> Result<Arc<Room>, HubError> {
        let mut rooms = self.rooms.write().await;
        if conn.has_departed() {
            return Err(HubError::ConnectionClosed);
        }

        let previous = Self::detach(&mut rooms, conn).await;
        let created = match self.free_code(&rooms) {
            Ok(code) => {
                let room = Arc::new(Room::new(code.clone(), name, &conn.user_id()));
                room.add_client(conn.clone()).await;
                conn.set_room(Some(code.clone()));
                rooms.insert(code, room.clone());
                Ok(room)
            }
            Err(e) => Err(e),
        };
        drop(rooms);

        if let Some(departure) = previous {
            departure.announce().await;
        }
        let room = created?;
        info!(
            room_code = room.code(),
            room_name = name,
            connection_id = conn.id(),
            "room created"
        );
        Ok(room)
    }

    /// Add `conn` to the room with `code`, optionally renaming it, and tell
    /// the other members.
    pub async fn join_room(
        &self,
        code: &str,
        username: &str,
        conn: &Arc<Connection>,
    ) -> Result<Arc<Room>, HubError> {
        let mut rooms = self.rooms.write().await;
        if conn.has_departed() {
            return Err(HubError::ConnectionClosed);
        }
        let room = rooms
            .get(code)
            .cloned()
            .ok_or_else(|| HubError::RoomNotFound(code.to_string()))?;

        let previous = if conn.room_code().as_deref() == Some(code) {
            None
        } else {
            Self::detach(&mut rooms, conn).await
        };

        if !username.is_empty() {
            conn.set_user_id(username);
        }
        let added = room.add_client(conn.clone()).await;
        conn.set_room(Some(code.to_string()));
        drop(rooms);

        let username = conn.user_id();
        if let Some(departure) = previous {
            departure.announce().await;
        }
        if !added {
            debug!(room_code = code, connection_id = conn.id(), "already a member");
            return Ok(room);
        }

        info!(room_code = code, connection_id = conn.id(), username = %username, "client joined room");
        match OutgoingEvent::room_joined(&username, room.name()) {
            Ok(event) => {
                room.broadcast_to_clients_except(&event, conn.id()).await;
            }
            Err(e) => warn!(error = %e, "room_joined not sent"),
        }
        Ok(room)
    }

    /// Take `conn` out of its room. Empty rooms are removed on the spot.
    pub async fn leave_room(&self, conn: &Arc<Connection>) -> Result<LeftRoom, HubError> {
        let departure = {
            let mut rooms = self.rooms.write().await;
            Self::detach(&mut rooms, conn).await
        };
        match departure {
            Some(departure) => Ok(departure.announce().await),
            None => Err(HubError::NotInRoom),
        }
    }

    /// Final cleanup for a connection the hub is dropping. Leaves its room,
    /// if any, and marks it departed so later creates and joins are refused.
    pub async fn handle_client_disconnect(&self, conn: &Arc<Connection>) -> Option<LeftRoom> {
        let departure = {
            let mut rooms = self.rooms.write().await;
            conn.mark_departed();
            Self::detach(&mut rooms, conn).await
        };
        let left = departure?.announce().await;
        debug!(
            room_code = %left.room_code,
            connection_id = conn.id(),
            "client disconnected from room"
        );
        Some(left)
    }

    /// The room `conn` is in, if any.
    pub async fn client_room(&self, conn: &Connection) -> Option<Arc<Room>> {
        let rooms = self.rooms.read().await;
        let code = conn.room_code()?;
        rooms.get(&code).cloned()
    }

    pub async fn room(&self, code: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(code).cloned()
    }

    pub async fn rooms(&self) -> Vec<RoomSummary> {
        let rooms = self.rooms.read().await;
        let mut out = Vec::with_capacity(rooms.len());
        for room in rooms.values() {
            out.push(room.summary().await);
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }

    pub async fn len(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rooms.read().await.is_empty()
    }

    fn free_code(&self, rooms: &HashMap<String, Arc<Room>>) -> Result<String, HubError> {
        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = (self.generate_code)();
            if !rooms.contains_key(&code) {
                return Ok(code);
            }
            debug!(room_code = %code, "room code collision, retrying");
        }
        Err(HubError::RoomCodeExhausted)
    }

    // Caller holds the map lock for writing. The room lock is the only
    // suspension point; membership, back-reference and room removal all
    // change after it.
    async fn detach(rooms: &mut HashMap<String, Arc<Room>>, conn: &Connection) -> Option<Departure> {
        let code = conn.room_code()?;
        let Some(room) = rooms.get(&code).cloned() else {
            conn.take_room();
            warn!(room_code = %code, connection_id = conn.id(), "stale room reference dropped");
            return None;
        };

        let remaining = room.remove_client(conn.id()).await;
        conn.take_room();
        let Some(remaining) = remaining else {
            warn!(room_code = %code, connection_id = conn.id(), "room reference without membership dropped");
            return None;
        };

        let room_closed = remaining == 0;
        if room_closed {
            rooms.remove(&code);
            info!(room_code = %code, "room closed");
        }

        Some(Departure {
            room,
            left: LeftRoom {
                room_code: code,
                username: conn.user_id(),
                room_closed,
            },
        })
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            generate_code: generate_room_code,
        }
    }
}

impl std::fmt::Debug for RoomRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomRegistry").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
