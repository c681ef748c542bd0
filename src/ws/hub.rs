//! Process-wide connection registry.
//!
//! All registry mutation goes through one control loop fed by a bounded
//! command queue, so commands are applied in arrival order and a broadcast
//! always sees the membership as of the moment it is dequeued.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::error::HubError;

use super::connection::{Connection, ConnectionId};
use super::messages::{EventType, IncomingEvent, OutgoingEvent};
use super::router::{EventRouter, HandlerResult};

/// Requests processed by the hub's control loop.
pub enum HubCommand {
    Register(Arc<Connection>),
    Unregister(ConnectionId),
    Broadcast {
        text: String,
        except: Option<ConnectionId>,
    },
    Count(oneshot::Sender<usize>),
    Contains(ConnectionId, oneshot::Sender<bool>),
}

/// Collaborator told about a connection before the hub drops it.
///
/// Runs inside the control loop: the departing connection's queue is still
/// open, but implementations must not wait on the hub's own command queue.
pub trait DisconnectListener: Send + Sync {
    fn on_disconnect(&self, conn: Arc<Connection>) -> BoxFuture<'_, ()>;
}

/// Tunables shared by the hub and every connection it hands out.
#[derive(Debug, Clone, Copy)]
pub struct HubSettings {
    pub command_capacity: usize,
    pub outbound_capacity: usize,
    /// How long a connection may stay silent before it is dropped.
    pub pong_wait: Duration,
    /// Keepalive ping period; shorter than `pong_wait`.
    pub ping_interval: Duration,
    /// Time the writer gets to flush a close frame after the reader ends.
    pub close_grace: Duration,
    pub announce_presence: bool,
    pub surface_errors: bool,
}

impl HubSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        HubSettings {
            command_capacity: config.hub_queue_capacity,
            outbound_capacity: config.outbound_queue_capacity,
            pong_wait: config.pong_wait(),
            ping_interval: config.ping_interval(),
            close_grace: Duration::from_secs(1),
            announce_presence: config.announce_presence,
            surface_errors: config.surface_errors,
        }
    }
}

impl Default for HubSettings {
    fn default() -> Self {
        HubSettings::from_config(&AppConfig::default())
    }
}

/// The control loop. Owns the connection map; consumed by [`Hub::run`].
pub struct Hub {
    commands: mpsc::Receiver<HubCommand>,
    connections: HashMap<ConnectionId, Arc<Connection>>,
    listeners: Vec<Arc<dyn DisconnectListener>>,
    announce_presence: bool,
}

impl Hub {
    /// Create the loop and a handle to it. Nothing runs until
    /// [`Hub::run`] or [`Hub::spawn`].
    pub fn new(settings: HubSettings) -> (Hub, HubHandle) {
        let (tx, rx) = mpsc::channel(settings.command_capacity.max(1));
        let hub = Hub {
            commands: rx,
            connections: HashMap::new(),
            listeners: Vec::new(),
            announce_presence: settings.announce_presence,
        };
        let handle = HubHandle {
            commands: tx,
            router: Arc::new(EventRouter::new()),
            settings,
        };
        (hub, handle)
    }

    pub fn add_disconnect_listener(&mut self, listener: Arc<dyn DisconnectListener>) {
        self.listeners.push(listener);
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Process commands until every [`HubHandle`] is gone, then close the
    /// queues of whatever is still registered.
    pub async fn run(mut self) {
        info!("hub control loop started");
        while let Some(cmd) = self.commands.recv().await {
            match cmd {
                HubCommand::Register(conn) => self.register(conn),
                HubCommand::Unregister(id) => self.unregister(id).await,
                HubCommand::Broadcast { text, except } => {
                    self.broadcast(text, except);
                }
                HubCommand::Count(reply) => {
                    let _ = reply.send(self.connections.len());
                }
                HubCommand::Contains(id, reply) => {
                    let _ = reply.send(self.connections.contains_key(&id));
                }
            }
        }

        for (_, conn) in self.connections.drain() {
            conn.close_outbound();
        }
        info!("hub control loop stopped");
    }

    fn register(&mut self, conn: Arc<Connection>) {
        let id = conn.id();
        if self.connections.contains_key(&id) {
            warn!(connection_id = id, "connection already registered");
            return;
        }
        let user_id = conn.user_id();
        self.connections.insert(id, conn);
        info!(
            connection_id = id,
            user_id = %user_id,
            total = self.connections.len(),
            "client registered"
        );

        if self.announce_presence {
            self.announce(OutgoingEvent::user_connected(&user_id), id);
        }
    }

    /// Listeners first, then removal and queue close. Absent ids are a no-op.
    async fn unregister(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.get(&id).cloned() else {
            debug!(connection_id = id, "unregister for unknown connection ignored");
            return;
        };

        for listener in &self.listeners {
            listener.on_disconnect(conn.clone()).await;
        }

        self.connections.remove(&id);
        conn.close_outbound();
        info!(
            connection_id = id,
            total = self.connections.len(),
            "client unregistered"
        );

        if self.announce_presence {
            self.announce(OutgoingEvent::user_disconnected(&conn.user_id()), id);
        }
    }

    fn announce(&self, event: Result<OutgoingEvent, HubError>, except: ConnectionId) {
        match event {
            Ok(event) => {
                self.broadcast(event.to_json(), Some(except));
            }
            Err(e) => warn!(error = %e, "presence announcement not sent"),
        }
    }

    fn broadcast(&self, text: String, except: Option<ConnectionId>) -> usize {
        let mut delivered = 0;
        for (id, conn) in &self.connections {
            if Some(*id) == except {
                continue;
            }
            if conn.send_text(text.clone()) {
                delivered += 1;
            }
        }
        debug!(delivered, "hub broadcast");
        delivered
    }
}

/// Cheap, cloneable access to a running [`Hub`].
#[derive(Debug, Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<HubCommand>,
    router: Arc<EventRouter>,
    settings: HubSettings,
}

impl HubHandle {
    /// Build a connection bound to this hub. It is not registered yet.
    pub fn new_connection(&self) -> (Arc<Connection>, mpsc::Receiver<String>) {
        Connection::new(self.commands.downgrade(), self.settings.outbound_capacity)
    }

    pub async fn register(&self, conn: Arc<Connection>) -> Result<(), HubError> {
        self.send(HubCommand::Register(conn)).await
    }

    pub async fn unregister(&self, id: ConnectionId) -> Result<(), HubError> {
        self.send(HubCommand::Unregister(id)).await
    }

    pub async fn broadcast_all(&self, event: &OutgoingEvent) -> Result<(), HubError> {
        self.send(HubCommand::Broadcast {
            text: event.to_json(),
            except: None,
        })
        .await
    }

    pub async fn broadcast_all_except(
        &self,
        event: &OutgoingEvent,
        except: ConnectionId,
    ) -> Result<(), HubError> {
        self.send(HubCommand::Broadcast {
            text: event.to_json(),
            except: Some(except),
        })
        .await
    }

    pub async fn route_event(&self, event: IncomingEvent, conn: Arc<Connection>) -> HandlerResult {
        self.router.route(event, conn).await
    }

    pub fn register_handler<F, Fut>(&self, event_type: EventType, handler: F) -> Result<(), HubError>
    where
        F: Fn(IncomingEvent, Arc<Connection>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.router.register(event_type, handler)
    }

    pub async fn connection_count(&self) -> Result<usize, HubError> {
        let (tx, rx) = oneshot::channel();
        self.send(HubCommand::Count(tx)).await?;
        rx.await.map_err(|_| HubError::HubClosed)
    }

    pub async fn contains(&self, id: ConnectionId) -> Result<bool, HubError> {
        let (tx, rx) = oneshot::channel();
        self.send(HubCommand::Contains(id, tx)).await?;
        rx.await.map_err(|_| HubError::HubClosed)
    }

    /// A handle that does not keep the control loop alive. Services stored
    /// in the router must use this, or the loop can never stop.
    pub fn downgrade(&self) -> WeakHubHandle {
        WeakHubHandle {
            commands: self.commands.downgrade(),
        }
    }

    pub fn router(&self) -> Arc<EventRouter> {
        self.router.clone()
    }

    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    async fn send(&self, cmd: HubCommand) -> Result<(), HubError> {
        self.commands.send(cmd).await.map_err(|_| HubError::HubClosed)
    }
}

/// Non-owning counterpart of [`HubHandle`], limited to broadcasting.
#[derive(Debug, Clone)]
pub struct WeakHubHandle {
    commands: mpsc::WeakSender<HubCommand>,
}

impl WeakHubHandle {
    pub async fn broadcast_all_except(
        &self,
        event: &OutgoingEvent,
        except: ConnectionId,
    ) -> Result<(), HubError> {
        let commands = self.commands.upgrade().ok_or(HubError::HubClosed)?;
        commands
            .send(HubCommand::Broadcast {
                text: event.to_json(),
                except: Some(except),
            })
            .await
            .map_err(|_| HubError::HubClosed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
