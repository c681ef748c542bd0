//! A single client connection: identity, bounded outbound queue and the two
//! pumps that own the raw transport.
//!
//! The read pump decodes inbound frames and hands them to the
//! [`EventRouter`]; the write pump drains the outbound queue and sends
//! keepalive pings. Either pump exiting ends the session and asks the hub to
//! unregister the connection.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, close_code};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{debug, info, trace, warn};

use crate::error::HubError;

use super::hub::{HubCommand, HubHandle, HubSettings};
use super::messages::{IncomingEvent, OutgoingEvent};
use super::router::EventRouter;

/// Process-unique id assigned to each connection.
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Shared state of one connected client.
///
/// The outbound sender lives behind a mutex so the hub can close it exactly
/// once; producers only ever `try_send` while holding it.
pub struct Connection {
    id: ConnectionId,
    user_id: RwLock<String>,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    /// Code of the room this connection currently occupies. Written by the
    /// room registry under its own lock.
    room: Mutex<Option<String>>,
    /// Set by the room registry once disconnect cleanup has run.
    departed: AtomicBool,
    hub: mpsc::WeakSender<HubCommand>,
}

impl Connection {
    pub(crate) fn new(
        hub: mpsc::WeakSender<HubCommand>,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let conn = Arc::new(Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            user_id: RwLock::new(uuid::Uuid::new_v4().to_string()),
            outbound: Mutex::new(Some(tx)),
            room: Mutex::new(None),
            departed: AtomicBool::new(false),
            hub,
        });
        (conn, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> String {
        self.user_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_user_id(&self, user_id: &str) {
        *self.user_id.write().unwrap_or_else(PoisonError::into_inner) = user_id.to_string();
    }

    /// Code of the room this connection is in, if any.
    pub fn room_code(&self) -> Option<String> {
        self.room
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_room(&self, code: Option<String>) {
        *self.room.lock().unwrap_or_else(PoisonError::into_inner) = code;
    }

    pub(crate) fn take_room(&self) -> Option<String> {
        self.room
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Queue an event for this client. See [`Connection::send_text`].
    pub fn send(&self, event: &OutgoingEvent) -> bool {
        self.send_text(event.to_json())
    }

    /// Queue pre-serialized text without blocking.
    ///
    /// Returns `false` when the message was not queued. A full queue means
    /// the peer is not keeping up: the message is dropped and the connection
    /// is evicted.
    pub fn send_text(&self, text: String) -> bool {
        let outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = outbound.as_ref() else {
            return false;
        };
        match tx.try_send(text) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                drop(outbound);
                warn!(connection_id = self.id, "outbound queue full, evicting slow client");
                self.request_unregister();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Close the outbound queue. Returns `true` only for the call that
    /// actually closed it.
    pub(crate) fn close_outbound(&self) -> bool {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }

    pub(crate) fn mark_departed(&self) {
        self.departed.store(true, Ordering::Release);
    }

    /// True once the connection is being torn down and must not join rooms.
    pub fn has_departed(&self) -> bool {
        self.departed.load(Ordering::Acquire) || self.is_closed()
    }

    pub fn is_closed(&self) -> bool {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Ask the hub to unregister this connection without waiting on its
    /// command queue.
    pub fn request_unregister(&self) {
        if let Some(tx) = self.hub.upgrade() {
            let id = self.id;
            tokio::spawn(async move {
                let _ = tx.send(HubCommand::Unregister(id)).await;
            });
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id())
            .field("room", &self.room_code())
            .field("departed", &self.has_departed())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Drive one connection until either pump exits, then unregister it.
///
/// When the read side ends first the writer gets `close_grace` to flush the
/// close frame the hub triggers by closing the outbound queue.
pub async fn run_session<S, R, E>(
    conn: Arc<Connection>,
    sink: S,
    stream: R,
    outbound: mpsc::Receiver<String>,
    hub: HubHandle,
) where
    S: Sink<Message> + Send + Unpin + 'static,
    S::Error: fmt::Display + Send,
    R: Stream<Item = Result<Message, E>> + Send + Unpin + 'static,
    E: fmt::Display + Send + 'static,
{
    let settings = *hub.settings();
    let id = conn.id();

    let mut writer = tokio::spawn(write_pump(id, sink, outbound, settings.ping_interval));
    let mut reader = tokio::spawn(read_pump(conn, stream, hub.router(), settings));

    tokio::select! {
        res = &mut reader => {
            log_pump_exit(id, "read", res);
            if let Err(e) = hub.unregister(id).await {
                debug!(connection_id = id, "unregister after read pump exit: {e}");
            }
            match timeout(settings.close_grace, &mut writer).await {
                Ok(res) => log_pump_exit(id, "write", res),
                Err(_) => writer.abort(),
            }
        }
        res = &mut writer => {
            log_pump_exit(id, "write", res);
            reader.abort();
        }
    }

    if let Err(e) = hub.unregister(id).await {
        debug!(connection_id = id, "unregister after session end: {e}");
    }
    debug!(connection_id = id, "session ended");
}

fn log_pump_exit(
    id: ConnectionId,
    pump: &'static str,
    res: Result<Result<(), HubError>, tokio::task::JoinError>,
) {
    match res {
        Ok(Ok(())) => debug!(connection_id = id, pump, "pump finished"),
        Ok(Err(e)) if e.is_fatal() => info!(connection_id = id, pump, error = %e, "connection lost"),
        Ok(Err(e)) => warn!(connection_id = id, pump, error = %e, "pump stopped"),
        Err(e) if e.is_cancelled() => trace!(connection_id = id, pump, "pump aborted"),
        Err(e) => warn!(connection_id = id, pump, error = %e, "pump panicked"),
    }
}

// ---------------------------------------------------------------------------
// Pumps
// ---------------------------------------------------------------------------

/// Receive frames until the peer goes away or stays silent for `pong_wait`.
///
/// Every frame, pongs included, pushes the deadline back. Decode and handler
/// failures are logged; only a fatal handler error ends the loop.
pub async fn read_pump<R, E>(
    conn: Arc<Connection>,
    mut stream: R,
    router: Arc<EventRouter>,
    settings: HubSettings,
) -> Result<(), HubError>
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    loop {
        let frame = match timeout(settings.pong_wait, stream.next()).await {
            Err(_) => return Err(HubError::Timeout(settings.pong_wait)),
            Ok(None) => return Ok(()),
            Ok(Some(Err(e))) => return Err(HubError::Transport(e.to_string())),
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Message::Text(text) => {
                dispatch(&conn, &router, text.as_bytes(), settings.surface_errors).await?;
            }
            Message::Binary(bytes) => {
                dispatch(&conn, &router, &bytes, settings.surface_errors).await?;
            }
            Message::Ping(_) | Message::Pong(_) => {
                trace!(connection_id = conn.id(), "keepalive frame received");
            }
            Message::Close(frame) => {
                debug!(connection_id = conn.id(), reason = ?frame, "client initiated close");
                return Ok(());
            }
        }
    }
}

// Only fatal errors are returned; everything else is logged and dropped.
async fn dispatch(
    conn: &Arc<Connection>,
    router: &EventRouter,
    body: &[u8],
    surface: bool,
) -> Result<(), HubError> {
    let result = match IncomingEvent::decode(body) {
        Ok(event) => router.route(event, conn.clone()).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            warn!(connection_id = conn.id(), error = %e, "event dropped");
            if surface {
                if let Ok(event) = OutgoingEvent::error(&e.to_string()) {
                    conn.send(&event);
                }
            }
            Ok(())
        }
    }
}

/// Forward queued messages to the sink and ping the peer every
/// `ping_interval`. A closed, drained queue sends a close frame and ends the
/// pump.
pub async fn write_pump<S>(
    id: ConnectionId,
    mut sink: S,
    mut outbound: mpsc::Receiver<String>,
    ping_interval: Duration,
) -> Result<(), HubError>
where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    let mut ticker = interval(ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the first immediate tick.
    ticker.tick().await;

    loop {
        tokio::select! {
            queued = outbound.recv() => match queued {
                Some(text) => {
                    sink.send(Message::Text(text.into()))
                        .await
                        .map_err(|e| HubError::Transport(e.to_string()))?;
                }
                None => {
                    debug!(connection_id = id, "outbound queue closed, sending close frame");
                    let close = Message::Close(Some(CloseFrame {
                        code: close_code::NORMAL,
                        reason: "".into(),
                    }));
                    if let Err(e) = sink.send(close).await {
                        debug!(connection_id = id, "close frame not delivered: {e}");
                    }
                    let _ = sink.close().await;
                    return Ok(());
                }
            },
            _ = ticker.tick() => {
                sink.send(Message::Ping(Bytes::new()))
                    .await
                    .map_err(|e| HubError::Transport(e.to_string()))?;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
