//! Event dispatch table: one handler per [`EventType`].

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::BoxFuture;
use tracing::debug;

use crate::error::HubError;

use super::connection::Connection;
use super::messages::{EventType, IncomingEvent};

pub type HandlerResult = Result<(), HubError>;

/// A registered event handler. Receives the decoded envelope and the
/// connection it arrived on.
pub type EventHandler =
    Arc<dyn Fn(IncomingEvent, Arc<Connection>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Maps event types to handlers. The hub knows nothing about what the
/// handlers do; services plug in here.
#[derive(Default)]
pub struct EventRouter {
    handlers: RwLock<HashMap<EventType, EventHandler>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event_type`.
    ///
    /// Each type takes exactly one handler; a second registration is a
    /// configuration error and leaves the first one in place.
    pub fn register<F, Fut>(&self, event_type: EventType, handler: F) -> Result<(), HubError>
    where
        F: Fn(IncomingEvent, Arc<Connection>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if handlers.contains_key(&event_type) {
            return Err(HubError::HandlerAlreadyRegistered(event_type));
        }
        let handler: EventHandler = Arc::new(
            move |event: IncomingEvent, conn: Arc<Connection>| -> BoxFuture<'static, HandlerResult> {
                Box::pin(handler(event, conn))
            },
        );
        handlers.insert(event_type, handler);
        debug!(%event_type, "event handler registered");
        Ok(())
    }

    pub fn is_registered(&self, event_type: EventType) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&event_type)
    }

    /// Look up the handler for the event's tag and run it.
    ///
    /// Unknown tags and tags without a handler both yield
    /// [`HubError::UnsupportedEvent`].
    pub async fn route(&self, event: IncomingEvent, conn: Arc<Connection>) -> HandlerResult {
        let event_type = event.kind()?;
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event_type)
            .cloned()
            .ok_or_else(|| HubError::UnsupportedEvent(event.event_type.clone()))?;

        debug!(connection_id = conn.id(), %event_type, "routing event");
        handler(event, conn).await
    }
}

impl fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("EventRouter")
            .field("handlers", &handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
