//! Single-consumer event dispatch. The router reads the manager's inbound
//! stream, looks up the handler for the event type, and runs it on its own
//! task; handler errors are logged, never propagated to the sender.
//!
//! The router holds a reference to the manager (to fan out); the manager
//! does not know the router exists, it only exposes a channel.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error};

use super::{ConnManager, Event};
use crate::error::Result;

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
pub type EventHandler = Arc<dyn Fn(Event) -> HandlerFuture + Send + Sync>;

/// Outbound half of the router: marshals a payload into an [`Event`] and
/// hands it to the manager for fan-out. Cheap to clone; domain handlers and
/// lifecycle callbacks each hold one.
#[derive(Clone)]
pub struct Emitter {
    manager: Arc<ConnManager>,
}

impl Emitter {
    pub fn new(manager: Arc<ConnManager>) -> Self {
        Self { manager }
    }

    /// Emits to every connected user.
    pub async fn emit<T: Serialize>(&self, event_type: &str, payload: &T) -> Result<()> {
        let event = Event::new(event_type, serde_json::to_value(payload)?);
        self.manager.send(Arc::new(event)).await;
        Ok(())
    }

    /// Emits to every connection of each named user.
    pub async fn emit_to<T: Serialize>(
        &self,
        event_type: &str,
        payload: &T,
        usernames: &[String],
    ) -> Result<()> {
        let event = Event::new(event_type, serde_json::to_value(payload)?);
        self.manager.send_to_users(Arc::new(event), usernames).await;
        Ok(())
    }
}

/// Dispatcher over the manager's inbound event stream. One handler per
/// type; re-registration replaces.
pub struct EventRouter {
    handlers: HashMap<String, EventHandler>,
    emitter: Emitter,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl EventRouter {
    pub fn new(emitter: Emitter, cancel: CancellationToken) -> Self {
        Self {
            handlers: HashMap::new(),
            emitter,
            cancel,
            tasks: TaskTracker::new(),
        }
    }

    pub fn emitter(&self) -> Emitter {
        self.emitter.clone()
    }

    /// Registers the handler for an event type, replacing any previous one.
    pub fn on(
        &mut self,
        event_type: &str,
        handler: impl Fn(Event) -> HandlerFuture + Send + Sync + 'static,
    ) {
        self.handlers.insert(event_type.to_string(), Arc::new(handler));
    }

    /// Runs the dispatch loop until cancellation or channel closure. Each
    /// handler invocation gets its own task so one slow handler never stalls
    /// arrival-order dispatch.
    pub async fn listen(self: Arc<Self>, mut inbound: mpsc::Receiver<Event>) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                maybe = inbound.recv() => match maybe {
                    Some(event) => event,
                    None => break,
                },
            };

            debug!(
                event_type = %event.event_type,
                dispatcher = event.dispatcher.as_deref().unwrap_or(""),
                "received event"
            );

            let Some(handler) = self.handlers.get(&event.event_type) else {
                debug!(event_type = %event.event_type, "no handler registered, dropping");
                continue;
            };

            let event_type = event.event_type.clone();
            let fut = handler(event);
            self.tasks.spawn(async move {
                if let Err(err) = fut.await {
                    error!("{event_type} handler: {err}");
                }
            });
        }
    }

    /// Signals termination and waits for in-flight handlers, bounded by
    /// `deadline`. Returns false when the deadline elapsed.
    pub async fn close(&self, deadline: Duration) -> bool {
        self.cancel.cancel();
        self.tasks.close();
        tokio::time::timeout(deadline, self.tasks.wait()).await.is_ok()
    }
}
