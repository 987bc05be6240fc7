//! In-process publish/subscribe for session events.
//!
//! Handlers are async closures keyed by [`EventKind`]. Publishing never waits
//! for them. Each bus owns one dispatcher task that takes events in publish
//! order and runs their handlers in subscription order, each in its own task
//! so that an error or a panic stays contained.

use crate::domain::models::{Event, EventKind};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{trace, warn};

pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type Handler = Arc<dyn Fn(Event) -> HandlerFuture + Send + Sync>;

/// An event with the handlers subscribed when it was published
type Dispatch = (Event, Vec<Handler>);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: HashMap<EventKind, Vec<(SubscriptionId, Handler)>>,
    dispatcher: Option<mpsc::UnboundedSender<Dispatch>>,
}

/// Event bus owned by a single session
#[derive(Default)]
pub struct EventBus {
    registry: Mutex<Registry>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for every future event of `kind`
    pub fn subscribe<F, Fut>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |event| -> HandlerFuture { Box::pin(handler(event)) });
        let mut registry = self.lock();
        registry.next_id += 1;
        let id = SubscriptionId(registry.next_id);
        registry
            .handlers
            .entry(kind)
            .or_default()
            .push((id, handler));
        id
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registry = self.lock();
        for handlers in registry.handlers.values_mut() {
            if let Some(pos) = handlers.iter().position(|(sid, _)| *sid == id) {
                handlers.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.lock().handlers.get(&kind).map_or(0, Vec::len)
    }

    /// Queue the event for every handler of its kind and return immediately.
    /// Returns the number of handlers queued.
    pub fn publish(&self, event: Event) -> usize {
        let mut registry = self.lock();
        let handlers: Vec<Handler> = registry
            .handlers
            .get(&event.kind())
            .map(|hs| hs.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        if handlers.is_empty() {
            return 0;
        }

        let count = handlers.len();
        trace!("Dispatching {:?} to {} handler(s)", event.kind(), count);

        // Sending under the registry lock keeps the queue in publish order
        let mut dispatch = (event, handlers);
        if let Some(tx) = &registry.dispatcher {
            match tx.send(dispatch) {
                Ok(()) => return count,
                // The dispatcher's runtime is gone, start a new one below
                Err(mpsc::error::SendError(returned)) => dispatch = returned,
            }
        }

        let Some(tx) = spawn_dispatcher() else {
            warn!("No runtime to dispatch {:?}, dropping event", dispatch.0.kind());
            registry.dispatcher = None;
            return 0;
        };
        // A fresh receiver is alive, so this cannot fail
        let _ = tx.send(dispatch);
        registry.dispatcher = Some(tx);
        count
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        // Handlers never run under the lock, so a poisoned registry is still consistent
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Start the dispatcher on the current runtime. It ends when the bus is dropped.
fn spawn_dispatcher() -> Option<mpsc::UnboundedSender<Dispatch>> {
    let runtime = tokio::runtime::Handle::try_current().ok()?;
    let (tx, mut rx) = mpsc::unbounded_channel::<Dispatch>();
    runtime.spawn(async move {
        while let Some((event, handlers)) = rx.recv().await {
            let kind = event.kind();
            for handler in handlers {
                let event = event.clone();
                match tokio::spawn(async move { handler(event).await }).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("{:?} handler failed: {:#}", kind, e),
                    Err(e) => warn!("{:?} handler panicked: {}", kind, e),
                }
            }
        }
        trace!("Event bus closed");
    });
    Some(tx)
}
