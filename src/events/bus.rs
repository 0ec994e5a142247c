//! Event Bus - central pub/sub hub for the companion core
//!
//! Every cross-component call travels through this bus: fire-and-forget
//! emission via a queued dispatcher, inline synchronous emission, and
//! reply-collecting `emit_and_wait`. Each subscription owns a private FIFO
//! delivery channel, so async emits of one event name from one producer
//! reach a given subscriber in publish order; a shared semaphore bounds how
//! many handlers run at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::handler::EventHandler;
use super::payload::Payload;
use super::types::{Event, EventName};

/// Default bound on concurrently running handlers (the "worker pool")
pub const DEFAULT_WORKER_PERMITS: usize = 5;

/// Default collection window for [`EventBus::emit_and_wait`]
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Whether a subscription keeps its handler alive
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Retention {
    /// The bus holds the handler until unsubscribed
    Strong,
    /// The bus holds a weak reference; the entry is pruned at snapshot time
    /// once the handler is dropped elsewhere
    Weak,
}

#[derive(Clone)]
enum HandlerRef {
    Strong(Arc<dyn EventHandler>),
    Weak(Weak<dyn EventHandler>),
}

impl HandlerRef {
    fn upgrade(&self) -> Option<Arc<dyn EventHandler>> {
        match self {
            HandlerRef::Strong(handler) => Some(handler.clone()),
            HandlerRef::Weak(weak) => weak.upgrade(),
        }
    }

    fn is(&self, other: &Arc<dyn EventHandler>) -> bool {
        match self.upgrade() {
            Some(handler) => Arc::ptr_eq(&handler, other),
            None => false,
        }
    }
}

/// Opaque subscription identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    handler: HandlerRef,
    /// Private FIFO feed into this subscription's delivery worker
    feed: mpsc::UnboundedSender<Event>,
    worker: JoinHandle<()>,
}

struct Shared {
    subscriptions: Mutex<HashMap<EventName, Vec<Subscription>>>,
    permits: Arc<Semaphore>,
    running: AtomicBool,
}

impl Shared {
    /// Snapshot live handlers for `name`, pruning dead weak entries back
    /// into the table.
    fn snapshot(&self, name: EventName) -> Vec<Arc<dyn EventHandler>> {
        let mut subscriptions = self.subscriptions.lock().expect("subscription lock poisoned");
        let Some(entries) = subscriptions.get_mut(&name) else {
            return Vec::new();
        };
        entries.retain(|sub| sub.handler.upgrade().is_some());
        entries.iter().filter_map(|sub| sub.handler.upgrade()).collect()
    }

    /// Snapshot live delivery feeds for `name`, pruning dead weak entries.
    fn snapshot_feeds(&self, name: EventName) -> Vec<mpsc::UnboundedSender<Event>> {
        let mut subscriptions = self.subscriptions.lock().expect("subscription lock poisoned");
        let Some(entries) = subscriptions.get_mut(&name) else {
            return Vec::new();
        };
        entries.retain(|sub| sub.handler.upgrade().is_some());
        entries.iter().map(|sub| sub.feed.clone()).collect()
    }
}

/// Central event bus
///
/// Thread-safe and cheap to share behind an [`Arc`]. States are RUNNING
/// (accepts emits) and STOPPED (emits silently dropped); the transition is
/// one-way via [`EventBus::shutdown`].
pub struct EventBus {
    shared: Arc<Shared>,
    queue: Mutex<Option<mpsc::UnboundedSender<Event>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Create a bus with the given handler-concurrency bound.
    ///
    /// Must be called within a Tokio runtime; the dispatcher task is spawned
    /// immediately.
    pub fn new(worker_permits: usize) -> Self {
        debug!(worker_permits, "EventBus::new: creating event bus");
        let shared = Arc::new(Shared {
            subscriptions: Mutex::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(worker_permits.max(1))),
            running: AtomicBool::new(true),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(dispatch_loop(shared.clone(), rx));

        Self {
            shared,
            queue: Mutex::new(Some(tx)),
            dispatcher: Mutex::new(Some(dispatcher)),
            next_id: AtomicU64::new(0),
        }
    }

    /// Create a bus with the default worker capacity
    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_WORKER_PERMITS)
    }

    /// Register a handler under an event name.
    ///
    /// Duplicate registrations are permitted; the handler is appended. With
    /// [`Retention::Weak`] the caller keeps the handler alive; once the last
    /// strong reference drops the subscription is pruned before the next
    /// dispatch snapshot of that event.
    pub fn subscribe(
        &self,
        name: EventName,
        handler: Arc<dyn EventHandler>,
        retention: Retention,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        debug!(event = %name, ?retention, sub_id = id.0, "EventBus::subscribe");

        let handler_ref = match retention {
            Retention::Strong => HandlerRef::Strong(handler),
            Retention::Weak => HandlerRef::Weak(Arc::downgrade(&handler)),
        };

        let (feed, feed_rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(delivery_loop(
            name,
            handler_ref.clone(),
            self.shared.permits.clone(),
            feed_rx,
        ));

        let mut subscriptions = self
            .shared
            .subscriptions
            .lock()
            .expect("subscription lock poisoned");
        subscriptions.entry(name).or_default().push(Subscription {
            id,
            handler: handler_ref,
            feed,
            worker,
        });
        id
    }

    /// Remove the first subscription whose handler is the same object as
    /// `handler`. No-op if absent.
    pub fn unsubscribe(&self, name: EventName, handler: &Arc<dyn EventHandler>) -> bool {
        let mut subscriptions = self
            .shared
            .subscriptions
            .lock()
            .expect("subscription lock poisoned");
        let Some(entries) = subscriptions.get_mut(&name) else {
            return false;
        };
        let Some(position) = entries.iter().position(|sub| sub.handler.is(handler)) else {
            debug!(event = %name, "EventBus::unsubscribe: handler not registered");
            return false;
        };
        let removed = entries.remove(position);
        debug!(event = %name, sub_id = removed.id.0, "EventBus::unsubscribe: removed");
        // Dropping the feed lets the delivery worker drain and exit.
        true
    }

    /// Remove a subscription by its identifier. No-op if absent.
    pub fn unsubscribe_id(&self, name: EventName, id: SubscriptionId) -> bool {
        let mut subscriptions = self
            .shared
            .subscriptions
            .lock()
            .expect("subscription lock poisoned");
        let Some(entries) = subscriptions.get_mut(&name) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|sub| sub.id != id);
        before != entries.len()
    }

    /// Enqueue an event for asynchronous delivery.
    ///
    /// Returns immediately after enqueue. Emits after shutdown are silently
    /// dropped.
    pub fn emit(&self, name: EventName, data: Payload) {
        if !self.shared.running.load(Ordering::SeqCst) {
            debug!(event = %name, "EventBus::emit: bus stopped, dropping");
            return;
        }
        let queue = self.queue.lock().expect("queue lock poisoned");
        if let Some(tx) = queue.as_ref() {
            let _ = tx.send(Event::new(name, data));
        }
    }

    /// Dispatch an event inline, awaiting every active subscriber in
    /// subscription order.
    pub async fn emit_sync(&self, name: EventName, data: Payload) {
        if !self.shared.running.load(Ordering::SeqCst) {
            debug!(event = %name, "EventBus::emit_sync: bus stopped, dropping");
            return;
        }
        let handlers = self.shared.snapshot(name);
        let event = Event::new(name, data);
        for handler in handlers {
            if let Err(error) = handler.handle(event.clone()).await {
                warn!(event = %name, %error, "EventBus::emit_sync: handler failed");
            }
        }
    }

    /// Dispatch an event to all active subscribers in parallel and collect
    /// their return values.
    ///
    /// Non-null results are appended in completion order; the call returns
    /// early after `timeout` with whatever has been collected. With no
    /// subscribers it returns an empty list immediately.
    pub async fn emit_and_wait(&self, name: EventName, data: Payload, timeout: Duration) -> Vec<Value> {
        if !self.shared.running.load(Ordering::SeqCst) {
            debug!(event = %name, "EventBus::emit_and_wait: bus stopped");
            return Vec::new();
        }
        let handlers = self.shared.snapshot(name);
        if handlers.is_empty() {
            debug!(event = %name, "EventBus::emit_and_wait: no subscribers");
            return Vec::new();
        }

        let expected = handlers.len();
        let event = Event::new(name, data);
        let (tx, mut rx) = mpsc::channel::<Option<Value>>(expected);

        for handler in handlers {
            let event = event.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let outcome = match handler.handle(event).await {
                    Ok(value) => value,
                    Err(error) => {
                        warn!(event = %name, %error, "EventBus::emit_and_wait: handler failed");
                        None
                    }
                };
                let _ = tx.send(outcome).await;
            });
        }
        drop(tx);

        let deadline = tokio::time::Instant::now() + timeout;
        let mut results = Vec::new();
        let mut received = 0usize;
        while received < expected {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(outcome)) => {
                    received += 1;
                    match outcome {
                        Some(Value::Null) | None => {}
                        Some(value) => results.push(value),
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    debug!(event = %name, received, expected, "EventBus::emit_and_wait: timed out");
                    break;
                }
            }
        }
        results
    }

    /// Number of live subscriptions for an event name
    pub fn subscriber_count(&self, name: EventName) -> usize {
        self.shared.snapshot(name).len()
    }

    /// Whether the bus still accepts emits
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Stop the dispatch loop, drain the queue, and join delivery workers.
    ///
    /// Idempotent; in-flight handler invocations are allowed to finish and
    /// later emits are silently dropped.
    pub async fn shutdown(&self) {
        if self.shared.running.swap(false, Ordering::SeqCst) {
            debug!("EventBus::shutdown: stopping");
        } else {
            debug!("EventBus::shutdown: already stopped");
            return;
        }

        // Close the queue so the dispatcher drains whatever is buffered and
        // exits.
        let queue = self.queue.lock().expect("queue lock poisoned").take();
        drop(queue);
        let dispatcher = self.dispatcher.lock().expect("dispatcher lock poisoned").take();
        if let Some(handle) = dispatcher {
            let _ = handle.await;
        }

        // Dropping feeds lets each delivery worker finish its backlog.
        let drained: Vec<Subscription> = {
            let mut subscriptions = self
                .shared
                .subscriptions
                .lock()
                .expect("subscription lock poisoned");
            subscriptions.drain().flat_map(|(_, entries)| entries).collect()
        };
        for subscription in drained {
            let Subscription { feed, worker, .. } = subscription;
            drop(feed);
            let _ = worker.await;
        }
        debug!("EventBus::shutdown: complete");
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

/// Create an event bus wrapped in an Arc for shared ownership
pub fn create_event_bus() -> Arc<EventBus> {
    Arc::new(EventBus::with_default_capacity())
}

/// Single consumer of the async emit queue: snapshots live subscribers per
/// event and forwards into their FIFO feeds, preserving publish order.
async fn dispatch_loop(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<Event>) {
    debug!("dispatch_loop: started");
    while let Some(event) = rx.recv().await {
        let feeds = shared.snapshot_feeds(event.name);
        for feed in feeds {
            let _ = feed.send(event.clone());
        }
    }
    debug!("dispatch_loop: queue closed, exiting");
}

/// Per-subscription delivery worker: serializes invocations for one
/// subscriber and isolates its failures from every other handler.
async fn delivery_loop(
    name: EventName,
    handler: HandlerRef,
    permits: Arc<Semaphore>,
    mut rx: mpsc::UnboundedReceiver<Event>,
) {
    while let Some(event) = rx.recv().await {
        let Some(handler) = handler.upgrade() else {
            debug!(event = %name, "delivery_loop: handler dropped, exiting");
            break;
        };
        let _permit = permits.acquire().await.ok();
        if let Err(error) = handler.handle(event).await {
            warn!(event = %name, %error, "delivery_loop: handler failed");
        }
    }
}
