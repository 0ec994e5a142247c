//! Subscriber seam
//!
//! Handlers are trait objects so components (controller, registry) subscribe
//! themselves, while closures cover collaborator stubs and one-off wiring.
//! A handler error never escapes the bus: it is logged and contributes a
//! null slot to collected results.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use super::types::Event;

/// A callable registered under an event name
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Process one event, optionally returning a value for `emit_and_wait`
    /// collectors.
    async fn handle(&self, event: Event) -> eyre::Result<Option<Value>>;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> eyre::Result<Option<Value>> + Send + Sync,
{
    async fn handle(&self, event: Event) -> eyre::Result<Option<Value>> {
        (self.f)(event)
    }
}

/// Wrap a synchronous closure as a handler
pub fn handler_fn<F>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> eyre::Result<Option<Value>> + Send + Sync + 'static,
{
    Arc::new(FnHandler { f })
}

struct AsyncFnHandler<F> {
    f: F,
}

#[async_trait]
impl<F> EventHandler for AsyncFnHandler<F>
where
    F: Fn(Event) -> BoxFuture<'static, eyre::Result<Option<Value>>> + Send + Sync,
{
    async fn handle(&self, event: Event) -> eyre::Result<Option<Value>> {
        (self.f)(event).await
    }
}

/// Wrap a future-returning closure as a handler
pub fn async_handler_fn<F>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> BoxFuture<'static, eyre::Result<Option<Value>>> + Send + Sync + 'static,
{
    Arc::new(AsyncFnHandler { f })
}
