//! Event system: catalogue, payloads, handler seam, and the bus

mod bus;
mod handler;
mod payload;
mod types;

pub use bus::{
    DEFAULT_WAIT_TIMEOUT, DEFAULT_WORKER_PERMITS, EventBus, Retention, SubscriptionId, create_event_bus,
};
pub use handler::{EventHandler, async_handler_fn, handler_fn};
pub use payload::{Payload, PayloadError, StreamSink};
pub use types::{Event, EventName, UnknownEventName};
