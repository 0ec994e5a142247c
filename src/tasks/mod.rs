//! Task lifecycle: records and the in-memory registry

mod registry;
mod task;

pub use registry::{TaskError, TaskRegistry, TaskRegistryConfig};
pub use task::{Task, TaskStatus, UnknownTaskStatus};
