//! Task registry
//!
//! Concurrent uid -> task map behind a single mutex. Every mutation is
//! serialized; readers get deep snapshots, never aliases into the map.
//! Transitions are broadcast on the bus, and the registry answers the
//! `task.*` request events itself as a strong subscriber.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::events::{Event, EventBus, EventHandler, EventName, Payload, Retention};

use super::task::{Task, TaskStatus};

/// Retention and cleanup tuning for the registry
#[derive(Clone, Copy, Debug)]
pub struct TaskRegistryConfig {
    /// Records older than this are eligible for eviction (default 24 h)
    pub max_age: Duration,
    /// Opportunistic eviction runs at most once per interval (default 1 h)
    pub cleanup_interval: Duration,
}

impl Default for TaskRegistryConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(86_400),
            cleanup_interval: Duration::from_secs(3_600),
        }
    }
}

/// Errors from registry operations arriving over the bus
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Payload(#[from] crate::events::PayloadError),

    #[error(transparent)]
    Status(#[from] super::task::UnknownTaskStatus),
}

struct Inner {
    tasks: HashMap<String, Task>,
    last_cleanup: Instant,
}

/// The authoritative record of in-flight user requests
pub struct TaskRegistry {
    bus: Arc<EventBus>,
    config: TaskRegistryConfig,
    inner: Mutex<Inner>,
}

impl TaskRegistry {
    pub fn new(bus: Arc<EventBus>, config: TaskRegistryConfig) -> Arc<Self> {
        debug!(?config, "TaskRegistry::new");
        Arc::new(Self {
            bus,
            config,
            inner: Mutex::new(Inner {
                tasks: HashMap::new(),
                last_cleanup: Instant::now(),
            }),
        })
    }

    /// Subscribe this registry to the `task.*` request events
    pub fn attach(self: &Arc<Self>) {
        let handler: Arc<dyn EventHandler> = self.clone();
        for name in [
            EventName::TaskCreateTask,
            EventName::TaskUpdateTaskStatus,
            EventName::TaskGetTask,
            EventName::TaskDeleteTask,
        ] {
            self.bus.subscribe(name, handler.clone(), Retention::Strong);
        }
    }

    /// Insert a fresh PENDING record and broadcast `task.task_created`.
    ///
    /// Triggers opportunistic eviction when the cleanup interval has
    /// elapsed.
    pub fn create_task(&self, task_type: &str, data: Map<String, Value>) -> Task {
        let task = Task::new(task_type, data);
        {
            let mut inner = self.inner.lock().expect("task lock poisoned");
            self.maybe_evict(&mut inner);
            inner.tasks.insert(task.uid.clone(), task.clone());
        }
        debug!(uid = %task.uid, task_type, "TaskRegistry::create_task");
        self.broadcast(EventName::TaskCreated, &task);
        task
    }

    /// Assign a new status, merging result and error when provided.
    ///
    /// Unknown uids are a non-fatal miss: logged, `None` returned. The
    /// snapshot is broadcast as `task.task_status_changed` while the record
    /// still exists in the map.
    pub fn update_task_status(
        &self,
        uid: &str,
        status: TaskStatus,
        result: Option<Map<String, Value>>,
        error: Option<String>,
    ) -> Option<Task> {
        let snapshot = {
            let mut inner = self.inner.lock().expect("task lock poisoned");
            let Some(task) = inner.tasks.get_mut(uid) else {
                warn!(%uid, %status, "TaskRegistry::update_task_status: unknown task");
                return None;
            };
            task.status = status;
            if let Some(merge) = result {
                let target = task.result.get_or_insert_with(Map::new);
                for (key, value) in merge {
                    target.insert(key, value);
                }
            }
            if let Some(message) = error {
                task.error = Some(message);
            }
            let now = Utc::now();
            if now > task.updated_at {
                task.updated_at = now;
            }
            task.clone()
        };
        debug!(%uid, %status, "TaskRegistry::update_task_status");
        self.broadcast(EventName::TaskStatusChanged, &snapshot);
        Some(snapshot)
    }

    /// Snapshot of a record, or `None`
    pub fn get_task(&self, uid: &str) -> Option<Task> {
        let inner = self.inner.lock().expect("task lock poisoned");
        inner.tasks.get(uid).cloned()
    }

    /// Remove a record; `true` when it existed
    pub fn delete_task(&self, uid: &str) -> bool {
        let removed = {
            let mut inner = self.inner.lock().expect("task lock poisoned");
            inner.tasks.remove(uid).is_some()
        };
        debug!(%uid, removed, "TaskRegistry::delete_task");
        removed
    }

    /// Number of live records
    pub fn len(&self) -> usize {
        self.inner.lock().expect("task lock poisoned").tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop aged records if the cleanup interval has elapsed. Caller holds
    /// the lock.
    fn maybe_evict(&self, inner: &mut Inner) {
        if inner.last_cleanup.elapsed() < self.config.cleanup_interval {
            return;
        }
        let now = Utc::now();
        let max_age = chrono::Duration::from_std(self.config.max_age).unwrap_or(chrono::Duration::MAX);
        let before = inner.tasks.len();
        inner.tasks.retain(|_, task| task.age(now) <= max_age);
        let evicted = before - inner.tasks.len();
        inner.last_cleanup = Instant::now();
        if evicted > 0 {
            debug!(evicted, remaining = inner.tasks.len(), "TaskRegistry: evicted aged tasks");
        }
    }

    fn broadcast(&self, name: EventName, task: &Task) {
        match serde_json::to_value(task) {
            Ok(snapshot) => self.bus.emit(name, Payload::new().with("task", snapshot)),
            Err(error) => warn!(%error, uid = %task.uid, "TaskRegistry: snapshot serialization failed"),
        }
    }

    fn on_request(&self, event: &Event) -> Result<Option<Value>, TaskError> {
        match event.name {
            EventName::TaskCreateTask => {
                let task_type = event.data.str("type")?;
                let data = event.data.opt_object("data").cloned().unwrap_or_default();
                let task = self.create_task(task_type, data);
                Ok(Some(serde_json::to_value(task).unwrap_or(Value::Null)))
            }
            EventName::TaskUpdateTaskStatus => {
                let uid = event.data.str("uid")?;
                let status: TaskStatus = event.data.str("status")?.parse()?;
                let result = event.data.opt_object("result").cloned();
                let error = event.data.opt_str("error").map(String::from);
                match self.update_task_status(uid, status, result, error) {
                    Some(task) => Ok(Some(serde_json::to_value(task).unwrap_or(Value::Null))),
                    None => Ok(None),
                }
            }
            EventName::TaskGetTask => {
                let uid = event.data.str("uid")?;
                match self.get_task(uid) {
                    Some(task) => Ok(Some(serde_json::to_value(task).unwrap_or(Value::Null))),
                    None => Ok(None),
                }
            }
            EventName::TaskDeleteTask => {
                let uid = event.data.str("uid")?;
                Ok(Some(Value::Bool(self.delete_task(uid))))
            }
            other => {
                debug!(event = %other, "TaskRegistry: ignoring unrelated event");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl EventHandler for TaskRegistry {
    async fn handle(&self, event: Event) -> eyre::Result<Option<Value>> {
        self.on_request(&event).map_err(Into::into)
    }
}
