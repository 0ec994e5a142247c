//! In-process coordination core for a desktop AI-companion application.
//!
//! The enclosing application is GUI-driven; this crate owns none of the UI,
//! providers, or persistence. It supplies the substrate they coordinate
//! through: a typed event bus with weak-reference subscriptions, an
//! in-memory task registry with lifecycle broadcasts, and a chat controller
//! that composes one response per user message out of LLM generation,
//! streaming, voiceover, and game-server forwarding.
//!
//! Collaborators (UI, model providers, TTS, the game server, the settings
//! store) plug in as bus subscribers; nothing in here calls them directly.

pub mod chat;
pub mod config;
pub mod events;
pub mod settings;
pub mod tasks;

pub use chat::{ChatConfig, ChatController};
pub use config::Config;
pub use events::{Event, EventBus, EventHandler, EventName, Payload, Retention, create_event_bus};
pub use settings::Settings;
pub use tasks::{Task, TaskRegistry, TaskRegistryConfig, TaskStatus};

use std::sync::Arc;
use std::time::Duration;

use eyre::Result;

/// Assembled core: bus, registry, and controller wired together
pub struct Core {
    pub bus: Arc<EventBus>,
    pub tasks: Arc<TaskRegistry>,
    pub chat: Arc<ChatController>,
}

impl Core {
    /// Build and attach every component from one configuration
    pub fn from_config(config: &Config) -> Self {
        let bus = Arc::new(EventBus::new(config.bus.worker_permits));
        let tasks = TaskRegistry::new(bus.clone(), (&config.tasks).into());
        tasks.attach();
        let chat = ChatController::new(bus.clone(), (&config.chat).into());
        chat.attach();
        Self { bus, tasks, chat }
    }

    /// Read-through settings handle over this core's bus
    pub fn settings(&self, timeout: Duration) -> Settings {
        Settings::new(self.bus.clone(), timeout)
    }

    /// Stop dispatch and let in-flight handlers finish
    pub async fn shutdown(&self) {
        self.bus.shutdown().await;
    }
}

/// Set up tracing for host applications that have no subscriber of their
/// own. Level comes from `RUST_LOG`, falling back to the given default.
pub fn init_tracing(default_level: tracing::Level) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .try_init()
        .map_err(|e| eyre::eyre!("Failed to setup tracing: {e}"))?;
    Ok(())
}
