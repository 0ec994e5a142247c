//! Read-through settings access
//!
//! The settings store is an external collaborator. Every lookup goes over
//! the bus at the moment of use; nothing is cached across an event
//! boundary, so a value changed in the UI is visible to the very next
//! request.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::debug;

use crate::events::{EventBus, EventName, Payload};

/// Thin handle for settings lookups over the bus
#[derive(Clone)]
pub struct Settings {
    bus: Arc<EventBus>,
    timeout: Duration,
}

impl Settings {
    pub fn new(bus: Arc<EventBus>, timeout: Duration) -> Self {
        Self { bus, timeout }
    }

    /// Fetch one setting; first reply wins
    pub async fn get(&self, key: &str) -> Option<Value> {
        let replies = self
            .bus
            .emit_and_wait(EventName::SettingsGetSetting, Payload::new().with("key", key), self.timeout)
            .await;
        let value = replies.into_iter().next();
        debug!(key, found = value.is_some(), "Settings::get");
        value
    }

    /// Boolean setting with tolerant string forms ("true", "1", "on")
    pub async fn bool_or(&self, key: &str, default: bool) -> bool {
        match self.get(key).await {
            Some(Value::Bool(b)) => b,
            Some(Value::String(s)) => matches!(s.to_lowercase().as_str(), "true" | "1" | "on" | "yes"),
            Some(Value::Number(n)) => n.as_i64().map(|v| v != 0).unwrap_or(default),
            _ => default,
        }
    }

    /// String setting with a fallback
    pub async fn str_or(&self, key: &str, default: &str) -> String {
        match self.get(key).await {
            Some(Value::String(s)) => s,
            _ => default.to_string(),
        }
    }

    /// Full settings snapshot, when the collaborator supports it
    pub async fn all(&self) -> Option<Map<String, Value>> {
        self.bus
            .emit_and_wait(EventName::SettingsGetSettings, Payload::new(), self.timeout)
            .await
            .into_iter()
            .next()
            .and_then(|value| match value {
                Value::Object(map) => Some(map),
                _ => None,
            })
    }

    /// Fire-and-forget write-through
    pub fn save(&self, key: &str, value: Value) {
        debug!(key, "Settings::save");
        self.bus.emit(
            EventName::SettingsSaveSetting,
            Payload::new().with("key", key).with("value", value),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Retention, create_event_bus, handler_fn};

    fn fake_settings_provider(bus: &Arc<EventBus>, key: &'static str, value: Value) {
        bus.subscribe(
            EventName::SettingsGetSetting,
            handler_fn(move |event| {
                if event.data.str("key")? == key {
                    Ok(Some(value.clone()))
                } else {
                    Ok(None)
                }
            }),
            Retention::Strong,
        );
    }

    #[tokio::test]
    async fn test_get_reads_through_bus() {
        let bus = create_event_bus();
        fake_settings_provider(&bus, "ENABLE_STREAMING", Value::Bool(true));

        let settings = Settings::new(bus, Duration::from_secs(1));
        assert!(settings.bool_or("ENABLE_STREAMING", false).await);
        assert!(!settings.bool_or("USE_VOICEOVER", false).await);
    }

    #[tokio::test]
    async fn test_bool_tolerates_string_forms() {
        let bus = create_event_bus();
        fake_settings_provider(&bus, "USE_VOICEOVER", Value::from("True"));

        let settings = Settings::new(bus, Duration::from_secs(1));
        assert!(settings.bool_or("USE_VOICEOVER", false).await);
    }

    #[tokio::test]
    async fn test_missing_provider_falls_back_fast() {
        let bus = create_event_bus();
        let settings = Settings::new(bus, Duration::from_secs(30));

        let started = std::time::Instant::now();
        assert_eq!(settings.str_or("AUDIO_BOT", "silero").await, "silero");
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_save_emits_write_through() {
        let bus = create_event_bus();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.subscribe(
            EventName::SettingsSaveSetting,
            handler_fn(move |event| {
                let _ = tx.send((
                    event.data.str("key")?.to_string(),
                    event.data.get("value").cloned().unwrap_or(Value::Null),
                ));
                Ok(None)
            }),
            Retention::Strong,
        );

        let settings = Settings::new(bus, Duration::from_secs(1));
        settings.save("VOLUME", Value::from(7));

        let (key, value) = rx.recv().await.unwrap();
        assert_eq!(key, "VOLUME");
        assert_eq!(value, Value::from(7));
    }
}
