//! Event names and the event envelope
//!
//! The event catalogue is closed: every cross-component call in the core
//! travels under one of these names, and the (name, payload shape) pair is a
//! stable contract between producers and consumers.

use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use super::payload::Payload;

/// Closed catalogue of event names, `<category>.<action>` style.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventName {
    // === Chat (core <- UI) ===
    ChatSendMessage,
    ChatStageImage,
    ChatClearStagedImages,

    // === Model provider (core -> provider) ===
    ModelGenerateResponse,
    ModelGetCurrentCharacter,
    ModelOnFailedResponse,

    // === Audio (core -> audio) ===
    AudioVoiceoverRequested,

    // === GUI (core -> UI) ===
    GuiPrepareStreamUi,
    GuiAppendStreamChunk,
    GuiFinishStreamUi,
    GuiUpdateChatUi,
    GuiUpdateStatus,
    GuiUpdateDebugInfo,
    GuiUpdateTokenCount,

    // === Task registry (core <- any / core -> any) ===
    TaskCreateTask,
    TaskUpdateTaskStatus,
    TaskGetTask,
    TaskDeleteTask,
    TaskCreated,
    TaskStatusChanged,

    // === Game server (core <-> server) ===
    ServerGetChatServer,
    ServerSendChatMessage,
    ServerSetPathToSoundFile,

    // === Settings (core <-> settings) ===
    SettingsGetSetting,
    SettingsGetSettings,
    SettingsSaveSetting,
}

impl EventName {
    /// The dotted wire name for this event
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::ChatSendMessage => "chat.send_message",
            EventName::ChatStageImage => "chat.stage_image",
            EventName::ChatClearStagedImages => "chat.clear_staged_images",
            EventName::ModelGenerateResponse => "model.generate_response",
            EventName::ModelGetCurrentCharacter => "model.get_current_character",
            EventName::ModelOnFailedResponse => "model.on_failed_response",
            EventName::AudioVoiceoverRequested => "audio.voiceover_requested",
            EventName::GuiPrepareStreamUi => "gui.prepare_stream_ui",
            EventName::GuiAppendStreamChunk => "gui.append_stream_chunk",
            EventName::GuiFinishStreamUi => "gui.finish_stream_ui",
            EventName::GuiUpdateChatUi => "gui.update_chat_ui",
            EventName::GuiUpdateStatus => "gui.update_status",
            EventName::GuiUpdateDebugInfo => "gui.update_debug_info",
            EventName::GuiUpdateTokenCount => "gui.update_token_count",
            EventName::TaskCreateTask => "task.create_task",
            EventName::TaskUpdateTaskStatus => "task.update_task_status",
            EventName::TaskGetTask => "task.get_task",
            EventName::TaskDeleteTask => "task.delete_task",
            EventName::TaskCreated => "task.task_created",
            EventName::TaskStatusChanged => "task.task_status_changed",
            EventName::ServerGetChatServer => "server.get_chat_server",
            EventName::ServerSendChatMessage => "server.send_chat_message",
            EventName::ServerSetPathToSoundFile => "server.set_path_to_sound_file",
            EventName::SettingsGetSetting => "settings.get_setting",
            EventName::SettingsGetSettings => "settings.get_settings",
            EventName::SettingsSaveSetting => "settings.save_setting",
        }
    }

    /// All catalogue members, for exhaustive wiring checks
    pub fn all() -> &'static [EventName] {
        &[
            EventName::ChatSendMessage,
            EventName::ChatStageImage,
            EventName::ChatClearStagedImages,
            EventName::ModelGenerateResponse,
            EventName::ModelGetCurrentCharacter,
            EventName::ModelOnFailedResponse,
            EventName::AudioVoiceoverRequested,
            EventName::GuiPrepareStreamUi,
            EventName::GuiAppendStreamChunk,
            EventName::GuiFinishStreamUi,
            EventName::GuiUpdateChatUi,
            EventName::GuiUpdateStatus,
            EventName::GuiUpdateDebugInfo,
            EventName::GuiUpdateTokenCount,
            EventName::TaskCreateTask,
            EventName::TaskUpdateTaskStatus,
            EventName::TaskGetTask,
            EventName::TaskDeleteTask,
            EventName::TaskCreated,
            EventName::TaskStatusChanged,
            EventName::ServerGetChatServer,
            EventName::ServerSendChatMessage,
            EventName::ServerSetPathToSoundFile,
            EventName::SettingsGetSetting,
            EventName::SettingsGetSettings,
            EventName::SettingsSaveSetting,
        ]
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for unrecognized event names
#[derive(Debug, thiserror::Error)]
#[error("unknown event name: {0}")]
pub struct UnknownEventName(pub String);

impl FromStr for EventName {
    type Err = UnknownEventName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventName::all()
            .iter()
            .copied()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| UnknownEventName(s.to_string()))
    }
}

/// A named, data-carrying message dispatched through the bus
#[derive(Clone, Debug)]
pub struct Event {
    /// Catalogue name
    pub name: EventName,
    /// Call parameters or return values, keyed by string
    pub data: Payload,
    /// Monotonic creation time
    pub timestamp: Instant,
}

impl Event {
    pub fn new(name: EventName, data: Payload) -> Self {
        Self {
            name,
            data,
            timestamp: Instant::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_name_roundtrip() {
        for name in EventName::all() {
            let parsed: EventName = name.as_str().parse().unwrap();
            assert_eq!(parsed, *name);
        }
    }

    #[test]
    fn test_event_name_namespaced() {
        for name in EventName::all() {
            let s = name.as_str();
            assert!(
                s.split('.').count() == 2,
                "event name {} should be <category>.<action>",
                s
            );
        }
    }

    #[test]
    fn test_unknown_event_name() {
        let err = "chat.does_not_exist".parse::<EventName>().unwrap_err();
        assert!(err.to_string().contains("chat.does_not_exist"));
    }

    #[test]
    fn test_event_timestamp_monotonic() {
        let a = Event::new(EventName::GuiUpdateStatus, Payload::new());
        let b = Event::new(EventName::GuiUpdateStatus, Payload::new());
        assert!(b.timestamp >= a.timestamp);
    }
}
