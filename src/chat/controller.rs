//! Chat controller
//!
//! Subscribes to the `chat.*` entry events and composes one response per
//! user message: LLM generation via `model.generate_response`, optional
//! streaming into the UI, optional voiceover handoff, game-server
//! forwarding, and task status transitions along the way. The controller
//! itself never mutates tasks; every transition goes through
//! `task.update_task_status`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::events::{Event, EventBus, EventHandler, EventName, Payload, PayloadError, Retention, StreamSink};
use crate::settings::Settings;
use crate::tasks::TaskStatus;

use super::voice;

/// Diagnostic attached to `model.on_failed_response` when generation
/// produces nothing within the budget
pub const TIMEOUT_DIAGNOSTIC: &str = "Превышено время ожидания ответа";

const DEFAULT_APOLOGY: &str = "Прости, я немного отвлеклась... Что ты говорил?";

/// Tuning for the chat controller
#[derive(Clone, Debug)]
pub struct ChatConfig {
    /// Outer budget for one LLM generation (default 600 s)
    pub generate_timeout: Duration,
    /// Budget for settings and server availability lookups
    pub settings_timeout: Duration,
    /// Canned reply returned when generation fails
    pub apology: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            generate_timeout: Duration::from_secs(600),
            settings_timeout: Duration::from_secs(5),
            apology: DEFAULT_APOLOGY.to_string(),
        }
    }
}

/// Turns `chat.send_message` into a composed response
pub struct ChatController {
    bus: Arc<EventBus>,
    settings: Settings,
    config: ChatConfig,
    llm_processing: AtomicBool,
    staged_images: Mutex<Vec<PathBuf>>,
}

impl ChatController {
    pub fn new(bus: Arc<EventBus>, config: ChatConfig) -> Arc<Self> {
        let settings = Settings::new(bus.clone(), config.settings_timeout);
        Arc::new(Self {
            bus,
            settings,
            config,
            llm_processing: AtomicBool::new(false),
            staged_images: Mutex::new(Vec::new()),
        })
    }

    /// Subscribe this controller to the `chat.*` entry events
    pub fn attach(self: &Arc<Self>) {
        let handler: Arc<dyn EventHandler> = self.clone();
        for name in [
            EventName::ChatSendMessage,
            EventName::ChatStageImage,
            EventName::ChatClearStagedImages,
        ] {
            self.bus.subscribe(name, handler.clone(), Retention::Strong);
        }
    }

    /// Whether a generation is currently in flight
    pub fn is_processing(&self) -> bool {
        self.llm_processing.load(Ordering::SeqCst)
    }

    async fn handle_send_message(&self, event: &Event) -> Result<Option<Value>, PayloadError> {
        let user_input = event.data.str("user_input")?.to_string();
        let system_input = event.data.opt_str("system_input").unwrap_or_default().to_string();
        let message_id = event.data.opt_str("message_id").map(String::from);

        info!(message_id = ?message_id, "ChatController: message received");
        self.llm_processing.store(true, Ordering::SeqCst);

        let streaming = self.settings.bool_or("ENABLE_STREAMING", false).await;
        if streaming {
            self.bus.emit(EventName::GuiPrepareStreamUi, Payload::new());
        }

        let mut request = Payload::new()
            .with("user_input", user_input)
            .with("system_input", system_input)
            .with("image_data", Value::Array(self.take_image_data(event)));
        if let Some(uid) = &message_id {
            request.insert("message_id", uid.clone());
        }
        if streaming {
            request = request.with_stream(self.stream_sink());
        }

        let replies = self
            .bus
            .emit_and_wait(EventName::ModelGenerateResponse, request, self.config.generate_timeout)
            .await;
        let reply = replies.into_iter().find_map(|value| match value {
            Value::String(text) if !text.is_empty() => Some(text),
            _ => None,
        });

        let Some(reply) = reply else {
            warn!(message_id = ?message_id, "ChatController: no reply from provider");
            self.bus.emit(
                EventName::ModelOnFailedResponse,
                Payload::new().with("error", TIMEOUT_DIAGNOSTIC),
            );
            if let Some(uid) = &message_id {
                self.update_task(uid, TaskStatus::FailedOnGeneration, None, Some(TIMEOUT_DIAGNOSTIC))
                    .await;
            }
            self.llm_processing.store(false, Ordering::SeqCst);
            return Ok(Some(Value::String(self.config.apology.clone())));
        };

        let voiced = self.settings.bool_or("USE_VOICEOVER", false).await;
        if voiced {
            self.request_voiceover(&reply, message_id.as_deref()).await;
        }

        if streaming {
            self.bus.emit(EventName::GuiFinishStreamUi, Payload::new());
        } else {
            let mut ui = Payload::new()
                .with("role", "assistant")
                .with("response", reply.clone())
                .with("is_initial", false);
            if let Some(emotion) = voice::extract_emotion(&reply) {
                ui.insert("emotion", emotion);
            }
            self.bus.emit(EventName::GuiUpdateChatUi, ui);
        }
        self.bus.emit(EventName::GuiUpdateStatus, Payload::new().with("status", "idle"));
        self.bus.emit(
            EventName::GuiUpdateDebugInfo,
            Payload::new().with("last_response_len", reply.chars().count() as u64),
        );
        self.bus.emit(
            EventName::GuiUpdateTokenCount,
            Payload::new().with("tokens", voice::approx_tokens(&reply)),
        );

        if let Some(uid) = &message_id {
            if !voiced {
                let mut result = Map::new();
                result.insert("response".to_string(), Value::String(reply.clone()));
                self.update_task(uid, TaskStatus::Success, Some(result), None).await;
            }
        }

        self.forward_to_game(&reply).await;

        self.llm_processing.store(false, Ordering::SeqCst);
        Ok(Some(Value::String(reply)))
    }

    /// Chunk forwarder handed to the provider for this request
    fn stream_sink(&self) -> StreamSink {
        let bus = self.bus.clone();
        Arc::new(move |chunk: &str| {
            bus.emit(EventName::GuiAppendStreamChunk, Payload::new().with("chunk", chunk));
        })
    }

    /// Staged paths plus any image data carried on the event itself
    fn take_image_data(&self, event: &Event) -> Vec<Value> {
        let mut images: Vec<Value> = self
            .staged_images
            .lock()
            .expect("staged image lock poisoned")
            .drain(..)
            .map(|path| Value::String(path.to_string_lossy().into_owned()))
            .collect();
        if let Some(Value::Array(extra)) = event.data.get("image_data") {
            images.extend(extra.iter().cloned());
        }
        images
    }

    /// Voice-safe text to TTS; the raw reply keeps its tags for the UI
    async fn request_voiceover(&self, reply: &str, message_id: Option<&str>) {
        let character = self
            .bus
            .emit_and_wait(EventName::ModelGetCurrentCharacter, Payload::new(), self.config.settings_timeout)
            .await
            .into_iter()
            .next()
            .unwrap_or(Value::Null);
        let audio_bot = self.settings.str_or("AUDIO_BOT", "silero").await;
        let speaker = voice::speaker_for(&character, &audio_bot);
        let text = voice::voice_safe(reply);
        debug!(%speaker, "ChatController: requesting voiceover");

        if let Some(uid) = message_id {
            let mut result = Map::new();
            result.insert("response".to_string(), Value::String(reply.to_string()));
            self.update_task(uid, TaskStatus::Voicing, Some(result), None).await;
        }

        let mut request = Payload::new().with("text", text).with("speaker", speaker);
        if let Some(uid) = message_id {
            request.insert("message_id", uid);
        }
        self.bus.emit(EventName::AudioVoiceoverRequested, request);
    }

    /// Forward the final reply to the game when its chat server is up.
    /// Failures here are logged, never fatal.
    async fn forward_to_game(&self, reply: &str) {
        let available = self
            .bus
            .emit_and_wait(EventName::ServerGetChatServer, Payload::new(), self.config.settings_timeout)
            .await
            .into_iter()
            .next()
            .and_then(|value| value.as_bool())
            .unwrap_or(false);
        if !available {
            return;
        }
        debug!("ChatController: forwarding reply to game server");
        self.bus
            .emit(EventName::ServerSendChatMessage, Payload::new().with("text", reply));
    }

    /// Status transition through the registry, inline so the record is
    /// settled before the next step of the request
    async fn update_task(&self, uid: &str, status: TaskStatus, result: Option<Map<String, Value>>, error: Option<&str>) {
        let mut payload = Payload::new().with("uid", uid).with("status", status.as_str());
        if let Some(result) = result {
            payload.insert("result", Value::Object(result));
        }
        if let Some(error) = error {
            payload.insert("error", error);
        }
        self.bus.emit_sync(EventName::TaskUpdateTaskStatus, payload).await;
    }

    /// Stage an image for the next send. Raw bytes land in a fresh temp
    /// file; paths are staged as given.
    fn stage_image(&self, event: &Event) -> Result<Option<Value>, StageError> {
        let path = match event.data.get("image_data") {
            Some(Value::String(path)) => PathBuf::from(path),
            Some(Value::Array(bytes)) => {
                let bytes: Vec<u8> = bytes
                    .iter()
                    .map(|value| {
                        value
                            .as_u64()
                            .and_then(|byte| u8::try_from(byte).ok())
                            .ok_or(PayloadError::WrongType {
                                key: "image_data".to_string(),
                                expected: "byte array",
                            })
                    })
                    .collect::<Result<_, _>>()?;
                persist_image_bytes(&bytes)?
            }
            Some(_) => {
                return Err(PayloadError::WrongType {
                    key: "image_data".to_string(),
                    expected: "string or byte array",
                }
                .into());
            }
            None => return Err(PayloadError::MissingKey("image_data".to_string()).into()),
        };
        debug!(path = %path.display(), "ChatController: image staged");
        let mut staged = self.staged_images.lock().expect("staged image lock poisoned");
        staged.push(path);
        Ok(Some(Value::from(staged.len() as u64)))
    }

    fn clear_staged_images(&self) {
        let mut staged = self.staged_images.lock().expect("staged image lock poisoned");
        debug!(count = staged.len(), "ChatController: clearing staged images");
        staged.clear();
    }

    /// Staged paths without draining them; test and diagnostics hook
    pub fn staged_image_paths(&self) -> Vec<PathBuf> {
        self.staged_images.lock().expect("staged image lock poisoned").clone()
    }
}

#[derive(Debug, thiserror::Error)]
enum StageError {
    #[error(transparent)]
    Payload(#[from] PayloadError),

    #[error("failed to persist image bytes: {0}")]
    Io(#[from] std::io::Error),
}

fn persist_image_bytes(bytes: &[u8]) -> std::io::Result<PathBuf> {
    use std::io::Write;

    let mut file = tempfile::Builder::new().prefix("staged-image-").suffix(".img").tempfile()?;
    file.write_all(bytes)?;
    let (_, path) = file.keep().map_err(|error| error.error)?;
    Ok(path)
}

#[async_trait]
impl EventHandler for ChatController {
    async fn handle(&self, event: Event) -> eyre::Result<Option<Value>> {
        match event.name {
            EventName::ChatSendMessage => self.handle_send_message(&event).await.map_err(Into::into),
            EventName::ChatStageImage => self.stage_image(&event).map_err(Into::into),
            EventName::ChatClearStagedImages => {
                self.clear_staged_images();
                Ok(None)
            }
            other => {
                debug!(event = %other, "ChatController: ignoring unrelated event");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{create_event_bus, handler_fn};
    use tokio::sync::mpsc;

    fn settings_provider(bus: &Arc<EventBus>, values: Vec<(&'static str, Value)>) {
        bus.subscribe(
            EventName::SettingsGetSetting,
            handler_fn(move |event| {
                let key = event.data.str("key")?;
                Ok(values.iter().find(|(k, _)| *k == key).map(|(_, v)| v.clone()))
            }),
            Retention::Strong,
        );
    }

    fn text_provider(bus: &Arc<EventBus>, reply: &'static str) {
        bus.subscribe(
            EventName::ModelGenerateResponse,
            handler_fn(move |_event| Ok(Some(Value::from(reply)))),
            Retention::Strong,
        );
    }

    fn capture(bus: &Arc<EventBus>, name: EventName) -> mpsc::UnboundedReceiver<Map<String, Value>> {
        let (tx, rx) = mpsc::unbounded_channel();
        bus.subscribe(
            name,
            handler_fn(move |event| {
                let _ = tx.send(event.data.values().clone());
                Ok(None)
            }),
            Retention::Strong,
        );
        rx
    }

    fn quick_config() -> ChatConfig {
        ChatConfig {
            generate_timeout: Duration::from_secs(2),
            settings_timeout: Duration::from_millis(200),
            ..ChatConfig::default()
        }
    }

    #[tokio::test]
    async fn test_plain_chat_updates_ui() {
        let bus = create_event_bus();
        settings_provider(&bus, vec![]);
        text_provider(&bus, "hello");
        let mut ui = capture(&bus, EventName::GuiUpdateChatUi);
        let mut status = capture(&bus, EventName::GuiUpdateStatus);

        let controller = ChatController::new(bus.clone(), quick_config());
        controller.attach();

        let replies = bus
            .emit_and_wait(
                EventName::ChatSendMessage,
                Payload::new().with("user_input", "hi").with("system_input", ""),
                Duration::from_secs(5),
            )
            .await;
        assert_eq!(replies, vec![Value::from("hello")]);

        let update = ui.recv().await.unwrap();
        assert_eq!(update["role"], "assistant");
        assert_eq!(update["response"], "hello");
        assert_eq!(update["is_initial"], false);
        assert!(status.recv().await.is_some());
        assert!(!controller.is_processing());
    }

    #[tokio::test]
    async fn test_streaming_chat_uses_stream_ui() {
        let bus = create_event_bus();
        settings_provider(&bus, vec![("ENABLE_STREAMING", Value::Bool(true))]);
        bus.subscribe(
            EventName::ModelGenerateResponse,
            handler_fn(|event| {
                let sink = event.data.stream().ok_or_else(|| PayloadError::MissingKey("stream".into()))?;
                sink("hel");
                sink("lo");
                Ok(Some(Value::from("hello")))
            }),
            Retention::Strong,
        );
        let mut prepare = capture(&bus, EventName::GuiPrepareStreamUi);
        let mut chunks = capture(&bus, EventName::GuiAppendStreamChunk);
        let mut finish = capture(&bus, EventName::GuiFinishStreamUi);

        let controller = ChatController::new(bus.clone(), quick_config());
        controller.attach();

        let replies = bus
            .emit_and_wait(
                EventName::ChatSendMessage,
                Payload::new().with("user_input", "hi"),
                Duration::from_secs(5),
            )
            .await;
        assert_eq!(replies, vec![Value::from("hello")]);

        assert!(prepare.recv().await.is_some());
        assert_eq!(chunks.recv().await.unwrap()["chunk"], "hel");
        assert_eq!(chunks.recv().await.unwrap()["chunk"], "lo");
        assert!(finish.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_voiceover_request_strips_tags() {
        let bus = create_event_bus();
        settings_provider(
            &bus,
            vec![
                ("USE_VOICEOVER", Value::Bool(true)),
                ("AUDIO_BOT", Value::from("silero")),
            ],
        );
        text_provider(&bus, "Hi <e>smile</e>");
        bus.subscribe(
            EventName::ModelGetCurrentCharacter,
            handler_fn(|_| Ok(Some(serde_json::json!({"name": "Mita", "silero_command": "/speaker Mita"})))),
            Retention::Strong,
        );
        let mut voiceover = capture(&bus, EventName::AudioVoiceoverRequested);
        let mut ui = capture(&bus, EventName::GuiUpdateChatUi);

        let controller = ChatController::new(bus.clone(), quick_config());
        controller.attach();

        bus.emit_and_wait(
            EventName::ChatSendMessage,
            Payload::new().with("user_input", "hi"),
            Duration::from_secs(5),
        )
        .await;

        let request = voiceover.recv().await.unwrap();
        assert_eq!(request["text"], "Hi ");
        assert_eq!(request["speaker"], "/speaker Mita");
        // The UI gets the raw reply, tags included.
        assert_eq!(ui.recv().await.unwrap()["response"], "Hi <e>smile</e>");
    }

    #[tokio::test]
    async fn test_generation_timeout_returns_apology() {
        let bus = create_event_bus();
        settings_provider(&bus, vec![]);
        bus.subscribe(
            EventName::ModelGenerateResponse,
            handler_fn(|_| Ok(None)),
            Retention::Strong,
        );
        let mut failed = capture(&bus, EventName::ModelOnFailedResponse);
        let mut voiceover = capture(&bus, EventName::AudioVoiceoverRequested);

        let controller = ChatController::new(
            bus.clone(),
            ChatConfig {
                generate_timeout: Duration::from_millis(300),
                settings_timeout: Duration::from_millis(100),
                ..ChatConfig::default()
            },
        );
        controller.attach();

        let replies = bus
            .emit_and_wait(
                EventName::ChatSendMessage,
                Payload::new().with("user_input", "hi"),
                Duration::from_secs(5),
            )
            .await;
        assert_eq!(replies, vec![Value::from(DEFAULT_APOLOGY)]);

        assert_eq!(failed.recv().await.unwrap()["error"], TIMEOUT_DIAGNOSTIC);
        assert!(voiceover.try_recv().is_err());
        assert!(!controller.is_processing());
    }

    #[tokio::test]
    async fn test_stage_and_clear_images() {
        let bus = create_event_bus();
        let controller = ChatController::new(bus.clone(), quick_config());
        controller.attach();

        bus.emit_and_wait(
            EventName::ChatStageImage,
            Payload::new().with("image_data", "/tmp/shot.png"),
            Duration::from_secs(5),
        )
        .await;
        bus.emit_and_wait(
            EventName::ChatStageImage,
            Payload::new().with("image_data", Value::Array(vec![Value::from(1u8), Value::from(2u8)])),
            Duration::from_secs(5),
        )
        .await;

        let staged = controller.staged_image_paths();
        assert_eq!(staged.len(), 2);
        assert_eq!(staged[0], PathBuf::from("/tmp/shot.png"));
        assert_eq!(std::fs::read(&staged[1]).unwrap(), vec![1, 2]);

        bus.emit_and_wait(EventName::ChatClearStagedImages, Payload::new(), Duration::from_secs(5))
            .await;
        assert!(controller.staged_image_paths().is_empty());
        let _ = std::fs::remove_file(&staged[1]);
    }

    #[tokio::test]
    async fn test_staged_images_ride_the_next_send() {
        let bus = create_event_bus();
        settings_provider(&bus, vec![]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(
            EventName::ModelGenerateResponse,
            handler_fn(move |event| {
                let _ = tx.send(event.data.get("image_data").cloned().unwrap_or(Value::Null));
                Ok(Some(Value::from("ok")))
            }),
            Retention::Strong,
        );

        let controller = ChatController::new(bus.clone(), quick_config());
        controller.attach();

        bus.emit_and_wait(
            EventName::ChatStageImage,
            Payload::new().with("image_data", "/tmp/a.png"),
            Duration::from_secs(5),
        )
        .await;
        bus.emit_and_wait(
            EventName::ChatSendMessage,
            Payload::new().with("user_input", "look"),
            Duration::from_secs(5),
        )
        .await;

        let images = rx.recv().await.unwrap();
        assert_eq!(images, serde_json::json!(["/tmp/a.png"]));
        // Drained by the send; a second message carries nothing.
        assert!(controller.staged_image_paths().is_empty());
    }

    #[tokio::test]
    async fn test_reply_forwarded_to_game_when_server_up() {
        let bus = create_event_bus();
        settings_provider(&bus, vec![]);
        text_provider(&bus, "hello");
        bus.subscribe(
            EventName::ServerGetChatServer,
            handler_fn(|_| Ok(Some(Value::Bool(true)))),
            Retention::Strong,
        );
        let mut forwarded = capture(&bus, EventName::ServerSendChatMessage);

        let controller = ChatController::new(bus.clone(), quick_config());
        controller.attach();

        bus.emit_and_wait(
            EventName::ChatSendMessage,
            Payload::new().with("user_input", "hi"),
            Duration::from_secs(5),
        )
        .await;

        assert_eq!(forwarded.recv().await.unwrap()["text"], "hello");
    }

    #[tokio::test]
    async fn test_missing_user_input_is_protocol_error() {
        let bus = create_event_bus();
        let controller = ChatController::new(bus, quick_config());
        let event = Event::new(EventName::ChatSendMessage, Payload::new());
        assert!(controller.handle(event).await.is_err());
    }
}
