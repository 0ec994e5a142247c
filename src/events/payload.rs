//! Event payloads
//!
//! A payload is a string-keyed map of JSON values plus an optional stream
//! sink. The sink is the in-process stand-in for "a callback embedded in the
//! event data": the provider invokes it once per streamed chunk, and it never
//! crosses a serialization boundary.

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;

/// Per-request chunk forwarder handed to streaming providers
pub type StreamSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Errors for events dispatched with missing or mistyped data keys.
///
/// These are programming errors on the producer side; the bus logs them and
/// the consumer returns null rather than propagating.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("missing required key: {0}")]
    MissingKey(String),

    #[error("wrong type for key {key}: expected {expected}")]
    WrongType { key: String, expected: &'static str },
}

/// Call parameters or return values carried by an event
#[derive(Clone, Default)]
pub struct Payload {
    values: Map<String, Value>,
    stream: Option<StreamSink>,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Builder-style stream sink attachment
    pub fn with_stream(mut self, sink: StreamSink) -> Self {
        self.stream = Some(sink);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Required string value
    pub fn str(&self, key: &str) -> Result<&str, PayloadError> {
        match self.values.get(key) {
            None => Err(PayloadError::MissingKey(key.to_string())),
            Some(Value::String(s)) => Ok(s),
            Some(_) => Err(PayloadError::WrongType {
                key: key.to_string(),
                expected: "string",
            }),
        }
    }

    /// Optional string value; non-string values read as absent
    pub fn opt_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    /// Required object value
    pub fn object(&self, key: &str) -> Result<&Map<String, Value>, PayloadError> {
        match self.values.get(key) {
            None => Err(PayloadError::MissingKey(key.to_string())),
            Some(Value::Object(map)) => Ok(map),
            Some(_) => Err(PayloadError::WrongType {
                key: key.to_string(),
                expected: "object",
            }),
        }
    }

    /// Optional object value
    pub fn opt_object(&self, key: &str) -> Option<&Map<String, Value>> {
        self.values.get(key).and_then(Value::as_object)
    }

    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        self.values.get(key).and_then(Value::as_bool).unwrap_or(default)
    }

    pub fn stream(&self) -> Option<StreamSink> {
        self.stream.clone()
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.stream.is_none()
    }
}

impl From<Map<String, Value>> for Payload {
    fn from(values: Map<String, Value>) -> Self {
        Self { values, stream: None }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("values", &self.values)
            .field("stream", &self.stream.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_payload_builder_and_access() {
        let payload = Payload::new().with("user_input", "hi").with("is_initial", false);

        assert_eq!(payload.str("user_input").unwrap(), "hi");
        assert!(!payload.bool_or("is_initial", true));
        assert!(payload.get("missing").is_none());
    }

    #[test]
    fn test_missing_key_is_protocol_error() {
        let payload = Payload::new();
        let err = payload.str("user_input").unwrap_err();
        assert!(matches!(err, PayloadError::MissingKey(_)));
        assert!(err.to_string().contains("user_input"));
    }

    #[test]
    fn test_wrong_type_is_protocol_error() {
        let payload = Payload::new().with("count", 3);
        let err = payload.str("count").unwrap_err();
        assert!(matches!(err, PayloadError::WrongType { .. }));
    }

    #[test]
    fn test_stream_sink_survives_clone() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let sink: StreamSink = Arc::new(move |_chunk| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let payload = Payload::new().with("chunk", "hel").with_stream(sink);
        let copy = payload.clone();

        copy.stream().unwrap()("hel");
        payload.stream().unwrap()("lo");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_debug_does_not_require_stream_debug() {
        let sink: StreamSink = Arc::new(|_| {});
        let payload = Payload::new().with("k", "v").with_stream(sink);
        let rendered = format!("{:?}", payload);
        assert!(rendered.contains("stream: true"));
    }
}
