//! Voice-safe text shaping and speaker selection
//!
//! Replies reach the chat UI verbatim, inline tags included. The text handed
//! to TTS is a voice-safe variant: paired control tags go together with
//! their content (`<e>smile</e>` is an emotion cue, not speech), and any
//! orphan tags are dropped afterwards.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

fn paired_tag() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<([A-Za-z][A-Za-z0-9_]*)>[^<]*</[A-Za-z][A-Za-z0-9_]*>").expect("paired tag regex"))
}

fn orphan_tag() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]*>").expect("orphan tag regex"))
}

fn emotion_tag() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<e>([^<]*)</e>").expect("emotion tag regex"))
}

/// Strip voice-unsafe substrings from a reply. Whitespace is preserved as
/// the model wrote it.
pub fn voice_safe(text: &str) -> String {
    let stripped = paired_tag().replace_all(text, "");
    orphan_tag().replace_all(&stripped, "").into_owned()
}

/// First inline emotion cue, if the reply carries one
pub fn extract_emotion(text: &str) -> Option<String> {
    emotion_tag()
        .captures(text)
        .map(|caps| caps[1].trim().to_string())
        .filter(|emotion| !emotion.is_empty())
}

/// Derive the speaker token for the active character.
///
/// The audio-bot setting selects the token style: a bot name containing
/// "miku" uses the character's `miku_command`, anything else the Silero
/// command. Characters without a command fall back to `/speaker <name>`.
pub fn speaker_for(character: &Value, audio_bot: &str) -> String {
    let key = if audio_bot.to_lowercase().contains("miku") {
        "miku_command"
    } else {
        "silero_command"
    };
    if let Some(command) = character.get(key).and_then(Value::as_str) {
        return command.to_string();
    }
    let name = character.get("name").and_then(Value::as_str).unwrap_or("assistant");
    format!("/speaker {}", name)
}

/// Crude token estimate for the GUI counter
pub fn approx_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_voice_safe_strips_paired_tag_with_content() {
        assert_eq!(voice_safe("Hi <e>smile</e>"), "Hi ");
    }

    #[test]
    fn test_voice_safe_strips_orphan_tags() {
        assert_eq!(voice_safe("Hello <memory> world"), "Hello  world");
    }

    #[test]
    fn test_voice_safe_handles_multiple_tags() {
        assert_eq!(voice_safe("<e>smile</e>Good<p>wave</p> morning"), "Good morning");
    }

    #[test]
    fn test_voice_safe_plain_text_untouched() {
        assert_eq!(voice_safe("just words"), "just words");
    }

    #[test]
    fn test_extract_emotion() {
        assert_eq!(extract_emotion("Hi <e>smile</e>"), Some("smile".to_string()));
        assert_eq!(extract_emotion("no tags here"), None);
        assert_eq!(extract_emotion("empty <e></e>"), None);
    }

    #[test]
    fn test_speaker_silero_command() {
        let character = json!({"name": "Mita", "silero_command": "/speaker Mita"});
        assert_eq!(speaker_for(&character, "silero"), "/speaker Mita");
    }

    #[test]
    fn test_speaker_miku_command() {
        let character = json!({"name": "Mita", "miku_command": "/voice miku-07", "silero_command": "/speaker Mita"});
        assert_eq!(speaker_for(&character, "MikuTTS"), "/voice miku-07");
    }

    #[test]
    fn test_speaker_falls_back_to_name() {
        let character = json!({"name": "Mita"});
        assert_eq!(speaker_for(&character, "silero"), "/speaker Mita");
        assert_eq!(speaker_for(&Value::Null, "silero"), "/speaker assistant");
    }

    #[test]
    fn test_approx_tokens() {
        assert_eq!(approx_tokens(""), 0);
        assert_eq!(approx_tokens("hello"), 2);
    }
}
