//! # Relay Message Types
//!
//! The relay forwards almost everything as opaque bytes. It only needs to
//! understand a handful of upstream event kinds, so instead of parsing every
//! event into a full model it classifies each text frame into a closed
//! [`UpstreamEvent`]. Anything it does not care about becomes
//! [`UpstreamEvent::Passthrough`] and is forwarded untouched. The original
//! text is always what gets forwarded, never a re-serialization.
//!
//! ## Messages the relay produces itself:
//! - [`RelayNotice`]: readiness and error notices sent to the client
//! - [`SessionUpdate`]: the one configuration event injected upstream
//! - [`ClientEvent`]: envelopes the voice client sends through the relay

use crate::config::SessionConfig;
use crate::error::RelayError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Upstream error code that ends the voice session.
pub const TERMINAL_ERROR_CODE: &str = "session_expired";

/// The upstream events the relay inspects.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    /// `session.created`: triggers the one-time configuration injection.
    SessionCreated,
    /// `session.updated`: the upstream accepted the configuration.
    SessionUpdated,
    /// `error`: forwarded as-is; `terminal` ones also end the session.
    Error { message: String, terminal: bool },
    /// Every other event.
    Passthrough,
}

/// Wire shape used only for classification. Unknown fields are ignored and
/// unknown `type` values land in `Other`.
#[derive(Deserialize)]
#[serde(tag = "type")]
enum InspectedEvent {
    #[serde(rename = "session.created")]
    SessionCreated {},
    #[serde(rename = "session.updated")]
    SessionUpdated {},
    /// `error` is read loosely: any shape still classifies as an error event.
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: Option<Value>,
    },
    #[serde(other)]
    Other,
}

fn error_field<'a>(body: Option<&'a Value>, name: &str) -> Option<&'a str> {
    body?.get(name)?.as_str()
}

impl UpstreamEvent {
    /// Classify one upstream text frame.
    ///
    /// Fails only when the frame is not a JSON object with a string `type`.
    /// The session logs such frames and drops them.
    pub fn classify(text: &str) -> serde_json::Result<Self> {
        let event = match serde_json::from_str::<InspectedEvent>(text)? {
            InspectedEvent::SessionCreated {} => UpstreamEvent::SessionCreated,
            InspectedEvent::SessionUpdated {} => UpstreamEvent::SessionUpdated,
            InspectedEvent::Error { error } => {
                let body = error.as_ref();
                let message = match body {
                    Some(Value::String(text)) => Some(text.as_str()),
                    _ => error_field(body, "message"),
                };
                UpstreamEvent::Error {
                    message: message.unwrap_or("Unknown upstream error").to_string(),
                    terminal: error_field(body, "code") == Some(TERMINAL_ERROR_CODE),
                }
            }
            InspectedEvent::Other => UpstreamEvent::Passthrough,
        };
        Ok(event)
    }
}

/// Notices the relay sends to the client on its own behalf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RelayNotice {
    /// The upstream socket is open; client messages are forwarded from now on.
    #[serde(rename = "relay.connected")]
    Connected { message: String },

    /// Fatal or runtime error; the socket closes after this.
    #[serde(rename = "error")]
    Error { message: String },
}

impl RelayNotice {
    pub fn connected() -> Self {
        RelayNotice::Connected {
            message: "Connected to OpenAI Realtime API".to_string(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        RelayNotice::Error {
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        // Two string fields and a tag: serialization cannot fail
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"error","message":"internal"}"#.to_string())
    }
}

impl From<&RelayError> for RelayNotice {
    fn from(err: &RelayError) -> Self {
        RelayNotice::error(err.to_string())
    }
}

/// The configuration event injected upstream after `session.created`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename = "session.update")]
pub struct SessionUpdate {
    pub session: SessionSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    pub modalities: Vec<String>,
    pub instructions: String,
    pub voice: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub input_audio_transcription: InputAudioTranscription,
    pub turn_detection: TurnDetection,
    pub temperature: f32,
    pub max_response_output_tokens: MaxTokens,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputAudioTranscription {
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TurnDetection {
    #[serde(rename = "server_vad")]
    ServerVad {
        threshold: f32,
        prefix_padding_ms: u32,
        silence_duration_ms: u32,
    },
}

/// A token budget, or `"inf"` for unbounded responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MaxTokens {
    Limit(u32),
    Infinite(String),
}

impl MaxTokens {
    fn from_setting(value: &str) -> Self {
        match value.parse::<u32>() {
            Ok(limit) => MaxTokens::Limit(limit),
            Err(_) => MaxTokens::Infinite("inf".to_string()),
        }
    }
}

impl SessionUpdate {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            session: SessionSettings {
                modalities: vec!["text".to_string(), "audio".to_string()],
                instructions: config.instructions.clone(),
                voice: config.voice.clone(),
                input_audio_format: config.input_audio_format.clone(),
                output_audio_format: config.output_audio_format.clone(),
                input_audio_transcription: InputAudioTranscription {
                    model: config.transcription_model.clone(),
                },
                turn_detection: TurnDetection::ServerVad {
                    threshold: config.vad_threshold,
                    prefix_padding_ms: config.vad_prefix_padding_ms,
                    silence_duration_ms: config.vad_silence_duration_ms,
                },
                temperature: config.temperature,
                max_response_output_tokens: MaxTokens::from_setting(&config.max_response_output_tokens),
            },
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Events the voice client originates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// One captured frame, base64 PCM16.
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioAppend { audio: String },

    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioCommit,

    #[serde(rename = "response.cancel")]
    ResponseCancel,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn test_classify_session_created_with_payload() {
        let text = r#"{"type":"session.created","event_id":"evt_1","session":{"id":"sess_1","voice":"alloy"}}"#;
        assert_eq!(UpstreamEvent::classify(text).unwrap(), UpstreamEvent::SessionCreated);
    }

    #[test]
    fn test_classify_unknown_and_audio_events_as_passthrough() {
        let delta = r#"{"type":"response.audio.delta","delta":"AAAA","item_id":"x"}"#;
        assert_eq!(UpstreamEvent::classify(delta).unwrap(), UpstreamEvent::Passthrough);
        let future = r#"{"type":"something.new","anything":[1,2,3]}"#;
        assert_eq!(UpstreamEvent::classify(future).unwrap(), UpstreamEvent::Passthrough);
    }

    #[test]
    fn test_classify_errors() {
        let recoverable = r#"{"type":"error","error":{"type":"invalid_request_error","message":"bad event"}}"#;
        assert_eq!(
            UpstreamEvent::classify(recoverable).unwrap(),
            UpstreamEvent::Error {
                message: "bad event".to_string(),
                terminal: false
            }
        );

        let expired = r#"{"type":"error","error":{"code":"session_expired","message":"Session hit max duration"}}"#;
        assert!(matches!(
            UpstreamEvent::classify(expired).unwrap(),
            UpstreamEvent::Error { terminal: true, .. }
        ));
    }

    #[test]
    fn test_classify_error_with_unexpected_body_shape() {
        let text = r#"{"type":"error","error":"rate limited"}"#;
        assert_eq!(
            UpstreamEvent::classify(text).unwrap(),
            UpstreamEvent::Error {
                message: "rate limited".to_string(),
                terminal: false
            }
        );

        let numeric = r#"{"type":"error","error":{"code":429,"message":["a","b"]}}"#;
        assert_eq!(
            UpstreamEvent::classify(numeric).unwrap(),
            UpstreamEvent::Error {
                message: "Unknown upstream error".to_string(),
                terminal: false
            }
        );
    }

    #[test]
    fn test_classify_rejects_non_events() {
        assert!(UpstreamEvent::classify("not json").is_err());
        assert!(UpstreamEvent::classify(r#"{"no_type":true}"#).is_err());
    }

    #[test]
    fn test_missing_credential_notice_shape() {
        let notice = RelayNotice::from(&RelayError::MissingCredential);
        let json: serde_json::Value = serde_json::from_str(&notice.to_json()).unwrap();
        assert_eq!(json, serde_json::json!({"type": "error", "message": "No OpenAI API key provided"}));
    }

    #[test]
    fn test_session_update_payload() {
        let config = AppConfig::default();
        let json: serde_json::Value =
            serde_json::from_str(&SessionUpdate::from_config(&config.session).to_json().unwrap()).unwrap();

        assert_eq!(json["type"], "session.update");
        let session = &json["session"];
        assert_eq!(session["modalities"], serde_json::json!(["text", "audio"]));
        assert_eq!(session["voice"], "alloy");
        assert_eq!(session["input_audio_format"], "pcm16");
        assert_eq!(session["output_audio_format"], "pcm16");
        assert_eq!(session["input_audio_transcription"]["model"], "whisper-1");
        assert_eq!(session["turn_detection"]["type"], "server_vad");
        assert_eq!(session["turn_detection"]["prefix_padding_ms"], 300);
        assert_eq!(session["turn_detection"]["silence_duration_ms"], 500);
        assert_eq!(session["max_response_output_tokens"], "inf");
        assert!(session["instructions"].as_str().unwrap().starts_with("You are Chief"));
    }

    #[test]
    fn test_numeric_token_limit() {
        let mut config = AppConfig::default();
        config.session.max_response_output_tokens = "1024".to_string();
        let update = SessionUpdate::from_config(&config.session);
        assert_eq!(update.session.max_response_output_tokens, MaxTokens::Limit(1024));
    }

    #[test]
    fn test_append_envelope() {
        let event = ClientEvent::InputAudioAppend {
            audio: "AQID".to_string(),
        };
        assert_eq!(
            serde_json::to_string(&event).unwrap(),
            r#"{"type":"input_audio_buffer.append","audio":"AQID"}"#
        );
    }
}
