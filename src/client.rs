//! # Voice Client
//!
//! Native counterpart of a browser voice UI. Connects to the relay, streams
//! captured microphone frames as `input_audio_buffer.append` events, routes
//! `response.audio.delta` payloads into a [`PlaybackQueue`], and reports
//! everything else as typed [`ClientNotice`]s.
//!
//! ## Tasks per connection:
//! - **writer**: drains an unbounded channel into the socket
//! - **reader**: classifies relay messages and feeds playback / notices
//! - **pump** (while streaming): capture receiver → append events
//!
//! `disconnect()` stops all three and clears playback; it can be called any
//! number of times.

use crate::audio::capture::CapturedFrame;
use crate::audio::playback::PlaybackQueue;
use crate::error::AudioError;
use crate::relay::events::ClientEvent;
use crate::relay::manager::API_KEY_PARAM;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};
use url::Url;

/// What the voice client surfaces to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientNotice {
    /// The relay reached the upstream.
    Connected { message: String },
    /// Relay or upstream error notice.
    Error { message: String },
    /// An audio delta was queued for playback.
    AudioDelta { bytes: usize },
    /// Partial transcript of the assistant's speech.
    TranscriptDelta { delta: String },
    /// Final transcript of the user's speech.
    InputTranscript { transcript: String },
    SpeechStarted,
    SpeechStopped,
    ResponseDone,
    /// Any other event, as received.
    Other(serde_json::Value),
    /// The relay socket is gone.
    Closed,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum InboundEvent {
    #[serde(rename = "relay.connected")]
    Connected {
        #[serde(default)]
        message: String,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        error: Option<serde_json::Value>,
    },
    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },
    #[serde(rename = "response.audio_transcript.delta")]
    TranscriptDelta { delta: String },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscript { transcript: String },
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {},
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped {},
    #[serde(rename = "response.done")]
    ResponseDone {},
    #[serde(other)]
    Other,
}

/// A live connection to the relay.
pub struct VoiceClient {
    outbound: Option<mpsc::UnboundedSender<Message>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
    playback: PlaybackQueue,
}

impl VoiceClient {
    /// Connect to `relay_url`, adding `api_key` as a query parameter when given.
    pub async fn connect(
        relay_url: &str,
        api_key: Option<&str>,
        playback: PlaybackQueue,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientNotice>), AudioError> {
        let url = relay_request_url(relay_url, api_key)?;

        let (socket, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| AudioError::Connection(e.to_string()))?;
        info!(relay = %relay_url, "Voice client connected to relay");

        let (sink, mut stream) = socket.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(async move {
            if let Err(err) = UnboundedReceiverStream::new(outbound_rx)
                .map(Ok::<_, WsError>)
                .forward(sink)
                .await
            {
                debug!(error = %err, "Relay writer stopped");
            }
        });

        let reader_playback = playback.clone();
        let reader = tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => route_inbound(&text, &reader_playback, &notice_tx),
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "Relay closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        let _ = notice_tx.send(ClientNotice::Error {
                            message: err.to_string(),
                        });
                        break;
                    }
                }
            }
            let _ = notice_tx.send(ClientNotice::Closed);
        });

        Ok((
            Self {
                outbound: Some(outbound_tx),
                reader: Some(reader),
                writer: Some(writer),
                pump: None,
                playback,
            },
            notice_rx,
        ))
    }

    /// Send every captured frame as an append event until the receiver ends.
    ///
    /// Replaces any previous capture stream.
    pub fn stream_capture(&mut self, mut frames: mpsc::Receiver<CapturedFrame>) -> Result<(), AudioError> {
        let outbound = self
            .outbound
            .clone()
            .ok_or_else(|| AudioError::Connection("client is disconnected".to_string()))?;

        if let Some(previous) = self.pump.take() {
            previous.abort();
        }

        self.pump = Some(tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                let event = ClientEvent::InputAudioAppend { audio: frame.payload };
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(err) => {
                        warn!(error = %err, "Could not encode append event");
                        continue;
                    }
                };
                if outbound.send(Message::Text(json)).is_err() {
                    break;
                }
            }
            debug!("Capture stream ended");
        }));
        Ok(())
    }

    pub fn send_event(&self, event: &ClientEvent) -> Result<(), AudioError> {
        let json = serde_json::to_string(event).map_err(|e| AudioError::Connection(e.to_string()))?;
        self.outbound
            .as_ref()
            .ok_or_else(|| AudioError::Connection("client is disconnected".to_string()))?
            .send(Message::Text(json))
            .map_err(|_| AudioError::Connection("relay writer has stopped".to_string()))
    }

    pub fn is_connected(&self) -> bool {
        self.outbound.as_ref().map(|tx| !tx.is_closed()).unwrap_or(false)
    }

    pub fn playback(&self) -> &PlaybackQueue {
        &self.playback
    }

    /// Close the relay socket, stop streaming and silence playback.
    pub fn disconnect(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.playback.clear();

        if let Some(outbound) = self.outbound.take() {
            let _ = outbound.send(Message::Close(None));
            info!("Voice client disconnecting");
        }
        // The writer exits on its own once the close frame is flushed
        self.writer.take();
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl Drop for VoiceClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Relay URL with `api_key` appended as a form-encoded query pair.
fn relay_request_url(relay_url: &str, api_key: Option<&str>) -> Result<Url, AudioError> {
    let mut url = Url::parse(relay_url).map_err(|e| AudioError::Connection(format!("invalid relay url: {}", e)))?;
    if let Some(key) = api_key {
        url.query_pairs_mut().append_pair(API_KEY_PARAM, key);
    }
    Ok(url)
}

fn route_inbound(text: &str, playback: &PlaybackQueue, notices: &mpsc::UnboundedSender<ClientNotice>) {
    let event = match serde_json::from_str::<InboundEvent>(text) {
        Ok(event) => event,
        Err(err) => {
            warn!(error = %err, "Ignoring unparseable relay message");
            return;
        }
    };

    let notice = match event {
        InboundEvent::Connected { message } => ClientNotice::Connected { message },
        InboundEvent::Error { message, error } => ClientNotice::Error {
            message: message
                .or_else(|| match error {
                    Some(serde_json::Value::String(text)) => Some(text),
                    Some(body) => body.get("message").and_then(|m| m.as_str()).map(String::from),
                    None => None,
                })
                .unwrap_or_else(|| "Unknown error".to_string()),
        },
        InboundEvent::AudioDelta { delta } => {
            let bytes = delta.len();
            playback.enqueue(delta);
            ClientNotice::AudioDelta { bytes }
        }
        InboundEvent::TranscriptDelta { delta } => ClientNotice::TranscriptDelta { delta },
        InboundEvent::InputTranscript { transcript } => ClientNotice::InputTranscript { transcript },
        InboundEvent::SpeechStarted {} => ClientNotice::SpeechStarted,
        InboundEvent::SpeechStopped {} => ClientNotice::SpeechStopped,
        InboundEvent::ResponseDone {} => ClientNotice::ResponseDone,
        InboundEvent::Other => match serde_json::from_str(text) {
            Ok(value) => ClientNotice::Other(value),
            Err(_) => return,
        },
    };
    let _ = notices.send(notice);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::playback::ClipPlayer;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Silent;

    #[async_trait]
    impl ClipPlayer for Silent {
        async fn play(&self, _clip: Vec<u8>) -> Result<(), AudioError> {
            Ok(())
        }
    }

    fn route(text: &str) -> (Option<ClientNotice>, PlaybackQueue) {
        let playback = PlaybackQueue::new(Arc::new(Silent));
        let (tx, mut rx) = mpsc::unbounded_channel();
        route_inbound(text, &playback, &tx);
        (rx.try_recv().ok(), playback)
    }

    #[tokio::test]
    async fn test_error_notices_from_relay_and_upstream() {
        let (relay, _) = route(r#"{"type":"error","message":"No OpenAI API key provided"}"#);
        assert_eq!(
            relay,
            Some(ClientNotice::Error {
                message: "No OpenAI API key provided".into()
            })
        );

        let (upstream, _) = route(r#"{"type":"error","error":{"type":"invalid_request_error","message":"bad"}}"#);
        assert_eq!(upstream, Some(ClientNotice::Error { message: "bad".into() }));

        let (loose, _) = route(r#"{"type":"error","error":"rate limited"}"#);
        assert_eq!(loose, Some(ClientNotice::Error { message: "rate limited".into() }));
    }

    #[test]
    fn test_api_key_is_query_encoded() {
        let url = relay_request_url("ws://127.0.0.1:3002/", Some("sk+a&b#c d")).unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:3002/?api_key=sk%2Ba%26b%23c+d");

        let decoded: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(decoded, vec![("api_key".to_string(), "sk+a&b#c d".to_string())]);

        let existing = relay_request_url("ws://relay.local/?lang=en", Some("k")).unwrap();
        assert_eq!(existing.as_str(), "ws://relay.local/?lang=en&api_key=k");

        let bare = relay_request_url("ws://relay.local/", None).unwrap();
        assert_eq!(bare.query(), None);

        assert!(matches!(relay_request_url("not a url", None), Err(AudioError::Connection(_))));
    }

    #[tokio::test]
    async fn test_audio_delta_goes_to_playback() {
        let (notice, playback) = route(r#"{"type":"response.audio.delta","delta":"AAAAAA==","item_id":"i"}"#);
        assert_eq!(notice, Some(ClientNotice::AudioDelta { bytes: 8 }));
        assert!(playback.is_playing() || playback.counts().0 == 1);
    }

    #[tokio::test]
    async fn test_turn_events_and_unknowns() {
        assert_eq!(
            route(r#"{"type":"input_audio_buffer.speech_started","audio_start_ms":10}"#).0,
            Some(ClientNotice::SpeechStarted)
        );
        assert_eq!(route(r#"{"type":"response.done","response":{}}"#).0, Some(ClientNotice::ResponseDone));

        let (other, _) = route(r#"{"type":"rate_limits.updated","rate_limits":[]}"#);
        assert!(matches!(other, Some(ClientNotice::Other(v)) if v["type"] == "rate_limits.updated"));

        assert_eq!(route("not json").0, None);
    }
}
