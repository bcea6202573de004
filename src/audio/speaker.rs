//! rodio-backed [`ClipPlayer`] for the default output device.

use crate::audio::playback::ClipPlayer;
use crate::error::AudioError;
use async_trait::async_trait;
use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink};
use std::io::Cursor;
use std::sync::mpsc as std_mpsc;
use std::time::Duration;
use tracing::{debug, info};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Plays WAV clips on the default speaker.
///
/// The rodio `OutputStream` is not `Send`; it lives on a parked thread for as
/// long as this player exists, and only its handle is shared.
pub struct SpeakerPlayer {
    handle: OutputStreamHandle,
    _keepalive: std_mpsc::Sender<()>,
}

impl SpeakerPlayer {
    pub fn open_default() -> Result<Self, AudioError> {
        let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);
        let (keepalive_tx, keepalive_rx) = std_mpsc::channel::<()>();

        std::thread::Builder::new()
            .name("speaker-output".to_string())
            .spawn(move || match OutputStream::try_default() {
                Ok((stream, handle)) => {
                    let _ = ready_tx.send(Ok(handle));
                    // Returns once the player (and its sender) is dropped
                    let _ = keepalive_rx.recv();
                    drop(stream);
                    debug!("Speaker output stream released");
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(AudioError::OutputStream(err.to_string())));
                }
            })
            .map_err(|e| AudioError::OutputStream(e.to_string()))?;

        let handle = ready_rx
            .recv()
            .map_err(|_| AudioError::OutputStream("output thread exited".to_string()))??;
        info!("Speaker output opened");

        Ok(Self {
            handle,
            _keepalive: keepalive_tx,
        })
    }
}

#[async_trait]
impl ClipPlayer for SpeakerPlayer {
    async fn play(&self, clip: Vec<u8>) -> Result<(), AudioError> {
        let source = Decoder::new(Cursor::new(clip)).map_err(|e| AudioError::Decode(e.to_string()))?;
        let sink = Sink::try_new(&self.handle).map_err(|e| AudioError::OutputStream(e.to_string()))?;
        sink.append(source);

        // Dropping `sink` (including when this future is aborted) stops the clip
        while !sink.empty() {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        Ok(())
    }
}
