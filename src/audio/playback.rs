//! # Audio Playback Queue
//!
//! Plays incoming audio deltas one after another, in arrival order, with no
//! gaps or overlap. Each delta is base64 PCM16; it is decoded and wrapped in a
//! WAV header here so the output device can treat it as a standalone clip.
//!
//! ## How playback is driven:
//! - `enqueue()` appends to the pending queue. If nothing is playing it spawns
//!   a drain task.
//! - The drain task pops one frame, awaits [`ClipPlayer::play`] until that clip
//!   has finished, then pops the next. When the queue is empty it clears the
//!   playing flag and exits.
//! - `clear()` empties the queue and aborts the drain task. Aborting drops the
//!   in-flight `play` future, which stops the current clip immediately.
//!
//! There is only ever one drain task per queue, so two clips never overlap.

use crate::audio::codec;
use crate::error::AudioError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Output device seam.
///
/// `play` resolves once the clip has finished. Dropping the future before
/// then must stop the clip.
#[async_trait]
pub trait ClipPlayer: Send + Sync + 'static {
    async fn play(&self, clip: Vec<u8>) -> Result<(), AudioError>;
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<String>,
    playing: bool,
    drain: Option<JoinHandle<()>>,
    /// Bumped by `clear()` so a stale drain task never touches new state
    generation: u64,
    played: u64,
    failed: u64,
}

/// FIFO playback of base64 PCM16 frames. Cheap to clone; clones share the queue.
#[derive(Clone)]
pub struct PlaybackQueue {
    state: Arc<Mutex<QueueState>>,
    player: Arc<dyn ClipPlayer>,
}

impl PlaybackQueue {
    pub fn new(player: Arc<dyn ClipPlayer>) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            player,
        }
    }

    /// Queue one frame; starts playback if idle. Must be called inside a Tokio runtime.
    pub fn enqueue(&self, frame: impl Into<String>) {
        let mut state = self.lock();
        state.pending.push_back(frame.into());

        if !state.playing {
            state.playing = true;
            let generation = state.generation;
            let handle = tokio::spawn(drain(self.state.clone(), self.player.clone(), generation));
            state.drain = Some(handle);
        }
    }

    /// Drop everything pending and stop the current clip. Idempotent.
    pub fn clear(&self) {
        let mut state = self.lock();
        let discarded = state.pending.len();
        state.pending.clear();
        state.playing = false;
        state.generation += 1;
        if let Some(handle) = state.drain.take() {
            handle.abort();
        }
        if discarded > 0 {
            debug!(discarded, "Playback queue cleared");
        }
    }

    pub fn is_playing(&self) -> bool {
        self.lock().playing
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Clips played to completion and clips skipped, since creation.
    pub fn counts(&self) -> (u64, u64) {
        let state = self.lock();
        (state.played, state.failed)
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn prepare_clip(frame: &str) -> Result<Vec<u8>, AudioError> {
    let samples = codec::decode_frame(frame)?;
    codec::wrap_wav(samples)
}

async fn drain(state: Arc<Mutex<QueueState>>, player: Arc<dyn ClipPlayer>, generation: u64) {
    loop {
        let frame = {
            let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
            if guard.generation != generation {
                return;
            }
            match guard.pending.pop_front() {
                Some(frame) => frame,
                None => {
                    guard.playing = false;
                    guard.drain = None;
                    return;
                }
            }
        };

        let outcome = match prepare_clip(&frame) {
            Ok(clip) => player.play(clip).await,
            Err(err) => Err(err),
        };

        let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.generation != generation {
            return;
        }
        match outcome {
            Ok(()) => guard.played += 1,
            Err(err) => {
                guard.failed += 1;
                warn!(error = %err, "Skipping audio frame that failed to play");
            }
        }
    }
}
