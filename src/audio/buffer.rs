//! # Frame Assembly
//!
//! Audio devices deliver blocks of whatever size the driver picks (often 480
//! or 512 samples, sometimes varying between callbacks). The realtime API is
//! fed fixed-size frames, so captured samples pass through a [`FrameAssembler`]
//! that accumulates them and hands back complete frames in arrival order.
//!
//! ## Memory Management:
//! - At most one partial frame is held between calls
//! - Complete frames are moved out immediately, never retained

use std::collections::VecDeque;

/// Accumulates arbitrary-sized blocks into frames of exactly `frame_samples`.
#[derive(Debug)]
pub struct FrameAssembler {
    pending: VecDeque<f32>,
    frame_samples: usize,
}

impl FrameAssembler {
    /// ## Panics:
    /// Never; a zero frame size is bumped to one sample.
    pub fn new(frame_samples: usize) -> Self {
        let frame_samples = frame_samples.max(1);
        Self {
            pending: VecDeque::with_capacity(frame_samples * 2),
            frame_samples,
        }
    }

    /// Append a block and return every frame it completed, oldest first.
    pub fn push(&mut self, block: &[f32]) -> Vec<Vec<f32>> {
        self.pending.extend(block.iter().copied());

        let mut frames = Vec::with_capacity(self.pending.len() / self.frame_samples);
        while self.pending.len() >= self.frame_samples {
            frames.push(self.pending.drain(..self.frame_samples).collect());
        }
        frames
    }

    /// Samples waiting for the next frame.
    pub fn pending_samples(&self) -> usize {
        self.pending.len()
    }

    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    /// Drop any partial frame, e.g. when capture stops.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_blocks_accumulate() {
        let mut assembler = FrameAssembler::new(4);
        assert!(assembler.push(&[0.1, 0.2, 0.3]).is_empty());
        assert_eq!(assembler.pending_samples(), 3);

        let frames = assembler.push(&[0.4, 0.5]);
        assert_eq!(frames, vec![vec![0.1, 0.2, 0.3, 0.4]]);
        assert_eq!(assembler.pending_samples(), 1);
    }

    #[test]
    fn test_large_block_yields_frames_in_order() {
        let mut assembler = FrameAssembler::new(4096);
        let block: Vec<f32> = (0..10_000).map(|i| i as f32).collect();

        let frames = assembler.push(&block);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0][0], 0.0);
        assert_eq!(frames[1][0], 4096.0);
        assert!(frames.iter().all(|f| f.len() == 4096));
        assert_eq!(assembler.pending_samples(), 10_000 - 8192);
    }

    #[test]
    fn test_clear_discards_partial_frame() {
        let mut assembler = FrameAssembler::new(0);
        assert_eq!(assembler.frame_samples(), 1);

        let mut assembler = FrameAssembler::new(8);
        assembler.push(&[1.0; 5]);
        assembler.clear();
        assert_eq!(assembler.pending_samples(), 0);
        assert_eq!(assembler.push(&[1.0; 8]).len(), 1);
    }
}
