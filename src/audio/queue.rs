//! Bounded playback queue with drop-oldest backpressure

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::audio::AudioFrame;

/// Bounded FIFO of encoded frames awaiting decode and playback.
///
/// When full, pushing evicts the oldest entry to admit the newest:
/// playback freshness matters more than completeness.
#[derive(Debug)]
pub struct PlaybackQueue {
    inner: Mutex<VecDeque<AudioFrame>>,
    capacity: usize,
}

impl PlaybackQueue {
    /// Create a queue holding at most `capacity` frames
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    /// Create a queue sized to roughly ten seconds of audio at the
    /// given frame duration
    #[must_use]
    pub fn for_frame_duration(frame_ms: u32) -> Self {
        let frame_ms = frame_ms.max(1) as usize;
        Self::with_capacity(10_000_usize.div_ceil(frame_ms))
    }

    /// Enqueue a frame, evicting the oldest entry when full.
    ///
    /// Returns true if an old frame was dropped to make room.
    pub fn push(&self, frame: AudioFrame) -> bool {
        let mut queue = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let evicted = if queue.len() >= self.capacity {
            queue.pop_front();
            true
        } else {
            false
        };
        queue.push_back(frame);
        evicted
    }

    /// Dequeue the oldest frame
    pub fn pop(&self) -> Option<AudioFrame> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front()
    }

    /// Number of queued frames
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether the queue is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of frames the queue will hold
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Discard all queued frames, returning how many were dropped
    pub fn clear(&self) -> usize {
        let mut queue = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let dropped = queue.len();
        queue.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(byte: u8) -> AudioFrame {
        AudioFrame::new(vec![byte])
    }

    #[test]
    fn push_pop_fifo() {
        let queue = PlaybackQueue::with_capacity(8);
        queue.push(frame(1));
        queue.push(frame(2));
        queue.push(frame(3));

        assert_eq!(queue.pop().unwrap().as_bytes(), &[1]);
        assert_eq!(queue.pop().unwrap().as_bytes(), &[2]);
        assert_eq!(queue.pop().unwrap().as_bytes(), &[3]);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn overflow_evicts_oldest() {
        let queue = PlaybackQueue::with_capacity(3);

        for i in 1..=5 {
            queue.push(frame(i));
        }

        // Five pushes into capacity three: the last three survive, in order
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop().unwrap().as_bytes(), &[3]);
        assert_eq!(queue.pop().unwrap().as_bytes(), &[4]);
        assert_eq!(queue.pop().unwrap().as_bytes(), &[5]);
    }

    #[test]
    fn push_reports_eviction() {
        let queue = PlaybackQueue::with_capacity(2);
        assert!(!queue.push(frame(1)));
        assert!(!queue.push(frame(2)));
        assert!(queue.push(frame(3)));
    }

    #[test]
    fn never_exceeds_capacity() {
        let queue = PlaybackQueue::with_capacity(4);
        for i in 0..50 {
            queue.push(frame(i));
            assert!(queue.len() <= 4);
        }
    }

    #[test]
    fn clear_empties_queue() {
        let queue = PlaybackQueue::with_capacity(4);
        queue.push(frame(1));
        queue.push(frame(2));

        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn ten_second_sizing() {
        assert_eq!(PlaybackQueue::for_frame_duration(60).capacity(), 167);
        assert_eq!(PlaybackQueue::for_frame_duration(20).capacity(), 500);
    }
}
