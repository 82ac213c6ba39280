use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

pub const AUDIO_FRAME_QUEUE_CAPACITY: usize = 32;

/// One decoded and resampled audio frame: interleaved stereo f32 at the
/// mixer's output rate, pts still in the source stream's time base.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub pts: i64,
    pub serial: u64,
}

impl AudioFrame {
    pub fn frame_count(&self) -> usize {
        self.samples.len() / 2
    }
}

struct Inner {
    frames: VecDeque<AudioFrame>,
    aborted: bool,
}

/// Bounded FIFO between one audio decoder thread and the mixer. The
/// producer blocks on a full queue; the consumer never blocks (an underrun
/// is silence, not a stall).
pub struct AudioFrameQueue {
    inner: Mutex<Inner>,
    not_full: Condvar,
    capacity: usize,
}

impl AudioFrameQueue {
    pub fn new() -> Self {
        Self::with_capacity(AUDIO_FRAME_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                frames: VecDeque::with_capacity(capacity),
                aborted: false,
            }),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Blocks while full. Returns false if aborted while waiting.
    pub fn push(&self, frame: AudioFrame) -> bool {
        let mut inner = self.inner.lock().unwrap();
        while inner.frames.len() >= self.capacity && !inner.aborted {
            inner = self.not_full.wait(inner).unwrap();
        }
        if inner.aborted {
            return false;
        }
        inner.frames.push_back(frame);
        true
    }

    /// Non-blocking take of the front frame.
    pub fn try_pop(&self) -> Option<AudioFrame> {
        let mut inner = self.inner.lock().unwrap();
        let frame = inner.frames.pop_front();
        if frame.is_some() {
            self.not_full.notify_one();
        }
        frame
    }

    pub fn peek_pts(&self) -> Option<i64> {
        self.inner.lock().unwrap().frames.front().map(|f| f.pts)
    }

    pub fn flush(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.frames.clear();
        self.not_full.notify_all();
    }

    pub fn abort(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.aborted = true;
        self.not_full.notify_all();
    }

    pub fn start(&self) {
        self.inner.lock().unwrap().aborted = false;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AudioFrameQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn frame(pts: i64) -> AudioFrame {
        AudioFrame {
            samples: vec![0.0; 64],
            pts,
            serial: 0,
        }
    }

    #[test]
    fn fifo_order() {
        let queue = AudioFrameQueue::new();
        queue.push(frame(1));
        queue.push(frame(2));
        assert_eq!(queue.peek_pts(), Some(1));
        assert_eq!(queue.try_pop().unwrap().pts, 1);
        assert_eq!(queue.try_pop().unwrap().pts, 2);
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn push_blocks_at_capacity() {
        let queue = Arc::new(AudioFrameQueue::with_capacity(1));
        queue.push(frame(0));

        let q = Arc::clone(&queue);
        let producer = thread::spawn(move || q.push(frame(1)));

        thread::sleep(Duration::from_millis(20));
        assert!(!producer.is_finished());

        queue.try_pop().unwrap();
        assert!(producer.join().unwrap());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn abort_unblocks_producer() {
        let queue = Arc::new(AudioFrameQueue::with_capacity(1));
        queue.push(frame(0));

        let q = Arc::clone(&queue);
        let producer = thread::spawn(move || q.push(frame(1)));

        thread::sleep(Duration::from_millis(20));
        queue.abort();
        assert!(!producer.join().unwrap());
    }

    #[test]
    fn flush_empties_queue() {
        let queue = AudioFrameQueue::new();
        queue.push(frame(0));
        queue.push(frame(1));
        queue.flush();
        assert!(queue.is_empty());
        assert!(queue.try_pop().is_none());
    }
}
