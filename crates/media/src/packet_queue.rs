use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use ffmpeg_the_third as ffmpeg;

/// Bounds the demux thread's read-ahead; a full queue blocks the push until
/// the decoder catches up.
pub const PACKET_QUEUE_CAPACITY: usize = 256;

struct Entry {
    packet: ffmpeg::Packet,
    serial: u64,
}

#[derive(Default)]
struct Inner {
    entries: VecDeque<Entry>,
    aborted: bool,
}

/// Bounded FIFO of compressed packets with a flush serial.
///
/// `flush()` bumps the serial; entries queued under an older serial are
/// silently discarded on pop. The serial is the only signal a seek needs to
/// send through the decoder pipeline: the decoder thread notices the change
/// after a pop and flushes its own codec state (no cross-thread codec
/// access).
pub struct PacketQueue {
    inner: Mutex<Inner>,
    not_full: Condvar,
    not_empty: Condvar,
    serial: AtomicU64,
    capacity: usize,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self::with_capacity(PACKET_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            serial: AtomicU64::new(0),
            capacity,
        }
    }

    /// Blocks while the queue is at capacity. Returns false if the queue was
    /// aborted while waiting.
    pub fn push(&self, packet: ffmpeg::Packet) -> bool {
        let mut inner = self.inner.lock().unwrap();
        while inner.entries.len() >= self.capacity && !inner.aborted {
            inner = self.not_full.wait(inner).unwrap();
        }
        if inner.aborted {
            return false;
        }
        inner.entries.push_back(Entry {
            packet,
            serial: self.serial(),
        });
        self.not_empty.notify_one();
        true
    }

    /// Pops the next packet of the current generation, waiting up to
    /// `timeout`. Stale-generation entries are dropped without being
    /// returned. None on timeout or abort.
    pub fn pop(&self, timeout: Duration) -> Option<ffmpeg::Packet> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.aborted {
                return None;
            }
            while let Some(entry) = inner.entries.pop_front() {
                self.not_full.notify_one();
                if entry.serial == self.serial() {
                    return Some(entry.packet);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .not_empty
                .wait_timeout(inner, deadline - now)
                .unwrap();
            inner = guard;
        }
    }

    /// Drops everything queued so far and starts a new generation.
    pub fn flush(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        self.serial.fetch_add(1, Ordering::SeqCst);
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    /// Unblocks all waiters; subsequent pushes and pops fail until `start`.
    pub fn abort(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.aborted = true;
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    pub fn start(&self) {
        self.inner.lock().unwrap().aborted = false;
    }

    pub fn serial(&self) -> u64 {
        self.serial.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new()
    }
}
