use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// Enough decoded frames to ride out ~0.25 s of decode jitter at 60 fps.
pub const VIDEO_FRAME_QUEUE_CAPACITY: usize = 16;

struct ReadyFrame {
    data: Vec<u8>,
    pts: i64,
    serial: u64,
}

struct Inner {
    free: Vec<Vec<u8>>,
    ready: VecDeque<ReadyFrame>,
    aborted: bool,
}

/// Bounded pool of recycled RGBA buffers between one decoder thread and the
/// main-thread consumer.
///
/// The producer takes a buffer out of the free pool (blocking while the
/// consumer owns them all, which is the backpressure), writes pixels, then
/// commits it with its pts and generation. The consumer peeks the front
/// entry, copies it out, and pops, which returns the buffer to the pool.
/// Buffers are allocated once for a fixed frame size and never freed until
/// the queue is dropped.
pub struct VideoFrameQueue {
    inner: Mutex<Inner>,
    slot_free: Condvar,
    width: u32,
    height: u32,
}

impl VideoFrameQueue {
    pub fn new(width: u32, height: u32) -> Self {
        Self::with_capacity(width, height, VIDEO_FRAME_QUEUE_CAPACITY)
    }

    pub fn with_capacity(width: u32, height: u32, capacity: usize) -> Self {
        let frame_bytes = width as usize * height as usize * 4;
        Self {
            inner: Mutex::new(Inner {
                free: (0..capacity).map(|_| vec![0u8; frame_bytes]).collect(),
                ready: VecDeque::with_capacity(capacity),
                aborted: false,
            }),
            slot_free: Condvar::new(),
            width,
            height,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }

    /// Takes a writable buffer, blocking until one is recycled or the queue
    /// is aborted (None).
    pub fn acquire_write_slot(&self) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        while inner.free.is_empty() && !inner.aborted {
            inner = self.slot_free.wait(inner).unwrap();
        }
        if inner.aborted {
            return None;
        }
        inner.free.pop()
    }

    /// Publishes a buffer previously taken with `acquire_write_slot`.
    pub fn commit(&self, data: Vec<u8>, pts: i64, serial: u64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.aborted {
            // teardown in progress; recycle instead of publishing
            inner.free.push(data);
            return;
        }
        inner.ready.push_back(ReadyFrame { data, pts, serial });
    }

    pub fn peek_pts(&self) -> Option<(i64, u64)> {
        let inner = self.inner.lock().unwrap();
        inner.ready.front().map(|f| (f.pts, f.serial))
    }

    /// Copies the front frame's pixels into `dst`. False when empty.
    pub fn copy_front_into(&self, dst: &mut [u8]) -> bool {
        let inner = self.inner.lock().unwrap();
        let Some(front) = inner.ready.front() else {
            return false;
        };
        let n = dst.len().min(front.data.len());
        dst[..n].copy_from_slice(&front.data[..n]);
        true
    }

    /// Releases the front frame back to the pool.
    pub fn pop(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(front) = inner.ready.pop_front() {
            inner.free.push(front.data);
            self.slot_free.notify_one();
        }
    }

    /// Drops all ready frames without freeing their buffers.
    pub fn flush(&self) {
        let mut inner = self.inner.lock().unwrap();
        while let Some(front) = inner.ready.pop_front() {
            inner.free.push(front.data);
        }
        self.slot_free.notify_all();
    }

    pub fn abort(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.aborted = true;
        self.slot_free.notify_all();
    }

    pub fn start(&self) {
        self.inner.lock().unwrap().aborted = false;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn produce_consume_cycle() {
        let queue = VideoFrameQueue::with_capacity(2, 2, 2);
        let mut buf = queue.acquire_write_slot().unwrap();
        buf.fill(0xAB);
        queue.commit(buf, 100, 0);

        assert_eq!(queue.peek_pts(), Some((100, 0)));
        let mut out = vec![0u8; queue.frame_bytes()];
        assert!(queue.copy_front_into(&mut out));
        assert!(out.iter().all(|b| *b == 0xAB));
        queue.pop();
        assert!(queue.is_empty());
        assert_eq!(queue.peek_pts(), None);
    }

    #[test]
    fn producer_blocks_until_consumer_pops() {
        let queue = Arc::new(VideoFrameQueue::with_capacity(2, 2, 1));
        let buf = queue.acquire_write_slot().unwrap();
        queue.commit(buf, 0, 0);

        let q = Arc::clone(&queue);
        let producer = thread::spawn(move || q.acquire_write_slot().is_some());

        thread::sleep(Duration::from_millis(20));
        assert!(!producer.is_finished(), "acquire should block while full");

        queue.pop();
        assert!(producer.join().unwrap());
    }

    #[test]
    fn abort_wakes_blocked_producer() {
        let queue = Arc::new(VideoFrameQueue::with_capacity(2, 2, 1));
        let buf = queue.acquire_write_slot().unwrap();
        queue.commit(buf, 0, 0);

        let q = Arc::clone(&queue);
        let producer = thread::spawn(move || q.acquire_write_slot());

        thread::sleep(Duration::from_millis(20));
        queue.abort();
        assert!(producer.join().unwrap().is_none());
    }

    #[test]
    fn flush_recycles_all_buffers() {
        let queue = VideoFrameQueue::with_capacity(2, 2, 3);
        for pts in 0..3 {
            let buf = queue.acquire_write_slot().unwrap();
            queue.commit(buf, pts, 0);
        }
        queue.flush();
        assert!(queue.is_empty());
        // all three buffers are writable again without blocking
        for _ in 0..3 {
            assert!(queue.acquire_write_slot().is_some());
        }
    }
}
