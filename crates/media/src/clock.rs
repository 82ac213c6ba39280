use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// Only accept forward updates within this tolerance of the current time.
/// Keeps the audio thread from ever walking the playhead backward.
const FORWARD_TOLERANCE: f64 = 0.1;

fn wall_seconds() -> f64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64()
}

/// Monotonic PTS clock. While running, `get()` extrapolates from the last
/// anchor using wall time; while paused it reports the frozen position.
/// All fields are relaxed atomics so any thread can read a snapshot.
pub struct Clock {
    pts: AtomicU64,
    last_update: AtomicU64,
    paused: AtomicBool,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            pts: AtomicU64::new(0f64.to_bits()),
            last_update: AtomicU64::new(wall_seconds().to_bits()),
            paused: AtomicBool::new(true),
        }
    }

    pub fn set(&self, pts: f64) {
        self.pts.store(pts.to_bits(), Ordering::Relaxed);
        self.last_update
            .store(wall_seconds().to_bits(), Ordering::Relaxed);
    }

    /// Forward-only update. Ignores values that would move the clock
    /// backward by more than the tolerance.
    pub fn set_if_forward(&self, pts: f64) {
        if pts >= self.get() - FORWARD_TOLERANCE {
            self.set(pts);
        }
    }

    pub fn get(&self) -> f64 {
        let pts = f64::from_bits(self.pts.load(Ordering::Relaxed));
        if self.paused.load(Ordering::Relaxed) {
            return pts;
        }
        let last = f64::from_bits(self.last_update.load(Ordering::Relaxed));
        pts + (wall_seconds() - last)
    }

    pub fn pause(&self) {
        self.set(self.get());
        self.paused.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.last_update
            .store(wall_seconds().to_bits(), Ordering::Relaxed);
        self.paused.store(false, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn paused_clock_holds_position() {
        let clock = Clock::new();
        clock.set(3.5);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(clock.get(), 3.5);
    }

    #[test]
    fn running_clock_advances() {
        let clock = Clock::new();
        clock.set(1.0);
        clock.resume();
        thread::sleep(Duration::from_millis(30));
        let t = clock.get();
        assert!(t > 1.0, "clock did not advance: {t}");
        assert!(t < 2.0);
    }

    #[test]
    fn pause_freezes_at_current_time() {
        let clock = Clock::new();
        clock.set(0.0);
        clock.resume();
        thread::sleep(Duration::from_millis(20));
        clock.pause();
        let frozen = clock.get();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(clock.get(), frozen);
    }

    #[test]
    fn set_if_forward_rejects_backward_jumps() {
        let clock = Clock::new();
        clock.set(10.0);
        clock.set_if_forward(5.0);
        assert_eq!(clock.get(), 10.0);

        // within tolerance is accepted
        clock.set_if_forward(9.95);
        assert!((clock.get() - 9.95).abs() < 1e-9);

        clock.set_if_forward(10.2);
        assert!((clock.get() - 10.2).abs() < 1e-9);
    }

    #[test]
    fn resume_rebases_instead_of_jumping() {
        let clock = Clock::new();
        clock.set(2.0);
        thread::sleep(Duration::from_millis(20));
        clock.resume();
        // time spent paused must not count
        assert!(clock.get() < 2.01);
    }
}
