use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rushes_media::audio_frame_queue::{AudioFrame, AudioFrameQueue};
use rushes_media::clock::Clock;
use rushes_state::clip::ClipId;

use crate::constants::{PREROLL_TOLERANCE, SEEK_LOCK_TIMEOUT_MS, SEEK_LOCK_TOLERANCE};

/// Source-to-timeline mapping for one mixed clip.
#[derive(Debug, Clone, Copy)]
pub struct SourceClipMap {
    pub source_in: f64,
    pub timeline_start: f64,
}

/// One audio source feeding the mixer: the clip player's frame queue plus a
/// snapshot of the clip mapping and track gain. The orchestrator rebuilds
/// the set whenever activation changes; owning the snapshot (and an `Arc` of
/// the queue) means the callback can never observe freed timeline state.
pub struct AudioMixSource {
    queue: Arc<AudioFrameQueue>,
    clip: Option<SourceClipMap>,
    time_base: f64,
    gain: f32,
    muted: bool,
    pub clip_id: Option<ClipId>,
    // read state, only touched under the mixer lock
    current: Option<AudioFrame>,
    frame_offset: usize,
}

impl AudioMixSource {
    pub fn new(
        queue: Arc<AudioFrameQueue>,
        clip: Option<SourceClipMap>,
        time_base: f64,
        gain: f32,
        muted: bool,
        clip_id: Option<ClipId>,
    ) -> Self {
        Self {
            queue,
            clip,
            time_base,
            gain,
            muted,
            clip_id,
            current: None,
            frame_offset: 0,
        }
    }
}

struct ClockLock {
    locked: bool,
    target: f64,
    since: Instant,
}

struct MixerInner {
    sources: Vec<AudioMixSource>,
    lock: ClockLock,
    temp: Vec<f32>,
}

/// Mixes all active audio sources into one interleaved stereo buffer and
/// disciplines the master clock from the audio actually being played.
/// Called from the device feeder thread; one mutex serializes it against
/// the main thread's source swaps.
pub struct AudioMixer {
    inner: Mutex<MixerInner>,
}

impl AudioMixer {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MixerInner {
                sources: Vec::new(),
                lock: ClockLock {
                    locked: false,
                    target: 0.0,
                    since: Instant::now(),
                },
                temp: Vec::new(),
            }),
        }
    }

    /// Atomically replaces the source set, dropping per-source read state.
    pub fn set_sources(&self, sources: Vec<AudioMixSource>) {
        let mut inner = self.inner.lock().unwrap();
        inner.sources = sources;
    }

    pub fn clear_sources(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.sources.clear();
    }

    pub fn has_sources(&self) -> bool {
        !self.inner.lock().unwrap().sources.is_empty()
    }

    /// Holds clock updates until a post-seek frame near `target` arrives, so
    /// stale audio cannot drag the playhead back to its pre-seek position.
    /// Auto-releases after a timeout in case no such frame ever shows up.
    pub fn lock_clock_for_seek(&self, target: f64) {
        let mut inner = self.inner.lock().unwrap();
        inner.lock = ClockLock {
            locked: true,
            target,
            since: Instant::now(),
        };
    }

    /// Fills `out` with `frames` interleaved stereo frames. Missing source
    /// data becomes silence; the final mix is clamped to [-1, 1].
    pub fn fill_buffer(&self, out: &mut [f32], frames: usize, clock: &Clock) {
        let samples = frames * 2;
        let out_len = out.len();
        let out = &mut out[..samples.min(out_len)];
        out.fill(0.0);

        let mut inner = self.inner.lock().unwrap();
        if inner.sources.is_empty() {
            return;
        }

        if inner.temp.len() < samples {
            inner.temp.resize(samples, 0.0);
        }

        let MixerInner {
            sources,
            lock,
            temp,
        } = &mut *inner;

        for src in sources.iter_mut() {
            if src.muted {
                continue;
            }
            let frames_read = read_source(src, &mut temp[..samples], frames, clock, lock);
            if frames_read == 0 {
                continue;
            }
            let gain = src.gain;
            for (dst, s) in out.iter_mut().zip(&temp[..frames_read * 2]) {
                *dst += *s * gain;
            }
        }

        for s in out.iter_mut() {
            *s = s.clamp(-1.0, 1.0);
        }
    }
}

impl Default for AudioMixer {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads up to `frames` frames from one source, discarding keyframe
/// pre-roll, mapping source pts onto timeline time and disciplining the
/// clock at the start of each source frame. Returns frames written; the
/// remainder of `buf` is zeroed.
fn read_source(
    src: &mut AudioMixSource,
    buf: &mut [f32],
    frames: usize,
    clock: &Clock,
    lock: &mut ClockLock,
) -> usize {
    let mut written = 0;

    while written < frames {
        if src.current.is_none() {
            src.current = src.queue.try_pop();
            src.frame_offset = 0;
            if src.current.is_none() {
                break;
            }
        }
        let frame = src.current.as_ref().expect("checked above");

        if src.frame_offset == 0 {
            let source_pts = frame.pts as f64 * src.time_base;

            // A container seek lands on a keyframe that may be seconds
            // before source_in; those frames must never be played.
            if let Some(map) = src.clip {
                if source_pts < map.source_in - PREROLL_TOLERANCE {
                    src.current = None;
                    continue;
                }
            }

            let timeline_time = match src.clip {
                Some(map) => (source_pts - map.source_in) + map.timeline_start,
                None => source_pts,
            };

            if lock.locked {
                let aged =
                    lock.since.elapsed() > Duration::from_millis(SEEK_LOCK_TIMEOUT_MS);
                if timeline_time >= lock.target - SEEK_LOCK_TOLERANCE || aged {
                    lock.locked = false;
                    clock.set(timeline_time);
                } else {
                    // stale pre-seek frame; drop it whole
                    src.current = None;
                    continue;
                }
            } else {
                clock.set_if_forward(timeline_time);
            }
        }

        let frame = src.current.as_ref().expect("checked above");
        let total_frames = frame.frame_count();
        let remaining = total_frames - src.frame_offset;
        let needed = frames - written;
        let take = remaining.min(needed);

        buf[written * 2..(written + take) * 2].copy_from_slice(
            &frame.samples[src.frame_offset * 2..(src.frame_offset + take) * 2],
        );
        written += take;

        if take == remaining {
            src.current = None;
            src.frame_offset = 0;
        } else {
            src.frame_offset += take;
        }
    }

    if written < frames {
        buf[written * 2..frames * 2].fill(0.0);
    }
    written
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: f64 = 48_000.0;

    fn queue_with(frames: Vec<AudioFrame>) -> Arc<AudioFrameQueue> {
        let queue = Arc::new(AudioFrameQueue::new());
        for frame in frames {
            queue.push(frame);
        }
        queue
    }

    /// `count` frames of constant amplitude starting at `start_seconds`,
    /// pts in a 1/48000 time base.
    fn tone(start_seconds: f64, count: usize, amplitude: f32) -> AudioFrame {
        AudioFrame {
            samples: vec![amplitude; count * 2],
            pts: (start_seconds * RATE) as i64,
            serial: 0,
        }
    }

    fn source(queue: Arc<AudioFrameQueue>, map: Option<SourceClipMap>, gain: f32) -> AudioMixSource {
        AudioMixSource::new(queue, map, 1.0 / RATE, gain, false, None)
    }

    #[test]
    fn silence_without_sources() {
        let mixer = AudioMixer::new();
        let clock = Clock::new();
        let mut out = vec![1.0f32; 64];
        mixer.fill_buffer(&mut out, 32, &clock);
        assert!(out.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn overlapping_sources_mix_additively() {
        let mixer = AudioMixer::new();
        let clock = Clock::new();
        let map = SourceClipMap {
            source_in: 0.0,
            timeline_start: 0.0,
        };
        let a = source(queue_with(vec![tone(0.0, 256, 0.5)]), Some(map), 1.0);
        let b = source(queue_with(vec![tone(0.0, 256, 0.5)]), Some(map), 1.0);
        mixer.set_sources(vec![a, b]);

        let mut out = vec![0.0f32; 256 * 2];
        mixer.fill_buffer(&mut out, 256, &clock);
        assert!(out.iter().all(|s| (*s - 1.0).abs() < 1e-6));
    }

    #[test]
    fn mix_is_clamped() {
        let mixer = AudioMixer::new();
        let clock = Clock::new();
        let a = source(queue_with(vec![tone(0.0, 64, 0.8)]), None, 1.0);
        let b = source(queue_with(vec![tone(0.0, 64, 0.8)]), None, 1.0);
        mixer.set_sources(vec![a, b]);

        let mut out = vec![0.0f32; 128];
        mixer.fill_buffer(&mut out, 64, &clock);
        assert!(out.iter().all(|s| *s <= 1.0));
    }

    #[test]
    fn track_gain_and_mute_apply() {
        let mixer = AudioMixer::new();
        let clock = Clock::new();
        let quiet = source(queue_with(vec![tone(0.0, 64, 1.0)]), None, 0.25);
        let mut muted = source(queue_with(vec![tone(0.0, 64, 1.0)]), None, 1.0);
        muted.muted = true;
        mixer.set_sources(vec![quiet, muted]);

        let mut out = vec![0.0f32; 128];
        mixer.fill_buffer(&mut out, 64, &clock);
        assert!(out.iter().all(|s| (*s - 0.25).abs() < 1e-6));
    }

    #[test]
    fn underrun_pads_with_silence() {
        let mixer = AudioMixer::new();
        let clock = Clock::new();
        mixer.set_sources(vec![source(queue_with(vec![tone(0.0, 16, 0.5)]), None, 1.0)]);

        let mut out = vec![1.0f32; 64 * 2];
        mixer.fill_buffer(&mut out, 64, &clock);
        assert!(out[..32].iter().all(|s| (*s - 0.5).abs() < 1e-6));
        assert!(out[32..].iter().all(|s| *s == 0.0));
    }

    #[test]
    fn preroll_frames_are_discarded() {
        let mixer = AudioMixer::new();
        let clock = Clock::new();
        let map = SourceClipMap {
            source_in: 2.0,
            timeline_start: 0.0,
        };
        // keyframe pre-roll at 1.0s, real audio at clip in-point
        let queue = queue_with(vec![tone(1.0, 32, 0.9), tone(2.0, 32, 0.5)]);
        mixer.set_sources(vec![source(queue, Some(map), 1.0)]);

        let mut out = vec![0.0f32; 32 * 2];
        mixer.fill_buffer(&mut out, 32, &clock);
        assert!(
            out.iter().all(|s| (*s - 0.5).abs() < 1e-6),
            "pre-roll amplitude leaked into the mix"
        );
    }

    #[test]
    fn frames_spanning_the_preroll_boundary_survive() {
        let mixer = AudioMixer::new();
        let clock = Clock::new();
        let map = SourceClipMap {
            source_in: 2.0,
            timeline_start: 0.0,
        };
        // 30ms early is within the tolerance window and must be kept
        let queue = queue_with(vec![tone(1.97, 32, 0.5)]);
        mixer.set_sources(vec![source(queue, Some(map), 1.0)]);

        let mut out = vec![0.0f32; 32 * 2];
        mixer.fill_buffer(&mut out, 32, &clock);
        assert!(out.iter().any(|s| *s != 0.0));
    }

    #[test]
    fn normal_reads_advance_the_clock_forward_only() {
        let mixer = AudioMixer::new();
        let clock = Clock::new();
        clock.set(10.0);
        let map = SourceClipMap {
            source_in: 0.0,
            timeline_start: 0.0,
        };
        // a frame mapping to t=1.0 must not retreat the clock
        let queue = queue_with(vec![tone(1.0, 32, 0.5)]);
        mixer.set_sources(vec![source(queue, Some(map), 1.0)]);

        let mut out = vec![0.0f32; 64];
        mixer.fill_buffer(&mut out, 32, &clock);
        assert_eq!(clock.get(), 10.0);
    }

    #[test]
    fn seek_lock_discards_stale_frames_then_sets_clock() {
        let mixer = AudioMixer::new();
        let clock = Clock::new();
        clock.set(2.0);
        let map = SourceClipMap {
            source_in: 0.0,
            timeline_start: 0.0,
        };
        // frames from before the seek (t=1.0), then the post-seek frame
        let queue = queue_with(vec![tone(1.0, 32, 0.9), tone(5.0, 32, 0.5)]);
        mixer.set_sources(vec![source(queue, Some(map), 1.0)]);
        mixer.lock_clock_for_seek(5.0);

        let mut out = vec![0.0f32; 64];
        mixer.fill_buffer(&mut out, 32, &clock);

        // stale amplitude was dropped, accepted frame set the clock
        assert!(out.iter().all(|s| (*s - 0.5).abs() < 1e-6));
        assert!((clock.get() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn seek_lock_accepts_generous_keyframe_tolerance() {
        let mixer = AudioMixer::new();
        let clock = Clock::new();
        let map = SourceClipMap {
            source_in: 0.0,
            timeline_start: 0.0,
        };
        // 2.5s before the target is within the long-GOP tolerance
        let queue = queue_with(vec![tone(2.5, 32, 0.5)]);
        mixer.set_sources(vec![source(queue, Some(map), 1.0)]);
        mixer.lock_clock_for_seek(5.0);

        let mut out = vec![0.0f32; 64];
        mixer.fill_buffer(&mut out, 32, &clock);
        assert!((clock.get() - 2.5).abs() < 1e-9);
    }

    #[test]
    fn partial_frame_reads_keep_offset_across_calls() {
        let mixer = AudioMixer::new();
        let clock = Clock::new();
        // one 64-frame source frame, consumed in two 32-frame callbacks
        let mut samples = Vec::new();
        for i in 0..64 {
            samples.push(i as f32);
            samples.push(i as f32);
        }
        let queue = queue_with(vec![AudioFrame {
            samples,
            pts: 0,
            serial: 0,
        }]);
        mixer.set_sources(vec![source(queue, None, 1.0)]);

        let mut first = vec![0.0f32; 64];
        mixer.fill_buffer(&mut first, 32, &clock);
        let mut second = vec![0.0f32; 64];
        mixer.fill_buffer(&mut second, 32, &clock);

        assert_eq!(first[0], 0.0);
        assert_eq!(first[62], 31.0);
        assert_eq!(second[0], 32.0);
        assert_eq!(second[62], 63.0);
    }
}
