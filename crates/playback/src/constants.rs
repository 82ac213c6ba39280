/// Clips are kept hot while their interval intersects
/// `[now, now + ACTIVATION_LOOKAHEAD)`, enough to cover worst-case decoder
/// startup before the playhead arrives.
pub const ACTIVATION_LOOKAHEAD: f64 = 1.0;

/// The offline exporter is not wall-clock-bound, so half the window covers it.
pub const EXPORT_LOOKAHEAD: f64 = ACTIVATION_LOOKAHEAD * 0.5;

pub const OUTPUT_SAMPLE_RATE: u32 = rushes_audio::output::OUTPUT_SAMPLE_RATE;
pub const OUTPUT_CHANNELS: usize = rushes_audio::output::OUTPUT_CHANNELS;

/// Audio frames earlier than `source_in` by more than this are keyframe
/// pre-roll from a container seek and must never be heard.
pub const PREROLL_TOLERANCE: f64 = 0.05;

/// After a seek the mixer accepts the first frame within this window of the
/// target; keyframes can land seconds early on long-GOP streams.
pub const SEEK_LOCK_TOLERANCE: f64 = 3.0;

/// Safety release for the seek clock-lock.
pub const SEEK_LOCK_TIMEOUT_MS: u64 = 1000;

/// Interval of the periodic playback stats line.
pub const STATS_INTERVAL: f64 = 1.0;

/// Images imported without intrinsic duration get this clip length.
pub const IMAGE_DEFAULT_DURATION: f64 = 5.0;
