use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use ffmpeg::format::Pixel;
use ffmpeg::software::scaling;
use ffmpeg::util::frame::video::Video as VideoFrame;
use ffmpeg_the_third as ffmpeg;

use rushes_media::clip_player::ClipPlayer;
use rushes_media::clock::Clock;
use rushes_playback::constants::{EXPORT_LOOKAHEAD, OUTPUT_SAMPLE_RATE};
use rushes_playback::engine::clips_in_window;
use rushes_playback::mixer::{AudioMixSource, AudioMixer, SourceClipMap};
use rushes_state::clip::ClipId;
use rushes_state::timeline::Timeline;
use rushes_state::track::TrackKind;

use crate::encoder::{AudioEncoder, VideoEncoder};
use crate::settings::ExportSettings;

/// Decode threads run asynchronously; the offline loop waits a bounded time
/// for each frame instead of pacing against a wall clock.
const VIDEO_WAIT_ATTEMPTS: u32 = 50;
const VIDEO_WAIT_INTERVAL: Duration = Duration::from_millis(10);
const AUDIO_WAIT_ATTEMPTS: u32 = 100;
const AUDIO_WAIT_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportState {
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

struct SessionShared {
    state: Mutex<ExportState>,
    error: Mutex<String>,
    cancel: AtomicBool,
    progress: AtomicU64,
    frames_encoded: AtomicI64,
    total_frames: AtomicI64,
}

impl SessionShared {
    fn set_state(&self, state: ExportState) {
        *self.state.lock().unwrap() = state;
    }

    fn fail(&self, message: String) {
        eprintln!("[EXPORT] FAILED: {message}");
        *self.error.lock().unwrap() = message;
        self.set_state(ExportState::Failed);
    }
}

/// Offline render of a timeline: the same clip players and mixer as live
/// playback, driven by a deterministic export clock at one fixed step per
/// output frame, feeding H.264 + AAC encoders. Runs on its own worker
/// thread; fatal errors stay inside the session as `Failed` and never
/// propagate into the playback engine.
pub struct ExportSession {
    shared: Arc<SessionShared>,
    worker: Option<JoinHandle<()>>,
}

impl ExportSession {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(SessionShared {
                state: Mutex::new(ExportState::Idle),
                error: Mutex::new(String::new()),
                cancel: AtomicBool::new(false),
                progress: AtomicU64::new(0f64.to_bits()),
                frames_encoded: AtomicI64::new(0),
                total_frames: AtomicI64::new(0),
            }),
            worker: None,
        }
    }

    /// Kicks off the export worker with a snapshot of the timeline.
    /// Returns false if a previous export is still running.
    pub fn start(&mut self, timeline: &Timeline, settings: ExportSettings) -> bool {
        if self.state() == ExportState::Running {
            return false;
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }

        self.shared.set_state(ExportState::Running);
        self.shared.cancel.store(false, Ordering::SeqCst);
        self.shared.progress.store(0f64.to_bits(), Ordering::Relaxed);
        self.shared.frames_encoded.store(0, Ordering::Relaxed);
        self.shared.total_frames.store(0, Ordering::Relaxed);
        self.shared.error.lock().unwrap().clear();

        let timeline = timeline.clone();
        let shared = Arc::clone(&self.shared);
        self.worker = Some(thread::spawn(move || {
            match run_export(&timeline, &settings, &shared) {
                Ok(()) => {
                    let mut state = shared.state.lock().unwrap();
                    if *state == ExportState::Running {
                        *state = ExportState::Completed;
                    }
                }
                Err(message) => shared.fail(message),
            }
        }));
        true
    }

    /// Requests cancellation; polled once per output frame.
    pub fn cancel(&self) {
        self.shared.cancel.store(true, Ordering::SeqCst);
    }

    pub fn wait(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }

    pub fn state(&self) -> ExportState {
        *self.shared.state.lock().unwrap()
    }

    pub fn progress(&self) -> f64 {
        f64::from_bits(self.shared.progress.load(Ordering::Relaxed))
    }

    pub fn frames_encoded(&self) -> i64 {
        self.shared.frames_encoded.load(Ordering::Relaxed)
    }

    pub fn total_frames(&self) -> i64 {
        self.shared.total_frames.load(Ordering::Relaxed)
    }

    pub fn error_message(&self) -> String {
        self.shared.error.lock().unwrap().clone()
    }
}

impl Default for ExportSession {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ExportSession {
    fn drop(&mut self) {
        self.cancel();
        self.wait();
    }
}

/// Mixer samples pulled per output frame.
fn samples_per_frame(sample_rate: u32, fps: u32) -> usize {
    (sample_rate as f64 / fps as f64).round() as usize
}

fn run_export(
    timeline: &Timeline,
    settings: &ExportSettings,
    shared: &SessionShared,
) -> Result<(), String> {
    rushes_media::init_once();
    settings.validate()?;

    let mut duration = timeline.total_duration();
    if settings.end_time > 0.0 && settings.end_time < duration {
        duration = settings.end_time;
    }
    let export_duration = duration - settings.start_time;
    if export_duration <= 0.0 {
        return Err("Export range is empty".into());
    }

    eprintln!(
        "[EXPORT] Starting export to {}",
        settings.output_path.display()
    );

    let mut octx = ffmpeg::format::output(&settings.output_path)
        .map_err(|e| format!("Cannot open output file {}: {e}", settings.output_path.display()))?;
    let mut video_encoder = VideoEncoder::add_to(&mut octx, settings)?;
    let mut audio_encoder = AudioEncoder::add_to(&mut octx, OUTPUT_SAMPLE_RATE)?;
    octx.write_header()
        .map_err(|e| format!("Cannot write container header: {e}"))?;

    let total_frames = (export_duration * settings.fps as f64) as i64;
    shared.total_frames.store(total_frames, Ordering::Relaxed);

    let frame_duration = 1.0 / settings.fps as f64;
    let audio_samples = samples_per_frame(OUTPUT_SAMPLE_RATE, settings.fps);
    let mut audio_buf = vec![0.0f32; audio_samples * 2];
    let mut composite = vec![0u8; settings.width as usize * settings.height as usize * 4];

    // Manually stepped clock; stays paused the whole time.
    let export_clock = Clock::new();
    export_clock.set(settings.start_time);

    let mixer = AudioMixer::new();
    let mut players: HashMap<ClipId, ClipPlayer> = HashMap::new();
    let mut active: HashSet<ClipId> = HashSet::new();

    eprintln!(
        "[EXPORT] Exporting {total_frames} frames ({export_duration:.2}s @ {} fps)",
        settings.fps
    );
    let export_start = Instant::now();

    for frame in 0..total_frames {
        if shared.cancel.load(Ordering::SeqCst) {
            shared.set_state(ExportState::Cancelled);
            eprintln!("[EXPORT] Cancelled at frame {frame}/{total_frames}");
            break;
        }

        let time = settings.start_time + frame as f64 * frame_duration;
        export_clock.set(time);

        update_active_clips(timeline, time, &mixer, &mut players, &mut active);

        composite_frame(timeline, time, &mut players, &mut composite, settings);
        video_encoder.encode_rgba(&mut octx, &composite, frame)?;

        if mixer.has_sources() {
            wait_for_audio(&players);
        }
        mixer.fill_buffer(&mut audio_buf, audio_samples, &export_clock);
        audio_encoder.push_interleaved(&mut octx, &audio_buf)?;

        shared.frames_encoded.store(frame + 1, Ordering::Relaxed);
        shared.progress.store(
            ((frame + 1) as f64 / total_frames as f64).to_bits(),
            Ordering::Relaxed,
        );

        if (frame + 1) % 100 == 0 || frame + 1 == total_frames {
            let elapsed = export_start.elapsed().as_secs_f64();
            let fps = (frame + 1) as f64 / elapsed.max(1e-6);
            let eta = (total_frames - frame - 1) as f64 / fps.max(1e-6);
            eprintln!(
                "[EXPORT] Frame {}/{total_frames} ({:.1}%) - {fps:.1} fps - ETA {eta:.0}s",
                frame + 1,
                100.0 * (frame + 1) as f64 / total_frames as f64
            );
        }
    }

    video_encoder.flush(&mut octx)?;
    audio_encoder.flush(&mut octx)?;
    octx.write_trailer()
        .map_err(|e| format!("Cannot finalize container: {e}"))?;

    mixer.clear_sources();
    for (_, mut player) in players.drain() {
        player.stop();
    }

    let elapsed = export_start.elapsed().as_secs_f64();
    eprintln!(
        "[EXPORT] Done: {total_frames} frames in {elapsed:.1}s ({:.1} fps avg)",
        total_frames as f64 / elapsed.max(1e-6)
    );
    Ok(())
}

/// Same activation window as live playback, driven by the export clock.
fn update_active_clips(
    timeline: &Timeline,
    time: f64,
    mixer: &AudioMixer,
    players: &mut HashMap<ClipId, ClipPlayer>,
    active: &mut HashSet<ClipId>,
) {
    let needed = clips_in_window(timeline, time, time + EXPORT_LOOKAHEAD);

    let to_remove: Vec<ClipId> = active
        .iter()
        .copied()
        .filter(|id| !needed.contains(id))
        .collect();
    if !to_remove.is_empty() {
        mixer.clear_sources();
    }
    for clip_id in &to_remove {
        if let Some(mut player) = players.remove(clip_id) {
            player.stop();
        }
        active.remove(clip_id);
    }

    let mut sources_changed = !to_remove.is_empty();
    for clip_id in needed {
        if active.contains(&clip_id) {
            continue;
        }
        let Some(clip) = timeline.clip(clip_id) else {
            continue;
        };
        let Some(track) = timeline.track(clip.track_id) else {
            continue;
        };
        let Some(asset) = timeline.asset(clip.asset_id) else {
            continue;
        };
        let need_video = track.kind == TrackKind::Video && asset.has_video;
        let need_audio = track.kind == TrackKind::Audio && asset.has_audio;
        if !need_video && !need_audio {
            continue;
        }

        match ClipPlayer::open(&asset.path, need_video, need_audio, OUTPUT_SAMPLE_RATE) {
            Ok(mut player) => {
                player.play();
                player.seek(clip.to_source_time(time));
                players.insert(clip_id, player);
                active.insert(clip_id);
                sources_changed = true;
            }
            Err(e) => {
                eprintln!("[EXPORT] failed to open clip {}: {e}", asset.path.display());
            }
        }
    }

    if sources_changed {
        let mut sources = Vec::new();
        for (clip_id, player) in players.iter() {
            if !player.has_audio() {
                continue;
            }
            let Some(clip) = timeline.clip(*clip_id) else {
                continue;
            };
            let Some(track) = timeline.track(clip.track_id) else {
                continue;
            };
            if track.kind != TrackKind::Audio {
                continue;
            }
            let Some(queue) = player.audio_frame_queue() else {
                continue;
            };
            sources.push(AudioMixSource::new(
                queue,
                Some(SourceClipMap {
                    source_in: clip.source_in,
                    timeline_start: clip.timeline_start,
                }),
                player.audio_time_base(),
                track.volume,
                track.muted,
                Some(*clip_id),
            ));
        }
        mixer.set_sources(sources);
    }
}

/// Bounded wait for the decoders to produce the first audio of this step.
fn wait_for_audio(players: &HashMap<ClipId, ClipPlayer>) {
    for _ in 0..AUDIO_WAIT_ATTEMPTS {
        let has_frames = players
            .values()
            .any(|p| p.has_audio() && p.audio_frame_queue_len() > 0);
        if has_frames {
            return;
        }
        thread::sleep(AUDIO_WAIT_INTERVAL);
    }
}

/// Paints all visible non-audio layers bottom-to-top into `out`.
fn composite_frame(
    timeline: &Timeline,
    time: f64,
    players: &mut HashMap<ClipId, ClipPlayer>,
    out: &mut [u8],
    settings: &ExportSettings,
) {
    out.fill(0);

    for &track_id in timeline.track_order() {
        let Some(track) = timeline.track(track_id) else {
            continue;
        };
        if !track.visible || track.kind == TrackKind::Audio {
            continue;
        }
        let Some(clip) = timeline.active_clip_on_track(track_id, time) else {
            continue;
        };
        let Some(asset) = timeline.asset(clip.asset_id) else {
            continue;
        };

        match track.kind {
            TrackKind::Image => {
                if let Some(pixels) = &asset.image_data {
                    blit_rgba(
                        pixels,
                        asset.width,
                        asset.height,
                        out,
                        settings.width,
                        settings.height,
                    );
                }
            }
            TrackKind::Video => {
                let Some(player) = players.get_mut(&clip.id) else {
                    continue;
                };
                let source_time = clip.to_source_time(time);
                for attempt in 0..VIDEO_WAIT_ATTEMPTS {
                    if attempt > 0 {
                        thread::sleep(VIDEO_WAIT_INTERVAL);
                    }
                    if let Some((data, w, h, _)) = player.video_frame_at(source_time) {
                        blit_rgba(data, w, h, out, settings.width, settings.height);
                        break;
                    }
                }
            }
            TrackKind::Audio => {}
        }
    }
}

/// Copies an RGBA image into the composite, resizing through swscale when
/// the dimensions differ.
fn blit_rgba(src: &[u8], src_w: u32, src_h: u32, dst: &mut [u8], dst_w: u32, dst_h: u32) {
    if src_w == 0 || src_h == 0 {
        return;
    }
    if src_w == dst_w && src_h == dst_h {
        let n = dst.len().min(src.len());
        dst[..n].copy_from_slice(&src[..n]);
        return;
    }

    let mut src_frame = VideoFrame::new(Pixel::RGBA, src_w, src_h);
    let stride = src_frame.stride(0);
    let row_bytes = src_w as usize * 4;
    {
        let data = src_frame.data_mut(0);
        for y in 0..src_h as usize {
            let src_start = y * row_bytes;
            let dst_start = y * stride;
            if src_start + row_bytes <= src.len() && dst_start + row_bytes <= data.len() {
                data[dst_start..dst_start + row_bytes]
                    .copy_from_slice(&src[src_start..src_start + row_bytes]);
            }
        }
    }

    let Ok(mut scaler) = scaling::Context::get(
        Pixel::RGBA,
        src_w,
        src_h,
        Pixel::RGBA,
        dst_w,
        dst_h,
        scaling::Flags::BILINEAR,
    ) else {
        return;
    };
    let mut scaled = VideoFrame::empty();
    if scaler.run(&src_frame, &mut scaled).is_err() {
        return;
    }

    let stride = scaled.stride(0);
    let row_bytes = dst_w as usize * 4;
    let data = scaled.data(0);
    for y in 0..dst_h as usize {
        let src_start = y * stride;
        let dst_start = y * row_bytes;
        if src_start + row_bytes <= data.len() && dst_start + row_bytes <= dst.len() {
            dst[dst_start..dst_start + row_bytes]
                .copy_from_slice(&data[src_start..src_start + row_bytes]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_per_frame_rounds_to_nearest() {
        assert_eq!(samples_per_frame(48_000, 30), 1600);
        assert_eq!(samples_per_frame(48_000, 60), 800);
        assert_eq!(samples_per_frame(48_000, 24), 2000);
        assert_eq!(samples_per_frame(44_100, 30), 1470);
        // non-integer ratio rounds instead of truncating
        assert_eq!(samples_per_frame(44_100, 24), 1838);
    }

    #[test]
    fn empty_timeline_fails_with_empty_range() {
        let timeline = Timeline::new();
        let mut session = ExportSession::new();
        assert!(session.start(
            &timeline,
            ExportSettings {
                output_path: std::env::temp_dir().join("rushes_empty_export.mp4"),
                ..Default::default()
            },
        ));
        session.wait();
        assert_eq!(session.state(), ExportState::Failed);
        assert_eq!(session.error_message(), "Export range is empty");
    }

    #[test]
    fn invalid_settings_fail_before_touching_the_output() {
        let timeline = Timeline::new();
        let mut session = ExportSession::new();
        session.start(
            &timeline,
            ExportSettings {
                width: 33,
                ..Default::default()
            },
        );
        session.wait();
        assert_eq!(session.state(), ExportState::Failed);
    }

    #[test]
    fn start_twice_while_running_is_rejected() {
        // state stays Running only while the worker is alive; after a
        // failure the next start must be accepted again
        let timeline = Timeline::new();
        let mut session = ExportSession::new();
        assert!(session.start(&timeline, ExportSettings::default()));
        session.wait();
        assert_ne!(session.state(), ExportState::Running);
        assert!(session.start(&timeline, ExportSettings::default()));
        session.wait();
    }
}
