use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use rushes_audio::output::AudioOutput;
use rushes_media::clip_player::ClipPlayer;
use rushes_media::clock::Clock;
use rushes_state::clip::ClipId;
use rushes_state::timeline::Timeline;
use rushes_state::track::{TrackId, TrackKind};
use rushes_state::transport::PlaybackState;

use crate::constants::{ACTIVATION_LOOKAHEAD, OUTPUT_SAMPLE_RATE, STATS_INTERVAL};
use crate::mixer::{AudioMixSource, AudioMixer, SourceClipMap};

/// One composited layer for the external renderer, bottom-to-top order.
#[derive(Clone)]
pub struct Layer {
    pub rgba: Arc<Vec<u8>>,
    pub width: u32,
    pub height: u32,
    pub track_id: TrackId,
}

struct TrackStage {
    buffer: Arc<Vec<u8>>,
    width: u32,
    height: u32,
}

#[derive(Default)]
struct Stats {
    last_print: f64,
    new_frames: u64,
    held_frames: u64,
    fps_window_start: f64,
    fps_window_frames: u32,
    video_fps: f64,
}

/// The playback orchestrator: owns the master clock, the mixer, the audio
/// device and the set of hot clip players, and turns a timeline plus an
/// advancing playhead into per-frame layer lists and mixed audio.
pub struct TimelinePlayback {
    state: PlaybackState,
    master_clock: Arc<Clock>,
    mixer: Arc<AudioMixer>,
    audio_output: Option<AudioOutput>,
    audio_started: bool,
    players: HashMap<ClipId, ClipPlayer>,
    active_clips: HashSet<ClipId>,
    stages: HashMap<TrackId, TrackStage>,
    stats: Stats,
    started_at: Instant,
}

impl TimelinePlayback {
    pub fn new() -> Self {
        let master_clock = Arc::new(Clock::new());
        let mixer = Arc::new(AudioMixer::new());

        let audio_output = match AudioOutput::new() {
            Ok(mut output) => {
                let fill_mixer = Arc::clone(&mixer);
                let fill_clock = Arc::clone(&master_clock);
                output.start_with_source(move |buf, frames| {
                    fill_mixer.fill_buffer(buf, frames, &fill_clock);
                });
                Some(output)
            }
            Err(e) => {
                eprintln!("[TIMELINE] audio output unavailable: {e}");
                None
            }
        };

        Self {
            state: PlaybackState::Stopped,
            master_clock,
            mixer,
            audio_output,
            audio_started: false,
            players: HashMap::new(),
            active_clips: HashSet::new(),
            stages: HashMap::new(),
            stats: Stats::default(),
            started_at: Instant::now(),
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn is_playing(&self) -> bool {
        self.state == PlaybackState::Playing
    }

    pub fn duration(&self, timeline: &Timeline) -> f64 {
        timeline.total_duration()
    }

    /// The externally visible playhead: corrected for device-buffered audio
    /// while the device is running, the raw master clock otherwise.
    pub fn current_time(&self) -> f64 {
        let raw = self.master_clock.get();
        match (&self.audio_output, self.audio_started) {
            (Some(output), true) => output.playback_clock(raw),
            _ => raw,
        }
    }

    pub fn play(&mut self, timeline: &Timeline) {
        match self.state {
            PlaybackState::Playing => {}
            PlaybackState::Paused => {
                self.master_clock.resume();
                if self.audio_started {
                    if let Some(output) = &self.audio_output {
                        output.resume();
                    }
                }
                self.state = PlaybackState::Playing;
            }
            PlaybackState::Stopped => {
                // preserve a scrubbed position set by seek() while stopped
                let mut start_pos = self.master_clock.get();
                let duration = timeline.total_duration();
                if start_pos < 0.0 || (duration > 0.0 && start_pos >= duration) {
                    start_pos = 0.0;
                }
                self.master_clock.set(start_pos);
                self.master_clock.resume();
                self.stats = Stats::default();
                self.stats.last_print = self.wall();
                self.stats.fps_window_start = self.wall();
                self.state = PlaybackState::Playing;

                // populate the activation set before unpausing the device
                self.update(timeline);

                if self.mixer.has_sources() {
                    if let Some(output) = &self.audio_output {
                        output.resume();
                        self.audio_started = true;
                    }
                }
            }
        }
    }

    pub fn pause(&mut self) {
        if self.state != PlaybackState::Playing {
            return;
        }
        self.master_clock.pause();
        if self.audio_started {
            if let Some(output) = &self.audio_output {
                output.pause();
            }
        }
        self.state = PlaybackState::Paused;
    }

    pub fn toggle_play_pause(&mut self, timeline: &Timeline) {
        if self.state == PlaybackState::Playing {
            self.pause();
        } else {
            self.play(timeline);
        }
    }

    pub fn stop(&mut self) {
        if self.state == PlaybackState::Stopped {
            return;
        }

        // the callback must stop referencing player queues before the
        // players are torn down
        self.mixer.clear_sources();
        for (_, mut player) in self.players.drain() {
            player.stop();
        }
        self.active_clips.clear();

        if let Some(output) = &self.audio_output {
            output.pause();
        }

        self.master_clock.set(0.0);
        self.master_clock.pause();
        self.audio_started = false;
        self.stages.clear();
        self.state = PlaybackState::Stopped;
    }

    pub fn seek(&mut self, timeline: &Timeline, seconds: f64) {
        let duration = timeline.total_duration();
        let target = seconds.clamp(0.0, duration);

        if let Some(output) = &self.audio_output {
            output.pause();
        }

        self.master_clock.set(target);

        self.mixer.clear_sources();
        for (_, mut player) in self.players.drain() {
            player.stop();
        }
        self.active_clips.clear();

        // Newly activated players will seek on keyframes and may emit audio
        // from before the target; hold the clock until a frame near the
        // target arrives.
        self.mixer.lock_clock_for_seek(target);

        if self.state != PlaybackState::Stopped {
            self.update(timeline);

            if self.state == PlaybackState::Playing && self.mixer.has_sources() {
                if let Some(output) = &self.audio_output {
                    output.resume();
                    self.audio_started = true;
                }
            }
        }
    }

    /// Per-tick activation window: opens players for clips whose interval
    /// intersects `[now, now + lookahead)` and drops the rest.
    pub fn update(&mut self, timeline: &Timeline) {
        if self.state == PlaybackState::Stopped {
            return;
        }

        // The raw clock, not the latency-corrected view: the corrected clock
        // can sit before a clip boundary just crossed and flip the
        // activation decision back and forth.
        let now = self.master_clock.get();
        let needed = clips_in_window(timeline, now, now + ACTIVATION_LOOKAHEAD);

        let to_remove: Vec<ClipId> = self
            .active_clips
            .iter()
            .copied()
            .filter(|id| !needed.contains(id))
            .collect();

        if !to_remove.is_empty() {
            // clear first: the audio callback must not read queues of
            // players about to be dropped
            self.mixer.clear_sources();
        }
        for clip_id in &to_remove {
            if let Some(mut player) = self.players.remove(clip_id) {
                player.stop();
            }
            self.active_clips.remove(clip_id);
        }

        let mut sources_changed = !to_remove.is_empty();
        for clip_id in needed {
            if !self.active_clips.contains(&clip_id) {
                self.activate_clip(timeline, clip_id, now);
                sources_changed = true;
            }
        }

        if sources_changed {
            self.rebuild_audio_sources(timeline);

            if !self.audio_started
                && self.state == PlaybackState::Playing
                && self.mixer.has_sources()
            {
                if let Some(output) = &self.audio_output {
                    output.resume();
                    self.audio_started = true;
                }
            }
        }
    }

    fn activate_clip(&mut self, timeline: &Timeline, clip_id: ClipId, now: f64) {
        let Some(clip) = timeline.clip(clip_id) else {
            return;
        };
        let Some(track) = timeline.track(clip.track_id) else {
            return;
        };
        let Some(asset) = timeline.asset(clip.asset_id) else {
            return;
        };

        // Decode only what the track consumes: an undrained pipeline would
        // block demux on a full queue and wedge the whole clip.
        let need_video = track.kind == TrackKind::Video && asset.has_video;
        let need_audio = track.kind == TrackKind::Audio && asset.has_audio;
        if !need_video && !need_audio {
            return;
        }

        match ClipPlayer::open(&asset.path, need_video, need_audio, OUTPUT_SAMPLE_RATE) {
            Ok(mut player) => {
                player.play();
                // Unconditional: for a clip activated ahead of the playhead
                // this lands just before source_in (the player clamps at 0),
                // and the mixer's pre-roll discard keeps that early audio
                // from being heard.
                player.seek(clip.to_source_time(now));
                self.players.insert(clip_id, player);
                self.active_clips.insert(clip_id);
            }
            Err(e) => {
                // playback continues around the missing clip
                eprintln!(
                    "[TIMELINE] failed to open clip on {}: {e} ({})",
                    track.name,
                    asset.path.display()
                );
            }
        }
    }

    fn rebuild_audio_sources(&mut self, timeline: &Timeline) {
        let mut sources = Vec::new();

        for (clip_id, player) in &self.players {
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

        self.mixer.set_sources(sources);
    }

    /// Collects the current composite: one layer per visible non-audio
    /// track, bottom-to-top. Image tracks come straight from the asset;
    /// video tracks go through the player's just-in-time frame selection,
    /// falling back to the track's previously staged frame when nothing new
    /// is ready.
    pub fn prepare_frame(&mut self, timeline: &Timeline) -> Vec<Layer> {
        let mut layers = Vec::new();
        let now = self.current_time();

        for &track_id in timeline.track_order() {
            let Some(track) = timeline.track(track_id) else {
                continue;
            };
            if !track.visible || track.kind == TrackKind::Audio {
                continue;
            }
            let Some(clip) = timeline.active_clip_on_track(track_id, now) else {
                continue;
            };
            let Some(asset) = timeline.asset(clip.asset_id) else {
                continue;
            };

            match track.kind {
                TrackKind::Image => {
                    let Some(pixels) = &asset.image_data else {
                        continue;
                    };
                    if asset.width == 0 || asset.height == 0 {
                        continue;
                    }
                    layers.push(Layer {
                        rgba: Arc::clone(pixels),
                        width: asset.width,
                        height: asset.height,
                        track_id,
                    });
                }
                TrackKind::Video => {
                    let source_time = clip.to_source_time(now);
                    let frame = self
                        .players
                        .get_mut(&clip.id)
                        .and_then(|player| {
                            player
                                .video_frame_at(source_time)
                                .map(|(data, w, h, is_new)| (data.to_vec(), w, h, is_new))
                        });

                    match frame {
                        Some((data, width, height, is_new)) => {
                            if is_new {
                                self.stats.new_frames += 1;
                                self.stats.fps_window_frames += 1;
                            } else {
                                self.stats.held_frames += 1;
                            }
                            let stage =
                                self.stages.entry(track_id).or_insert_with(|| TrackStage {
                                    buffer: Arc::new(Vec::new()),
                                    width,
                                    height,
                                });
                            if is_new || stage.buffer.is_empty() {
                                let buffer = Arc::make_mut(&mut stage.buffer);
                                buffer.clear();
                                buffer.extend_from_slice(&data);
                                stage.width = width;
                                stage.height = height;
                            }
                            layers.push(Layer {
                                rgba: Arc::clone(&stage.buffer),
                                width: stage.width,
                                height: stage.height,
                                track_id,
                            });
                        }
                        None => {
                            // nothing decoded yet; keep showing what we had
                            self.stats.held_frames += 1;
                            if let Some(stage) = self.stages.get(&track_id) {
                                if !stage.buffer.is_empty() {
                                    layers.push(Layer {
                                        rgba: Arc::clone(&stage.buffer),
                                        width: stage.width,
                                        height: stage.height,
                                        track_id,
                                    });
                                }
                            }
                        }
                    }
                }
                TrackKind::Audio => {}
            }
        }

        self.tick_stats(timeline, now, layers.len());
        layers
    }

    fn tick_stats(&mut self, timeline: &Timeline, now: f64, layer_count: usize) {
        let wall = self.wall();

        let fps_elapsed = wall - self.stats.fps_window_start;
        if fps_elapsed >= 0.5 {
            self.stats.video_fps = self.stats.fps_window_frames as f64 / fps_elapsed;
            self.stats.fps_window_frames = 0;
            self.stats.fps_window_start = wall;
        }

        if self.state == PlaybackState::Playing && wall - self.stats.last_print >= STATS_INTERVAL {
            eprintln!(
                "[TIMELINE] t={:.2}/{:.2} | clips={} layers={layer_count} | video={:.1}fps new={} held={} | audio={}",
                now,
                timeline.total_duration(),
                self.active_clips.len(),
                self.stats.video_fps,
                self.stats.new_frames,
                self.stats.held_frames,
                if self.audio_started { "on" } else { "off" },
            );
            self.stats.new_frames = 0;
            self.stats.held_frames = 0;
            self.stats.last_print = wall;
        }
    }

    fn wall(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }
}

impl Default for TimelinePlayback {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimelinePlayback {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Every clip whose interval intersects `[now, lookahead)` on a visible
/// video track or any audio track. Image tracks composite straight from the
/// asset and never get a player.
pub fn clips_in_window(timeline: &Timeline, now: f64, lookahead: f64) -> HashSet<ClipId> {
    let mut needed = HashSet::new();

    for track_id in timeline.track_order() {
        let Some(track) = timeline.track(*track_id) else {
            continue;
        };
        if !track.visible && track.kind != TrackKind::Audio {
            continue;
        }
        if track.kind == TrackKind::Image {
            continue;
        }
        for clip in timeline.clips_on_track(*track_id) {
            if clip.timeline_end() > now && clip.timeline_start < lookahead {
                needed.insert(clip.id);
            }
        }
    }

    needed
}

#[cfg(test)]
mod tests {
    use super::*;
    use rushes_state::asset::{MediaAsset, MediaKind};
    use std::path::PathBuf;

    fn video_asset(duration: f64) -> MediaAsset {
        let mut asset = MediaAsset::from_path(PathBuf::from("clip.mp4"), MediaKind::Video);
        asset.duration = duration;
        asset.has_video = true;
        asset
    }

    fn image_asset(width: u32, height: u32, fill: u8) -> MediaAsset {
        let mut asset = MediaAsset::from_path(PathBuf::from("still.png"), MediaKind::Image);
        asset.duration = 5.0;
        asset.width = width;
        asset.height = height;
        asset.image_data = Some(Arc::new(vec![
            fill;
            width as usize * height as usize * 4
        ]));
        asset
    }

    #[test]
    fn activation_window_follows_the_playhead() {
        let mut timeline = Timeline::new();
        let track = timeline.add_track("V1", TrackKind::Video);
        let asset = timeline.add_asset(video_asset(10.0));
        let clip1 = timeline.add_clip(track, asset, 0.0, 0.0, 2.0).unwrap();
        let clip2 = timeline.add_clip(track, asset, 5.0, 0.0, 2.0).unwrap();

        let at = |now: f64| clips_in_window(&timeline, now, now + ACTIVATION_LOOKAHEAD);

        assert_eq!(at(1.0), HashSet::from([clip1]));
        // clip1 past its end, clip2 within the 1s lookahead of start=5
        assert_eq!(at(4.1), HashSet::from([clip2]));
        assert_eq!(at(6.0), HashSet::from([clip2]));
        assert!(at(8.0).is_empty());
    }

    #[test]
    fn hidden_video_tracks_are_not_activated_but_audio_is() {
        let mut timeline = Timeline::new();
        let video = timeline.add_track("V1", TrackKind::Video);
        let audio = timeline.add_track("A1", TrackKind::Audio);
        let asset = timeline.add_asset(video_asset(10.0));
        let vclip = timeline.add_clip(video, asset, 0.0, 0.0, 5.0).unwrap();
        let aclip = timeline.add_clip(audio, asset, 0.0, 0.0, 5.0).unwrap();

        timeline.track_mut(video).unwrap().visible = false;
        let needed = clips_in_window(&timeline, 1.0, 2.0);
        assert!(!needed.contains(&vclip));
        assert!(needed.contains(&aclip));
    }

    #[test]
    fn image_clips_never_need_a_player() {
        let mut timeline = Timeline::new();
        let track = timeline.add_track("Image 1", TrackKind::Image);
        let asset = timeline.add_asset(image_asset(2, 2, 0xFF));
        timeline.add_clip(track, asset, 0.0, 0.0, 5.0).unwrap();

        assert!(clips_in_window(&timeline, 1.0, 2.0).is_empty());
    }

    #[test]
    fn empty_timeline_prepares_no_layers() {
        let timeline = Timeline::new();
        let mut playback = TimelinePlayback::new();
        assert!(playback.prepare_frame(&timeline).is_empty());
    }

    #[test]
    fn image_layers_come_from_the_asset() {
        let mut timeline = Timeline::new();
        let track = timeline.add_track("Image 1", TrackKind::Image);
        let asset = timeline.add_asset(image_asset(4, 2, 0x7F));
        timeline.add_clip(track, asset, 0.0, 0.0, 5.0).unwrap();

        let mut playback = TimelinePlayback::new();
        let layers = playback.prepare_frame(&timeline);
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].width, 4);
        assert_eq!(layers[0].height, 2);
        assert_eq!(layers[0].track_id, track);
        assert!(layers[0].rgba.iter().all(|b| *b == 0x7F));
    }

    #[test]
    fn layers_follow_track_display_order() {
        let mut timeline = Timeline::new();
        let bottom = timeline.add_track("Image 1", TrackKind::Image);
        let top = timeline.add_track("Image 2", TrackKind::Image);
        let a = timeline.add_asset(image_asset(2, 2, 1));
        let b = timeline.add_asset(image_asset(2, 2, 2));
        timeline.add_clip(bottom, a, 0.0, 0.0, 5.0).unwrap();
        timeline.add_clip(top, b, 0.0, 0.0, 5.0).unwrap();

        let mut playback = TimelinePlayback::new();
        let layers = playback.prepare_frame(&timeline);
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[0].track_id, bottom);
        assert_eq!(layers[1].track_id, top);

        timeline.swap_tracks(0, 1);
        let layers = playback.prepare_frame(&timeline);
        assert_eq!(layers[0].track_id, top);
        assert_eq!(layers[1].track_id, bottom);
    }

    #[test]
    fn invisible_tracks_produce_no_layers() {
        let mut timeline = Timeline::new();
        let track = timeline.add_track("Image 1", TrackKind::Image);
        let asset = timeline.add_asset(image_asset(2, 2, 9));
        timeline.add_clip(track, asset, 0.0, 0.0, 5.0).unwrap();
        timeline.track_mut(track).unwrap().visible = false;

        let mut playback = TimelinePlayback::new();
        assert!(playback.prepare_frame(&timeline).is_empty());
    }

    #[test]
    fn transport_state_transitions() {
        let timeline = Timeline::new();
        let mut playback = TimelinePlayback::new();
        assert_eq!(playback.state(), PlaybackState::Stopped);

        // empty timeline: play is a state change, nothing activates
        playback.play(&timeline);
        assert_eq!(playback.state(), PlaybackState::Playing);

        playback.pause();
        assert_eq!(playback.state(), PlaybackState::Paused);

        playback.toggle_play_pause(&timeline);
        assert_eq!(playback.state(), PlaybackState::Playing);

        playback.stop();
        assert_eq!(playback.state(), PlaybackState::Stopped);
        assert_eq!(playback.current_time(), 0.0);
    }

    #[test]
    fn stop_then_play_restarts_from_zero() {
        let timeline = Timeline::new();
        let mut playback = TimelinePlayback::new();
        playback.play(&timeline);
        std::thread::sleep(std::time::Duration::from_millis(30));
        playback.stop();
        playback.play(&timeline);
        let t = playback.current_time();
        assert!((0.0..0.5).contains(&t), "expected restart near 0, got {t}");
    }

    #[test]
    fn seek_clamps_into_timeline_range() {
        let mut timeline = Timeline::new();
        let track = timeline.add_track("Image 1", TrackKind::Image);
        let asset = timeline.add_asset(image_asset(2, 2, 0));
        timeline.add_clip(track, asset, 0.0, 0.0, 5.0).unwrap();

        let mut playback = TimelinePlayback::new();
        playback.seek(&timeline, -3.0);
        assert_eq!(playback.current_time(), 0.0);
        playback.seek(&timeline, 99.0);
        assert_eq!(playback.current_time(), 5.0);
        playback.seek(&timeline, 2.5);
        assert_eq!(playback.current_time(), 2.5);
    }
}
