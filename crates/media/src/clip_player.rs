use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ffmpeg::media::Type;
use ffmpeg_the_third as ffmpeg;

use crate::audio_decoder::AudioDecoder;
use crate::audio_frame_queue::AudioFrameQueue;
use crate::init_once;
use crate::packet_queue::PacketQueue;
use crate::video_decoder::VideoDecoder;
use crate::video_frame_queue::VideoFrameQueue;

/// Tolerances for just-in-time frame selection, in frame durations.
/// Lateness of up to two frames is caught up by skipping; a frame whose
/// ideal presentation time is within half a frame ahead counts as "now".
const SKIP_BEHIND_FRAMES: f64 = 2.0;
const HOLD_AHEAD_FRAMES: f64 = 0.5;

const EOF_IDLE: Duration = Duration::from_millis(10);

struct SeekState {
    requested: AtomicBool,
    target: AtomicU64,
}

impl SeekState {
    fn new() -> Self {
        Self {
            requested: AtomicBool::new(false),
            target: AtomicU64::new(0f64.to_bits()),
        }
    }

    fn request(&self, seconds: f64) {
        self.target.store(seconds.to_bits(), Ordering::SeqCst);
        self.requested.store(true, Ordering::SeqCst);
    }

    fn take(&self) -> Option<f64> {
        if self.requested.swap(false, Ordering::SeqCst) {
            Some(f64::from_bits(self.target.load(Ordering::SeqCst)))
        } else {
            None
        }
    }
}

struct VideoPipeline {
    stream_index: usize,
    packets: Arc<PacketQueue>,
    frames: Arc<VideoFrameQueue>,
    decoder: VideoDecoder,
}

struct AudioPipeline {
    stream_index: usize,
    packets: Arc<PacketQueue>,
    frames: Arc<AudioFrameQueue>,
    decoder: AudioDecoder,
}

/// One decoder stack per active clip: a demux thread feeding per-stream
/// packet queues, plus a decoder thread per selected stream.
///
/// Stream selection at open is mandatory: a pipeline nobody drains would
/// stall the demux thread on a full queue and deadlock the clip. Packets for
/// unselected streams are dropped at demux.
///
/// The player has no clock of its own; callers ask for the frame matching a
/// source time and decide themselves when the clip is over (demux idles at
/// EOF instead of terminating).
pub struct ClipPlayer {
    input: Option<ffmpeg::format::context::Input>,
    duration: f64,
    video: Option<VideoPipeline>,
    audio: Option<AudioPipeline>,
    demux: Option<JoinHandle<()>>,
    demux_running: Arc<AtomicBool>,
    seek: Arc<SeekState>,
    held: Vec<u8>,
    held_valid: bool,
}

impl ClipPlayer {
    pub fn open(
        path: &Path,
        need_video: bool,
        need_audio: bool,
        output_sample_rate: u32,
    ) -> Result<Self, ffmpeg::Error> {
        init_once();

        let input = ffmpeg::format::input(path)?;

        let duration = {
            let d = input.duration();
            if d > 0 {
                d as f64 / f64::from(ffmpeg::ffi::AV_TIME_BASE)
            } else {
                0.0
            }
        };

        let mut video = None;
        if need_video {
            if let Some(stream) = input.streams().best(Type::Video) {
                let fr = stream.avg_frame_rate();
                let fps = if fr.numerator() > 0 && fr.denominator() > 0 {
                    f64::from(fr)
                } else {
                    0.0
                };
                let decoder =
                    VideoDecoder::new(stream.parameters(), f64::from(stream.time_base()), fps)?;
                let frames = Arc::new(VideoFrameQueue::new(decoder.width(), decoder.height()));
                video = Some(VideoPipeline {
                    stream_index: stream.index(),
                    packets: Arc::new(PacketQueue::new()),
                    frames,
                    decoder,
                });
            }
        }

        let mut audio = None;
        if need_audio {
            if let Some(stream) = input.streams().best(Type::Audio) {
                match AudioDecoder::new(
                    stream.parameters(),
                    f64::from(stream.time_base()),
                    output_sample_rate,
                ) {
                    Ok(decoder) => {
                        audio = Some(AudioPipeline {
                            stream_index: stream.index(),
                            packets: Arc::new(PacketQueue::new()),
                            frames: Arc::new(AudioFrameQueue::new()),
                            decoder,
                        });
                    }
                    Err(e) => {
                        eprintln!("[CLIP] audio decoder unavailable for {path:?}: {e}");
                    }
                }
            }
        }

        if video.is_none() && audio.is_none() {
            return Err(ffmpeg::Error::StreamNotFound);
        }

        let held = video
            .as_ref()
            .map(|v| vec![0u8; v.frames.frame_bytes()])
            .unwrap_or_default();

        Ok(Self {
            input: Some(input),
            duration,
            video,
            audio,
            demux: None,
            demux_running: Arc::new(AtomicBool::new(false)),
            seek: Arc::new(SeekState::new()),
            held,
            held_valid: false,
        })
    }

    /// Spawns the demux and decoder threads. Idempotent once running.
    pub fn play(&mut self) {
        let Some(input) = self.input.take() else {
            return;
        };

        let mut video_route = None;
        if let Some(v) = self.video.as_mut() {
            v.packets.start();
            v.frames.start();
            v.decoder
                .start(Arc::clone(&v.packets), Arc::clone(&v.frames));
            video_route = Some((v.stream_index, Arc::clone(&v.packets), Arc::clone(&v.frames)));
        }

        let mut audio_route = None;
        if let Some(a) = self.audio.as_mut() {
            a.packets.start();
            a.frames.start();
            a.decoder
                .start(Arc::clone(&a.packets), Arc::clone(&a.frames));
            audio_route = Some((a.stream_index, Arc::clone(&a.packets), Arc::clone(&a.frames)));
        }

        self.demux_running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.demux_running);
        let seek = Arc::clone(&self.seek);
        self.demux = Some(thread::spawn(move || {
            demux_loop(input, running, seek, video_route, audio_route);
        }));
    }

    /// Unwinds all threads: abort queues to unblock them, join, then flush
    /// so a later restart begins clean.
    pub fn stop(&mut self) {
        self.demux_running.store(false, Ordering::SeqCst);

        if let Some(v) = self.video.as_mut() {
            v.packets.abort();
            v.frames.abort();
            v.decoder.stop();
        }
        if let Some(a) = self.audio.as_mut() {
            a.packets.abort();
            a.frames.abort();
            a.decoder.stop();
        }
        if let Some(handle) = self.demux.take() {
            let _ = handle.join();
        }

        if let Some(v) = self.video.as_ref() {
            v.packets.flush();
            v.frames.flush();
        }
        if let Some(a) = self.audio.as_ref() {
            a.packets.flush();
            a.frames.flush();
        }
    }

    /// Requests an asynchronous seek; the demux thread performs it at the
    /// top of its next iteration and flushes both queue stages.
    pub fn seek(&self, source_seconds: f64) {
        let target = if self.duration > 0.0 {
            source_seconds.clamp(0.0, self.duration)
        } else {
            source_seconds.max(0.0)
        };
        self.seek.request(target);
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn has_video(&self) -> bool {
        self.video.is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    pub fn video_size(&self) -> (u32, u32) {
        self.video
            .as_ref()
            .map(|v| (v.frames.width(), v.frames.height()))
            .unwrap_or((0, 0))
    }

    pub fn audio_frame_queue(&self) -> Option<Arc<AudioFrameQueue>> {
        self.audio.as_ref().map(|a| Arc::clone(&a.frames))
    }

    /// Seconds per pts unit of the audio stream.
    pub fn audio_time_base(&self) -> f64 {
        self.audio
            .as_ref()
            .map(|a| a.decoder.time_base())
            .unwrap_or(1.0 / 48_000.0)
    }

    pub fn video_packet_queue_len(&self) -> usize {
        self.video.as_ref().map(|v| v.packets.len()).unwrap_or(0)
    }

    pub fn video_frame_queue_len(&self) -> usize {
        self.video.as_ref().map(|v| v.frames.len()).unwrap_or(0)
    }

    pub fn audio_packet_queue_len(&self) -> usize {
        self.audio.as_ref().map(|a| a.packets.len()).unwrap_or(0)
    }

    pub fn audio_frame_queue_len(&self) -> usize {
        self.audio.as_ref().map(|a| a.frames.len()).unwrap_or(0)
    }

    /// Just-in-time frame selection for a target source time. Never blocks:
    /// skips frames that fell more than two frame durations behind, holds
    /// the previous frame while the next one is still in the future, and
    /// returns `(rgba, width, height, is_new)`. None until the first frame
    /// of the current generation has been decoded.
    pub fn video_frame_at(&mut self, target_pts: f64) -> Option<(&[u8], u32, u32, bool)> {
        let v = self.video.as_ref()?;
        let time_base = v.decoder.time_base();
        let frame_duration = 1.0 / v.decoder.frame_rate().max(1.0);
        let serial = v.packets.serial();
        let (width, height) = (v.frames.width(), v.frames.height());

        let mut is_new = false;
        loop {
            let Some((pts, frame_serial)) = v.frames.peek_pts() else {
                break;
            };
            if frame_serial != serial {
                // decoded before the last flush; never present it
                v.frames.pop();
                continue;
            }
            let pts_sec = pts as f64 * time_base;
            if pts_sec < target_pts - frame_duration * SKIP_BEHIND_FRAMES {
                v.frames.pop();
                continue;
            }
            if pts_sec > target_pts + frame_duration * HOLD_AHEAD_FRAMES {
                break;
            }
            if v.frames.copy_front_into(&mut self.held) {
                v.frames.pop();
                self.held_valid = true;
                is_new = true;
            }
            break;
        }

        if !self.held_valid {
            return None;
        }
        Some((&self.held, width, height, is_new))
    }
}

impl Drop for ClipPlayer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn demux_loop(
    mut input: ffmpeg::format::context::Input,
    running: Arc<AtomicBool>,
    seek: Arc<SeekState>,
    video: Option<(usize, Arc<PacketQueue>, Arc<VideoFrameQueue>)>,
    audio: Option<(usize, Arc<PacketQueue>, Arc<AudioFrameQueue>)>,
) {
    let mut packet = ffmpeg::Packet::empty();

    while running.load(Ordering::SeqCst) {
        if let Some(target) = seek.take() {
            let ts = (target * f64::from(ffmpeg::ffi::AV_TIME_BASE)) as i64;
            let _ = input.seek(ts, ..);

            // New generation: stale packets and frames must never surface.
            if let Some((_, packets, frames)) = &video {
                packets.flush();
                frames.flush();
            }
            if let Some((_, packets, frames)) = &audio {
                packets.flush();
                frames.flush();
            }
        }

        match packet.read(&mut input) {
            Ok(()) => {}
            Err(ffmpeg::Error::Eof) => {
                // A clip does not end; the orchestrator decides when to drop it.
                thread::sleep(EOF_IDLE);
                continue;
            }
            Err(_) => break,
        }

        let stream_index = packet.stream();
        if let Some((index, packets, _)) = &video {
            if stream_index == *index {
                packets.push(packet.clone());
                continue;
            }
        }
        if let Some((index, packets, _)) = &audio {
            if stream_index == *index {
                packets.push(packet.clone());
            }
        }
        // packets for unselected streams are dropped here
    }
}
