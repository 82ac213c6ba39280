use std::path::Path;

use ffmpeg::media::Type;
use ffmpeg_the_third as ffmpeg;

use crate::init_once;

#[derive(Debug, Clone, Copy)]
pub struct VideoStreamInfo {
    pub index: usize,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// Seconds per pts unit of the stream.
    pub time_base: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct AudioStreamInfo {
    pub index: usize,
    pub sample_rate: u32,
    pub channels: u32,
    pub time_base: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MediaInfo {
    pub duration: f64,
    pub video: Option<VideoStreamInfo>,
    pub audio: Option<AudioStreamInfo>,
}

/// Probe a container for its duration and first video/audio stream
/// parameters. Opens and closes its own demux context; the clip player
/// opens a fresh one for actual playback.
pub fn probe(path: &Path) -> Result<MediaInfo, ffmpeg::Error> {
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

    let video = input.streams().best(Type::Video).and_then(|stream| {
        let ctx = ffmpeg::codec::context::Context::from_parameters(stream.parameters()).ok()?;
        let decoder = ctx.decoder().video().ok()?;
        let fr = stream.avg_frame_rate();
        let fps = if fr.numerator() > 0 && fr.denominator() > 0 {
            f64::from(fr)
        } else {
            30.0
        };
        Some(VideoStreamInfo {
            index: stream.index(),
            width: decoder.width(),
            height: decoder.height(),
            fps,
            time_base: f64::from(stream.time_base()),
        })
    });

    let audio = input.streams().best(Type::Audio).and_then(|stream| {
        let ctx = ffmpeg::codec::context::Context::from_parameters(stream.parameters()).ok()?;
        let decoder = ctx.decoder().audio().ok()?;
        Some(AudioStreamInfo {
            index: stream.index(),
            sample_rate: decoder.rate(),
            channels: decoder.ch_layout().channels() as u32,
            time_base: f64::from(stream.time_base()),
        })
    });

    Ok(MediaInfo {
        duration,
        video,
        audio,
    })
}
