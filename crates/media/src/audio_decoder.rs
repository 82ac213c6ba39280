use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ffmpeg::format::sample::Type as SampleType;
use ffmpeg::format::Sample;
use ffmpeg::software::resampling;
use ffmpeg::util::channel_layout::ChannelLayout;
use ffmpeg::util::frame::audio::Audio as AudioFfFrame;
use ffmpeg_the_third as ffmpeg;

use crate::audio_frame_queue::{AudioFrame, AudioFrameQueue};
use crate::packet_queue::PacketQueue;

const POP_TIMEOUT: Duration = Duration::from_millis(50);

/// Decodes one audio stream on its own thread, resampling every frame to
/// interleaved stereo f32 at the mixer's output rate. The output frame keeps
/// the input frame's pts, still in the source time base; the mixer converts
/// with the stream's time base).
pub struct AudioDecoder {
    decoder: Option<ffmpeg::decoder::Audio>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    time_base: f64,
    output_rate: u32,
}

impl AudioDecoder {
    pub fn new<P: ffmpeg::AsPtr<ffmpeg::ffi::AVCodecParameters>>(
        parameters: P,
        time_base: f64,
        output_rate: u32,
    ) -> Result<Self, ffmpeg::Error> {
        let ctx = ffmpeg::codec::context::Context::from_parameters(parameters)?;
        let decoder = ctx.decoder().audio()?;
        let output_rate = if output_rate > 0 {
            output_rate
        } else {
            decoder.rate()
        };
        Ok(Self {
            decoder: Some(decoder),
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
            time_base,
            output_rate,
        })
    }

    pub fn time_base(&self) -> f64 {
        self.time_base
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    pub fn start(&mut self, packets: Arc<PacketQueue>, frames: Arc<AudioFrameQueue>) {
        let Some(decoder) = self.decoder.take() else {
            return;
        };
        self.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        let output_rate = self.output_rate;
        self.handle = Some(thread::spawn(move || {
            decode_loop(decoder, packets, frames, running, output_rate);
        }));
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for AudioDecoder {
    fn drop(&mut self) {
        self.stop();
    }
}

fn decode_loop(
    mut decoder: ffmpeg::decoder::Audio,
    packets: Arc<PacketQueue>,
    frames: Arc<AudioFrameQueue>,
    running: Arc<AtomicBool>,
    output_rate: u32,
) {
    let target_format = Sample::F32(SampleType::Packed);
    let mut resampler: Option<resampling::Context> = None;
    let mut decoded = AudioFfFrame::empty();
    let mut serial = packets.serial();

    while running.load(Ordering::SeqCst) {
        let Some(packet) = packets.pop(POP_TIMEOUT) else {
            continue;
        };

        let current = packets.serial();
        if current != serial {
            decoder.flush();
            serial = current;
        }

        if decoder.send_packet(&packet).is_err() {
            continue;
        }

        while decoder.receive_frame(&mut decoded).is_ok() {
            if !running.load(Ordering::SeqCst) {
                return;
            }

            if resampler.is_none() {
                // Built from the first real frame so the source format is
                // known. Mono sources must be declared as MONO or swr
                // misreads the layout.
                let src_layout = if decoded.ch_layout().channels() >= 2 {
                    decoded.ch_layout()
                } else {
                    ChannelLayout::MONO
                };
                resampler = resampling::Context::get2(
                    decoded.format(),
                    src_layout,
                    decoded.rate(),
                    target_format,
                    ChannelLayout::STEREO,
                    output_rate,
                )
                .ok();
            }
            let Some(rs) = resampler.as_mut() else {
                continue;
            };

            let mut resampled = AudioFfFrame::empty();
            if rs.run(&decoded, &mut resampled).is_err() || resampled.samples() == 0 {
                continue;
            }

            let sample_count = resampled.samples() * 2;
            let samples = unsafe {
                let bytes = resampled.data(0);
                std::slice::from_raw_parts(bytes.as_ptr() as *const f32, sample_count)
            }
            .to_vec();

            let pts = decoded
                .pts()
                .or_else(|| decoded.timestamp())
                .unwrap_or(0);

            if !frames.push(AudioFrame {
                samples,
                pts,
                serial,
            }) {
                break; // aborted
            }
        }
    }
}
