use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ffmpeg::format::Pixel;
use ffmpeg::software::scaling;
use ffmpeg::util::frame::video::Video as VideoFrame;
use ffmpeg_the_third as ffmpeg;

use crate::packet_queue::PacketQueue;
use crate::video_frame_queue::VideoFrameQueue;

const POP_TIMEOUT: Duration = Duration::from_millis(50);

/// Decodes one video stream on its own thread: pops packets, converts each
/// frame to packed RGBA, and commits it into the frame queue with its pts.
///
/// The codec context lives entirely on the decode thread. A serial change on
/// the packet queue is the seek signal: the thread flushes the codec's
/// internal buffers itself before decoding the new generation.
pub struct VideoDecoder {
    decoder: Option<ffmpeg::decoder::Video>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    width: u32,
    height: u32,
    time_base: f64,
    frame_rate: f64,
}

impl VideoDecoder {
    pub fn new<P: ffmpeg::AsPtr<ffmpeg::ffi::AVCodecParameters>>(
        parameters: P,
        time_base: f64,
        frame_rate: f64,
    ) -> Result<Self, ffmpeg::Error> {
        let ctx = ffmpeg::codec::context::Context::from_parameters(parameters)?;
        let decoder = ctx.decoder().video()?;
        let width = decoder.width();
        let height = decoder.height();
        Ok(Self {
            decoder: Some(decoder),
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
            width,
            height,
            time_base,
            frame_rate: if frame_rate > 0.0 { frame_rate } else { 30.0 },
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn time_base(&self) -> f64 {
        self.time_base
    }

    pub fn frame_rate(&self) -> f64 {
        self.frame_rate
    }

    pub fn start(&mut self, packets: Arc<PacketQueue>, frames: Arc<VideoFrameQueue>) {
        let Some(decoder) = self.decoder.take() else {
            return;
        };
        self.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        self.handle = Some(thread::spawn(move || {
            decode_loop(decoder, packets, frames, running);
        }));
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for VideoDecoder {
    fn drop(&mut self) {
        self.stop();
    }
}

fn decode_loop(
    mut decoder: ffmpeg::decoder::Video,
    packets: Arc<PacketQueue>,
    frames: Arc<VideoFrameQueue>,
    running: Arc<AtomicBool>,
) {
    let mut scaler: Option<scaling::Context> = None;
    let mut decoded = VideoFrame::empty();
    let mut rgba = VideoFrame::empty();
    let mut serial = packets.serial();

    while running.load(Ordering::SeqCst) {
        let Some(packet) = packets.pop(POP_TIMEOUT) else {
            continue;
        };

        let current = packets.serial();
        if current != serial {
            // A flush happened upstream; this thread owns the codec, so this
            // is the only safe place to drop its buffered state.
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

            let dst_w = frames.width();
            let dst_h = frames.height();
            if scaler.is_none() {
                scaler = scaling::Context::get(
                    decoded.format(),
                    decoded.width(),
                    decoded.height(),
                    Pixel::RGBA,
                    dst_w,
                    dst_h,
                    scaling::Flags::BILINEAR,
                )
                .ok();
            }
            let Some(sc) = scaler.as_mut() else {
                continue;
            };
            if sc.run(&decoded, &mut rgba).is_err() {
                continue;
            }

            let Some(mut buf) = frames.acquire_write_slot() else {
                // queue aborted; the next pop observes it too
                break;
            };

            let stride = rgba.stride(0);
            let row_bytes = dst_w as usize * 4;
            let src = rgba.data(0);
            for y in 0..dst_h as usize {
                let src_start = y * stride;
                let dst_start = y * row_bytes;
                if src_start + row_bytes <= src.len() && dst_start + row_bytes <= buf.len() {
                    buf[dst_start..dst_start + row_bytes]
                        .copy_from_slice(&src[src_start..src_start + row_bytes]);
                }
            }

            let pts = decoded
                .pts()
                .or_else(|| decoded.timestamp())
                .unwrap_or(0);
            frames.commit(buf, pts, serial);
        }
    }
}
