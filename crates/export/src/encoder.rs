use ffmpeg::codec::{self, Id as CodecId};
use ffmpeg::encoder;
use ffmpeg::format::context::Output;
use ffmpeg::format::sample::Type as SampleType;
use ffmpeg::format::{Pixel, Sample};
use ffmpeg::software::scaling;
use ffmpeg::util::channel_layout::{ChannelLayout, ChannelLayoutMask};
use ffmpeg::util::frame::audio::Audio as AudioFrame;
use ffmpeg::util::frame::video::Video as VideoFrame;
use ffmpeg::util::rational::Rational;
use ffmpeg::Packet;
use ffmpeg_the_third as ffmpeg;

use crate::settings::ExportSettings;

/// Copy the opened encoder's parameters into the output stream's codecpar.
/// `Stream::set_parameters` cannot take an encoder context in this version
/// of ffmpeg-the-third, so this goes through the FFI call directly.
unsafe fn parameters_from_encoder(
    octx: &mut Output,
    stream_index: usize,
    enc_ptr: *mut ffmpeg::ffi::AVCodecContext,
) -> Result<(), String> {
    let ret = ffmpeg::ffi::avcodec_parameters_from_context(
        (**(*octx.as_mut_ptr()).streams.add(stream_index)).codecpar,
        enc_ptr,
    );
    if ret < 0 {
        return Err(format!("avcodec_parameters_from_context failed: {ret}"));
    }
    Ok(())
}

/// H.264 encoder for composited RGBA frames. PTS is the output frame index
/// in a 1/fps time base, so trims and clip joins never introduce
/// discontinuities.
pub struct VideoEncoder {
    encoder: encoder::Video,
    scaler: Option<scaling::Context>,
    stream_index: usize,
    time_base: Rational,
    width: u32,
    height: u32,
}

impl VideoEncoder {
    pub fn add_to(octx: &mut Output, settings: &ExportSettings) -> Result<Self, String> {
        let codec = encoder::find(CodecId::H264)
            .ok_or_else(|| "H.264 encoder not found".to_string())?;
        let time_base = Rational::new(1, settings.fps as i32);

        let mut ost = octx
            .add_stream(codec)
            .map_err(|e| format!("add video stream: {e}"))?;
        let stream_index = ost.index();
        ost.set_time_base(time_base);

        let ctx = codec::context::Context::new_with_codec(codec);
        let mut enc = ctx
            .encoder()
            .video()
            .map_err(|e| format!("create video encoder context: {e}"))?;
        enc.set_width(settings.width);
        enc.set_height(settings.height);
        enc.set_format(Pixel::YUV420P);
        enc.set_time_base(time_base);
        enc.set_frame_rate(Some(Rational::new(settings.fps as i32, 1)));
        enc.set_bit_rate(0); // CRF drives quality

        let mut opts = ffmpeg::Dictionary::new();
        opts.set("crf", "18");
        opts.set("preset", "fast");

        let encoder = enc
            .open_as_with(codec, opts)
            .map_err(|e| format!("open H.264 encoder: {e}"))?;

        unsafe {
            parameters_from_encoder(
                octx,
                stream_index,
                encoder.as_ptr() as *mut ffmpeg::ffi::AVCodecContext,
            )?;
        }

        Ok(Self {
            encoder,
            scaler: None,
            stream_index,
            time_base,
            width: settings.width,
            height: settings.height,
        })
    }

    /// Encodes one packed RGBA frame (already at output resolution).
    pub fn encode_rgba(
        &mut self,
        octx: &mut Output,
        rgba: &[u8],
        frame_index: i64,
    ) -> Result<(), String> {
        let mut src = VideoFrame::new(Pixel::RGBA, self.width, self.height);
        let stride = src.stride(0);
        let row_bytes = self.width as usize * 4;
        {
            let data = src.data_mut(0);
            for y in 0..self.height as usize {
                let dst_start = y * stride;
                let src_start = y * row_bytes;
                if src_start + row_bytes <= rgba.len() && dst_start + row_bytes <= data.len() {
                    data[dst_start..dst_start + row_bytes]
                        .copy_from_slice(&rgba[src_start..src_start + row_bytes]);
                }
            }
        }

        if self.scaler.is_none() {
            self.scaler = Some(
                scaling::Context::get(
                    Pixel::RGBA,
                    self.width,
                    self.height,
                    Pixel::YUV420P,
                    self.width,
                    self.height,
                    scaling::Flags::BILINEAR,
                )
                .map_err(|e| format!("create RGBA->YUV scaler: {e}"))?,
            );
        }
        let mut yuv = VideoFrame::empty();
        self.scaler
            .as_mut()
            .expect("created above")
            .run(&src, &mut yuv)
            .map_err(|e| format!("convert frame to YUV420P: {e}"))?;
        yuv.set_pts(Some(frame_index));

        self.encoder
            .send_frame(&yuv)
            .map_err(|e| format!("send video frame: {e}"))?;
        self.drain_packets(octx)
    }

    pub fn flush(&mut self, octx: &mut Output) -> Result<(), String> {
        self.encoder
            .send_eof()
            .map_err(|e| format!("send EOF to video encoder: {e}"))?;
        self.drain_packets(octx)
    }

    fn drain_packets(&mut self, octx: &mut Output) -> Result<(), String> {
        let stream_tb = octx
            .stream(self.stream_index)
            .map(|s| s.time_base())
            .unwrap_or(self.time_base);
        let mut pkt = Packet::empty();
        while self.encoder.receive_packet(&mut pkt).is_ok() {
            pkt.set_stream(self.stream_index);
            pkt.rescale_ts(self.time_base, stream_tb);
            pkt.write_interleaved(octx)
                .map_err(|e| format!("write video packet: {e}"))?;
        }
        Ok(())
    }
}

/// Stereo sample FIFO feeding fixed-size encoder frames. AAC wants exactly
/// `frame_size` samples per input frame while the mixer hands out arbitrary
/// chunk sizes; the remainder carries over to the next pull and the tail is
/// zero-padded only on the final flush.
#[derive(Default)]
pub struct StereoFifo {
    left: Vec<f32>,
    right: Vec<f32>,
}

impl StereoFifo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffered samples per channel.
    pub fn len(&self) -> usize {
        self.left.len()
    }

    pub fn is_empty(&self) -> bool {
        self.left.is_empty()
    }

    pub fn push_interleaved(&mut self, samples: &[f32]) {
        for pair in samples.chunks_exact(2) {
            self.left.push(pair[0]);
            self.right.push(pair[1]);
        }
    }

    /// Pops up to `n` samples per channel into the front of `left`/`right`,
    /// zero-padding the tail. Returns how many real samples were popped.
    pub fn pop_planes(&mut self, n: usize, left: &mut [f32], right: &mut [f32]) -> usize {
        let available = self.left.len().min(n);
        left[..available].copy_from_slice(&self.left[..available]);
        right[..available].copy_from_slice(&self.right[..available]);
        left[available..n].fill(0.0);
        right[available..n].fill(0.0);
        self.left.drain(..available);
        self.right.drain(..available);
        available
    }
}

/// AAC encoder fed from the mixer's interleaved stereo output. PTS is a
/// running sample counter in a 1/rate time base.
pub struct AudioEncoder {
    encoder: encoder::Audio,
    fifo: StereoFifo,
    frame_size: usize,
    next_pts: i64,
    stream_index: usize,
    time_base: Rational,
    rate: u32,
}

impl AudioEncoder {
    pub fn add_to(octx: &mut Output, sample_rate: u32) -> Result<Self, String> {
        let codec =
            encoder::find(CodecId::AAC).ok_or_else(|| "AAC encoder not found".to_string())?;
        let time_base = Rational::new(1, sample_rate as i32);

        let mut ost = octx
            .add_stream(codec)
            .map_err(|e| format!("add audio stream: {e}"))?;
        let stream_index = ost.index();
        ost.set_time_base(time_base);

        let ctx = codec::context::Context::new_with_codec(codec);
        let mut enc = ctx
            .encoder()
            .audio()
            .map_err(|e| format!("create audio encoder context: {e}"))?;
        enc.set_rate(sample_rate as i32);
        enc.set_ch_layout(ChannelLayout::STEREO);
        enc.set_format(Sample::F32(SampleType::Planar));
        enc.set_time_base(time_base);
        enc.set_bit_rate(128_000);

        let encoder = enc
            .open_as_with(codec, ffmpeg::Dictionary::new())
            .map_err(|e| format!("open AAC encoder: {e}"))?;
        let frame_size = (encoder.frame_size() as usize).max(1024);

        unsafe {
            parameters_from_encoder(
                octx,
                stream_index,
                encoder.as_ptr() as *mut ffmpeg::ffi::AVCodecContext,
            )?;
        }

        Ok(Self {
            encoder,
            fifo: StereoFifo::new(),
            frame_size,
            next_pts: 0,
            stream_index,
            time_base,
            rate: sample_rate,
        })
    }

    /// Buffers mixed samples and encodes every full frame that is ready.
    pub fn push_interleaved(&mut self, octx: &mut Output, samples: &[f32]) -> Result<(), String> {
        self.fifo.push_interleaved(samples);
        self.drain_fifo(octx, false)
    }

    /// Encodes the zero-padded tail and flushes the codec.
    pub fn flush(&mut self, octx: &mut Output) -> Result<(), String> {
        self.drain_fifo(octx, true)?;
        self.encoder
            .send_eof()
            .map_err(|e| format!("send EOF to audio encoder: {e}"))?;
        self.drain_packets(octx)
    }

    fn drain_fifo(&mut self, octx: &mut Output, flush: bool) -> Result<(), String> {
        while self.fifo.len() >= self.frame_size || (flush && !self.fifo.is_empty()) {
            let n = self.frame_size;
            let mut frame =
                AudioFrame::new(Sample::F32(SampleType::Planar), n, ChannelLayoutMask::STEREO);
            frame.set_rate(self.rate);
            frame.set_pts(Some(self.next_pts));
            self.next_pts += n as i64;

            unsafe {
                let left = frame.data_mut(0);
                let left = std::slice::from_raw_parts_mut(left.as_mut_ptr() as *mut f32, n);
                let right = frame.data_mut(1);
                let right = std::slice::from_raw_parts_mut(right.as_mut_ptr() as *mut f32, n);
                self.fifo.pop_planes(n, left, right);
            }

            self.encoder
                .send_frame(&frame)
                .map_err(|e| format!("send audio frame: {e}"))?;
            self.drain_packets(octx)?;
        }
        Ok(())
    }

    fn drain_packets(&mut self, octx: &mut Output) -> Result<(), String> {
        let stream_tb = octx
            .stream(self.stream_index)
            .map(|s| s.time_base())
            .unwrap_or(self.time_base);
        let mut pkt = Packet::empty();
        while self.encoder.receive_packet(&mut pkt).is_ok() {
            pkt.set_stream(self.stream_index);
            pkt.rescale_ts(self.time_base, stream_tb);
            pkt.write_interleaved(octx)
                .map_err(|e| format!("write audio packet: {e}"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_splits_interleaved_channels() {
        let mut fifo = StereoFifo::new();
        fifo.push_interleaved(&[1.0, -1.0, 2.0, -2.0, 3.0, -3.0]);
        assert_eq!(fifo.len(), 3);

        let mut left = [0.0f32; 3];
        let mut right = [0.0f32; 3];
        assert_eq!(fifo.pop_planes(3, &mut left, &mut right), 3);
        assert_eq!(left, [1.0, 2.0, 3.0]);
        assert_eq!(right, [-1.0, -2.0, -3.0]);
        assert!(fifo.is_empty());
    }

    #[test]
    fn fifo_zero_pads_short_tail() {
        let mut fifo = StereoFifo::new();
        fifo.push_interleaved(&[0.5, 0.5]);

        let mut left = [9.0f32; 4];
        let mut right = [9.0f32; 4];
        assert_eq!(fifo.pop_planes(4, &mut left, &mut right), 1);
        assert_eq!(left, [0.5, 0.0, 0.0, 0.0]);
        assert_eq!(right, [0.5, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn fifo_carries_remainder_across_pops() {
        let mut fifo = StereoFifo::new();
        let chunk: Vec<f32> = (0..10).flat_map(|i| [i as f32, i as f32]).collect();
        fifo.push_interleaved(&chunk);

        let mut left = [0.0f32; 4];
        let mut right = [0.0f32; 4];
        fifo.pop_planes(4, &mut left, &mut right);
        assert_eq!(left, [0.0, 1.0, 2.0, 3.0]);

        fifo.pop_planes(4, &mut left, &mut right);
        assert_eq!(left, [4.0, 5.0, 6.0, 7.0]);
        assert_eq!(fifo.len(), 2);
    }
}
