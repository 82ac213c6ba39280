use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

pub const OUTPUT_SAMPLE_RATE: u32 = 48_000;
pub const OUTPUT_CHANNELS: usize = 2;

/// Interleaved samples buffered between the feeder and the device callback
/// (~170 ms at 48 kHz stereo).
const RING_CAPACITY: usize = 16_384;
const FEED_CHUNK_FRAMES: usize = 512;
const FEED_INTERVAL: Duration = Duration::from_millis(5);

pub type AudioProducer = HeapProd<f32>;
pub type AudioConsumer = HeapCons<f32>;

struct Shared {
    paused: AtomicBool,
    queued_samples: AtomicUsize,
}

/// Stereo f32 output on the default device.
///
/// A feeder thread pulls interleaved samples from the engine's fill callback
/// into an SPSC ring; the device callback drains the ring and substitutes
/// silence on underrun. While paused the callback keeps draining, so
/// anything queued before a seek is discarded rather than played late.
/// `queued_seconds` reports the ring occupancy for the playback-clock
/// latency correction.
pub struct AudioOutput {
    _stream: cpal::Stream,
    shared: Arc<Shared>,
    producer: Arc<Mutex<AudioProducer>>,
    feeder: Option<JoinHandle<()>>,
    feeder_running: Arc<AtomicBool>,
    sample_rate: u32,
    channels: usize,
}

impl AudioOutput {
    pub fn new() -> Result<Self, String> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| "No default output device".to_string())?;

        let supported = device
            .default_output_config()
            .map_err(|e| format!("Failed to get default output config: {e}"))?;
        let sample_format = supported.sample_format();

        let config = cpal::StreamConfig {
            channels: OUTPUT_CHANNELS as cpal::ChannelCount,
            sample_rate: cpal::SampleRate(OUTPUT_SAMPLE_RATE),
            buffer_size: cpal::BufferSize::Default,
        };

        let shared = Arc::new(Shared {
            paused: AtomicBool::new(true),
            queued_samples: AtomicUsize::new(0),
        });

        let rb = HeapRb::<f32>::new(RING_CAPACITY);
        let (producer, consumer) = rb.split();

        let err_fn = |err| {
            eprintln!("audio stream error: {err}");
        };

        let stream = match sample_format {
            SampleFormat::F32 => {
                build_stream::<f32>(&device, &config, consumer, Arc::clone(&shared), err_fn)?
            }
            SampleFormat::I16 => {
                build_stream::<i16>(&device, &config, consumer, Arc::clone(&shared), err_fn)?
            }
            SampleFormat::U16 => {
                build_stream::<u16>(&device, &config, consumer, Arc::clone(&shared), err_fn)?
            }
            other => return Err(format!("Unsupported sample format: {other}")),
        };

        stream
            .play()
            .map_err(|e| format!("Failed to start audio stream: {e}"))?;

        Ok(Self {
            _stream: stream,
            shared,
            producer: Arc::new(Mutex::new(producer)),
            feeder: None,
            feeder_running: Arc::new(AtomicBool::new(false)),
            sample_rate: OUTPUT_SAMPLE_RATE,
            channels: OUTPUT_CHANNELS,
        })
    }

    /// Installs the pull source. `fill(buf, frames)` must write
    /// `frames * OUTPUT_CHANNELS` interleaved samples into `buf`.
    /// Output stays paused until `resume` is called.
    pub fn start_with_source<F>(&mut self, mut fill: F)
    where
        F: FnMut(&mut [f32], usize) + Send + 'static,
    {
        self.stop_feeder();

        self.feeder_running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.feeder_running);
        let shared = Arc::clone(&self.shared);
        let producer = Arc::clone(&self.producer);

        self.feeder = Some(thread::spawn(move || {
            let chunk_samples = FEED_CHUNK_FRAMES * OUTPUT_CHANNELS;
            let mut chunk = vec![0.0f32; chunk_samples];
            while running.load(Ordering::SeqCst) {
                if shared.paused.load(Ordering::Relaxed) {
                    thread::sleep(FEED_INTERVAL);
                    continue;
                }
                let vacant = producer.lock().map(|p| p.vacant_len()).unwrap_or(0);
                if vacant >= chunk_samples {
                    fill(&mut chunk, FEED_CHUNK_FRAMES);
                    if let Ok(mut p) = producer.lock() {
                        let pushed = p.push_slice(&chunk);
                        shared.queued_samples.fetch_add(pushed, Ordering::Relaxed);
                    }
                } else {
                    thread::sleep(FEED_INTERVAL);
                }
            }
        }));
    }

    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Relaxed)
    }

    /// Seconds of audio handed to the mixer but not yet played.
    pub fn queued_seconds(&self) -> f64 {
        let queued = self.shared.queued_samples.load(Ordering::Relaxed);
        queued as f64 / (self.sample_rate as f64 * self.channels as f64)
    }

    /// Corrects a raw master-clock reading for device latency.
    pub fn playback_clock(&self, raw_clock_seconds: f64) -> f64 {
        raw_clock_seconds - self.queued_seconds()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    fn stop_feeder(&mut self) {
        self.feeder_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.feeder.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for AudioOutput {
    fn drop(&mut self) {
        self.stop_feeder();
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut consumer: AudioConsumer,
    shared: Arc<Shared>,
    err_fn: impl FnMut(cpal::StreamError) + Send + 'static,
) -> Result<cpal::Stream, String>
where
    T: Sample + FromSample<f32> + cpal::SizedSample,
{
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _| {
                if shared.paused.load(Ordering::Relaxed) {
                    let mut drained = 0;
                    while consumer.try_pop().is_some() {
                        drained += 1;
                    }
                    if drained > 0 {
                        shared.queued_samples.fetch_sub(drained, Ordering::Relaxed);
                    }
                    data.fill(T::from_sample(0.0f32));
                    return;
                }

                let mut popped = 0;
                for slot in data.iter_mut() {
                    *slot = match consumer.try_pop() {
                        Some(sample) => {
                            popped += 1;
                            T::from_sample(sample)
                        }
                        None => T::from_sample(0.0f32),
                    };
                }
                if popped > 0 {
                    shared.queued_samples.fetch_sub(popped, Ordering::Relaxed);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| format!("Failed to build output stream: {e}"))
}
