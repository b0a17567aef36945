//! Audio capture via cpal backend.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It **must not**:
//! - Allocate heap memory
//! - Block on a mutex or condvar
//! - Perform I/O
//!
//! This module satisfies that contract by writing directly into an SPSC ring
//! buffer producer whose `push_slice` is lock-free and allocation-free. The
//! segmentation worker drains the ring through [`AudioSource::read_chunk`],
//! which blocks until a full fixed-duration chunk is available.
//!
//! # Degraded mode
//!
//! When no input device can be opened (or the crate is built without the
//! `audio-cpal` feature), [`AudioSource::open`] returns a degraded source
//! instead of failing: `read_chunk` then blocks until the stop flag clears
//! and never yields audio, so the rest of the pipeline runs unchanged.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). `AudioSource` must therefore be opened and dropped on the same
//! thread. The engine accomplishes this by opening it inside the
//! segmentation worker's `spawn_blocking` closure.

pub mod device;
pub mod resample;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    SampleFormat, SampleRate, Stream, StreamConfig,
};

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use tracing::info;
#[cfg(feature = "audio-cpal")]
use tracing::{error, warn};

#[cfg(feature = "audio-cpal")]
use crate::buffering::{create_audio_ring, AudioConsumer, AudioProducer, Consumer, Producer};
use crate::buffering::chunk::AudioChunk;
#[cfg(feature = "audio-cpal")]
use crate::error::ColloquyError;
use crate::error::Result;
#[cfg(feature = "audio-cpal")]
use resample::RateConverter;

/// Samples drained from the ring per poll.
/// 20 ms at 48 kHz = 960 — a reasonable stride for most capture rates.
#[cfg(feature = "audio-cpal")]
const DRAIN_CHUNK: usize = 960;

/// Sleep when the ring has not yet accumulated a full chunk.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Poll interval for the stop flag in degraded mode.
const DEGRADED_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Parameters for opening an audio source.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Sample rate chunks are delivered at (Hz). Audio captured at other
    /// rates is resampled. Default: 16000.
    pub target_sample_rate: u32,
    /// Duration of each delivered chunk in milliseconds. Default: 20.
    pub chunk_duration_ms: u32,
    /// Input device name to prefer; `None` uses default selection.
    pub preferred_input_device: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: 16_000,
            chunk_duration_ms: 20,
            preferred_input_device: None,
        }
    }
}

impl CaptureConfig {
    /// Samples per delivered chunk at the target rate.
    pub fn chunk_samples(&self) -> usize {
        (self.target_sample_rate as usize * self.chunk_duration_ms as usize) / 1000
    }
}

/// Handle to an audio input, either live capture or a degraded stand-in.
///
/// **Not `Send`** when live — `cpal::Stream` is bound to its creation
/// thread. Open and drop this type on the same OS thread. Dropping it
/// releases the device; dropping is naturally idempotent.
pub struct AudioSource {
    mode: SourceMode,
    /// Shared stop flag — once false, `read_chunk` returns `None`.
    running: Arc<AtomicBool>,
    chunk_samples: usize,
    target_sample_rate: u32,
}

enum SourceMode {
    #[cfg(feature = "audio-cpal")]
    Live(LiveCapture),
    Degraded,
}

#[cfg(feature = "audio-cpal")]
struct LiveCapture {
    /// Kept alive so the stream is not dropped prematurely.
    _stream: Stream,
    consumer: AudioConsumer,
    converter: RateConverter,
    /// Resampled samples awaiting chunk assembly.
    pending: Vec<f32>,
    /// Scratch buffer reused for each ring drain.
    scratch: Vec<f32>,
    /// Actual capture sample rate reported by the device (Hz).
    capture_sample_rate: u32,
}

impl AudioSource {
    /// Probe input devices and open a capture stream.
    ///
    /// Never fails: any device or stream error is logged and the source
    /// comes up degraded so callers can run without a microphone.
    pub fn open(config: &CaptureConfig, running: Arc<AtomicBool>) -> Self {
        let chunk_samples = config.chunk_samples();

        #[cfg(feature = "audio-cpal")]
        {
            match Self::try_open_live(config, Arc::clone(&running)) {
                Ok(live) => {
                    info!(
                        capture_rate = live.capture_sample_rate,
                        target_rate = config.target_sample_rate,
                        chunk_samples,
                        "audio source opened"
                    );
                    return Self {
                        mode: SourceMode::Live(live),
                        running,
                        chunk_samples,
                        target_sample_rate: config.target_sample_rate,
                    };
                }
                Err(e) => {
                    warn!(error = %e, "audio capture unavailable — running degraded (no microphone)");
                }
            }
        }

        #[cfg(not(feature = "audio-cpal"))]
        info!("compiled without audio-cpal — audio source is degraded");

        Self {
            mode: SourceMode::Degraded,
            running,
            chunk_samples,
            target_sample_rate: config.target_sample_rate,
        }
    }

    /// `true` when no device was opened and reads will never yield audio.
    pub fn is_degraded(&self) -> bool {
        matches!(self.mode, SourceMode::Degraded)
    }

    /// Blocking read of exactly one chunk of mono i16 PCM at the target rate.
    ///
    /// Returns `None` once the stop flag clears. In degraded mode, blocks
    /// (polling the stop flag) and never yields audio.
    pub fn read_chunk(&mut self) -> Option<AudioChunk> {
        match &mut self.mode {
            #[cfg(feature = "audio-cpal")]
            SourceMode::Live(live) => loop {
                if !self.running.load(Ordering::Relaxed) {
                    return None;
                }

                let n = live.consumer.pop_slice(&mut live.scratch);
                if n > 0 {
                    let resampled = live.converter.process(&live.scratch[..n]);
                    live.pending.extend_from_slice(&resampled);
                }

                if live.pending.len() >= self.chunk_samples {
                    let frame: Vec<f32> = live.pending.drain(..self.chunk_samples).collect();
                    return Some(AudioChunk::from_f32(&frame, self.target_sample_rate));
                }

                // Not enough buffered yet — yield rather than spin
                std::thread::sleep(READ_POLL_INTERVAL);
            },
            SourceMode::Degraded => {
                while self.running.load(Ordering::Relaxed) {
                    std::thread::sleep(DEGRADED_POLL_INTERVAL);
                }
                None
            }
        }
    }

    #[cfg(feature = "audio-cpal")]
    fn try_open_live(config: &CaptureConfig, running: Arc<AtomicBool>) -> Result<LiveCapture> {
        let host = cpal::default_host();
        let selected = device::select_input_device(&host, config.preferred_input_device.as_deref())
            .ok_or(ColloquyError::NoDefaultInputDevice)?;

        info!(
            device = selected.name().unwrap_or_default().as_str(),
            "opening input device"
        );

        let supported = selected
            .default_input_config()
            .map_err(|e| ColloquyError::AudioDevice(e.to_string()))?;

        let capture_sample_rate = supported.sample_rate().0;
        let channels = supported.channels();

        info!(capture_sample_rate, channels, "audio config selected");

        let stream_config = StreamConfig {
            channels,
            sample_rate: SampleRate(capture_sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let (producer, consumer) = create_audio_ring();

        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_input_stream::<f32>(
                &selected,
                &stream_config,
                producer,
                Arc::clone(&running),
                |s| s,
            ),
            SampleFormat::I16 => build_input_stream::<i16>(
                &selected,
                &stream_config,
                producer,
                Arc::clone(&running),
                |s| s as f32 / 32768.0,
            ),
            SampleFormat::U8 => build_input_stream::<u8>(
                &selected,
                &stream_config,
                producer,
                Arc::clone(&running),
                |s| (s as f32 - 128.0) / 128.0,
            ),
            fmt => Err(ColloquyError::AudioStream(format!(
                "unsupported sample format: {fmt:?}"
            ))),
        }?;

        stream
            .play()
            .map_err(|e| ColloquyError::AudioStream(e.to_string()))?;

        let converter =
            RateConverter::new(capture_sample_rate, config.target_sample_rate, DRAIN_CHUNK)?;

        Ok(LiveCapture {
            _stream: stream,
            consumer,
            converter,
            pending: Vec::with_capacity(config.chunk_samples() * 4),
            scratch: vec![0f32; DRAIN_CHUNK],
            capture_sample_rate,
        })
    }
}

/// Build a cpal input stream that mixes interleaved frames to mono f32 and
/// pushes them into the ring producer.
///
/// Device errors reported through the error callback are logged and treated
/// as transient: the stream keeps running and the reader simply sees a gap.
#[cfg(feature = "audio-cpal")]
fn build_input_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut producer: AudioProducer,
    gate: Arc<AtomicBool>,
    convert: impl Fn(T) -> f32 + Send + 'static,
) -> Result<Stream>
where
    T: cpal::SizedSample + Send + 'static,
{
    let channels = config.channels as usize;
    let mut mono_buf: Vec<f32> = Vec::new();

    device
        .build_input_stream(
            config,
            move |data: &[T], _info| {
                if !gate.load(Ordering::Relaxed) {
                    return;
                }
                let frames = data.len() / channels;
                mono_buf.resize(frames, 0.0);
                if channels == 1 {
                    for (dst, s) in mono_buf.iter_mut().zip(data) {
                        *dst = convert(*s);
                    }
                } else {
                    for (f, frame) in data.chunks_exact(channels).enumerate() {
                        mono_buf[f] =
                            frame.iter().map(|s| convert(*s)).sum::<f32>() / channels as f32;
                    }
                }
                let written = producer.push_slice(&mono_buf[..frames]);
                if written < frames {
                    warn!("ring buffer full: dropped {} frames", frames - written);
                }
            },
            |err| error!("audio stream error: {err}"),
            None,
        )
        .map_err(|e| ColloquyError::AudioStream(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_samples_derives_from_rate_and_duration() {
        let config = CaptureConfig::default();
        assert_eq!(config.chunk_samples(), 320);

        let config = CaptureConfig {
            target_sample_rate: 8_000,
            chunk_duration_ms: 30,
            preferred_input_device: None,
        };
        assert_eq!(config.chunk_samples(), 240);
    }

    #[test]
    fn degraded_source_blocks_until_stop_and_yields_nothing() {
        let running = Arc::new(AtomicBool::new(true));
        let mut source = AudioSource {
            mode: SourceMode::Degraded,
            running: Arc::clone(&running),
            chunk_samples: 320,
            target_sample_rate: 16_000,
        };
        assert!(source.is_degraded());

        let stopper = std::thread::spawn({
            let running = Arc::clone(&running);
            move || {
                std::thread::sleep(Duration::from_millis(120));
                running.store(false, Ordering::SeqCst);
            }
        });

        assert!(source.read_chunk().is_none());
        stopper.join().expect("stopper thread panicked");
    }
}
