//! Microphone and speaker devices backed by cpal.
//!
//! `cpal::Stream` is `!Send` on most platforms, so each device owns a
//! dedicated OS thread that builds the stream, keeps it alive and drops it.
//! The rest of the crate only talks to that thread through channels and
//! shared state.
//!
//! Device callbacks never block: the microphone callback hands raw buffers
//! over with `try_send`, and the speaker callback mixes whatever voices are
//! due from a short critical section.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, Stream, StreamConfig};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::backend::{AudioBackend, AudioBackendConfig, AudioFrame};
use super::codec::PlayableBuffer;
use super::output::{CancelledPlayback, OutputDevice, PlaybackId};
use super::resample::{self, RateConverter};
use crate::error::{ConverseError, Result};

/// Raw callback buffers held between the device and the framing thread
const RAW_QUEUE: usize = 64;

/// Default microphone, delivering fixed-size mono frames at the target rate
pub struct CpalMicrophone {
    config: AudioBackendConfig,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CpalMicrophone {
    pub fn new(config: AudioBackendConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }
}

#[async_trait::async_trait]
impl AudioBackend for CpalMicrophone {
    async fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>> {
        if self.thread.is_some() {
            return Err(ConverseError::DeviceUnavailable("already capturing".into()));
        }

        let (frame_tx, frame_rx) = mpsc::channel(self.config.frame_queue.max(1));
        let (ready_tx, ready_rx) = oneshot::channel();

        self.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        let config = self.config.clone();

        let thread = std::thread::Builder::new()
            .name("converse-mic".into())
            .spawn(move || capture_thread(config, running, frame_tx, ready_tx))
            .map_err(|e| ConverseError::DeviceUnavailable(format!("capture thread: {}", e)))?;
        self.thread = Some(thread);

        let ready = ready_rx.await.unwrap_or_else(|_| {
            Err(ConverseError::DeviceUnavailable(
                "capture thread exited before the stream opened".into(),
            ))
        });

        match ready {
            Ok(device_rate) => {
                info!(
                    "Microphone capturing at {}Hz, delivering {}Hz frames of {} samples",
                    device_rate, self.config.target_sample_rate, self.config.block_size
                );
                Ok(frame_rx)
            }
            Err(e) => {
                self.stop().await?;
                Err(e)
            }
        }
    }

    async fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);

        if let Some(thread) = self.thread.take() {
            let joined = tokio::task::spawn_blocking(move || thread.join()).await;
            match joined {
                Ok(Ok(())) => info!("Microphone released"),
                Ok(Err(_)) => warn!("Capture thread panicked"),
                Err(e) => warn!("Failed to join capture thread: {}", e),
            }
        }

        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.running.load(Ordering::SeqCst) && self.thread.is_some()
    }

    fn name(&self) -> &str {
        "cpal microphone"
    }
}

impl Drop for CpalMicrophone {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

fn capture_thread(
    config: AudioBackendConfig,
    running: Arc<AtomicBool>,
    frame_tx: mpsc::Sender<AudioFrame>,
    ready_tx: oneshot::Sender<Result<u32>>,
) {
    let (raw_tx, raw_rx) = std_mpsc::sync_channel::<Vec<f32>>(RAW_QUEUE);

    let (stream, device_rate) = match open_input_stream(raw_tx, Arc::clone(&running)) {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    let mut converter =
        match RateConverter::new(device_rate, config.target_sample_rate, config.block_size) {
            Ok(converter) => converter,
            Err(e) => {
                let _ = ready_tx.send(Err(e));
                return;
            }
        };

    let _ = ready_tx.send(Ok(device_rate));

    let block_size = config.block_size.max(1);
    let mut pending: Vec<f32> = Vec::with_capacity(block_size * 2);
    let mut delivered: u64 = 0;

    while running.load(Ordering::SeqCst) {
        let raw = match raw_rx.recv_timeout(Duration::from_millis(50)) {
            Ok(raw) => raw,
            Err(std_mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
        };

        pending.extend(converter.process(&raw));

        while pending.len() >= block_size {
            let samples: Vec<f32> = pending.drain(..block_size).collect();
            let frame = AudioFrame {
                samples,
                sample_rate: config.target_sample_rate,
                channels: 1,
                timestamp_ms: delivered * block_size as u64 * 1000
                    / config.target_sample_rate.max(1) as u64,
            };
            delivered += 1;

            match frame_tx.try_send(frame) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Capture queue full, dropped frame {}", delivered - 1);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    running.store(false, Ordering::SeqCst);
                    break;
                }
            }
        }
    }

    drop(stream);
    debug!("Capture thread exiting after {} frames", delivered);
}

fn open_input_stream(
    raw_tx: std_mpsc::SyncSender<Vec<f32>>,
    running: Arc<AtomicBool>,
) -> Result<(Stream, u32)> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| ConverseError::DeviceUnavailable("no default input device".into()))?;

    info!("Opening input device: {}", device.name().unwrap_or_default());

    let supported = device
        .default_input_config()
        .map_err(|e| ConverseError::DeviceUnavailable(e.to_string()))?;

    let sample_rate = supported.sample_rate().0;
    let channels = supported.channels();
    let config = StreamConfig {
        channels,
        sample_rate: SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let ch = channels.max(1) as usize;
    let on_error = |err: cpal::StreamError| error!("Input stream error: {}", err);

    let stream = match supported.sample_format() {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _| {
                if running.load(Ordering::Relaxed) {
                    forward(&raw_tx, downmix(data, ch, |s| s));
                }
            },
            on_error,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _| {
                if running.load(Ordering::Relaxed) {
                    forward(&raw_tx, downmix(data, ch, |s| s as f32 / 32768.0));
                }
            },
            on_error,
            None,
        ),
        fmt => {
            return Err(ConverseError::DeviceUnavailable(format!(
                "unsupported sample format: {:?}",
                fmt
            )))
        }
    }
    .map_err(|e| ConverseError::DeviceUnavailable(e.to_string()))?;

    stream
        .play()
        .map_err(|e| ConverseError::DeviceUnavailable(e.to_string()))?;

    Ok((stream, sample_rate))
}

fn downmix<T: Copy>(data: &[T], channels: usize, to_f32: impl Fn(T) -> f32) -> Vec<f32> {
    data.chunks_exact(channels)
        .map(|frame| frame.iter().map(|&s| to_f32(s)).sum::<f32>() / channels as f32)
        .collect()
}

fn forward(raw_tx: &std_mpsc::SyncSender<Vec<f32>>, samples: Vec<f32>) {
    if let Err(std_mpsc::TrySendError::Full(dropped)) = raw_tx.try_send(samples) {
        warn!("Capture thread behind, dropped {} samples", dropped.len());
    }
}

struct Voice {
    id: PlaybackId,
    start_frame: u64,
    samples: Vec<f32>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

#[derive(Default)]
struct Mixer {
    /// Frames handed to the device since the stream started; this is the clock
    frames_rendered: u64,
    voices: Vec<Voice>,
}

impl Mixer {
    /// Device frame a voice requested at `start_at` seconds begins on
    ///
    /// A request within one frame of the latest scheduled end joins it
    /// exactly; rounding each chunk on its own would leave one-frame gaps or
    /// overlaps when the rates are not integer multiples.
    fn start_frame_for(&self, start_at: f64, device_rate: u32) -> u64 {
        let requested = (start_at * device_rate as f64).max(0.0);

        match self.voices.iter().map(Voice::end_frame).max() {
            Some(end) if (requested - end as f64).abs() <= 1.0 => end,
            _ => requested.round() as u64,
        }
    }

    fn render(&mut self, out: &mut [f32], channels: usize) {
        let base = self.frames_rendered;
        let frames = out.len() / channels;

        for (i, frame) in out.chunks_exact_mut(channels).enumerate() {
            let t = base + i as u64;
            let mut value = 0.0f32;
            for voice in &self.voices {
                if t >= voice.start_frame && t < voice.end_frame() {
                    value += voice.samples[(t - voice.start_frame) as usize];
                }
            }
            frame.fill(value.clamp(-1.0, 1.0));
        }

        self.frames_rendered += frames as u64;
        let now = self.frames_rendered;
        self.voices.retain(|v| v.end_frame() > now);
    }
}

/// Default speakers with sample-accurate scheduling
///
/// The clock is the number of frames the device has consumed, so scheduled
/// start times line up with what is actually heard.
pub struct CpalSpeaker {
    sample_rate: u32,
    device_rate: u32,
    mixer: Arc<Mutex<Mixer>>,
    next_id: AtomicU64,
    shutdown: Mutex<Option<std_mpsc::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CpalSpeaker {
    /// Open the default output device, preferring `sample_rate` when supported
    pub fn open(sample_rate: u32) -> Result<Self> {
        let mixer = Arc::new(Mutex::new(Mixer::default()));
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<u32>>();
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();

        let thread_mixer = Arc::clone(&mixer);
        let thread = std::thread::Builder::new()
            .name("converse-speaker".into())
            .spawn(move || match open_output_stream(sample_rate, thread_mixer) {
                Ok((stream, device_rate)) => {
                    let _ = ready_tx.send(Ok(device_rate));
                    // Blocks until release or until the speaker is dropped
                    let _ = shutdown_rx.recv();
                    drop(stream);
                    debug!("Playback thread exiting");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| ConverseError::DeviceUnavailable(format!("playback thread: {}", e)))?;

        let device_rate = ready_rx.recv().map_err(|_| {
            ConverseError::DeviceUnavailable("playback thread exited before the stream opened".into())
        })??;

        if device_rate != sample_rate {
            info!(
                "Output device runs at {}Hz, resampling {}Hz audio",
                device_rate, sample_rate
            );
        }

        Ok(Self {
            sample_rate,
            device_rate,
            mixer,
            next_id: AtomicU64::new(0),
            shutdown: Mutex::new(Some(shutdown_tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    fn mixer(&self) -> MutexGuard<'_, Mixer> {
        lock(&self.mixer)
    }
}

impl OutputDevice for CpalSpeaker {
    fn now(&self) -> f64 {
        self.mixer().frames_rendered as f64 / self.device_rate as f64
    }

    fn schedule(&self, buffer: PlayableBuffer, start_at: f64) -> Result<PlaybackId> {
        if lock(&self.shutdown).is_none() {
            return Err(ConverseError::Playback("output device released".into()));
        }

        let source_rate = buffer.sample_rate;
        let mono = buffer.to_mono();
        let samples = resample::resample_buffer(&mono, source_rate, self.device_rate)
            .map_err(|e| ConverseError::Playback(e.to_string()))?;

        let id = PlaybackId(self.next_id.fetch_add(1, Ordering::SeqCst));

        let mut mixer = self.mixer();
        let start_frame = mixer.start_frame_for(start_at, self.device_rate);
        mixer.voices.push(Voice {
            id,
            start_frame,
            samples,
        });

        Ok(id)
    }

    fn cancel_all(&self) -> Vec<CancelledPlayback> {
        let mut mixer = self.mixer();
        let now = mixer.frames_rendered;
        let rate = self.device_rate as f64;

        mixer
            .voices
            .drain(..)
            .filter(|v| v.end_frame() > now)
            .map(|v| CancelledPlayback {
                id: v.id,
                start: v.start_frame as f64 / rate,
                unplayed_secs: (v.end_frame() - now.max(v.start_frame)) as f64 / rate,
            })
            .collect()
    }

    fn release(&self) -> Result<()> {
        let Some(shutdown) = lock(&self.shutdown).take() else {
            return Ok(());
        };

        self.mixer().voices.clear();
        let _ = shutdown.send(());

        if let Some(thread) = lock(&self.thread).take() {
            join_device_thread(thread, "playback");
        }

        info!("Speaker released");
        Ok(())
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn name(&self) -> &str {
        "cpal speaker"
    }
}

fn open_output_stream(preferred_rate: u32, mixer: Arc<Mutex<Mixer>>) -> Result<(Stream, u32)> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| ConverseError::DeviceUnavailable("no default output device".into()))?;

    info!("Opening output device: {}", device.name().unwrap_or_default());

    let preferred = device.supported_output_configs().ok().and_then(|mut configs| {
        configs.find(|c| {
            c.min_sample_rate().0 <= preferred_rate
                && c.max_sample_rate().0 >= preferred_rate
                && matches!(c.sample_format(), SampleFormat::F32 | SampleFormat::I16)
        })
    });

    let supported = match preferred {
        Some(range) => range.with_sample_rate(SampleRate(preferred_rate)),
        None => device
            .default_output_config()
            .map_err(|e| ConverseError::DeviceUnavailable(e.to_string()))?,
    };

    let device_rate = supported.sample_rate().0;
    let channels = supported.channels().max(1) as usize;
    let config: StreamConfig = supported.config();
    let on_error = |err: cpal::StreamError| error!("Output stream error: {}", err);

    let stream = match supported.sample_format() {
        SampleFormat::F32 => device.build_output_stream(
            &config,
            move |data: &mut [f32], _| lock(&mixer).render(data, channels),
            on_error,
            None,
        ),
        SampleFormat::I16 => {
            let mut scratch: Vec<f32> = Vec::new();
            device.build_output_stream(
                &config,
                move |data: &mut [i16], _| {
                    scratch.resize(data.len(), 0.0);
                    lock(&mixer).render(&mut scratch, channels);
                    for (out, s) in data.iter_mut().zip(&scratch) {
                        *out = (s * 32767.0) as i16;
                    }
                },
                on_error,
                None,
            )
        }
        fmt => {
            return Err(ConverseError::DeviceUnavailable(format!(
                "unsupported sample format: {:?}",
                fmt
            )))
        }
    }
    .map_err(|e| ConverseError::DeviceUnavailable(e.to_string()))?;

    stream
        .play()
        .map_err(|e| ConverseError::DeviceUnavailable(e.to_string()))?;

    Ok((stream, device_rate))
}

/// Join a device thread without stalling an async worker
///
/// Inside a runtime the join moves to the blocking pool; outside one it
/// happens inline.
fn join_device_thread(thread: JoinHandle<()>, name: &'static str) {
    let join = move || match thread.join() {
        Ok(()) => debug!("{} thread joined", name),
        Err(_) => error!("{} thread panicked", name),
    };

    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn_blocking(join);
        }
        Err(_) => join(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mixer_renders_voice_at_start_frame() {
        let mut mixer = Mixer::default();
        mixer.voices.push(Voice {
            id: PlaybackId(0),
            start_frame: 2,
            samples: vec![0.5; 3],
        });

        let mut out = vec![0.0f32; 8];
        mixer.render(&mut out, 1);

        assert_eq!(out, vec![0.0, 0.0, 0.5, 0.5, 0.5, 0.0, 0.0, 0.0]);
        assert_eq!(mixer.frames_rendered, 8);
        assert!(mixer.voices.is_empty());
    }

    #[test]
    fn test_mixer_duplicates_mono_across_channels() {
        let mut mixer = Mixer::default();
        mixer.voices.push(Voice {
            id: PlaybackId(0),
            start_frame: 0,
            samples: vec![0.25; 4],
        });

        let mut out = vec![0.0f32; 4];
        mixer.render(&mut out, 2);

        assert_eq!(out, vec![0.25; 4]);
        assert_eq!(mixer.frames_rendered, 2);
        assert_eq!(mixer.voices.len(), 1);
    }

    #[test]
    fn test_back_to_back_voices_join_exactly() {
        let mut mixer = Mixer::default();
        // 0.1s of 24kHz audio resampled to 44.1kHz
        mixer.voices.push(Voice {
            id: PlaybackId(0),
            start_frame: 0,
            samples: vec![0.1; 4410],
        });

        // The scheduler's float timeline lands a hair off the frame grid
        assert_eq!(mixer.start_frame_for(4410.4 / 44100.0, 44100), 4410);
        assert_eq!(mixer.start_frame_for(4409.6 / 44100.0, 44100), 4410);
        // Anything further away is taken as requested
        assert_eq!(mixer.start_frame_for(0.2, 44100), 8820);
    }

    fn slow_thread(finished: Arc<AtomicBool>) -> JoinHandle<()> {
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            finished.store(true, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn test_thread_join_does_not_block_the_runtime() {
        let finished = Arc::new(AtomicBool::new(false));
        let thread = slow_thread(Arc::clone(&finished));

        let started = std::time::Instant::now();
        join_device_thread(thread, "test");
        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(!finished.load(Ordering::SeqCst));

        tokio::time::timeout(Duration::from_secs(2), async {
            while !finished.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_thread_join_outside_runtime_waits() {
        let finished = Arc::new(AtomicBool::new(false));
        let thread = slow_thread(Arc::clone(&finished));

        join_device_thread(thread, "test");

        assert!(finished.load(Ordering::SeqCst));
    }

    #[test]
    fn test_downmix_averages_channels() {
        let mixed = downmix(&[0.5f32, -0.5, 1.0, 0.0], 2, |s| s);
        assert_eq!(mixed, vec![0.0, 0.5]);
    }
}
