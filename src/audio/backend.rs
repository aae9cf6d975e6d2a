use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;

use super::output::OutputDevice;
use crate::error::Result;

/// A fixed-size block of captured audio (normalized f32, interleaved)
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Samples in [-1.0, 1.0]
    pub samples: Vec<f32>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels
    pub channels: u16,
    /// Timestamp in milliseconds since capture started
    pub timestamp_ms: u64,
}

impl AudioFrame {
    /// A block of digital silence
    pub fn silence(block_size: usize, sample_rate: u32, timestamp_ms: u64) -> Self {
        Self {
            samples: vec![0.0; block_size],
            sample_rate,
            channels: 1,
            timestamp_ms,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        let frames = self.samples.len() as u64 / self.channels.max(1) as u64;
        frames * 1000 / self.sample_rate.max(1) as u64
    }
}

/// Configuration for an input backend
#[derive(Debug, Clone)]
pub struct AudioBackendConfig {
    /// Rate frames are delivered at (resampled if the device differs)
    pub target_sample_rate: u32,
    /// Target channel count (1 = mono)
    pub target_channels: u16,
    /// Samples per delivered frame
    pub block_size: usize,
    /// Frames buffered between the device and the capture pipeline
    pub frame_queue: usize,
}

impl Default for AudioBackendConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: 16000, // Service expects 16kHz input
            target_channels: 1,        // Mono
            block_size: 4096,          // ~256ms at 16kHz
            frame_queue: 32,
        }
    }
}

/// Audio capture backend trait
///
/// Implementations deliver fixed-size blocks of `block_size` samples. Device
/// callbacks must hand frames over with `try_send` and never block.
#[async_trait::async_trait]
pub trait AudioBackend: Send + Sync {
    /// Start capturing audio
    ///
    /// Returns a channel receiver that will receive audio frames
    async fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>>;

    /// Stop capturing audio and release the device
    async fn stop(&mut self) -> Result<()>;

    /// Check if backend is currently capturing
    fn is_capturing(&self) -> bool;

    /// Get backend name for logging
    fn name(&self) -> &str;
}

/// Audio source type
#[derive(Debug, Clone)]
pub enum AudioSource {
    /// Default microphone (cpal)
    Microphone,
    /// WAV file input, paced in real time when `realtime` is set
    File { path: PathBuf, realtime: bool },
}

/// Where synthesized audio goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioSink {
    /// Default speakers (cpal)
    Speakers,
    /// Software clock only, nothing audible
    Headless,
}

/// Audio backend factory
pub struct AudioBackendFactory;

impl AudioBackendFactory {
    /// Create an input backend for the given source
    pub fn create(source: AudioSource, config: AudioBackendConfig) -> Result<Box<dyn AudioBackend>> {
        match source {
            AudioSource::Microphone => {
                #[cfg(feature = "audio-cpal")]
                {
                    Ok(Box::new(super::cpal::CpalMicrophone::new(config)))
                }

                #[cfg(not(feature = "audio-cpal"))]
                {
                    let _ = config;
                    Err(crate::error::ConverseError::DeviceUnavailable(
                        "compiled without audio-cpal feature".into(),
                    ))
                }
            }

            AudioSource::File { path, realtime } => {
                let backend = super::file::FileBackend::open(path, config)?.realtime(realtime);
                Ok(Box::new(backend))
            }
        }
    }

    /// Create an output device for the given sink
    pub fn create_output(sink: AudioSink, sample_rate: u32) -> Result<Arc<dyn OutputDevice>> {
        match sink {
            AudioSink::Speakers => {
                #[cfg(feature = "audio-cpal")]
                {
                    Ok(Arc::new(super::cpal::CpalSpeaker::open(sample_rate)?))
                }

                #[cfg(not(feature = "audio-cpal"))]
                {
                    let _ = sample_rate;
                    Err(crate::error::ConverseError::DeviceUnavailable(
                        "compiled without audio-cpal feature".into(),
                    ))
                }
            }

            AudioSink::Headless => Ok(Arc::new(super::headless::HeadlessOutput::system(sample_rate))),
        }
    }
}

/// Supplies the devices for one conversation
///
/// Every conversation opens fresh devices and releases them on teardown, so
/// no audio resource outlives the session that acquired it.
pub trait DeviceProvider: Send + Sync {
    fn open_input(&self, config: &AudioBackendConfig) -> Result<Box<dyn AudioBackend>>;

    fn open_output(&self, sample_rate: u32) -> Result<Arc<dyn OutputDevice>>;
}

/// Device provider backed by `AudioBackendFactory`
#[derive(Debug, Clone)]
pub struct DefaultDevices {
    pub source: AudioSource,
    pub sink: AudioSink,
}

impl DefaultDevices {
    pub fn new(source: AudioSource, sink: AudioSink) -> Self {
        Self { source, sink }
    }
}

impl DeviceProvider for DefaultDevices {
    fn open_input(&self, config: &AudioBackendConfig) -> Result<Box<dyn AudioBackend>> {
        AudioBackendFactory::create(self.source.clone(), config.clone())
    }

    fn open_output(&self, sample_rate: u32) -> Result<Arc<dyn OutputDevice>> {
        AudioBackendFactory::create_output(self.sink, sample_rate)
    }
}
