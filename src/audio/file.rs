use std::path::{Path, PathBuf};
use std::time::Duration;

use hound::{SampleFormat, WavReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::backend::{AudioBackend, AudioBackendConfig, AudioFrame};
use crate::error::{ConverseError, Result};

/// WAV audio loaded into memory as normalized mono samples
pub struct AudioFile {
    pub path: String,
    pub duration_seconds: f64,
    pub sample_rate: u32,
    /// Mono samples in [-1.0, 1.0]
    pub samples: Vec<f32>,
}

impl AudioFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening audio file: {}", path.display());

        let reader = WavReader::open(path).map_err(|e| {
            ConverseError::DeviceUnavailable(format!("failed to open {}: {}", path.display(), e))
        })?;

        let spec = reader.spec();
        let interleaved: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
            (SampleFormat::Int, 16) => reader
                .into_samples::<i16>()
                .map(|s| s.map(|v| v as f32 / 32768.0))
                .collect::<std::result::Result<Vec<f32>, hound::Error>>(),
            (SampleFormat::Float, 32) => reader
                .into_samples::<f32>()
                .collect::<std::result::Result<Vec<f32>, hound::Error>>(),
            (format, bits) => {
                return Err(ConverseError::DeviceUnavailable(format!(
                    "unsupported WAV format: {:?} {}-bit",
                    format, bits
                )))
            }
        }
        .map_err(|e| ConverseError::DeviceUnavailable(format!("failed to read samples: {}", e)))?;

        let channels = spec.channels.max(1) as usize;
        let samples: Vec<f32> = if channels == 1 {
            interleaved
        } else {
            interleaved
                .chunks_exact(channels)
                .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                .collect()
        };

        let duration_seconds = samples.len() as f64 / spec.sample_rate as f64;

        info!(
            "Audio file loaded: {:.1}s, {}Hz, {} channels, {} samples",
            duration_seconds,
            spec.sample_rate,
            spec.channels,
            samples.len()
        );

        Ok(Self {
            path: path.display().to_string(),
            duration_seconds,
            sample_rate: spec.sample_rate,
            samples,
        })
    }

    /// Split into fixed-size frames, zero-padding the last one
    pub fn frames(&self, block_size: usize) -> Vec<AudioFrame> {
        let block_size = block_size.max(1);

        self.samples
            .chunks(block_size)
            .enumerate()
            .map(|(i, block)| {
                let mut samples = block.to_vec();
                samples.resize(block_size, 0.0);
                AudioFrame {
                    samples,
                    sample_rate: self.sample_rate,
                    channels: 1,
                    timestamp_ms: (i * block_size) as u64 * 1000 / self.sample_rate as u64,
                }
            })
            .collect()
    }
}

/// Input backend that replays a WAV file as if it were a microphone
///
/// The file must already be at the target rate; resampling is left to the
/// tool that produced it.
pub struct FileBackend {
    file: AudioFile,
    config: AudioBackendConfig,
    realtime: bool,
    task: Option<JoinHandle<()>>,
}

impl FileBackend {
    pub fn open(path: PathBuf, config: AudioBackendConfig) -> Result<Self> {
        let file = AudioFile::open(&path)?;

        if file.sample_rate != config.target_sample_rate {
            return Err(ConverseError::DeviceUnavailable(format!(
                "{} is {}Hz, expected {}Hz",
                file.path, file.sample_rate, config.target_sample_rate
            )));
        }

        Ok(Self {
            file,
            config,
            realtime: true,
            task: None,
        })
    }

    /// Pace frames at their real duration (default) or deliver them at once
    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }
}

#[async_trait::async_trait]
impl AudioBackend for FileBackend {
    async fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>> {
        if self.task.is_some() {
            return Err(ConverseError::DeviceUnavailable("already capturing".into()));
        }

        let frames = self.file.frames(self.config.block_size);
        let (tx, rx) = mpsc::channel(self.config.frame_queue.max(1));
        let realtime = self.realtime;

        info!(
            "Replaying {} as input ({} frames, realtime={})",
            self.file.path,
            frames.len(),
            realtime
        );

        self.task = Some(tokio::spawn(async move {
            for frame in frames {
                let pace = Duration::from_millis(frame.duration_ms());
                if tx.send(frame).await.is_err() {
                    break;
                }
                if realtime {
                    tokio::time::sleep(pace).await;
                }
            }
        }));

        Ok(rx)
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(task) = self.task.take() {
            task.abort();
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("File replay task panicked: {}", e);
                }
            }
            info!("File input stopped");
        }

        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    fn name(&self) -> &str {
        "wav file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_wav(dir: &TempDir, name: &str, rate: u32, channels: u16, samples: &[i16]) -> PathBuf {
        let path = dir.path().join(name);
        let spec = hound::WavSpec {
            channels,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
        path
    }

    #[test]
    fn test_frames_are_padded_to_block_size() {
        let dir = TempDir::new().unwrap();
        let path = write_wav(&dir, "short.wav", 16000, 1, &vec![1000i16; 5000]);

        let file = AudioFile::open(&path).unwrap();
        let frames = file.frames(4096);

        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.samples.len() == 4096));
        assert_eq!(frames[1].timestamp_ms, 256);
        assert_eq!(frames[1].samples[5000 - 4096 + 1], 0.0);
    }

    #[test]
    fn test_stereo_is_downmixed() {
        let dir = TempDir::new().unwrap();
        let path = write_wav(&dir, "stereo.wav", 16000, 2, &[16384, 0, 16384, 0]);

        let file = AudioFile::open(&path).unwrap();

        assert_eq!(file.samples, vec![0.25, 0.25]);
    }

    #[test]
    fn test_rate_mismatch_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_wav(&dir, "hifi.wav", 48000, 1, &[0; 480]);

        let result = FileBackend::open(path, AudioBackendConfig::default());

        assert!(matches!(result, Err(ConverseError::DeviceUnavailable(_))));
    }

    #[test]
    fn test_missing_file_is_unavailable() {
        let result = AudioFile::open("/nonexistent/path/to/audio.wav");
        assert!(matches!(result, Err(ConverseError::DeviceUnavailable(_))));
    }

    #[tokio::test]
    async fn test_replay_delivers_every_frame() {
        let dir = TempDir::new().unwrap();
        let path = write_wav(&dir, "three.wav", 16000, 1, &vec![0i16; 3 * 4096]);

        let mut backend = FileBackend::open(path, AudioBackendConfig::default())
            .unwrap()
            .realtime(false);
        let mut rx = backend.start().await.unwrap();

        let mut count = 0;
        while let Some(frame) = rx.recv().await {
            assert_eq!(frame.samples.len(), 4096);
            count += 1;
        }

        assert_eq!(count, 3);
        backend.stop().await.unwrap();
        assert!(!backend.is_capturing());
    }
}
