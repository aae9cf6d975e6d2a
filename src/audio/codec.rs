// PCM16 codec for the live conversation wire format
//
// Capture produces normalized f32 samples; the service speaks 16-bit signed
// little-endian PCM. Positive samples scale by 32767 and negative samples by
// 32768 so the full i16 range is used and both directions round-trip exactly.

use base64::Engine;

use crate::error::{ConverseError, Result};

const POSITIVE_SCALE: f32 = 32767.0;
const NEGATIVE_SCALE: f32 = 32768.0;

/// PCM16 little-endian bytes plus the rate they were captured or synthesized at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    /// Raw PCM16 LE bytes
    pub data: Vec<u8>,
    /// Sample rate in Hz
    pub sample_rate: u32,
}

impl EncodedChunk {
    pub fn new(data: Vec<u8>, sample_rate: u32) -> Self {
        Self { data, sample_rate }
    }

    /// MIME tag used by the conversational service, e.g. `audio/pcm;rate=16000`
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.data)
    }

    pub fn from_base64(payload: &str, sample_rate: u32) -> Result<Self> {
        let data = base64::engine::general_purpose::STANDARD
            .decode(payload)
            .map_err(|e| ConverseError::MalformedAudio(format!("invalid base64 payload: {}", e)))?;

        Ok(Self { data, sample_rate })
    }

    /// Number of 16-bit samples carried (all channels)
    pub fn sample_count(&self) -> usize {
        self.data.len() / 2
    }
}

/// Decoded audio ready to hand to an output device
#[derive(Debug, Clone, PartialEq)]
pub struct PlayableBuffer {
    /// Interleaved samples in [-1.0, 1.0]
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl PlayableBuffer {
    /// Frames per channel
    pub fn frame_count(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn duration_secs(&self) -> f64 {
        self.frame_count() as f64 / self.sample_rate as f64
    }

    /// Average interleaved channels down to a single channel
    pub fn to_mono(&self) -> Vec<f32> {
        if self.channels == 1 {
            return self.samples.clone();
        }

        let ch = self.channels as usize;
        self.samples
            .chunks_exact(ch)
            .map(|frame| frame.iter().sum::<f32>() / ch as f32)
            .collect()
    }
}

/// Encode normalized samples to PCM16 LE. Out-of-range input is clamped.
pub fn encode(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&s| quantize(s).to_le_bytes())
        .collect()
}

/// Decode PCM16 LE bytes into a playable buffer
///
/// Fails with `MalformedAudio` when the byte length is not a whole number of
/// frames (`2 * channels` bytes each).
pub fn decode(bytes: &[u8], sample_rate: u32, channels: u16) -> Result<PlayableBuffer> {
    if channels == 0 || sample_rate == 0 {
        return Err(ConverseError::MalformedAudio(format!(
            "invalid format: {}Hz, {} channels",
            sample_rate, channels
        )));
    }

    let frame_size = 2 * channels as usize;
    if bytes.len() % frame_size != 0 {
        return Err(ConverseError::malformed(bytes.len(), frame_size));
    }

    let samples = bytes
        .chunks_exact(2)
        .map(|pair| dequantize(i16::from_le_bytes([pair[0], pair[1]])))
        .collect();

    Ok(PlayableBuffer {
        samples,
        sample_rate,
        channels,
    })
}

fn quantize(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    let scaled = if s < 0.0 {
        s * NEGATIVE_SCALE
    } else {
        s * POSITIVE_SCALE
    };
    // NaN saturates to 0
    scaled.round() as i16
}

fn dequantize(value: i16) -> f32 {
    if value < 0 {
        value as f32 / NEGATIVE_SCALE
    } else {
        value as f32 / POSITIVE_SCALE
    }
}
