//! Sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! Microphones usually run at 44.1 or 48 kHz while the conversational service
//! expects 16 kHz. When both rates match the converter is a passthrough and no
//! rubato session is created.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{error, info};

use crate::error::{ConverseError, Result};

/// Converts f32 mono audio from one fixed sample rate to another
pub struct RateConverter {
    /// `None` when input rate == output rate
    resampler: Option<FastFixedIn<f32>>,
    /// Holds partial input chunks between calls
    input_buf: Vec<f32>,
    chunk_size: usize,
    output_buf: Vec<Vec<f32>>,
}

impl RateConverter {
    pub fn new(input_rate: u32, output_rate: u32, chunk_size: usize) -> Result<Self> {
        if input_rate == output_rate {
            return Ok(Self {
                resampler: None,
                input_buf: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
            });
        }

        let ratio = output_rate as f64 / input_rate as f64;
        let resampler = FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Cubic, chunk_size, 1)
            .map_err(|e| ConverseError::DeviceUnavailable(format!("resampler init: {}", e)))?;

        let output_buf = vec![vec![0f32; resampler.output_frames_max()]; 1];

        info!(
            "Resampling enabled {}Hz -> {}Hz (chunk {})",
            input_rate, output_rate, chunk_size
        );

        Ok(Self {
            resampler: Some(resampler),
            input_buf: Vec::new(),
            chunk_size,
            output_buf,
        })
    }

    /// Feed samples and return whatever output is ready (may be empty)
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(ref mut resampler) = self.resampler else {
            return samples.to_vec();
        };

        self.input_buf.extend_from_slice(samples);

        let mut result = Vec::new();
        while self.input_buf.len() >= self.chunk_size {
            let input_slice = &self.input_buf[..self.chunk_size];

            match resampler.process_into_buffer(&[input_slice], &mut self.output_buf, None) {
                Ok((_consumed, produced)) => {
                    result.extend_from_slice(&self.output_buf[0][..produced]);
                }
                Err(e) => {
                    error!("Resampler process error: {}", e);
                }
            }

            self.input_buf.drain(..self.chunk_size);
        }

        result
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}

/// Resample a complete buffer in one call
///
/// Pads the input to one resampler chunk so nothing is held back.
pub fn resample_buffer(samples: &[f32], input_rate: u32, output_rate: u32) -> Result<Vec<f32>> {
    if input_rate == output_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let mut converter = RateConverter::new(input_rate, output_rate, samples.len())?;
    let mut out = converter.process(samples);

    let expected = (samples.len() as f64 * output_rate as f64 / input_rate as f64).round() as usize;
    out.resize(expected, 0.0);

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough_identity() {
        let mut rc = RateConverter::new(16_000, 16_000, 960).unwrap();
        assert!(rc.is_passthrough());

        let samples: Vec<f32> = (0..480).map(|i| i as f32 * 0.001).collect();
        assert_eq!(rc.process(&samples), samples);
    }

    #[test]
    fn test_48k_to_16k_length() {
        let mut rc = RateConverter::new(48_000, 16_000, 960).unwrap();
        assert!(!rc.is_passthrough());

        let out = rc.process(&vec![0.0f32; 960 * 3]);
        let expected = 960usize;
        assert!(
            out.len().abs_diff(expected) <= 16,
            "expected ~{} samples, got {}",
            expected,
            out.len()
        );
    }

    #[test]
    fn test_resample_buffer_exact_length() {
        let out = resample_buffer(&vec![0.0f32; 2400], 24_000, 48_000).unwrap();
        assert_eq!(out.len(), 4800);
    }
}
