//! Sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! cpal captures at the device's native rate (commonly 44.1 or 48 kHz);
//! the segmentation pipeline and the recognition boundary both work at
//! 16 kHz mono. `RateConverter` bridges that gap on the segmentation
//! worker thread, where allocation is allowed.
//!
//! When capture rate == target rate the converter is a passthrough and no
//! rubato session is created at all.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::error;

use crate::error::{ColloquyError, Result};

/// Converts f32 mono audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` when capture rate == target rate (passthrough mode).
    resampler: Option<FastFixedIn<f32>>,
    /// Holds partial input between calls — rubato consumes fixed blocks.
    carry: Vec<f32>,
    /// Input frames rubato expects per process call.
    block: usize,
    /// Pre-allocated rubato output buffer: `[1][output_frames_max]`.
    out_buf: Vec<Vec<f32>>,
}

impl RateConverter {
    /// Create a new converter.
    ///
    /// # Errors
    /// Returns `ColloquyError::AudioDevice` if rubato fails to initialise.
    pub fn new(capture_rate: u32, target_rate: u32, block: usize) -> Result<Self> {
        if capture_rate == target_rate {
            return Ok(Self {
                resampler: None,
                carry: Vec::new(),
                block,
                out_buf: Vec::new(),
            });
        }

        let ratio = target_rate as f64 / capture_rate as f64;
        let resampler = FastFixedIn::<f32>::new(
            ratio,
            1.0, // fixed ratio — no dynamic adjustment
            PolynomialDegree::Cubic,
            block,
            1, // mono
        )
        .map_err(|e| ColloquyError::AudioDevice(format!("resampler init: {e}")))?;

        let max_out = resampler.output_frames_max();
        let out_buf = vec![vec![0f32; max_out]];

        tracing::info!(capture_rate, target_rate, block, max_out, "resampling enabled");

        Ok(Self {
            resampler: Some(resampler),
            carry: Vec::new(),
            block,
            out_buf,
        })
    }

    /// Process incoming samples, returning resampled output (may be empty).
    ///
    /// Input is accumulated until a full block is available for rubato; any
    /// remainder is carried to the next call. In passthrough mode input is
    /// returned directly.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(ref mut resampler) = self.resampler else {
            return samples.to_vec();
        };

        self.carry.extend_from_slice(samples);

        let mut out = Vec::new();
        while self.carry.len() >= self.block {
            match resampler.process_into_buffer(&[&self.carry[..self.block]], &mut self.out_buf, None)
            {
                Ok((_consumed, produced)) => {
                    out.extend_from_slice(&self.out_buf[0][..produced]);
                }
                Err(e) => {
                    error!("resampler process error: {e}");
                }
            }
            self.carry.drain(..self.block);
        }

        out
    }

    /// Returns `true` when capture rate == target rate (no resampling occurs).
    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_identity() {
        let mut rc = RateConverter::new(16_000, 16_000, 960).unwrap();
        assert!(rc.is_passthrough());
        let samples: Vec<f32> = (0..480).map(|i| i as f32 * 0.001).collect();
        assert_eq!(rc.process(&samples), samples);
    }

    #[test]
    fn ratio_48k_to_16k_correct_length() {
        let mut rc = RateConverter::new(48_000, 16_000, 960).unwrap();
        assert!(!rc.is_passthrough());
        // 960 input samples at 48 kHz → ~320 at 16 kHz
        let out = rc.process(&vec![0.0f32; 960]);
        assert!(!out.is_empty(), "expected non-empty output");
        let expected = 320isize;
        assert!(
            (out.len() as isize - expected).unsigned_abs() <= 10,
            "output len={} expected≈{}",
            out.len(),
            expected
        );
    }

    #[test]
    fn partial_block_carries_to_next_call() {
        let mut rc = RateConverter::new(48_000, 16_000, 960).unwrap();
        // Fewer than one block → nothing output yet
        assert!(rc.process(&vec![0.0f32; 500]).is_empty());
        // Second push crosses the block boundary → output appears
        assert!(!rc.process(&vec![0.0f32; 500]).is_empty());
    }
}
