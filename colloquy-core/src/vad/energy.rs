//! Energy-based VAD using RMS threshold + hangover counter.
//!
//! ## Algorithm
//!
//! 1. Compute normalised RMS of the incoming i16 chunk.
//! 2. If RMS ≥ `threshold` → emit `Speech`, reset hangover counter.
//! 3. If RMS < `threshold` and hangover counter > 0 → emit `Speech`,
//!    decrement counter (prevents clipping syllable endings).
//! 4. Otherwise → emit `Silence`.

use super::{VadDecision, VoiceActivityDetector};
use crate::buffering::chunk::AudioChunk;

/// A simple energy-based voice activity detector.
#[derive(Debug, Clone)]
pub struct EnergyVad {
    /// Normalised RMS threshold. Chunks above this are considered speech.
    /// Typical range: 0.01–0.05 for a quiet microphone.
    threshold: f32,
    /// How many consecutive below-threshold chunks to still emit `Speech`
    /// after real speech ends (prevents clipping word endings).
    hangover_chunks: u32,
    /// Current hangover countdown.
    hangover_counter: u32,
}

impl EnergyVad {
    /// Create a new `EnergyVad`.
    ///
    /// # Parameters
    /// - `threshold`: normalised RMS level above which a chunk is speech.
    ///   Default: `0.02`.
    /// - `hangover_chunks`: number of silent chunks to extend speech
    ///   detection. Default: `8` (≈ 160 ms at a 20 ms chunk stride).
    pub fn new(threshold: f32, hangover_chunks: u32) -> Self {
        Self {
            threshold,
            hangover_chunks,
            hangover_counter: 0,
        }
    }

    /// Root-mean-square of an i16 slice, normalised into [0.0, 1.0].
    fn rms(samples: &[i16]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f64 = samples
            .iter()
            .map(|s| {
                let v = *s as f64 / i16::MAX as f64;
                v * v
            })
            .sum();
        (sum_sq / samples.len() as f64).sqrt() as f32
    }
}

impl Default for EnergyVad {
    fn default() -> Self {
        Self::new(0.02, 8)
    }
}

impl VoiceActivityDetector for EnergyVad {
    fn classify(&mut self, chunk: &AudioChunk) -> VadDecision {
        let rms = Self::rms(&chunk.samples);

        if rms >= self.threshold {
            // Active speech detected — reset hangover
            self.hangover_counter = self.hangover_chunks;
            VadDecision::Speech
        } else if self.hangover_counter > 0 {
            // Within hangover window — still report speech
            self.hangover_counter -= 1;
            VadDecision::Speech
        } else {
            VadDecision::Silence
        }
    }

    fn reset(&mut self) {
        self.hangover_counter = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::chunk::AudioChunk;
    use approx::assert_relative_eq;

    fn silent_chunk(len: usize) -> AudioChunk {
        AudioChunk::new(vec![0i16; len], 16_000)
    }

    fn loud_chunk(amplitude: i16, len: usize) -> AudioChunk {
        AudioChunk::new(vec![amplitude; len], 16_000)
    }

    #[test]
    fn silence_below_threshold() {
        let mut vad = EnergyVad::new(0.02, 0);
        let chunk = silent_chunk(320);
        assert_eq!(vad.classify(&chunk), VadDecision::Silence);
    }

    #[test]
    fn speech_above_threshold() {
        let mut vad = EnergyVad::new(0.02, 0);
        let chunk = loud_chunk(16_000, 320);
        assert_eq!(vad.classify(&chunk), VadDecision::Speech);
    }

    #[test]
    fn hangover_extends_speech() {
        let mut vad = EnergyVad::new(0.02, 3);

        // One loud chunk triggers speech
        assert_eq!(vad.classify(&loud_chunk(16_000, 320)), VadDecision::Speech);

        // Next 3 silent chunks should still be Speech (hangover)
        assert_eq!(vad.classify(&silent_chunk(320)), VadDecision::Speech);
        assert_eq!(vad.classify(&silent_chunk(320)), VadDecision::Speech);
        assert_eq!(vad.classify(&silent_chunk(320)), VadDecision::Speech);

        // 4th silent chunk: hangover exhausted → Silence
        assert_eq!(vad.classify(&silent_chunk(320)), VadDecision::Silence);
    }

    #[test]
    fn reset_clears_hangover() {
        let mut vad = EnergyVad::new(0.02, 5);
        vad.classify(&loud_chunk(16_000, 320));
        vad.reset();
        // After reset, next silent chunk should be Silence immediately
        assert_eq!(vad.classify(&silent_chunk(320)), VadDecision::Silence);
    }

    #[test]
    fn empty_chunk_is_silence() {
        let mut vad = EnergyVad::default();
        let chunk = AudioChunk::new(vec![], 16_000);
        assert_eq!(vad.classify(&chunk), VadDecision::Silence);
    }

    #[test]
    fn rms_of_half_scale_square_wave() {
        // A square wave at ±half scale should have RMS ≈ 0.5
        let samples: Vec<i16> = (0..256)
            .map(|i| if i % 2 == 0 { i16::MAX / 2 } else { -(i16::MAX / 2) })
            .collect();
        let rms = EnergyVad::rms(&samples);
        assert_relative_eq!(rms, 0.5, epsilon = 1e-3);
    }
}
