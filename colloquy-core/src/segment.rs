//! Utterance segmentation over a padded trigger/release window.
//!
//! ## Algorithm
//!
//! A bounded window of the last `padding_chunks` classified chunks is
//! maintained at all times. Two states:
//!
//! - **Idle**: chunks only enter the window. When speech-tagged entries
//!   exceed `trigger_ratio × capacity`, the segmenter goes Active, seeding
//!   the utterance with every buffered chunk in arrival order — the window
//!   is what preserves the syllables spoken before the trigger fired.
//! - **Active**: every chunk is appended to the utterance AND pushed into
//!   the window. When non-speech entries exceed `trigger_ratio × capacity`,
//!   the utterance is emitted and the segmenter returns to Idle.
//!
//! Ratios are measured against window *capacity*, so neither transition can
//! fire before the window has seen enough chunks. Emission is the only
//! observable side effect; utterances come out in strict arrival order and
//! are never split or merged. A partially accumulated utterance is simply
//! dropped with the segmenter — stop never flushes.

use std::collections::VecDeque;

use tracing::debug;

use crate::buffering::chunk::AudioChunk;

/// One continuous speech segment bounded by silence on both sides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    /// Concatenated mono i16 PCM of every chunk between trigger and release.
    pub samples: Vec<i16>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
}

impl Utterance {
    /// Returns the duration of this utterance in milliseconds.
    pub fn duration_ms(&self) -> f64 {
        self.samples.len() as f64 * 1000.0 / self.sample_rate as f64
    }
}

/// Bounded FIFO of the most recent `(chunk, is_speech)` pairs.
///
/// Overwrites the oldest entry when full. Voiced/unvoiced counts are
/// tracked incrementally so trigger checks stay O(1) per chunk.
pub struct PaddingWindow {
    entries: VecDeque<(AudioChunk, bool)>,
    capacity: usize,
    voiced: usize,
}

impl PaddingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            voiced: 0,
        }
    }

    pub fn push(&mut self, chunk: AudioChunk, is_speech: bool) {
        if self.entries.len() == self.capacity {
            if let Some((_, dropped_speech)) = self.entries.pop_front() {
                if dropped_speech {
                    self.voiced -= 1;
                }
            }
        }
        if is_speech {
            self.voiced += 1;
        }
        self.entries.push_back((chunk, is_speech));
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Count of speech-tagged entries currently buffered.
    pub fn voiced(&self) -> usize {
        self.voiced
    }

    /// Count of non-speech entries currently buffered.
    pub fn unvoiced(&self) -> usize {
        self.entries.len() - self.voiced
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.voiced = 0;
    }

    /// Remove and return all buffered chunks in arrival order.
    fn drain_chunks(&mut self) -> Vec<AudioChunk> {
        self.voiced = 0;
        self.entries.drain(..).map(|(chunk, _)| chunk).collect()
    }
}

/// Idle/Active utterance state machine.
///
/// Feed one classified chunk at a time via [`push`](Self::push); a
/// completed utterance is returned from the call that observed its release.
/// The caller owns pacing and cancellation — dropping or
/// [`reset`](Self::reset)ting the segmenter discards any partial utterance.
pub struct UtteranceSegmenter {
    window: PaddingWindow,
    trigger_ratio: f32,
    active: bool,
    samples: Vec<i16>,
    sample_rate: u32,
}

impl UtteranceSegmenter {
    /// # Parameters
    /// - `padding_chunks`: window capacity, `padding_duration_ms /
    ///   chunk_duration_ms` (e.g. 600 / 20 = 30).
    /// - `trigger_ratio`: fraction of the window that must agree before a
    ///   transition fires (e.g. 0.9).
    pub fn new(padding_chunks: usize, trigger_ratio: f32) -> Self {
        Self {
            window: PaddingWindow::new(padding_chunks),
            trigger_ratio,
            active: false,
            samples: Vec::new(),
            sample_rate: 16_000,
        }
    }

    /// `true` while an utterance is being accumulated.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Advance the state machine by one classified chunk.
    ///
    /// Returns the completed utterance on the chunk whose arrival satisfied
    /// the release condition, `None` otherwise.
    pub fn push(&mut self, chunk: AudioChunk, is_speech: bool) -> Option<Utterance> {
        let threshold = self.trigger_ratio * self.window.capacity() as f32;

        if !self.active {
            self.window.push(chunk, is_speech);
            if self.window.voiced() as f32 > threshold {
                self.active = true;
                for buffered in self.window.drain_chunks() {
                    self.sample_rate = buffered.sample_rate;
                    self.samples.extend_from_slice(&buffered.samples);
                }
                debug!(
                    seeded_samples = self.samples.len(),
                    "utterance triggered"
                );
            }
            None
        } else {
            self.sample_rate = chunk.sample_rate;
            self.samples.extend_from_slice(&chunk.samples);
            self.window.push(chunk, is_speech);
            if self.window.unvoiced() as f32 > threshold {
                self.active = false;
                self.window.clear();
                let samples = std::mem::take(&mut self.samples);
                debug!(samples = samples.len(), "utterance released");
                return Some(Utterance {
                    samples,
                    sample_rate: self.sample_rate,
                });
            }
            None
        }
    }

    /// Discard any partial utterance and buffered window state.
    pub fn reset(&mut self) {
        self.active = false;
        self.samples.clear();
        self.window.clear();
    }
}
