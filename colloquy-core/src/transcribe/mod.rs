//! Speech recognition boundary.
//!
//! The `SpeechRecognizer` trait decouples the segmentation worker from any
//! specific backend. Recognition is recoverable-by-design: whatever goes
//! wrong at this boundary collapses to an empty transcript, which the
//! pipeline skips silently — one garbled utterance must never stall the
//! conversation.

#[cfg(feature = "http")]
pub mod http;

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::{ColloquyError, Result};
use crate::segment::Utterance;

/// Contract for speech recognition backends.
///
/// `&mut self` intentionally expresses that recognizers may be stateful
/// (session handles, connection reuse). All mutation is serialised through
/// `RecognizerHandle`'s `parking_lot::Mutex`.
pub trait SpeechRecognizer: Send + 'static {
    /// Transcribe one utterance.
    ///
    /// # Parameters
    /// - `utterance`: mono i16 PCM audio.
    /// - `language`: hint such as `"en"` passed through to the service.
    ///
    /// # Returns
    /// Best-effort transcript. Empty or ambiguous recognition yields
    /// `Ok("")` rather than an error.
    fn transcribe(&mut self, utterance: &Utterance, language: &str) -> Result<String>;
}

/// Thread-safe reference-counted handle to any `SpeechRecognizer` implementor.
#[derive(Clone)]
pub struct RecognizerHandle(pub Arc<Mutex<dyn SpeechRecognizer>>);

impl RecognizerHandle {
    /// Wrap any `SpeechRecognizer` in a `RecognizerHandle`.
    pub fn new<R: SpeechRecognizer>(recognizer: R) -> Self {
        Self(Arc::new(Mutex::new(recognizer)))
    }
}

impl std::fmt::Debug for RecognizerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecognizerHandle").finish_non_exhaustive()
    }
}

/// Transcribe, mapping every failure to an empty transcript.
///
/// A service-side error is logged and resolves to `""` — no retry, never
/// propagated. Callers treat an empty result as "no utterance to process".
pub fn transcribe_or_empty(
    handle: &RecognizerHandle,
    utterance: &Utterance,
    language: &str,
) -> String {
    match handle.0.lock().transcribe(utterance, language) {
        Ok(text) => {
            let text = text.trim().to_owned();
            if !text.is_empty() {
                info!(transcript = %text, "utterance transcribed");
            }
            text
        }
        Err(e) => {
            warn!(error = %e, "recognition failed — treating as empty transcript");
            String::new()
        }
    }
}

/// Encode an utterance as a 16-bit mono WAV byte stream for upload.
pub fn wav_bytes(utterance: &Utterance) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: utterance.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| ColloquyError::Recognition(e.to_string()))?;
        for sample in &utterance.samples {
            writer
                .write_sample(*sample)
                .map_err(|e| ColloquyError::Recognition(e.to_string()))?;
        }
        writer
            .finalize()
            .map_err(|e| ColloquyError::Recognition(e.to_string()))?;
    }
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scripted {
        result: Result<String>,
    }

    impl SpeechRecognizer for Scripted {
        fn transcribe(&mut self, _utterance: &Utterance, _language: &str) -> Result<String> {
            match &self.result {
                Ok(text) => Ok(text.clone()),
                Err(_) => Err(ColloquyError::Recognition("scripted failure".into())),
            }
        }
    }

    fn utterance() -> Utterance {
        Utterance {
            samples: vec![0i16; 3200],
            sample_rate: 16_000,
        }
    }

    #[test]
    fn transcript_is_trimmed() {
        let handle = RecognizerHandle::new(Scripted {
            result: Ok("  hello world \n".into()),
        });
        assert_eq!(
            transcribe_or_empty(&handle, &utterance(), "en"),
            "hello world"
        );
    }

    #[test]
    fn errors_resolve_to_empty_transcript() {
        let handle = RecognizerHandle::new(Scripted {
            result: Err(ColloquyError::Recognition("boom".into())),
        });
        assert_eq!(transcribe_or_empty(&handle, &utterance(), "en"), "");
    }

    #[test]
    fn blank_recognition_stays_empty() {
        let handle = RecognizerHandle::new(Scripted {
            result: Ok("   ".into()),
        });
        assert_eq!(transcribe_or_empty(&handle, &utterance(), "en"), "");
    }

    #[test]
    fn wav_encoding_carries_header_and_samples() {
        let utt = Utterance {
            samples: vec![1, -1, 0, i16::MAX],
            sample_rate: 16_000,
        };
        let bytes = wav_bytes(&utt).expect("encode wav");
        assert_eq!(&bytes[..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"WAVE");
        // 44-byte canonical header + 2 bytes per sample
        assert_eq!(bytes.len(), 44 + utt.samples.len() * 2);
    }
}
