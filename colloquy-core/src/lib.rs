//! # colloquy-core
//!
//! Reusable voice-conversation engine SDK.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → AudioSource → fixed 20 ms AudioChunks
//!                   │
//!             VAD classify → UtteranceSegmenter (padded trigger/release)
//!                   │
//!             Utterance → SpeechRecognizer
//!                   │
//!          bounded utterance queue → dialogue loop ──► KeyPool (rotation)
//!                   │                      │
//!                   │                      ├─► broadcast<DisplayEvent>
//!                   │                      └─► SpeechSlot (cancellable TTS)
//! ```
//!
//! Each stage runs as an independent blocking worker; stages hand data off
//! by value over queues. The only cross-cutting shared state is the
//! credential pool, which serializes every access behind its own lock.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod dialogue;
pub mod engine;
pub mod error;
pub mod events;
pub mod keypool;
pub mod segment;
pub mod speech;
pub mod transcribe;
pub mod vad;

// Convenience re-exports for downstream crates
pub use dialogue::{
    completion::{CompletionClient, CompletionError, CompletionParams},
    ConversationState, RetryPolicy, Role, Turn, SERVICE_UNAVAILABLE_REPLY,
};
pub use engine::{ColloquyEngine, EngineConfig};
pub use error::ColloquyError;
pub use events::{AssistantStatus, AssistantStatusEvent, DisplayEvent};
pub use keypool::{KeyId, KeyPool, LeasedKey, RotationLimits};
pub use segment::{Utterance, UtteranceSegmenter};
pub use speech::{NullRenderer, SpeechRenderer, SpeechSlot};
pub use transcribe::{RecognizerHandle, SpeechRecognizer};

#[cfg(feature = "http")]
pub use dialogue::completion::HttpCompletionClient;

#[cfg(feature = "http")]
pub use transcribe::http::HttpRecognizer;
