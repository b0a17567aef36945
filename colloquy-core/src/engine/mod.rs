//! `ColloquyEngine` — top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! ColloquyEngine::new()
//!     └─► start()    → audio opened (or degraded), both workers spawned,
//!                      status = Listening | Degraded
//!         └─► stop() → running=false, key pool closed, status = Stopped;
//!                      the segment worker drops the utterance sender and
//!                      the dialogue loop drains, then exits
//! ```
//!
//! The engine is one-shot: `start()` after `stop()` is rejected. The key
//! pool is constructed by the caller and handed in — there is no global
//! credential state anywhere in the crate.
//!
//! ## Threading
//!
//! `cpal::Stream` is `!Send` on Windows/macOS (COM / CoreAudio thread
//! affinity). The `AudioSource` is therefore opened *inside* the
//! segmentation worker's `spawn_blocking` closure so it never crosses a
//! thread boundary. A sync oneshot channel propagates the open/degraded
//! outcome back to the `start()` caller.

pub mod worker;

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::info;

use crate::{
    audio::{AudioSource, CaptureConfig},
    dialogue::{
        self,
        completion::{CompletionClient, CompletionParams},
        ConversationState, DialogueContext, RetryPolicy,
    },
    error::{ColloquyError, Result},
    events::{AssistantStatus, AssistantStatusEvent, DisplayEvent},
    keypool::KeyPool,
    speech::{SpeechRenderer, SpeechSlot},
    transcribe::RecognizerHandle,
    vad::{energy::EnergyVad, VoiceActivityDetector},
};

/// Broadcast channel capacity: 256 events buffered for slow consumers.
const BROADCAST_CAP: usize = 256;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful voice assistant. Keep replies short, \
    conversational, and easy to speak aloud.";

/// Configuration for `ColloquyEngine`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Audio capture parameters (rate, chunk duration, preferred device).
    pub capture: CaptureConfig,
    /// Trigger/release smoothing window in milliseconds. Default: 600.
    pub padding_duration_ms: u32,
    /// Fraction of the window that must agree before an utterance triggers
    /// or releases. Default: 0.9.
    pub trigger_ratio: f32,
    /// RMS threshold for the default energy VAD. Default: 0.02.
    pub vad_threshold: f32,
    /// Energy VAD hangover in chunks. Default: 8.
    pub vad_hangover_chunks: u32,
    /// Language hint forwarded to the recognition boundary. Default: "en".
    pub language_hint: String,
    /// Voice/language hint forwarded to the speech renderer. Default: "en".
    pub voice: String,
    /// System prompt seeding every conversation.
    pub system_prompt: String,
    /// Retry policy for transient completion failures.
    pub retry: RetryPolicy,
    /// Model parameters for the completion boundary.
    pub completion: CompletionParams,
    /// Bounded depth of the utterance queue between workers. Default: 32.
    pub utterance_queue_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            padding_duration_ms: 600,
            trigger_ratio: 0.9,
            vad_threshold: 0.02,
            vad_hangover_chunks: 8,
            language_hint: "en".into(),
            voice: "en".into(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            retry: RetryPolicy::default(),
            completion: CompletionParams::default(),
            utterance_queue_depth: 32,
        }
    }
}

impl EngineConfig {
    /// Capacity of the trigger/release window in chunks.
    pub fn padding_chunks(&self) -> usize {
        (self.padding_duration_ms / self.capture.chunk_duration_ms).max(1) as usize
    }
}

/// The top-level engine handle.
///
/// `ColloquyEngine` is `Send + Sync` — all fields use interior mutability.
/// Wrap in `Arc<ColloquyEngine>` to share with event-forwarding tasks.
pub struct ColloquyEngine {
    config: EngineConfig,
    keys: Arc<KeyPool>,
    recognizer: RecognizerHandle,
    completion: Arc<dyn CompletionClient>,
    renderer: Arc<dyn SpeechRenderer>,
    /// `true` while capture + workers are active.
    running: Arc<AtomicBool>,
    /// One-shot guard: set on the first `start()` and never cleared.
    started: AtomicBool,
    status: Arc<Mutex<AssistantStatus>>,
    display_tx: broadcast::Sender<DisplayEvent>,
    status_tx: broadcast::Sender<AssistantStatusEvent>,
    /// Monotonically increasing display-event sequence counter.
    seq: Arc<AtomicU64>,
    diagnostics: Arc<worker::PipelineDiagnostics>,
}

impl ColloquyEngine {
    /// Create a new engine. Does not start capturing — call `start()`.
    ///
    /// The key pool is owned by the engine from here on; `stop()` closes it.
    pub fn new(
        config: EngineConfig,
        keys: KeyPool,
        recognizer: RecognizerHandle,
        completion: Arc<dyn CompletionClient>,
        renderer: Arc<dyn SpeechRenderer>,
    ) -> Self {
        let (display_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);

        Self {
            config,
            keys: Arc::new(keys),
            recognizer,
            completion,
            renderer,
            running: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
            status: Arc::new(Mutex::new(AssistantStatus::Idle)),
            display_tx,
            status_tx,
            seq: Arc::new(AtomicU64::new(0)),
            diagnostics: Arc::new(worker::PipelineDiagnostics::default()),
        }
    }

    /// Start audio capture and both pipeline workers.
    ///
    /// Blocks until the audio source reports open or degraded, then
    /// returns; the workers continue on background blocking threads.
    ///
    /// # Errors
    /// - `ColloquyError::AlreadyRunning` on a second call.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ColloquyError::AlreadyRunning);
        }

        self.running.store(true, Ordering::SeqCst);

        let (utterance_tx, utterance_rx) =
            crossbeam_channel::bounded::<String>(self.config.utterance_queue_depth);

        // Sync oneshot: the segment worker reports whether capture came up
        // live or degraded.
        let (open_tx, open_rx) = std::sync::mpsc::channel::<bool>();

        // ── Segmentation worker ──────────────────────────────────────────
        let config = self.config.clone();
        let recognizer = self.recognizer.clone();
        let running = Arc::clone(&self.running);
        let display_tx = self.display_tx.clone();
        let seq = Arc::clone(&self.seq);
        let diagnostics = Arc::clone(&self.diagnostics);

        tokio::task::spawn_blocking(move || {
            // Open on THIS thread — cpal::Stream is !Send
            let mut source = AudioSource::open(&config.capture, Arc::clone(&running));
            let _ = open_tx.send(source.is_degraded());

            let vad: Box<dyn VoiceActivityDetector> = Box::new(EnergyVad::new(
                config.vad_threshold,
                config.vad_hangover_chunks,
            ));

            worker::run(
                move || source.read_chunk(),
                worker::SegmentContext {
                    config,
                    vad,
                    recognizer,
                    utterance_tx,
                    display_tx,
                    seq,
                    diagnostics,
                },
            );
            // utterance_tx drops here — the dialogue loop's end-of-input
            // sentinel. The audio device is released on this same thread.
        });

        // ── Dialogue worker ──────────────────────────────────────────────
        let ctx = DialogueContext {
            conversation: ConversationState::new(&self.config.system_prompt),
            completion: Arc::clone(&self.completion),
            keys: Arc::clone(&self.keys),
            speech: SpeechSlot::new(Arc::clone(&self.renderer)),
            voice: self.config.voice.clone(),
            retry: self.config.retry,
            params: self.config.completion.clone(),
            utterance_rx,
            display_tx: self.display_tx.clone(),
            seq: Arc::clone(&self.seq),
            diagnostics: Arc::clone(&self.diagnostics),
        };
        tokio::task::spawn_blocking(move || dialogue::run(ctx));

        match open_rx.recv() {
            Ok(true) => {
                self.set_status(
                    AssistantStatus::Degraded,
                    Some("no usable input device — audio capture disabled".into()),
                );
                info!("engine started — degraded (no microphone)");
                Ok(())
            }
            Ok(false) => {
                self.set_status(AssistantStatus::Listening, None);
                info!("engine started — listening");
                Ok(())
            }
            Err(_) => {
                // Channel closed before a message was sent — worker panicked?
                self.running.store(false, Ordering::SeqCst);
                self.keys.close();
                self.set_status(
                    AssistantStatus::Error,
                    Some("segmentation worker failed to start".into()),
                );
                Err(ColloquyError::Other(anyhow::anyhow!(
                    "segmentation worker died during startup"
                )))
            }
        }
    }

    /// Stop capture and let both workers drain.
    ///
    /// Closing the key pool wakes a dialogue loop parked in `acquire`, so
    /// shutdown is never blocked on credential cooldowns.
    ///
    /// # Errors
    /// - `ColloquyError::NotRunning` if not currently running.
    pub fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(ColloquyError::NotRunning);
        }

        self.keys.close();
        self.set_status(AssistantStatus::Stopped, None);
        info!("engine stop requested");
        Ok(())
    }

    /// Current engine status (snapshot).
    pub fn status(&self) -> AssistantStatus {
        *self.status.lock()
    }

    /// Subscribe to conversation display events.
    pub fn subscribe_display(&self) -> broadcast::Receiver<DisplayEvent> {
        self.display_tx.subscribe()
    }

    /// Subscribe to status change events.
    pub fn subscribe_status(&self) -> broadcast::Receiver<AssistantStatusEvent> {
        self.status_tx.subscribe()
    }

    /// Snapshot of pipeline counters for observability.
    pub fn diagnostics_snapshot(&self) -> worker::DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    // ── Internal helpers ─────────────────────────────────────────────────

    fn set_status(&self, new_status: AssistantStatus, detail: Option<String>) {
        *self.status.lock() = new_status;
        let _ = self.status_tx.send(AssistantStatusEvent {
            status: new_status,
            detail,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::dialogue::completion::CompletionError;
    use crate::dialogue::Turn;
    use crate::keypool::RotationLimits;
    use crate::segment::Utterance;
    use crate::speech::NullRenderer;
    use crate::transcribe::SpeechRecognizer;

    struct SilentRecognizer;

    impl SpeechRecognizer for SilentRecognizer {
        fn transcribe(
            &mut self,
            _utterance: &Utterance,
            _language: &str,
        ) -> crate::error::Result<String> {
            Ok(String::new())
        }
    }

    struct EchoCompletion;

    impl CompletionClient for EchoCompletion {
        fn complete(
            &self,
            _secret: &str,
            turns: &[Turn],
            _params: &CompletionParams,
        ) -> std::result::Result<String, CompletionError> {
            Ok(turns.last().map(|t| t.content.clone()).unwrap_or_default())
        }
    }

    fn engine() -> ColloquyEngine {
        let keys = KeyPool::new(["test-key"], RotationLimits::default()).unwrap();
        ColloquyEngine::new(
            EngineConfig::default(),
            keys,
            RecognizerHandle::new(SilentRecognizer),
            Arc::new(EchoCompletion),
            Arc::new(NullRenderer),
        )
    }

    #[test]
    fn stop_before_start_is_rejected() {
        let engine = engine();
        assert!(matches!(engine.stop(), Err(ColloquyError::NotRunning)));
        assert_eq!(engine.status(), AssistantStatus::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn lifecycle_is_one_shot() {
        let engine = engine();
        let mut status_rx = engine.subscribe_status();

        engine.start().expect("first start succeeds");
        assert!(matches!(
            engine.status(),
            AssistantStatus::Listening | AssistantStatus::Degraded
        ));
        assert!(matches!(
            engine.start(),
            Err(ColloquyError::AlreadyRunning)
        ));

        engine.stop().expect("stop succeeds");
        assert_eq!(engine.status(), AssistantStatus::Stopped);
        assert!(matches!(engine.stop(), Err(ColloquyError::NotRunning)));
        assert!(matches!(
            engine.start(),
            Err(ColloquyError::AlreadyRunning)
        ));

        let first = status_rx.recv().await.expect("status event");
        assert!(matches!(
            first.status,
            AssistantStatus::Listening | AssistantStatus::Degraded
        ));
    }

    #[test]
    fn padding_chunks_derives_from_durations() {
        let config = EngineConfig::default();
        assert_eq!(config.padding_chunks(), 30);

        let config = EngineConfig {
            padding_duration_ms: 10,
            ..EngineConfig::default()
        };
        assert_eq!(config.padding_chunks(), 1, "floors at one chunk");
    }
}
