//! Cancellable single-slot speech playback.
//!
//! The synthesis engine itself is a boundary collaborator behind
//! [`SpeechRenderer`]. What lives here is the concurrency contract: at most
//! one active playback per process, and starting a new one first signals
//! cancellation of the previous and waits for its acknowledged stop.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::JoinHandle;

use tracing::{debug, warn};

use crate::error::Result;

/// Contract for synthesis + playback backends.
///
/// `render` owns the whole speak path for one reply: synthesize `text` with
/// the given voice/language hint and play it to completion. Implementations
/// MUST poll `cancel` between units of work (frames, sentences) and return
/// promptly once it is set.
pub trait SpeechRenderer: Send + Sync + 'static {
    fn render(&self, text: &str, voice: &str, cancel: &AtomicBool) -> Result<()>;
}

/// Renderer that discards all speech. Used when no audio output is
/// configured, and in tests.
pub struct NullRenderer;

impl SpeechRenderer for NullRenderer {
    fn render(&self, text: &str, _voice: &str, _cancel: &AtomicBool) -> Result<()> {
        debug!(chars = text.len(), "speech discarded (null renderer)");
        Ok(())
    }
}

struct ActivePlayback {
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Single-slot owner of the current playback.
///
/// Owned by the dialogue worker — no lock. `speak` returns as soon as the
/// replacement thread is spawned, so the dialogue loop never waits for
/// playback to finish; it only waits for the *previous* playback to
/// acknowledge cancellation (the thread join). Render errors are logged
/// inside the playback thread and never reach the caller.
pub struct SpeechSlot {
    renderer: Arc<dyn SpeechRenderer>,
    active: Option<ActivePlayback>,
}

impl SpeechSlot {
    pub fn new(renderer: Arc<dyn SpeechRenderer>) -> Self {
        Self {
            renderer,
            active: None,
        }
    }

    /// Start speaking `text`, cancelling any in-progress playback first.
    pub fn speak(&mut self, text: &str, voice: &str) {
        self.cancel_active();

        let cancel = Arc::new(AtomicBool::new(false));
        let renderer = Arc::clone(&self.renderer);
        let flag = Arc::clone(&cancel);
        let text = text.to_owned();
        let voice = voice.to_owned();

        let handle = std::thread::spawn(move || {
            if let Err(e) = renderer.render(&text, &voice, &flag) {
                warn!(error = %e, "speech playback failed");
            }
        });

        self.active = Some(ActivePlayback { cancel, handle });
    }

    /// Cancel the in-progress playback, if any, and wait for it to stop.
    pub fn cancel_active(&mut self) {
        if let Some(playback) = self.active.take() {
            playback.cancel.store(true, Ordering::SeqCst);
            if playback.handle.join().is_err() {
                warn!("speech playback thread panicked");
            }
        }
    }
}

impl Drop for SpeechSlot {
    fn drop(&mut self) {
        self.cancel_active();
    }
}
