//! Blocking segmentation worker.
//!
//! ## Worker stages (per chunk)
//!
//! ```text
//! 1. Pull one fixed-duration chunk from the audio source
//!    (returns None once the stop flag clears — checked every chunk)
//! 2. VAD classify → Speech | Silence
//! 3. Feed the segmenter; most chunks return immediately
//! 4. On a released utterance: transcribe_or_empty
//!    - empty transcript → skip silently
//!    - text → publish a user DisplayEvent, enqueue for the dialogue loop
//! ```
//!
//! The worker runs in `spawn_blocking`, keeping the Tokio executor free.
//! When it returns, the utterance sender drops — that disconnect is the
//! end-of-input sentinel the dialogue loop terminates on. A partially
//! accumulated utterance is discarded with the segmenter, never flushed.

use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use crossbeam_channel::Sender;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    buffering::chunk::AudioChunk,
    engine::EngineConfig,
    events::DisplayEvent,
    segment::UtteranceSegmenter,
    transcribe::{transcribe_or_empty, RecognizerHandle},
    vad::VoiceActivityDetector,
};

/// Shared pipeline counters, written by both workers.
#[derive(Debug, Default)]
pub struct PipelineDiagnostics {
    pub chunks_in: AtomicUsize,
    pub speech_chunks: AtomicUsize,
    pub utterances_emitted: AtomicUsize,
    pub empty_transcripts: AtomicUsize,
    pub transcripts_enqueued: AtomicUsize,
    pub completion_calls: AtomicUsize,
    pub rotations: AtomicUsize,
    pub fallback_replies: AtomicUsize,
}

impl PipelineDiagnostics {
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            chunks_in: self.chunks_in.load(Ordering::Relaxed),
            speech_chunks: self.speech_chunks.load(Ordering::Relaxed),
            utterances_emitted: self.utterances_emitted.load(Ordering::Relaxed),
            empty_transcripts: self.empty_transcripts.load(Ordering::Relaxed),
            transcripts_enqueued: self.transcripts_enqueued.load(Ordering::Relaxed),
            completion_calls: self.completion_calls.load(Ordering::Relaxed),
            rotations: self.rotations.load(Ordering::Relaxed),
            fallback_replies: self.fallback_replies.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DiagnosticsSnapshot {
    pub chunks_in: usize,
    pub speech_chunks: usize,
    pub utterances_emitted: usize,
    pub empty_transcripts: usize,
    pub transcripts_enqueued: usize,
    pub completion_calls: usize,
    pub rotations: usize,
    pub fallback_replies: usize,
}

/// All context the segmentation worker needs, passed as one struct.
pub struct SegmentContext {
    pub config: EngineConfig,
    pub vad: Box<dyn VoiceActivityDetector>,
    pub recognizer: RecognizerHandle,
    pub utterance_tx: Sender<String>,
    pub display_tx: broadcast::Sender<DisplayEvent>,
    pub seq: Arc<AtomicU64>,
    pub diagnostics: Arc<PipelineDiagnostics>,
}

/// Run the blocking segmentation worker until `next_chunk` returns `None`.
///
/// `next_chunk` is typically [`crate::audio::AudioSource::read_chunk`]; it
/// owns both pacing and stop-flag observation.
pub fn run<F>(mut next_chunk: F, mut ctx: SegmentContext)
where
    F: FnMut() -> Option<AudioChunk>,
{
    info!(
        padding_chunks = ctx.config.padding_chunks(),
        trigger_ratio = ctx.config.trigger_ratio,
        "segmentation worker started"
    );

    let mut segmenter =
        UtteranceSegmenter::new(ctx.config.padding_chunks(), ctx.config.trigger_ratio);

    while let Some(chunk) = next_chunk() {
        ctx.diagnostics.chunks_in.fetch_add(1, Ordering::Relaxed);

        let is_speech = ctx.vad.classify(&chunk).is_speech();
        if is_speech {
            ctx.diagnostics.speech_chunks.fetch_add(1, Ordering::Relaxed);
        }

        let Some(utterance) = segmenter.push(chunk, is_speech) else {
            continue;
        };

        ctx.diagnostics
            .utterances_emitted
            .fetch_add(1, Ordering::Relaxed);
        ctx.vad.reset();
        debug!(
            duration_ms = utterance.duration_ms(),
            "utterance complete — transcribing"
        );

        let text = transcribe_or_empty(&ctx.recognizer, &utterance, &ctx.config.language_hint);
        if text.is_empty() {
            // Nothing recognisable — skip silently
            ctx.diagnostics
                .empty_transcripts
                .fetch_add(1, Ordering::Relaxed);
            continue;
        }

        let seq = ctx.seq.fetch_add(1, Ordering::Relaxed);
        let _ = ctx.display_tx.send(DisplayEvent {
            seq,
            text: text.clone(),
            is_user: true,
        });

        if ctx.utterance_tx.send(text).is_err() {
            warn!("dialogue queue disconnected — stopping segmentation");
            break;
        }
        ctx.diagnostics
            .transcripts_enqueued
            .fetch_add(1, Ordering::Relaxed);
    }

    let snap = ctx.diagnostics.snapshot();
    info!(
        chunks_in = snap.chunks_in,
        speech_chunks = snap.speech_chunks,
        utterances_emitted = snap.utterances_emitted,
        empty_transcripts = snap.empty_transcripts,
        transcripts_enqueued = snap.transcripts_enqueued,
        "segmentation worker stopped — diagnostics"
    );
}
