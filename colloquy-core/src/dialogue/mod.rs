//! Dialogue loop: conversation state, completion retries, reply fan-out.
//!
//! ## Loop shape (per queued utterance)
//!
//! ```text
//! 1. Append the transcript as a `user` turn
//! 2. Acquire a credential from the KeyPool
//! 3. Call the completion boundary with the full conversation
//!    - RateLimited  → report_failure + new credential, attempt NOT consumed
//!    - Transient    → bounded retries with a fixed delay
//! 4. Append the reply (or the fixed fallback) as an `assistant` turn
//! 5. Publish to the display sink, then hand to the speech slot
//! ```
//!
//! The loop runs as a blocking worker and terminates only when the
//! utterance channel disconnects (the segmentation worker drops its sender
//! on stop) or the key pool closes mid-acquire.

pub mod completion;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::{
    dialogue::completion::{CompletionClient, CompletionError, CompletionParams},
    engine::worker::PipelineDiagnostics,
    error::ColloquyError,
    events::DisplayEvent,
    keypool::KeyPool,
    speech::SpeechSlot,
};

/// Speaker of one conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One `{role, content}` entry of the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

/// Append-only conversation transcript.
///
/// The first turn is always the system prompt; only the dialogue loop
/// appends. Unbounded growth over the process lifetime is accepted —
/// trimming/summarisation is out of scope.
#[derive(Debug, Clone)]
pub struct ConversationState {
    turns: Vec<Turn>,
}

impl ConversationState {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            turns: vec![Turn {
                role: Role::System,
                content: system_prompt.into(),
            }],
        }
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.turns.push(Turn {
            role: Role::User,
            content: content.into(),
        });
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.turns.push(Turn {
            role: Role::Assistant,
            content: content.into(),
        });
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }
}

/// Reply used when the completion service stays unavailable through every
/// retry attempt.
pub const SERVICE_UNAVAILABLE_REPLY: &str =
    "Sorry, the service is currently unavailable. Please try again later.";

/// Retry policy for transient completion failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Completion attempts before giving up on one utterance.
    pub attempts: u32,
    /// Fixed delay between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(5),
        }
    }
}

/// All context the dialogue worker needs, passed as one struct.
pub struct DialogueContext {
    pub conversation: ConversationState,
    pub completion: Arc<dyn CompletionClient>,
    pub keys: Arc<KeyPool>,
    pub speech: SpeechSlot,
    /// Voice/language hint forwarded to the speech renderer.
    pub voice: String,
    pub retry: RetryPolicy,
    pub params: CompletionParams,
    pub utterance_rx: Receiver<String>,
    pub display_tx: broadcast::Sender<DisplayEvent>,
    pub seq: Arc<AtomicU64>,
    pub diagnostics: Arc<PipelineDiagnostics>,
}

enum Outcome {
    Reply(String),
    GaveUp,
    PoolClosed,
}

/// Run the blocking dialogue loop until the utterance channel disconnects.
pub fn run(mut ctx: DialogueContext) {
    info!("dialogue loop started");

    while let Ok(text) = ctx.utterance_rx.recv() {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }

        ctx.conversation.push_user(trimmed);

        let reply = match complete_with_rotation(&mut ctx) {
            Outcome::Reply(reply) => reply,
            Outcome::GaveUp => {
                ctx.diagnostics
                    .fallback_replies
                    .fetch_add(1, Ordering::Relaxed);
                SERVICE_UNAVAILABLE_REPLY.to_owned()
            }
            Outcome::PoolClosed => {
                info!("key pool closed — dialogue loop exiting");
                break;
            }
        };

        ctx.conversation.push_assistant(reply.clone());
        publish(&ctx, &reply, false);
        ctx.speech.speak(&reply, &ctx.voice);
    }

    info!(
        turns = ctx.conversation.turns().len(),
        "dialogue loop stopped"
    );
}

/// One completion round for the current conversation tail.
///
/// Rate-limited credentials rotate without consuming a retry attempt; only
/// transient failures count against `retry.attempts`.
fn complete_with_rotation(ctx: &mut DialogueContext) -> Outcome {
    let mut attempt = 0;

    while attempt < ctx.retry.attempts {
        let lease = match ctx.keys.acquire() {
            Ok(lease) => lease,
            Err(ColloquyError::PoolClosed) => return Outcome::PoolClosed,
            Err(e) => {
                error!(error = %e, "credential acquisition failed");
                return Outcome::GaveUp;
            }
        };

        ctx.diagnostics
            .completion_calls
            .fetch_add(1, Ordering::Relaxed);

        match ctx
            .completion
            .complete(&lease.secret, ctx.conversation.turns(), &ctx.params)
        {
            Ok(reply) => return Outcome::Reply(reply),
            Err(CompletionError::RateLimited) => {
                ctx.keys.report_failure(lease.id);
                ctx.diagnostics.rotations.fetch_add(1, Ordering::Relaxed);
                info!("credential rate limited — rotating to another key");
            }
            Err(CompletionError::Transient(detail)) => {
                attempt += 1;
                warn!(
                    attempt,
                    max_attempts = ctx.retry.attempts,
                    detail = %detail,
                    "completion attempt failed"
                );
                if attempt < ctx.retry.attempts {
                    std::thread::sleep(ctx.retry.delay);
                }
            }
        }
    }

    Outcome::GaveUp
}

fn publish(ctx: &DialogueContext, text: &str, is_user: bool) {
    let seq = ctx.seq.fetch_add(1, Ordering::Relaxed);
    let _ = ctx.display_tx.send(DisplayEvent {
        seq,
        text: text.to_owned(),
        is_user,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;
    use std::thread;
    use std::time::Instant;

    use parking_lot::Mutex;
    use tokio::sync::broadcast::error::TryRecvError;

    use crate::keypool::RotationLimits;
    use crate::speech::{NullRenderer, SpeechRenderer};

    /// Completion client that replays a script and records every call.
    struct ScriptedCompletion {
        script: Mutex<VecDeque<std::result::Result<String, CompletionError>>>,
        calls: Mutex<Vec<(String, usize)>>,
    }

    impl ScriptedCompletion {
        fn new(script: Vec<std::result::Result<String, CompletionError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(String, usize)> {
            self.calls.lock().clone()
        }
    }

    impl CompletionClient for ScriptedCompletion {
        fn complete(
            &self,
            secret: &str,
            turns: &[Turn],
            _params: &CompletionParams,
        ) -> std::result::Result<String, CompletionError> {
            self.calls.lock().push((secret.to_owned(), turns.len()));
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(CompletionError::Transient("script exhausted".into())))
        }
    }

    fn pool(secrets: &[&str]) -> Arc<KeyPool> {
        Arc::new(
            KeyPool::new(
                secrets.to_vec(),
                RotationLimits {
                    max_requests_per_window: 100,
                    window_length: Duration::from_secs(60),
                    cooldown_length: Duration::from_secs(60),
                },
            )
            .unwrap(),
        )
    }

    fn context(
        completion: Arc<ScriptedCompletion>,
        keys: Arc<KeyPool>,
        retry: RetryPolicy,
    ) -> (
        DialogueContext,
        crossbeam_channel::Sender<String>,
        broadcast::Receiver<DisplayEvent>,
    ) {
        let (tx, rx) = crossbeam_channel::bounded(8);
        let (display_tx, display_rx) = broadcast::channel(32);
        let ctx = DialogueContext {
            conversation: ConversationState::new("you are a test assistant"),
            completion,
            keys,
            speech: SpeechSlot::new(Arc::new(NullRenderer)),
            voice: "en".into(),
            retry,
            params: CompletionParams::default(),
            utterance_rx: rx,
            display_tx,
            seq: Arc::new(AtomicU64::new(0)),
            diagnostics: Arc::new(PipelineDiagnostics::default()),
        };
        (ctx, tx, display_rx)
    }

    fn recv_event_with_timeout(
        rx: &mut broadcast::Receiver<DisplayEvent>,
        timeout: Duration,
    ) -> DisplayEvent {
        let start = Instant::now();
        loop {
            match rx.try_recv() {
                Ok(ev) => return ev,
                Err(TryRecvError::Empty) => {
                    if start.elapsed() >= timeout {
                        panic!("timed out waiting for display event");
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Closed) => panic!("display channel closed unexpectedly"),
            }
        }
    }

    fn assert_no_event_for(rx: &mut broadcast::Receiver<DisplayEvent>, timeout: Duration) {
        let start = Instant::now();
        loop {
            match rx.try_recv() {
                Ok(ev) => panic!("expected no event, got {:?}", ev),
                Err(TryRecvError::Empty) => {
                    if start.elapsed() >= timeout {
                        return;
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Closed) => return,
            }
        }
    }

    #[test]
    fn rate_limits_rotate_keys_without_consuming_attempts() {
        let completion = ScriptedCompletion::new(vec![
            Err(CompletionError::RateLimited),
            Err(CompletionError::RateLimited),
            Ok("all good".into()),
        ]);
        let keys = pool(&["a", "b", "c"]);
        // attempts = 1: if a rotation consumed an attempt, the script could
        // never reach its successful third call
        let retry = RetryPolicy {
            attempts: 1,
            delay: Duration::from_millis(1),
        };
        let (mut ctx, _tx, _display_rx) = context(Arc::clone(&completion), keys, retry);
        ctx.conversation.push_user("hello");

        let outcome = complete_with_rotation(&mut ctx);

        assert!(matches!(outcome, Outcome::Reply(reply) if reply == "all good"));
        let secrets: Vec<String> = completion.calls().into_iter().map(|(s, _)| s).collect();
        assert_eq!(secrets, ["a", "b", "c"], "each rate limit rotated the key");
        assert_eq!(ctx.diagnostics.rotations.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn transient_failures_exhaust_bounded_attempts_with_delay() {
        let completion = ScriptedCompletion::new(vec![
            Err(CompletionError::Transient("500".into())),
            Err(CompletionError::Transient("500".into())),
            Err(CompletionError::Transient("500".into())),
        ]);
        let keys = pool(&["a"]);
        let retry = RetryPolicy {
            attempts: 3,
            delay: Duration::from_millis(20),
        };
        let (mut ctx, _tx, _display_rx) = context(Arc::clone(&completion), keys, retry);
        ctx.conversation.push_user("hello");

        let started = Instant::now();
        let outcome = complete_with_rotation(&mut ctx);
        let elapsed = started.elapsed();

        assert!(matches!(outcome, Outcome::GaveUp));
        assert_eq!(completion.calls().len(), 3, "exactly three attempts");
        assert!(
            elapsed >= Duration::from_millis(40),
            "two inter-attempt delays expected, elapsed {elapsed:?}"
        );
    }

    #[test]
    fn run_appends_turns_and_publishes_replies_in_order() {
        let completion =
            ScriptedCompletion::new(vec![Ok("first reply".into()), Ok("second reply".into())]);
        let keys = pool(&["a"]);
        let (ctx, tx, mut display_rx) = context(
            Arc::clone(&completion),
            keys,
            RetryPolicy {
                attempts: 3,
                delay: Duration::from_millis(1),
            },
        );

        let worker = thread::spawn(move || run(ctx));
        tx.send("one".into()).unwrap();
        tx.send("two".into()).unwrap();
        drop(tx); // end-of-input sentinel
        worker.join().expect("dialogue worker panicked");

        let first = recv_event_with_timeout(&mut display_rx, Duration::from_secs(1));
        let second = recv_event_with_timeout(&mut display_rx, Duration::from_secs(1));
        assert_eq!(first.text, "first reply");
        assert!(!first.is_user);
        assert_eq!(second.text, "second reply");
        assert!(first.seq < second.seq);

        // Each call saw the conversation grown by one user+assistant pair:
        // [system, user] then [system, user, assistant, user]
        let turn_counts: Vec<usize> = completion.calls().into_iter().map(|(_, n)| n).collect();
        assert_eq!(turn_counts, [2, 4]);
    }

    #[test]
    fn exhausted_retries_publish_the_fallback_reply_exactly_once() {
        let completion = ScriptedCompletion::new(vec![
            Err(CompletionError::Transient("down".into())),
            Err(CompletionError::Transient("down".into())),
        ]);
        let keys = pool(&["a"]);
        let (ctx, tx, mut display_rx) = context(
            Arc::clone(&completion),
            keys,
            RetryPolicy {
                attempts: 2,
                delay: Duration::from_millis(1),
            },
        );
        let diagnostics = Arc::clone(&ctx.diagnostics);

        let worker = thread::spawn(move || run(ctx));
        tx.send("hello".into()).unwrap();
        drop(tx);
        worker.join().expect("dialogue worker panicked");

        let event = recv_event_with_timeout(&mut display_rx, Duration::from_secs(1));
        assert_eq!(event.text, SERVICE_UNAVAILABLE_REPLY);
        assert!(!event.is_user);
        assert_no_event_for(&mut display_rx, Duration::from_millis(50));
        assert_eq!(diagnostics.fallback_replies.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn blank_utterances_are_skipped() {
        let completion = ScriptedCompletion::new(vec![Ok("reply".into())]);
        let keys = pool(&["a"]);
        let (ctx, tx, _display_rx) = context(Arc::clone(&completion), keys, RetryPolicy::default());

        let worker = thread::spawn(move || run(ctx));
        tx.send("   ".into()).unwrap();
        tx.send("real question".into()).unwrap();
        drop(tx);
        worker.join().expect("dialogue worker panicked");

        let calls = completion.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, 2, "only [system, user] reached the boundary");
    }

    #[test]
    fn closed_pool_ends_the_loop_without_a_fallback() {
        let completion = ScriptedCompletion::new(vec![]);
        let keys = pool(&["a"]);
        keys.close();
        let (ctx, tx, mut display_rx) = context(Arc::clone(&completion), keys, RetryPolicy::default());

        let worker = thread::spawn(move || run(ctx));
        tx.send("hello".into()).unwrap();
        drop(tx);
        worker.join().expect("dialogue worker panicked");

        assert!(completion.calls().is_empty());
        assert_no_event_for(&mut display_rx, Duration::from_millis(50));
    }

    #[test]
    fn replies_are_handed_to_the_speech_slot() {
        struct Recorder {
            spoken: Arc<Mutex<Vec<String>>>,
        }
        impl SpeechRenderer for Recorder {
            fn render(
                &self,
                text: &str,
                _voice: &str,
                _cancel: &std::sync::atomic::AtomicBool,
            ) -> crate::error::Result<()> {
                self.spoken.lock().push(text.to_owned());
                Ok(())
            }
        }

        let spoken = Arc::new(Mutex::new(Vec::new()));
        let completion = ScriptedCompletion::new(vec![Ok("spoken reply".into())]);
        let keys = pool(&["a"]);
        let (mut ctx, tx, _display_rx) =
            context(Arc::clone(&completion), keys, RetryPolicy::default());
        ctx.speech = SpeechSlot::new(Arc::new(Recorder {
            spoken: Arc::clone(&spoken),
        }));

        let worker = thread::spawn(move || run(ctx));
        tx.send("say something".into()).unwrap();
        drop(tx);
        worker.join().expect("dialogue worker panicked");

        // run() drops ctx.speech, which joins the playback thread
        assert_eq!(spoken.lock().clone(), vec!["spoken reply"]);
    }

    #[test]
    fn conversation_state_starts_with_the_system_turn() {
        let mut convo = ConversationState::new("system prompt");
        convo.push_user("question");
        convo.push_assistant("answer");

        let turns = convo.turns();
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0].role, Role::System);
        assert_eq!(turns[1].role, Role::User);
        assert_eq!(turns[2].role, Role::Assistant);
    }

    #[test]
    fn turns_serialize_with_lowercase_roles() {
        let turn = Turn {
            role: Role::Assistant,
            content: "hi".into(),
        };
        let json = serde_json::to_value(&turn).expect("serialize turn");
        assert_eq!(json["role"], "assistant");
        assert_eq!(json["content"], "hi");
    }
}
