//! Event types broadcast to engine subscribers.
//!
//! Hosts subscribe via [`crate::engine::ColloquyEngine::subscribe_display`]
//! and forward these to whatever surface they drive (terminal echo, web
//! socket, …). Field names serialize in camelCase so a JSON consumer sees
//! `{ "text": …, "isUser": … }` unchanged.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Display events
// ---------------------------------------------------------------------------

/// One line of the conversation, emitted in generation order.
///
/// User lines come from the segmentation worker as soon as a transcript is
/// accepted; assistant lines come from the dialogue worker after the
/// completion call resolves.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    /// The text to show.
    pub text: String,
    /// `true` for a transcribed user utterance, `false` for an assistant reply.
    pub is_user: bool,
}

// ---------------------------------------------------------------------------
// Status events
// ---------------------------------------------------------------------------

/// Emitted whenever the engine state changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantStatusEvent {
    pub status: AssistantStatus,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

/// Current state of the Colloquy engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssistantStatus {
    /// Engine created but `start()` not yet called.
    Idle,
    /// Actively capturing audio and holding a conversation.
    Listening,
    /// Running without a microphone (no usable input device was found).
    Degraded,
    /// Stop requested; workers are draining.
    Stopped,
    /// Unrecoverable startup error.
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_event_serializes_with_camel_case_fields() {
        let event = DisplayEvent {
            seq: 4,
            text: "hello there".into(),
            is_user: true,
        };

        let json = serde_json::to_value(&event).expect("serialize display event");
        assert_eq!(json["seq"], 4);
        assert_eq!(json["text"], "hello there");
        assert_eq!(json["isUser"], true);

        let round_trip: DisplayEvent =
            serde_json::from_value(json).expect("deserialize display event");
        assert_eq!(round_trip.seq, 4);
        assert!(round_trip.is_user);
    }

    #[test]
    fn status_event_serializes_with_lowercase_status() {
        let event = AssistantStatusEvent {
            status: AssistantStatus::Degraded,
            detail: Some("no input device".into()),
        };

        let json = serde_json::to_value(&event).expect("serialize status event");
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["detail"], "no input device");

        let round_trip: AssistantStatusEvent =
            serde_json::from_value(json).expect("deserialize status event");
        assert_eq!(round_trip.status, AssistantStatus::Degraded);
        assert_eq!(round_trip.detail.as_deref(), Some("no input device"));
    }

    #[test]
    fn status_rejects_non_lowercase_values() {
        let invalid = r#""Listening""#;
        let err = serde_json::from_str::<AssistantStatus>(invalid);
        assert!(err.is_err(), "expected invalid casing to fail");
    }
}
