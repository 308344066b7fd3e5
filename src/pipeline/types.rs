//! Shared types for the inbound content pipeline.

use serde::{Deserialize, Serialize};

use crate::error::DatabaseError;

// ── Inbound mail ────────────────────────────────────────────────────

/// A fetched message normalized for delivery to a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMail {
    /// Display form of the From header (`Name <addr>, ...`).
    pub from: String,
    /// Bare sender addresses, checked against the blocklist.
    pub sender_addresses: Vec<String>,
    /// Display form of the To header.
    pub to: String,
    pub subject: String,
    pub body: String,
    /// Whether `body` is HTML to be sent as a formatted message.
    pub is_html: bool,
    /// Names of attachment parts; their contents are never inlined.
    pub attachment_names: Vec<String>,
}

// ── Outcome ─────────────────────────────────────────────────────────

/// What the pipeline decided for one raw message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// New, allowed, and should be delivered.
    Deliver(InboundMail),
    /// Already seen in this room.
    Duplicate,
    /// Recorded as seen, but a sender matched a blocklist pattern.
    Blocked { pattern: String },
    /// Recorded as seen during a silenced poll.
    Silenced,
    /// Not a parseable message; skipped without a seen record.
    Unparseable,
}

impl Outcome {
    /// Short label for log fields.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Deliver(_) => "deliver",
            Self::Duplicate => "duplicate",
            Self::Blocked { .. } => "blocked",
            Self::Silenced => "silenced",
            Self::Unparseable => "unparseable",
        }
    }
}

/// Outcomes of one poll's messages, in fetch order.
///
/// Processing stops at the first store failure. `outcomes` covers the
/// messages handled before it, which are already recorded as seen and must
/// still be delivered.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub outcomes: Vec<Outcome>,
    pub failure: Option<DatabaseError>,
}

impl BatchOutcome {
    /// All outcomes, or the failure if processing stopped early.
    pub fn into_result(self) -> Result<Vec<Outcome>, DatabaseError> {
        match self.failure {
            Some(e) => Err(e),
            None => Ok(self.outcomes),
        }
    }
}

// ── Dedup strategy ──────────────────────────────────────────────────

/// How the per-room dedup key of a message is derived.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DedupStrategy {
    /// Subject followed by the internal timestamp in unix seconds.
    #[default]
    SubjectTimestamp,
    /// The Message-ID header, falling back to subject and timestamp.
    MessageId,
}
