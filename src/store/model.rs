//! Persisted entities: rooms, mail accounts, drafts and their attachments.

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

/// A chat room bridged to mail accounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    /// Internal row id.
    pub id: i64,
    /// Opaque identity from the chat protocol.
    pub key: String,
    pub poll_interval_secs: u64,
    /// Deliver HTML bodies as formatted messages instead of plain text.
    pub html_enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// Credentials for retrieving mail (IMAP).
#[derive(Debug, Clone)]
pub struct InboundAccount {
    pub id: i64,
    pub room_id: i64,
    /// `host:port`.
    pub host: String,
    pub username: String,
    pub secret: SecretString,
    pub mailbox: String,
    /// Verify the server certificate.
    pub verify_tls: bool,
}

/// Fields needed to create an [`InboundAccount`].
#[derive(Debug, Clone)]
pub struct NewInboundAccount {
    pub host: String,
    pub username: String,
    pub secret: SecretString,
    pub mailbox: String,
    pub verify_tls: bool,
}

/// Credentials for submitting mail (SMTP).
#[derive(Debug, Clone)]
pub struct OutboundAccount {
    pub id: i64,
    pub room_id: i64,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub secret: SecretString,
    pub verify_tls: bool,
}

/// Fields needed to create an [`OutboundAccount`].
#[derive(Debug, Clone)]
pub struct NewOutboundAccount {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub secret: SecretString,
    pub verify_tls: bool,
}

/// An inbound account together with the room that owns it.
#[derive(Debug, Clone)]
pub struct RoomInbound {
    pub room: Room,
    pub account: InboundAccount,
}

/// A sender pattern whose mail is suppressed for one inbound account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlocklistEntry {
    pub id: i64,
    pub inbound_id: i64,
    pub pattern: String,
}

/// Where a draft is in the compose flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComposeStage {
    /// Waiting for the subject line.
    AwaitingSubject,
    /// Accumulating body lines and attachments.
    AwaitingBody,
}

impl ComposeStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AwaitingSubject => "awaiting_subject",
            Self::AwaitingBody => "awaiting_body",
        }
    }

    /// Parse a stage string from the DB.
    pub fn parse(s: &str) -> Self {
        match s {
            "awaiting_body" => Self::AwaitingBody,
            _ => Self::AwaitingSubject,
        }
    }
}

/// An outgoing email being assembled across chat turns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    pub id: i64,
    pub room_id: i64,
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
    pub markdown: bool,
    pub stage: ComposeStage,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A file staged on disk for a draft.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub id: i64,
    pub draft_id: i64,
    /// Name the file was uploaded with.
    pub file_name: String,
    /// Name of the blob in the staging directory.
    pub staged_name: String,
}

impl Attachment {
    /// Whether `name` refers to this attachment by either of its names.
    pub fn matches(&self, name: &str) -> bool {
        self.staged_name == name || self.file_name == name
    }
}

/// Join recipients for the single `recipients` column.
pub fn join_recipients(recipients: &[String]) -> String {
    recipients.join(",")
}

/// Split the `recipients` column back into addresses.
pub fn split_recipients(joined: &str) -> Vec<String> {
    joined
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
