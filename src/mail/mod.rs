//! Mail protocol clients: IMAP retrieval for inbound, SMTP submission for outbound.
//!
//! The listener and compose session only see the [`MailConnector`],
//! [`MailSession`] and [`MailTransport`] traits, so tests can script both
//! sides without a server.

pub mod imap;
pub mod smtp;
mod tls;

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};

use crate::error::MailError;
use crate::store::{InboundAccount, OutboundAccount};

pub use imap::ImapConnector;
pub use smtp::SmtpMailer;

/// One message as fetched from the server, before parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMail {
    /// Sequence number in the selected mailbox.
    pub seq: u32,
    /// Server-reported arrival time.
    pub internal_date: Option<DateTime<FixedOffset>>,
    /// Full RFC 5322 message.
    pub body: Vec<u8>,
}

/// Opens authenticated sessions for inbound accounts.
#[async_trait]
pub trait MailConnector: Send + Sync {
    /// Connect and log in. Fails with [`MailError::Connect`] or [`MailError::Auth`].
    async fn connect(&self, account: &InboundAccount) -> Result<Box<dyn MailSession>, MailError>;
}

/// An authenticated inbound connection.
#[async_trait]
pub trait MailSession: Send {
    /// Select `name`, returning the number of messages it holds.
    async fn select_mailbox(&mut self, name: &str) -> Result<u32, MailError>;

    /// Fetch up to `n` of the newest messages in the selected mailbox,
    /// oldest first. Nothing is marked as read.
    async fn fetch_recent(&mut self, n: u32) -> Result<Vec<RawMail>, MailError>;

    async fn list_mailboxes(&mut self) -> Result<Vec<String>, MailError>;

    /// Best-effort goodbye; errors are ignored.
    async fn logout(&mut self);
}

/// A file to attach, read from the staging directory at send time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundAttachment {
    pub file_name: String,
    pub path: PathBuf,
}

/// A fully assembled outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMail {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    /// Plain-text body, always present.
    pub plain: String,
    /// Rendered HTML alternative, when markdown was requested.
    pub html: Option<String>,
    pub attachments: Vec<OutboundAttachment>,
}

/// Submits outgoing mail.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Dial the account's server and transmit `mail`.
    async fn send(&self, account: &OutboundAccount, mail: OutboundMail) -> Result<(), MailError>;
}
