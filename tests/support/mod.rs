//! Stub collaborators shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::DateTime;
use secrecy::SecretString;

use mail_bridge::channels::ChatSink;
use mail_bridge::error::{ChannelError, MailError};
use mail_bridge::mail::{MailConnector, MailSession, MailTransport, OutboundMail, RawMail};
use mail_bridge::store::{
    Database, InboundAccount, LibSqlBackend, NewInboundAccount, NewOutboundAccount,
    OutboundAccount, Room, RoomInbound,
};

// ── Mail server ─────────────────────────────────────────────────────

/// A fake IMAP server: a shared mailbox plus scripted connect failures.
#[derive(Default)]
pub struct ScriptedConnector {
    /// Messages currently in the mailbox, oldest first.
    pub mailbox: Arc<Mutex<Vec<RawMail>>>,
    /// Refuse this many connection attempts before accepting.
    pub refuse_connects: AtomicU32,
    /// Refuse every connection attempt.
    pub refuse_forever: bool,
    pub connects: AtomicU32,
    pub fetches: Arc<AtomicU32>,
}

impl ScriptedConnector {
    pub fn with_mail(mails: Vec<RawMail>) -> Self {
        Self {
            mailbox: Arc::new(Mutex::new(mails)),
            ..Default::default()
        }
    }

    pub fn refusing() -> Self {
        Self {
            refuse_forever: true,
            ..Default::default()
        }
    }

    pub fn push(&self, mail: RawMail) {
        self.mailbox.lock().unwrap().push(mail);
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn fetches(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailConnector for ScriptedConnector {
    async fn connect(&self, account: &InboundAccount) -> Result<Box<dyn MailSession>, MailError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let refused = self.refuse_forever
            || self
                .refuse_connects
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if refused {
            return Err(MailError::Connect {
                host: account.host.clone(),
                reason: "connection refused".into(),
            });
        }
        Ok(Box::new(ScriptedSession {
            mailbox: Arc::clone(&self.mailbox),
            fetches: Arc::clone(&self.fetches),
        }))
    }
}

struct ScriptedSession {
    mailbox: Arc<Mutex<Vec<RawMail>>>,
    fetches: Arc<AtomicU32>,
}

#[async_trait]
impl MailSession for ScriptedSession {
    async fn select_mailbox(&mut self, _name: &str) -> Result<u32, MailError> {
        Ok(self.mailbox.lock().unwrap().len() as u32)
    }

    async fn fetch_recent(&mut self, n: u32) -> Result<Vec<RawMail>, MailError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let mailbox = self.mailbox.lock().unwrap();
        let skip = mailbox.len().saturating_sub(n as usize);
        Ok(mailbox[skip..].to_vec())
    }

    async fn list_mailboxes(&mut self) -> Result<Vec<String>, MailError> {
        Ok(vec!["INBOX".into(), "Archive".into()])
    }

    async fn logout(&mut self) {}
}

/// A message with the given sender, subject and internal date.
pub fn raw_mail(seq: u32, from: &str, subject: &str, ts: i64) -> RawMail {
    RawMail {
        seq,
        internal_date: Some(DateTime::from_timestamp(ts, 0).unwrap().fixed_offset()),
        body: format!(
            "From: {from}\r\nTo: alice@example.com\r\nSubject: {subject}\r\n\r\nHello from {from}\r\n"
        )
        .into_bytes(),
    }
}

// ── Chat ────────────────────────────────────────────────────────────

/// One message sent to a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sent {
    pub room: String,
    pub text: String,
    pub html: Option<String>,
}

#[derive(Default)]
pub struct RecordingChat {
    pub sent: Mutex<Vec<Sent>>,
}

impl RecordingChat {
    pub fn messages(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn last_text(&self) -> Option<String> {
        self.sent.lock().unwrap().last().map(|s| s.text.clone())
    }

    /// How many "new mail" headers reached `room`.
    pub fn headers_for(&self, room: &str) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.room == room && s.text.contains("You've got a new Email"))
            .count()
    }
}

#[async_trait]
impl ChatSink for RecordingChat {
    async fn send_text(&self, room: &str, text: &str) -> Result<(), ChannelError> {
        self.sent.lock().unwrap().push(Sent {
            room: room.into(),
            text: text.into(),
            html: None,
        });
        Ok(())
    }

    async fn send_formatted(&self, room: &str, plain: &str, html: &str) -> Result<(), ChannelError> {
        self.sent.lock().unwrap().push(Sent {
            room: room.into(),
            text: plain.into(),
            html: Some(html.into()),
        });
        Ok(())
    }
}

// ── Outbound ────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingTransport {
    pub sent: Mutex<Vec<OutboundMail>>,
    pub fail: bool,
}

impl RecordingTransport {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn sent(&self) -> Vec<OutboundMail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailTransport for RecordingTransport {
    async fn send(&self, _account: &OutboundAccount, mail: OutboundMail) -> Result<(), MailError> {
        if self.fail {
            return Err(MailError::Send("535 5.7.8 authentication failed".into()));
        }
        self.sent.lock().unwrap().push(mail);
        Ok(())
    }
}

// ── Store ───────────────────────────────────────────────────────────

pub async fn memory_store() -> Arc<dyn Database> {
    Arc::new(LibSqlBackend::new_memory().await.unwrap())
}

pub fn inbound(username: &str) -> NewInboundAccount {
    NewInboundAccount {
        host: "imap.example.com:993".into(),
        username: username.into(),
        secret: SecretString::from("hunter2"),
        mailbox: "INBOX".into(),
        verify_tls: true,
    }
}

pub fn outbound(username: &str) -> NewOutboundAccount {
    NewOutboundAccount {
        host: "smtp.example.com".into(),
        port: 587,
        username: username.into(),
        secret: SecretString::from("hunter2"),
        verify_tls: true,
    }
}

/// Create `room` with an inbound account and return the pair.
pub async fn bridged_room(store: &Arc<dyn Database>, room: &str, username: &str) -> RoomInbound {
    let room: Room = store.ensure_room(room, 30, false).await.unwrap();
    let account = store.attach_inbound(room.id, &inbound(username)).await.unwrap();
    RoomInbound { room, account }
}
