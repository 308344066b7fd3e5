//! Bridge facade: setup, room management and chat event routing.
//!
//! Every operation is addressed by room key and answers the room with one
//! chat message: the confirmation on success, the reason on rejection or
//! failure. The typed result is returned as well so callers and tests never
//! have to parse chat text.

use std::sync::Arc;

use secrecy::SecretString;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::channels::{ChatEvent, ChatSink};
use crate::compose::{ComposeSession, ComposeStep};
use crate::config::BridgeConfig;
use crate::error::{ComposeError, DatabaseError, Error, MailError, SetupError};
use crate::listener::{ListenerDeps, ListenerStatus, PollScheduler};
use crate::mail::imap::with_default_port;
use crate::mail::{MailConnector, MailTransport};
use crate::pipeline::ContentPipeline;
use crate::pipeline::blocklist::is_valid_pattern;
use crate::staging::StagingArea;
use crate::store::{
    Database, InboundAccount, NewInboundAccount, NewOutboundAccount, Room, RoomInbound,
};

const DEFAULT_SMTP_PORT: u16 = 587;
const DEFAULT_MAILBOX: &str = "INBOX";

/// External collaborators of the bridge.
#[derive(Clone)]
pub struct BridgeDeps {
    pub store: Arc<dyn Database>,
    pub connector: Arc<dyn MailConnector>,
    pub transport: Arc<dyn MailTransport>,
    pub chat: Arc<dyn ChatSink>,
}

/// Inbound account settings as entered by the user.
#[derive(Debug, Clone)]
pub struct InboundSetup {
    /// `host` or `host:port`; port 993 is assumed when missing.
    pub host: String,
    pub username: String,
    pub secret: SecretString,
    pub mailbox: Option<String>,
    pub verify_tls: bool,
}

/// Outbound account settings as entered by the user.
#[derive(Debug, Clone)]
pub struct OutboundSetup {
    /// `host` or `host:port`; port 587 is assumed when missing.
    pub host: String,
    pub username: String,
    pub secret: SecretString,
    pub verify_tls: bool,
}

/// Summary of a room's bridge configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomInfo {
    pub room: String,
    pub poll_interval_secs: u64,
    pub html_enabled: bool,
    pub inbound: Option<InboundInfo>,
    pub outbound: Option<OutboundInfo>,
    pub listener: Option<ListenerStatus>,
    pub composing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InboundInfo {
    pub host: String,
    pub username: String,
    pub mailbox: String,
    pub verify_tls: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundInfo {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub verify_tls: bool,
}

impl RoomInfo {
    fn render(&self) -> String {
        let mut out = format!(
            "Room {}\ncheck interval: {}s\nHTML rendering: {}\n",
            self.room,
            self.poll_interval_secs,
            on_off(self.html_enabled)
        );
        match &self.inbound {
            Some(i) => out.push_str(&format!(
                "IMAP: {} as {} (mailbox {}, verify TLS: {})\n",
                i.host, i.username, i.mailbox, i.verify_tls
            )),
            None => out.push_str("IMAP: not configured\n"),
        }
        match &self.outbound {
            Some(o) => out.push_str(&format!(
                "SMTP: {}:{} as {} (verify TLS: {})\n",
                o.host, o.port, o.username, o.verify_tls
            )),
            None => out.push_str("SMTP: not configured\n"),
        }
        if let Some(status) = &self.listener {
            out.push_str(&format!(
                "listener: {:?}, {} polls, {} reconnects\n",
                status.state, status.polls, status.reconnects
            ));
        }
        if self.composing {
            out.push_str("a draft is in progress\n");
        }
        out.trim_end().to_string()
    }
}

/// The bridge: one instance serves every room.
pub struct Bridge {
    config: BridgeConfig,
    store: Arc<dyn Database>,
    connector: Arc<dyn MailConnector>,
    chat: Arc<dyn ChatSink>,
    scheduler: PollScheduler,
    compose: ComposeSession,
}

impl Bridge {
    pub fn new(config: BridgeConfig, deps: BridgeDeps) -> Self {
        let pipeline = Arc::new(ContentPipeline::new(
            Arc::clone(&deps.store),
            config.dedup_strategy,
        ));
        let scheduler = PollScheduler::new(ListenerDeps {
            store: Arc::clone(&deps.store),
            connector: Arc::clone(&deps.connector),
            pipeline,
            chat: Arc::clone(&deps.chat),
            config: config.listener.clone(),
        });
        let compose = ComposeSession::new(
            Arc::clone(&deps.store),
            deps.transport,
            StagingArea::new(config.staging_dir()),
            config.tokens.clone(),
        );
        Self {
            config,
            store: deps.store,
            connector: deps.connector,
            chat: deps.chat,
            scheduler,
            compose,
        }
    }

    pub fn scheduler(&self) -> &PollScheduler {
        &self.scheduler
    }

    pub fn compose(&self) -> &ComposeSession {
        &self.compose
    }

    /// Discard stale drafts, then start a listener per inbound account.
    pub async fn start(&self) -> Result<usize, DatabaseError> {
        let removed = self.compose.discard_stale().await?;
        if removed > 0 {
            info!(removed, "Removed staged files of stale drafts");
        }
        self.scheduler.bootstrap().await
    }

    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }

    // ── Account setup ───────────────────────────────────────────────

    /// Verify and persist an inbound account, then start a silent listener.
    pub async fn setup_inbound(&self, room: &str, setup: InboundSetup) -> Result<(), Error> {
        let result = self.try_setup_inbound(room, setup).await;
        self.reply(room, result).await
    }

    async fn try_setup_inbound(&self, room_key: &str, setup: InboundSetup) -> Result<String, Error> {
        if let Some(room) = self.store.get_room(room_key).await?
            && self.store.get_inbound(room.id).await?.is_some()
        {
            return Err(SetupError::AlreadyConfigured("IMAP").into());
        }
        let username = setup.username.trim().to_string();
        if self.store.is_inbound_username_in_use(&username).await? {
            return Err(SetupError::AccountInUse(username).into());
        }

        let new = NewInboundAccount {
            host: with_default_port(setup.host.trim()),
            username,
            secret: setup.secret,
            mailbox: setup
                .mailbox
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| DEFAULT_MAILBOX.to_string()),
            verify_tls: setup.verify_tls,
        };
        self.verify_inbound(&new).await?;

        let room = self.ensure_room(room_key).await?;
        let account = self.store.attach_inbound(room.id, &new).await?;
        info!(room = %room.key, account = %account.username, host = %account.host, "Inbound account bridged");

        let reply = format!(
            "Bridge created successfully!\nYou should delete the message containing your credentials ;)\nIMAP:\nhost: {}\nusername: {}\nmailbox: {}\nverify TLS: {}",
            account.host, account.username, account.mailbox, account.verify_tls
        );
        self.scheduler.start(RoomInbound { room, account }, true).await;
        Ok(reply)
    }

    async fn verify_inbound(&self, new: &NewInboundAccount) -> Result<(), SetupError> {
        let probe = InboundAccount {
            id: 0,
            room_id: 0,
            host: new.host.clone(),
            username: new.username.clone(),
            secret: new.secret.clone(),
            mailbox: new.mailbox.clone(),
            verify_tls: new.verify_tls,
        };
        let connector = Arc::clone(&self.connector);
        let mut session = tokio::spawn(async move { connector.connect(&probe).await })
            .await
            .map_err(|e| MailError::Task(e.to_string()))??;
        session.logout().await;
        Ok(())
    }

    /// Persist an outbound account. Nothing is dialed until the first send.
    pub async fn setup_outbound(&self, room: &str, setup: OutboundSetup) -> Result<(), Error> {
        let result = self.try_setup_outbound(room, setup).await;
        self.reply(room, result).await
    }

    async fn try_setup_outbound(
        &self,
        room_key: &str,
        setup: OutboundSetup,
    ) -> Result<String, Error> {
        if let Some(room) = self.store.get_room(room_key).await?
            && self.store.get_outbound(room.id).await?.is_some()
        {
            return Err(SetupError::AlreadyConfigured("SMTP").into());
        }
        let username = setup.username.trim().to_string();
        if self.store.is_outbound_username_in_use(&username).await? {
            return Err(SetupError::AccountInUse(username).into());
        }

        let (host, port, defaulted) = split_smtp_host(&setup.host)?;
        let room = self.ensure_room(room_key).await?;
        let account = self
            .store
            .attach_outbound(
                room.id,
                &NewOutboundAccount {
                    host,
                    port,
                    username,
                    secret: setup.secret,
                    verify_tls: setup.verify_tls,
                },
            )
            .await?;
        info!(room = %room.key, account = %account.username, host = %account.host, "Outbound account saved");

        let mut reply = String::new();
        if defaulted {
            reply.push_str(&format!("No port specified! Using {DEFAULT_SMTP_PORT}\n"));
        }
        reply.push_str(&format!(
            "SMTP data saved.\nSMTP:\nhost: {}\nport: {}\nusername: {}\nverify TLS: {}",
            account.host, account.port, account.username, account.verify_tls
        ));
        Ok(reply)
    }

    // ── Room settings ───────────────────────────────────────────────

    /// Switch the mailbox, forget what was seen and restart silently.
    pub async fn set_mailbox(&self, room: &str, mailbox: &str) -> Result<(), Error> {
        let result = self.try_set_mailbox(room, mailbox).await;
        self.reply(room, result).await
    }

    async fn try_set_mailbox(&self, room_key: &str, mailbox: &str) -> Result<String, Error> {
        let mailbox = mailbox.trim();
        if mailbox.is_empty() {
            return Err(SetupError::EmptyMailbox.into());
        }
        let (room, account) = self.require_inbound(room_key).await?;
        self.store.set_mailbox(account.id, mailbox).await?;
        let cleared = self.store.clear_seen_mails(room.id).await?;
        self.scheduler.stop(room_key).await;

        let account = self
            .store
            .get_inbound(room.id)
            .await?
            .ok_or(SetupError::NotConfigured("IMAP"))?;
        info!(room = %room.key, mailbox, cleared, "Mailbox changed");
        self.scheduler.start(RoomInbound { room, account }, true).await;
        Ok("Mailbox updated".to_string())
    }

    pub async fn set_html(&self, room: &str, enabled: bool) -> Result<(), Error> {
        let result: Result<String, Error> = async {
            let (room, _) = self.require_inbound(room).await?;
            self.store.set_html_enabled(room.id, enabled).await?;
            Ok(format!("Successfully set HTML-rendering to {}", on_off(enabled)))
        }
        .await;
        self.reply(room, result).await
    }

    pub async fn room_info(&self, room: &str) -> Result<RoomInfo, Error> {
        let result = self.collect_room_info(room).await;
        let text = result.as_ref().map(RoomInfo::render).map_err(user_message);
        self.send(room, text).await;
        result
    }

    async fn collect_room_info(&self, room_key: &str) -> Result<RoomInfo, Error> {
        let room = self
            .store
            .get_room(room_key)
            .await?
            .ok_or(SetupError::NotConfigured("mail"))?;
        let inbound = self.store.get_inbound(room.id).await?.map(|a| InboundInfo {
            host: a.host,
            username: a.username,
            mailbox: a.mailbox,
            verify_tls: a.verify_tls,
        });
        let outbound = self.store.get_outbound(room.id).await?.map(|a| OutboundInfo {
            host: a.host,
            port: a.port,
            username: a.username,
            verify_tls: a.verify_tls,
        });
        Ok(RoomInfo {
            room: room.key.clone(),
            poll_interval_secs: room.poll_interval_secs,
            html_enabled: room.html_enabled,
            inbound,
            outbound,
            listener: self.scheduler.status(room_key).await,
            composing: self.store.get_draft(room.id).await?.is_some(),
        })
    }

    /// Mailboxes of the room's inbound account, over the live connection.
    pub async fn list_mailboxes(&self, room: &str) -> Result<Vec<String>, Error> {
        let result: Result<Vec<String>, Error> = async {
            self.require_inbound(room).await?;
            Ok(self.scheduler.list_mailboxes(room).await?)
        }
        .await;
        let text = result
            .as_ref()
            .map(|names| {
                format!(
                    "Your mailboxes:\n{}\nUse !setmailbox <mailbox> to change your mailbox",
                    names.join("\n")
                )
            })
            .map_err(user_message);
        self.send(room, text).await;
        result
    }

    pub async fn current_mailbox(&self, room: &str) -> Result<String, Error> {
        let result = self
            .require_inbound(room)
            .await
            .map(|(_, account)| account.mailbox);
        let text = result
            .as_ref()
            .map(|m| format!("The current mailbox for this room is: {m}"))
            .map_err(user_message);
        self.send(room, text).await;
        result
    }

    // ── Blocklist ───────────────────────────────────────────────────

    /// Block a sender pattern. Returns false if it was already blocked.
    pub async fn block_address(&self, room: &str, pattern: &str) -> Result<bool, Error> {
        let pattern = pattern.trim();
        let result: Result<bool, Error> = async {
            let (_, account) = self.require_inbound(room).await?;
            if !is_valid_pattern(pattern) {
                return Err(SetupError::InvalidAddress(pattern.to_string()).into());
            }
            Ok(self.store.add_blocklist(account.id, pattern).await?)
        }
        .await;
        let text = result
            .as_ref()
            .map(|added| {
                if *added {
                    format!("Success adding {pattern} to blocklist!")
                } else {
                    format!("{pattern} is already on the blocklist")
                }
            })
            .map_err(user_message);
        self.send(room, text).await;
        result
    }

    /// Unblock a sender pattern. Returns false if it was not blocked.
    pub async fn unblock_address(&self, room: &str, pattern: &str) -> Result<bool, Error> {
        let pattern = pattern.trim();
        let result: Result<bool, Error> = async {
            let (_, account) = self.require_inbound(room).await?;
            Ok(self.store.remove_blocklist(account.id, pattern).await?)
        }
        .await;
        let text = result
            .as_ref()
            .map(|removed| {
                if *removed {
                    format!("Success deleting {pattern} from blocklist!")
                } else {
                    format!("{pattern} is not on the blocklist")
                }
            })
            .map_err(user_message);
        self.send(room, text).await;
        result
    }

    pub async fn clear_blocklist(&self, room: &str) -> Result<u64, Error> {
        let result: Result<u64, Error> = async {
            let (_, account) = self.require_inbound(room).await?;
            Ok(self.store.clear_blocklist(account.id).await?)
        }
        .await;
        let text = result
            .as_ref()
            .map(|_| "Blocklist is now clean!".to_string())
            .map_err(user_message);
        self.send(room, text).await;
        result
    }

    pub async fn list_blocklist(&self, room: &str) -> Result<Vec<String>, Error> {
        let result: Result<Vec<String>, Error> = async {
            let (_, account) = self.require_inbound(room).await?;
            let entries = self.store.list_blocklist(account.id).await?;
            Ok(entries.into_iter().map(|e| e.pattern).collect())
        }
        .await;
        let text = result
            .as_ref()
            .map(|patterns| {
                if patterns.is_empty() {
                    "No addresses blocked!".to_string()
                } else {
                    let lines: Vec<String> = patterns.iter().map(|p| format!("> {p}")).collect();
                    format!("Blocked addresses:\n{}", lines.join("\n"))
                }
            })
            .map_err(user_message);
        self.send(room, text).await;
        result
    }

    // ── Unbridging ──────────────────────────────────────────────────

    /// Stop the listener, drop any draft and delete the room.
    pub async fn unbridge(&self, room: &str) -> Result<bool, Error> {
        let result = self.teardown(room).await.map_err(Error::from);
        let text = result
            .as_ref()
            .map(|_| "Successfully unbridged".to_string())
            .map_err(user_message);
        self.send(room, text).await;
        result
    }

    /// Tear the room down after everyone left. Nobody is left to answer.
    pub async fn handle_room_left(&self, room: &str) -> Result<bool, DatabaseError> {
        self.teardown(room).await
    }

    async fn teardown(&self, room_key: &str) -> Result<bool, DatabaseError> {
        self.scheduler.stop(room_key).await;
        let Some(room) = self.store.get_room(room_key).await? else {
            return Ok(false);
        };
        self.compose.discard_room(room.id).await?;
        let deleted = self.store.delete_room(room_key).await?;
        info!(room = %room_key, "Room unbridged");
        Ok(deleted)
    }

    // ── Compose ─────────────────────────────────────────────────────

    /// Start a draft to `recipients`. `markdown` falls back to the configured default.
    pub async fn begin_compose(
        &self,
        room: &str,
        recipients: &[String],
        markdown: Option<bool>,
    ) -> Result<(), Error> {
        let result: Result<String, Error> = async {
            let room = self
                .store
                .get_room(room)
                .await?
                .ok_or(ComposeError::NoOutboundAccount)?;
            let markdown = markdown.unwrap_or(self.config.markdown_default);
            self.compose.begin(&room, recipients, markdown).await?;
            Ok("Now send me the subject of your email".to_string())
        }
        .await;
        self.reply(room, result).await
    }

    /// Whether the room has a draft in progress.
    pub async fn is_composing(&self, room: &str) -> Result<bool, DatabaseError> {
        match self.store.get_room(room).await? {
            Some(room) => Ok(self.store.get_draft(room.id).await?.is_some()),
            None => Ok(false),
        }
    }

    /// Route a chat event into the room's draft.
    ///
    /// Returns `None` when the event was not for a draft: the bridge's own
    /// messages and rooms without a draft in progress.
    pub async fn handle_event(&self, event: &ChatEvent) -> Result<Option<ComposeStep>, Error> {
        if event.sender == self.config.bot_id {
            return Ok(None);
        }
        let room = match self.store.get_room(&event.room).await {
            Ok(Some(room)) => room,
            Ok(None) => return Ok(None),
            Err(e) => {
                let err = Error::from(e);
                self.send(&event.room, Err(user_message(&err))).await;
                return Err(err);
            }
        };
        match self.compose.draft(&room).await {
            Ok(Some(_)) => {}
            Ok(None) => return Ok(None),
            Err(e) => {
                let err = Error::from(e);
                self.send(&event.room, Err(user_message(&err))).await;
                return Err(err);
            }
        }

        let result = self
            .compose
            .handle(&room, &event.kind)
            .await
            .map_err(Error::from);
        let text = result
            .as_ref()
            .map(|step| self.describe(step))
            .map_err(user_message);
        self.send(&event.room, text).await;
        result.map(Some)
    }

    fn describe(&self, step: &ComposeStep) -> String {
        let tokens = self.compose.tokens();
        match step {
            ComposeStep::SubjectSet(_) => format!(
                "Now send me the content of the email. One message is one line. If you want to send or cancel enter {} or {}",
                tokens.send, tokens.cancel
            ),
            ComposeStep::LineAppended => String::new(),
            ComposeStep::AttachmentStaged { staged_name, .. } => {
                format!("File {staged_name} attached!")
            }
            ComposeStep::AttachmentRemoved(name) => format!("Attachment {name} deleted!"),
            ComposeStep::Sent { recipients } => {
                format!("Message sent successfully to {}", recipients.join(", "))
            }
            ComposeStep::Cancelled => "Mail canceled".to_string(),
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────

    async fn ensure_room(&self, key: &str) -> Result<Room, DatabaseError> {
        self.store
            .ensure_room(
                key,
                self.config.default_poll_interval_secs,
                self.config.html_default,
            )
            .await
    }

    async fn require_inbound(&self, room_key: &str) -> Result<(Room, InboundAccount), Error> {
        let room = self
            .store
            .get_room(room_key)
            .await?
            .ok_or(SetupError::NotConfigured("IMAP"))?;
        let account = self
            .store
            .get_inbound(room.id)
            .await?
            .ok_or(SetupError::NotConfigured("IMAP"))?;
        Ok((room, account))
    }

    /// Answer with the confirmation or the failure, passing the result on.
    async fn reply(&self, room: &str, result: Result<String, Error>) -> Result<(), Error> {
        match result {
            Ok(text) => {
                self.send(room, Ok(text)).await;
                Ok(())
            }
            Err(e) => {
                self.send(room, Err(user_message(&e))).await;
                Err(e)
            }
        }
    }

    async fn send(&self, room: &str, text: Result<String, String>) {
        let text = match text {
            Ok(text) | Err(text) => text,
        };
        if text.is_empty() {
            return;
        }
        if let Err(e) = self.chat.send_text(room, &text).await {
            warn!(room, error = %e, "Could not answer room");
        }
    }
}

/// `host[:port]` of an outbound server. The flag is set when 587 was assumed.
fn split_smtp_host(raw: &str) -> Result<(String, u16, bool), SetupError> {
    let raw = raw.trim();
    match raw.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .trim()
                .parse::<u16>()
                .map_err(|_| SetupError::InvalidPort(port.trim().to_string()))?;
            Ok((host.trim().to_string(), port, false))
        }
        None => Ok((raw.to_string(), DEFAULT_SMTP_PORT, true)),
    }
}

fn on_off(flag: bool) -> &'static str {
    if flag { "on" } else { "off" }
}

/// The chat text for a failed operation. Storage details stay in the log.
fn user_message(err: &Error) -> String {
    match err {
        Error::Database(e) | Error::Setup(SetupError::Storage(e)) => {
            error!(error = %e, "Storage failure");
            "A server error occurred, please try again later".to_string()
        }
        Error::Compose(ComposeError::Storage(e)) => {
            error!(error = %e, "Storage failure while composing");
            "A server error occurred, the draft was discarded".to_string()
        }
        Error::Compose(ComposeError::Dispatch(e)) => format!(
            "Sending failed: {e}\nThe SMTP account was removed. To fix this you have to set it up again"
        ),
        Error::Compose(ComposeError::InvalidRecipients(bad)) if !bad.is_empty() => format!(
            "this is an email: max@google.de\nthis is no email: {}",
            bad.join(", ")
        ),
        Error::Setup(SetupError::Verify(e)) => format!("Error creating bridge!\nReason: {e}"),
        other => leaf_message(other),
    }
}

fn leaf_message(err: &Error) -> String {
    match err {
        Error::Config(e) => e.to_string(),
        Error::Database(e) => e.to_string(),
        Error::Mail(e) => e.to_string(),
        Error::Channel(e) => e.to_string(),
        Error::Compose(e) => e.to_string(),
        Error::Setup(e) => e.to_string(),
    }
}
