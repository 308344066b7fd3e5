//! Compose session: per-room draft state machine.
//!
//! `NoDraft → AwaitingSubject → AwaitingBody → (Sent | Cancelled) → NoDraft`.
//! The stage lives on the persisted [`Draft`], so a session survives nothing
//! but the store: every transition is one or two store calls.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::channels::ChatEventKind;
use crate::compose::markdown;
use crate::config::ComposeTokens;
use crate::error::{ComposeError, DatabaseError};
use crate::mail::{MailTransport, OutboundAttachment, OutboundMail};
use crate::staging::StagingArea;
use crate::store::{Attachment, ComposeStage, Database, Draft, Room};

/// What a single input did to the draft.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComposeStep {
    SubjectSet(String),
    LineAppended,
    AttachmentStaged { file_name: String, staged_name: String },
    AttachmentRemoved(String),
    Sent { recipients: Vec<String> },
    Cancelled,
}

/// Drives drafts for every room through the store.
pub struct ComposeSession {
    store: Arc<dyn Database>,
    transport: Arc<dyn MailTransport>,
    staging: StagingArea,
    tokens: ComposeTokens,
}

impl ComposeSession {
    pub fn new(
        store: Arc<dyn Database>,
        transport: Arc<dyn MailTransport>,
        staging: StagingArea,
        tokens: ComposeTokens,
    ) -> Self {
        Self {
            store,
            transport,
            staging,
            tokens,
        }
    }

    pub fn tokens(&self) -> &ComposeTokens {
        &self.tokens
    }

    /// Start a draft for `room`, replacing any draft already in progress.
    pub async fn begin(
        &self,
        room: &Room,
        candidates: &[String],
        markdown: bool,
    ) -> Result<Draft, ComposeError> {
        let recipients = validate_recipients(candidates)?;

        if self.store.get_outbound(room.id).await?.is_none() {
            return Err(ComposeError::NoOutboundAccount);
        }
        self.discard_room(room.id).await?;

        let draft = self.store.create_draft(room.id, &recipients, markdown).await?;
        info!(room = %room.key, recipients = recipients.len(), markdown, "Draft started");
        Ok(draft)
    }

    /// The room's draft, if one is in progress.
    pub async fn draft(&self, room: &Room) -> Result<Option<Draft>, ComposeError> {
        Ok(self.store.get_draft(room.id).await?)
    }

    /// Feed one chat input into the room's draft.
    pub async fn handle(
        &self,
        room: &Room,
        input: &ChatEventKind,
    ) -> Result<ComposeStep, ComposeError> {
        let draft = match self.store.get_draft(room.id).await {
            Ok(Some(draft)) => draft,
            Ok(None) => return Err(ComposeError::NoDraft),
            Err(e) => return Err(self.fail_safe_room(room.id, e).await),
        };

        match (draft.stage, input) {
            (ComposeStage::AwaitingSubject, ChatEventKind::Text(subject)) => {
                if let Err(e) = self.store.set_draft_subject(draft.id, subject).await {
                    return Err(self.fail_safe(&draft, e).await);
                }
                debug!(room = %room.key, "Draft subject set");
                Ok(ComposeStep::SubjectSet(subject.clone()))
            }
            (ComposeStage::AwaitingSubject, ChatEventKind::File { .. }) => {
                Err(ComposeError::SubjectNotText)
            }
            (ComposeStage::AwaitingBody, ChatEventKind::Text(text)) => {
                let trimmed = text.trim();
                if trimmed == self.tokens.send {
                    self.send(room, draft).await
                } else if trimmed == self.tokens.cancel {
                    self.cancel(room, &draft).await
                } else if let Some(name) = self.removal_target(trimmed) {
                    self.remove_attachment(&draft, name).await
                } else {
                    if let Err(e) = self.store.append_draft_body(draft.id, &format!("{text}\n")).await {
                        return Err(self.fail_safe(&draft, e).await);
                    }
                    Ok(ComposeStep::LineAppended)
                }
            }
            (ComposeStage::AwaitingBody, ChatEventKind::File { name, data }) => {
                self.stage_attachment(room, &draft, name, data).await
            }
        }
    }

    /// Drop the room's draft and its staged files, if any.
    pub async fn discard_room(&self, room_id: i64) -> Result<bool, DatabaseError> {
        match self.store.get_draft(room_id).await? {
            Some(draft) => {
                self.discard(&draft).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drop every draft left over from a previous run. Returns the number of
    /// staged files removed.
    pub async fn discard_stale(&self) -> Result<usize, DatabaseError> {
        let attachments = self.store.delete_all_drafts().await?;
        self.delete_blobs(&attachments).await;
        Ok(attachments.len())
    }

    // ── Transitions ─────────────────────────────────────────────────

    async fn send(&self, room: &Room, draft: Draft) -> Result<ComposeStep, ComposeError> {
        let account = match self.store.get_outbound(room.id).await {
            Ok(Some(account)) => account,
            Ok(None) => {
                self.discard_logged(&draft).await;
                return Err(ComposeError::NoOutboundAccount);
            }
            Err(e) => return Err(self.fail_safe(&draft, e).await),
        };
        let attachments = match self.store.list_attachments(draft.id).await {
            Ok(attachments) => attachments,
            Err(e) => return Err(self.fail_safe(&draft, e).await),
        };

        let (plain, html) = if draft.markdown {
            (
                markdown::plain_alternative(&draft.body),
                Some(markdown::render(&draft.body)),
            )
        } else {
            (draft.body.clone(), None)
        };
        let mail = OutboundMail {
            from: account.username.clone(),
            to: draft.recipients.clone(),
            subject: draft.subject.clone(),
            plain,
            html,
            attachments: attachments
                .iter()
                .map(|a| OutboundAttachment {
                    file_name: a.file_name.clone(),
                    path: self.staging.resolve_path(&a.staged_name),
                })
                .collect(),
        };

        let result = self.transport.send(&account, mail).await;
        self.discard_logged(&draft).await;

        match result {
            Ok(()) => {
                info!(room = %room.key, recipients = draft.recipients.len(), "Mail sent");
                Ok(ComposeStep::Sent {
                    recipients: draft.recipients,
                })
            }
            Err(e) => {
                warn!(
                    room = %room.key,
                    account = %account.username,
                    error = %e,
                    "Submission failed, removing outbound account"
                );
                if let Err(db) = self.store.detach_outbound(room.id).await {
                    warn!(room = %room.key, error = %db, "Could not remove outbound account");
                }
                Err(ComposeError::Dispatch(e))
            }
        }
    }

    async fn cancel(&self, room: &Room, draft: &Draft) -> Result<ComposeStep, ComposeError> {
        self.discard(draft).await?;
        info!(room = %room.key, "Draft cancelled");
        Ok(ComposeStep::Cancelled)
    }

    async fn remove_attachment(
        &self,
        draft: &Draft,
        name: &str,
    ) -> Result<ComposeStep, ComposeError> {
        let removed = match self.store.remove_attachment(draft.id, name).await {
            Ok(Some(removed)) => removed,
            Ok(None) => return Err(ComposeError::AttachmentNotFound(name.to_string())),
            Err(e) => return Err(self.fail_safe(draft, e).await),
        };
        self.delete_blobs(std::slice::from_ref(&removed)).await;
        Ok(ComposeStep::AttachmentRemoved(removed.file_name))
    }

    async fn stage_attachment(
        &self,
        room: &Room,
        draft: &Draft,
        name: &str,
        data: &[u8],
    ) -> Result<ComposeStep, ComposeError> {
        let staged_name = self
            .staging
            .store(name, data)
            .await
            .map_err(|e| ComposeError::Staging {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        if let Err(e) = self.store.add_attachment(draft.id, name, &staged_name).await {
            if let Err(io) = self.staging.delete(&staged_name).await {
                warn!(staged = %staged_name, error = %io, "Could not remove staged file");
            }
            return Err(self.fail_safe(draft, e).await);
        }
        debug!(room = %room.key, staged = %staged_name, "Attachment added to draft");
        Ok(ComposeStep::AttachmentStaged {
            file_name: name.to_string(),
            staged_name,
        })
    }

    // ── Helpers ─────────────────────────────────────────────────────

    /// `!rm <name>` → `name`.
    fn removal_target<'a>(&self, text: &'a str) -> Option<&'a str> {
        let rest = text.strip_prefix(self.tokens.remove_attachment.as_str())?;
        if rest.is_empty() || rest.starts_with(char::is_whitespace) {
            Some(rest.trim())
        } else {
            None
        }
    }

    async fn discard(&self, draft: &Draft) -> Result<(), DatabaseError> {
        let attachments = self.store.list_attachments(draft.id).await?;
        self.store.delete_draft(draft.id).await?;
        self.delete_blobs(&attachments).await;
        Ok(())
    }

    async fn discard_logged(&self, draft: &Draft) {
        if let Err(e) = self.discard(draft).await {
            warn!(draft_id = draft.id, error = %e, "Could not discard draft");
        }
    }

    /// Discard the draft after a storage failure and wrap the error.
    async fn fail_safe(&self, draft: &Draft, error: DatabaseError) -> ComposeError {
        warn!(draft_id = draft.id, error = %error, "Storage failure, discarding draft");
        self.discard_logged(draft).await;
        ComposeError::Storage(error)
    }

    async fn fail_safe_room(&self, room_id: i64, error: DatabaseError) -> ComposeError {
        warn!(room_id, error = %error, "Storage failure, discarding draft");
        if let Err(e) = self.discard_room(room_id).await {
            warn!(room_id, error = %e, "Could not discard draft");
        }
        ComposeError::Storage(error)
    }

    async fn delete_blobs(&self, attachments: &[Attachment]) {
        for attachment in attachments {
            if let Err(e) = self.staging.delete(&attachment.staged_name).await {
                warn!(staged = %attachment.staged_name, error = %e, "Could not remove staged file");
            }
        }
    }
}

/// Check and deduplicate recipient addresses, keeping their order.
pub fn validate_recipients(candidates: &[String]) -> Result<Vec<String>, ComposeError> {
    let mut recipients: Vec<String> = Vec::new();
    let mut invalid = Vec::new();
    for candidate in candidates.iter().map(|c| c.trim()).filter(|c| !c.is_empty()) {
        if !is_valid_address(candidate) {
            invalid.push(candidate.to_string());
        } else if !recipients.iter().any(|r| r == candidate) {
            recipients.push(candidate.to_string());
        }
    }
    if !invalid.is_empty() {
        return Err(ComposeError::InvalidRecipients(invalid));
    }
    if recipients.is_empty() {
        return Err(ComposeError::InvalidRecipients(Vec::new()));
    }
    Ok(recipients)
}

pub fn is_valid_address(candidate: &str) -> bool {
    candidate.contains('@') && candidate.contains('.')
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use async_trait::async_trait;
    use secrecy::SecretString;

    use crate::error::MailError;
    use crate::store::{LibSqlBackend, NewOutboundAccount, OutboundAccount};

    #[derive(Default)]
    struct Outbox {
        sent: Mutex<Vec<OutboundMail>>,
        fail: bool,
    }

    #[async_trait]
    impl MailTransport for Outbox {
        async fn send(&self, _account: &OutboundAccount, mail: OutboundMail) -> Result<(), MailError> {
            if self.fail {
                return Err(MailError::Send("535 authentication failed".into()));
            }
            self.sent.lock().unwrap().push(mail);
            Ok(())
        }
    }

    struct Fixture {
        store: Arc<dyn Database>,
        outbox: Arc<Outbox>,
        session: ComposeSession,
        room: Room,
        _dir: tempfile::TempDir,
    }

    async fn fixture(fail: bool) -> Fixture {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let room = store.ensure_room("R3", 30, false).await.unwrap();
        store
            .attach_outbound(
                room.id,
                &NewOutboundAccount {
                    host: "smtp.example.com".into(),
                    port: 587,
                    username: "me@example.com".into(),
                    secret: SecretString::from("pw"),
                    verify_tls: true,
                },
            )
            .await
            .unwrap();
        let outbox = Arc::new(Outbox {
            fail,
            ..Default::default()
        });
        let dir = tempfile::tempdir().unwrap();
        let session = ComposeSession::new(
            Arc::clone(&store),
            outbox.clone(),
            StagingArea::new(dir.path().to_path_buf()),
            ComposeTokens::default(),
        );
        Fixture {
            store,
            outbox,
            session,
            room,
            _dir: dir,
        }
    }

    fn text(s: &str) -> ChatEventKind {
        ChatEventKind::Text(s.to_string())
    }

    #[test]
    fn recipients_are_deduplicated() {
        let list = vec!["a@x.com".to_string(), " a@x.com ".to_string(), "b@y.org".to_string()];
        assert_eq!(
            validate_recipients(&list).unwrap(),
            vec!["a@x.com".to_string(), "b@y.org".to_string()]
        );
    }

    #[test]
    fn malformed_recipient_rejected() {
        let list = vec!["a@x.com".to_string(), "nobody".to_string()];
        match validate_recipients(&list) {
            Err(ComposeError::InvalidRecipients(bad)) => assert_eq!(bad, vec!["nobody".to_string()]),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(validate_recipients(&[]).is_err());
    }

    #[tokio::test]
    async fn plain_draft_is_sent_and_removed() {
        let f = fixture(false).await;
        f.session
            .begin(&f.room, &["x@y.com".to_string()], false)
            .await
            .unwrap();

        assert_eq!(
            f.session.handle(&f.room, &text("Hello")).await.unwrap(),
            ComposeStep::SubjectSet("Hello".into())
        );
        f.session.handle(&f.room, &text("line1")).await.unwrap();
        f.session.handle(&f.room, &text("line2")).await.unwrap();
        let step = f.session.handle(&f.room, &text("!send")).await.unwrap();
        assert_eq!(
            step,
            ComposeStep::Sent {
                recipients: vec!["x@y.com".into()]
            }
        );

        let sent = f.outbox.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, vec!["x@y.com".to_string()]);
        assert_eq!(sent[0].subject, "Hello");
        assert_eq!(sent[0].plain, "line1\nline2\n");
        assert!(sent[0].html.is_none());
        drop(sent);
        assert!(f.store.get_draft(f.room.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn markdown_draft_carries_html() {
        let f = fixture(false).await;
        f.session
            .begin(&f.room, &["x@y.com".to_string()], true)
            .await
            .unwrap();
        f.session.handle(&f.room, &text("Subj")).await.unwrap();
        f.session.handle(&f.room, &text("**bold**")).await.unwrap();
        f.session.handle(&f.room, &text("!send")).await.unwrap();

        let sent = f.outbox.sent.lock().unwrap();
        assert_eq!(sent[0].plain, "**bold**\n");
        assert!(sent[0].html.as_deref().unwrap().contains("<strong>bold</strong>"));
    }

    #[tokio::test]
    async fn file_as_subject_is_rejected() {
        let f = fixture(false).await;
        f.session
            .begin(&f.room, &["x@y.com".to_string()], false)
            .await
            .unwrap();
        let file = ChatEventKind::File {
            name: "a.txt".into(),
            data: b"x".to_vec(),
        };
        assert!(matches!(
            f.session.handle(&f.room, &file).await,
            Err(ComposeError::SubjectNotText)
        ));
        let draft = f.store.get_draft(f.room.id).await.unwrap().unwrap();
        assert_eq!(draft.stage, ComposeStage::AwaitingSubject);
        assert_eq!(draft.subject, "");
    }

    #[tokio::test]
    async fn begin_without_outbound_account() {
        let f = fixture(false).await;
        f.store.detach_outbound(f.room.id).await.unwrap();
        assert!(matches!(
            f.session.begin(&f.room, &["x@y.com".to_string()], false).await,
            Err(ComposeError::NoOutboundAccount)
        ));
        assert!(f.store.get_draft(f.room.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dispatch_failure_removes_outbound_account() {
        let f = fixture(true).await;
        f.session
            .begin(&f.room, &["x@y.com".to_string()], false)
            .await
            .unwrap();
        f.session.handle(&f.room, &text("Hi")).await.unwrap();
        assert!(matches!(
            f.session.handle(&f.room, &text("!send")).await,
            Err(ComposeError::Dispatch(_))
        ));
        assert!(f.store.get_outbound(f.room.id).await.unwrap().is_none());
        assert!(f.store.get_draft(f.room.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_unknown_attachment_keeps_draft() {
        let f = fixture(false).await;
        f.session
            .begin(&f.room, &["x@y.com".to_string()], false)
            .await
            .unwrap();
        f.session.handle(&f.room, &text("Hi")).await.unwrap();
        assert!(matches!(
            f.session.handle(&f.room, &text("!rm nothing.txt")).await,
            Err(ComposeError::AttachmentNotFound(_))
        ));
        assert!(f.store.get_draft(f.room.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn rm_prefix_inside_a_word_is_body_text() {
        let f = fixture(false).await;
        f.session
            .begin(&f.room, &["x@y.com".to_string()], false)
            .await
            .unwrap();
        f.session.handle(&f.room, &text("Hi")).await.unwrap();
        assert_eq!(
            f.session.handle(&f.room, &text("!rmdir")).await.unwrap(),
            ComposeStep::LineAppended
        );
    }
}
