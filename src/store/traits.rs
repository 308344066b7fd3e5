//! Unified `Database` trait: single async interface for all bridge persistence.

use async_trait::async_trait;

use crate::error::DatabaseError;
use crate::store::model::{
    Attachment, BlocklistEntry, Draft, InboundAccount, NewInboundAccount, NewOutboundAccount,
    OutboundAccount, Room, RoomInbound,
};

/// Backend-agnostic store for rooms, accounts, drafts and mail bookkeeping.
///
/// Each method is atomic on its own. Deleting a room cascades to everything
/// it owns.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Rooms ───────────────────────────────────────────────────────

    /// Get the room for `key`, creating it with the given defaults if absent.
    async fn ensure_room(
        &self,
        key: &str,
        poll_interval_secs: u64,
        html_enabled: bool,
    ) -> Result<Room, DatabaseError>;

    async fn get_room(&self, key: &str) -> Result<Option<Room>, DatabaseError>;

    /// Delete a room and everything it owns. Returns false if it did not exist.
    async fn delete_room(&self, key: &str) -> Result<bool, DatabaseError>;

    async fn set_html_enabled(&self, room_id: i64, enabled: bool) -> Result<(), DatabaseError>;

    // ── Inbound accounts ────────────────────────────────────────────

    async fn attach_inbound(
        &self,
        room_id: i64,
        account: &NewInboundAccount,
    ) -> Result<InboundAccount, DatabaseError>;

    async fn get_inbound(&self, room_id: i64) -> Result<Option<InboundAccount>, DatabaseError>;

    /// Remove the room's inbound account together with its blocklist.
    async fn detach_inbound(&self, room_id: i64) -> Result<bool, DatabaseError>;

    /// Every room that has an inbound account.
    async fn list_inbound_accounts(&self) -> Result<Vec<RoomInbound>, DatabaseError>;

    async fn is_inbound_username_in_use(&self, username: &str) -> Result<bool, DatabaseError>;

    async fn set_mailbox(&self, inbound_id: i64, mailbox: &str) -> Result<(), DatabaseError>;

    // ── Outbound accounts ───────────────────────────────────────────

    async fn attach_outbound(
        &self,
        room_id: i64,
        account: &NewOutboundAccount,
    ) -> Result<OutboundAccount, DatabaseError>;

    async fn get_outbound(&self, room_id: i64) -> Result<Option<OutboundAccount>, DatabaseError>;

    async fn detach_outbound(&self, room_id: i64) -> Result<bool, DatabaseError>;

    async fn is_outbound_username_in_use(&self, username: &str) -> Result<bool, DatabaseError>;

    // ── Seen mail ───────────────────────────────────────────────────

    /// Record `key` as seen for the room. Returns true only the first time.
    async fn mark_mail_seen(&self, room_id: i64, key: &str) -> Result<bool, DatabaseError>;

    async fn clear_seen_mails(&self, room_id: i64) -> Result<u64, DatabaseError>;

    // ── Blocklist ───────────────────────────────────────────────────

    /// Add a pattern. Returns false if it was already present.
    async fn add_blocklist(&self, inbound_id: i64, pattern: &str) -> Result<bool, DatabaseError>;

    async fn remove_blocklist(&self, inbound_id: i64, pattern: &str) -> Result<bool, DatabaseError>;

    async fn clear_blocklist(&self, inbound_id: i64) -> Result<u64, DatabaseError>;

    async fn list_blocklist(&self, inbound_id: i64) -> Result<Vec<BlocklistEntry>, DatabaseError>;

    // ── Drafts ──────────────────────────────────────────────────────

    /// Start a draft awaiting its subject, replacing any existing one.
    async fn create_draft(
        &self,
        room_id: i64,
        recipients: &[String],
        markdown: bool,
    ) -> Result<Draft, DatabaseError>;

    async fn get_draft(&self, room_id: i64) -> Result<Option<Draft>, DatabaseError>;

    /// Set the subject and move the draft to the body stage.
    async fn set_draft_subject(&self, draft_id: i64, subject: &str) -> Result<(), DatabaseError>;

    /// Append `text` to the draft body as-is.
    async fn append_draft_body(&self, draft_id: i64, text: &str) -> Result<(), DatabaseError>;

    async fn delete_draft(&self, draft_id: i64) -> Result<(), DatabaseError>;

    /// Delete every draft, returning the attachments they held.
    async fn delete_all_drafts(&self) -> Result<Vec<Attachment>, DatabaseError>;

    // ── Attachments ─────────────────────────────────────────────────

    async fn add_attachment(
        &self,
        draft_id: i64,
        file_name: &str,
        staged_name: &str,
    ) -> Result<Attachment, DatabaseError>;

    /// Remove the attachment named `name` (staged or original name).
    async fn remove_attachment(
        &self,
        draft_id: i64,
        name: &str,
    ) -> Result<Option<Attachment>, DatabaseError>;

    async fn list_attachments(&self, draft_id: i64) -> Result<Vec<Attachment>, DatabaseError>;
}
