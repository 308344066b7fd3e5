//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases over a single shared
//! connection. Foreign keys are enabled so deleting a room cascades to its
//! accounts, drafts, attachments, blocklist and seen-mail records.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::model::{
    Attachment, BlocklistEntry, ComposeStage, Draft, InboundAccount, NewInboundAccount,
    NewOutboundAccount, OutboundAccount, Room, RoomInbound, join_recipients, split_recipients,
};
use crate::store::secret::{decode_secret, encode_secret};
use crate::store::traits::Database;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn init_schema(&self) -> Result<(), DatabaseError> {
        self.conn()
            .execute_batch("PRAGMA foreign_keys = ON;")
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to enable foreign keys: {e}")))?;
        migrations::run_migrations(self.conn()).await
    }

    /// Run a query expected to return at most one row and map it.
    async fn query_one<T>(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
        map: impl FnOnce(&libsql::Row) -> Result<T, DatabaseError>,
    ) -> Result<Option<T>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| query_err(op, e))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(Some(map(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(query_err(op, e)),
        }
    }

    /// Run a query and map every row.
    async fn query_all<T>(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
        map: impl Fn(&libsql::Row) -> Result<T, DatabaseError>,
    ) -> Result<Vec<T>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| query_err(op, e))?;
        let mut out = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => out.push(map(&row)?),
                Ok(None) => break,
                Err(e) => return Err(query_err(op, e)),
            }
        }
        Ok(out)
    }

    async fn execute(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<u64, DatabaseError> {
        self.conn()
            .execute(sql, params)
            .await
            .map_err(|e| query_err(op, e))
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Map a libsql error, singling out constraint violations.
fn query_err(op: &str, e: libsql::Error) -> DatabaseError {
    let msg = e.to_string();
    if msg.contains("constraint failed") {
        DatabaseError::Constraint(format!("{op}: {msg}"))
    } else {
        DatabaseError::Query(format!("{op}: {msg}"))
    }
}

fn row_err(op: &str) -> impl Fn(libsql::Error) -> DatabaseError + '_ {
    move |e| DatabaseError::Query(format!("{op} row parse: {e}"))
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

const ROOM_COLUMNS: &str = "id, room_key, poll_interval_secs, html_enabled, created_at";

const INBOUND_COLUMNS: &str = "id, room_id, host, username, secret, mailbox, verify_tls";

const OUTBOUND_COLUMNS: &str = "id, room_id, host, port, username, secret, verify_tls";

const DRAFT_COLUMNS: &str =
    "id, room_id, recipients, subject, body, markdown, stage, created_at, updated_at";

const ATTACHMENT_COLUMNS: &str = "id, draft_id, file_name, staged_name";

/// Map a row starting at `offset` to a Room (ROOM_COLUMNS order).
fn row_to_room(row: &libsql::Row, offset: i32) -> Result<Room, DatabaseError> {
    let e = row_err("room");
    let interval: i64 = row.get(offset + 2).map_err(&e)?;
    let html: i64 = row.get(offset + 3).map_err(&e)?;
    let created: String = row.get(offset + 4).map_err(&e)?;
    Ok(Room {
        id: row.get(offset).map_err(&e)?,
        key: row.get(offset + 1).map_err(&e)?,
        poll_interval_secs: interval.max(1) as u64,
        html_enabled: html != 0,
        created_at: parse_datetime(&created),
    })
}

fn row_to_inbound(row: &libsql::Row, offset: i32) -> Result<InboundAccount, DatabaseError> {
    let e = row_err("inbound_account");
    let secret: String = row.get(offset + 4).map_err(&e)?;
    let verify: i64 = row.get(offset + 6).map_err(&e)?;
    Ok(InboundAccount {
        id: row.get(offset).map_err(&e)?,
        room_id: row.get(offset + 1).map_err(&e)?,
        host: row.get(offset + 2).map_err(&e)?,
        username: row.get(offset + 3).map_err(&e)?,
        secret: decode_secret(&secret)?,
        mailbox: row.get(offset + 5).map_err(&e)?,
        verify_tls: verify != 0,
    })
}

fn row_to_outbound(row: &libsql::Row) -> Result<OutboundAccount, DatabaseError> {
    let e = row_err("outbound_account");
    let port: i64 = row.get(3).map_err(&e)?;
    let secret: String = row.get(5).map_err(&e)?;
    let verify: i64 = row.get(6).map_err(&e)?;
    Ok(OutboundAccount {
        id: row.get(0).map_err(&e)?,
        room_id: row.get(1).map_err(&e)?,
        host: row.get(2).map_err(&e)?,
        port: u16::try_from(port)
            .map_err(|_| DatabaseError::Serialization(format!("port {port} out of range")))?,
        username: row.get(4).map_err(&e)?,
        secret: decode_secret(&secret)?,
        verify_tls: verify != 0,
    })
}

fn row_to_draft(row: &libsql::Row) -> Result<Draft, DatabaseError> {
    let e = row_err("draft");
    let recipients: String = row.get(2).map_err(&e)?;
    let markdown: i64 = row.get(5).map_err(&e)?;
    let stage: String = row.get(6).map_err(&e)?;
    let created: String = row.get(7).map_err(&e)?;
    let updated: String = row.get(8).map_err(&e)?;
    Ok(Draft {
        id: row.get(0).map_err(&e)?,
        room_id: row.get(1).map_err(&e)?,
        recipients: split_recipients(&recipients),
        subject: row.get(3).map_err(&e)?,
        body: row.get(4).map_err(&e)?,
        markdown: markdown != 0,
        stage: ComposeStage::parse(&stage),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

fn row_to_attachment(row: &libsql::Row) -> Result<Attachment, DatabaseError> {
    let e = row_err("attachment");
    Ok(Attachment {
        id: row.get(0).map_err(&e)?,
        draft_id: row.get(1).map_err(&e)?,
        file_name: row.get(2).map_err(&e)?,
        staged_name: row.get(3).map_err(&e)?,
    })
}

fn row_to_blocklist(row: &libsql::Row) -> Result<BlocklistEntry, DatabaseError> {
    let e = row_err("blocklist");
    Ok(BlocklistEntry {
        id: row.get(0).map_err(&e)?,
        inbound_id: row.get(1).map_err(&e)?,
        pattern: row.get(2).map_err(&e)?,
    })
}

fn returned_id(row: &libsql::Row) -> Result<i64, DatabaseError> {
    row.get(0).map_err(row_err("returning id"))
}

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Rooms ───────────────────────────────────────────────────────

    async fn ensure_room(
        &self,
        key: &str,
        poll_interval_secs: u64,
        html_enabled: bool,
    ) -> Result<Room, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.execute(
            "ensure_room",
            "INSERT OR IGNORE INTO rooms (room_key, poll_interval_secs, html_enabled, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                key,
                poll_interval_secs.max(1) as i64,
                html_enabled as i64,
                now
            ],
        )
        .await?;

        self.get_room(key).await?.ok_or_else(|| DatabaseError::NotFound {
            entity: "room".into(),
            id: key.to_string(),
        })
    }

    async fn get_room(&self, key: &str) -> Result<Option<Room>, DatabaseError> {
        self.query_one(
            "get_room",
            &format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE room_key = ?1"),
            params![key],
            |row| row_to_room(row, 0),
        )
        .await
    }

    async fn delete_room(&self, key: &str) -> Result<bool, DatabaseError> {
        let n = self
            .execute("delete_room", "DELETE FROM rooms WHERE room_key = ?1", params![key])
            .await?;
        debug!(room = key, deleted = n > 0, "Room deleted");
        Ok(n > 0)
    }

    async fn set_html_enabled(&self, room_id: i64, enabled: bool) -> Result<(), DatabaseError> {
        self.execute(
            "set_html_enabled",
            "UPDATE rooms SET html_enabled = ?1 WHERE id = ?2",
            params![enabled as i64, room_id],
        )
        .await?;
        Ok(())
    }

    // ── Inbound accounts ────────────────────────────────────────────

    async fn attach_inbound(
        &self,
        room_id: i64,
        account: &NewInboundAccount,
    ) -> Result<InboundAccount, DatabaseError> {
        let id = self
            .query_one(
                "attach_inbound",
                "INSERT INTO inbound_accounts (room_id, host, username, secret, mailbox, verify_tls)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) RETURNING id",
                params![
                    room_id,
                    account.host.as_str(),
                    account.username.as_str(),
                    encode_secret(&account.secret),
                    account.mailbox.as_str(),
                    account.verify_tls as i64
                ],
                returned_id,
            )
            .await?
            .ok_or_else(|| DatabaseError::Query("attach_inbound: no id returned".into()))?;

        Ok(InboundAccount {
            id,
            room_id,
            host: account.host.clone(),
            username: account.username.clone(),
            secret: account.secret.clone(),
            mailbox: account.mailbox.clone(),
            verify_tls: account.verify_tls,
        })
    }

    async fn get_inbound(&self, room_id: i64) -> Result<Option<InboundAccount>, DatabaseError> {
        self.query_one(
            "get_inbound",
            &format!("SELECT {INBOUND_COLUMNS} FROM inbound_accounts WHERE room_id = ?1"),
            params![room_id],
            |row| row_to_inbound(row, 0),
        )
        .await
    }

    async fn detach_inbound(&self, room_id: i64) -> Result<bool, DatabaseError> {
        let n = self
            .execute(
                "detach_inbound",
                "DELETE FROM inbound_accounts WHERE room_id = ?1",
                params![room_id],
            )
            .await?;
        Ok(n > 0)
    }

    async fn list_inbound_accounts(&self) -> Result<Vec<RoomInbound>, DatabaseError> {
        self.query_all(
            "list_inbound_accounts",
            "SELECT r.id, r.room_key, r.poll_interval_secs, r.html_enabled, r.created_at,
                    a.id, a.room_id, a.host, a.username, a.secret, a.mailbox, a.verify_tls
             FROM inbound_accounts a JOIN rooms r ON r.id = a.room_id
             ORDER BY r.id",
            (),
            |row| {
                Ok(RoomInbound {
                    room: row_to_room(row, 0)?,
                    account: row_to_inbound(row, 5)?,
                })
            },
        )
        .await
    }

    async fn is_inbound_username_in_use(&self, username: &str) -> Result<bool, DatabaseError> {
        let count = self
            .query_one(
                "is_inbound_username_in_use",
                "SELECT COUNT(*) FROM inbound_accounts WHERE username = ?1",
                params![username],
                |row| row.get::<i64>(0).map_err(row_err("count")),
            )
            .await?
            .unwrap_or(0);
        Ok(count > 0)
    }

    async fn set_mailbox(&self, inbound_id: i64, mailbox: &str) -> Result<(), DatabaseError> {
        let n = self
            .execute(
                "set_mailbox",
                "UPDATE inbound_accounts SET mailbox = ?1 WHERE id = ?2",
                params![mailbox, inbound_id],
            )
            .await?;
        if n == 0 {
            return Err(DatabaseError::NotFound {
                entity: "inbound_account".into(),
                id: inbound_id.to_string(),
            });
        }
        Ok(())
    }

    // ── Outbound accounts ───────────────────────────────────────────

    async fn attach_outbound(
        &self,
        room_id: i64,
        account: &NewOutboundAccount,
    ) -> Result<OutboundAccount, DatabaseError> {
        let id = self
            .query_one(
                "attach_outbound",
                "INSERT INTO outbound_accounts (room_id, host, port, username, secret, verify_tls)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) RETURNING id",
                params![
                    room_id,
                    account.host.as_str(),
                    account.port as i64,
                    account.username.as_str(),
                    encode_secret(&account.secret),
                    account.verify_tls as i64
                ],
                returned_id,
            )
            .await?
            .ok_or_else(|| DatabaseError::Query("attach_outbound: no id returned".into()))?;

        Ok(OutboundAccount {
            id,
            room_id,
            host: account.host.clone(),
            port: account.port,
            username: account.username.clone(),
            secret: account.secret.clone(),
            verify_tls: account.verify_tls,
        })
    }

    async fn get_outbound(&self, room_id: i64) -> Result<Option<OutboundAccount>, DatabaseError> {
        self.query_one(
            "get_outbound",
            &format!("SELECT {OUTBOUND_COLUMNS} FROM outbound_accounts WHERE room_id = ?1"),
            params![room_id],
            row_to_outbound,
        )
        .await
    }

    async fn detach_outbound(&self, room_id: i64) -> Result<bool, DatabaseError> {
        let n = self
            .execute(
                "detach_outbound",
                "DELETE FROM outbound_accounts WHERE room_id = ?1",
                params![room_id],
            )
            .await?;
        Ok(n > 0)
    }

    async fn is_outbound_username_in_use(&self, username: &str) -> Result<bool, DatabaseError> {
        let count = self
            .query_one(
                "is_outbound_username_in_use",
                "SELECT COUNT(*) FROM outbound_accounts WHERE username = ?1",
                params![username],
                |row| row.get::<i64>(0).map_err(row_err("count")),
            )
            .await?
            .unwrap_or(0);
        Ok(count > 0)
    }

    // ── Seen mail ───────────────────────────────────────────────────

    async fn mark_mail_seen(&self, room_id: i64, key: &str) -> Result<bool, DatabaseError> {
        let n = self
            .execute(
                "mark_mail_seen",
                "INSERT OR IGNORE INTO seen_mails (room_id, mail_key, created_at) VALUES (?1, ?2, ?3)",
                params![room_id, key, Utc::now().to_rfc3339()],
            )
            .await?;
        Ok(n == 1)
    }

    async fn clear_seen_mails(&self, room_id: i64) -> Result<u64, DatabaseError> {
        self.execute(
            "clear_seen_mails",
            "DELETE FROM seen_mails WHERE room_id = ?1",
            params![room_id],
        )
        .await
    }

    // ── Blocklist ───────────────────────────────────────────────────

    async fn add_blocklist(&self, inbound_id: i64, pattern: &str) -> Result<bool, DatabaseError> {
        let n = self
            .execute(
                "add_blocklist",
                "INSERT OR IGNORE INTO blocklist (inbound_id, pattern) VALUES (?1, ?2)",
                params![inbound_id, pattern],
            )
            .await?;
        Ok(n == 1)
    }

    async fn remove_blocklist(&self, inbound_id: i64, pattern: &str) -> Result<bool, DatabaseError> {
        let n = self
            .execute(
                "remove_blocklist",
                "DELETE FROM blocklist WHERE inbound_id = ?1 AND pattern = ?2",
                params![inbound_id, pattern],
            )
            .await?;
        Ok(n > 0)
    }

    async fn clear_blocklist(&self, inbound_id: i64) -> Result<u64, DatabaseError> {
        self.execute(
            "clear_blocklist",
            "DELETE FROM blocklist WHERE inbound_id = ?1",
            params![inbound_id],
        )
        .await
    }

    async fn list_blocklist(&self, inbound_id: i64) -> Result<Vec<BlocklistEntry>, DatabaseError> {
        self.query_all(
            "list_blocklist",
            "SELECT id, inbound_id, pattern FROM blocklist WHERE inbound_id = ?1 ORDER BY id",
            params![inbound_id],
            row_to_blocklist,
        )
        .await
    }

    // ── Drafts ──────────────────────────────────────────────────────

    async fn create_draft(
        &self,
        room_id: i64,
        recipients: &[String],
        markdown: bool,
    ) -> Result<Draft, DatabaseError> {
        let replaced = self
            .execute(
                "create_draft",
                "DELETE FROM drafts WHERE room_id = ?1",
                params![room_id],
            )
            .await?;
        if replaced > 0 {
            debug!(room_id, "Replaced existing draft");
        }

        let now = Utc::now();
        let id = self
            .query_one(
                "create_draft",
                "INSERT INTO drafts (room_id, recipients, subject, body, markdown, stage, created_at, updated_at)
                 VALUES (?1, ?2, '', '', ?3, ?4, ?5, ?5) RETURNING id",
                params![
                    room_id,
                    join_recipients(recipients),
                    markdown as i64,
                    ComposeStage::AwaitingSubject.as_str(),
                    now.to_rfc3339()
                ],
                returned_id,
            )
            .await?
            .ok_or_else(|| DatabaseError::Query("create_draft: no id returned".into()))?;

        Ok(Draft {
            id,
            room_id,
            recipients: recipients.to_vec(),
            subject: String::new(),
            body: String::new(),
            markdown,
            stage: ComposeStage::AwaitingSubject,
            created_at: now,
            updated_at: now,
        })
    }

    async fn get_draft(&self, room_id: i64) -> Result<Option<Draft>, DatabaseError> {
        self.query_one(
            "get_draft",
            &format!("SELECT {DRAFT_COLUMNS} FROM drafts WHERE room_id = ?1"),
            params![room_id],
            row_to_draft,
        )
        .await
    }

    async fn set_draft_subject(&self, draft_id: i64, subject: &str) -> Result<(), DatabaseError> {
        let n = self
            .execute(
                "set_draft_subject",
                "UPDATE drafts SET subject = ?1, stage = ?2, updated_at = ?3 WHERE id = ?4",
                params![
                    subject,
                    ComposeStage::AwaitingBody.as_str(),
                    Utc::now().to_rfc3339(),
                    draft_id
                ],
            )
            .await?;
        if n == 0 {
            return Err(DatabaseError::NotFound {
                entity: "draft".into(),
                id: draft_id.to_string(),
            });
        }
        Ok(())
    }

    async fn append_draft_body(&self, draft_id: i64, text: &str) -> Result<(), DatabaseError> {
        let n = self
            .execute(
                "append_draft_body",
                "UPDATE drafts SET body = body || ?1, updated_at = ?2 WHERE id = ?3",
                params![text, Utc::now().to_rfc3339(), draft_id],
            )
            .await?;
        if n == 0 {
            return Err(DatabaseError::NotFound {
                entity: "draft".into(),
                id: draft_id.to_string(),
            });
        }
        Ok(())
    }

    async fn delete_draft(&self, draft_id: i64) -> Result<(), DatabaseError> {
        self.execute("delete_draft", "DELETE FROM drafts WHERE id = ?1", params![draft_id])
            .await?;
        Ok(())
    }

    async fn delete_all_drafts(&self) -> Result<Vec<Attachment>, DatabaseError> {
        let attachments = self
            .query_all(
                "delete_all_drafts",
                &format!("SELECT {ATTACHMENT_COLUMNS} FROM draft_attachments ORDER BY id"),
                (),
                row_to_attachment,
            )
            .await?;
        let n = self
            .execute("delete_all_drafts", "DELETE FROM drafts", ())
            .await?;
        info!(drafts = n, attachments = attachments.len(), "Stale drafts removed");
        Ok(attachments)
    }

    // ── Attachments ─────────────────────────────────────────────────

    async fn add_attachment(
        &self,
        draft_id: i64,
        file_name: &str,
        staged_name: &str,
    ) -> Result<Attachment, DatabaseError> {
        let id = self
            .query_one(
                "add_attachment",
                "INSERT INTO draft_attachments (draft_id, file_name, staged_name)
                 VALUES (?1, ?2, ?3) RETURNING id",
                params![draft_id, file_name, staged_name],
                returned_id,
            )
            .await?
            .ok_or_else(|| DatabaseError::Query("add_attachment: no id returned".into()))?;

        Ok(Attachment {
            id,
            draft_id,
            file_name: file_name.to_string(),
            staged_name: staged_name.to_string(),
        })
    }

    async fn remove_attachment(
        &self,
        draft_id: i64,
        name: &str,
    ) -> Result<Option<Attachment>, DatabaseError> {
        let Some(found) = self
            .list_attachments(draft_id)
            .await?
            .into_iter()
            .find(|a| a.matches(name))
        else {
            return Ok(None);
        };

        self.execute(
            "remove_attachment",
            "DELETE FROM draft_attachments WHERE id = ?1",
            params![found.id],
        )
        .await?;
        Ok(Some(found))
    }

    async fn list_attachments(&self, draft_id: i64) -> Result<Vec<Attachment>, DatabaseError> {
        self.query_all(
            "list_attachments",
            &format!(
                "SELECT {ATTACHMENT_COLUMNS} FROM draft_attachments WHERE draft_id = ?1 ORDER BY id"
            ),
            params![draft_id],
            row_to_attachment,
        )
        .await
    }
}
