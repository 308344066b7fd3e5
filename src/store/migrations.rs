//! Schema upgrades for the bridge database.
//!
//! Applied versions are recorded in `schema_versions`; on open only the
//! steps above the recorded maximum run, in order.

use libsql::Connection;

use crate::error::DatabaseError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Append only. Versions must increase.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "bridge_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS rooms (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                room_key TEXT NOT NULL UNIQUE,
                poll_interval_secs INTEGER NOT NULL,
                html_enabled INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS inbound_accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                room_id INTEGER NOT NULL UNIQUE REFERENCES rooms(id) ON DELETE CASCADE,
                host TEXT NOT NULL,
                username TEXT NOT NULL,
                secret TEXT NOT NULL,
                mailbox TEXT NOT NULL DEFAULT 'INBOX',
                verify_tls INTEGER NOT NULL DEFAULT 1
            );
            CREATE INDEX IF NOT EXISTS idx_inbound_username ON inbound_accounts(username);

            CREATE TABLE IF NOT EXISTS outbound_accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                room_id INTEGER NOT NULL UNIQUE REFERENCES rooms(id) ON DELETE CASCADE,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                username TEXT NOT NULL,
                secret TEXT NOT NULL,
                verify_tls INTEGER NOT NULL DEFAULT 1
            );
            CREATE INDEX IF NOT EXISTS idx_outbound_username ON outbound_accounts(username);

            CREATE TABLE IF NOT EXISTS seen_mails (
                room_id INTEGER NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
                mail_key TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE (room_id, mail_key)
            );

            CREATE TABLE IF NOT EXISTS blocklist (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                inbound_id INTEGER NOT NULL REFERENCES inbound_accounts(id) ON DELETE CASCADE,
                pattern TEXT NOT NULL,
                UNIQUE (inbound_id, pattern)
            );
        "#,
    },
    Migration {
        version: 2,
        name: "compose_drafts",
        sql: r#"
            CREATE TABLE IF NOT EXISTS drafts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                room_id INTEGER NOT NULL UNIQUE REFERENCES rooms(id) ON DELETE CASCADE,
                recipients TEXT NOT NULL,
                subject TEXT NOT NULL DEFAULT '',
                body TEXT NOT NULL DEFAULT '',
                markdown INTEGER NOT NULL DEFAULT 1,
                stage TEXT NOT NULL DEFAULT 'awaiting_subject',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS draft_attachments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                draft_id INTEGER NOT NULL REFERENCES drafts(id) ON DELETE CASCADE,
                file_name TEXT NOT NULL,
                staged_name TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_draft_attachments_draft ON draft_attachments(draft_id);
        "#,
    },
];

/// Bring the schema up to the newest version.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_versions (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| migration_err("create schema_versions", e))?;

    let applied = applied_version(conn).await?;
    let pending = MIGRATIONS.iter().filter(|m| m.version > applied);
    let mut latest = applied;
    for step in pending {
        tracing::info!(version = step.version, name = step.name, "Upgrading schema");
        conn.execute_batch(step.sql)
            .await
            .map_err(|e| migration_err(&format!("V{} {}", step.version, step.name), e))?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_versions (version, name) VALUES (?1, ?2)",
            libsql::params![step.version, step.name],
        )
        .await
        .map_err(|e| migration_err(&format!("record V{}", step.version), e))?;
        latest = step.version;
    }

    if latest != applied {
        tracing::info!(from = applied, to = latest, "Schema upgraded");
    }
    Ok(())
}

async fn applied_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_versions", ())
        .await
        .map_err(|e| migration_err("read schema version", e))?;
    match rows
        .next()
        .await
        .map_err(|e| migration_err("read schema version", e))?
    {
        Some(row) => row
            .get::<i64>(0)
            .map_err(|e| migration_err("read schema version", e)),
        None => Ok(0),
    }
}

fn migration_err(step: &str, e: libsql::Error) -> DatabaseError {
    DatabaseError::Migration(format!("{step}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_conn() -> Connection {
        libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap()
            .connect()
            .unwrap()
    }

    async fn table_names(conn: &Connection) -> Vec<String> {
        let mut rows = conn
            .query("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name", ())
            .await
            .unwrap();
        let mut names = Vec::new();
        while let Some(row) = rows.next().await.unwrap() {
            names.push(row.get::<String>(0).unwrap());
        }
        names
    }

    #[tokio::test]
    async fn fresh_database_gets_every_table() {
        let conn = memory_conn().await;
        run_migrations(&conn).await.unwrap();

        let names = table_names(&conn).await;
        for table in [
            "schema_versions",
            "rooms",
            "inbound_accounts",
            "outbound_accounts",
            "seen_mails",
            "blocklist",
            "drafts",
            "draft_attachments",
        ] {
            assert!(names.iter().any(|n| n == table), "missing {table}");
        }
        assert_eq!(applied_version(&conn).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn rerun_is_a_no_op() {
        let conn = memory_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT COUNT(*) FROM schema_versions", ())
            .await
            .unwrap();
        let count: i64 = rows.next().await.unwrap().unwrap().get(0).unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn upgrades_from_first_version() {
        let conn = memory_conn().await;
        conn.execute_batch(MIGRATIONS[0].sql).await.unwrap();
        conn.execute_batch(
            "CREATE TABLE schema_versions (version INTEGER PRIMARY KEY, name TEXT NOT NULL, applied_at TEXT NOT NULL DEFAULT (datetime('now')));
             INSERT INTO schema_versions (version, name) VALUES (1, 'bridge_schema');",
        )
        .await
        .unwrap();
        assert!(!table_names(&conn).await.iter().any(|n| n == "drafts"));

        run_migrations(&conn).await.unwrap();
        assert!(table_names(&conn).await.iter().any(|n| n == "drafts"));
        assert_eq!(applied_version(&conn).await.unwrap(), 2);
    }
}
