//! Version-tracked migrations for the libSQL summary store.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones, in order.

use libsql::Connection;

use crate::error::SinkError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "summaries",
        sql: r#"
            CREATE TABLE IF NOT EXISTS summaries (
                message_id TEXT PRIMARY KEY,
                subject TEXT NOT NULL,
                sender TEXT NOT NULL,
                date TEXT NOT NULL,
                link TEXT,
                body TEXT NOT NULL,
                completeness TEXT NOT NULL DEFAULT 'complete',
                written_at TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_summaries_written ON summaries(written_at);
        "#,
    },
    Migration {
        version: 2,
        name: "missing_chunks",
        sql: r#"
            ALTER TABLE summaries ADD COLUMN missing_chunks TEXT NOT NULL DEFAULT '[]';
            CREATE INDEX IF NOT EXISTS idx_summaries_completeness ON summaries(completeness);
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), SinkError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| SinkError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;
    let pending = MIGRATIONS.iter().filter(|m| m.version > current_version);
    let mut applied = 0;
    for migration in pending {
        apply(conn, migration).await?;
        applied += 1;
    }

    if applied > 0 {
        let version = get_current_version(conn).await?;
        tracing::info!(applied, version, "Summary store schema updated");
    }
    Ok(())
}

/// Apply one migration and record its version in the same transaction.
async fn apply(conn: &Connection, migration: &Migration) -> Result<(), SinkError> {
    tracing::info!(
        version = migration.version,
        name = migration.name,
        "Applying migration"
    );
    let batch = format!(
        "BEGIN;\n{}\nINSERT INTO _migrations (version, name) VALUES ({}, '{}');\nCOMMIT;",
        migration.sql, migration.version, migration.name
    );
    if let Err(e) = conn.execute_batch(&batch).await {
        // Leaves the connection usable; the schema is unchanged.
        let _ = conn.execute("ROLLBACK", ()).await;
        return Err(SinkError::Migration(format!(
            "Migration V{} ({}) failed: {e}",
            migration.version, migration.name
        )));
    }
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, SinkError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| SinkError::Migration(format!("Failed to query migration version: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => row
            .get::<i64>(0)
            .map_err(|e| SinkError::Migration(format!("Failed to parse migration version: {e}"))),
        Ok(None) => Ok(0),
        Err(e) => Err(SinkError::Migration(format!(
            "Failed to read migration version: {e}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_create_summary_table() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &["summaries", "_migrations"] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let count: i64 = row.get(0).unwrap();
            assert_eq!(count, 1, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn failed_migration_leaves_no_version_row() {
        let conn = test_conn().await;
        conn.execute(
            "CREATE TABLE _migrations (version INTEGER PRIMARY KEY, name TEXT NOT NULL, applied_at TEXT)",
            (),
        )
        .await
        .unwrap();
        let broken = Migration {
            version: 1,
            name: "broken",
            sql: "CREATE TABLE t (id TEXT); CREATE TABL oops;",
        };

        assert!(apply(&conn, &broken).await.is_err());
        assert_eq!(get_current_version(&conn).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn upgrade_from_v1_keeps_rows() {
        let conn = test_conn().await;
        conn.execute(
            "CREATE TABLE _migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            (),
        )
        .await
        .unwrap();
        apply(&conn, &MIGRATIONS[0]).await.unwrap();
        conn.execute(
            "INSERT INTO summaries (message_id, subject, sender, date, body, written_at)
             VALUES ('m1', 's', 'a', 'd', 'b', '2025-01-01T00:00:00Z')",
            (),
        )
        .await
        .unwrap();

        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT missing_chunks FROM summaries WHERE message_id = 'm1'", ())
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        let missing: String = row.get(0).unwrap();
        assert_eq!(missing, "[]");
    }
}
