//! libSQL-backed `ResultSink`.
//!
//! One row per message in the `summaries` table. Supports local file and
//! in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::DedupeMode;
use crate::error::SinkError;
use crate::pipeline::types::Completeness;
use crate::store::migrations;
use crate::store::traits::{OutputRecord, ResultSink, WriteStatus};

const SELECT_COLUMNS: &str =
    "message_id, subject, sender, date, link, body, completeness, missing_chunks, written_at";

/// libSQL summary store.
///
/// The existence check and the insert/update for one message id run under
/// a single async mutex, so concurrent writers never duplicate a record.
pub struct LibSqlSink {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    mode: DedupeMode,
    write_lock: Mutex<()>,
}

impl LibSqlSink {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path, mode: DedupeMode) -> Result<Self, SinkError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| SinkError::Io {
                path: parent.display().to_string(),
                source: e,
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| SinkError::Database(format!("Failed to open libSQL database: {e}")))?;
        let sink = Self::from_database(db, mode).await?;
        info!(path = %path.display(), mode = %mode, "Summary database opened");
        Ok(sink)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory(mode: DedupeMode) -> Result<Self, SinkError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                SinkError::Database(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db, mode).await
    }

    async fn from_database(db: LibSqlDatabase, mode: DedupeMode) -> Result<Self, SinkError> {
        let conn = db
            .connect()
            .map_err(|e| SinkError::Database(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            mode,
            write_lock: Mutex::new(()),
        })
    }

    async fn exists_unlocked(&self, message_id: &str) -> Result<bool, SinkError> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM summaries WHERE message_id = ?1",
                params![message_id],
            )
            .await
            .map_err(|e| SinkError::Database(format!("exists: {e}")))?;
        let row = rows
            .next()
            .await
            .map_err(|e| SinkError::Database(format!("exists: {e}")))?;
        let count: i64 = match row {
            Some(row) => row
                .get(0)
                .map_err(|e| SinkError::Database(format!("exists row parse: {e}")))?,
            None => 0,
        };
        Ok(count > 0)
    }

    async fn upsert(&self, record: &OutputRecord) -> Result<(), SinkError> {
        let missing = serde_json::to_string(&record.missing_chunks)
            .map_err(|e| SinkError::Encoding(e.to_string()))?;
        self.conn
            .execute(
                "INSERT INTO summaries
                    (message_id, subject, sender, date, link, body, completeness, missing_chunks, written_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(message_id) DO UPDATE SET
                    subject = excluded.subject,
                    sender = excluded.sender,
                    date = excluded.date,
                    link = excluded.link,
                    body = excluded.body,
                    completeness = excluded.completeness,
                    missing_chunks = excluded.missing_chunks,
                    written_at = excluded.written_at,
                    updated_at = excluded.updated_at",
                params![
                    record.message_id.as_str(),
                    record.subject.as_str(),
                    record.sender.as_str(),
                    record.date.as_str(),
                    opt_text(record.link.as_deref()),
                    record.body.as_str(),
                    record.completeness.to_string(),
                    missing,
                    record.written_at.to_rfc3339(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| SinkError::Database(format!("upsert summary: {e}")))?;
        Ok(())
    }
}

/// Convert `Option<&str>` to a libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Parse an RFC 3339 timestamp, falling back to the epoch floor.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn row_to_record(row: &libsql::Row) -> Result<OutputRecord, libsql::Error> {
    let completeness: String = row.get(6)?;
    let missing: String = row.get::<String>(7).unwrap_or_else(|_| "[]".into());
    let written_at: String = row.get(8)?;

    Ok(OutputRecord {
        message_id: row.get(0)?,
        subject: row.get(1)?,
        sender: row.get(2)?,
        date: row.get(3)?,
        link: row.get(4).ok(),
        body: row.get(5)?,
        completeness: completeness.parse().unwrap_or(Completeness::Complete),
        missing_chunks: serde_json::from_str(&missing).unwrap_or_default(),
        written_at: parse_datetime(&written_at),
    })
}

#[async_trait]
impl ResultSink for LibSqlSink {
    fn name(&self) -> &str {
        "libsql"
    }

    fn dedupe_mode(&self) -> DedupeMode {
        self.mode
    }

    async fn store(&self, record: &OutputRecord) -> Result<WriteStatus, SinkError> {
        let _guard = self.write_lock.lock().await;

        let exists = self.exists_unlocked(&record.message_id).await?;
        let status = match (exists, self.mode) {
            (true, DedupeMode::SkipIfExists) => {
                debug!(id = %record.message_id, "Record exists, skipping");
                return Ok(WriteStatus::Skipped);
            }
            (true, DedupeMode::Replace) => WriteStatus::Replaced,
            (false, _) => WriteStatus::Written,
        };

        self.upsert(record).await?;
        debug!(id = %record.message_id, status = %status, "Record stored");
        Ok(status)
    }

    async fn get(&self, message_id: &str) -> Result<Option<OutputRecord>, SinkError> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {SELECT_COLUMNS} FROM summaries WHERE message_id = ?1"),
                params![message_id],
            )
            .await
            .map_err(|e| SinkError::Database(format!("get: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let record = row_to_record(&row)
                    .map_err(|e| SinkError::Database(format!("get row parse: {e}")))?;
                Ok(Some(record))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(SinkError::Database(format!("get: {e}"))),
        }
    }

    async fn count(&self) -> Result<usize, SinkError> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM summaries", ())
            .await
            .map_err(|e| SinkError::Database(format!("count: {e}")))?;
        let count: i64 = match rows
            .next()
            .await
            .map_err(|e| SinkError::Database(format!("count: {e}")))?
        {
            Some(row) => row
                .get(0)
                .map_err(|e| SinkError::Database(format!("count row parse: {e}")))?,
            None => 0,
        };
        Ok(count as usize)
    }

    async fn exists(&self, message_id: &str) -> Result<bool, SinkError> {
        self.exists_unlocked(message_id).await
    }
}
