use crate::modem::sms::SmsRecord;
use anyhow::{anyhow, bail, Result};
use chrono::NaiveDateTime;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use tracing::log::debug;

const SCHEMA_SQL: &str = include_str!("schemas/sqlite.sql");

/// A persisted message, as stored by the reconciliation loop.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSms {
    pub id: i64,
    pub sender: String,
    pub content: String,
    pub status: String,
    pub received_at: NaiveDateTime,
    pub modem_index: i32,
    pub created_at: NaiveDateTime,
}

pub struct SmsDatabase {
    pool: SqlitePool,
}
impl SmsDatabase {
    pub async fn connect(db_path: &str) -> Result<Self> {
        let connection_options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(connection_options)
            .await
            .map_err(|e| anyhow!(e))?;

        let db = Self { pool };
        db.init_tables().await?;
        Ok(db)
    }

    async fn init_tables(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&self.pool)
            .await
            .map_err(|e| anyhow!(e))?;

        debug!("SmsDatabase tables initialized");
        Ok(())
    }

    /// Insert a message unless `(sender, content, received_at)` is already
    /// present. Returns the row id either way, plus whether the row is new.
    /// Re-running reconciliation over the same inbox is a no-op.
    pub async fn insert_sms(&self, sms: &SmsRecord) -> Result<(i64, bool)> {
        let mut tx = self.pool.begin().await.map_err(|e| anyhow!(e))?;

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM sms WHERE sender = ? AND content = ? AND received_at = ? LIMIT 1",
        )
        .bind(&sms.sender)
        .bind(&sms.content)
        .bind(sms.received_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| anyhow!(e))?;

        if let Some(id) = existing {
            return Ok((id, false));
        }

        let result = sqlx::query(
            "INSERT INTO sms (sender, content, status, received_at, modem_index) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&sms.sender)
        .bind(&sms.content)
        .bind(&sms.status)
        .bind(sms.received_at)
        .bind(sms.modem_index)
        .execute(&mut *tx)
        .await
        .map_err(|e| anyhow!(e))?;

        tx.commit().await.map_err(|e| anyhow!(e))?;
        Ok((result.last_insert_rowid(), true))
    }

    pub async fn get_sms(&self, id: i64) -> Result<Option<StoredSms>> {
        let row = sqlx::query(
            "SELECT id, sender, content, status, received_at, modem_index, created_at FROM sms WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;

        row.map(row_to_stored).transpose()
    }

    pub async fn get_sms_range(&self, start_id: i64, end_id: i64) -> Result<Vec<StoredSms>> {
        if start_id > end_id {
            bail!("invalid id range: {start_id} > {end_id}");
        }

        let rows = sqlx::query(
            "SELECT id, sender, content, status, received_at, modem_index, created_at FROM sms WHERE id >= ? AND id <= ? ORDER BY id ASC",
        )
        .bind(start_id)
        .bind(end_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;

        rows.into_iter().map(row_to_stored).collect()
    }

    pub async fn count(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM sms")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| anyhow!(e))
    }
}

fn row_to_stored(row: sqlx::sqlite::SqliteRow) -> Result<StoredSms> {
    Ok(StoredSms {
        id: row.get("id"),
        sender: row.get("sender"),
        content: row.get("content"),
        status: row.get("status"),
        received_at: row.get("received_at"),
        modem_index: row.get("modem_index"),
        created_at: row.get("created_at"),
    })
}
