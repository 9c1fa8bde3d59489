use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sagaflow_workflow::SagaInstance;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use crate::types::LogEntry;
use crate::{LogError, SagaLog};

const CREATE_TABLE: &str = r#"
  CREATE TABLE IF NOT EXISTS saga_log (
    sequence        INTEGER PRIMARY KEY AUTOINCREMENT,
    saga_id         TEXT NOT NULL,
    definition_name TEXT NOT NULL,
    status          TEXT NOT NULL,
    recorded_at     TEXT NOT NULL,
    snapshot        TEXT NOT NULL
  )
"#;

const CREATE_INDEX: &str = r#"
  CREATE INDEX IF NOT EXISTS saga_log_saga_id ON saga_log (saga_id, sequence)
"#;

/// SQLite-backed saga log.
pub struct SqliteLog {
  pool: SqlitePool,
}

impl SqliteLog {
  /// Create a log on an existing connection pool.
  ///
  /// Call [`SqliteLog::migrate`] before use.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Open (creating if missing) the database at `url` and migrate it.
  ///
  /// `url` is an SQLite URL such as `sqlite:///var/lib/sagaflow/saga.db`.
  pub async fn connect(url: &str) -> Result<Self, LogError> {
    let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    let log = Self::new(pool);
    log.migrate().await?;
    Ok(log)
  }

  /// Create the log table if it does not exist.
  pub async fn migrate(&self) -> Result<(), LogError> {
    sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
    sqlx::query(CREATE_INDEX).execute(&self.pool).await?;
    Ok(())
  }
}

#[async_trait]
impl SagaLog for SqliteLog {
  async fn append(&self, instance: &SagaInstance) -> Result<(), LogError> {
    let snapshot = serde_json::to_string(instance)?;

    sqlx::query(
      r#"
            INSERT INTO saga_log (saga_id, definition_name, status, recorded_at, snapshot)
            VALUES (?, ?, ?, ?, ?)
            "#,
    )
    .bind(&instance.id)
    .bind(&instance.definition_name)
    .bind(instance.status.as_str())
    .bind(instance.last_activity)
    .bind(snapshot)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn load_unfinished(&self) -> Result<Vec<SagaInstance>, LogError> {
    let rows: Vec<(String,)> = sqlx::query_as(
      r#"
            SELECT l.snapshot
            FROM saga_log l
            JOIN (
              SELECT saga_id, MAX(sequence) AS latest
              FROM saga_log
              GROUP BY saga_id
            ) m ON l.sequence = m.latest
            WHERE l.status IN ('running', 'compensating', 'compensation_failed')
            ORDER BY l.sequence ASC
            "#,
    )
    .fetch_all(&self.pool)
    .await?;

    rows
      .into_iter()
      .map(|(snapshot,)| serde_json::from_str(&snapshot).map_err(LogError::from))
      .collect()
  }

  async fn history(&self, saga_id: &str) -> Result<Vec<LogEntry>, LogError> {
    let rows: Vec<(i64, String, DateTime<Utc>, String)> = sqlx::query_as(
      r#"
            SELECT sequence, saga_id, recorded_at, snapshot
            FROM saga_log
            WHERE saga_id = ?
            ORDER BY sequence ASC
            "#,
    )
    .bind(saga_id)
    .fetch_all(&self.pool)
    .await?;

    rows
      .into_iter()
      .map(|(sequence, saga_id, recorded_at, snapshot)| {
        let snapshot: SagaInstance = serde_json::from_str(&snapshot)?;
        Ok(LogEntry {
          sequence,
          saga_id,
          status: snapshot.status,
          recorded_at,
          snapshot,
        })
      })
      .collect()
  }

  async fn forget(&self, saga_id: &str) -> Result<(), LogError> {
    sqlx::query("DELETE FROM saga_log WHERE saga_id = ?")
      .bind(saga_id)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn prune_finished(&self) -> Result<u64, LogError> {
    let result = sqlx::query(
      r#"
            DELETE FROM saga_log
            WHERE saga_id IN (
              SELECT l.saga_id
              FROM saga_log l
              JOIN (
                SELECT saga_id, MAX(sequence) AS latest
                FROM saga_log
                GROUP BY saga_id
              ) m ON l.sequence = m.latest
              WHERE l.status IN ('completed', 'failed')
            )
            "#,
    )
    .execute(&self.pool)
    .await?;

    Ok(result.rows_affected())
  }
}
