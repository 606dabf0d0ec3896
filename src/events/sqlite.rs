//! SQLite-backed [`EventLog`] (behind the `sqlite` cargo feature).
//!
//! Events are stored one row per event with a per-run sequence number
//! assigned inside a transaction, so concurrent appenders still observe
//! a total per-run order. Payloads are stored as JSON text; the schema
//! never needs migrating when event variants are added.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::sync::Mutex;
use tracing::instrument;

use crate::events::{EventLog, EventWatcher, LogError, RunEvent, StoredEvent};
use crate::types::{RunId, StepKey};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS run_events (
    run_id  TEXT    NOT NULL,
    seq     INTEGER NOT NULL,
    step    TEXT,
    at      TEXT    NOT NULL,
    payload TEXT    NOT NULL,
    PRIMARY KEY (run_id, seq)
);
CREATE INDEX IF NOT EXISTS idx_run_events_run ON run_events (run_id);
"#;

struct WatchEntry {
    run_id: RunId,
    tx: flume::Sender<StoredEvent>,
}

/// Durable event log over a SQLite database.
pub struct SqliteEventLog {
    pool: SqlitePool,
    watchers: Mutex<Vec<WatchEntry>>,
}

impl SqliteEventLog {
    /// Connect using `url`, or fall back to the `RUNLOOM_SQLITE_URL`
    /// environment variable (a `.env` file is honored), or finally
    /// `sqlite://runloom.db`. The database file is created if missing
    /// and the schema is applied idempotently.
    #[instrument(skip_all)]
    pub async fn connect(url: Option<&str>) -> Result<Self, LogError> {
        dotenvy::dotenv().ok();
        let url = match url {
            Some(u) => u.to_string(),
            None => std::env::var("RUNLOOM_SQLITE_URL")
                .unwrap_or_else(|_| "sqlite://runloom.db".to_string()),
        };
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| LogError::Read {
                message: format!("invalid sqlite url: {e}"),
            })?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| LogError::Read {
                message: format!("connect failed: {e}"),
            })?;
        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| LogError::Write {
                message: format!("schema apply failed: {e}"),
            })?;
        Ok(SqliteEventLog {
            pool,
            watchers: Mutex::new(Vec::new()),
        })
    }

    fn notify(&self, stored: &StoredEvent) {
        let mut watchers = self.watchers.lock().expect("watcher list poisoned");
        watchers.retain(|w| {
            if w.run_id != stored.event.run_id {
                return !w.tx.is_disconnected();
            }
            w.tx.send(stored.clone()).is_ok()
        });
    }

    fn row_to_stored(row: &sqlx::sqlite::SqliteRow) -> Result<StoredEvent, LogError> {
        let run_id: String = row.get("run_id");
        let seq: i64 = row.get("seq");
        let step: Option<String> = row.get("step");
        let at: String = row.get("at");
        let payload: String = row.get("payload");
        let at = DateTime::parse_from_rfc3339(&at)
            .map_err(|e| LogError::Read {
                message: format!("bad timestamp in log: {e}"),
            })?
            .with_timezone(&Utc);
        Ok(StoredEvent {
            seq: seq as u64,
            event: RunEvent {
                run_id: RunId::new(run_id),
                step: step.map(StepKey::new),
                at,
                payload: serde_json::from_str(&payload)?,
            },
        })
    }
}

#[async_trait]
impl EventLog for SqliteEventLog {
    async fn append(&self, event: RunEvent) -> Result<StoredEvent, LogError> {
        let payload = serde_json::to_string(&event.payload)?;
        let mut tx = self.pool.begin().await.map_err(|e| LogError::Write {
            message: format!("begin failed: {e}"),
        })?;
        let next: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM run_events WHERE run_id = ?1",
        )
        .bind(event.run_id.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| LogError::Write {
            message: format!("seq query failed: {e}"),
        })?;
        sqlx::query(
            "INSERT INTO run_events (run_id, seq, step, at, payload) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(event.run_id.as_str())
        .bind(next)
        .bind(event.step.as_ref().map(StepKey::as_str))
        .bind(event.at.to_rfc3339())
        .bind(&payload)
        .execute(&mut *tx)
        .await
        .map_err(|e| LogError::Write {
            message: format!("insert failed: {e}"),
        })?;
        tx.commit().await.map_err(|e| LogError::Write {
            message: format!("commit failed: {e}"),
        })?;

        let stored = StoredEvent {
            seq: next as u64,
            event,
        };
        self.notify(&stored);
        Ok(stored)
    }

    async fn events(&self, run_id: &RunId) -> Result<Vec<StoredEvent>, LogError> {
        self.events_since(run_id, 0).await
    }

    async fn events_since(
        &self,
        run_id: &RunId,
        after_seq: u64,
    ) -> Result<Vec<StoredEvent>, LogError> {
        let rows = sqlx::query(
            "SELECT run_id, seq, step, at, payload FROM run_events \
             WHERE run_id = ?1 AND seq > ?2 ORDER BY seq",
        )
        .bind(run_id.as_str())
        .bind(after_seq as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| LogError::Read {
            message: format!("select failed: {e}"),
        })?;
        rows.iter().map(Self::row_to_stored).collect()
    }

    async fn run_ids(&self) -> Result<Vec<RunId>, LogError> {
        let rows = sqlx::query("SELECT DISTINCT run_id FROM run_events ORDER BY run_id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| LogError::Read {
                message: format!("select failed: {e}"),
            })?;
        Ok(rows
            .iter()
            .map(|row| RunId::new(row.get::<String, _>("run_id")))
            .collect())
    }

    fn watch(&self, run_id: &RunId) -> EventWatcher {
        let (tx, rx) = flume::unbounded();
        self.watchers
            .lock()
            .expect("watcher list poisoned")
            .push(WatchEntry {
                run_id: run_id.clone(),
                tx,
            });
        // Backlog replay is the caller's responsibility for the sqlite
        // log (an async read cannot happen here); combine with
        // `events_since(run_id, 0)` and rely on seq de-duplication.
        EventWatcher::from_live(rx)
    }
}
