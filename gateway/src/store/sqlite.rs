use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use modelgate_common::{BackendState, CrashRecord, QueueItem, UsageRecord};

use super::Store;
use crate::error::StoreError;

/// SQLite-backed durable store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

/// Fixed-width UTC form so that text comparison orders by time.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp '{}': {}", s, e)))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    s.as_deref().map(parse_ts).transpose()
}

fn parse_json(s: &str) -> Result<serde_json::Value, StoreError> {
    serde_json::from_str(s).map_err(|e| StoreError::Corrupt(e.to_string()))
}

const ITEM_COLUMNS: &str = "id, model, client_id, payload, priority, submitted_at, attempt, \
     deadline, state, started_at, completed_at, result, error";

struct ItemRow {
    id: String,
    model: String,
    client_id: String,
    payload: String,
    priority: String,
    submitted_at: String,
    attempt: u32,
    deadline: String,
    state: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    result: Option<String>,
    error: Option<String>,
}

impl ItemRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            model: row.get(1)?,
            client_id: row.get(2)?,
            payload: row.get(3)?,
            priority: row.get(4)?,
            submitted_at: row.get(5)?,
            attempt: row.get(6)?,
            deadline: row.get(7)?,
            state: row.get(8)?,
            started_at: row.get(9)?,
            completed_at: row.get(10)?,
            result: row.get(11)?,
            error: row.get(12)?,
        })
    }

    fn into_item(self) -> Result<QueueItem, StoreError> {
        Ok(QueueItem {
            payload: parse_json(&self.payload)?,
            priority: self
                .priority
                .parse()
                .map_err(|e: modelgate_common::ParsePriorityError| StoreError::Corrupt(e.to_string()))?,
            submitted_at: parse_ts(&self.submitted_at)?,
            deadline: parse_ts(&self.deadline)?,
            state: self.state.parse().map_err(StoreError::Corrupt)?,
            started_at: parse_opt_ts(self.started_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
            result: self.result.as_deref().map(parse_json).transpose()?,
            id: self.id,
            model: self.model,
            client_id: self.client_id,
            attempt: self.attempt,
            error: self.error,
        })
    }
}

struct CrashRow {
    id: String,
    timestamp: String,
    model: String,
    request_id: Option<String>,
    error_kind: String,
    detail: String,
    attempt: Option<u32>,
}

impl CrashRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            model: row.get(2)?,
            request_id: row.get(3)?,
            error_kind: row.get(4)?,
            detail: row.get(5)?,
            attempt: row.get(6)?,
        })
    }

    fn into_record(self) -> Result<CrashRecord, StoreError> {
        Ok(CrashRecord {
            timestamp: parse_ts(&self.timestamp)?,
            error_kind: self.error_kind.parse().map_err(StoreError::Corrupt)?,
            id: self.id,
            model: self.model,
            request_id: self.request_id,
            detail: self.detail,
            attempt: self.attempt,
        })
    }
}

impl SqliteStore {
    /// Open (or create) the store. Accepts an optional `sqlite:` prefix and
    /// `:memory:`.
    pub fn new(database_url: &str) -> Result<Self, StoreError> {
        let path = database_url.strip_prefix("sqlite:").unwrap_or(database_url);

        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
                }
            }
            Connection::open(path)?
        };

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS queue_items (
                id TEXT PRIMARY KEY,
                model TEXT NOT NULL,
                client_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                priority TEXT NOT NULL,
                submitted_at TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                deadline TEXT NOT NULL,
                state TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                result TEXT,
                error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_queue_items_state ON queue_items(state);
            CREATE INDEX IF NOT EXISTS idx_queue_items_submitted_at ON queue_items(submitted_at);

            CREATE TABLE IF NOT EXISTS usage_records (
                id TEXT PRIMARY KEY,
                model TEXT NOT NULL,
                client_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                known_model INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_usage_model_timestamp ON usage_records(model, timestamp);
            CREATE INDEX IF NOT EXISTS idx_usage_timestamp ON usage_records(timestamp);

            CREATE TABLE IF NOT EXISTS crash_records (
                id TEXT PRIMARY KEY,
                timestamp TEXT NOT NULL,
                model TEXT NOT NULL,
                request_id TEXT,
                error_kind TEXT NOT NULL,
                detail TEXT NOT NULL,
                attempt INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_crash_timestamp ON crash_records(timestamp);

            CREATE TABLE IF NOT EXISTS backend_states (
                model TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                started_at TEXT,
                last_health_check TEXT,
                resolution_mode TEXT,
                updated_at TEXT NOT NULL
            );",
        )?;

        tracing::info!("Store initialized with database: {}", path);

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

impl Store for SqliteStore {
    fn upsert_item(&self, item: &QueueItem) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let result = item.result.as_ref().map(|v| v.to_string());
        conn.execute(
            "INSERT INTO queue_items (id, model, client_id, payload, priority, submitted_at, attempt,
                                      deadline, state, started_at, completed_at, result, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(id) DO UPDATE SET
                attempt = excluded.attempt,
                state = excluded.state,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at,
                result = excluded.result,
                error = excluded.error",
            params![
                item.id,
                item.model,
                item.client_id,
                item.payload.to_string(),
                item.priority.as_str(),
                ts(item.submitted_at),
                item.attempt,
                ts(item.deadline),
                item.state.as_str(),
                item.started_at.map(ts),
                item.completed_at.map(ts),
                result,
                item.error,
            ],
        )?;
        Ok(())
    }

    fn get_item(&self, id: &str) -> Result<Option<QueueItem>, StoreError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM queue_items WHERE id = ?1", ITEM_COLUMNS),
                params![id],
                ItemRow::read,
            )
            .optional()?;
        row.map(ItemRow::into_item).transpose()
    }

    fn list_active_items(&self) -> Result<Vec<QueueItem>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM queue_items
             WHERE state IN ('pending', 'processing')
             ORDER BY submitted_at ASC, rowid ASC",
            ITEM_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], ItemRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(ItemRow::into_item).collect()
    }

    fn delete_terminal_items_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM queue_items
             WHERE state IN ('succeeded', 'failed', 'timed_out') AND completed_at < ?1",
            params![ts(cutoff)],
        )?;
        Ok(deleted)
    }

    fn append_usage(&self, record: &UsageRecord) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO usage_records (id, model, client_id, timestamp, known_model)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.id,
                record.model,
                record.client_id,
                ts(record.timestamp),
                record.known_model as i32,
            ],
        )?;
        Ok(())
    }

    fn count_usage_since(&self, model: &str, since: DateTime<Utc>) -> Result<u64, StoreError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM usage_records WHERE model = ?1 AND timestamp >= ?2",
            params![model, ts(since)],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    fn list_usage_gaps(&self, limit: usize) -> Result<Vec<UsageRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, model, client_id, timestamp FROM usage_records
             WHERE known_model = 0
             ORDER BY timestamp DESC, rowid DESC
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, model, client_id, timestamp)| {
                Ok(UsageRecord {
                    id,
                    model,
                    client_id,
                    timestamp: parse_ts(&timestamp)?,
                    known_model: false,
                })
            })
            .collect()
    }

    fn delete_usage_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM usage_records WHERE timestamp < ?1",
            params![ts(cutoff)],
        )?;
        Ok(deleted)
    }

    fn append_crash(&self, record: &CrashRecord) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO crash_records (id, timestamp, model, request_id, error_kind, detail, attempt)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id,
                ts(record.timestamp),
                record.model,
                record.request_id,
                record.error_kind.as_str(),
                record.detail,
                record.attempt,
            ],
        )?;
        Ok(())
    }

    fn list_crashes(&self, limit: usize) -> Result<Vec<CrashRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, model, request_id, error_kind, detail, attempt
             FROM crash_records
             ORDER BY timestamp DESC, rowid DESC
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], CrashRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(CrashRow::into_record).collect()
    }

    fn list_crashes_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CrashRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, model, request_id, error_kind, detail, attempt
             FROM crash_records
             WHERE timestamp >= ?1 AND timestamp < ?2
             ORDER BY timestamp DESC, rowid DESC",
        )?;
        let rows = stmt
            .query_map(params![ts(from), ts(to)], CrashRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(CrashRow::into_record).collect()
    }

    fn delete_crashes_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM crash_records WHERE timestamp < ?1",
            params![ts(cutoff)],
        )?;
        Ok(deleted)
    }

    fn save_backend_state(&self, state: &BackendState) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO backend_states (model, status, started_at, last_health_check, resolution_mode, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(model) DO UPDATE SET
                status = excluded.status,
                started_at = excluded.started_at,
                last_health_check = excluded.last_health_check,
                resolution_mode = excluded.resolution_mode,
                updated_at = excluded.updated_at",
            params![
                state.model,
                state.status.as_str(),
                state.started_at.map(ts),
                state.last_health_check.map(ts),
                state.resolution_mode,
                ts(state.updated_at),
            ],
        )?;
        Ok(())
    }

    fn load_backend_states(&self) -> Result<Vec<BackendState>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT model, status, started_at, last_health_check, resolution_mode, updated_at
             FROM backend_states ORDER BY model",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(
                |(model, status, started_at, last_health_check, resolution_mode, updated_at)| {
                    Ok(BackendState {
                        model,
                        status: status.parse().map_err(StoreError::Corrupt)?,
                        started_at: parse_opt_ts(started_at)?,
                        last_health_check: parse_opt_ts(last_health_check)?,
                        resolution_mode,
                        updated_at: parse_ts(&updated_at)?,
                    })
                },
            )
            .collect()
    }
}
