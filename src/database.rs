use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::error::DatabaseError;
use crate::external::SessionStore;
use crate::models::{RunSession, SessionStatus};

/// Durable key/value surface used for checkpoints
///
/// Counters are stored as decimal text so every backend can increment them
/// atomically without knowing the payload encoding of other keys.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, DatabaseError>;

    /// Write several entries in one atomic batch
    fn put_batch(&self, entries: &[(&str, Vec<u8>)]) -> Result<(), DatabaseError>;

    fn put(&self, key: &str, value: &[u8]) -> Result<(), DatabaseError> {
        self.put_batch(&[(key, value.to_vec())])
    }

    /// Remove keys; missing keys are ignored
    fn remove(&self, keys: &[&str]) -> Result<(), DatabaseError>;

    /// Atomically add one to a counter, treating a missing key as zero
    fn increment(&self, key: &str) -> Result<u32, DatabaseError>;

    fn keys(&self) -> Result<Vec<String>, DatabaseError>;
}

/// Parse a counter value written by `increment` or `put`
pub fn decode_counter(key: &str, raw: &[u8]) -> Result<u32, DatabaseError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|text| text.trim().parse::<u32>().ok())
        .ok_or_else(|| DatabaseError::Corrupt {
            key: key.to_string(),
            reason: "counter is not a decimal integer".to_string(),
        })
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, DatabaseError> {
    conn.lock().map_err(|_| DatabaseError::LockPoisoned)
}

/// SQLite-backed key/value store (single `kv` table, WAL journal)
pub struct SqliteKeyValueStore {
    conn: Mutex<Connection>,
}

impl SqliteKeyValueStore {
    /// Create or open a store at the specified path
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, DatabaseError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| DatabaseError::WriteRejected {
                    reason: format!("cannot create {}: {}", parent.display(), e),
                })?;
            }
        }
        Self::with_connection(Connection::open(db_path)?)
    }

    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, DatabaseError> {
        // journal_mode returns a row, so it can't go through execute()
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        conn.execute("PRAGMA synchronous=NORMAL", [])?;
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl KeyValueStore for SqliteKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, DatabaseError> {
        let conn = lock(&self.conn)?;
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()?;
        Ok(value)
    }

    fn put_batch(&self, entries: &[(&str, Vec<u8>)]) -> Result<(), DatabaseError> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction()?;
        for (key, value) in entries {
            tx.execute(
                r#"
                INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, CURRENT_TIMESTAMP)
                ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP
                "#,
                params![key, value],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn remove(&self, keys: &[&str]) -> Result<(), DatabaseError> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction()?;
        for key in keys {
            tx.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        }
        tx.commit()?;
        Ok(())
    }

    fn increment(&self, key: &str) -> Result<u32, DatabaseError> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction()?;

        let current = tx
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()?
            .map(|raw| decode_counter(key, &raw))
            .transpose()?
            .unwrap_or(0);

        let next = current.saturating_add(1);
        tx.execute(
            r#"
            INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, CURRENT_TIMESTAMP)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP
            "#,
            params![key, next.to_string().into_bytes()],
        )?;
        tx.commit()?;

        Ok(next)
    }

    fn keys(&self) -> Result<Vec<String>, DatabaseError> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare("SELECT key FROM kv ORDER BY key")?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }
}

/// In-memory key/value store
///
/// Writes can be made to fail on demand, which lets tests exercise the
/// checkpoint retry path.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    reject_writes: AtomicBool,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }

    fn entries(&self) -> Result<MutexGuard<'_, HashMap<String, Vec<u8>>>, DatabaseError> {
        self.entries.lock().map_err(|_| DatabaseError::LockPoisoned)
    }

    fn check_writable(&self) -> Result<(), DatabaseError> {
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(DatabaseError::WriteRejected {
                reason: "store is rejecting writes".to_string(),
            });
        }
        Ok(())
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, DatabaseError> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn put_batch(&self, entries: &[(&str, Vec<u8>)]) -> Result<(), DatabaseError> {
        self.check_writable()?;
        let mut map = self.entries()?;
        for (key, value) in entries {
            map.insert((*key).to_string(), value.clone());
        }
        Ok(())
    }

    fn remove(&self, keys: &[&str]) -> Result<(), DatabaseError> {
        self.check_writable()?;
        let mut map = self.entries()?;
        for key in keys {
            map.remove(*key);
        }
        Ok(())
    }

    fn increment(&self, key: &str) -> Result<u32, DatabaseError> {
        self.check_writable()?;
        let mut map = self.entries()?;
        let current = match map.get(key) {
            Some(raw) => decode_counter(key, raw)?,
            None => 0,
        };
        let next = current.saturating_add(1);
        map.insert(key.to_string(), next.to_string().into_bytes());
        Ok(next)
    }

    fn keys(&self) -> Result<Vec<String>, DatabaseError> {
        let mut keys: Vec<String> = self.entries()?.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

/// Finished runs, one row per stopped session
pub struct RunDatabase {
    conn: Mutex<Connection>,
}

impl RunDatabase {
    /// Create or open a database at the specified path
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, DatabaseError> {
        Self::with_connection(Connection::open(db_path)?)
    }

    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, DatabaseError> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                start_time INTEGER NOT NULL,
                end_time INTEGER,
                duration_ms INTEGER NOT NULL,
                distance_meters REAL NOT NULL,
                average_pace REAL NOT NULL,
                status TEXT NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_runs_user_start ON runs (user_id, start_time)",
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Store a run, replacing any earlier record with the same id
    pub fn store_run(&self, session: &RunSession) -> Result<(), DatabaseError> {
        let conn = lock(&self.conn)?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO runs (
                id, user_id, start_time, end_time, duration_ms, distance_meters, average_pace, status
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                session.id,
                session.user_id,
                session.start_time,
                session.end_time,
                session.duration_ms as i64,
                session.distance_meters,
                session.average_pace,
                session.status.to_string(),
            ],
        )?;
        Ok(())
    }

    pub fn load_run(&self, run_id: &str) -> Result<Option<RunSession>, DatabaseError> {
        let conn = lock(&self.conn)?;
        let run = conn
            .query_row(
                r#"
                SELECT id, user_id, start_time, end_time, duration_ms, distance_meters, average_pace, status
                FROM runs
                WHERE id = ?1
                "#,
                params![run_id],
                run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    pub fn delete_run(&self, run_id: &str) -> Result<bool, DatabaseError> {
        let conn = lock(&self.conn)?;
        let removed = conn.execute("DELETE FROM runs WHERE id = ?1", params![run_id])?;
        Ok(removed > 0)
    }

    /// Most recent runs for a user, newest first
    pub fn recent_runs(&self, user_id: &str, limit: usize) -> Result<Vec<RunSession>, DatabaseError> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, user_id, start_time, end_time, duration_ms, distance_meters, average_pace, status
            FROM runs
            WHERE user_id = ?1
            ORDER BY start_time DESC
            LIMIT ?2
            "#,
        )?;
        let runs = stmt
            .query_map(params![user_id, limit as i64], run_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    pub fn get_stats(&self) -> Result<RunStats, DatabaseError> {
        let conn = lock(&self.conn)?;
        let (run_count, total_distance, total_duration): (i64, f64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(distance_meters), 0.0), COALESCE(SUM(duration_ms), 0) FROM runs",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        Ok(RunStats {
            run_count: run_count as usize,
            total_distance_meters: total_distance,
            total_duration_ms: total_duration.max(0) as u64,
        })
    }
}

impl SessionStore for RunDatabase {
    fn save(&self, session: &RunSession) -> Result<(), DatabaseError> {
        self.store_run(session)
    }

    fn load(&self, id: &str) -> Result<Option<RunSession>, DatabaseError> {
        self.load_run(id)
    }

    fn delete(&self, id: &str) -> Result<bool, DatabaseError> {
        self.delete_run(id)
    }
}

fn run_from_row(row: &Row) -> rusqlite::Result<RunSession> {
    let status_text: String = row.get("status")?;
    let status = SessionStatus::from_db(&status_text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(RunSession {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        start_time: row.get("start_time")?,
        end_time: row.get("end_time")?,
        duration_ms: row.get::<_, i64>("duration_ms")?.max(0) as u64,
        distance_meters: row.get("distance_meters")?,
        average_pace: row.get("average_pace")?,
        status,
    })
}

/// Aggregate figures over stored runs
#[derive(Debug, Clone, PartialEq)]
pub struct RunStats {
    pub run_count: usize,
    pub total_distance_meters: f64,
    pub total_duration_ms: u64,
}

// Status text as written by the Display impl
impl SessionStatus {
    pub fn from_db(s: &str) -> Result<Self, DatabaseError> {
        match s {
            "ACTIVE" => Ok(SessionStatus::Active),
            "PAUSED" => Ok(SessionStatus::Paused),
            "STOPPED" => Ok(SessionStatus::Stopped),
            _ => Err(DatabaseError::Corrupt {
                key: "runs.status".to_string(),
                reason: format!("unknown status: {}", s),
            }),
        }
    }
}
