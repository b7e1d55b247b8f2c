//! Trading-day override persistence
//!
//! Overrides are exceptions to the weekly rule: declared holidays, or
//! special sessions on a normally closed weekday. Reads happen on the
//! session-clock path, so both implementations keep their locks short and
//! never touch the network.

use std::collections::HashMap;
use std::path::Path;

use chrono::{NaiveDate, Utc};
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

const DATE_FORMAT: &str = "%Y-%m-%d";

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS trading_days (
    date TEXT PRIMARY KEY,
    is_open INTEGER NOT NULL,
    status TEXT NOT NULL,
    updated_at TEXT NOT NULL
) WITHOUT ROWID;
"#;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt trading day row for {date}: {reason}")]
    Corrupt { date: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradingDayOverride {
    pub date: NaiveDate,
    pub is_open: bool,
    pub status: String,
}

pub trait TradingDayStore: Send + Sync {
    fn get_override(&self, date: NaiveDate) -> Result<Option<TradingDayOverride>, StoreError>;
    fn upsert_override(&self, record: &TradingDayOverride) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryTradingDayStore {
    days: RwLock<HashMap<NaiveDate, TradingDayOverride>>,
}

impl MemoryTradingDayStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TradingDayStore for MemoryTradingDayStore {
    fn get_override(&self, date: NaiveDate) -> Result<Option<TradingDayOverride>, StoreError> {
        Ok(self.days.read().get(&date).cloned())
    }

    fn upsert_override(&self, record: &TradingDayOverride) -> Result<(), StoreError> {
        self.days.write().insert(record.date, record.clone());
        Ok(())
    }
}

/// SQLite-backed override table
pub struct SqliteTradingDayStore {
    conn: Mutex<Connection>,
}

impl SqliteTradingDayStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path.as_ref(), flags)?;
        conn.execute_batch(SCHEMA_SQL)?;
        info!(path = %path.as_ref().display(), "trading day store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// All overrides in date order
    pub fn list(&self) -> Result<Vec<TradingDayOverride>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT date, is_open, status FROM trading_days ORDER BY date")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (date, is_open, status) = row?;
            out.push(decode_row(date, is_open, status)?);
        }
        Ok(out)
    }
}

fn decode_row(date: String, is_open: i64, status: String) -> Result<TradingDayOverride, StoreError> {
    let parsed = NaiveDate::parse_from_str(&date, DATE_FORMAT).map_err(|e| StoreError::Corrupt {
        date: date.clone(),
        reason: e.to_string(),
    })?;
    Ok(TradingDayOverride {
        date: parsed,
        is_open: is_open != 0,
        status,
    })
}

impl TradingDayStore for SqliteTradingDayStore {
    fn get_override(&self, date: NaiveDate) -> Result<Option<TradingDayOverride>, StoreError> {
        let key = date.format(DATE_FORMAT).to_string();
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT date, is_open, status FROM trading_days WHERE date = ?1",
                params![key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        drop(conn);

        row.map(|(date, is_open, status)| decode_row(date, is_open, status))
            .transpose()
    }

    fn upsert_override(&self, record: &TradingDayOverride) -> Result<(), StoreError> {
        let key = record.date.format(DATE_FORMAT).to_string();
        let updated_at = Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO trading_days (date, is_open, status, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(date) DO UPDATE SET
                is_open = excluded.is_open,
                status = excluded.status,
                updated_at = excluded.updated_at",
            params![key, record.is_open as i64, record.status, updated_at],
        )?;
        Ok(())
    }
}
