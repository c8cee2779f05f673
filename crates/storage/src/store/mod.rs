#![forbid(unsafe_code)]

mod error;
mod jobs;
mod streams;
mod types;

pub use error::StoreError;
pub use types::*;

use rusqlite::{Connection, OptionalExtension, Transaction, params};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DB_FILE_NAME: &str = "tether.db";
const SCHEMA_VERSION: i64 = 1;

#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    storage_dir: Option<PathBuf>,
}

impl SqliteStore {
    pub fn open(storage_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let storage_dir = storage_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&storage_dir)?;

        let conn = Connection::open(storage_dir.join(DB_FILE_NAME))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        install_schema(&conn)?;

        Ok(Self {
            conn,
            storage_dir: Some(storage_dir),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        install_schema(&conn)?;
        Ok(Self {
            conn,
            storage_dir: None,
        })
    }

    pub fn storage_dir(&self) -> Option<&Path> {
        self.storage_dir.as_deref()
    }
}

fn install_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS counters (
          name TEXT PRIMARY KEY,
          value INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS jobs (
          seq INTEGER PRIMARY KEY AUTOINCREMENT,
          id TEXT NOT NULL UNIQUE,
          revision INTEGER NOT NULL,
          kind TEXT NOT NULL,
          target_id TEXT NOT NULL,
          status TEXT NOT NULL,
          input_json TEXT NOT NULL,
          partial TEXT,
          result_json TEXT,
          error TEXT,
          cancel_reason TEXT,
          runner TEXT,
          created_at_ms INTEGER NOT NULL,
          updated_at_ms INTEGER NOT NULL,
          completed_at_ms INTEGER
        );

        CREATE TABLE IF NOT EXISTS streams (
          stream_id TEXT PRIMARY KEY,
          is_streaming INTEGER NOT NULL,
          job_id TEXT,
          revision INTEGER NOT NULL,
          updated_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS stream_messages (
          stream_id TEXT NOT NULL,
          message_id TEXT NOT NULL,
          position INTEGER NOT NULL,
          role TEXT NOT NULL,
          content TEXT NOT NULL,
          tool_calls_json TEXT NOT NULL,
          updated_at_ms INTEGER NOT NULL,
          PRIMARY KEY (stream_id, message_id)
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_status_seq ON jobs(status, seq);
        CREATE INDEX IF NOT EXISTS idx_stream_messages_position ON stream_messages(stream_id, position);
        "#,
    )?;

    let stored: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key='schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    match stored {
        None => {
            conn.execute(
                "INSERT INTO meta(key, value) VALUES ('schema_version', ?1)",
                params![SCHEMA_VERSION.to_string()],
            )?;
        }
        Some(value) if value == SCHEMA_VERSION.to_string() => {}
        Some(value) => {
            return Err(StoreError::Corrupt(format!(
                "unsupported schema version {value}"
            )));
        }
    }
    Ok(())
}

fn next_counter_tx(tx: &Transaction<'_>, name: &str) -> Result<i64, StoreError> {
    let current: Option<i64> = tx
        .query_row(
            "SELECT value FROM counters WHERE name=?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    let next = current.unwrap_or(0) + 1;
    tx.execute(
        "INSERT INTO counters(name, value) VALUES (?1, ?2) \
         ON CONFLICT(name) DO UPDATE SET value=excluded.value",
        params![name, next],
    )?;
    Ok(next)
}

fn now_ms() -> i64 {
    tt_core::now_ms()
}
