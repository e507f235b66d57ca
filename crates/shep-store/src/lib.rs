//! Durable record store for the controller.
//!
//! SQLite in WAL mode behind a single serialized connection. Four concerns:
//! the xid table (command records that must survive a controller restart),
//! the lifecycle-state singleton per domain, the reported-status row set
//! (bulk-replaced atomically every poll cycle), and the backup-file catalog.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use tracing::info;

/// One reported sub-process row from the managed server's status output.
/// The aggregate status is stored as a row named `Status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRow {
    /// Display name of the agent the row was observed on.
    pub agent: String,
    pub name: String,
    pub pid: i64,
    pub status: String,
}

/// Catalog entry for a completed backup or ziplog file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub fileid: i64,
    /// Full path on the owning agent, or object key for cloud storage.
    pub name: String,
    /// `backup` or `ziplog`.
    pub kind: String,
    /// `volume` or `cloud`.
    pub storage_type: String,
    /// Owning agent uuid for volume storage, cloud kind (`s3`, ...) otherwise.
    pub storage_name: String,
    /// Directory on the agent, or bucket for cloud storage.
    pub storage_location: String,
    /// True for scheduler-initiated files, false for user-initiated.
    pub auto: bool,
    pub created_at: DateTime<Utc>,
}

pub const FILE_KIND_BACKUP: &str = "backup";
pub const FILE_KIND_ZIPLOG: &str = "ziplog";
pub const STORAGE_TYPE_VOLUME: &str = "volume";
pub const STORAGE_TYPE_CLOUD: &str = "cloud";

/// Durable key-value/record store.
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at `path`, enable WAL mode, and create
    /// the schema.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open controller DB at {}", path.display()))?;
        let store = Self::init(conn)?;
        info!(path = %path.display(), "Opened controller store");
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS xids (
                xid INTEGER PRIMARY KEY AUTOINCREMENT,
                state TEXT NOT NULL DEFAULT 'started',
                command TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS lifecycle_state (
                domain TEXT PRIMARY KEY,
                state TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS server_processes (
                agent TEXT NOT NULL,
                name TEXT NOT NULL,
                pid INTEGER NOT NULL,
                status TEXT NOT NULL,
                PRIMARY KEY (agent, name)
            );

            CREATE TABLE IF NOT EXISTS files (
                fileid INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                storage_type TEXT NOT NULL,
                storage_name TEXT NOT NULL,
                storage_location TEXT NOT NULL,
                auto INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_files_kind ON files (kind, auto, created_at);

            CREATE TABLE IF NOT EXISTS system (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ── xid allocation and phase tracking ───────────────────────

    /// Allocate a durable transaction id for a command. Committed before any
    /// network call, so an in-flight command remains pollable and cleanable
    /// after a controller restart.
    pub fn alloc_xid(&self, command: &str) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO xids (state, command, created_at) VALUES ('started', ?1, ?2)",
            params![command, Utc::now().to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid() as u64)
    }

    pub fn xid_set_state(&self, xid: u64, state: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE xids SET state = ?1 WHERE xid = ?2",
            params![state, xid as i64],
        )?;
        Ok(())
    }

    pub fn xid_state(&self, xid: u64) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT state FROM xids WHERE xid = ?1")?;
        let mut rows = stmt.query(params![xid as i64])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    /// Xids left in `started`/`running` by a previous controller process.
    pub fn open_xids(&self) -> Result<Vec<u64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT xid FROM xids WHERE state IN ('started', 'running')")?;
        let xids = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(xids.into_iter().map(|x| x as u64).collect())
    }

    // ── lifecycle state singleton ───────────────────────────────

    pub fn get_state(&self, domain: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT state FROM lifecycle_state WHERE domain = ?1")?;
        let mut rows = stmt.query(params![domain])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    pub fn set_state(&self, domain: &str, state: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO lifecycle_state (domain, state) VALUES (?1, ?2)
             ON CONFLICT(domain) DO UPDATE SET state = excluded.state",
            params![domain, state],
        )?;
        Ok(())
    }

    // ── reported-status rows ────────────────────────────────────

    /// Replace the full reported-status row set in one transaction.
    ///
    /// The delete is not visible until the new rows are committed with it, so
    /// a concurrent reader never observes an empty table between two
    /// non-empty poll cycles.
    pub fn replace_status(&self, rows: &[ProcessRow]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM server_processes", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO server_processes (agent, name, pid, status)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for row in rows {
                stmt.execute(params![row.agent, row.name, row.pid, row.status])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn clear_status(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM server_processes", [])?;
        Ok(())
    }

    pub fn status_rows(&self) -> Result<Vec<ProcessRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT agent, name, pid, status FROM server_processes ORDER BY agent, name")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ProcessRow {
                    agent: row.get(0)?,
                    name: row.get(1)?,
                    pid: row.get(2)?,
                    status: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// The aggregate status row (`Status`), if one was recorded.
    pub fn aggregate_status(&self) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT status FROM server_processes WHERE name = 'Status' LIMIT 1")?;
        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    // ── backup-file catalog ─────────────────────────────────────

    pub fn add_file(&self, entry: &FileEntry) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO files (name, kind, storage_type, storage_name,
                                storage_location, auto, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.name,
                entry.kind,
                entry.storage_type,
                entry.storage_name,
                entry.storage_location,
                entry.auto as i64,
                entry.created_at.to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn remove_file(&self, fileid: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM files WHERE fileid = ?1", params![fileid])?;
        Ok(n > 0)
    }

    /// Files of a kind, oldest first; rotation deletes from the front.
    pub fn files_by_kind(&self, kind: &str, auto: bool) -> Result<Vec<FileEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT fileid, name, kind, storage_type, storage_name,
                    storage_location, auto, created_at
             FROM files WHERE kind = ?1 AND auto = ?2 ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map(params![kind, auto as i64], row_to_file)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn file_by_name(&self, name: &str) -> Result<Option<FileEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT fileid, name, kind, storage_type, storage_name,
                    storage_location, auto, created_at
             FROM files WHERE name = ?1",
        )?;
        let mut rows = stmt.query(params![name])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_file(row)?)),
            None => Ok(None),
        }
    }

    // ── system key/value ────────────────────────────────────────

    pub fn sys_get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT value FROM system WHERE key = ?1")?;
        let mut rows = stmt.query(params![key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    pub fn sys_set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO system (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}

fn row_to_file(row: &rusqlite::Row<'_>) -> std::result::Result<FileEntry, rusqlite::Error> {
    let created: String = row.get(7)?;
    Ok(FileEntry {
        fileid: row.get(0)?,
        name: row.get(1)?,
        kind: row.get(2)?,
        storage_type: row.get(3)?,
        storage_name: row.get(4)?,
        storage_location: row.get(5)?,
        auto: row.get::<_, i64>(6)? != 0,
        created_at: DateTime::parse_from_rfc3339(&created)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}
