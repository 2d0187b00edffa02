//! SQLite persistence for the workspace status daemon.
//!
//! One row per workspace in `workspace_status`. Empty context fields are
//! stored as NULL and read back as empty strings.

use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

use workspace_status_protocol::ClaudeState;

use crate::clock::Clock;
use crate::store::{Activity, StatusRecord, StatusStore, StoreError};

const SELECT_COLUMNS: &str = "SELECT workspace_name, COALESCE(session_id, ''), state, \
        COALESCE(tool_name, ''), COALESCE(wait_reason, ''), COALESCE(wait_message, ''), \
        state_since_ms \
     FROM workspace_status";

pub struct Db {
    path: PathBuf,
    clock: Arc<dyn Clock>,
}

impl Db {
    pub fn new(path: PathBuf, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let db = Self { path, clock };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS workspace_status (
                    workspace_name TEXT PRIMARY KEY,
                    session_id TEXT,
                    state TEXT NOT NULL DEFAULT 'not_running',
                    tool_name TEXT,
                    wait_reason TEXT,
                    wait_message TEXT,
                    state_since_ms INTEGER NOT NULL DEFAULT 0
                 );
                 COMMIT;",
            )?;
            Ok(())
        })
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn open(&self) -> Result<Connection, StoreError> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        Ok(conn)
    }

    fn list_where(&self, filter: &str) -> Result<Vec<StatusRecord>, StoreError> {
        self.with_connection(|conn| {
            let sql = format!("{SELECT_COLUMNS} {filter} ORDER BY workspace_name ASC");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], read_row)?;

            let mut records = Vec::new();
            for row in rows {
                let raw = row?;
                let workspace = raw.workspace.clone();
                // One unreadable row must not hide every other workspace.
                match into_record(raw) {
                    Ok(record) => records.push(record),
                    Err(err) => warn!(
                        workspace = %workspace,
                        error = %err,
                        "Skipping unreadable status row"
                    ),
                }
            }
            Ok(records)
        })
    }
}

impl StatusStore for Db {
    fn upsert_session_start(&self, workspace: &str, session_id: &str) -> Result<i64, StoreError> {
        let now = self.clock.now_ms();
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO workspace_status (workspace_name, session_id, state, state_since_ms) \
                 VALUES (?1, ?2, 'idle', ?3) \
                 ON CONFLICT(workspace_name) DO UPDATE SET \
                    session_id = excluded.session_id, \
                    state = 'idle', \
                    tool_name = NULL, \
                    wait_reason = NULL, \
                    wait_message = NULL, \
                    state_since_ms = excluded.state_since_ms",
                params![workspace, non_empty(session_id), now],
            )?;
            Ok(now)
        })
    }

    fn upsert_state(&self, workspace: &str, activity: &Activity) -> Result<i64, StoreError> {
        let now = self.clock.now_ms();
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO workspace_status \
                    (workspace_name, state, tool_name, wait_reason, wait_message, state_since_ms) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(workspace_name) DO UPDATE SET \
                    state = excluded.state, \
                    tool_name = excluded.tool_name, \
                    wait_reason = excluded.wait_reason, \
                    wait_message = excluded.wait_message, \
                    state_since_ms = excluded.state_since_ms",
                params![
                    workspace,
                    activity.state().as_str(),
                    non_empty(activity.tool_name()),
                    non_empty(activity.wait_reason()),
                    non_empty(activity.wait_message()),
                    now
                ],
            )?;
            Ok(now)
        })
    }

    fn clear_session(&self, workspace: &str) -> Result<i64, StoreError> {
        let now = self.clock.now_ms();
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO workspace_status (workspace_name, state, state_since_ms) \
                 VALUES (?1, 'not_running', ?2) \
                 ON CONFLICT(workspace_name) DO UPDATE SET \
                    session_id = NULL, \
                    state = 'not_running', \
                    tool_name = NULL, \
                    wait_reason = NULL, \
                    wait_message = NULL, \
                    state_since_ms = excluded.state_since_ms",
                params![workspace, now],
            )?;
            Ok(now)
        })
    }

    fn get(&self, workspace: &str) -> Result<Option<StatusRecord>, StoreError> {
        self.with_connection(|conn| {
            let sql = format!("{SELECT_COLUMNS} WHERE workspace_name = ?1");
            let row = conn
                .query_row(&sql, params![workspace], read_row)
                .optional()?;
            row.map(into_record).transpose()
        })
    }

    fn list_active(&self) -> Result<Vec<StatusRecord>, StoreError> {
        self.list_where("WHERE state != 'not_running'")
    }

    fn list_all(&self) -> Result<Vec<StatusRecord>, StoreError> {
        self.list_where("")
    }
}

struct RawRow {
    workspace: String,
    session_id: String,
    state: String,
    tool_name: String,
    wait_reason: String,
    wait_message: String,
    state_since_ms: i64,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        workspace: row.get(0)?,
        session_id: row.get(1)?,
        state: row.get(2)?,
        tool_name: row.get(3)?,
        wait_reason: row.get(4)?,
        wait_message: row.get(5)?,
        state_since_ms: row.get(6)?,
    })
}

fn into_record(raw: RawRow) -> Result<StatusRecord, StoreError> {
    let state = ClaudeState::from_wire(&raw.state).ok_or_else(|| StoreError::CorruptRow {
        workspace: raw.workspace.clone(),
        detail: format!("unknown state '{}'", raw.state),
    })?;

    Ok(StatusRecord {
        workspace: raw.workspace,
        session_id: raw.session_id,
        activity: Activity::from_columns(state, raw.tool_name, raw.wait_reason, raw.wait_message),
        state_since_ms: raw.state_since_ms,
    })
}

fn non_empty(value: &str) -> Option<&str> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}
