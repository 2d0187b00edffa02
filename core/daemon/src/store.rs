//! Status store interface and the in-memory backend.
//!
//! The tracker only talks to [`StatusStore`]. Every mutating call stamps the
//! row with the store's clock and returns that stamp; the tracker forwards it
//! in the change notification instead of guessing its own.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use workspace_status_protocol::{ClaudeState, WorkspaceStatus};

use crate::clock::Clock;

/// State plus the context fields that are meaningful for it. A combination
/// like idle-with-a-tool-name cannot be expressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activity {
    NotRunning,
    Idle,
    Working { tool_name: String },
    Waiting { reason: String, message: String },
}

impl Activity {
    pub fn working(tool_name: impl Into<String>) -> Self {
        Activity::Working {
            tool_name: tool_name.into(),
        }
    }

    pub fn waiting(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Activity::Waiting {
            reason: reason.into(),
            message: message.into(),
        }
    }

    pub fn state(&self) -> ClaudeState {
        match self {
            Activity::NotRunning => ClaudeState::NotRunning,
            Activity::Idle => ClaudeState::Idle,
            Activity::Working { .. } => ClaudeState::Working,
            Activity::Waiting { .. } => ClaudeState::Waiting,
        }
    }

    pub fn tool_name(&self) -> &str {
        match self {
            Activity::Working { tool_name } => tool_name,
            _ => "",
        }
    }

    pub fn wait_reason(&self) -> &str {
        match self {
            Activity::Waiting { reason, .. } => reason,
            _ => "",
        }
    }

    pub fn wait_message(&self) -> &str {
        match self {
            Activity::Waiting { message, .. } => message,
            _ => "",
        }
    }

    /// Rebuilds an activity from flat columns, dropping any column that does
    /// not belong to `state`.
    pub fn from_columns(
        state: ClaudeState,
        tool_name: String,
        wait_reason: String,
        wait_message: String,
    ) -> Self {
        match state {
            ClaudeState::NotRunning => Activity::NotRunning,
            ClaudeState::Idle => Activity::Idle,
            ClaudeState::Working => Activity::Working { tool_name },
            ClaudeState::Waiting => Activity::Waiting {
                reason: wait_reason,
                message: wait_message,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRecord {
    pub workspace: String,
    pub session_id: String,
    pub activity: Activity,
    pub state_since_ms: i64,
}

impl StatusRecord {
    pub fn to_status(&self) -> WorkspaceStatus {
        WorkspaceStatus {
            workspace: self.workspace.clone(),
            state: self.activity.state(),
            tool_name: self.activity.tool_name().to_string(),
            wait_reason: self.activity.wait_reason().to_string(),
            wait_message: self.activity.wait_message().to_string(),
            state_since_ms: self.state_since_ms,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to prepare store directory {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt row for workspace '{workspace}': {detail}")]
    CorruptRow { workspace: String, detail: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Row-per-workspace status table.
///
/// Every mutation upserts: a workspace that has never been seen gets a row on
/// its first write. Rows are never deleted.
pub trait StatusStore: Send + Sync {
    /// Sets the session id and resets the row to idle.
    fn upsert_session_start(&self, workspace: &str, session_id: &str) -> Result<i64, StoreError>;

    /// Writes the activity columns, leaving the session id untouched.
    fn upsert_state(&self, workspace: &str, activity: &Activity) -> Result<i64, StoreError>;

    /// Clears the session id and resets the row to not running.
    fn clear_session(&self, workspace: &str) -> Result<i64, StoreError>;

    fn get(&self, workspace: &str) -> Result<Option<StatusRecord>, StoreError>;

    /// Rows whose state is anything but not running.
    fn list_active(&self) -> Result<Vec<StatusRecord>, StoreError>;

    fn list_all(&self) -> Result<Vec<StatusRecord>, StoreError>;
}

/// Volatile backend. Ordered by workspace name so listings are stable.
pub struct MemoryStore {
    rows: Mutex<BTreeMap<String, StatusRecord>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            rows: Mutex::new(BTreeMap::new()),
            clock,
        }
    }

    fn rows(&self) -> Result<MutexGuard<'_, BTreeMap<String, StatusRecord>>, StoreError> {
        self.rows
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    fn write(
        &self,
        workspace: &str,
        update: impl FnOnce(&mut StatusRecord),
    ) -> Result<i64, StoreError> {
        let mut rows = self.rows()?;
        let now = self.clock.now_ms();
        let record = rows
            .entry(workspace.to_string())
            .or_insert_with(|| StatusRecord {
                workspace: workspace.to_string(),
                session_id: String::new(),
                activity: Activity::NotRunning,
                state_since_ms: 0,
            });
        update(record);
        record.state_since_ms = now;
        Ok(now)
    }
}

impl StatusStore for MemoryStore {
    fn upsert_session_start(&self, workspace: &str, session_id: &str) -> Result<i64, StoreError> {
        self.write(workspace, |record| {
            record.session_id = session_id.to_string();
            record.activity = Activity::Idle;
        })
    }

    fn upsert_state(&self, workspace: &str, activity: &Activity) -> Result<i64, StoreError> {
        self.write(workspace, |record| record.activity = activity.clone())
    }

    fn clear_session(&self, workspace: &str) -> Result<i64, StoreError> {
        self.write(workspace, |record| {
            record.session_id.clear();
            record.activity = Activity::NotRunning;
        })
    }

    fn get(&self, workspace: &str) -> Result<Option<StatusRecord>, StoreError> {
        Ok(self.rows()?.get(workspace).cloned())
    }

    fn list_active(&self) -> Result<Vec<StatusRecord>, StoreError> {
        Ok(self
            .rows()?
            .values()
            .filter(|record| record.activity != Activity::NotRunning)
            .cloned()
            .collect())
    }

    fn list_all(&self) -> Result<Vec<StatusRecord>, StoreError> {
        Ok(self.rows()?.values().cloned().collect())
    }
}
