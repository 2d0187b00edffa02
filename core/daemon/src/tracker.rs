//! Per-workspace status state machine.
//!
//! Events arrive from hook scripts through the ingestion endpoint. Boundary
//! events (`session_start`, `session_end`, the `post_tool` heartbeat while
//! working) always persist and notify. Every other event goes through
//! [`StatusTracker::apply_transition`], which compares against the stored row
//! and does nothing when the visible tuple would not change. The watchdog
//! uses the same path.
//!
//! The store is the only state. Nothing here caches a record between calls.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use workspace_status_protocol::{ClaudeState, EventVerb, NotificationKind, WorkspaceStatus};

use crate::clock::Clock;
use crate::notify::StatusNotifier;
use crate::store::{Activity, StatusStore, StoreError};

/// What a single event did. Callers only log it; tests assert on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Changed(WorkspaceStatus),
    Unchanged,
    Ignored,
    StoreFailed,
}

pub struct StatusTracker {
    store: Arc<dyn StatusStore>,
    notifier: StatusNotifier,
    clock: Arc<dyn Clock>,
    working_timeout_ms: i64,
}

impl StatusTracker {
    pub fn new(
        store: Arc<dyn StatusStore>,
        notifier: StatusNotifier,
        clock: Arc<dyn Clock>,
        working_timeout: Duration,
    ) -> Self {
        Self {
            store,
            notifier,
            clock,
            working_timeout_ms: i64::try_from(working_timeout.as_millis()).unwrap_or(i64::MAX),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkspaceStatus> {
        self.notifier.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.notifier.subscriber_count()
    }

    pub fn working_timeout_ms(&self) -> i64 {
        self.working_timeout_ms
    }

    /// Applies one hook event. Never fails: unknown vocabulary and store
    /// errors are logged and reported through the outcome.
    pub fn process_event(&self, workspace: &str, verb: &str, args: &[String]) -> EventOutcome {
        let Some(event) = EventVerb::from_wire(verb) else {
            warn!(workspace = %workspace, verb = %verb, "Unknown event type");
            return EventOutcome::Ignored;
        };

        debug!(workspace = %workspace, event = %event, args = args.len(), "Processing event");

        match event {
            EventVerb::SessionStart => self.handle_session_start(workspace, arg(args, 0)),
            EventVerb::Working => self.apply_transition(workspace, Activity::working(arg(args, 0))),
            EventVerb::PostTool => self.handle_post_tool(workspace),
            EventVerb::Stop => self.apply_transition(workspace, Activity::Idle),
            EventVerb::Notification => self.handle_notification(workspace, args),
            EventVerb::SessionEnd => self.handle_session_end(workspace),
        }
    }

    /// Snapshot of every row in the store, read fresh.
    pub fn all_statuses(&self) -> Result<Vec<WorkspaceStatus>, StoreError> {
        Ok(self
            .store
            .list_all()?
            .iter()
            .map(|record| record.to_status())
            .collect())
    }

    /// Current status of one workspace; unseen workspaces read as not running.
    pub fn status(&self, workspace: &str) -> Result<WorkspaceStatus, StoreError> {
        Ok(self
            .store
            .get(workspace)?
            .map(|record| record.to_status())
            .unwrap_or_else(|| WorkspaceStatus::not_running(workspace)))
    }

    /// Watchdog sweep: resets workspaces that have been working for longer
    /// than the timeout. Returns how many were reset.
    pub fn check_timeouts(&self) -> usize {
        let now = self.clock.now_ms();
        let records = match self.store.list_active() {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "Watchdog failed to enumerate statuses");
                return 0;
            }
        };

        let mut reset = 0;
        for record in records {
            if record.activity.state() != ClaudeState::Working {
                continue;
            }
            let elapsed_ms = now - record.state_since_ms;
            if elapsed_ms <= self.working_timeout_ms {
                continue;
            }

            warn!(
                workspace = %record.workspace,
                session_id = %record.session_id,
                tool_name = %record.activity.tool_name(),
                elapsed_ms,
                timeout_ms = self.working_timeout_ms,
                "Workspace working timeout, resetting to idle"
            );
            if let EventOutcome::Changed(_) = self.apply_transition(&record.workspace, Activity::Idle)
            {
                reset += 1;
            }
        }
        reset
    }

    fn handle_session_start(&self, workspace: &str, session_id: &str) -> EventOutcome {
        let written = self.store.upsert_session_start(workspace, session_id);
        self.commit(workspace, Activity::Idle, written)
    }

    fn handle_post_tool(&self, workspace: &str) -> EventOutcome {
        let current = match self.store.get(workspace) {
            Ok(current) => current,
            Err(err) => {
                warn!(workspace = %workspace, error = %err, "Failed to read status");
                return EventOutcome::StoreFailed;
            }
        };

        match current.map(|record| record.activity) {
            // Heartbeat between tool calls: keep the tool, refresh the stamp.
            Some(activity @ Activity::Working { .. }) => {
                let written = self.store.upsert_state(workspace, &activity);
                self.commit(workspace, activity, written)
            }
            _ => self.apply_transition(workspace, Activity::working("")),
        }
    }

    fn handle_notification(&self, workspace: &str, args: &[String]) -> EventOutcome {
        let subtype = arg(args, 0);
        let Some(kind) = NotificationKind::from_wire(subtype) else {
            warn!(workspace = %workspace, subtype = %subtype, "Unknown notification type");
            return EventOutcome::Ignored;
        };

        match kind {
            NotificationKind::PermissionPrompt | NotificationKind::ElicitationDialog => self
                .apply_transition(
                    workspace,
                    Activity::waiting(kind.as_str(), arg(args, 1)),
                ),
            NotificationKind::IdlePrompt => self.apply_transition(workspace, Activity::Idle),
        }
    }

    fn handle_session_end(&self, workspace: &str) -> EventOutcome {
        let written = self.store.clear_session(workspace);
        self.commit(workspace, Activity::NotRunning, written)
    }

    /// Conditional transition: writes and notifies only when the candidate
    /// differs from the stored tuple.
    fn apply_transition(&self, workspace: &str, candidate: Activity) -> EventOutcome {
        let current = match self.store.get(workspace) {
            Ok(current) => current,
            Err(err) => {
                warn!(workspace = %workspace, error = %err, "Failed to read status");
                return EventOutcome::StoreFailed;
            }
        };

        if current.is_some_and(|record| record.activity == candidate) {
            debug!(
                workspace = %workspace,
                state = %candidate.state(),
                "Status unchanged, skipping"
            );
            return EventOutcome::Unchanged;
        }

        let written = self.store.upsert_state(workspace, &candidate);
        self.commit(workspace, candidate, written)
    }

    fn commit(
        &self,
        workspace: &str,
        activity: Activity,
        written: Result<i64, StoreError>,
    ) -> EventOutcome {
        let state_since_ms = match written {
            Ok(since) => since,
            Err(err) => {
                warn!(
                    workspace = %workspace,
                    state = %activity.state(),
                    error = %err,
                    "Failed to persist status; transition abandoned"
                );
                return EventOutcome::StoreFailed;
            }
        };

        let status = WorkspaceStatus {
            workspace: workspace.to_string(),
            state: activity.state(),
            tool_name: activity.tool_name().to_string(),
            wait_reason: activity.wait_reason().to_string(),
            wait_message: activity.wait_message().to_string(),
            state_since_ms,
        };
        info!(
            workspace = %workspace,
            state = %status.state,
            tool_name = %status.tool_name,
            wait_reason = %status.wait_reason,
            state_since_ms,
            "Status changed"
        );
        self.notifier.emit(status.clone());
        EventOutcome::Changed(status)
    }
}

/// Missing trailing arguments read as empty strings.
fn arg(args: &[String], index: usize) -> &str {
    args.get(index).map(String::as_str).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use crate::store::{MemoryStore, StatusRecord};
    use std::sync::atomic::{AtomicBool, Ordering};

    const TIMEOUT: Duration = Duration::from_secs(300);

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn tracker_with_clock(
        clock: Arc<dyn Clock>,
    ) -> (StatusTracker, broadcast::Receiver<WorkspaceStatus>) {
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let tracker = StatusTracker::new(store, StatusNotifier::new(), clock, TIMEOUT);
        let rx = tracker.subscribe();
        (tracker, rx)
    }

    fn tracker() -> (StatusTracker, broadcast::Receiver<WorkspaceStatus>) {
        tracker_with_clock(Arc::new(SystemClock::new()))
    }

    fn drain(rx: &mut broadcast::Receiver<WorkspaceStatus>) -> Vec<WorkspaceStatus> {
        let mut changes = Vec::new();
        while let Ok(change) = rx.try_recv() {
            changes.push(change);
        }
        changes
    }

    /// Memory store whose operations can be switched to fail.
    struct FlakyStore {
        inner: MemoryStore,
        failing: AtomicBool,
    }

    impl FlakyStore {
        fn check(&self) -> Result<(), StoreError> {
            if self.failing.load(Ordering::SeqCst) {
                Err(StoreError::Unavailable("disk detached".to_string()))
            } else {
                Ok(())
            }
        }
    }

    impl StatusStore for FlakyStore {
        fn upsert_session_start(&self, workspace: &str, session_id: &str) -> Result<i64, StoreError> {
            self.check()?;
            self.inner.upsert_session_start(workspace, session_id)
        }

        fn upsert_state(&self, workspace: &str, activity: &Activity) -> Result<i64, StoreError> {
            self.check()?;
            self.inner.upsert_state(workspace, activity)
        }

        fn clear_session(&self, workspace: &str) -> Result<i64, StoreError> {
            self.check()?;
            self.inner.clear_session(workspace)
        }

        fn get(&self, workspace: &str) -> Result<Option<StatusRecord>, StoreError> {
            self.check()?;
            self.inner.get(workspace)
        }

        fn list_active(&self) -> Result<Vec<StatusRecord>, StoreError> {
            self.check()?;
            self.inner.list_active()
        }

        fn list_all(&self) -> Result<Vec<StatusRecord>, StoreError> {
            self.check()?;
            self.inner.list_all()
        }
    }

    #[test]
    fn unseen_workspace_is_absent_or_not_running() {
        let (tracker, _rx) = tracker();
        assert!(tracker.all_statuses().expect("list").is_empty());
        let status = tracker.status("never-seen").expect("status");
        assert_eq!(status.state, ClaudeState::NotRunning);
        assert_eq!(status.tool_name, "");
        assert_eq!(status.wait_reason, "");
        assert_eq!(status.wait_message, "");
    }

    #[test]
    fn repeated_working_event_is_a_no_op() {
        let (tracker, mut rx) = tracker();

        let first = tracker.process_event("proj", "working", &args(&["Read"]));
        let EventOutcome::Changed(first) = first else {
            panic!("first working event should change state");
        };
        let second = tracker.process_event("proj", "working", &args(&["Read"]));
        assert_eq!(second, EventOutcome::Unchanged);

        assert_eq!(drain(&mut rx).len(), 1);
        let stored = tracker.status("proj").expect("status");
        assert_eq!(stored.state_since_ms, first.state_since_ms);
    }

    #[test]
    fn working_with_different_tool_is_a_change() {
        let (tracker, mut rx) = tracker();
        tracker.process_event("proj", "working", &args(&["Read"]));
        tracker.process_event("proj", "working", &args(&["Edit"]));

        let changes = drain(&mut rx);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[1].tool_name, "Edit");
    }

    #[test]
    fn session_start_always_notifies() {
        let (tracker, mut rx) = tracker();

        tracker.process_event("proj", "session_start", &args(&["id1"]));
        tracker.process_event("proj", "session_start", &args(&["id1"]));

        let changes = drain(&mut rx);
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|change| change.state == ClaudeState::Idle));
        assert!(changes[1].state_since_ms > changes[0].state_since_ms);
    }

    #[test]
    fn session_end_always_notifies_and_keeps_row() {
        let (tracker, mut rx) = tracker();

        tracker.process_event("proj", "session_start", &args(&["id1"]));
        tracker.process_event("proj", "working", &args(&["Bash"]));
        tracker.process_event("proj", "session_end", &[]);
        tracker.process_event("proj", "session_end", &[]);

        let changes = drain(&mut rx);
        assert_eq!(changes.len(), 4);
        assert_eq!(changes[3].state, ClaudeState::NotRunning);
        assert_eq!(changes[3].tool_name, "");

        let all = tracker.all_statuses().expect("list");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].state, ClaudeState::NotRunning);
    }

    #[test]
    fn working_clears_wait_fields() {
        let (tracker, _rx) = tracker();
        tracker.process_event(
            "proj",
            "notification",
            &args(&["permission_prompt", "Allow write?"]),
        );
        tracker.process_event("proj", "working", &args(&["Write"]));

        let status = tracker.status("proj").expect("status");
        assert_eq!(status.state, ClaudeState::Working);
        assert_eq!(status.tool_name, "Write");
        assert_eq!(status.wait_reason, "");
        assert_eq!(status.wait_message, "");
    }

    #[test]
    fn waiting_clears_tool_name() {
        let (tracker, _rx) = tracker();
        tracker.process_event("proj", "working", &args(&["Bash"]));
        tracker.process_event(
            "proj",
            "notification",
            &args(&["elicitation_dialog", "Pick one"]),
        );

        let status = tracker.status("proj").expect("status");
        assert_eq!(status.state, ClaudeState::Waiting);
        assert_eq!(status.tool_name, "");
        assert_eq!(status.wait_reason, "elicitation_dialog");
        assert_eq!(status.wait_message, "Pick one");
    }

    #[test]
    fn session_lifecycle_scenario() {
        let (tracker, mut rx) = tracker();

        tracker.process_event("proj", "session_start", &args(&["id1"]));
        tracker.process_event("proj", "working", &args(&["search"]));
        tracker.process_event("proj", "post_tool", &[]);
        tracker.process_event("proj", "stop", &[]);

        let changes = drain(&mut rx);
        assert_eq!(changes.len(), 4);

        let working = &changes[1];
        let post_tool = &changes[2];
        assert_eq!(working.state, ClaudeState::Working);
        assert_eq!(post_tool.state, ClaudeState::Working);
        assert_eq!(post_tool.tool_name, "search");
        assert!(post_tool.state_since_ms > working.state_since_ms);

        let status = tracker.status("proj").expect("status");
        assert_eq!(status.state, ClaudeState::Idle);
        assert_eq!(status.tool_name, "");
    }

    #[test]
    fn permission_prompt_then_idle_prompt() {
        let (tracker, mut rx) = tracker();
        tracker.process_event("proj", "stop", &[]);
        drain(&mut rx);

        tracker.process_event(
            "proj",
            "notification",
            &args(&["permission_prompt", "Allow write?"]),
        );
        let waiting = tracker.status("proj").expect("status");
        assert_eq!(waiting.state, ClaudeState::Waiting);
        assert_eq!(waiting.wait_reason, "permission_prompt");
        assert_eq!(waiting.wait_message, "Allow write?");

        tracker.process_event("proj", "notification", &args(&["idle_prompt"]));
        let idle = tracker.status("proj").expect("status");
        assert_eq!(idle.state, ClaudeState::Idle);
        assert_eq!(idle.wait_reason, "");
        assert_eq!(idle.wait_message, "");

        assert_eq!(drain(&mut rx).len(), 2);
    }

    #[test]
    fn post_tool_heartbeat_always_notifies_while_working() {
        let (tracker, mut rx) = tracker();
        tracker.process_event("proj", "working", &args(&["Grep"]));
        tracker.process_event("proj", "post_tool", &[]);
        tracker.process_event("proj", "post_tool", &[]);

        let changes = drain(&mut rx);
        assert_eq!(changes.len(), 3);
        assert!(changes.iter().all(|change| change.tool_name == "Grep"));
        assert!(changes[2].state_since_ms > changes[1].state_since_ms);
    }

    #[test]
    fn post_tool_outside_working_is_conditional() {
        let (tracker, mut rx) = tracker();
        tracker.process_event("proj", "session_start", &args(&["id1"]));
        drain(&mut rx);

        let outcome = tracker.process_event("proj", "post_tool", &[]);
        let EventOutcome::Changed(status) = outcome else {
            panic!("post_tool from idle should start working");
        };
        assert_eq!(status.state, ClaudeState::Working);
        assert_eq!(status.tool_name, "");

        // Now working with an empty tool, so the next post_tool is a heartbeat.
        let heartbeat = tracker.process_event("proj", "post_tool", &[]);
        assert!(matches!(heartbeat, EventOutcome::Changed(_)));
        assert_eq!(drain(&mut rx).len(), 2);
    }

    #[test]
    fn unknown_vocabulary_is_dropped() {
        let (tracker, mut rx) = tracker();
        assert_eq!(
            tracker.process_event("proj", "pre_compact", &[]),
            EventOutcome::Ignored
        );
        assert_eq!(
            tracker.process_event("proj", "notification", &args(&["auth_success"])),
            EventOutcome::Ignored
        );
        assert_eq!(
            tracker.process_event("proj", "notification", &[]),
            EventOutcome::Ignored
        );
        assert!(drain(&mut rx).is_empty());
        assert!(tracker.all_statuses().expect("list").is_empty());
    }

    #[test]
    fn verbs_and_subtypes_are_case_insensitive() {
        let (tracker, _rx) = tracker();
        tracker.process_event("proj", "NOTIFICATION", &args(&["Permission_Prompt", "ok?"]));
        let status = tracker.status("proj").expect("status");
        assert_eq!(status.state, ClaudeState::Waiting);
        assert_eq!(status.wait_reason, "permission_prompt");
    }

    #[test]
    fn missing_arguments_read_as_empty() {
        let (tracker, _rx) = tracker();
        tracker.process_event("proj", "working", &[]);
        tracker.process_event("other", "notification", &args(&["permission_prompt"]));

        assert_eq!(tracker.status("proj").expect("status").tool_name, "");
        let other = tracker.status("other").expect("status");
        assert_eq!(other.state, ClaudeState::Waiting);
        assert_eq!(other.wait_message, "");
    }

    #[test]
    fn workspaces_are_independent_and_case_sensitive() {
        let (tracker, _rx) = tracker();
        tracker.process_event("Proj", "working", &args(&["Read"]));
        tracker.process_event("proj", "stop", &[]);

        assert_eq!(tracker.status("Proj").expect("status").state, ClaudeState::Working);
        assert_eq!(tracker.status("proj").expect("status").state, ClaudeState::Idle);
    }

    #[test]
    fn store_failure_abandons_transition() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(clock.clone()),
            failing: AtomicBool::new(false),
        });
        let tracker = StatusTracker::new(store.clone(), StatusNotifier::new(), clock, TIMEOUT);
        let mut rx = tracker.subscribe();

        tracker.process_event("proj", "working", &args(&["Read"]));
        store.failing.store(true, Ordering::SeqCst);

        assert_eq!(
            tracker.process_event("proj", "stop", &[]),
            EventOutcome::StoreFailed
        );
        assert_eq!(
            tracker.process_event("proj", "session_start", &args(&["id2"])),
            EventOutcome::StoreFailed
        );
        assert_eq!(
            tracker.process_event("proj", "session_end", &[]),
            EventOutcome::StoreFailed
        );

        assert_eq!(drain(&mut rx).len(), 1);
        store.failing.store(false, Ordering::SeqCst);
        let status = tracker.status("proj").expect("status");
        assert_eq!(status.state, ClaudeState::Working);
        assert_eq!(status.tool_name, "Read");

        assert!(matches!(
            tracker.process_event("proj", "stop", &[]),
            EventOutcome::Changed(_)
        ));
    }

    #[test]
    fn failed_reads_abandon_transitions_and_watchdog_pass() {
        let clock = Arc::new(ManualClock::starting_at(1_000_000));
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(clock.clone()),
            failing: AtomicBool::new(false),
        });
        let tracker =
            StatusTracker::new(store.clone(), StatusNotifier::new(), clock.clone(), TIMEOUT);
        let mut rx = tracker.subscribe();

        tracker.process_event("proj", "working", &args(&["Bash"]));
        drain(&mut rx);
        clock.advance(TIMEOUT.as_millis() as i64 + 1);
        store.failing.store(true, Ordering::SeqCst);

        for (verb, values) in [
            ("stop", vec![]),
            ("working", vec!["Read"]),
            ("post_tool", vec![]),
            ("notification", vec!["permission_prompt", "Allow?"]),
        ] {
            assert_eq!(
                tracker.process_event("proj", verb, &args(&values)),
                EventOutcome::StoreFailed,
                "{verb} should fail while reads fail"
            );
        }
        assert_eq!(tracker.check_timeouts(), 0);
        assert!(tracker.all_statuses().is_err());
        assert!(drain(&mut rx).is_empty());

        store.failing.store(false, Ordering::SeqCst);
        assert_eq!(tracker.status("proj").expect("status").tool_name, "Bash");
        assert_eq!(tracker.check_timeouts(), 1);
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn notification_subtype_case_does_not_duplicate_changes() {
        let (tracker, mut rx) = tracker();
        tracker.process_event("proj", "notification", &args(&["PERMISSION_PROMPT", "Allow?"]));
        assert_eq!(
            tracker.process_event("proj", "notification", &args(&["permission_prompt", "Allow?"])),
            EventOutcome::Unchanged
        );

        let changes = drain(&mut rx);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].wait_reason, "permission_prompt");
    }

    #[test]
    fn watchdog_resets_stale_working_sessions() {
        let clock = Arc::new(ManualClock::starting_at(1_000_000));
        let (tracker, mut rx) = tracker_with_clock(clock.clone());

        tracker.process_event("stale", "working", &args(&["Bash"]));
        clock.advance(4 * 60 * 1000);
        tracker.process_event("fresh", "working", &args(&["Read"]));
        tracker.process_event("waiting", "notification", &args(&["permission_prompt", "?"]));
        drain(&mut rx);

        clock.advance(60 * 1000 + 1);
        assert_eq!(tracker.check_timeouts(), 1);

        let changes = drain(&mut rx);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].workspace, "stale");
        assert_eq!(changes[0].state, ClaudeState::Idle);

        assert_eq!(tracker.status("fresh").expect("status").state, ClaudeState::Working);
        assert_eq!(tracker.status("waiting").expect("status").state, ClaudeState::Waiting);
    }

    #[test]
    fn watchdog_threshold_is_exclusive() {
        let clock = Arc::new(ManualClock::starting_at(0));
        let (tracker, _rx) = tracker_with_clock(clock.clone());

        tracker.process_event("proj", "working", &args(&["Bash"]));
        clock.advance(tracker.working_timeout_ms());
        assert_eq!(tracker.check_timeouts(), 0);

        clock.advance(1);
        assert_eq!(tracker.check_timeouts(), 1);
        assert_eq!(tracker.check_timeouts(), 0);
    }

    #[test]
    fn post_tool_heartbeat_defers_watchdog() {
        let clock = Arc::new(ManualClock::starting_at(0));
        let (tracker, _rx) = tracker_with_clock(clock.clone());

        tracker.process_event("proj", "working", &args(&["Bash"]));
        clock.advance(tracker.working_timeout_ms());
        tracker.process_event("proj", "post_tool", &[]);
        clock.advance(10);

        assert_eq!(tracker.check_timeouts(), 0);
        assert_eq!(tracker.status("proj").expect("status").state, ClaudeState::Working);
    }
}
