//! Periodic sweep that resets workspaces stuck in the working state.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::tracker::StatusTracker;

/// Runs forever; cancel by dropping the task or the runtime.
pub async fn run_watchdog(tracker: Arc<StatusTracker>, tick_interval: Duration) {
    info!(
        tick_interval_ms = tick_interval.as_millis() as u64,
        working_timeout_ms = tracker.working_timeout_ms(),
        "Watchdog started"
    );

    // First sweep one full period after start, not immediately.
    let mut ticker = time::interval_at(Instant::now() + tick_interval, tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let reset = tracker.check_timeouts();
        if reset > 0 {
            info!(reset, "Watchdog reset stale workspaces");
        } else {
            debug!("Watchdog sweep found nothing stale");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::notify::StatusNotifier;
    use crate::store::MemoryStore;
    use workspace_status_protocol::ClaudeState;

    #[tokio::test]
    async fn sweep_resets_working_workspace_after_timeout() {
        let clock = Arc::new(SystemClock::new());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let tracker = Arc::new(StatusTracker::new(
            store,
            StatusNotifier::new(),
            clock,
            Duration::from_millis(20),
        ));
        let mut rx = tracker.subscribe();

        tracker.process_event("proj", "working", &["Bash".to_string()]);
        let started = rx.recv().await.expect("working change");
        assert_eq!(started.state, ClaudeState::Working);

        let handle = tokio::spawn(run_watchdog(
            Arc::clone(&tracker),
            Duration::from_millis(10),
        ));

        let reset = time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("watchdog fired in time")
            .expect("reset change");
        handle.abort();

        assert_eq!(reset.workspace, "proj");
        assert_eq!(reset.state, ClaudeState::Idle);
        assert!(reset.state_since_ms - started.state_since_ms > 20);
    }
}
