//! Change notification channel.
//!
//! A one-to-many broadcast of full status snapshots. Each subscriber sees
//! changes in emission order; a subscriber that falls more than
//! `CHANNEL_CAPACITY` changes behind loses the oldest ones and is told so by
//! `RecvError::Lagged`.

use tokio::sync::broadcast;
use tracing::debug;
use workspace_status_protocol::WorkspaceStatus;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct StatusNotifier {
    tx: broadcast::Sender<WorkspaceStatus>,
}

impl StatusNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkspaceStatus> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn emit(&self, status: WorkspaceStatus) {
        let workspace = status.workspace.clone();
        match self.tx.send(status) {
            Ok(receivers) => {
                debug!(workspace = %workspace, receivers, "Status change delivered");
            }
            Err(_) => {
                debug!(workspace = %workspace, "Status change emitted with no subscribers");
            }
        }
    }
}

impl Default for StatusNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use workspace_status_protocol::ClaudeState;

    fn status(workspace: &str, state: ClaudeState, since: i64) -> WorkspaceStatus {
        WorkspaceStatus {
            state,
            state_since_ms: since,
            ..WorkspaceStatus::not_running(workspace)
        }
    }

    #[tokio::test]
    async fn every_subscriber_sees_changes_in_order() {
        let notifier = StatusNotifier::new();
        let mut first = notifier.subscribe();
        let mut second = notifier.subscribe();
        assert_eq!(notifier.subscriber_count(), 2);

        notifier.emit(status("proj", ClaudeState::Idle, 1));
        notifier.emit(status("proj", ClaudeState::Working, 2));

        for rx in [&mut first, &mut second] {
            assert_eq!(rx.recv().await.expect("first").state, ClaudeState::Idle);
            assert_eq!(rx.recv().await.expect("second").state, ClaudeState::Working);
        }
    }

    #[test]
    fn emit_without_subscribers_is_harmless() {
        let notifier = StatusNotifier::new();
        notifier.emit(status("proj", ClaudeState::Idle, 1));
        assert_eq!(notifier.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn late_subscriber_only_sees_later_changes() {
        let notifier = StatusNotifier::new();
        notifier.emit(status("proj", ClaudeState::Idle, 1));
        let mut rx = notifier.subscribe();
        notifier.emit(status("proj", ClaudeState::Waiting, 2));
        assert_eq!(rx.recv().await.expect("change").state_since_ms, 2);
    }
}
