use std::{
    process::ExitStatus,
    sync::atomic::{AtomicU64, Ordering},
};

use metrics::counter;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Lifecycle notifications emitted by the launcher's restart loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchEvent {
    Started { pid: u32 },
    Exited { pid: u32, code: Option<i32> },
}

impl LaunchEvent {
    pub(crate) fn exited(pid: u32, status: Option<ExitStatus>) -> Self {
        LaunchEvent::Exited {
            pid,
            code: status.and_then(|status| status.code()),
        }
    }
}

/// Best-effort sender for [`LaunchEvent`]s.
///
/// The queue is bounded. When it is full the event is dropped and counted
/// rather than stalling the restart loop; a closed receiver is treated the
/// same way.
#[derive(Debug)]
pub struct LaunchNotifier {
    sender: mpsc::Sender<LaunchEvent>,
    dropped: AtomicU64,
}

impl LaunchNotifier {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<LaunchEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                sender,
                dropped: AtomicU64::new(0),
            },
            receiver,
        )
    }

    /// Returns `false` when the event was dropped.
    pub fn notify(&self, event: LaunchEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                counter!("warden_notifications_dropped_total", 1);
                false
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_while_capacity_remains() {
        let (notifier, mut rx) = LaunchNotifier::channel(2);
        assert!(notifier.notify(LaunchEvent::Started { pid: 10 }));
        assert!(notifier.notify(LaunchEvent::Exited {
            pid: 10,
            code: Some(1)
        }));
        assert_eq!(rx.recv().await, Some(LaunchEvent::Started { pid: 10 }));
        assert_eq!(notifier.dropped(), 0);
    }

    #[test]
    fn drops_when_full_instead_of_blocking() {
        let (notifier, _rx) = LaunchNotifier::channel(1);
        assert!(notifier.notify(LaunchEvent::Started { pid: 1 }));
        assert!(!notifier.notify(LaunchEvent::Started { pid: 2 }));
        assert!(!notifier.notify(LaunchEvent::Started { pid: 3 }));
        assert_eq!(notifier.dropped(), 2);
    }

    #[test]
    fn drops_when_receiver_is_gone() {
        let (notifier, rx) = LaunchNotifier::channel(4);
        drop(rx);
        assert!(!notifier.notify(LaunchEvent::Started { pid: 1 }));
        assert_eq!(notifier.dropped(), 1);
    }
}
