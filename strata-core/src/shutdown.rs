use std::sync::{Arc, OnceLock};

use tokio::sync::broadcast;

/// A handle used to shut down a running stack instance.
///
/// Cloning produces connected handles: firing any one of them releases every
/// task waiting on any clone. The wire poller, which runs on a plain OS
/// thread, observes the same signal through [`Shutdown::is_shut_down`].
#[derive(Debug, Clone)]
pub struct Shutdown {
    /// The exit status, set exactly once.
    exit_status: Arc<OnceLock<ExitStatus>>,
    /// Sent on when the exit status is set.
    notify: broadcast::Sender<()>,
}

impl Shutdown {
    /// Creates a new active shutdown handle.
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(1);
        Self {
            exit_status: Arc::new(OnceLock::new()),
            notify,
        }
    }

    /// Sends [`ExitStatus::Exited`] to all handles cloned from this one.
    pub fn shut_down(&self) {
        self.shut_down_with_status(ExitStatus::Exited);
    }

    /// Sends `status` to all handles cloned from this one. If a shutdown has
    /// already occurred, nothing happens.
    pub fn shut_down_with_status(&self, status: ExitStatus) {
        let _ = self.exit_status.set(status);
        let _ = self.notify.send(());
    }

    /// Returns the exit status if a shutdown has been requested.
    pub fn try_get_status(&self) -> Option<ExitStatus> {
        self.exit_status.get().copied()
    }

    /// Whether a shutdown has been requested. Usable from synchronous code.
    pub fn is_shut_down(&self) -> bool {
        self.exit_status.get().is_some()
    }

    /// Waits for a shutdown status to arrive.
    pub async fn wait(&self) -> ExitStatus {
        let mut recv = self.notify.subscribe();
        loop {
            match self.try_get_status() {
                Some(status) => return status,
                None => _ = recv.recv().await,
            }
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// How the process should report its exit.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ExitStatus {
    /// Exit with the given status code.
    Status(u32),
    /// A clean, ordinary exit.
    Exited,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn all_clones_observe_the_status() {
        let status = ExitStatus::Status(22);
        let shutdown = Shutdown::new();
        let clones = [shutdown.clone(), shutdown.clone(), shutdown.clone()];

        shutdown.shut_down_with_status(status);

        for clone in clones {
            assert!(clone.is_shut_down());
            assert_eq!(clone.wait().await, status);
        }
    }

    #[tokio::test]
    async fn first_status_wins() {
        let shutdown = Shutdown::new();
        shutdown.shut_down();
        shutdown.shut_down_with_status(ExitStatus::Status(7));
        assert_eq!(shutdown.try_get_status(), Some(ExitStatus::Exited));
    }
}
