use std::time::Duration;
use std::{fmt, sync::Arc};

use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::warn;

/// Default timeout for test notifications.
///
/// Maintenance tests only wait on in-process tasks, which reach their checkpoints well within
/// this bound.
pub const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// A wrapper around [`Arc<Notify>`] that fails a test instead of letting it hang when a step
/// never reaches the point it should notify from.
#[derive(Clone)]
pub struct TimedNotify {
    notify: Arc<Notify>,
    timeout_duration: Duration,
}

impl TimedNotify {
    /// Creates a new [`TimedNotify`] with the default timeout.
    pub fn new(notify: Arc<Notify>) -> Self {
        Self::with_timeout(notify, DEFAULT_NOTIFY_TIMEOUT)
    }

    /// Creates a new [`TimedNotify`] with a custom timeout duration.
    pub fn with_timeout(notify: Arc<Notify>, timeout_duration: Duration) -> Self {
        Self {
            notify,
            timeout_duration,
        }
    }

    /// Waits for a notification with timeout.
    ///
    /// # Panics
    ///
    /// Panics if the timeout elapses before the notification is received.
    pub async fn notified(&self) {
        if timeout(self.timeout_duration, self.notify.notified())
            .await
            .is_err()
        {
            panic!(
                "Test notification timed out after {:?}. \
                 The awaited step or task never reached the expected point.",
                self.timeout_duration
            );
        }
    }

    /// Waits for a notification and returns whether it arrived before the timeout.
    pub async fn try_notified(&self) -> bool {
        let notified = timeout(self.timeout_duration, self.notify.notified())
            .await
            .is_ok();
        if !notified {
            warn!(timeout = ?self.timeout_duration, "test notification timed out");
        }

        notified
    }

    /// Returns the underlying [`Arc<Notify>`].
    pub fn inner(&self) -> &Arc<Notify> {
        &self.notify
    }
}

impl fmt::Debug for TimedNotify {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimedNotify")
            .field("timeout_duration", &self.timeout_duration)
            .finish()
    }
}
