use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::bail;
use crate::error::{ErrorKind, StewardResult};
use crate::latch::gate::{LatchState, ResourceLatch};

/// Default interval between "still draining" log lines.
const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Counts operations admitted through a latch that have not finished yet.
#[derive(Debug, Clone)]
pub struct InFlightTracker {
    count_tx: Arc<watch::Sender<usize>>,
}

impl InFlightTracker {
    pub fn new() -> Self {
        let (count_tx, _) = watch::channel(0);

        Self {
            count_tx: Arc::new(count_tx),
        }
    }

    /// Returns the number of operations in flight.
    pub fn count(&self) -> usize {
        *self.count_tx.borrow()
    }

    /// Subscribes to count changes.
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.count_tx.subscribe()
    }

    pub(crate) fn acquire(&self) -> InFlightGuard {
        self.count_tx.send_modify(|count| *count += 1);

        InFlightGuard {
            tracker: self.clone(),
        }
    }
}

impl Default for InFlightTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Marks one operation as in flight until dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    tracker: InFlightTracker,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.tracker
            .count_tx
            .send_modify(|count| *count = count.saturating_sub(1));
    }
}

/// Outcome of a successful drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quiesced {
    /// Operations that were in flight when the drain started.
    pub drained: usize,
    /// Time spent waiting for them.
    pub elapsed: Duration,
}

/// Waits for in-flight operations on a latched resource to finish.
#[derive(Debug, Clone)]
pub struct DrainCoordinator {
    report_interval: Duration,
}

impl DrainCoordinator {
    pub fn new() -> Self {
        Self {
            report_interval: DEFAULT_REPORT_INTERVAL,
        }
    }

    /// Sets how often a pending drain logs the remaining in-flight count.
    pub fn with_report_interval(mut self, report_interval: Duration) -> Self {
        self.report_interval = report_interval;
        self
    }

    /// Waits until nothing is in flight on `latch`, then marks it closed.
    ///
    /// The latch must be closing. When `timeout` elapses first the latch is reopened and
    /// [`ErrorKind::DrainTimeout`] is returned, so the resource is never left half latched.
    pub async fn quiesce(&self, latch: &ResourceLatch, timeout: Duration) -> StewardResult<Quiesced> {
        if latch.state() != LatchState::Closing {
            bail!(
                ErrorKind::InvalidState,
                "Only a closing latch can be drained",
                format!("resource `{}` is {:?}", latch.resource(), latch.state())
            );
        }

        let started = Instant::now();
        let mut count_rx = latch.in_flight().subscribe();
        let drained = *count_rx.borrow_and_update();

        let wait_for_zero = async {
            let mut report = interval(self.report_interval);
            report.set_missed_tick_behavior(MissedTickBehavior::Delay);
            report.tick().await;

            loop {
                let remaining = *count_rx.borrow_and_update();
                if remaining == 0 {
                    return;
                }

                tokio::select! {
                    changed = count_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    _ = report.tick() => {
                        debug!(
                            resource = %latch.resource(),
                            in_flight = remaining,
                            "waiting for in-flight operations to drain"
                        );
                    }
                }
            }
        };

        if tokio::time::timeout(timeout, wait_for_zero).await.is_err() {
            let remaining = latch.in_flight().count();
            warn!(
                resource = %latch.resource(),
                in_flight = remaining,
                timeout_ms = timeout.as_millis() as u64,
                "drain timed out, reopening latch"
            );
            latch.open();

            bail!(
                ErrorKind::DrainTimeout,
                "In-flight operations did not finish before the drain timeout",
                format!("in-flight operations: {remaining}, timeout: {timeout:?}")
            );
        }

        latch.mark_closed();
        let elapsed = started.elapsed();
        info!(
            resource = %latch.resource(),
            drained,
            elapsed_ms = elapsed.as_millis() as u64,
            "resource quiesced"
        );

        Ok(Quiesced { drained, elapsed })
    }
}

impl Default for DrainCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
