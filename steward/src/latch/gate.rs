use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bail;
use crate::error::{ErrorKind, StewardResult};
use crate::latch::drain::{InFlightGuard, InFlightTracker};

/// State of a [`ResourceLatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatchState {
    /// Callers pass freely.
    Open,
    /// New callers are held back while in-flight operations drain.
    Closing,
    /// New callers are held back and nothing is in flight.
    Closed,
}

/// Identifies a transaction that is active on the guarded resource.
///
/// While registered as an exemption, calls presenting the token pass a closed latch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionToken(Uuid);

impl TransactionToken {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TransactionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
struct Shared {
    state: LatchState,
    exemptions: HashSet<TransactionToken>,
}

#[derive(Debug)]
struct LatchInner {
    resource: String,
    shared: Mutex<Shared>,
    /// Mirrors `shared.state` for waiters. Only written while `shared` is locked.
    state_tx: watch::Sender<LatchState>,
    waiters: AtomicUsize,
    in_flight: InFlightTracker,
    operation_timeout: Duration,
}

/// Reusable gate in front of a shared resource.
///
/// While the latch is closing or closed, [`ResourceLatch::enter`] waits until
/// [`ResourceLatch::open`] is called, unless the caller presents an exempt transaction token.
/// Admission and in-flight accounting happen under the same lock that [`ResourceLatch::close`]
/// takes, so every caller is either counted before the close or sees the closed gate.
#[derive(Debug, Clone)]
pub struct ResourceLatch {
    inner: Arc<LatchInner>,
}

impl ResourceLatch {
    /// Creates an open latch for `resource`.
    ///
    /// Callers blocked on the closed latch give up after `operation_timeout`.
    pub fn new(resource: impl Into<String>, operation_timeout: Duration) -> Self {
        let (state_tx, _) = watch::channel(LatchState::Open);

        Self {
            inner: Arc::new(LatchInner {
                resource: resource.into(),
                shared: Mutex::new(Shared {
                    state: LatchState::Open,
                    exemptions: HashSet::new(),
                }),
                state_tx,
                waiters: AtomicUsize::new(0),
                in_flight: InFlightTracker::new(),
                operation_timeout,
            }),
        }
    }

    /// Returns the name of the guarded resource.
    pub fn resource(&self) -> &str {
        &self.inner.resource
    }

    /// Returns the current state.
    pub fn state(&self) -> LatchState {
        self.lock_shared().state
    }

    /// Returns the number of callers currently waiting on the latch.
    pub fn waiters(&self) -> usize {
        self.inner.waiters.load(Ordering::Acquire)
    }

    /// Returns the tracker counting operations admitted through the latch.
    pub fn in_flight(&self) -> &InFlightTracker {
        &self.inner.in_flight
    }

    /// Subscribes to state transitions.
    pub fn subscribe(&self) -> watch::Receiver<LatchState> {
        self.inner.state_tx.subscribe()
    }

    /// Closes the latch and returns the token that reopens it.
    ///
    /// Fails with [`ErrorKind::InvalidState`] when the latch is not open.
    pub fn close(&self) -> StewardResult<LatchToken> {
        let mut shared = self.lock_shared();
        if shared.state != LatchState::Open {
            bail!(
                ErrorKind::InvalidState,
                "The latch is already closed",
                format!("resource `{}` is {:?}", self.inner.resource, shared.state)
            );
        }

        shared.state = LatchState::Closing;
        self.inner.state_tx.send_replace(LatchState::Closing);

        info!(
            resource = %self.inner.resource,
            in_flight = self.inner.in_flight.count(),
            exemptions = shared.exemptions.len(),
            "latch closed"
        );

        Ok(LatchToken {
            latch: self.clone(),
            released: false,
        })
    }

    /// Opens the latch and wakes every waiter.
    ///
    /// Safe to call repeatedly and from any task.
    pub fn open(&self) {
        let mut shared = self.lock_shared();
        if shared.state == LatchState::Open {
            return;
        }

        shared.state = LatchState::Open;
        self.inner.state_tx.send_replace(LatchState::Open);

        info!(
            resource = %self.inner.resource,
            waiters = self.waiters(),
            "latch opened"
        );
    }

    /// Moves a closing latch to closed once draining finished.
    pub(crate) fn mark_closed(&self) -> bool {
        let mut shared = self.lock_shared();
        if shared.state != LatchState::Closing {
            return false;
        }

        shared.state = LatchState::Closed;
        self.inner.state_tx.send_replace(LatchState::Closed);

        true
    }

    /// Passes the latch and returns a guard counting the caller as in flight.
    ///
    /// Waits while the latch is closing or closed unless `transaction` is an active
    /// exemption. Fails with [`ErrorKind::LatchTimeout`] when the latch stays shut for longer
    /// than the operation timeout.
    pub async fn enter(
        &self,
        transaction: Option<&TransactionToken>,
    ) -> StewardResult<InFlightGuard> {
        let deadline = Instant::now() + self.inner.operation_timeout;

        loop {
            let mut state_rx = {
                let shared = self.lock_shared();
                let exempt = transaction.is_some_and(|token| shared.exemptions.contains(token));
                if shared.state == LatchState::Open || exempt {
                    return Ok(self.inner.in_flight.acquire());
                }

                // Subscribed while holding the lock, so a concurrent `open` is always observed.
                self.inner.state_tx.subscribe()
            };

            let _waiter = WaiterGuard::register(&self.inner.waiters);
            debug!(resource = %self.inner.resource, "waiting for latch to open");

            match timeout_at(deadline, state_rx.wait_for(|state| *state == LatchState::Open)).await
            {
                Ok(Ok(_)) => continue,
                Ok(Err(_)) => bail!(
                    ErrorKind::InvalidState,
                    "The latch was dropped while callers were waiting"
                ),
                Err(_) => {
                    warn!(
                        resource = %self.inner.resource,
                        timeout_ms = self.inner.operation_timeout.as_millis() as u64,
                        "gave up waiting for latch"
                    );
                    bail!(
                        ErrorKind::LatchTimeout,
                        "Timed out waiting for the latch to open",
                        format!(
                            "resource `{}` stayed latched for {:?}",
                            self.inner.resource, self.inner.operation_timeout
                        )
                    );
                }
            }
        }
    }

    /// Returns whether `token` is currently exempt.
    pub fn is_exempt(&self, token: &TransactionToken) -> bool {
        self.lock_shared().exemptions.contains(token)
    }

    pub(crate) fn register_exemption(&self, token: TransactionToken) {
        self.lock_shared().exemptions.insert(token);
    }

    pub(crate) fn remove_exemption(&self, token: &TransactionToken) {
        self.lock_shared().exemptions.remove(token);
    }

    fn lock_shared(&self) -> MutexGuard<'_, Shared> {
        self.inner
            .shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Scoped ownership of a closed latch.
///
/// [`LatchToken::release`] reopens the latch. A token dropped without being released reopens
/// it as well, so an aborted or panicking task never leaves the resource latched.
#[derive(Debug)]
pub struct LatchToken {
    latch: ResourceLatch,
    released: bool,
}

impl LatchToken {
    /// Returns the latch this token closed.
    pub fn latch(&self) -> &ResourceLatch {
        &self.latch
    }

    /// Reopens the latch.
    pub fn release(mut self) {
        self.released = true;
        self.latch.open();
    }
}

impl Drop for LatchToken {
    fn drop(&mut self) {
        if !self.released {
            warn!(
                resource = %self.latch.resource(),
                "latch token dropped without release, reopening latch"
            );
            self.latch.open();
        }
    }
}

struct WaiterGuard<'a>(&'a AtomicUsize);

impl<'a> WaiterGuard<'a> {
    fn register(waiters: &'a AtomicUsize) -> Self {
        waiters.fetch_add(1, Ordering::AcqRel);
        Self(waiters)
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}
