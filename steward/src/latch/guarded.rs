use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::StewardResult;
use crate::latch::drain::InFlightGuard;
use crate::latch::gate::{ResourceLatch, TransactionToken};

/// Connection manager of the shared datastore.
///
/// This is the capability the latch intercepts: the datastore itself is an external
/// collaborator and only needs to hand out connections.
#[async_trait]
pub trait Datastore: Send + Sync + 'static {
    /// Connection type handed out to callers.
    type Connection: Send + 'static;

    /// Opens a connection to the datastore.
    async fn connection(&self) -> StewardResult<Self::Connection>;
}

/// A connection obtained through a [`LatchedDatastore`].
///
/// Counts as in flight, and therefore holds up a drain, until dropped.
#[derive(Debug)]
pub struct InFlight<C> {
    connection: C,
    _guard: InFlightGuard,
}

impl<C> Deref for InFlight<C> {
    type Target = C;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl<C> DerefMut for InFlight<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.connection
    }
}

/// A transaction registered as an exemption of the datastore latch.
///
/// The transaction counts as in flight for its whole lifetime. Dropping the guard ends the
/// exemption.
#[derive(Debug)]
pub struct TransactionGuard {
    token: TransactionToken,
    latch: ResourceLatch,
    _guard: InFlightGuard,
}

impl TransactionGuard {
    /// Returns the token to present on calls made inside this transaction.
    pub fn token(&self) -> &TransactionToken {
        &self.token
    }
}

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        self.latch.remove_exemption(&self.token);
        debug!(token = %self.token, "transaction exemption removed");
    }
}

/// Decorator routing every datastore call through a [`ResourceLatch`].
///
/// Application code uses this type in place of the raw datastore. Maintenance steps that must
/// read the datastore while it is latched go through [`LatchedDatastore::bypass`].
#[derive(Debug)]
pub struct LatchedDatastore<D> {
    inner: Arc<D>,
    latch: ResourceLatch,
}

impl<D> Clone for LatchedDatastore<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            latch: self.latch.clone(),
        }
    }
}

impl<D> LatchedDatastore<D>
where
    D: Datastore,
{
    pub fn new(inner: D, latch: ResourceLatch) -> Self {
        Self {
            inner: Arc::new(inner),
            latch,
        }
    }

    /// Returns the latch guarding this datastore.
    pub fn latch(&self) -> &ResourceLatch {
        &self.latch
    }

    /// Returns the undecorated datastore.
    pub fn bypass(&self) -> &Arc<D> {
        &self.inner
    }

    /// Opens a connection on behalf of an active transaction.
    ///
    /// Passes a closed latch while `transaction` is an exemption.
    pub async fn connection_in(
        &self,
        transaction: &TransactionToken,
    ) -> StewardResult<InFlight<D::Connection>> {
        self.open_connection(Some(transaction)).await
    }

    /// Starts a transaction and registers it as a latch exemption.
    ///
    /// Starting a transaction passes through the latch like any other call.
    pub async fn begin_transaction(&self) -> StewardResult<TransactionGuard> {
        let guard = self.latch.enter(None).await?;
        let token = TransactionToken::new();
        self.latch.register_exemption(token);
        debug!(token = %token, resource = %self.latch.resource(), "transaction started");

        Ok(TransactionGuard {
            token,
            latch: self.latch.clone(),
            _guard: guard,
        })
    }

    async fn open_connection(
        &self,
        transaction: Option<&TransactionToken>,
    ) -> StewardResult<InFlight<D::Connection>> {
        let guard = self.latch.enter(transaction).await?;
        let connection = self.inner.connection().await?;

        Ok(InFlight {
            connection,
            _guard: guard,
        })
    }
}

#[async_trait]
impl<D> Datastore for LatchedDatastore<D>
where
    D: Datastore,
{
    type Connection = InFlight<D::Connection>;

    async fn connection(&self) -> StewardResult<Self::Connection> {
        self.open_connection(None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::time::{sleep, timeout};

    use crate::latch::LatchState;
    use crate::latch::drain::DrainCoordinator;

    struct CountingDatastore;

    #[async_trait]
    impl Datastore for CountingDatastore {
        type Connection = u32;

        async fn connection(&self) -> StewardResult<u32> {
            Ok(7)
        }
    }

    fn datastore() -> LatchedDatastore<CountingDatastore> {
        LatchedDatastore::new(
            CountingDatastore,
            ResourceLatch::new("datastore", Duration::from_secs(5)),
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn exempt_caller_is_not_blocked_and_others_wait_for_open() {
        let datastore = datastore();
        let transaction = datastore.begin_transaction().await.unwrap();
        let token = datastore.latch().close().unwrap();

        let connection = timeout(
            Duration::from_millis(200),
            datastore.connection_in(transaction.token()),
        )
        .await
        .expect("exempt caller must not block")
        .unwrap();
        assert_eq!(*connection, 7);

        let blocked = {
            let datastore = datastore.clone();
            tokio::spawn(async move { datastore.connection().await.map(|c| *c) })
        };
        sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());
        assert_eq!(datastore.latch().waiters(), 1);

        token.release();
        assert_eq!(blocked.await.unwrap().unwrap(), 7);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn drain_waits_for_open_transaction() {
        let datastore = datastore();
        let transaction = datastore.begin_transaction().await.unwrap();
        let _token = datastore.latch().close().unwrap();

        let latch = datastore.latch().clone();
        let drain = tokio::spawn(async move {
            DrainCoordinator::new()
                .quiesce(&latch, Duration::from_secs(5))
                .await
        });

        sleep(Duration::from_millis(50)).await;
        assert!(!drain.is_finished());

        // The transaction finishes its work through the exemption, then commits.
        let connection = datastore.connection_in(transaction.token()).await.unwrap();
        drop(connection);
        drop(transaction);

        drain.await.unwrap().unwrap();
        assert_eq!(datastore.latch().in_flight().count(), 0);
        assert_eq!(datastore.latch().state(), LatchState::Closed);
    }

    #[tokio::test]
    async fn ended_transaction_loses_exemption() {
        let datastore = datastore();
        let transaction = datastore.begin_transaction().await.unwrap();
        let stale = *transaction.token();
        drop(transaction);

        assert!(!datastore.latch().is_exempt(&stale));
    }
}
