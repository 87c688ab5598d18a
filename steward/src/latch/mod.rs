//! Freezing and draining access to the shared datastore.
//!
//! A [`gate::ResourceLatch`] stops new callers from reaching the datastore, a
//! [`drain::DrainCoordinator`] waits for the callers already admitted to finish, and
//! [`guarded::LatchedDatastore`] routes every datastore call through the latch.
//!
//! Callers that are already inside a transaction when the latch closes keep going: the
//! transaction's [`gate::TransactionToken`] is registered as an exemption, so the drain does
//! not end up waiting on a transaction that is itself waiting on the latch.

pub mod drain;
pub mod gate;
pub mod guarded;

pub use drain::{DrainCoordinator, InFlightGuard, InFlightTracker, Quiesced};
pub use gate::{LatchState, LatchToken, ResourceLatch, TransactionToken};
pub use guarded::{Datastore, InFlight, LatchedDatastore, TransactionGuard};
