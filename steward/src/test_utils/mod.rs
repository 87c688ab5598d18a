//! Utilities shared by unit and integration tests.
//!
//! - [`datastore`] - an in-memory datastore and an exporter backing it up
//! - [`steps`] - steps with scripted behavior, observed through probes
//! - [`notify`] - waiting on [`tokio::sync::Notify`] with a timeout
//! - [`node`] - maintenance nodes joined to an in-memory cluster

pub mod datastore;
pub mod node;
pub mod notify;
pub mod steps;
