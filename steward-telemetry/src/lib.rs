//! Tracing setup shared by steward binaries and tests.

pub mod tracing;
