//! Process-wide configuration shared by the stackception crates.
//!
//! [`determinism`] controls how unseeded parameter initialisation picks its
//! random streams, [`tracing`] installs the global subscriber.

pub mod determinism;
pub mod tracing;
