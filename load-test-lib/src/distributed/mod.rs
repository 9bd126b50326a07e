//! Coordinator/worker orchestration of a load test over many hosts.
//!
//! The [`coordinator`] owns the run state machine and serves the control
//! protocol described in [`protocol`]. Each [`worker`] drives its own
//! [`crate::engine::Broadcaster`] and streams stats back.

pub mod coordinator;
pub mod protocol;
pub mod worker;
