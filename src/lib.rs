//! sessiontap - correlates coding-agent session logs with locally wrapped
//! sessions and syncs usage metrics and transcripts to a telemetry API
//!
//! This library crate exposes internal modules for integration testing.

pub mod adapters;
pub mod config;
pub mod correlation;
pub mod data;
pub mod hooks;
pub mod orchestrator;
pub mod processors;
pub mod snapshot;
pub mod store;
pub mod sync;
pub mod transport;
pub mod util;
