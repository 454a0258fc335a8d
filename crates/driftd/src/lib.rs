//! Drift detection and canary remediation engine - exposes modules for testing.

pub mod audit;
pub mod backup;
pub mod classify;
pub mod cli;
pub mod collector;
pub mod compare;
pub mod detect;
pub mod invoker;
pub mod lease;
pub mod notify;
pub mod orchestrator;
pub mod registry;
pub mod report;
pub mod rollback;
pub mod transport;
