//! # Command Orchestration
//!
//! Durable, suspendable OTA command instances: the front end that starts and
//! routes, the per-instance runner tasks, and the garbage collector.

pub mod cleanup;
pub mod clients;
pub mod orchestrator;
mod runner;

pub use cleanup::{CleanupReport, GarbageCollector};
pub use clients::{CommandSubmitter, SubmissionError};
pub use orchestrator::{
    CommandDispatcher, CommandOrchestrator, InboundOutcome, ResumeReport, StartOutcome,
};
