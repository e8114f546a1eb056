//! # Floodgate Core
//!
//! Processor execution and snapshot coordination for the floodgate stream engine.
//!
//! - [`processor`]: The [`Processor`](processor::Processor) lifecycle contract,
//!   [`Inbox`](processor::Inbox), bounded [`Outbox`](processor::Outbox) and a few
//!   built-in processors.
//! - [`tasklet`]: [`ProcessorTasklet`](tasklet::ProcessorTasklet), the state machine
//!   that drives one processor instance in small cooperative steps.
//! - [`snapshot`]: [`SnapshotContext`](snapshot::SnapshotContext) coordination,
//!   barrier alignment and snapshot storage.
//! - [`execution`]: Worker threads running tasklets, and per-job executions.
//! - [`testing`]: [`ProcessorVerifier`](testing::ProcessorVerifier), a harness that
//!   checks a processor against the lifecycle contract.

pub mod conduit;
pub mod config;
pub mod error;
pub mod execution;
pub mod processor;
pub mod snapshot;
pub mod tasklet;
pub mod testing;
pub mod types;
