//! Sentinel Pipeline: real-time detection and correlation engine for a
//! DFIR/SIEM platform.
//!
//! Events land on a durable, consumer-group-partitioned buffer; two
//! consumer groups read every event off it — one indexes it into the
//! historical store, the other feeds it through the Correlation Engine's
//! windowed sequence matching. A separate tick-driven scheduler dispatches
//! scheduled rules against the historical store. Both paths that produce a
//! match converge on the Alert Generator, which deduplicates, folds hits
//! into an alert, and drives its lifecycle.
//!
//! # Modules
//!
//! - [`domain`] — cross-cutting value objects (severity, dialect, dedup key, entity key, ...)
//! - [`events`] — the normalized event shape crossing the buffer
//! - [`buffer`] — Event Buffer: durable log with consumer groups (NATS JetStream)
//! - [`rules`] — Rule Store: rule inventory and execution history (Postgres)
//! - [`historical`] — Historical Store contract: search/count and the write-side indexer
//! - [`detection`] — Detection Engine: scheduled rule execution and threshold evaluation
//! - [`correlation`] — Correlation Engine: stateful windowed sequence matching
//! - [`alerts`] — Alert Generator: deduplication, entity extraction, lifecycle
//! - [`state_machine`] — generic finite state machine abstractions, concretely driving the alert lifecycle
//! - [`scheduler`] — Scheduler/Runner: rule ticks, consumer workers, expiry sweeper
//! - [`config`] — layered process configuration
//! - [`errors`] — the crate's error type and retry/dead-letter/surface/abort dispatch
//! - [`subjects`] — NATS stream/subject naming

pub mod alerts;
pub mod buffer;
pub mod config;
pub mod correlation;
pub mod detection;
pub mod domain;
pub mod errors;
pub mod events;
pub mod historical;
pub mod rules;
pub mod scheduler;
pub mod state_machine;
pub mod subjects;

pub use config::{ConfigLoader, PipelineConfig};
pub use errors::{Disposition, PipelineError, PipelineResult};
pub use events::{Event, EventFields};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
