//! Error taxonomy for the detection and correlation pipeline
//!
//! Every fallible operation in this crate resolves to a [`PipelineError`],
//! tagged with the kind of failure from §7 of the design: transient I/O,
//! query syntax, state conflict, predicate failure, backpressure, or fatal.
//! Consumer loops dispatch on [`Disposition`] rather than matching on
//! exception types, per the "tagged result" redesign.

use thiserror::Error;

/// Errors that can occur anywhere in the pipeline
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Stream broker unreachable, store timeout — recovered locally with backoff
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    /// Historical store rejected the query; execution recorded, rule stays enabled
    #[error("query syntax error: {0}")]
    QuerySyntax(String),

    /// Optimistic-concurrency failure on a correlation row or alert
    #[error("state conflict: {0}")]
    StateConflict(String),

    /// Predicate evaluation raised inside a correlation stage or rule
    #[error("predicate evaluation failed: {0}")]
    PredicateFailure(String),

    /// Publisher told `reject_new`; surfaced to the caller, never retried here
    #[error("backpressure active: {0}")]
    Backpressure(String),

    /// Broker/store configuration invalid at startup, schema mismatch
    #[error("fatal configuration error: {0}")]
    Fatal(String),

    /// Serialization/deserialization of a wire payload failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Relational store error
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

impl PipelineError {
    /// The disposition a consumer loop should act on for this error
    pub fn disposition(&self) -> Disposition {
        match self {
            PipelineError::TransientIo(_) => Disposition::Retry,
            PipelineError::QuerySyntax(_) => Disposition::Surface,
            PipelineError::StateConflict(_) => Disposition::Retry,
            PipelineError::PredicateFailure(_) => Disposition::DeadLetter,
            PipelineError::Backpressure(_) => Disposition::Surface,
            PipelineError::Fatal(_) => Disposition::Abort,
            PipelineError::Serialization(_) => Disposition::DeadLetter,
            PipelineError::Store(_) => Disposition::Retry,
        }
    }
}

/// What a consumer loop should do in response to a [`PipelineError`]
///
/// This is the tagged result called for by the redesign notes: the pipeline
/// loop matches on `Disposition`, not on exception types or string content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Recoverable locally; retry with backoff (bounded by a retry budget)
    Retry,
    /// Move the offending entry to the DLQ and ack the original
    DeadLetter,
    /// Hand the error to the caller; the core does not retry it
    Surface,
    /// Unrecoverable; the process should exit non-zero
    Abort,
}

/// Result alias used throughout the pipeline
pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_io_retries() {
        assert_eq!(
            PipelineError::TransientIo("timeout".into()).disposition(),
            Disposition::Retry
        );
    }

    #[test]
    fn query_syntax_surfaces_without_retry() {
        assert_eq!(
            PipelineError::QuerySyntax("unexpected token".into()).disposition(),
            Disposition::Surface
        );
    }

    #[test]
    fn predicate_failure_dead_letters() {
        assert_eq!(
            PipelineError::PredicateFailure("division by zero".into()).disposition(),
            Disposition::DeadLetter
        );
    }

    #[test]
    fn fatal_aborts() {
        assert_eq!(
            PipelineError::Fatal("bad DSN".into()).disposition(),
            Disposition::Abort
        );
    }
}
