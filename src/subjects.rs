//! NATS subject naming for the pipeline's streams.
//!
//! Generalizes the teacher's `SubjectBuilder` (one aggregate type, one
//! operation) to the pipeline's four named streams, each a JetStream stream
//! covering subject space `pipeline.<stream>.>`.

use std::fmt;

/// One of the four durable streams the pipeline maintains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamName {
    Events,
    Alerts,
    Correlation,
    DeadLetter,
}

impl StreamName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamName::Events => "events",
            StreamName::Alerts => "alerts",
            StreamName::Correlation => "correlation",
            StreamName::DeadLetter => "dlq",
        }
    }

    /// The JetStream stream name (uppercase convention, matches the
    /// teacher's `create_infrastructure_stream`).
    pub fn jetstream_name(&self) -> String {
        format!("PIPELINE_{}", self.as_str().to_uppercase())
    }

    /// Wildcard subject filter covering every message on this stream.
    pub fn wildcard_subject(&self) -> String {
        format!("pipeline.{}.>", self.as_str())
    }
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Builds concrete publish subjects within a stream.
pub struct SubjectBuilder;

impl SubjectBuilder {
    /// `pipeline.events.<source>`
    pub fn event(source: &str) -> String {
        format!("pipeline.events.{source}")
    }

    /// `pipeline.alerts.<kind>` where kind is e.g. `created`, `updated`, `status_changed`.
    pub fn alert(kind: &str) -> String {
        format!("pipeline.alerts.{kind}")
    }

    /// `pipeline.correlation.<rule_id>`
    pub fn correlation(rule_id: &str) -> String {
        format!("pipeline.correlation.{rule_id}")
    }

    /// `pipeline.dlq.<stream>`
    pub fn dead_letter(origin_stream: StreamName) -> String {
        format!("pipeline.dlq.{origin_stream}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jetstream_name_uppercases() {
        assert_eq!(StreamName::Events.jetstream_name(), "PIPELINE_EVENTS");
        assert_eq!(StreamName::DeadLetter.jetstream_name(), "PIPELINE_DLQ");
    }

    #[test]
    fn wildcard_subject_covers_stream() {
        assert_eq!(StreamName::Alerts.wildcard_subject(), "pipeline.alerts.>");
    }

    #[test]
    fn event_subject_scoped_by_source() {
        assert_eq!(SubjectBuilder::event("okta"), "pipeline.events.okta");
    }
}
