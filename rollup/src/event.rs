//! Decoded telemetry events.
//!
//! The ingestion layer decodes wire payloads into [`ApmEvent`]s; this crate
//! only consumes them. Events deserialize from JSON so that JSON-lines files
//! can be replayed through the CLI.

use serde::{Deserialize, Serialize};

/// Kind of a telemetry event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A unit of work handled by a service (a request, a job).
    Transaction,
    /// An operation within a transaction, possibly calling a dependency.
    Span,
}

/// Result of the operation an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The operation succeeded.
    Success,
    /// The operation failed.
    Failure,
    /// The agent could not tell.
    #[default]
    Unknown,
}

/// A decoded transaction or span event.
///
/// # Example
///
/// ```rust
/// use rollup::event::{ApmEvent, EventKind, Outcome};
///
/// let event: ApmEvent = serde_json::from_str(
///     r#"{"timestamp_ns": 1700000000000000000, "service": "checkout-api",
///         "kind": "transaction", "type": "request", "name": "POST /pay",
///         "duration_us": 1250, "outcome": "success"}"#,
/// ).unwrap();
/// assert_eq!(event.kind, EventKind::Transaction);
/// assert_eq!(event.outcome, Outcome::Success);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApmEvent {
    /// Event time in nanoseconds since the Unix epoch.
    pub timestamp_ns: u64,
    /// Name of the emitting service.
    pub service: String,
    /// Transaction or span.
    pub kind: EventKind,
    /// Transaction type (`request`, `job`) or span type (`db`, `external`).
    #[serde(rename = "type")]
    pub event_type: String,
    /// Transaction or span name.
    pub name: String,
    /// Duration in microseconds.
    pub duration_us: u64,
    /// Success flag.
    #[serde(default)]
    pub outcome: Outcome,
    /// Downstream dependency (destination resource) of a span.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
}

impl ApmEvent {
    /// Creates a transaction event.
    pub fn transaction(
        timestamp_ns: u64,
        service: impl Into<String>,
        transaction_type: impl Into<String>,
        name: impl Into<String>,
        duration_us: u64,
        outcome: Outcome,
    ) -> Self {
        Self {
            timestamp_ns,
            service: service.into(),
            kind: EventKind::Transaction,
            event_type: transaction_type.into(),
            name: name.into(),
            duration_us,
            outcome,
            destination: None,
        }
    }

    /// Creates a span event calling `destination`.
    pub fn span(
        timestamp_ns: u64,
        service: impl Into<String>,
        name: impl Into<String>,
        destination: impl Into<String>,
        duration_us: u64,
        outcome: Outcome,
    ) -> Self {
        Self {
            timestamp_ns,
            service: service.into(),
            kind: EventKind::Span,
            event_type: "external".to_string(),
            name: name.into(),
            duration_us,
            outcome,
            destination: Some(destination.into()),
        }
    }

    /// Approximate in-memory payload size, reported as ingested bytes.
    pub fn size_bytes(&self) -> usize {
        const FIXED: usize = 8 + 8 + 2;
        FIXED
            + self.service.len()
            + self.event_type.len()
            + self.name.len()
            + self.destination.as_ref().map_or(0, String::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_span_defaults() {
        let event: ApmEvent = serde_json::from_str(
            r#"{"timestamp_ns": 5, "service": "a", "kind": "span", "type": "db",
                "name": "SELECT", "duration_us": 3, "destination": "postgres"}"#,
        )
        .unwrap();

        assert_eq!(event.kind, EventKind::Span);
        assert_eq!(event.outcome, Outcome::Unknown);
        assert_eq!(event.destination.as_deref(), Some("postgres"));
    }

    #[test]
    fn test_serialize_round_trip() {
        let event = ApmEvent::transaction(1, "svc", "request", "GET /", 10, Outcome::Failure);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"request""#));
        assert!(!json.contains("destination"));
        let back: ApmEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_size_bytes() {
        let event = ApmEvent::span(1, "svc", "q", "db", 10, Outcome::Success);
        assert_eq!(event.size_bytes(), 18 + 3 + 8 + 1 + 2);
    }
}
