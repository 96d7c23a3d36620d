//! Structured progress events.
//!
//! Every notable transition (sweep started, ledger pruned, schema pruned,
//! secret deleted, pass failed) is emitted as a typed [`EngineEvent`] into an
//! [`EventSink`]. Delivery is fire-and-forget: sinks never fail and a full
//! buffer drops instead of blocking.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Default capacity of the bounded in-memory buffer.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSeverity {
    Normal,
    Warning,
}

/// Closed set of event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SweepStarted,
    SweepCompleted,
    SweepAborted,
    LedgerPruned,
    SchemaPruned,
    SchemaPruneHeld,
    PassFailed,
    SecretDeleted,
    SecretDeleteFailed,
    PolicyMembershipUpdated,
    LabelsStamped,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SweepStarted => "sweep_started",
            Self::SweepCompleted => "sweep_completed",
            Self::SweepAborted => "sweep_aborted",
            Self::LedgerPruned => "ledger_pruned",
            Self::SchemaPruned => "schema_pruned",
            Self::SchemaPruneHeld => "schema_prune_held",
            Self::PassFailed => "pass_failed",
            Self::SecretDeleted => "secret_deleted",
            Self::SecretDeleteFailed => "secret_delete_failed",
            Self::PolicyMembershipUpdated => "policy_membership_updated",
            Self::LabelsStamped => "labels_stamped",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One structured progress event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineEvent {
    pub kind: EventKind,
    pub severity: EventSeverity,
    /// The object or type the event is about.
    pub subject: String,
    /// Human-readable message.
    pub message: String,
    /// Structured detail fields, deterministic via `BTreeMap`.
    pub fields: BTreeMap<String, String>,
}

impl EngineEvent {
    pub fn normal(kind: EventKind, subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: EventSeverity::Normal,
            subject: subject.into(),
            message: message.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn warning(
        kind: EventKind,
        subject: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity: EventSeverity::Warning,
            ..Self::normal(kind, subject, message)
        }
    }

    /// Attach a detail field.
    pub fn field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Render as a single JSON line for log shipping.
    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Fire-and-forget event recipient. No delivery contract.
pub trait EventSink {
    fn record(&mut self, event: EngineEvent);
}

/// Bounded in-memory buffer; the standard sink for tests and lab runs.
#[derive(Debug, Clone)]
pub struct EventBuffer {
    events: Vec<EngineEvent>,
    capacity: usize,
    dropped: u64,
}

impl EventBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Vec::new(),
            capacity,
            dropped: 0,
        }
    }

    pub fn events(&self) -> &[EngineEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events dropped because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Events of one kind, in emission order.
    pub fn of_kind(&self, kind: EventKind) -> Vec<&EngineEvent> {
        self.events.iter().filter(|e| e.kind == kind).collect()
    }

    pub fn take_events(&mut self) -> Vec<EngineEvent> {
        std::mem::take(&mut self.events)
    }
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for EventBuffer {
    fn record(&mut self, event: EngineEvent) {
        if self.events.len() >= self.capacity {
            self.dropped = self.dropped.saturating_add(1);
            return;
        }
        self.events.push(event);
    }
}

/// Sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn record(&mut self, _event: EngineEvent) {}
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EngineEvent {
        EngineEvent::normal(EventKind::SweepStarted, "widgets.example.io", "sweep started")
            .field("stale", "v1alpha1")
    }

    #[test]
    fn builder_sets_fields() {
        let e = sample();
        assert_eq!(e.kind, EventKind::SweepStarted);
        assert_eq!(e.severity, EventSeverity::Normal);
        assert_eq!(e.subject, "widgets.example.io");
        assert_eq!(e.fields.get("stale").map(String::as_str), Some("v1alpha1"));
    }

    #[test]
    fn warning_severity() {
        let e = EngineEvent::warning(EventKind::PassFailed, "t", "boom");
        assert_eq!(e.severity, EventSeverity::Warning);
    }

    #[test]
    fn buffer_records_in_order() {
        let mut buf = EventBuffer::new();
        buf.record(sample());
        buf.record(EngineEvent::normal(EventKind::SweepCompleted, "t", "done"));
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.events()[0].kind, EventKind::SweepStarted);
        assert_eq!(buf.of_kind(EventKind::SweepCompleted).len(), 1);
    }

    #[test]
    fn buffer_drops_at_capacity() {
        let mut buf = EventBuffer::with_capacity(1);
        buf.record(sample());
        buf.record(sample());
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.dropped(), 1);
    }

    #[test]
    fn json_line_is_one_line() {
        let line = sample().to_json_line();
        assert!(line.contains("\"sweep_started\""));
        assert!(!line.contains('\n'));
    }

    #[test]
    fn kind_tags_are_snake_case() {
        assert_eq!(EventKind::LedgerPruned.to_string(), "ledger_pruned");
        assert_eq!(EventKind::SchemaPruneHeld.to_string(), "schema_prune_held");
        assert_eq!(
            EventKind::PolicyMembershipUpdated.to_string(),
            "policy_membership_updated"
        );
    }

    #[test]
    fn event_serde_round_trip() {
        let e = sample();
        let json = serde_json::to_string(&e).expect("serialize");
        let restored: EngineEvent = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(e, restored);
    }
}
