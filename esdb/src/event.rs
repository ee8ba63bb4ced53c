//! The event envelope and the change description reducers produce.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// An immutable record of one external fact.
///
/// `v` is strictly increasing starting at 1 with no gaps. Once a queue
/// implementation has persisted `result` and/or `error` for an event (via
/// [`crate::queue::EventQueue::set`]), the event must never be mutated
/// again.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// The event's strictly increasing version number.
    pub v: u64,
    /// The event's type, used by models to decide whether to react.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Milliseconds since the Unix epoch, as supplied by the dispatcher.
    pub ts: i64,
    /// The event's payload.
    pub data: serde_json::Value,
    /// Per-model error payloads. Non-empty iff this event short-circuited
    /// preprocessing, a reducer rejected it, or the reducer dispatch
    /// itself crashed.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub error: HashMap<String, serde_json::Value>,
    /// Per-model reducer outputs that were actually applied. Models whose
    /// reducer returned "no change" are absent, not present-with-null.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub result: HashMap<String, serde_json::Value>,
}

impl Event {
    /// Creates a new, unhandled event with empty `error`/`result` maps.
    pub fn new(v: u64, event_type: impl Into<String>, ts: i64, data: serde_json::Value) -> Self {
        Self {
            v,
            event_type: event_type.into(),
            ts,
            data,
            error: HashMap::new(),
            result: HashMap::new(),
        }
    }

    /// Whether this event has been durably acknowledged by the queue (its
    /// `result` and/or `error` map has been set).
    #[must_use]
    pub fn is_handled(&self) -> bool {
        !self.error.is_empty() || !self.result.is_empty()
    }
}

/// A change description a reducer asks the apply phase to make to its
/// model's table.
///
/// A reducer returning `Change::default()` (all four lists empty) is
/// equivalent to returning "no change" — callers should treat it as absent
/// from the result map, per the "drop no-change entries" rule in the core
/// reducer pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Change {
    /// Rows to upsert wholesale (insert-or-replace by primary key).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub set: Vec<serde_json::Value>,
    /// Rows to insert; the row must not already exist.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ins: Vec<serde_json::Value>,
    /// Partial rows to merge into existing rows.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upd: Vec<serde_json::Value>,
    /// Row identifiers (or predicates) to delete.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rm: Vec<serde_json::Value>,
}

impl Change {
    /// Whether every field is empty, i.e. this change is a no-op.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.ins.is_empty() && self.upd.is_empty() && self.rm.is_empty()
    }
}

/// The outcome of running one model's reducer against one event.
#[derive(Debug, Clone)]
pub enum ReducerOutcome {
    /// The reducer determined nothing needs to change; the caller should
    /// drop this model from the result map entirely.
    NoChange,
    /// The reducer's change description, to be applied by
    /// [`crate::model::Model::apply_changes`].
    Changed(Change),
    /// The reducer rejected the event. Carried as an arbitrary JSON value
    /// so models can attach structured diagnostics, not just a string.
    Errored(serde_json::Value),
}
