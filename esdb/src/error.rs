//! The error type for this crate.

use std::collections::HashMap;

/// A specialized `Result` type for this crate's operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A failure from the underlying SQL engine, decorated with the
    /// identity of the database (its file path, or `:memory:`) and the
    /// offending SQL text, per the connection wrapper's error-decoration
    /// contract.
    #[error("sql error on {db}: {source} (sql: {sql})")]
    Sql {
        /// File path the connection was opened with, or `:memory:`.
        db: String,
        /// The SQL text that failed.
        sql: String,
        /// The underlying driver error.
        #[source]
        source: sqlx::Error,
    },

    /// Raised by `each` and similar streaming operations when the supplied
    /// row callback itself fails.
    #[error("row callback failed: {0}")]
    Callback(String),

    /// A value could not be serialized to, or deserialized from, JSON.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// `metadata` was registered as a user model; the name is reserved for
    /// the built-in version-tracking model.
    #[error("model name 'metadata' is reserved")]
    ReservedModelName,

    /// A reducer, preprocessor or deriver referenced a model that was never
    /// registered with the `Esdb`.
    #[error("model '{0}' is not registered")]
    UnknownModel(String),

    /// A preprocessor changed `event.v` or cleared `event.type`; surfaced
    /// under `event.error._preprocess` rather than propagated here, but
    /// retained as a distinct variant for callers that drive preprocessing
    /// directly.
    #[error("preprocessor '{model}' violated the event contract: {reason}")]
    PreprocessorMisuse {
        /// The offending model's registered name.
        model: String,
        /// Human-readable description of the violation.
        reason: String,
    },

    /// The event queue has no event at the requested version and none will
    /// ever arrive (used internally to distinguish "not yet" from "never").
    #[error("event queue has no event at version {0}")]
    NoSuchVersion(u64),

    /// `dispatch`/`handled_version` resolved to an event that carries a
    /// non-empty `error` map. The event itself is attached so callers can
    /// inspect which models failed and why.
    #[error("event {v} failed: {errors:?}")]
    EventFailed {
        /// The failed event's version.
        v: u64,
        /// Per-model error payloads, keyed by model name.
        errors: HashMap<String, serde_json::Value>,
    },

    /// The `Esdb` (or its poller) was dropped while a caller was still
    /// awaiting a waiter.
    #[error("the event pipeline shut down before this event was handled")]
    ShutDown,
}
