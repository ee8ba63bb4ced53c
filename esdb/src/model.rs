//! The model contract: the hooks a registered projection implements, and
//! the reserved `metadata` model that tracks the applied version.

use async_trait::async_trait;
use serde_json::json;

use crate::db::TxConn;
use crate::error::{Error, Result};
use crate::event::{Change, Event, ReducerOutcome};

/// The reserved name of the built-in version-tracking model. Registering a
/// user model under this name is rejected with [`Error::ReservedModelName`].
pub const METADATA_MODEL: &str = "metadata";

/// A projection registered with an [`crate::core::Esdb`].
///
/// Every hook has a no-op default so a model only needs to implement the
/// ones it actually uses. `migrate` and `apply_changes` run against the
/// open write transaction via the supplied [`TxConn`]; `reduce` and
/// `preprocess` are evaluated outside any particular transaction's mutable
/// borrow (they read from `event` alone, or from whatever read-only state
/// the model captured at registration time) so the reducer composer can
/// iterate every registered model without juggling multiple live borrows
/// of one transaction handle.
#[async_trait]
pub trait Model: Send + Sync {
    /// The name this model is registered under; also its table name.
    fn name(&self) -> &str;

    /// Runs this model's schema migrations. Called once at registration,
    /// inside the same transaction as every other model's migration.
    ///
    /// # Errors
    /// Returns [`Error::Sql`] on failure.
    async fn migrate(&self, _tx: &mut TxConn<'_>) -> Result<()> {
        Ok(())
    }

    /// Rewrites `event` before reducers see it. Returning `Ok(None)` leaves
    /// the event untouched. An implementation MUST preserve `event.v` and
    /// MUST NOT clear `event.event_type`; violating either is reported to
    /// the caller as a preprocessor-misuse error rather than applied.
    ///
    /// # Errors
    /// An `Err` return is attached to the event under this model's name
    /// and short-circuits the reducer phase for this event (metadata still
    /// advances).
    async fn preprocess(&self, _event: &Event) -> Result<Option<Event>> {
        Ok(None)
    }

    /// Computes this model's change description for `event`. Pure: no
    /// database access. Returning [`ReducerOutcome::NoChange`] drops this
    /// model from the event's result map entirely.
    fn reduce(&self, _event: &Event) -> ReducerOutcome {
        ReducerOutcome::NoChange
    }

    /// Applies a change description to this model's table, inside the
    /// write transaction for the event that produced it.
    ///
    /// # Errors
    /// Returns [`Error::Sql`] on failure.
    async fn apply_changes(&self, _tx: &mut TxConn<'_>, _change: Change) -> Result<()> {
        Ok(())
    }

    /// Runs after this event's changes have committed. Derivers may mutate
    /// any table directly; they run outside the write transaction that
    /// applied the event (see the design note on keeping the reducer/
    /// deriver split).
    ///
    /// # Errors
    /// Returns [`Error::Sql`] on failure.
    async fn derive(
        &self,
        _conn: &crate::db::Connection,
        _event: &Event,
        _result: &std::collections::HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        Ok(())
    }
}

/// The built-in `metadata` model: tracks the highest applied version as a
/// single row `{id: "version", v}`.
pub struct MetadataModel;

impl MetadataModel {
    /// Reads the currently applied version, or 0 if no event has been
    /// applied yet.
    ///
    /// # Errors
    /// Returns [`Error::Sql`] on failure.
    pub async fn current_version(tx: &mut TxConn<'_>) -> Result<u64> {
        let row = tx
            .get(crate::sql::sql(
                "SELECT v FROM metadata WHERE id = 'version'",
                vec![],
            ))
            .await?;
        Ok(row
            .and_then(|r| r.get("v").cloned())
            .and_then(|v| v.as_u64())
            .unwrap_or(0))
    }

    /// Computes the version-row change for `event` given the currently
    /// applied version: a `set` iff `event.v > current_v`, else an error
    /// noting the event is stale.
    #[must_use]
    pub fn reduce(event: &Event, current_v: u64) -> ReducerOutcome {
        if event.v > current_v {
            ReducerOutcome::Changed(Change {
                set: vec![json!({"id": "version", "v": event.v})],
                ..Change::default()
            })
        } else {
            ReducerOutcome::Errored(json!(format!(
                "Current version {current_v} is >= event version {}",
                event.v
            )))
        }
    }
}

#[async_trait]
impl Model for MetadataModel {
    fn name(&self) -> &str {
        METADATA_MODEL
    }

    async fn migrate(&self, tx: &mut TxConn<'_>) -> Result<()> {
        tx.exec(
            "CREATE TABLE IF NOT EXISTS metadata (id TEXT PRIMARY KEY, v INTEGER)",
        )
        .await
    }

    async fn apply_changes(&self, tx: &mut TxConn<'_>, change: Change) -> Result<()> {
        for row in change.set {
            let v = row
                .get("v")
                .and_then(serde_json::Value::as_u64)
                .ok_or_else(|| Error::Callback("metadata change missing v".to_string()))?;
            tx.run(crate::sql::sql(
                "INSERT INTO metadata (id, v) VALUES ('version', ?) \
                 ON CONFLICT(id) DO UPDATE SET v = excluded.v",
                vec![json!(v)],
            ))
            .await?;
        }
        Ok(())
    }
}

/// Rejects `metadata` as a user-supplied model name.
///
/// # Errors
/// Returns [`Error::ReservedModelName`] if `name` is `"metadata"`.
pub fn reject_reserved_name(name: &str) -> Result<()> {
    if name == METADATA_MODEL {
        Err(Error::ReservedModelName)
    } else {
        Ok(())
    }
}
