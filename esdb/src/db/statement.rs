//! A prepared statement bound to a [`Connection`], for callers that run the
//! same SQL text repeatedly.
//!
//! `sqlx`'s SQLite driver does not expose a long-lived handle to a compiled
//! statement independent of a connection borrow, so this type is a thin
//! convenience wrapper that remembers the SQL text and forwards to the
//! owning [`Connection`]. It keeps prepare-then-reuse call sites readable
//! and is the natural place to add real statement caching if `sqlx` grows
//! the capability.

use std::sync::Arc;

use crate::db::connection::{Connection, Row, RunResult};
use crate::error::Result;
use crate::sql::SqlFragment;

/// A SQL statement prepared against a [`Connection`], reusable across
/// calls.
pub struct PreparedStatement {
    conn: Arc<Connection>,
    sql: String,
}

impl PreparedStatement {
    pub(crate) fn new(conn: Arc<Connection>, sql: String) -> Self {
        Self { conn, sql }
    }

    fn fragment(&self, binds: Vec<serde_json::Value>) -> SqlFragment {
        (self.sql.clone(), binds)
    }

    /// Runs the statement with `binds`, returning the affected row count
    /// and last insert id.
    ///
    /// # Errors
    /// Returns [`crate::error::Error::Sql`] on failure.
    pub async fn run(&self, binds: Vec<serde_json::Value>) -> Result<RunResult> {
        self.conn.run(self.fragment(binds)).await
    }

    /// Returns the first row matching `binds`, or `None`. Resets the
    /// statement after every call, so a `get` never leaves a cursor
    /// positioned mid-result for the next call.
    ///
    /// # Errors
    /// Returns [`crate::error::Error::Sql`] on failure.
    pub async fn get(&self, binds: Vec<serde_json::Value>) -> Result<Option<Row>> {
        self.conn.get(self.fragment(binds)).await
    }

    /// Returns every row matching `binds`.
    ///
    /// # Errors
    /// Returns [`crate::error::Error::Sql`] on failure.
    pub async fn all(&self, binds: Vec<serde_json::Value>) -> Result<Vec<Row>> {
        self.conn.all(self.fragment(binds)).await
    }

    /// Streams rows matching `binds` to `on_row`, resolving with the number
    /// of rows seen.
    ///
    /// # Errors
    /// Returns [`crate::error::Error::Sql`] on a driver failure, or
    /// [`crate::error::Error::Callback`] if `on_row` fails.
    pub async fn each<F>(&self, binds: Vec<serde_json::Value>, on_row: F) -> Result<usize>
    where
        F: FnMut(Row) -> Result<()> + Send,
    {
        self.conn.each(self.fragment(binds), on_row).await
    }

    /// Finalizes the statement. A no-op here since no resources are held
    /// independent of the owning connection; present so prepare/finalize
    /// call sites read naturally and stay future-proof against real
    /// statement caching.
    pub fn finalize(self) {}
}
