//! The event queue contract and its bundled implementations.
//!
//! The core pipeline (`esdb::core`) is written against the [`EventQueue`]
//! trait alone; a queue may be backed by the same SQLite file the derived
//! tables live in ([`sqlite::SqliteEventQueue`], the common case) or by
//! an in-process store ([`in_memory::InMemoryEventQueue`], useful for
//! tests that don't need durability or cross-process visibility).

pub mod in_memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::Result;
use crate::event::Event;

/// An append-only, versioned store of events.
#[async_trait]
pub trait EventQueue: Send + Sync {
    /// Appends a new event with the next version, persists it, and wakes
    /// any waiters blocked in [`EventQueue::get_next`].
    ///
    /// # Errors
    /// Returns [`crate::error::Error::Sql`] on failure.
    async fn add(&self, event_type: String, data: serde_json::Value, ts: i64) -> Result<Event>;

    /// Fetches the event at version `v`, or `None` if it doesn't exist.
    ///
    /// # Errors
    /// Returns [`crate::error::Error::Sql`] on failure.
    async fn get(&self, v: u64) -> Result<Option<Event>>;

    /// Returns the event at version `after_v + 1`.
    ///
    /// When `once` is `true`, returns `None` immediately if that event
    /// isn't present yet. When `once` is `false`, waits until it is.
    ///
    /// # Errors
    /// Returns [`crate::error::Error::Sql`] on failure.
    async fn get_next(&self, after_v: u64, once: bool) -> Result<Option<Event>>;

    /// Durably records `event`'s `result`/`error`/`event_type` fields onto
    /// its existing row. The event must already exist (via `add`).
    ///
    /// # Errors
    /// Returns [`crate::error::Error::Sql`] on failure.
    async fn set(&self, event: Event) -> Result<()>;

    /// Returns the highest version currently stored, or 0 if empty.
    ///
    /// # Errors
    /// Returns [`crate::error::Error::Sql`] on failure.
    async fn latest_version(&self) -> Result<u64>;
}
