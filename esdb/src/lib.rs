//! # Event-sourced database
//!
//! `esdb` ingests an ordered stream of events and runs each one through a
//! pipeline of user-registered models: a model's *preprocessor* may rewrite
//! the event, its *reducer* turns the event into a change description for
//! the model's own table, and its *deriver* runs afterward for
//! side-effecting projections. All of it sits atop a single SQLite
//! connection ([`db::Connection`]), with one reserved `metadata` model
//! tracking the highest applied version.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use esdb::db::{Config, Connection, TxConn};
//! use esdb::event::{Change, Event, ReducerOutcome};
//! use esdb::model::Model;
//! use esdb::queue::sqlite::SqliteEventQueue;
//! use esdb::{Esdb, EsdbConfig};
//!
//! struct Counter;
//!
//! #[async_trait]
//! impl Model for Counter {
//!     fn name(&self) -> &str {
//!         "counter"
//!     }
//!
//!     async fn migrate(&self, tx: &mut TxConn<'_>) -> esdb::error::Result<()> {
//!         tx.exec("CREATE TABLE IF NOT EXISTS counter (id INTEGER PRIMARY KEY, n INTEGER)")
//!             .await
//!     }
//!
//!     fn reduce(&self, event: &Event) -> ReducerOutcome {
//!         if event.event_type == "inc" {
//!             ReducerOutcome::Changed(Change {
//!                 ins: vec![serde_json::json!({"id": event.v, "n": 1})],
//!                 ..Change::default()
//!             })
//!         } else {
//!             ReducerOutcome::NoChange
//!         }
//!     }
//! }
//!
//! # async fn run() -> esdb::error::Result<()> {
//! let conn = Arc::new(Connection::new(Config::in_memory()));
//! let queue = Arc::new(SqliteEventQueue::new(Arc::clone(&conn)));
//! queue.migrate().await?;
//!
//! let esdb = Esdb::new(EsdbConfig {
//!     db: conn,
//!     queue,
//!     models: vec![Arc::new(Counter)],
//! })
//! .await?;
//!
//! esdb.dispatch("inc", serde_json::json!({}), None).await?;
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod db;
pub mod error;
pub mod event;
pub mod model;
pub mod queue;
pub mod reducer;
pub mod sql;
mod waiter;

pub use crate::core::{Esdb, EsdbConfig, EsdbEvent};
pub use crate::error::{Error, Result};
pub use crate::event::{Change, Event, ReducerOutcome};
