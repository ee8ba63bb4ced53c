//! The async connection wrapper around the embedded SQL engine, and its
//! prepared-statement and transaction-event companions.

pub mod connection;
pub mod statement;

pub use connection::{Config, Connection, Row, RunResult, TxConn, TxEvent};
pub use statement::PreparedStatement;
