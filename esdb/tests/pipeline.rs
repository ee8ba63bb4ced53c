#![allow(missing_docs)]
//! End-to-end tests of the event pipeline: dispatch through preprocess,
//! reduce, and apply.

use std::sync::Arc;

use async_trait::async_trait;
use esdb::db::{Config, Connection, TxConn};
use esdb::event::{Change, Event, ReducerOutcome};
use esdb::model::Model;
use esdb::queue::sqlite::SqliteEventQueue;
use esdb::{Esdb, EsdbConfig};
use serde_json::json;

struct Counter;

#[async_trait]
impl Model for Counter {
    fn name(&self) -> &str {
        "counter"
    }

    async fn migrate(&self, tx: &mut TxConn<'_>) -> esdb::error::Result<()> {
        tx.exec("CREATE TABLE IF NOT EXISTS counter (id INTEGER PRIMARY KEY, n INTEGER)")
            .await
    }

    fn reduce(&self, event: &Event) -> ReducerOutcome {
        if event.event_type == "inc" {
            ReducerOutcome::Changed(Change {
                ins: vec![json!({"id": event.v, "n": 1})],
                ..Change::default()
            })
        } else {
            ReducerOutcome::NoChange
        }
    }

    async fn apply_changes(&self, tx: &mut TxConn<'_>, change: Change) -> esdb::error::Result<()> {
        for row in change.ins {
            let id = row["id"].as_u64().unwrap();
            let n = row["n"].as_i64().unwrap();
            tx.run(esdb::sql::sql(
                "INSERT INTO counter (id, n) VALUES (?, ?)",
                vec![json!(id), json!(n)],
            ))
            .await?;
        }
        Ok(())
    }
}

/// A model whose preprocessor always rejects, used to exercise S6.
struct Gatekeeper;

#[async_trait]
impl Model for Gatekeeper {
    fn name(&self) -> &str {
        "gatekeeper"
    }

    async fn preprocess(&self, event: &Event) -> esdb::error::Result<Option<Event>> {
        if event.event_type == "forbidden" {
            Err(esdb::Error::Callback("bad".to_string()))
        } else {
            Ok(None)
        }
    }
}

async fn esdb_with(models: Vec<Arc<dyn Model>>) -> (Arc<Esdb>, Arc<Connection>) {
    let conn = Arc::new(Connection::new(Config::in_memory()));
    let queue = Arc::new(SqliteEventQueue::new(Arc::clone(&conn)));
    queue.migrate().await.unwrap();

    let esdb = Esdb::new(EsdbConfig {
        db: Arc::clone(&conn),
        queue,
        models,
    })
    .await
    .unwrap();
    (esdb, conn)
}

/// S5: three dispatched `inc` events land three rows in `counter` and
/// advance `metadata.v` to 3.
#[test_log::test(tokio::test)]
async fn happy_path_applies_every_event_and_advances_metadata() {
    let (esdb, conn) = esdb_with(vec![Arc::new(Counter)]).await;

    for _ in 0..3 {
        esdb.dispatch("inc", json!({}), None).await.unwrap();
    }

    let rows = conn
        .all(esdb::sql::sql("SELECT * FROM counter", vec![]))
        .await
        .unwrap();
    assert_eq!(rows.len(), 3);

    let version_row = conn
        .get(esdb::sql::sql(
            "SELECT v FROM metadata WHERE id = 'version'",
            vec![],
        ))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(version_row["v"], json!(3));
}

/// S6: a preprocessor rejection fails the caller's promise, but `metadata`
/// still advances and the queue row carries the error under the
/// preprocessor's model name.
#[test_log::test(tokio::test)]
async fn preprocessor_error_still_advances_metadata() {
    let (esdb, conn) = esdb_with(vec![Arc::new(Gatekeeper)]).await;

    let err = esdb.dispatch("forbidden", json!({}), None).await.unwrap_err();
    assert!(matches!(err, esdb::Error::EventFailed { v: 1, .. }));

    let version_row = conn
        .get(esdb::sql::sql(
            "SELECT v FROM metadata WHERE id = 'version'",
            vec![],
        ))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(version_row["v"], json!(1));
}

/// `handled_version` resolves immediately for a version already applied,
/// without re-running the pipeline.
#[test_log::test(tokio::test)]
async fn handled_version_resolves_immediately_for_past_versions() {
    let (esdb, _conn) = esdb_with(vec![Arc::new(Counter)]).await;
    let dispatched = esdb.dispatch("inc", json!({}), None).await.unwrap();

    let replayed = esdb.handled_version(dispatched.v).await.unwrap();
    assert_eq!(replayed.v, dispatched.v);
}

/// Waiter liveness (invariant 6): a `handled_version` call registered ahead
/// of the event it names still resolves once that event is dispatched.
#[test_log::test(tokio::test)]
async fn handled_version_resolves_once_a_future_event_arrives() {
    let (esdb, _conn) = esdb_with(vec![Arc::new(Counter)]).await;

    let waiter = {
        let esdb = Arc::clone(&esdb);
        tokio::spawn(async move { esdb.handled_version(1).await })
    };

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    esdb.dispatch("inc", json!({}), None).await.unwrap();

    let event = waiter.await.unwrap().unwrap();
    assert_eq!(event.v, 1);
}
