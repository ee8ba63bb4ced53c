#![allow(missing_docs)]
//! Integration tests for the SQL connection wrapper's transaction and
//! cross-connection semantics.

use std::sync::Arc;

use esdb::db::{Config, Connection, TxEvent};
use esdb::sql::sql;
use serde_json::json;

/// S3: a failing transaction body rolls back every write it made, rejects
/// with the body's own error, and emits exactly one `Rollback` and one
/// `Finally` (no `End`).
#[test_log::test(tokio::test)]
async fn failed_transaction_rolls_back_and_emits_rollback_then_finally() {
    let conn = Connection::new(Config::in_memory());
    let mut events = conn.subscribe_tx_events();

    conn.exec("CREATE TABLE foo (hi INTEGER PRIMARY KEY, ho INT)")
        .await
        .unwrap();

    let result = conn
        .with_transaction(|mut tx| {
            Box::pin(async move {
                tx.run(sql(
                    "INSERT INTO foo (hi, ho) VALUES (?, ?)",
                    vec![json!(43), json!(1)],
                ))
                .await?;
                Err(esdb::Error::Callback("ignoreme".to_string()))
            })
        })
        .await;

    assert!(matches!(result, Err(esdb::Error::Callback(ref m)) if m == "ignoreme"));

    let rows = conn.all(sql("SELECT * FROM foo", vec![])).await.unwrap();
    assert!(rows.is_empty());

    assert_eq!(events.recv().await.unwrap(), TxEvent::Begin);
    assert_eq!(events.recv().await.unwrap(), TxEvent::Rollback);
    assert_eq!(events.recv().await.unwrap(), TxEvent::Finally);
}

/// S5/invariant 4: a successful transaction's writes are visible afterward
/// and emit `Begin` → `End` → `Finally`, never `Rollback`.
#[test_log::test(tokio::test)]
async fn successful_transaction_commits_and_emits_begin_end_finally() {
    let conn = Connection::new(Config::in_memory());
    let mut events = conn.subscribe_tx_events();

    conn.exec("CREATE TABLE foo (hi INTEGER PRIMARY KEY, ho INT)")
        .await
        .unwrap();

    conn.with_transaction(|mut tx| {
        Box::pin(async move {
            tx.run(sql(
                "INSERT INTO foo (hi, ho) VALUES (?, ?)",
                vec![json!(1), json!(2)],
            ))
            .await?;
            Ok(())
        })
    })
    .await
    .unwrap();

    let rows = conn.all(sql("SELECT * FROM foo", vec![])).await.unwrap();
    assert_eq!(rows.len(), 1);

    assert_eq!(events.recv().await.unwrap(), TxEvent::Begin);
    assert_eq!(events.recv().await.unwrap(), TxEvent::End);
    assert_eq!(events.recv().await.unwrap(), TxEvent::Finally);
}

/// Nested `with_transaction` calls queue behind the write lock: the second
/// body does not start running until the first fully commits.
#[test_log::test(tokio::test)]
async fn concurrent_transactions_serialize_behind_the_write_lock() {
    let conn = Arc::new(Connection::new(Config::in_memory()));
    conn.exec("CREATE TABLE log (step INTEGER)").await.unwrap();

    let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for i in 0..5 {
        let conn = Arc::clone(&conn);
        let order = Arc::clone(&order);
        handles.push(tokio::spawn(async move {
            conn.with_transaction(move |mut tx| {
                let order = Arc::clone(&order);
                Box::pin(async move {
                    order.lock().await.push(format!("start-{i}"));
                    tx.run(sql("INSERT INTO log (step) VALUES (?)", vec![json!(i)]))
                        .await?;
                    order.lock().await.push(format!("end-{i}"));
                    Ok(())
                })
            })
            .await
            .unwrap();
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let rows = conn.all(sql("SELECT * FROM log", vec![])).await.unwrap();
    assert_eq!(rows.len(), 5);

    // Every start must be immediately followed by its own end: no two
    // bodies interleave.
    let order = order.lock().await;
    for pair in order.chunks(2) {
        let [start, end] = pair else { panic!("odd-length order") };
        let start_i = start.strip_prefix("start-").unwrap();
        let end_i = end.strip_prefix("end-").unwrap();
        assert_eq!(start_i, end_i);
    }
}

/// S4: `data_version` is stable across a connection's own reads, and across
/// its own writes made outside `PRAGMA data_version`'s own tracked table,
/// but increases once a different connection on the same file commits.
#[test_log::test(tokio::test)]
async fn data_version_increases_only_for_other_connections_writes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.sqlite3");

    let a = Connection::new(Config::file(path.clone()));
    a.exec("CREATE TABLE foo (id INTEGER PRIMARY KEY)").await.unwrap();

    let before = a.data_version().await.unwrap();
    let _ = a.get(sql("SELECT 1", vec![])).await.unwrap();
    let after_own_read = a.data_version().await.unwrap();
    assert_eq!(before, after_own_read);

    let b = Connection::new(Config::file(path.clone()));
    b.run(sql("INSERT INTO foo (id) VALUES (1)", vec![])).await.unwrap();

    let after_b_write = a.data_version().await.unwrap();
    assert!(after_b_write > after_own_read);
}

/// `close()` drops the cached handle; the next operation transparently
/// reopens. For an in-memory database this means a fresh, empty database.
#[test_log::test(tokio::test)]
async fn close_then_reopen_gives_a_fresh_in_memory_database() {
    let conn = Connection::new(Config::in_memory());
    conn.exec("CREATE TABLE foo (id INTEGER)").await.unwrap();
    conn.run(sql("INSERT INTO foo (id) VALUES (1)", vec![])).await.unwrap();
    assert_eq!(conn.all(sql("SELECT * FROM foo", vec![])).await.unwrap().len(), 1);

    conn.close().await.unwrap();

    // Table no longer exists in the fresh in-memory database.
    assert!(conn.exec("INSERT INTO foo (id) VALUES (1)").await.is_err());
}

/// `on_will_open` fires exactly once per physical open, not once per
/// logical operation.
#[test_log::test(tokio::test)]
async fn on_will_open_fires_once_per_physical_open() {
    let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let conn = Connection::new(
        Config::in_memory().on_will_open(move || {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }),
    );

    conn.exec("SELECT 1").await.unwrap();
    conn.exec("SELECT 1").await.unwrap();
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);

    conn.close().await.unwrap();
    conn.exec("SELECT 1").await.unwrap();
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
}
