//! The async connection wrapper around `sqlx`'s SQLite driver.
//!
//! This is a thin, single-writer wrapper: all operations funnel through one
//! `sqlx::sqlite::SqliteConnection` guarded by a `tokio::sync::Mutex`, so
//! exactly one SQL operation is ever in flight. A second, outer mutex
//! (`write_lock`) serializes whole transaction bodies against each other
//! without forcing every individual statement to contend for it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{Column, Connection as _, Row as _, TypeInfo};
use tokio::sync::{broadcast, Mutex, MutexGuard};
use tracing::instrument;

use crate::error::{Error, Result};
use crate::sql::SqlFragment;

/// One row returned from a `get`/`all`/`each` call, as an ordered map from
/// column name to a loosely-typed JSON value — the same "plain object"
/// shape the source's rows have.
pub type Row = IndexMap<String, serde_json::Value>;

/// The result of a `run` call: `lastID`/`changes` in the source's
/// terminology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunResult {
    /// The ROWID of the last inserted row, if any.
    pub last_id: i64,
    /// The number of rows the statement affected.
    pub changes: u64,
}

/// Events emitted around a `with_transaction` call, in the order
/// `Begin` → (body) → (`End` | `Rollback`) → `Finally`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxEvent {
    /// `BEGIN IMMEDIATE` has just been issued.
    Begin,
    /// The body succeeded and `COMMIT` has just completed.
    End,
    /// The body failed (or `COMMIT` itself failed) and `ROLLBACK` has just
    /// completed.
    Rollback,
    /// Fires exactly once per `with_transaction` call, after `End` or
    /// `Rollback`.
    Finally,
}

/// Callback invoked exactly once, immediately before the first physical
/// open of the underlying connection.
pub type OnWillOpen = Arc<dyn Fn() + Send + Sync>;

/// Configuration for a [`Connection`].
#[derive(Clone, Default)]
pub struct Config {
    /// Path to the database file. `None` opens an in-memory database (a
    /// fresh one on every reopen, since SQLite in-memory databases are not
    /// durable across connections).
    pub file: Option<PathBuf>,
    /// Opens the connection read-only when set.
    pub read_only: bool,
    /// Invoked right before every physical open (once per `open()`/reopen
    /// after a `close()`, not just the first).
    pub on_will_open: Option<OnWillOpen>,
    /// When set, `PRAGMA auto_vacuum = INCREMENTAL` is applied at open and a
    /// periodic incremental-vacuum task is scheduled.
    pub auto_vacuum: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("file", &self.file)
            .field("read_only", &self.read_only)
            .field("on_will_open", &self.on_will_open.is_some())
            .field("auto_vacuum", &self.auto_vacuum)
            .finish()
    }
}

impl Config {
    /// Starts building a [`Config`] for a file-backed database at `path`.
    #[must_use]
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            file: Some(path.into()),
            ..Self::default()
        }
    }

    /// Starts building a [`Config`] for an in-memory database.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Sets `read_only`.
    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Sets `auto_vacuum`.
    #[must_use]
    pub fn auto_vacuum(mut self, auto_vacuum: bool) -> Self {
        self.auto_vacuum = auto_vacuum;
        self
    }

    /// Sets the `on_will_open` callback.
    #[must_use]
    pub fn on_will_open(mut self, cb: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_will_open = Some(Arc::new(cb));
        self
    }

    fn identity(&self) -> String {
        match &self.file {
            Some(path) => path.display().to_string(),
            None => ":memory:".to_string(),
        }
    }
}

/// An async, single-writer handle to a SQLite database.
pub struct Connection {
    config: Config,
    conn: Arc<Mutex<Option<SqliteConnection>>>,
    write_lock: Mutex<()>,
    tx_events: broadcast::Sender<TxEvent>,
    vacuum_handle: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Connection {
    /// Creates a connection handle. The physical open is deferred until the
    /// first operation (or an explicit call to [`Connection::open`]).
    #[must_use]
    pub fn new(config: Config) -> Self {
        let (tx_events, _) = broadcast::channel(32);
        Self {
            config,
            conn: Arc::new(Mutex::new(None)),
            write_lock: Mutex::new(()),
            tx_events,
            vacuum_handle: std::sync::Mutex::new(None),
        }
    }

    /// The database identity used in error messages: the file path, or
    /// `:memory:`.
    #[must_use]
    pub fn identity(&self) -> String {
        self.config.identity()
    }

    /// Subscribes to this connection's transaction lifecycle events.
    #[must_use]
    pub fn subscribe_tx_events(&self) -> broadcast::Receiver<TxEvent> {
        self.tx_events.subscribe()
    }

    /// Returns a handle to the auto-vacuum scheduling task, if one is
    /// running. Exists so tests can observe that vacuum scheduling is
    /// active without depending on its timing.
    #[must_use]
    pub fn vacuum_handle(&self) -> Option<()> {
        self.vacuum_handle.lock().unwrap().as_ref().map(|_| ())
    }

    /// Opens the underlying connection if it is not already open.
    ///
    /// # Errors
    /// Returns [`Error::Sql`] if the physical open fails.
    #[instrument(skip(self), fields(db = %self.identity()))]
    pub async fn open(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        self.ensure_open(&mut guard).await?;
        Ok(())
    }

    /// Finalizes cached prepared statements, cancels vacuum scheduling, and
    /// releases the underlying handle. A subsequent operation reopens the
    /// connection (a fresh, empty database, for the in-memory case).
    #[instrument(skip(self), fields(db = %self.identity()))]
    pub async fn close(&self) -> Result<()> {
        if let Some(handle) = self.vacuum_handle.lock().unwrap().take() {
            handle.abort();
        }
        let mut guard = self.conn.lock().await;
        *guard = None;
        Ok(())
    }

    async fn ensure_open<'a>(
        &self,
        guard: &'a mut Option<SqliteConnection>,
    ) -> Result<&'a mut SqliteConnection> {
        if guard.is_none() {
            if let Some(cb) = &self.config.on_will_open {
                cb();
            }
            let mut options = match &self.config.file {
                Some(path) => SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(!self.config.read_only),
                None => SqliteConnectOptions::new().in_memory(true),
            };
            options = options.read_only(self.config.read_only);

            let mut conn = <SqliteConnection as sqlx::Connection>::connect_with(&options)
                .await
                .map_err(|source| self.sql_error(source, "<connect>"))?;

            if self.config.auto_vacuum {
                // INCREMENTAL, not FULL: FULL truncates the free list on every
                // commit and leaves nothing for a scheduled `incremental_vacuum`
                // to do, which would make `schedule_vacuum` a no-op in practice.
                let _ = sqlx::query("PRAGMA auto_vacuum = INCREMENTAL")
                    .execute(&mut conn)
                    .await
                    .map_err(|source| self.sql_error(source, "PRAGMA auto_vacuum = INCREMENTAL"))?;
                self.schedule_vacuum();
            }

            *guard = Some(conn);
        }
        Ok(guard.as_mut().expect("just opened"))
    }

    fn schedule_vacuum(&self) {
        // A periodic incremental vacuum; the handle is kept so `close` can
        // cancel it and tests can observe it exists. Holds its own clone of
        // the connection mutex rather than `self`, since the task outlives
        // any single borrow of this `Connection`.
        let conn = Arc::clone(&self.conn);
        let identity = self.identity();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(300));
            loop {
                ticker.tick().await;
                let mut guard = conn.lock().await;
                if let Some(c) = guard.as_mut() {
                    if let Err(source) = sqlx::raw_sql("PRAGMA incremental_vacuum").execute(&mut *c).await {
                        tracing::warn!(db = %identity, error = %source, "incremental vacuum failed");
                    }
                }
            }
        });
        *self.vacuum_handle.lock().unwrap() = Some(handle);
    }

    fn sql_error(&self, source: sqlx::Error, sql: impl Into<String>) -> Error {
        Error::Sql {
            db: self.identity(),
            sql: sql.into(),
            source,
        }
    }

    /// Executes a multi-statement script with no rows returned.
    ///
    /// # Errors
    /// Returns [`Error::Sql`] on failure.
    #[instrument(skip(self, sql), fields(db = %self.identity()))]
    pub async fn exec(&self, sql: impl Into<String>) -> Result<()> {
        let sql = sql.into();
        let mut guard = self.conn.lock().await;
        let conn = self.ensure_open(&mut guard).await?;
        sqlx::raw_sql(&sql)
            .execute(&mut *conn)
            .await
            .map_err(|source| self.sql_error(source, sql))?;
        Ok(())
    }

    /// Executes a single parameterized statement, returning the affected
    /// row count and last insert id.
    ///
    /// # Errors
    /// Returns [`Error::Sql`] on failure.
    #[instrument(skip(self, fragment), fields(db = %self.identity()))]
    pub async fn run(&self, fragment: impl Into<SqlFragment>) -> Result<RunResult> {
        let (sql, binds) = fragment.into();
        let mut guard = self.conn.lock().await;
        let conn = self.ensure_open(&mut guard).await?;
        run_statement(conn, &sql, &binds)
            .await
            .map_err(|source| self.sql_error(source, sql))
    }

    /// Returns the first row matching `fragment`, or `None`.
    ///
    /// # Errors
    /// Returns [`Error::Sql`] on failure.
    #[instrument(skip(self, fragment), fields(db = %self.identity()))]
    pub async fn get(&self, fragment: impl Into<SqlFragment>) -> Result<Option<Row>> {
        let (sql, binds) = fragment.into();
        let mut guard = self.conn.lock().await;
        let conn = self.ensure_open(&mut guard).await?;
        get_row(conn, &sql, &binds)
            .await
            .map_err(|source| self.sql_error(source, sql))
    }

    /// Returns every row matching `fragment`.
    ///
    /// # Errors
    /// Returns [`Error::Sql`] on failure.
    #[instrument(skip(self, fragment), fields(db = %self.identity()))]
    pub async fn all(&self, fragment: impl Into<SqlFragment>) -> Result<Vec<Row>> {
        let (sql, binds) = fragment.into();
        let mut guard = self.conn.lock().await;
        let conn = self.ensure_open(&mut guard).await?;
        all_rows(conn, &sql, &binds)
            .await
            .map_err(|source| self.sql_error(source, sql))
    }

    /// Streams rows matching `fragment` to `on_row`, resolving with the
    /// number of rows seen.
    ///
    /// # Errors
    /// Returns [`Error::Sql`] on a driver failure, or
    /// [`Error::Callback`] if `on_row` fails.
    #[instrument(skip(self, fragment, on_row), fields(db = %self.identity()))]
    pub async fn each<F>(&self, fragment: impl Into<SqlFragment>, mut on_row: F) -> Result<usize>
    where
        F: FnMut(Row) -> Result<()> + Send,
    {
        let (sql, binds) = fragment.into();
        let mut guard = self.conn.lock().await;
        let conn = self.ensure_open(&mut guard).await?;
        let rows = all_rows(conn, &sql, &binds)
            .await
            .map_err(|source| self.sql_error(source, sql))?;
        let count = rows.len();
        for row in rows {
            on_row(row)?;
        }
        Ok(count)
    }

    /// Prepares `sql` for repeated execution. See
    /// [`crate::db::statement::PreparedStatement`].
    #[must_use]
    pub fn prepare(self: &Arc<Self>, sql: impl Into<String>) -> crate::db::statement::PreparedStatement {
        crate::db::statement::PreparedStatement::new(Arc::clone(self), sql.into())
    }

    /// Returns `PRAGMA data_version`: per-connection, and incremented when
    /// *another* connection commits a write to the same file. Used for
    /// cross-process change detection.
    ///
    /// # Errors
    /// Returns [`Error::Sql`] on failure.
    pub async fn data_version(&self) -> Result<i64> {
        let mut guard = self.conn.lock().await;
        let conn = self.ensure_open(&mut guard).await?;
        let (v,): (i64,) = sqlx::query_as("PRAGMA data_version")
            .fetch_one(&mut *conn)
            .await
            .map_err(|source| self.sql_error(source, "PRAGMA data_version"))?;
        Ok(v)
    }

    /// Reads `PRAGMA user_version`.
    ///
    /// # Errors
    /// Returns [`Error::Sql`] on failure.
    pub async fn user_version(&self) -> Result<i64> {
        let mut guard = self.conn.lock().await;
        let conn = self.ensure_open(&mut guard).await?;
        let (v,): (i64,) = sqlx::query_as("PRAGMA user_version")
            .fetch_one(&mut *conn)
            .await
            .map_err(|source| self.sql_error(source, "PRAGMA user_version"))?;
        Ok(v)
    }

    /// Sets `PRAGMA user_version`.
    ///
    /// # Errors
    /// Returns [`Error::Sql`] on failure.
    pub async fn set_user_version(&self, v: i64) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let conn = self.ensure_open(&mut guard).await?;
        sqlx::raw_sql(&format!("PRAGMA user_version = {v}"))
            .execute(&mut *conn)
            .await
            .map_err(|source| self.sql_error(source, "PRAGMA user_version = ?"))?;
        Ok(())
    }

    /// Runs `body` inside `BEGIN IMMEDIATE` / `COMMIT` (or `ROLLBACK` on
    /// failure), emitting `Begin`, then `End` or `Rollback`, then always
    /// `Finally`, in that order.
    ///
    /// Only one `with_transaction` call runs at a time on this connection;
    /// a second call queues behind the `write_lock` until the first fully
    /// commits or rolls back. Within `body`, use the supplied [`TxConn`] to
    /// run further statements against the same open transaction — calling
    /// back into [`Connection`]'s own `exec`/`run`/`get`/`all` from inside
    /// `body` would deadlock against the lock this call already holds.
    ///
    /// `body` returns a boxed future (`Box::pin(async move { .. })`) rather
    /// than a plain `async fn`/closure, since it borrows the [`TxConn`] it's
    /// handed across an await and that borrow's lifetime is only known
    /// inside this method, not nameable in `body`'s own type signature.
    ///
    /// # Errors
    /// Propagates whatever error `body` returns, after rolling back.
    #[instrument(skip(self, body), fields(db = %self.identity()))]
    pub async fn with_transaction<F, T>(&self, body: F) -> Result<T>
    where
        F: for<'a> FnOnce(TxConn<'a>) -> futures::future::BoxFuture<'a, Result<T>>,
    {
        let _write_guard = self.write_lock.lock().await;
        let mut guard: MutexGuard<'_, Option<SqliteConnection>> = self.conn.lock().await;
        let conn = self.ensure_open(&mut guard).await?;

        let _ = self.tx_events.send(TxEvent::Begin);
        sqlx::raw_sql("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .map_err(|source| self.sql_error(source, "BEGIN IMMEDIATE"))?;

        let outcome = body(TxConn {
            conn: &mut *conn,
            identity: self.identity(),
        })
        .await;

        let finish = match &outcome {
            Ok(_) => sqlx::raw_sql("COMMIT").execute(&mut *conn).await,
            Err(_) => sqlx::raw_sql("ROLLBACK").execute(&mut *conn).await,
        };

        match (&outcome, finish) {
            (Ok(_), Ok(_)) => {
                let _ = self.tx_events.send(TxEvent::End);
                let _ = self.tx_events.send(TxEvent::Finally);
                outcome
            }
            (Ok(_), Err(commit_err)) => {
                let _ = self.tx_events.send(TxEvent::Rollback);
                let _ = self.tx_events.send(TxEvent::Finally);
                Err(self.sql_error(commit_err, "COMMIT"))
            }
            (Err(_), _) => {
                let _ = self.tx_events.send(TxEvent::Rollback);
                let _ = self.tx_events.send(TxEvent::Finally);
                outcome
            }
        }
    }
}

/// A handle to statements inside an open transaction, handed to the
/// closure passed to [`Connection::with_transaction`].
pub struct TxConn<'a> {
    conn: &'a mut SqliteConnection,
    identity: String,
}

impl<'a> TxConn<'a> {
    fn sql_error(&self, source: sqlx::Error, sql: impl Into<String>) -> Error {
        Error::Sql {
            db: self.identity.clone(),
            sql: sql.into(),
            source,
        }
    }

    /// See [`Connection::exec`].
    pub async fn exec(&mut self, sql: impl Into<String>) -> Result<()> {
        let sql = sql.into();
        sqlx::raw_sql(&sql)
            .execute(&mut *self.conn)
            .await
            .map_err(|source| self.sql_error(source, sql))?;
        Ok(())
    }

    /// See [`Connection::run`].
    pub async fn run(&mut self, fragment: impl Into<SqlFragment>) -> Result<RunResult> {
        let (sql, binds) = fragment.into();
        run_statement(self.conn, &sql, &binds)
            .await
            .map_err(|source| self.sql_error(source, sql))
    }

    /// See [`Connection::get`].
    pub async fn get(&mut self, fragment: impl Into<SqlFragment>) -> Result<Option<Row>> {
        let (sql, binds) = fragment.into();
        get_row(self.conn, &sql, &binds)
            .await
            .map_err(|source| self.sql_error(source, sql))
    }

    /// See [`Connection::all`].
    pub async fn all(&mut self, fragment: impl Into<SqlFragment>) -> Result<Vec<Row>> {
        let (sql, binds) = fragment.into();
        all_rows(self.conn, &sql, &binds)
            .await
            .map_err(|source| self.sql_error(source, sql))
    }
}

fn bind_values<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    binds: &'q [serde_json::Value],
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    for value in binds {
        query = match value {
            serde_json::Value::Null => query.bind(None::<String>),
            serde_json::Value::Bool(b) => query.bind(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    query.bind(i)
                } else if let Some(f) = n.as_f64() {
                    query.bind(f)
                } else {
                    query.bind(n.to_string())
                }
            }
            serde_json::Value::String(s) => query.bind(s.clone()),
            other => query.bind(other.to_string()),
        };
    }
    query
}

async fn run_statement(
    conn: &mut SqliteConnection,
    sql: &str,
    binds: &[serde_json::Value],
) -> std::result::Result<RunResult, sqlx::Error> {
    let query = bind_values(sqlx::query(sql), binds);
    let result = query.execute(conn).await?;
    Ok(RunResult {
        last_id: result.last_insert_rowid(),
        changes: result.rows_affected(),
    })
}

async fn get_row(
    conn: &mut SqliteConnection,
    sql: &str,
    binds: &[serde_json::Value],
) -> std::result::Result<Option<Row>, sqlx::Error> {
    let query = bind_values(sqlx::query(sql), binds);
    let row = query.fetch_optional(conn).await?;
    Ok(row.map(|r| row_to_map(&r)))
}

async fn all_rows(
    conn: &mut SqliteConnection,
    sql: &str,
    binds: &[serde_json::Value],
) -> std::result::Result<Vec<Row>, sqlx::Error> {
    let query = bind_values(sqlx::query(sql), binds);
    let rows = query.fetch_all(conn).await?;
    Ok(rows.iter().map(row_to_map).collect())
}

fn row_to_map(row: &sqlx::sqlite::SqliteRow) -> Row {
    let mut map = IndexMap::with_capacity(row.len());
    for (idx, col) in row.columns().iter().enumerate() {
        let value = column_to_json(row, idx, col.type_info().name());
        map.insert(col.name().to_string(), value);
    }
    map
}

fn column_to_json(row: &sqlx::sqlite::SqliteRow, idx: usize, type_name: &str) -> serde_json::Value {
    match type_name {
        "TEXT" => row
            .try_get::<Option<String>, _>(idx)
            .ok()
            .flatten()
            .map(serde_json::Value::String)
            .unwrap_or(serde_json::Value::Null),
        "INTEGER" | "BOOLEAN" => row
            .try_get::<Option<i64>, _>(idx)
            .ok()
            .flatten()
            .map(|v| serde_json::Value::Number(v.into()))
            .unwrap_or(serde_json::Value::Null),
        "REAL" | "NUMERIC" => row
            .try_get::<Option<f64>, _>(idx)
            .ok()
            .flatten()
            .and_then(serde_json::Number::from_f64)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        "BLOB" => row
            .try_get::<Option<Vec<u8>>, _>(idx)
            .ok()
            .flatten()
            .map(|bytes| serde_json::Value::Array(bytes.into_iter().map(|b| b.into()).collect()))
            .unwrap_or(serde_json::Value::Null),
        _ => row
            .try_get::<Option<String>, _>(idx)
            .ok()
            .flatten()
            .map(serde_json::Value::String)
            .unwrap_or(serde_json::Value::Null),
    }
}
