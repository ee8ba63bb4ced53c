//! The event pipeline: construction, dispatch, the polling loop, and the
//! transactional apply phase.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::json;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::db::Connection;
use crate::error::{Error, Result};
use crate::event::{Event, ReducerOutcome};
use crate::model::{reject_reserved_name, Model, MetadataModel, METADATA_MODEL};
use crate::queue::EventQueue;
use crate::reducer::combine_reducers;
use crate::waiter::WaiterRegistry;

/// Everything needed to build an [`Esdb`].
pub struct EsdbConfig {
    /// The connection the derived-state tables (and, typically, the queue)
    /// live on.
    pub db: Arc<Connection>,
    /// The event queue to pull from.
    pub queue: Arc<dyn EventQueue>,
    /// User-supplied models. `metadata` is reserved and installed
    /// automatically; passing a model named `metadata` is rejected.
    pub models: Vec<Arc<dyn Model>>,
}

/// Events an [`Esdb`] instance emits as it handles events.
#[derive(Debug, Clone)]
pub enum EsdbEvent {
    /// A successfully handled event, with no `error` entries.
    Result(Event),
    /// A handled event that carries at least one `error` entry.
    Error(Event),
    /// Fires for every handled event, after `Result`/`Error`.
    Handled(Event),
}

type VersionResult = std::result::Result<u64, Arc<Error>>;

/// How often continuous polling re-checks `PRAGMA data_version` for a write
/// committed by another process before re-probing the queue.
const DATA_VERSION_POLL_INTERVAL: Duration = Duration::from_millis(200);

struct PollingState {
    min_version: AtomicU64,
    continuous: AtomicBool,
    really_stop: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PollingState {
    fn new() -> Self {
        Self {
            min_version: AtomicU64::new(0),
            continuous: AtomicBool::new(false),
            really_stop: AtomicBool::new(false),
            handle: Mutex::new(None),
        }
    }
}

/// The event-sourced database: owns the model registry, the event queue,
/// and the polling loop that drives events through preprocessors,
/// reducers, and derivers.
pub struct Esdb {
    db: Arc<Connection>,
    queue: Arc<dyn EventQueue>,
    models: HashMap<String, Arc<dyn Model>>,
    reducer_names: Vec<String>,
    deriver_names: Vec<String>,
    preproc_names: Vec<String>,
    waiters: WaiterRegistry,
    version_cache: Mutex<Option<Shared<BoxFuture<'static, VersionResult>>>>,
    polling: PollingState,
    events: broadcast::Sender<EsdbEvent>,
}

impl Esdb {
    /// Registers `config`'s models (migrating their tables in one
    /// transaction alongside the built-in `metadata` model), then primes
    /// the pipeline against whatever the queue already holds.
    ///
    /// # Errors
    /// Returns [`Error::ReservedModelName`] if a user model is named
    /// `metadata`, or [`Error::Sql`] if migration fails.
    #[instrument(skip(config))]
    pub async fn new(config: EsdbConfig) -> Result<Arc<Self>> {
        let EsdbConfig { db, queue, models } = config;

        let mut model_map: HashMap<String, Arc<dyn Model>> = HashMap::new();
        let mut reducer_names = Vec::with_capacity(models.len());
        let mut deriver_names = Vec::with_capacity(models.len());
        let mut preproc_names = Vec::with_capacity(models.len());

        model_map.insert(METADATA_MODEL.to_string(), Arc::new(MetadataModel) as Arc<dyn Model>);

        for model in models {
            reject_reserved_name(model.name())?;
            let name = model.name().to_string();
            reducer_names.push(name.clone());
            deriver_names.push(name.clone());
            preproc_names.push(name.clone());
            model_map.insert(name, model);
        }

        let migrating = model_map.clone();
        db.with_transaction(move |mut tx| {
            Box::pin(async move {
                for model in migrating.values() {
                    model.migrate(&mut tx).await?;
                }
                Ok(())
            })
        })
        .await?;

        let (events, _) = broadcast::channel(256);
        let esdb = Arc::new(Self {
            db,
            queue,
            models: model_map,
            reducer_names,
            deriver_names,
            preproc_names,
            waiters: WaiterRegistry::new(),
            version_cache: Mutex::new(None),
            polling: PollingState::new(),
            events,
        });
        esdb.check_for_events().await?;
        Ok(esdb)
    }

    /// Subscribes to [`EsdbEvent`]s emitted as events are handled.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EsdbEvent> {
        self.events.subscribe()
    }

    /// Appends a new event to the queue and waits for it to be handled.
    ///
    /// # Errors
    /// Returns [`Error::EventFailed`] if the event's handling produced any
    /// per-model errors, or propagates a queue/apply failure.
    #[instrument(skip(self, event_type, data), fields(event.type = %event_type.as_ref()))]
    pub async fn dispatch(
        self: &Arc<Self>,
        event_type: impl AsRef<str> + Into<String>,
        data: serde_json::Value,
        ts: Option<i64>,
    ) -> Result<Event> {
        let ts = ts.unwrap_or_else(current_millis);
        let event = self.queue.add(event_type.into(), data, ts).await?;
        self.handled_version(event.v).await
    }

    /// Resolves once version `v` has been handled, immediately if it
    /// already has been.
    ///
    /// # Errors
    /// Returns [`Error::EventFailed`] if `v`'s handling produced any
    /// per-model errors, [`Error::NoSuchVersion`] if the queue has no such
    /// event, or [`Error::ShutDown`] if the pipeline was dropped first.
    #[instrument(skip(self))]
    pub async fn handled_version(self: &Arc<Self>, v: u64) -> Result<Event> {
        if v == 0 {
            return Ok(Event::new(0, "", 0, serde_json::Value::Null));
        }

        let applied = self.get_version().await?;
        if v <= applied {
            let event = self.queue.get(v).await?.ok_or(Error::NoSuchVersion(v))?;
            return if event.error.is_empty() {
                Ok(event)
            } else {
                Err(Error::EventFailed {
                    v: event.v,
                    errors: event.error,
                })
            };
        }

        let rx = self.waiters.register(v).await;
        self.start_polling(v).await;
        rx.await.map_err(|_| Error::ShutDown)?
    }

    /// Reads the latest queue version and waits for it to be handled.
    ///
    /// # Errors
    /// See [`Esdb::handled_version`].
    #[instrument(skip(self))]
    pub async fn wait_for_queue(self: &Arc<Self>) -> Result<Event> {
        let latest = self.queue.latest_version().await?;
        self.handled_version(latest).await
    }

    /// Stops the polling loop after its current run finishes. In-flight
    /// transactions are not interrupted.
    pub async fn stop_polling(&self) {
        self.polling.really_stop.store(true, Ordering::SeqCst);
        self.polling.continuous.store(false, Ordering::SeqCst);
        let handle = self.polling.handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Switches the poller into continuous mode: rather than stopping once
    /// the queue has nothing more to offer, it keeps watching
    /// `db.data_version()` for a write committed by another process on the
    /// same file and re-checks the queue whenever it changes. Use this when
    /// more than one process shares a database file and this instance must
    /// react to events another writer appends.
    #[instrument(skip(self))]
    pub async fn watch_for_external_writes(self: &Arc<Self>) {
        self.start_polling(0).await;
    }

    async fn check_for_events(self: &Arc<Self>) -> Result<()> {
        let latest = self.queue.latest_version().await?;
        if latest > 0 {
            self.start_polling(latest).await;
        }
        Ok(())
    }

    /// Coalesces concurrent reads of the applied version into one
    /// in-flight query: a second caller arriving while a read is underway
    /// awaits the same result instead of issuing its own.
    async fn get_version(&self) -> Result<u64> {
        let shared = {
            let mut guard = self.version_cache.lock().await;
            if let Some(shared) = guard.as_ref() {
                shared.clone()
            } else {
                let db = Arc::clone(&self.db);
                let fut: BoxFuture<'static, VersionResult> = Box::pin(async move {
                    read_applied_version(&db).await.map_err(Arc::new)
                });
                let shared = fut.shared();
                *guard = Some(shared.clone());
                shared
            }
        };
        let result = shared.await;
        {
            let mut guard = self.version_cache.lock().await;
            *guard = None;
        }
        result.map_err(|err| Error::Callback(err.to_string()))
    }

    async fn start_polling(self: &Arc<Self>, want_version: u64) {
        if want_version > 0 {
            self.polling.min_version.fetch_max(want_version, Ordering::SeqCst);
        } else {
            self.polling.continuous.store(true, Ordering::SeqCst);
        }

        let mut guard = self.polling.handle.lock().await;
        let needs_spawn = guard.as_ref().map_or(true, JoinHandle::is_finished);
        if needs_spawn {
            self.polling.really_stop.store(false, Ordering::SeqCst);
            let this = Arc::clone(self);
            *guard = Some(tokio::spawn(async move {
                this.run_polling_loop().await;
            }));
        }
    }

    async fn run_polling_loop(self: Arc<Self>) {
        loop {
            let last_v = self.wait_for_event().await;
            if self.polling.really_stop.swap(false, Ordering::SeqCst) {
                return;
            }
            let want = self.polling.min_version.load(Ordering::SeqCst);
            let continuous = self.polling.continuous.load(Ordering::SeqCst);
            if !continuous && want <= last_v {
                return;
            }
        }
    }

    /// Pulls events one at a time until the queue has nothing more to
    /// offer (or a fatal apply failure stalls progress), returning the
    /// last version this run reached. In continuous mode, "nothing more to
    /// offer" does not end the run: it instead watches `data_version()` for
    /// a write committed by another process before re-probing the queue.
    /// Never panics or propagates an error out of the loop itself — every
    /// failure is logged and turned into either a retry-next-run (apply
    /// failure) or a synthesized error event (reducer-phase failure).
    async fn wait_for_event(&self) -> u64 {
        let mut cursor = match self.get_version().await {
            Ok(v) => v,
            Err(err) => {
                tracing::error!(error = %err, "failed to read applied version, stopping this poll run");
                return 0;
            }
        };

        let mut last_data_version = None;

        loop {
            let continuous = self.polling.continuous.load(Ordering::SeqCst);
            let next = match self.queue.get_next(cursor, true).await {
                Ok(Some(event)) => event,
                Ok(None) if continuous => {
                    if self.polling.really_stop.load(Ordering::SeqCst) {
                        return cursor;
                    }
                    match self.await_data_version_change(&mut last_data_version).await {
                        Ok(()) => continue,
                        Err(err) => {
                            tracing::error!(error = %err, "failed to read data_version while polling continuously");
                            return cursor;
                        }
                    }
                }
                Ok(None) => return cursor,
                Err(err) => {
                    tracing::error!(error = %err, "failed to read next event, stopping this poll run");
                    return cursor;
                }
            };

            match self.handle_event(next).await {
                Ok(handled_v) => cursor = handled_v,
                Err(err) => {
                    tracing::error!(error = %err, "apply failed; event remains un-acked and will be retried");
                    return cursor;
                }
            }

            if self.polling.really_stop.load(Ordering::SeqCst) {
                return cursor;
            }
        }
    }

    /// Blocks until `PRAGMA data_version` changes from the last value this
    /// run observed (priming `last` on first call rather than waiting
    /// immediately), polling at [`DATA_VERSION_POLL_INTERVAL`]. This is how
    /// continuous mode notices a write committed by another process on the
    /// same file, per the spec's cross-process change-detection design.
    async fn await_data_version_change(&self, last: &mut Option<i64>) -> Result<()> {
        if last.is_none() {
            *last = Some(self.db.data_version().await?);
        }
        loop {
            if self.polling.really_stop.load(Ordering::SeqCst) {
                return Ok(());
            }
            tokio::time::sleep(DATA_VERSION_POLL_INTERVAL).await;
            let probed = self.db.data_version().await?;
            if Some(probed) != *last {
                *last = Some(probed);
                return Ok(());
            }
        }
    }

    async fn handle_event(&self, event: Event) -> Result<u64> {
        let (preprocessed, preprocess_errors) = self.preprocess(event).await;
        let v = preprocessed.v;
        let applied = self.apply_event(preprocessed, preprocess_errors).await?;
        self.handle_result(applied).await?;
        Ok(v)
    }

    /// Runs preprocessors in registration order. A preprocessor that
    /// changes `event.v` or clears `event.event_type` short-circuits the
    /// remaining preprocessors with a synthesized `_preprocess` error, as
    /// does a preprocessor that itself returns `Err`.
    async fn preprocess(
        &self,
        event: Event,
    ) -> (Event, HashMap<String, serde_json::Value>) {
        let mut event = event;
        let mut errors = HashMap::new();

        for name in &self.preproc_names {
            let Some(model) = self.models.get(name) else {
                continue;
            };
            match model.preprocess(&event).await {
                Ok(Some(new_event)) => {
                    if new_event.v != event.v || new_event.event_type.is_empty() {
                        let violation = Error::PreprocessorMisuse {
                            model: name.clone(),
                            reason: "changed event.v or cleared event.type".to_string(),
                        };
                        errors.insert("_preprocess".to_string(), json!(violation.to_string()));
                        break;
                    }
                    event = new_event;
                }
                Ok(None) => {}
                Err(err) => {
                    errors.insert(name.clone(), json!(err.to_string()));
                    break;
                }
            }
        }

        (event, errors)
    }

    /// Computes and atomically applies this event's reducer outcomes:
    /// every registered model's reducer runs, then — if none errored —
    /// each model's `Change` is applied, and the `metadata` version row
    /// always advances (forward progress even on a reducer error), all in
    /// one transaction. `queue.set` and derivers happen afterward, outside
    /// this transaction; see `DESIGN.md` for why queue durability couldn't
    /// also be folded into the same transaction.
    #[instrument(skip(self, preprocess_errors), fields(event.v = event.v))]
    async fn apply_event(
        &self,
        event: Event,
        preprocess_errors: HashMap<String, serde_json::Value>,
    ) -> Result<Event> {
        self.db
            .with_transaction(move |mut tx| {
                Box::pin(async move {
                    let current_v = MetadataModel::current_version(&mut tx).await?;
                    let mut result = HashMap::new();
                    let mut errors = preprocess_errors;

                    if errors.is_empty() {
                        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                            combine_reducers(&self.models, &self.reducer_names, &event)
                        })) {
                            Ok(outcomes) => {
                                for (name, outcome) in &outcomes {
                                    if let ReducerOutcome::Errored(e) = outcome {
                                        errors.insert(name.clone(), e.clone());
                                    }
                                }
                                if errors.is_empty() {
                                    for (name, outcome) in outcomes {
                                        if let ReducerOutcome::Changed(change) = outcome {
                                            let model = self
                                                .models
                                                .get(&name)
                                                .ok_or_else(|| Error::UnknownModel(name.clone()))?;
                                            result.insert(name.clone(), serde_json::to_value(&change)?);
                                            model.apply_changes(&mut tx, change).await?;
                                        }
                                    }
                                }
                            }
                            Err(panic) => {
                                // A reducer panicked instead of returning `Errored`. Synthesize
                                // the same `_redux` error the source attaches when its redux
                                // store's dispatch itself throws; metadata still advances below.
                                errors.insert("_redux".to_string(), json!({"message": panic_message(&panic)}));
                            }
                        }
                    }

                    match MetadataModel::reduce(&event, current_v) {
                        ReducerOutcome::Changed(change) => {
                            // Metadata's own version advance is never surfaced in `result` —
                            // it isn't part of the durable record, per applyEvent step 1.
                            let metadata = self
                                .models
                                .get(METADATA_MODEL)
                                .expect("metadata is always registered");
                            metadata.apply_changes(&mut tx, change).await?;
                        }
                        ReducerOutcome::Errored(e) => {
                            errors.insert(METADATA_MODEL.to_string(), e);
                        }
                        ReducerOutcome::NoChange => {}
                    }

                    let mut event = event;
                    event.result = result;
                    event.error = errors;
                    Ok(event)
                })
            })
            .await
    }

    /// Durably acks the event to the queue, emits `Result`/`Error` then
    /// `Handled`, runs derivers concurrently, and resolves (or sweeps)
    /// waiters.
    #[instrument(skip(self, event), fields(event.v = event.v))]
    async fn handle_result(&self, event: Event) -> Result<()> {
        self.queue.set(event.clone()).await?;

        let _ = self.events.send(if event.error.is_empty() {
            EsdbEvent::Result(event.clone())
        } else {
            EsdbEvent::Error(event.clone())
        });

        let derivations = self.deriver_names.iter().filter_map(|name| {
            self.models.get(name).map(|model| {
                let model = Arc::clone(model);
                let db = Arc::clone(&self.db);
                let event = event.clone();
                async move {
                    if let Err(err) = model.derive(&db, &event, &event.result).await {
                        tracing::error!(model = %model.name(), error = %err, "deriver failed");
                    }
                }
            })
        });
        futures::future::join_all(derivations).await;

        let _ = self.events.send(EsdbEvent::Handled(event.clone()));

        self.waiters.resolve(&event).await;
        self.waiters.sweep_up_to(self.queue.as_ref(), event.v).await?;

        Ok(())
    }
}

async fn read_applied_version(db: &Connection) -> Result<u64> {
    let row = db
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

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "reducer panicked".to_string()
    }
}

fn current_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
