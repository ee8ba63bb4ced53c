//! The waiter registry: callers blocked on a future version being handled.

use std::collections::HashMap;

use tokio::sync::{oneshot, Mutex};

use crate::error::{Error, Result};
use crate::event::Event;
use crate::queue::EventQueue;

/// Resolves (or rejects) a pending [`crate::core::Esdb::handled_version`]
/// call once its version has been applied.
///
/// The high-water mark of requested versions (the source's `_maxWaitingFor`)
/// lives on [`crate::core::Esdb`]'s `PollingState` instead of here, since
/// `start_polling` must track it even for callers — like the initial
/// `check_for_events` priming — that never register a waiter at all.
pub struct WaiterRegistry {
    waiters: Mutex<HashMap<u64, Vec<oneshot::Sender<Result<Event>>>>>,
}

impl WaiterRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Registers interest in `v`, returning the receiving half of the
    /// channel that will carry the event (or its rejection) once handled.
    pub async fn register(&self, v: u64) -> oneshot::Receiver<Result<Event>> {
        let (tx, rx) = oneshot::channel();
        let mut guard = self.waiters.lock().await;
        guard.entry(v).or_default().push(tx);
        rx
    }

    /// Resolves every waiter registered for `event.v` directly from
    /// `event`.
    pub async fn resolve(&self, event: &Event) {
        let senders = {
            let mut guard = self.waiters.lock().await;
            guard.remove(&event.v)
        };
        let Some(senders) = senders else {
            return;
        };
        for tx in senders {
            let _ = tx.send(outcome_for(event));
        }
    }

    /// Race-recovery sweep: resolves every still-registered waiter with
    /// `v <= upto` by re-fetching its event from `queue`, in case a waiter
    /// registered for an already-applied version slipped past
    /// [`WaiterRegistry::resolve`]'s direct resolution.
    ///
    /// # Errors
    /// Returns [`Error::Sql`] if a queue lookup fails.
    pub async fn sweep_up_to(&self, queue: &dyn EventQueue, upto: u64) -> Result<()> {
        let drained = {
            let mut guard = self.waiters.lock().await;
            let keys: Vec<u64> = guard.keys().copied().filter(|&v| v <= upto).collect();
            keys.into_iter()
                .filter_map(|v| guard.remove(&v).map(|senders| (v, senders)))
                .collect::<Vec<_>>()
        };
        for (v, senders) in drained {
            if let Some(event) = queue.get(v).await? {
                for tx in senders {
                    let _ = tx.send(outcome_for(&event));
                }
            } else {
                for tx in senders {
                    let _ = tx.send(Err(Error::NoSuchVersion(v)));
                }
            }
        }
        Ok(())
    }
}

impl Default for WaiterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn outcome_for(event: &Event) -> Result<Event> {
    if event.error.is_empty() {
        Ok(event.clone())
    } else {
        Err(Error::EventFailed {
            v: event.v,
            errors: event.error.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::in_memory::InMemoryEventQueue;
    use serde_json::json;

    #[tokio::test]
    async fn resolve_delivers_success() {
        let registry = WaiterRegistry::new();
        let rx = registry.register(1).await;
        let event = Event::new(1, "inc", 0, json!({}));
        registry.resolve(&event).await;
        let outcome = rx.await.unwrap();
        assert!(outcome.is_ok());
    }

    #[tokio::test]
    async fn resolve_delivers_rejection_for_errored_event() {
        let registry = WaiterRegistry::new();
        let rx = registry.register(1).await;
        let mut event = Event::new(1, "inc", 0, json!({}));
        event.error.insert("counter".to_string(), json!("bad"));
        registry.resolve(&event).await;
        let outcome = rx.await.unwrap();
        assert!(matches!(outcome, Err(Error::EventFailed { v: 1, .. })));
    }

    #[tokio::test]
    async fn sweep_up_to_resolves_residual_waiters_from_the_queue() {
        let registry = WaiterRegistry::new();
        let rx = registry.register(1).await;
        let queue = InMemoryEventQueue::new();
        let event = queue.add("inc".to_string(), json!({}), 0).await.unwrap();
        queue.set(event).await.unwrap();

        registry.sweep_up_to(&queue, 1).await.unwrap();
        let outcome = rx.await.unwrap();
        assert!(outcome.is_ok());
    }

    #[tokio::test]
    async fn sweep_up_to_leaves_waiters_above_the_bound_untouched() {
        let registry = WaiterRegistry::new();
        let rx = registry.register(5).await;
        let queue = InMemoryEventQueue::new();
        registry.sweep_up_to(&queue, 2).await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
