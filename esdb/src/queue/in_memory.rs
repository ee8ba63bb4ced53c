//! An in-process [`EventQueue`] with no durability, for tests that don't
//! need a backing file or cross-process visibility.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Notify;

use crate::error::Result;
use crate::event::Event;
use crate::queue::EventQueue;

/// A `DashMap`-backed event queue living entirely in process memory.
pub struct InMemoryEventQueue {
    events: DashMap<u64, Event>,
    latest: AtomicU64,
    notify: Arc<Notify>,
}

impl Default for InMemoryEventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            events: DashMap::new(),
            latest: AtomicU64::new(0),
            notify: Arc::new(Notify::new()),
        }
    }
}

#[async_trait]
impl EventQueue for InMemoryEventQueue {
    async fn add(&self, event_type: String, data: serde_json::Value, ts: i64) -> Result<Event> {
        let v = self.latest.fetch_add(1, Ordering::SeqCst) + 1;
        let event = Event::new(v, event_type, ts, data);
        self.events.insert(v, event.clone());
        self.notify.notify_waiters();
        Ok(event)
    }

    async fn get(&self, v: u64) -> Result<Option<Event>> {
        Ok(self.events.get(&v).map(|e| e.clone()))
    }

    async fn get_next(&self, after_v: u64, once: bool) -> Result<Option<Event>> {
        let wanted = after_v + 1;
        if once {
            return Ok(self.events.get(&wanted).map(|e| e.clone()));
        }
        loop {
            // Register interest before checking, not after: `Notify::notify_waiters`
            // only wakes tasks already parked in `notified()`, so constructing the
            // future after the check would risk missing a concurrent `add`.
            let notified = self.notify.notified();
            if let Some(event) = self.events.get(&wanted) {
                return Ok(Some(event.clone()));
            }
            notified.await;
        }
    }

    async fn set(&self, event: Event) -> Result<()> {
        self.events.insert(event.v, event);
        Ok(())
    }

    async fn latest_version(&self) -> Result<u64> {
        Ok(self.latest.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn add_then_get_round_trips() {
        let queue = InMemoryEventQueue::new();
        let added = queue.add("inc".to_string(), json!({"n": 1}), 0).await.unwrap();
        let fetched = queue.get(added.v).await.unwrap().unwrap();
        assert_eq!(fetched.data, json!({"n": 1}));
    }

    #[tokio::test]
    async fn get_next_once_is_non_blocking() {
        let queue = InMemoryEventQueue::new();
        assert!(queue.get_next(0, true).await.unwrap().is_none());
    }
}
