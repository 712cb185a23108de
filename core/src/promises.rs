//! Promise registry
//!
//! Tracks every outstanding asynchronous result (side effect, timer, nested
//! invocation, top-level execution) by a stable id. Settlement happens once;
//! the first writer wins and later attempts report `AlreadyResolved`.
//! Waiters are woken through a `watch` channel per promise.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::types::{ErrorInfo, StepOutcome};

#[derive(Debug, Clone, PartialEq)]
pub enum PromiseState {
    Pending,
    Resolved(JsonValue),
    Rejected(ErrorInfo),
}

impl PromiseState {
    pub fn is_pending(&self) -> bool {
        matches!(self, PromiseState::Pending)
    }

    pub fn outcome(&self) -> Option<StepOutcome> {
        match self {
            PromiseState::Pending => None,
            PromiseState::Resolved(value) => Some(StepOutcome::Success(value.clone())),
            PromiseState::Rejected(error) => Some(StepOutcome::Failure(error.clone())),
        }
    }
}

impl From<StepOutcome> for PromiseState {
    fn from(outcome: StepOutcome) -> Self {
        match outcome {
            StepOutcome::Success(value) => PromiseState::Resolved(value),
            StepOutcome::Failure(error) => PromiseState::Rejected(error),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Promise {
    pub id: String,
    pub state: PromiseState,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

struct Entry {
    promise: Promise,
    notify: watch::Sender<PromiseState>,
}

impl Entry {
    fn new(id: &str) -> Self {
        let (notify, _) = watch::channel(PromiseState::Pending);
        Self {
            promise: Promise {
                id: id.to_string(),
                state: PromiseState::Pending,
                created_at: Utc::now(),
                settled_at: None,
            },
            notify,
        }
    }
}

#[derive(Default)]
pub struct PromiseRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl PromiseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fresh pending promise, or the existing one with the same id
    pub fn create(&self, id: &str) -> Promise {
        let mut entries = self.entries();
        entries
            .entry(id.to_string())
            .or_insert_with(|| Entry::new(id))
            .promise
            .clone()
    }

    pub fn get(&self, id: &str) -> Option<Promise> {
        self.entries().get(id).map(|entry| entry.promise.clone())
    }

    pub fn resolve(&self, id: &str, value: JsonValue) -> Result<()> {
        self.settle(id, StepOutcome::Success(value))
    }

    pub fn reject(&self, id: &str, error: ErrorInfo) -> Result<()> {
        self.settle(id, StepOutcome::Failure(error))
    }

    /// Transition a pending promise to its terminal state.
    ///
    /// Settling an unknown id creates it already settled, so completions that
    /// arrive after a restart (the registry is not persisted) are not lost.
    pub fn settle(&self, id: &str, outcome: StepOutcome) -> Result<()> {
        let mut entries = self.entries();
        let entry = entries
            .entry(id.to_string())
            .or_insert_with(|| Entry::new(id));

        if !entry.promise.state.is_pending() {
            return Err(Error::AlreadyResolved(id.to_string()));
        }

        let state = PromiseState::from(outcome);
        entry.promise.state = state.clone();
        entry.promise.settled_at = Some(Utc::now());
        entry.notify.send_replace(state);
        Ok(())
    }

    /// Suspend until the promise settles and return its outcome
    pub async fn wait(&self, id: &str) -> Result<StepOutcome> {
        let mut receiver = {
            let entries = self.entries();
            let entry = entries
                .get(id)
                .ok_or_else(|| Error::PromiseNotFound(id.to_string()))?;
            if let Some(outcome) = entry.promise.state.outcome() {
                return Ok(outcome);
            }
            entry.notify.subscribe()
        };

        loop {
            if let Some(outcome) = receiver.borrow_and_update().outcome() {
                return Ok(outcome);
            }
            if receiver.changed().await.is_err() {
                // Sender dropped: the entry was forgotten after settling
                return self
                    .get(id)
                    .and_then(|p| p.state.outcome())
                    .ok_or_else(|| Error::PromiseNotFound(id.to_string()));
            }
        }
    }

    /// Drop a settled promise nobody is waiting on. Returns whether it was removed.
    pub fn forget(&self, id: &str) -> bool {
        let mut entries = self.entries();
        let removable = entries.get(id).map_or(false, |entry| {
            !entry.promise.state.is_pending() && entry.notify.receiver_count() == 0
        });
        if removable {
            entries.remove(id);
        }
        removable
    }

    /// Promises held, pending or settled
    pub fn tracked(&self) -> usize {
        self.entries().len()
    }

    pub fn pending_count(&self) -> usize {
        self.entries()
            .values()
            .filter(|entry| entry.promise.state.is_pending())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_create_is_idempotent() {
        let registry = PromiseRegistry::new();
        let first = registry.create("e.0");
        registry.resolve("e.0", json!(1)).unwrap();

        let second = registry.create("e.0");
        assert_eq!(first.id, second.id);
        assert_eq!(second.state, PromiseState::Resolved(json!(1)));
    }

    #[test]
    fn test_first_writer_wins() {
        let registry = PromiseRegistry::new();
        registry.create("e.0");

        registry.resolve("e.0", json!("first")).unwrap();
        let err = registry
            .reject("e.0", ErrorInfo::new("Late", "second"))
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyResolved(_)));
        assert_eq!(
            registry.get("e.0").unwrap().state,
            PromiseState::Resolved(json!("first"))
        );
    }

    #[test]
    fn test_settle_unknown_creates_settled() {
        let registry = PromiseRegistry::new();
        registry.resolve("lost.3", json!({"elapsed": true})).unwrap();
        assert!(!registry.get("lost.3").unwrap().state.is_pending());
    }

    #[tokio::test]
    async fn test_wait_for_resolution() {
        let registry = Arc::new(PromiseRegistry::new());
        registry.create("e.1");

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.wait("e.1").await })
        };
        tokio::task::yield_now().await;
        registry.resolve("e.1", json!(42)).unwrap();

        let outcome = waiter.await.unwrap().unwrap();
        assert_eq!(outcome, StepOutcome::Success(json!(42)));
    }

    #[tokio::test]
    async fn test_wait_on_unknown_promise() {
        let registry = PromiseRegistry::new();
        assert!(matches!(
            registry.wait("nope").await,
            Err(Error::PromiseNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_settlement_has_one_winner() {
        let registry = Arc::new(PromiseRegistry::new());
        registry.create("race");

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.resolve("race", json!(i)).is_ok() })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_forget_only_settled_promises() {
        let registry = PromiseRegistry::new();
        registry.create("a");
        registry.create("b");
        registry.resolve("a", json!(null)).unwrap();

        assert!(registry.forget("a"));
        assert!(!registry.forget("b"), "pending promises are kept");
        assert!(!registry.forget("missing"));
        assert!(registry.get("a").is_none());
        assert_eq!(registry.pending_count(), 1);
        assert_eq!(registry.tracked(), 1);
    }

    #[tokio::test]
    async fn test_forget_keeps_promise_with_waiters() {
        let registry = Arc::new(PromiseRegistry::new());
        registry.create("w");

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.wait("w").await })
        };
        while registry.entries().get("w").map_or(0, |e| e.notify.receiver_count()) == 0 {
            tokio::task::yield_now().await;
        }
        registry.resolve("w", json!(1)).unwrap();
        assert!(!registry.forget("w"));

        assert_eq!(waiter.await.unwrap().unwrap(), StepOutcome::Success(json!(1)));
        assert!(registry.forget("w"));
    }
}
