//! In-memory implementation of every store trait.
//!
//! Thread-safe and cheap to clone; clones share state. Dropping a runtime
//! while keeping a clone of the store is how tests simulate a process
//! restart against surviving durable state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{ExecutionStore, HistoryStore, TimerStore};
use crate::error::{Error, Result};
use crate::types::{Execution, ExecutionListFilter, ExecutionStatus, StepOutcome, StepRecord, Timer};

#[derive(Default)]
struct State {
    history: HashMap<String, BTreeMap<u32, StepRecord>>,
    executions: HashMap<String, Execution>,
    timers: HashMap<String, Timer>,
    claims: HashMap<String, Claim>,
}

struct Claim {
    owner: String,
    expires_at: DateTime<Utc>,
}

#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_state(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of pending timers
    pub fn timer_count(&self) -> usize {
        self.read_state().timers.len()
    }
}

#[async_trait]
impl HistoryStore for InMemoryStore {
    async fn append(&self, execution_id: &str, record: StepRecord) -> Result<()> {
        let mut state = self.write_state();
        let records = state.history.entry(execution_id.to_string()).or_default();

        match records.get(&record.index) {
            Some(existing) if existing.same_content(&record) => Ok(()),
            Some(_) => Err(Error::Conflict {
                execution_id: execution_id.to_string(),
                index: record.index,
            }),
            None => {
                records.insert(record.index, record);
                Ok(())
            }
        }
    }

    async fn read(&self, execution_id: &str) -> Result<Vec<StepRecord>> {
        let state = self.read_state();
        Ok(state
            .history
            .get(execution_id)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl ExecutionStore for InMemoryStore {
    async fn create_execution(&self, execution: Execution) -> Result<(Execution, bool)> {
        let mut state = self.write_state();
        if let Some(existing) = state.executions.get(&execution.id) {
            return Ok((existing.clone(), false));
        }
        state
            .executions
            .insert(execution.id.clone(), execution.clone());
        Ok((execution, true))
    }

    async fn get_execution(&self, execution_id: &str) -> Result<Option<Execution>> {
        Ok(self.read_state().executions.get(execution_id).cloned())
    }

    async fn finish_execution(
        &self,
        execution_id: &str,
        outcome: &StepOutcome,
        completed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.write_state();
        let execution = state
            .executions
            .get_mut(execution_id)
            .ok_or_else(|| Error::ExecutionNotFound(execution_id.to_string()))?;

        if execution.status.is_terminal() {
            return Ok(false);
        }

        match outcome {
            StepOutcome::Success(value) => {
                execution.status = ExecutionStatus::Completed;
                execution.result = Some(value.clone());
            }
            StepOutcome::Failure(error) => {
                execution.status = ExecutionStatus::Failed;
                execution.error = Some(error.clone());
            }
        }
        execution.completed_at = Some(completed_at);
        Ok(true)
    }

    async fn list_executions(&self, filter: ExecutionListFilter) -> Result<Vec<Execution>> {
        let state = self.read_state();
        let mut executions: Vec<Execution> = state
            .executions
            .values()
            .filter(|e| filter.status.map_or(true, |s| e.status == s))
            .filter(|e| {
                filter
                    .workflow_name
                    .as_deref()
                    .map_or(true, |name| e.workflow_name == name)
            })
            .cloned()
            .collect();

        executions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            executions.truncate(limit.max(0) as usize);
        }
        Ok(executions)
    }

    async fn list_children(&self, parent_id: &str) -> Result<Vec<Execution>> {
        let state = self.read_state();
        let mut children: Vec<Execution> = state
            .executions
            .values()
            .filter(|e| {
                e.parent
                    .as_ref()
                    .map_or(false, |edge| edge.execution_id == parent_id)
            })
            .cloned()
            .collect();
        children.sort_by_key(|e| e.parent.as_ref().map(|edge| edge.step_index));
        Ok(children)
    }

    async fn claim_execution(
        &self,
        execution_id: &str,
        owner: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.write_state();
        if !state.executions.contains_key(execution_id) {
            return Err(Error::ExecutionNotFound(execution_id.to_string()));
        }

        if let Some(claim) = state.claims.get(execution_id) {
            if claim.owner != owner && claim.expires_at >= now {
                return Ok(false);
            }
        }
        state.claims.insert(
            execution_id.to_string(),
            Claim {
                owner: owner.to_string(),
                expires_at,
            },
        );
        Ok(true)
    }

    async fn release_execution(&self, execution_id: &str, owner: &str) -> Result<()> {
        let mut state = self.write_state();
        if state
            .claims
            .get(execution_id)
            .map_or(false, |claim| claim.owner == owner)
        {
            state.claims.remove(execution_id);
        }
        Ok(())
    }
}

#[async_trait]
impl TimerStore for InMemoryStore {
    async fn schedule_timer(&self, timer: Timer) -> Result<Timer> {
        let mut state = self.write_state();
        let stored = state
            .timers
            .entry(timer.promise_id.clone())
            .or_insert(timer);
        Ok(stored.clone())
    }

    async fn due_timers(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Timer>> {
        let state = self.read_state();
        let mut due: Vec<Timer> = state
            .timers
            .values()
            .filter(|t| t.fire_at <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| a.fire_at.cmp(&b.fire_at).then(a.promise_id.cmp(&b.promise_id)));
        due.truncate(limit);
        Ok(due)
    }

    async fn delete_timer(&self, promise_id: &str) -> Result<()> {
        self.write_state().timers.remove(promise_id);
        Ok(())
    }

    async fn delete_timers_for_execution(&self, execution_id: &str) -> Result<usize> {
        let mut state = self.write_state();
        let before = state.timers.len();
        state.timers.retain(|_, t| t.execution_id != execution_id);
        Ok(before - state.timers.len())
    }

    async fn next_fire_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.read_state().timers.values().map(|t| t.fire_at).min())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{run_input, ErrorInfo, StepKind};
    use chrono::Duration;
    use serde_json::json;

    fn record(index: u32, value: serde_json::Value) -> StepRecord {
        StepRecord {
            index,
            kind: StepKind::Run,
            input: run_input("notify", &json!([index])),
            outcome: StepOutcome::Success(value),
            completed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_read_unknown_execution_is_empty() {
        let store = InMemoryStore::new();
        assert!(store.read("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_append_orders_by_index() {
        let store = InMemoryStore::new();
        store.append("e", record(1, json!("b"))).await.unwrap();
        store.append("e", record(0, json!("a"))).await.unwrap();

        let records = store.read("e").await.unwrap();
        let indices: Vec<u32> = records.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_append_is_idempotent_for_identical_content() {
        let store = InMemoryStore::new();
        store.append("e", record(0, json!(1))).await.unwrap();
        store.append("e", record(0, json!(1))).await.unwrap();
        assert_eq!(store.read("e").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_append_conflict() {
        let store = InMemoryStore::new();
        store.append("e", record(0, json!(1))).await.unwrap();

        let err = store.append("e", record(0, json!(2))).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { index: 0, .. }));
        assert_eq!(
            store.read("e").await.unwrap()[0].outcome,
            StepOutcome::Success(json!(1))
        );
    }

    #[tokio::test]
    async fn test_create_execution_keeps_first() {
        let store = InMemoryStore::new();
        let (_, created) = store
            .create_execution(Execution::new("e", "countdown", json!([1])))
            .await
            .unwrap();
        assert!(created);

        let (existing, created) = store
            .create_execution(Execution::new("e", "countdown", json!([2])))
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(existing.args, json!([1]));
    }

    #[tokio::test]
    async fn test_finish_execution_only_once() {
        let store = InMemoryStore::new();
        store
            .create_execution(Execution::new("e", "w", json!(null)))
            .await
            .unwrap();

        let first = store
            .finish_execution("e", &StepOutcome::Success(json!(1)), Utc::now())
            .await
            .unwrap();
        let second = store
            .finish_execution(
                "e",
                &StepOutcome::Failure(ErrorInfo::new("Late", "too late")),
                Utc::now(),
            )
            .await
            .unwrap();

        assert!(first);
        assert!(!second);
        let execution = store.get_execution("e").await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.result, Some(json!(1)));
    }

    #[tokio::test]
    async fn test_claim_excludes_other_owners_until_released_or_expired() {
        let store = InMemoryStore::new();
        store
            .create_execution(Execution::new("e", "w", json!(null)))
            .await
            .unwrap();
        let now = Utc::now();
        let lease = now + Duration::seconds(30);

        assert!(store.claim_execution("e", "a", now, lease).await.unwrap());
        assert!(store.claim_execution("e", "a", now, lease).await.unwrap(), "re-entrant");
        assert!(!store.claim_execution("e", "b", now, lease).await.unwrap());

        // Only the holder can release
        store.release_execution("e", "b").await.unwrap();
        assert!(!store.claim_execution("e", "b", now, lease).await.unwrap());
        store.release_execution("e", "a").await.unwrap();
        assert!(store.claim_execution("e", "b", now, lease).await.unwrap());

        // A holder that stopped renewing loses the claim once it expires
        let later = lease + Duration::milliseconds(1);
        assert!(store
            .claim_execution("e", "a", later, later + Duration::seconds(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_claim_unknown_execution() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let err = store.claim_execution("missing", "a", now, now).await.unwrap_err();
        assert!(matches!(err, Error::ExecutionNotFound(_)));
    }

    #[tokio::test]
    async fn test_due_timers_in_fire_order() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        for (id, offset) in [("c", 3), ("a", 1), ("b", 2), ("later", 60)] {
            store
                .schedule_timer(Timer {
                    promise_id: id.to_string(),
                    execution_id: "e".to_string(),
                    step_index: 0,
                    fire_at: now + Duration::seconds(offset),
                    duration_ms: 0,
                })
                .await
                .unwrap();
        }

        let due = store
            .due_timers(now + Duration::seconds(10), 10)
            .await
            .unwrap();
        let ids: Vec<&str> = due.iter().map(|t| t.promise_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        assert_eq!(store.next_fire_at().await.unwrap(), Some(now + Duration::seconds(1)));
        assert_eq!(store.delete_timers_for_execution("e").await.unwrap(), 4);
        assert!(store.next_fire_at().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_schedule_timer_keeps_original_fire_at() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let timer = Timer {
            promise_id: "e.1".to_string(),
            execution_id: "e".to_string(),
            step_index: 1,
            fire_at: now,
            duration_ms: 1000,
        };
        store.schedule_timer(timer.clone()).await.unwrap();

        let mut rescheduled = timer.clone();
        rescheduled.fire_at = now + Duration::seconds(30);
        let stored = store.schedule_timer(rescheduled).await.unwrap();
        assert_eq!(stored.fire_at, now);
    }
}
