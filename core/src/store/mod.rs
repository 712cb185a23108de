//! Durable state behind the runtime
//!
//! Three traits split the persisted state by concern so the executor,
//! timer subsystem and coordinator depend only on what they touch:
//!
//! - [`HistoryStore`]: append-only step records keyed by `(execution_id, index)`
//! - [`ExecutionStore`]: execution rows, including the parent invocation edge
//! - [`TimerStore`]: pending timers keyed by promise id, ordered by `fire_at`
//!
//! [`InMemoryStore`] implements all three for tests and embedding;
//! [`PostgresStore`] is the durable implementation.

mod in_memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::error::Result;
use crate::types::{Execution, ExecutionListFilter, StepOutcome, StepRecord, Timer};

pub use in_memory::InMemoryStore;
pub use postgres::PostgresStore;

#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append a record at `record.index`.
    ///
    /// Appending a record identical to the stored one is a no-op; a record
    /// with different content fails with [`crate::Error::Conflict`].
    async fn append(&self, execution_id: &str, record: StepRecord) -> Result<()>;

    /// All records of an execution in index order; empty for unknown ids.
    async fn read(&self, execution_id: &str) -> Result<Vec<StepRecord>>;
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Insert the execution unless one with the same id exists.
    ///
    /// Returns the stored execution and whether it was inserted by this call.
    async fn create_execution(&self, execution: Execution) -> Result<(Execution, bool)>;

    async fn get_execution(&self, execution_id: &str) -> Result<Option<Execution>>;

    /// Move a running execution to its terminal state.
    ///
    /// Returns false if the execution was already terminal (it is left untouched).
    async fn finish_execution(
        &self,
        execution_id: &str,
        outcome: &StepOutcome,
        completed_at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn list_executions(&self, filter: ExecutionListFilter) -> Result<Vec<Execution>>;

    /// Executions started by the given parent, ordered by step index
    async fn list_children(&self, parent_id: &str) -> Result<Vec<Execution>>;

    /// Take or extend the claim on an execution until `expires_at`.
    ///
    /// Succeeds when the execution is unclaimed, already claimed by `owner`,
    /// or its previous claim expired before `now`. Returns false while
    /// another owner holds a live claim.
    async fn claim_execution(
        &self,
        execution_id: &str,
        owner: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Drop the claim if `owner` still holds it
    async fn release_execution(&self, execution_id: &str, owner: &str) -> Result<()>;
}

#[async_trait]
pub trait TimerStore: Send + Sync {
    /// Persist a timer. Keyed by promise id; an existing timer is kept as is
    /// and returned.
    async fn schedule_timer(&self, timer: Timer) -> Result<Timer>;

    /// Timers with `fire_at <= now`, in non-decreasing `fire_at` order
    async fn due_timers(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Timer>>;

    async fn delete_timer(&self, promise_id: &str) -> Result<()>;

    /// Drop all timers of an execution, returning how many were removed
    async fn delete_timers_for_execution(&self, execution_id: &str) -> Result<usize>;

    /// Earliest pending `fire_at`, if any
    async fn next_fire_at(&self) -> Result<Option<DateTime<Utc>>>;
}

/// The set of stores a runtime is wired with
#[derive(Clone)]
pub struct Stores {
    pub history: Arc<dyn HistoryStore>,
    pub executions: Arc<dyn ExecutionStore>,
    pub timers: Arc<dyn TimerStore>,
}

impl Stores {
    /// Use one backend for every concern
    pub fn from_backend<B>(backend: B) -> Self
    where
        B: HistoryStore + ExecutionStore + TimerStore + 'static,
    {
        let backend = Arc::new(backend);
        Self {
            history: backend.clone(),
            executions: backend.clone(),
            timers: backend,
        }
    }

    pub fn in_memory() -> Self {
        Self::from_backend(InMemoryStore::new())
    }
}
