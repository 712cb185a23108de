//! Durable timers
//!
//! A `sleep` persists a timer row before the workflow suspends. Any sweep
//! after `fire_at` (including the first one after a restart) picks it up;
//! the executor resolves the promise and records the step. Timers never
//! fire early, only at or after their `fire_at`.

use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::clock::Clock;
use crate::error::Result;
use crate::store::TimerStore;
use crate::types::{PendingStep, StepKind, Timer};

pub struct TimerService {
    store: Arc<dyn TimerStore>,
    clock: Arc<dyn Clock>,
    batch_size: usize,
}

impl TimerService {
    pub fn new(store: Arc<dyn TimerStore>, clock: Arc<dyn Clock>, batch_size: usize) -> Self {
        Self {
            store,
            clock,
            batch_size: batch_size.max(1),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Persist the timer for a sleep step.
    ///
    /// Idempotent: re-driving a suspended workflow keeps the original `fire_at`.
    pub async fn schedule(&self, execution_id: &str, index: u32, duration: Duration) -> Result<Timer> {
        let duration_ms = duration_millis(duration);
        let now = self.clock.now();
        let fire_at = chrono::Duration::from_std(duration)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let timer = self
            .store
            .schedule_timer(Timer {
                promise_id: crate::types::step_id(execution_id, index),
                execution_id: execution_id.to_string(),
                step_index: index,
                fire_at,
                duration_ms,
            })
            .await?;

        debug!(
            execution_id,
            step_index = index,
            fire_at = %timer.fire_at,
            "Timer scheduled"
        );
        Ok(timer)
    }

    /// Timers whose `fire_at` has passed, oldest first
    pub async fn due(&self) -> Result<Vec<Timer>> {
        self.store.due_timers(self.clock.now(), self.batch_size).await
    }

    pub async fn remove(&self, promise_id: &str) -> Result<()> {
        self.store.delete_timer(promise_id).await
    }

    /// Drop the timers of a terminated execution
    pub async fn cancel_for_execution(&self, execution_id: &str) -> Result<usize> {
        let removed = self.store.delete_timers_for_execution(execution_id).await?;
        if removed > 0 {
            debug!(execution_id, removed, "Dropped timers of terminated execution");
        }
        Ok(removed)
    }

    /// Time until the next timer is due, if any is pending
    pub async fn until_next(&self) -> Result<Option<Duration>> {
        let next = self.store.next_fire_at().await?;
        Ok(next.map(|fire_at| (fire_at - self.clock.now()).to_std().unwrap_or(Duration::ZERO)))
    }
}

/// Whole milliseconds, saturating at `u64::MAX`
pub fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Value a fired timer resolves its promise with
pub fn elapsed_value(fired_at: DateTime<Utc>) -> JsonValue {
    json!({ "elapsed": true, "fired_at": fired_at.to_rfc3339() })
}

/// The sleep step a timer belongs to
pub fn pending_step(timer: &Timer) -> PendingStep {
    PendingStep {
        execution_id: timer.execution_id.clone(),
        index: timer.step_index,
        kind: StepKind::Sleep,
        input: crate::types::sleep_input(timer.duration_ms),
    }
}
