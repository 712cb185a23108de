//! Ready queue of executions waiting to be advanced.
//!
//! An execution is queued at most once at a time; pushing it again while it
//! is queued is a no-op. Once popped it can be queued again, which is how a
//! promise settling during an advance schedules the next one.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

#[derive(Default)]
struct QueueState {
    order: VecDeque<String>,
    queued: HashSet<String>,
}

#[derive(Default)]
pub struct ReadyQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue an execution; returns false if it was already queued
    pub fn push(&self, execution_id: impl Into<String>) -> bool {
        let execution_id = execution_id.into();
        let added = {
            let mut state = self.state();
            if state.queued.insert(execution_id.clone()) {
                state.order.push_back(execution_id);
                true
            } else {
                false
            }
        };
        if added {
            self.notify.notify_one();
        }
        added
    }

    pub fn pop(&self) -> Option<String> {
        let mut state = self.state();
        let execution_id = state.order.pop_front()?;
        state.queued.remove(&execution_id);
        Some(execution_id)
    }

    pub fn len(&self) -> usize {
        self.state().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves after the next push (or immediately if a push happened
    /// since the last wakeup)
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }
}
