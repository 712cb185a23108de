use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

/// One async lock per execution, so an execution is never advanced by two
/// tasks at once while different executions proceed in parallel.
#[derive(Default)]
pub(super) struct ExecutionLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ExecutionLocks {
    pub(super) async fn acquire(&self, execution_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(execution_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Forget the lock of a terminated execution
    pub(super) fn release(&self, execution_id: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.remove(execution_id);
    }

    #[cfg(test)]
    pub(super) fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
