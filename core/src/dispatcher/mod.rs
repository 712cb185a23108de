//! Dispatcher
//!
//! Entry point for inbound invocation requests and the driver of the ready
//! queue. `invoke` creates (or finds) the execution named by the request and
//! drives it until it finishes or suspends on something that is not ready
//! yet. `run_worker` keeps draining the queue and firing timers until shut
//! down, which is how suspended executions make progress.


use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::{Config, RuntimeConfig};
use crate::error::{Error, Result};
use crate::executor::{Advance, Executor};
use crate::store::Stores;
use crate::types::{
    Execution, ExecutionListFilter, ExecutionStatus, InvocationRequest, InvocationResponse,
    StepOutcome, StepRecord,
};
use crate::workflows::WorkflowRegistry;

/// What one `drain` accomplished
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub advanced: usize,
    pub timers_fired: usize,
    pub errors: usize,
}

pub struct Dispatcher {
    executor: Arc<Executor>,
    config: RuntimeConfig,
}

impl Dispatcher {
    pub fn new(stores: Stores, registry: WorkflowRegistry, config: &Config) -> Self {
        Self::with_clock(stores, registry, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        stores: Stores,
        registry: WorkflowRegistry,
        config: &Config,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let executor = Executor::new(stores, Arc::new(registry), config, clock);
        Self {
            executor: Arc::new(executor),
            config: config.runtime.clone(),
        }
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Handle an invocation request.
    ///
    /// Re-delivering a request with the same task id never starts a second
    /// execution: a finished one answers with its stored result, a running
    /// one is driven further.
    pub async fn invoke(&self, request: InvocationRequest) -> Result<InvocationResponse> {
        let execution = self.start(request).await?;
        if execution.status.is_terminal() {
            info!(execution_id = %execution.id, "Execution already finished, returning stored result");
            return Ok(InvocationResponse::from_execution(&execution));
        }

        self.drain().await?;

        let execution = self
            .execution(&execution.id)
            .await?
            .ok_or_else(|| Error::ExecutionNotFound(execution.id.clone()))?;
        Ok(InvocationResponse::from_execution(&execution))
    }

    /// Create (or find) the execution for a request and queue it without
    /// driving it
    pub async fn start(&self, request: InvocationRequest) -> Result<Execution> {
        let id = request
            .task_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let stores = self.executor.stores();
        let (execution, created) = stores
            .executions
            .create_execution(Execution::new(&id, &request.workflow_name, request.args))
            .await?;

        // Ids derived for nested executions are not valid task ids
        if !created && execution.parent.is_some() {
            return Err(Error::IdCollision(id));
        }

        if execution.workflow_name != request.workflow_name {
            return Err(Error::ExecutionMismatch {
                id,
                existing: execution.workflow_name,
                requested: request.workflow_name,
            });
        }

        if created {
            info!(execution_id = %id, workflow = %execution.workflow_name, "Execution started");
        }
        if !execution.status.is_terminal() {
            self.executor.promises().create(&id);
            self.executor.queue().push(id);
        }
        Ok(execution)
    }

    /// Advance queued executions and fire due timers until nothing is ready
    pub async fn drain(&self) -> Result<DrainStats> {
        let mut stats = DrainStats::default();

        loop {
            while let Some(execution_id) = self.executor.queue().pop() {
                match self.executor.advance(&execution_id).await {
                    Ok(_) => stats.advanced += 1,
                    Err(e) => {
                        warn!(execution_id = %execution_id, error = %e, "Advance failed, will retry on recovery");
                        stats.errors += 1;
                    }
                }
            }

            let fired = self.executor.fire_due_timers().await?;
            stats.timers_fired += fired;
            if fired == 0 && self.executor.queue().is_empty() {
                break;
            }
        }

        debug!(
            advanced = stats.advanced,
            timers_fired = stats.timers_fired,
            errors = stats.errors,
            "Drained ready queue"
        );
        Ok(stats)
    }

    /// Queue every running execution, as after a restart.
    ///
    /// Replay brings each one back to its last suspension point; timers
    /// that came due meanwhile fire on the next sweep.
    pub async fn recover(&self) -> Result<usize> {
        let running = self
            .executor
            .stores()
            .executions
            .list_executions(ExecutionListFilter {
                status: Some(ExecutionStatus::Running),
                ..Default::default()
            })
            .await?;

        let count = running.len();
        for execution in running {
            self.executor.promises().create(&execution.id);
            self.executor.queue().push(execution.id);
        }
        if count > 0 {
            info!(count, "Recovered running executions");
        }
        Ok(count)
    }

    /// Drive executions until `shutdown` is cancelled.
    ///
    /// Up to `worker_concurrency` executions advance in parallel. Timers are
    /// swept every `sweep_interval_ms`; advances that hit a storage error
    /// are queued again on the next sweep.
    pub async fn run_worker(&self, shutdown: CancellationToken) -> Result<()> {
        self.recover().await?;

        let semaphore = Arc::new(Semaphore::new(self.config.worker_concurrency.max(1)));
        let mut sweep = tokio::time::interval(Duration::from_millis(
            self.config.sweep_interval_ms.max(1),
        ));
        let mut tasks: JoinSet<Option<String>> = JoinSet::new();
        let mut failed: Vec<String> = Vec::new();

        info!(
            concurrency = self.config.worker_concurrency,
            sweep_interval_ms = self.config.sweep_interval_ms,
            "Worker started"
        );

        while !shutdown.is_cancelled() {
            while let Some(execution_id) = self.executor.queue().pop() {
                let permit = tokio::select! {
                    permit = semaphore.clone().acquire_owned() => permit.ok(),
                    _ = shutdown.cancelled() => None,
                };
                let Some(permit) = permit else {
                    self.executor.queue().push(execution_id);
                    break;
                };

                let executor = self.executor.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    match executor.advance(&execution_id).await {
                        Ok(Advance::Suspended) | Ok(Advance::Finished(_)) => None,
                        Err(e) => {
                            warn!(execution_id = %execution_id, error = %e, "Advance failed");
                            Some(execution_id)
                        }
                    }
                });
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.executor.queue().notified() => {}
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    match joined {
                        Ok(Some(execution_id)) => failed.push(execution_id),
                        Ok(None) => {}
                        Err(e) => error!(error = %e, "Advance task panicked"),
                    }
                }
                _ = sweep.tick() => {
                    for execution_id in failed.drain(..) {
                        self.executor.queue().push(execution_id);
                    }
                    if let Err(e) = self.executor.fire_due_timers().await {
                        warn!(error = %e, "Timer sweep failed");
                    }
                }
            }
        }

        info!(in_flight = tasks.len(), "Worker stopping, waiting for in-flight advances");
        while tasks.join_next().await.is_some() {}
        info!("Worker stopped");
        Ok(())
    }

    /// Wait for an execution to finish and return its outcome.
    ///
    /// Settlement in this runtime wakes the waiter right away. The store is
    /// polled every `sweep_interval_ms` as well, since another runtime may
    /// finish the execution.
    pub async fn wait(&self, execution_id: &str) -> Result<StepOutcome> {
        let execution = self
            .execution(execution_id)
            .await?
            .ok_or_else(|| Error::ExecutionNotFound(execution_id.to_string()))?;
        if let Some(outcome) = execution.outcome() {
            return Ok(outcome);
        }

        self.executor.promises().create(execution_id);
        let settled = self.executor.promises().wait(execution_id);
        tokio::pin!(settled);
        let mut settled_done = false;
        let mut poll = tokio::time::interval(Duration::from_millis(
            self.config.sweep_interval_ms.max(1),
        ));

        loop {
            tokio::select! {
                outcome = &mut settled, if !settled_done => match outcome {
                    // Dropped after settling; the store has the outcome
                    Err(Error::PromiseNotFound(_)) => settled_done = true,
                    other => {
                        self.executor.promises().forget(execution_id);
                        return other;
                    }
                },
                _ = poll.tick() => {}
            }

            let execution = self
                .execution(execution_id)
                .await?
                .ok_or_else(|| Error::ExecutionNotFound(execution_id.to_string()))?;
            if let Some(outcome) = execution.outcome() {
                return Ok(outcome);
            }
        }
    }

    /// Cancel an execution and its running children
    pub async fn cancel(&self, execution_id: &str) -> Result<bool> {
        self.executor.cancel(execution_id).await
    }

    pub async fn execution(&self, execution_id: &str) -> Result<Option<Execution>> {
        self.executor
            .stores()
            .executions
            .get_execution(execution_id)
            .await
    }

    pub async fn history(&self, execution_id: &str) -> Result<Vec<StepRecord>> {
        self.executor.stores().history.read(execution_id).await
    }

    pub async fn list(&self, filter: ExecutionListFilter) -> Result<Vec<Execution>> {
        self.executor.stores().executions.list_executions(filter).await
    }

    pub async fn children(&self, execution_id: &str) -> Result<Vec<Execution>> {
        self.executor
            .stores()
            .executions
            .list_children(execution_id)
            .await
    }
}
