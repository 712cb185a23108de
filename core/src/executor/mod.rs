//! Workflow executor
//!
//! Advancing an execution replays its workflow function from the start
//! against the recorded history. Recorded suspension points return their
//! stored outcomes; the first unrecorded one is dispatched. Side effects and
//! already-finished children are recorded inline and replay continues;
//! timers and running children suspend the execution until their promise
//! settles, which appends the step record and queues the execution again.
//!
//! A workflow that returns gets a final `return` record, then the execution
//! is finished and its own promise settled, which for nested executions is
//! the awaiting step of the parent.

mod locks;


use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::{Config, RetryConfig};
use crate::context::{describe, Interrupt, WorkflowContext, WorkflowError};
use crate::coordinator::InvocationCoordinator;
use crate::error::{Error, Result};
use crate::promises::PromiseRegistry;
use crate::queue::ReadyQueue;
use crate::store::Stores;
use crate::timers::{self, TimerService};
use crate::types::{ErrorInfo, Execution, PendingStep, StepKind, StepOutcome, StepRecord};
use crate::workflows::WorkflowRegistry;

use locks::ExecutionLocks;

/// Result of advancing an execution once
#[derive(Debug, Clone, PartialEq)]
pub enum Advance {
    /// Waiting on a timer or a nested execution
    Suspended,
    /// Terminal, either now or before this advance
    Finished(StepOutcome),
}

pub struct Executor {
    stores: Stores,
    registry: Arc<WorkflowRegistry>,
    promises: Arc<PromiseRegistry>,
    timers: TimerService,
    coordinator: InvocationCoordinator,
    queue: Arc<ReadyQueue>,
    retry: RetryConfig,
    clock: Arc<dyn Clock>,
    locks: ExecutionLocks,
    /// Owner name of this runtime's execution claims
    runtime_id: String,
    claim_lease: Duration,
    claim_poll: Duration,
}

impl Executor {
    pub fn new(
        stores: Stores,
        registry: Arc<WorkflowRegistry>,
        config: &Config,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let queue = Arc::new(ReadyQueue::new());
        let timers = TimerService::new(
            stores.timers.clone(),
            clock.clone(),
            config.runtime.timer_batch_size,
        );
        let coordinator = InvocationCoordinator::new(
            stores.executions.clone(),
            queue.clone(),
            config.runtime.max_depth,
        );

        Self {
            stores,
            registry,
            promises: Arc::new(PromiseRegistry::new()),
            timers,
            coordinator,
            queue,
            retry: config.retry.clone(),
            clock,
            locks: ExecutionLocks::default(),
            runtime_id: Uuid::new_v4().to_string(),
            claim_lease: Duration::from_millis(config.runtime.claim_lease_ms.max(3)),
            claim_poll: Duration::from_millis(config.runtime.claim_poll_ms.max(1)),
        }
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn promises(&self) -> &PromiseRegistry {
        &self.promises
    }

    pub fn queue(&self) -> &ReadyQueue {
        &self.queue
    }

    pub fn timers(&self) -> &TimerService {
        &self.timers
    }

    pub fn coordinator(&self) -> &InvocationCoordinator {
        &self.coordinator
    }

    pub fn runtime_id(&self) -> &str {
        &self.runtime_id
    }

    fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    /// Replay an execution up to its next suspension point or termination.
    ///
    /// Storage errors abort the advance and leave every record as it was;
    /// advancing again later is safe.
    pub async fn advance(&self, execution_id: &str) -> Result<Advance> {
        let _guard = self.locks.acquire(execution_id).await;

        let execution = self
            .stores
            .executions
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| Error::ExecutionNotFound(execution_id.to_string()))?;
        if let Some(outcome) = execution.outcome() {
            self.locks.release(execution_id);
            return Ok(Advance::Finished(outcome));
        }

        self.while_claimed(execution_id, self.replay(execution_id))
            .await
    }

    /// Run the workflow function against the recorded history. Callers hold
    /// the execution's claim.
    async fn replay(&self, execution_id: &str) -> Result<Advance> {
        // Another runtime may have finished it before the claim was granted
        let execution = self
            .stores
            .executions
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| Error::ExecutionNotFound(execution_id.to_string()))?;
        if let Some(outcome) = execution.outcome() {
            self.locks.release(execution_id);
            return Ok(Advance::Finished(outcome));
        }

        let Some(workflow) = self.registry.workflow(&execution.workflow_name) else {
            let err = Error::UnknownWorkflow(execution.workflow_name.clone());
            return self.fail(&execution, err).await;
        };

        let history = self.stores.history.read(execution_id).await?;
        let replayed = history.len();

        let mut ctx = WorkflowContext::new(self, &execution, history);
        let result = workflow.run(&mut ctx, execution.args.clone()).await;
        let (cursor, interrupt, history) = ctx.into_parts();

        match interrupt {
            Some(Interrupt::Suspended) => {
                debug!(execution_id, replayed, cursor, "Execution suspended");
                Ok(Advance::Suspended)
            }
            Some(Interrupt::Failed(e)) if e.is_fatal() => self.fail(&execution, e).await,
            Some(Interrupt::Failed(e)) => Err(e),
            None => self.complete(&execution, cursor, &history, result).await,
        }
    }

    /// Claim the execution in the store, run `work`, then release the claim.
    ///
    /// The claim keeps runtimes that share a store from advancing the same
    /// execution at once. It is renewed while `work` runs; a holder that
    /// crashed loses it once the lease expires.
    async fn while_claimed<T>(
        &self,
        execution_id: &str,
        work: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        self.claim(execution_id).await?;

        tokio::pin!(work);
        let mut renew = tokio::time::interval(self.claim_lease / 3);
        renew.tick().await;
        let result = loop {
            tokio::select! {
                result = &mut work => break result,
                _ = renew.tick() => {
                    match self.try_claim(execution_id).await {
                        Ok(true) => {}
                        Ok(false) => warn!(execution_id, "Claim taken over by another runtime"),
                        Err(e) => warn!(execution_id, error = %e, "Failed to renew claim"),
                    }
                }
            }
        };

        if let Err(e) = self
            .stores
            .executions
            .release_execution(execution_id, &self.runtime_id)
            .await
        {
            warn!(execution_id, error = %e, "Failed to release claim, it lapses with its lease");
        }
        result
    }

    /// Wait until this runtime holds the execution's claim
    async fn claim(&self, execution_id: &str) -> Result<()> {
        let mut contended = false;
        while !self.try_claim(execution_id).await? {
            if !contended {
                debug!(execution_id, "Execution claimed by another runtime, waiting");
                contended = true;
            }
            tokio::time::sleep(self.claim_poll).await;
        }
        Ok(())
    }

    async fn try_claim(&self, execution_id: &str) -> Result<bool> {
        let now = self.now();
        let expires_at = now
            + chrono::Duration::from_std(self.claim_lease)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
        self.stores
            .executions
            .claim_execution(execution_id, &self.runtime_id, now, expires_at)
            .await
    }

    /// The workflow function returned: record it and finish the execution
    async fn complete(
        &self,
        execution: &Execution,
        cursor: u32,
        history: &BTreeMap<u32, StepRecord>,
        result: std::result::Result<JsonValue, WorkflowError>,
    ) -> Result<Advance> {
        let outcome = match result {
            Ok(value) => StepOutcome::Success(value),
            Err(WorkflowError::Step(e)) => StepOutcome::Failure(e),
            Err(WorkflowError::Interrupted) => StepOutcome::Failure(ErrorInfo::new(
                "InterruptedError",
                "Workflow returned an interruption the runtime never raised",
            )),
        };

        // History past the return point means this run diverged from the recorded one
        if let Some(extra) = history
            .values()
            .find(|r| r.index > cursor || (r.index == cursor && r.kind != StepKind::Return))
        {
            let err = Error::NonDeterminism {
                execution_id: execution.id.clone(),
                index: extra.index,
                recorded: describe(extra.kind, &extra.input),
                requested: describe(StepKind::Return, &JsonValue::Null),
            };
            return self.fail(execution, err).await;
        }

        let step = PendingStep {
            execution_id: execution.id.clone(),
            index: cursor,
            kind: StepKind::Return,
            input: JsonValue::Null,
        };
        match self
            .stores
            .history
            .append(&execution.id, step.into_record(outcome.clone(), self.now()))
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_fatal() => return self.fail(execution, e).await,
            Err(e) => return Err(e),
        }

        self.finish(execution, outcome.clone()).await?;
        Ok(Advance::Finished(outcome))
    }

    async fn fail(&self, execution: &Execution, err: Error) -> Result<Advance> {
        error!(
            execution_id = %execution.id,
            workflow = %execution.workflow_name,
            error = %err,
            "Execution failed with a runtime error"
        );
        let outcome = StepOutcome::Failure(err.to_error_info());
        self.finish(execution, outcome.clone()).await?;
        Ok(Advance::Finished(outcome))
    }

    /// Move an execution to its terminal state and settle its promise.
    ///
    /// Callers hold the execution's lock.
    async fn finish(&self, execution: &Execution, outcome: StepOutcome) -> Result<bool> {
        let finished = self
            .stores
            .executions
            .finish_execution(&execution.id, &outcome, self.now())
            .await?;
        if !finished {
            return Ok(false);
        }

        match &outcome {
            StepOutcome::Success(_) => info!(
                execution_id = %execution.id,
                workflow = %execution.workflow_name,
                "Execution completed"
            ),
            StepOutcome::Failure(e) => info!(
                execution_id = %execution.id,
                workflow = %execution.workflow_name,
                error = %e,
                "Execution failed"
            ),
        }

        self.timers.cancel_for_execution(&execution.id).await?;
        let awaiting = self.coordinator.awaiting_step(execution);
        self.settle(&execution.id, awaiting, outcome).await?;
        self.locks.release(&execution.id);
        Ok(true)
    }

    /// Settle a promise and deliver the outcome to the step awaiting it.
    ///
    /// Returns true if a step record was appended. Late settlements (the
    /// owner is already terminal, or the step is already recorded) are
    /// dropped. Once delivered the promise itself is forgotten; a failed
    /// delivery keeps it so the next attempt reuses the settled outcome.
    pub(crate) async fn settle(
        &self,
        promise_id: &str,
        step: Option<PendingStep>,
        outcome: StepOutcome,
    ) -> Result<bool> {
        let outcome = self.settle_promise(promise_id, outcome)?;
        let delivered = match step {
            Some(step) => self.deliver(promise_id, step, outcome).await?,
            None => false,
        };
        self.promises.forget(promise_id);
        Ok(delivered)
    }

    async fn deliver(&self, promise_id: &str, step: PendingStep, outcome: StepOutcome) -> Result<bool> {
        match self.stores.executions.get_execution(&step.execution_id).await? {
            Some(owner) if !owner.status.is_terminal() => {}
            Some(_) => {
                debug!(promise_id, execution_id = %step.execution_id, "Owner already terminal, dropping settlement");
                return Ok(false);
            }
            None => {
                warn!(promise_id, execution_id = %step.execution_id, "Settlement for unknown execution dropped");
                return Ok(false);
            }
        }

        let history = self.stores.history.read(&step.execution_id).await?;
        if history.iter().any(|r| r.index == step.index) {
            debug!(promise_id, "Step already recorded");
            return Ok(false);
        }

        let execution_id = step.execution_id.clone();
        match self
            .stores
            .history
            .append(&execution_id, step.into_record(outcome, self.now()))
            .await
        {
            Ok(()) => {}
            // Recorded concurrently by a replay of the owner
            Err(Error::Conflict { .. }) => return Ok(false),
            Err(e) => return Err(e),
        }

        self.queue.push(execution_id);
        Ok(true)
    }

    /// First writer wins: returns the outcome the promise actually holds
    fn settle_promise(&self, promise_id: &str, outcome: StepOutcome) -> Result<StepOutcome> {
        match self.promises.settle(promise_id, outcome.clone()) {
            Ok(()) => Ok(outcome),
            Err(Error::AlreadyResolved(_)) => Ok(self
                .promises
                .get(promise_id)
                .and_then(|p| p.state.outcome())
                .unwrap_or(outcome)),
            Err(e) => Err(e),
        }
    }

    /// Record an outcome produced inline, during the advance itself
    async fn record(&self, step: &PendingStep, outcome: StepOutcome) -> Result<StepOutcome> {
        let promise_id = step.promise_id();
        let outcome = self.settle_promise(&promise_id, outcome)?;
        self.stores
            .history
            .append(
                &step.execution_id,
                step.clone().into_record(outcome.clone(), self.now()),
            )
            .await?;
        self.promises.forget(&promise_id);
        Ok(outcome)
    }

    pub(crate) async fn run_side_effect(
        &self,
        step: &PendingStep,
        function: &str,
        args: JsonValue,
    ) -> Result<StepOutcome> {
        let promise = self.promises.create(&step.promise_id());
        if let Some(outcome) = promise.state.outcome() {
            return self.record(step, outcome).await;
        }

        let effect = self
            .registry
            .function(function)
            .ok_or_else(|| Error::UnknownFunction(function.to_string()))?;
        let effect = effect.as_ref();
        let args = &args;

        let outcome = match self
            .retry
            .run
            .run(function, |_: &anyhow::Error| true, || effect.call(args.clone()))
            .await
        {
            Ok(value) => StepOutcome::Success(value),
            Err(e) => {
                warn!(
                    execution_id = %step.execution_id,
                    step_index = step.index,
                    function,
                    error = %e,
                    "Side effect failed"
                );
                StepOutcome::Failure(ErrorInfo::new("SideEffectError", format!("{:#}", e)))
            }
        };
        self.record(step, outcome).await
    }

    pub(crate) async fn start_timer(
        &self,
        step: &PendingStep,
        duration: Duration,
    ) -> Result<Option<StepOutcome>> {
        let promise = self.promises.create(&step.promise_id());
        if let Some(outcome) = promise.state.outcome() {
            return self.record(step, outcome).await.map(Some);
        }

        self.timers
            .schedule(&step.execution_id, step.index, duration)
            .await?;
        Ok(None)
    }

    pub(crate) async fn start_invocation(
        &self,
        parent: &Execution,
        step: &PendingStep,
        workflow: &str,
        args: JsonValue,
    ) -> Result<Option<StepOutcome>> {
        let promise = self.promises.create(&step.promise_id());
        if let Some(outcome) = promise.state.outcome() {
            return self.record(step, outcome).await.map(Some);
        }

        let args = &args;
        let child = self
            .retry
            .rpc
            .run(
                workflow,
                |e: &Error| !e.is_fatal(),
                || self.coordinator.invoke(parent, step.index, workflow, args.clone()),
            )
            .await?;

        match child.outcome() {
            Some(outcome) => self.record(step, outcome).await.map(Some),
            None => Ok(None),
        }
    }

    /// Fire every due timer, returning how many were processed
    pub async fn fire_due_timers(&self) -> Result<usize> {
        let due = self.timers.due().await?;
        let mut fired = 0;

        for timer in due {
            let fired_at = self.timers.now();
            debug!(
                promise_id = %timer.promise_id,
                execution_id = %timer.execution_id,
                fire_at = %timer.fire_at,
                "Timer fired"
            );
            let step = timers::pending_step(&timer);
            self.settle(
                &timer.promise_id,
                Some(step),
                StepOutcome::Success(timers::elapsed_value(fired_at)),
            )
            .await?;
            self.timers.remove(&timer.promise_id).await?;
            fired += 1;
        }
        Ok(fired)
    }

    /// Cancel an execution and, transitively, its running children.
    ///
    /// Returns false if the execution had already finished.
    pub async fn cancel(&self, execution_id: &str) -> Result<bool> {
        let cancelled = self.cancel_one(execution_id).await?;

        let mut pending = vec![execution_id.to_string()];
        while let Some(parent_id) = pending.pop() {
            for child in self.coordinator.running_children(&parent_id).await? {
                self.cancel_one(&child.id).await?;
                pending.push(child.id);
            }
        }
        Ok(cancelled)
    }

    async fn cancel_one(&self, execution_id: &str) -> Result<bool> {
        let _guard = self.locks.acquire(execution_id).await;
        let execution = self
            .stores
            .executions
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| Error::ExecutionNotFound(execution_id.to_string()))?;
        if execution.status.is_terminal() {
            self.locks.release(execution_id);
            return Ok(false);
        }

        self.while_claimed(execution_id, async {
            info!(execution_id, workflow = %execution.workflow_name, "Cancelling execution");
            let outcome =
                StepOutcome::Failure(ErrorInfo::new("Cancelled", "Execution was cancelled"));
            self.finish(&execution, outcome).await
        })
        .await
    }
}
