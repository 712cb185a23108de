//! The handle a workflow uses to reach the outside world.
//!
//! Every `run`, `sleep` and `rpc` call is a numbered suspension point. On
//! replay the recorded outcome at that index is returned without repeating
//! the work; past the end of history the call is dispatched for real and
//! either completes inline (side effects, already finished children) or
//! suspends the workflow until its promise settles.

use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::Error;
use crate::executor::Executor;
use crate::timers;
use crate::types::{
    rpc_input, run_input, sleep_input, ErrorInfo, Execution, PendingStep, StepKind, StepOutcome,
    StepRecord,
};

/// Error surfaced to workflow code by a suspension point.
///
/// `Step` is a failure the workflow may handle. `Interrupted` means the
/// runtime has taken over (the workflow suspended or failed fatally) and it
/// should return as soon as possible; swallowing it changes nothing.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WorkflowError {
    #[error("{0}")]
    Step(ErrorInfo),

    #[error("Execution interrupted")]
    Interrupted,
}

impl WorkflowError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        WorkflowError::Step(ErrorInfo::new(kind, message))
    }
}

impl From<ErrorInfo> for WorkflowError {
    fn from(error: ErrorInfo) -> Self {
        WorkflowError::Step(error)
    }
}

impl From<serde_json::Error> for WorkflowError {
    fn from(error: serde_json::Error) -> Self {
        WorkflowError::new("SerializationError", error.to_string())
    }
}

/// Why the current advance stopped early
#[derive(Debug)]
pub(crate) enum Interrupt {
    /// Waiting on a pending promise
    Suspended,
    /// Raised by the runtime; fatal errors fail the execution, anything
    /// else aborts the advance
    Failed(Error),
}

pub struct WorkflowContext<'a> {
    executor: &'a Executor,
    execution: &'a Execution,
    history: BTreeMap<u32, StepRecord>,
    cursor: u32,
    interrupt: Option<Interrupt>,
}

impl<'a> WorkflowContext<'a> {
    pub(crate) fn new(
        executor: &'a Executor,
        execution: &'a Execution,
        history: Vec<StepRecord>,
    ) -> Self {
        Self {
            executor,
            execution,
            history: history.into_iter().map(|r| (r.index, r)).collect(),
            cursor: 0,
            interrupt: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.execution.id
    }

    pub fn workflow_name(&self) -> &str {
        &self.execution.workflow_name
    }

    /// Nesting depth; top-level executions are at depth 0
    pub fn depth(&self) -> u32 {
        self.execution.depth
    }

    /// True while the next suspension point has a recorded outcome
    pub fn is_replaying(&self) -> bool {
        self.history.contains_key(&self.cursor)
    }

    /// Invoke a registered side effect, at most once per step.
    pub async fn run(&mut self, function: &str, args: JsonValue) -> Result<JsonValue, WorkflowError> {
        let step = self.next_step(StepKind::Run, run_input(function, &args))?;
        if let Some(outcome) = self.replay(&step)? {
            return outcome.into_result().map_err(WorkflowError::Step);
        }

        match self.executor.run_side_effect(&step, function, args).await {
            Ok(outcome) => outcome.into_result().map_err(WorkflowError::Step),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Suspend for `duration` on a durable timer.
    ///
    /// The timer survives restarts; the workflow resumes at or after its
    /// fire time, never before.
    pub async fn sleep(&mut self, duration: Duration) -> Result<(), WorkflowError> {
        let duration_ms = timers::duration_millis(duration);
        let step = self.next_step(StepKind::Sleep, sleep_input(duration_ms))?;
        if let Some(outcome) = self.replay(&step)? {
            return outcome.into_result().map(|_| ()).map_err(WorkflowError::Step);
        }

        match self.executor.start_timer(&step, duration).await {
            Ok(Some(outcome)) => outcome.into_result().map(|_| ()).map_err(WorkflowError::Step),
            Ok(None) => Err(self.suspend()),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Invoke another workflow and wait for its result.
    ///
    /// A failed child surfaces as `WorkflowError::Step` carrying the child's
    /// error.
    pub async fn rpc(&mut self, workflow: &str, args: JsonValue) -> Result<JsonValue, WorkflowError> {
        let step = self.next_step(StepKind::Rpc, rpc_input(workflow, &args))?;
        if let Some(outcome) = self.replay(&step)? {
            return outcome.into_result().map_err(WorkflowError::Step);
        }

        match self
            .executor
            .start_invocation(self.execution, &step, workflow, args)
            .await
        {
            Ok(Some(outcome)) => outcome.into_result().map_err(WorkflowError::Step),
            Ok(None) => Err(self.suspend()),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn next_step(&mut self, kind: StepKind, input: JsonValue) -> Result<PendingStep, WorkflowError> {
        if self.interrupt.is_some() {
            return Err(WorkflowError::Interrupted);
        }
        let index = self.cursor;
        self.cursor += 1;
        Ok(PendingStep {
            execution_id: self.execution.id.clone(),
            index,
            kind,
            input,
        })
    }

    /// Recorded outcome for `step`, or `None` past the end of history
    fn replay(&mut self, step: &PendingStep) -> Result<Option<StepOutcome>, WorkflowError> {
        let mismatch = match self.history.get(&step.index) {
            None => return Ok(None),
            Some(record) if record.kind == step.kind && record.input == step.input => {
                return Ok(Some(record.outcome.clone()));
            }
            Some(record) => Error::NonDeterminism {
                execution_id: step.execution_id.clone(),
                index: step.index,
                recorded: describe(record.kind, &record.input),
                requested: describe(step.kind, &step.input),
            },
        };
        Err(self.fail(mismatch))
    }

    fn suspend(&mut self) -> WorkflowError {
        self.interrupt.get_or_insert(Interrupt::Suspended);
        WorkflowError::Interrupted
    }

    fn fail(&mut self, error: Error) -> WorkflowError {
        if self.interrupt.is_none() {
            self.interrupt = Some(Interrupt::Failed(error));
        }
        WorkflowError::Interrupted
    }

    /// Where replay stopped, the interrupt (if any) and the history it saw
    pub(crate) fn into_parts(self) -> (u32, Option<Interrupt>, BTreeMap<u32, StepRecord>) {
        (self.cursor, self.interrupt, self.history)
    }
}

pub(crate) fn describe(kind: StepKind, input: &JsonValue) -> String {
    let kind = serde_json::to_value(kind)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    format!("{}({})", kind, input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_describe_step() {
        let input = run_input("notify", &json!(["u", "Done"]));
        assert_eq!(
            describe(StepKind::Run, &input),
            r#"run({"args":["u","Done"],"function":"notify"})"#
        );
    }

    #[test]
    fn test_serde_errors_are_step_failures() {
        let err = serde_json::from_value::<u64>(json!("x")).unwrap_err();
        let err = WorkflowError::from(err);
        assert!(matches!(err, WorkflowError::Step(info) if info.kind == "SerializationError"));
    }
}
