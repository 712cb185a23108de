use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

/// The suspension point a step record was produced by
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    /// Side-effect call
    Run,
    /// Durable timer
    Sleep,
    /// Nested workflow invocation
    Rpc,
    /// The workflow function returned or threw
    Return,
}

/// JSON-serializable error carried in step outcomes and execution results
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorInfo {
    pub kind: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", content = "value", rename_all = "lowercase")]
pub enum StepOutcome {
    Success(JsonValue),
    Failure(ErrorInfo),
}

impl StepOutcome {
    pub fn into_result(self) -> Result<JsonValue, ErrorInfo> {
        match self {
            StepOutcome::Success(value) => Ok(value),
            StepOutcome::Failure(error) => Err(error),
        }
    }
}

/// One entry of an execution's append-only history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: u32,
    pub kind: StepKind,
    pub input: JsonValue,
    pub outcome: StepOutcome,
    pub completed_at: DateTime<Utc>,
}

impl StepRecord {
    /// Two records describe the same step if everything but the completion
    /// timestamp matches.
    pub fn same_content(&self, other: &StepRecord) -> bool {
        self.index == other.index
            && self.kind == other.kind
            && self.input == other.input
            && self.outcome == other.outcome
    }
}

/// Links a child execution to the suspension point of its parent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InvocationEdge {
    pub execution_id: String,
    pub step_index: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub workflow_name: String,
    pub args: JsonValue,
    pub status: ExecutionStatus,

    pub result: Option<JsonValue>,
    pub error: Option<ErrorInfo>,

    pub parent: Option<InvocationEdge>,
    pub depth: u32,

    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Execution {
    pub fn new(id: impl Into<String>, workflow_name: impl Into<String>, args: JsonValue) -> Self {
        Self {
            id: id.into(),
            workflow_name: workflow_name.into(),
            args,
            status: ExecutionStatus::Running,
            result: None,
            error: None,
            parent: None,
            depth: 0,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Terminal outcome, if the execution has finished
    pub fn outcome(&self) -> Option<StepOutcome> {
        match self.status {
            ExecutionStatus::Running => None,
            ExecutionStatus::Completed => Some(StepOutcome::Success(
                self.result.clone().unwrap_or(JsonValue::Null),
            )),
            ExecutionStatus::Failed => Some(StepOutcome::Failure(self.error.clone().unwrap_or_else(
                || ErrorInfo::new("UnknownError", "execution failed without an error"),
            ))),
        }
    }
}

/// A durable timer backing a `sleep` suspension point
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Timer {
    pub promise_id: String,
    pub execution_id: String,
    pub step_index: u32,
    pub fire_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// A suspension point whose outcome has not been recorded yet.
///
/// Carries everything needed to append the step record once the promise
/// settles, even if the in-memory promise was lost to a restart.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingStep {
    pub execution_id: String,
    pub index: u32,
    pub kind: StepKind,
    pub input: JsonValue,
}

impl PendingStep {
    pub fn promise_id(&self) -> String {
        step_id(&self.execution_id, self.index)
    }

    pub fn into_record(self, outcome: StepOutcome, completed_at: DateTime<Utc>) -> StepRecord {
        StepRecord {
            index: self.index,
            kind: self.kind,
            input: self.input,
            outcome,
            completed_at,
        }
    }
}

/// Deterministic id of step `index` of an execution.
///
/// Used both as the promise id and, for nested invocations, as the child
/// execution id, so replay regenerates the same ids.
pub fn step_id(execution_id: &str, index: u32) -> String {
    format!("{}.{}", execution_id, index)
}

pub fn run_input(function: &str, args: &JsonValue) -> JsonValue {
    serde_json::json!({ "function": function, "args": args })
}

pub fn sleep_input(duration_ms: u64) -> JsonValue {
    serde_json::json!({ "duration_ms": duration_ms })
}

pub fn rpc_input(workflow: &str, args: &JsonValue) -> JsonValue {
    serde_json::json!({ "workflow": workflow, "args": args })
}

/// Inbound request forwarded by the transport adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationRequest {
    #[serde(default)]
    pub task_id: Option<String>,
    pub workflow_name: String,
    #[serde(default)]
    pub args: JsonValue,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum InvocationResponse {
    Completed { id: String, value: JsonValue },
    Failed { id: String, error: ErrorInfo },
    Pending { id: String },
}

impl InvocationResponse {
    pub fn from_execution(execution: &Execution) -> Self {
        match execution.outcome() {
            Some(StepOutcome::Success(value)) => InvocationResponse::Completed {
                id: execution.id.clone(),
                value,
            },
            Some(StepOutcome::Failure(error)) => InvocationResponse::Failed {
                id: execution.id.clone(),
                error,
            },
            None => InvocationResponse::Pending {
                id: execution.id.clone(),
            },
        }
    }

    pub fn id(&self) -> &str {
        match self {
            InvocationResponse::Completed { id, .. }
            | InvocationResponse::Failed { id, .. }
            | InvocationResponse::Pending { id } => id,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionListFilter {
    pub status: Option<ExecutionStatus>,
    pub workflow_name: Option<String>,
    pub limit: Option<i64>,
}
