//! Workflow and side-effect registration
//!
//! A workflow is a resumable function driven by the executor through a
//! [`WorkflowContext`]. A side effect is an arbitrary async call whose
//! result the runtime records so it never runs twice for the same step.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::context::{WorkflowContext, WorkflowError};
use crate::error::{Error, Result};

/// A resumable workflow function.
///
/// `run` is re-entered from the beginning every time the execution resumes;
/// all I/O must go through the context so replay can feed recorded outcomes
/// back instead of repeating work.
#[async_trait]
pub trait Workflow: Send + Sync {
    async fn run(
        &self,
        ctx: &mut WorkflowContext<'_>,
        args: JsonValue,
    ) -> Result<JsonValue, WorkflowError>;
}

/// A side-effect provider invoked by `WorkflowContext::run`
#[async_trait]
pub trait SideEffect: Send + Sync {
    async fn call(&self, args: JsonValue) -> anyhow::Result<JsonValue>;
}

#[async_trait]
impl<F, Fut> SideEffect for F
where
    F: Fn(JsonValue) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<JsonValue>> + Send,
{
    async fn call(&self, args: JsonValue) -> anyhow::Result<JsonValue> {
        (self)(args).await
    }
}

/// Named workflows and side effects known to a runtime
#[derive(Default, Clone)]
pub struct WorkflowRegistry {
    workflows: HashMap<String, Arc<dyn Workflow>>,
    functions: HashMap<String, Arc<dyn SideEffect>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_workflow(
        &mut self,
        name: impl Into<String>,
        workflow: impl Workflow + 'static,
    ) -> Result<&mut Self> {
        let name = name.into();
        if self.workflows.contains_key(&name) {
            return Err(Error::DuplicateRegistration(name));
        }
        self.workflows.insert(name, Arc::new(workflow));
        Ok(self)
    }

    pub fn register_function(
        &mut self,
        name: impl Into<String>,
        function: impl SideEffect + 'static,
    ) -> Result<&mut Self> {
        let name = name.into();
        if self.functions.contains_key(&name) {
            return Err(Error::DuplicateRegistration(name));
        }
        self.functions.insert(name, Arc::new(function));
        Ok(self)
    }

    pub fn workflow(&self, name: &str) -> Option<Arc<dyn Workflow>> {
        self.workflows.get(name).cloned()
    }

    pub fn function(&self, name: &str) -> Option<Arc<dyn SideEffect>> {
        self.functions.get(name).cloned()
    }

    pub fn workflow_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.workflows.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
