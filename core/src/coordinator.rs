//! Nested invocations
//!
//! A child execution's id is the parent's step id, so replaying the parent
//! regenerates it and re-invoking attaches to the existing child instead of
//! starting a second one. The edge back to the parent lives on the child row,
//! which lets a finished child find the step it has to settle even after a
//! restart.

use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::info;

use crate::error::{Error, Result};
use crate::queue::ReadyQueue;
use crate::store::ExecutionStore;
use crate::types::{rpc_input, step_id, Execution, InvocationEdge, PendingStep, StepKind};

pub struct InvocationCoordinator {
    executions: Arc<dyn ExecutionStore>,
    queue: Arc<ReadyQueue>,
    max_depth: u32,
}

impl InvocationCoordinator {
    pub fn new(executions: Arc<dyn ExecutionStore>, queue: Arc<ReadyQueue>, max_depth: u32) -> Self {
        Self {
            executions,
            queue,
            max_depth,
        }
    }

    /// Create (or find) the child execution for step `index` of `parent`
    pub async fn invoke(
        &self,
        parent: &Execution,
        index: u32,
        workflow: &str,
        args: JsonValue,
    ) -> Result<Execution> {
        let depth = parent.depth + 1;
        if depth > self.max_depth {
            return Err(Error::DepthExceeded {
                depth,
                max: self.max_depth,
            });
        }

        let edge = InvocationEdge {
            execution_id: parent.id.clone(),
            step_index: index,
        };
        let mut child = Execution::new(step_id(&parent.id, index), workflow, args);
        child.parent = Some(edge.clone());
        child.depth = depth;

        let (child, created) = self.executions.create_execution(child).await?;
        // A top-level execution invoked under this id beforehand
        if child.parent.as_ref() != Some(&edge) {
            return Err(Error::IdCollision(child.id));
        }
        if child.workflow_name != workflow {
            return Err(Error::ExecutionMismatch {
                id: child.id,
                existing: child.workflow_name,
                requested: workflow.to_string(),
            });
        }

        if created {
            info!(
                execution_id = %child.id,
                parent_id = %parent.id,
                workflow = %workflow,
                depth,
                "Started nested execution"
            );
            self.queue.push(child.id.clone());
        }
        Ok(child)
    }

    /// The parent step a finished child settles, if it has a parent
    pub fn awaiting_step(&self, child: &Execution) -> Option<PendingStep> {
        child.parent.as_ref().map(|edge| PendingStep {
            execution_id: edge.execution_id.clone(),
            index: edge.step_index,
            kind: StepKind::Rpc,
            input: rpc_input(&child.workflow_name, &child.args),
        })
    }

    pub async fn running_children(&self, parent_id: &str) -> Result<Vec<Execution>> {
        let children = self.executions.list_children(parent_id).await?;
        Ok(children
            .into_iter()
            .filter(|child| !child.status.is_terminal())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use serde_json::json;

    fn coordinator(max_depth: u32) -> (InvocationCoordinator, Arc<ReadyQueue>) {
        let queue = Arc::new(ReadyQueue::new());
        let coordinator =
            InvocationCoordinator::new(Arc::new(InMemoryStore::new()), queue.clone(), max_depth);
        (coordinator, queue)
    }

    #[tokio::test]
    async fn test_child_id_derives_from_parent_step() {
        let (coordinator, queue) = coordinator(8);
        let parent = Execution::new("f", "factorial", json!([4]));

        let child = coordinator
            .invoke(&parent, 0, "factorial", json!([3]))
            .await
            .unwrap();
        assert_eq!(child.id, "f.0");
        assert_eq!(child.depth, 1);
        assert_eq!(
            child.parent,
            Some(InvocationEdge {
                execution_id: "f".to_string(),
                step_index: 0
            })
        );
        assert_eq!(queue.pop().as_deref(), Some("f.0"));
    }

    #[tokio::test]
    async fn test_reinvoke_attaches_to_existing_child() {
        let (coordinator, queue) = coordinator(8);
        let parent = Execution::new("f", "factorial", json!([4]));

        coordinator.invoke(&parent, 0, "factorial", json!([3])).await.unwrap();
        queue.pop();
        let again = coordinator.invoke(&parent, 0, "factorial", json!([3])).await.unwrap();

        assert_eq!(again.id, "f.0");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_depth_limit() {
        let (coordinator, _) = coordinator(2);
        let mut parent = Execution::new("deep", "factorial", json!([9]));
        parent.depth = 2;

        let err = coordinator
            .invoke(&parent, 0, "factorial", json!([8]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DepthExceeded { depth: 3, max: 2 }));
    }

    #[tokio::test]
    async fn test_awaiting_step_rebuilds_rpc_input() {
        let (coordinator, _) = coordinator(8);
        let parent = Execution::new("f", "factorial", json!([4]));
        let child = coordinator.invoke(&parent, 2, "factorial", json!([3])).await.unwrap();

        let step = coordinator.awaiting_step(&child).unwrap();
        assert_eq!(step.promise_id(), child.id);
        assert_eq!(step.input, rpc_input("factorial", &json!([3])));
        assert!(coordinator.awaiting_step(&parent).is_none());
    }
}
