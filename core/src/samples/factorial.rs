use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};

use super::FACTORIAL;
use crate::context::{WorkflowContext, WorkflowError};
use crate::workflows::Workflow;

/// `factorial(n) = n * factorial(n - 1)`, each level its own execution
pub struct Factorial;

fn parse_n(args: JsonValue) -> Result<u64, WorkflowError> {
    match args {
        JsonValue::Array(mut items) if items.len() == 1 => Ok(serde_json::from_value(items.remove(0))?),
        other => Ok(serde_json::from_value(other)?),
    }
}

#[async_trait]
impl Workflow for Factorial {
    async fn run(
        &self,
        ctx: &mut WorkflowContext<'_>,
        args: JsonValue,
    ) -> Result<JsonValue, WorkflowError> {
        let n = parse_n(args)?;
        if n <= 1 {
            return Ok(json!(1));
        }

        let sub: u64 = serde_json::from_value(ctx.rpc(FACTORIAL, json!([n - 1])).await?)?;
        let value = n
            .checked_mul(sub)
            .ok_or_else(|| WorkflowError::new("OverflowError", format!("factorial({}) overflows u64", n)))?;
        Ok(json!(value))
    }
}
