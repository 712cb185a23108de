use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::time::Duration;
use tracing::info;

use super::NOTIFY;
use crate::context::{WorkflowContext, WorkflowError};
use crate::workflows::Workflow;

/// `[count, delay, url]` or `{"count", "delay", "url"}`; `delay` is in minutes
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum CountdownArgs {
    Positional(u32, u64, String),
    Named { count: u32, delay: u64, url: String },
}

impl CountdownArgs {
    fn into_parts(self) -> (u32, u64, String) {
        match self {
            CountdownArgs::Positional(count, delay, url) => (count, delay, url),
            CountdownArgs::Named { count, delay, url } => (count, delay, url),
        }
    }
}

pub struct Countdown;

#[async_trait]
impl Workflow for Countdown {
    async fn run(
        &self,
        ctx: &mut WorkflowContext<'_>,
        args: JsonValue,
    ) -> Result<JsonValue, WorkflowError> {
        let (count, delay, url) = serde_json::from_value::<CountdownArgs>(args)?.into_parts();
        if !ctx.is_replaying() {
            info!(execution_id = ctx.id(), url = %url, count, delay, "Countdown started");
        }

        for i in (1..=count).rev() {
            ctx.run(NOTIFY, json!([url, format!("Countdown: {}", i)]))
                .await?;
            ctx.sleep(Duration::from_secs(delay.saturating_mul(60))).await?;
        }
        ctx.run(NOTIFY, json!([url, "Done"])).await?;

        Ok(JsonValue::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_accept_both_shapes() {
        let positional: CountdownArgs = serde_json::from_value(json!([3, 1, "http://n"])).unwrap();
        let named: CountdownArgs =
            serde_json::from_value(json!({"count": 3, "delay": 1, "url": "http://n"})).unwrap();
        assert_eq!(positional.into_parts(), named.into_parts());
    }
}
