use anyhow::{bail, Context};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::workflows::SideEffect;

/// POSTs a plain-text message to a URL (e.g. an ntfy.sh topic).
///
/// Arguments are `[url, message]`.
#[derive(Debug, Clone, Default)]
pub struct Notify {
    client: Client,
}

impl Notify {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SideEffect for Notify {
    async fn call(&self, args: JsonValue) -> anyhow::Result<JsonValue> {
        let (url, message): (String, String) =
            serde_json::from_value(args).context("notify expects [url, message]")?;

        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(message)
            .send()
            .await
            .with_context(|| format!("Failed to POST to {}", url))?;

        let status = response.status();
        if !status.is_success() {
            bail!("{} responded with {}", url, status);
        }
        debug!(url = %url, status = status.as_u16(), "Notification sent");
        Ok(JsonValue::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_rejects_malformed_args() {
        let err = Notify::new().call(json!({"url": "x"})).await.unwrap_err();
        assert!(err.to_string().contains("notify expects [url, message]"));
    }
}
