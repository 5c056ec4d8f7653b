use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use crate::repositories::{CompletionOutcome, TaskCompletion};

/// Told about every persisted task result. Failures are logged by the caller
/// and never change the task.
#[async_trait]
pub(crate) trait ResultNotifier: Send + Sync {
    async fn notify(&self, completion: &TaskCompletion) -> Result<()>;
}

#[derive(Debug, Clone)]
pub(crate) struct WebhookNotifier {
    client: Client,
    base_url: String,
}

impl WebhookNotifier {
    pub(crate) fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build webhook HTTP client")?;

        Ok(Self { client, base_url: base_url.trim_end_matches('/').to_string() })
    }
}

#[async_trait]
impl ResultNotifier for WebhookNotifier {
    async fn notify(&self, completion: &TaskCompletion) -> Result<()> {
        let (url, payload) = webhook_request(&self.base_url, completion);
        self.client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("Failed to reach result webhook {url}"))?
            .error_for_status()
            .with_context(|| format!("Result webhook {url} rejected the notification"))?;

        tracing::debug!(task_id = %completion.task_id, url = %url, "Result webhook notified");
        Ok(())
    }
}

fn webhook_request(base_url: &str, completion: &TaskCompletion) -> (String, Value) {
    let status = completion.status().as_str();
    match &completion.outcome {
        CompletionOutcome::Succeeded { score, feedback } => (
            format!("{base_url}/{}/results", completion.task_id),
            json!({
                "task_id": completion.task_id,
                "status": status,
                "result": {
                    "score": score,
                    "feedback": feedback,
                    "model": completion.model,
                    "attempts": completion.attempts,
                }
            }),
        ),
        CompletionOutcome::Failed { kind, detail } => (
            format!("{base_url}/{}/error", completion.task_id),
            json!({
                "task_id": completion.task_id,
                "status": status,
                "error": {"kind": kind.as_str(), "detail": detail},
            }),
        ),
    }
}
