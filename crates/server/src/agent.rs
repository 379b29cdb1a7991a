use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dispatch::CommandExecutor;
use shared::domain::BatchDispatch;

const DISPATCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Forwards accepted batches to a remote agent over HTTP. The agent runs
/// the commands and reports each one back through the result-ingest
/// endpoint; this side never waits for execution.
pub struct HttpCommandExecutor {
    http: reqwest::Client,
    agent_url: String,
}

impl HttpCommandExecutor {
    pub fn new(agent_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            agent_url: agent_url.into(),
        }
    }
}

#[async_trait]
impl CommandExecutor for HttpCommandExecutor {
    async fn execute(&self, dispatch: BatchDispatch) -> Result<bool> {
        let mut request = self
            .http
            .post(format!("{}/execute", self.agent_url))
            .timeout(DISPATCH_TIMEOUT)
            .json(&dispatch);
        if let Some(token) = &dispatch.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("failed to reach agent at {}", self.agent_url))?;
        Ok(response.status().is_success())
    }
}
