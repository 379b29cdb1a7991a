use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::domain::BatchDispatch;
use tokio::sync::mpsc;

/// The external executor seam. `Ok(true)` means the batch was accepted and
/// results will eventually be published; `Ok(false)` means it was refused;
/// `Err` means the executor could not be reached. How (or whether) commands
/// run concurrently is the executor's business.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, dispatch: BatchDispatch) -> Result<bool>;
}

/// Placeholder wiring for contexts without an executor.
pub struct MissingCommandExecutor;

#[async_trait]
impl CommandExecutor for MissingCommandExecutor {
    async fn execute(&self, dispatch: BatchDispatch) -> Result<bool> {
        Err(anyhow!(
            "command executor is unavailable for batch {}",
            dispatch.batch_id
        ))
    }
}

/// Hands accepted batches to an in-process queue. Whatever consumes the
/// receiver plays the role of the remote agent and reports back through
/// `Dispatcher::publish_result`.
pub struct QueueCommandExecutor {
    sender: mpsc::UnboundedSender<BatchDispatch>,
}

impl QueueCommandExecutor {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BatchDispatch>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl CommandExecutor for QueueCommandExecutor {
    async fn execute(&self, dispatch: BatchDispatch) -> Result<bool> {
        self.sender
            .send(dispatch)
            .map_err(|_| anyhow!("command queue consumer is gone"))?;
        Ok(true)
    }
}
