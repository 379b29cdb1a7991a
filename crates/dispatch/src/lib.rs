use std::{sync::Arc, time::Duration};

use shared::{
    domain::{BatchDispatch, BatchId, Principal},
    error::DispatchError,
    protocol::{ResultEvent, StreamEvent},
};
use tracing::{debug, info, warn};

pub mod broker;
pub mod executor;
pub mod registry;

pub use broker::ResultBroker;
pub use executor::{CommandExecutor, MissingCommandExecutor, QueueCommandExecutor};
pub use registry::{BatchProgress, BatchRegistry, BatchStatusSnapshot};

/// Ties the registry, the broker, and the executor seam together. This is
/// the only place results enter the system, so per-batch bookkeeping and
/// fan-out cannot drift apart.
pub struct Dispatcher {
    registry: Arc<BatchRegistry>,
    broker: Arc<ResultBroker>,
    executor: Arc<dyn CommandExecutor>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<BatchRegistry>,
        broker: Arc<ResultBroker>,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self {
            registry,
            broker,
            executor,
        }
    }

    pub fn registry(&self) -> &BatchRegistry {
        &self.registry
    }

    pub fn broker(&self) -> &ResultBroker {
        &self.broker
    }

    /// Validates and registers the batch, then hands it to the executor.
    /// Returns as soon as the executor accepts; no command has to finish
    /// first. A refused or unreachable executor rolls the registration
    /// back so no dangling id survives that will never update.
    pub async fn submit(
        &self,
        commands: &[String],
        principal: Principal,
        token: Option<String>,
    ) -> Result<BatchId, DispatchError> {
        let (batch_id, specs) = self.registry.register(commands, principal)?;
        let dispatch = BatchDispatch {
            batch_id: batch_id.clone(),
            commands: specs,
            token,
        };

        match self.executor.execute(dispatch).await {
            Ok(true) => {
                info!(%batch_id, "batch accepted by executor");
                Ok(batch_id)
            }
            Ok(false) => {
                warn!(%batch_id, "executor refused batch, rolling back");
                self.registry.remove(&batch_id);
                self.broker.prune(&batch_id);
                Err(DispatchError::ExecutorRefused(batch_id))
            }
            Err(err) => {
                warn!(%batch_id, %err, "executor unreachable, rolling back");
                self.registry.remove(&batch_id);
                self.broker.prune(&batch_id);
                Err(DispatchError::ExecutorUnreachable(err.to_string()))
            }
        }
    }

    /// The single ingest path for executor results. Events for unknown
    /// batches are logged and dropped, never delivered. When the event
    /// completes the batch, a distinguished completion event follows it.
    pub fn publish_result(&self, event: ResultEvent) {
        let batch_id = event.batch_id.clone();
        let progress = match self.registry.record_result(&batch_id, event.command_index) {
            Ok(progress) => progress,
            Err(err) => {
                warn!(%batch_id, command_index = event.command_index, %err, "dropping result event");
                return;
            }
        };

        let delivered = self.broker.publish(&batch_id, StreamEvent::Result(event));
        if delivered == 0 {
            debug!(%batch_id, "no subscribers for result event");
        }

        if progress.just_completed {
            info!(
                %batch_id,
                expected = progress.expected,
                received = progress.received,
                "batch complete"
            );
            self.broker.publish(
                &batch_id,
                StreamEvent::BatchComplete {
                    batch_id: batch_id.clone(),
                    expected: progress.expected,
                    received: progress.received,
                },
            );
        }
    }

    pub fn status(&self, batch_id: &BatchId) -> Option<BatchStatusSnapshot> {
        self.registry.status(batch_id)
    }

    /// Retention sweep: forgets batches that completed longer than
    /// `retention` ago and releases their idle topics.
    pub fn evict_completed(&self, retention: Duration) -> usize {
        let expired = self.registry.evict_completed(retention);
        for batch_id in &expired {
            self.broker.prune(batch_id);
        }
        expired.len()
    }
}
