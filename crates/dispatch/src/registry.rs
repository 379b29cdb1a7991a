use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{BatchId, BatchState, CommandSpec, Principal},
    error::DispatchError,
};

/// Outcome of recording one result event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchProgress {
    pub expected: u32,
    pub received: u32,
    /// True exactly once, on the recording that made `received == expected`.
    pub just_completed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchStatusSnapshot {
    pub expected: u32,
    pub received: u32,
    pub status: BatchState,
}

struct BatchRecord {
    commands: Vec<String>,
    principal: Principal,
    submitted_at: DateTime<Utc>,
    seen_indices: HashSet<u32>,
    completed_at: Option<Instant>,
}

impl BatchRecord {
    fn expected(&self) -> u32 {
        self.commands.len() as u32
    }

    fn received(&self) -> u32 {
        self.seen_indices.len() as u32
    }

    fn state(&self) -> BatchState {
        if self.received() >= self.expected() {
            BatchState::Complete
        } else if self.received() > 0 {
            BatchState::InProgress
        } else {
            BatchState::Pending
        }
    }
}

/// Allocates batch identifiers and keeps the expected/received ledger.
/// Execution is somebody else's job; the registry only gives the executor
/// a place to report completion counts.
#[derive(Default)]
pub struct BatchRegistry {
    inner: Mutex<HashMap<BatchId, BatchRecord>>,
}

impl BatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filters blank entries and registers the remainder under a fresh id.
    /// The returned specs carry the 0-based indices results correlate on.
    pub fn register(
        &self,
        commands: &[String],
        principal: Principal,
    ) -> Result<(BatchId, Vec<CommandSpec>), DispatchError> {
        let commands: Vec<String> = commands
            .iter()
            .map(|command| command.trim())
            .filter(|command| !command.is_empty())
            .map(str::to_string)
            .collect();
        if commands.is_empty() {
            return Err(DispatchError::EmptyBatch);
        }

        let specs: Vec<CommandSpec> = commands
            .iter()
            .enumerate()
            .map(|(index, command)| CommandSpec {
                index: index as u32,
                command: command.clone(),
            })
            .collect();

        let batch_id = BatchId::generate();
        let record = BatchRecord {
            commands,
            principal,
            submitted_at: Utc::now(),
            seen_indices: HashSet::new(),
            completed_at: None,
        };

        let mut inner = self.inner.lock().expect("registry lock poisoned");
        inner.insert(batch_id.clone(), record);
        Ok((batch_id, specs))
    }

    /// Records one result arrival. Duplicate indices (at-least-once
    /// delivery) and indices outside the batch do not advance the count.
    pub fn record_result(
        &self,
        batch_id: &BatchId,
        command_index: u32,
    ) -> Result<BatchProgress, DispatchError> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let record = inner
            .get_mut(batch_id)
            .ok_or_else(|| DispatchError::UnknownBatch(batch_id.clone()))?;

        if (command_index as usize) < record.commands.len() {
            record.seen_indices.insert(command_index);
        }

        let expected = record.expected();
        let received = record.received();
        let just_completed = received >= expected && record.completed_at.is_none();
        if just_completed {
            record.completed_at = Some(Instant::now());
        }

        Ok(BatchProgress {
            expected,
            received,
            just_completed,
        })
    }

    pub fn status(&self, batch_id: &BatchId) -> Option<BatchStatusSnapshot> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.get(batch_id).map(|record| BatchStatusSnapshot {
            expected: record.expected(),
            received: record.received(),
            status: record.state(),
        })
    }

    pub fn principal(&self, batch_id: &BatchId) -> Option<Principal> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.get(batch_id).map(|record| record.principal.clone())
    }

    pub fn submitted_at(&self, batch_id: &BatchId) -> Option<DateTime<Utc>> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.get(batch_id).map(|record| record.submitted_at)
    }

    /// Rollback for failed dispatch. Safe to call for ids that were never
    /// registered or were already evicted.
    pub fn remove(&self, batch_id: &BatchId) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        inner.remove(batch_id);
    }

    /// Drops batches that completed longer than `retention` ago and
    /// returns their ids so the caller can release broker topics too.
    pub fn evict_completed(&self, retention: Duration) -> Vec<BatchId> {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let expired: Vec<BatchId> = inner
            .iter()
            .filter(|(_, record)| {
                record
                    .completed_at
                    .is_some_and(|completed| now.duration_since(completed) >= retention)
            })
            .map(|(batch_id, _)| batch_id.clone())
            .collect();
        for batch_id in &expired {
            inner.remove(batch_id);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
