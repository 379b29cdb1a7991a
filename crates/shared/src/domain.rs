use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque batch identifier, unique across the registry's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub String);

impl BatchId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BatchId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// The authenticated caller, reduced to the opaque subject this core
/// forwards. Token contents are the auth layer's business.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub subject: String,
}

impl Principal {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Pending,
    InProgress,
    Complete,
}

/// One command within a batch. Index is 0-based and stable for the
/// lifetime of the batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub index: u32,
    pub command: String,
}

/// The unit of work handed to the executor. Carries the caller's bearer
/// token verbatim so the executor can apply its own authorization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchDispatch {
    pub batch_id: BatchId,
    pub commands: Vec<CommandSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}
