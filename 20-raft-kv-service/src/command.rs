use serde::{Deserialize, Serialize};

use crate::fsm::FsmError;

/// Mutation kinds carried through the replicated log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    Set,
    Delete,
}

/// The unit of replication: every replica decodes and applies these in commit order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub op: Op,
    pub key: String,
    pub value: String,
}

impl Command {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            op: Op::Set,
            key: key.into(),
            value: value.into(),
        }
    }

    /// Deletes carry an empty value.
    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            op: Op::Delete,
            key: key.into(),
            value: String::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, FsmError> {
        bincode::serialize(self).map_err(FsmError::MalformedCommand)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FsmError> {
        bincode::deserialize(bytes).map_err(FsmError::MalformedCommand)
    }
}
