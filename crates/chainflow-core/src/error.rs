//! Chain-level error taxonomy.
//!
//! `Validation`, `AgentNotFound` and `UnsupportedExecutionMode` are raised
//! before any step runs. `StepExecution` and `Cancelled` carry the failed
//! execution record so callers can inspect every attempt. Soft errors
//! (condition evaluation, knowledge augmentation) never surface here; they
//! are recorded on the step and logged.

use crate::models::ExecutionRecord;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Step {position} ({agent}) failed in execution {execution_id}: {message}")]
    StepExecution {
        execution_id: String,
        position: u32,
        agent: String,
        message: String,
        /// Code of the underlying agent error (`agent_error`, `timeout`, ...)
        code: String,
        record: Box<ExecutionRecord>,
    },

    #[error("Unsupported execution mode: {0}")]
    UnsupportedExecutionMode(String),

    #[error("Execution {execution_id} cancelled")]
    Cancelled {
        execution_id: String,
        record: Box<ExecutionRecord>,
    },

    #[error("Chain not found: {0}")]
    ChainNotFound(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),
}

impl ChainError {
    /// Stable machine-readable code, used for terminal Error messages.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::AgentNotFound(_) => "agent_not_found",
            Self::StepExecution { .. } => "step_execution_error",
            Self::UnsupportedExecutionMode(_) => "unsupported_execution_mode",
            Self::Cancelled { .. } => "cancelled",
            Self::ChainNotFound(_) => "chain_not_found",
            Self::Persistence(_) => "persistence_error",
        }
    }

    /// The execution record, for errors raised after execution started.
    pub fn record(&self) -> Option<&ExecutionRecord> {
        match self {
            Self::StepExecution { record, .. } | Self::Cancelled { record, .. } => Some(record),
            _ => None,
        }
    }
}
