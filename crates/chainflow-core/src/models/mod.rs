pub mod chain;
pub mod execution;

pub use chain::{AgentRef, AgentStepSpec, ChainDefinition, ExecutionMode, FallbackSpec};
pub use execution::{
    ExecutionRecord, ExecutionStatus, StepExecutionRecord, StepFailure, StepRef, StepStatus,
};
