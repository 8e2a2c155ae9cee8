//! Chainflow Core — transport-agnostic agent chain orchestration.
//!
//! This crate executes declared chains of agent invocations and moves data
//! between them. It has **no HTTP framework dependency**, making it suitable
//! for use in:
//!
//! - CLI tools (via `chainflow-cli`)
//! - HTTP servers that stream results as SSE
//! - Embedded use inside a larger agent platform
//!
//! # Architecture
//!
//! ```text
//! chain.yaml ──► ChainDefinition ──► ChainOrchestrator ──► ExecutionResult
//!                                        │       │
//!                        DataTransformer ┘       └─► EventStream ──► SSE frames
//!                                        │
//!                               AgentCapability (registry)
//! ```

pub mod agent;
pub mod condition;
pub mod error;
pub mod knowledge;
pub mod message;
pub mod models;
pub mod orchestrator;
pub mod store;
pub mod stream;
pub mod transform;

// Convenience re-exports
pub use agent::{AgentCapability, AgentError, AgentRegistry, CanonicalInput, CanonicalOutput, Usage};
pub use error::ChainError;
pub use message::{CanonicalMessage, MessageKind, MessagePayload, Role};
pub use models::{AgentStepSpec, ChainDefinition, ExecutionMode, ExecutionRecord, StepExecutionRecord};
pub use orchestrator::{
    ChainOrchestrator, ExecutionOutcome, ExecutionRequest, ExecutionResult, OrchestratorConfig,
    StreamingExecution,
};
pub use stream::{ChunkSink, EventSender, EventStream, StreamError};
pub use tokio_util::sync::CancellationToken;
