//! Chain Orchestrator — executes a chain definition per its mode.
//!
//! The orchestrator:
//! 1. Validates the chain and resolves every agent (fail fast)
//! 2. Seeds an execution context from the caller's input
//! 3. Runs steps sequentially, conditionally or as a parallel fan-out
//! 4. Moves data between steps through the `DataTransformer`
//! 5. Returns a buffered result, or streams events with the final step's
//!    output delivered incrementally
//!
//! ```text
//! execute() ─► validate ─► plan ─┬─► sequential / conditional ─► ExecutionResult
//!                                ├─► parallel (spawn + join)  ─► ExecutionResult
//!                                └─► streaming task ──────────► EventStream
//! ```

mod parallel;
mod sequential;
mod step;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::AgentRegistry;
use crate::error::ChainError;
use crate::knowledge::KnowledgeRetriever;
use crate::models::{ChainDefinition, ExecutionMode, ExecutionRecord};
use crate::store::{Persistence, StoreError};
use crate::stream::EventStream;
use crate::transform::ExecutionContext;

/// Orchestrator tuning knobs.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Capacity of the bounded event channel in streaming mode.
    pub stream_buffer: usize,
    /// Applied to steps that do not set `timeout_secs`.
    pub default_step_timeout: Duration,
    /// Emit a Status event after each non-final step when streaming.
    pub emit_status: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            stream_buffer: 64,
            default_step_timeout: Duration::from_secs(300),
            emit_status: true,
        }
    }
}

/// What the caller asks for.
#[derive(Debug, Clone, Default)]
pub struct ExecutionRequest {
    /// The chain's initial input; the first step's default query.
    pub input: String,
    /// Caller-supplied initial context entries.
    pub context: Map<String, Value>,
    /// Overrides the chain's declared mode.
    pub mode: Option<ExecutionMode>,
    pub streaming: bool,
    pub cancel: CancellationToken,
}

impl ExecutionRequest {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            ..Default::default()
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// A finished buffered execution.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub record: ExecutionRecord,
    /// Last completed step's output (sequential/conditional) or the merged
    /// branch results (parallel).
    pub output: Option<Value>,
    /// Final execution context.
    pub context: Map<String, Value>,
}

impl ExecutionResult {
    pub fn output_text(&self) -> Option<&str> {
        self.output.as_ref().and_then(|v| v.as_str())
    }
}

/// A running streaming execution. The handle resolves to the final record
/// once the stream has been terminated.
pub struct StreamingExecution {
    pub execution_id: String,
    pub stream: EventStream,
    pub handle: JoinHandle<ExecutionRecord>,
}

pub enum ExecutionOutcome {
    Completed(ExecutionResult),
    Streaming(StreamingExecution),
}

impl ExecutionOutcome {
    pub fn into_result(self) -> Option<ExecutionResult> {
        match self {
            Self::Completed(result) => Some(result),
            Self::Streaming(_) => None,
        }
    }

    pub fn into_streaming(self) -> Option<StreamingExecution> {
        match self {
            Self::Streaming(streaming) => Some(streaming),
            Self::Completed(_) => None,
        }
    }
}

/// The chain scheduler. Cheap to clone; clones share the registry and
/// collaborators.
#[derive(Clone)]
pub struct ChainOrchestrator {
    registry: Arc<AgentRegistry>,
    knowledge: Option<Arc<dyn KnowledgeRetriever>>,
    persistence: Option<Arc<dyn Persistence>>,
    config: OrchestratorConfig,
}

impl ChainOrchestrator {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self {
            registry,
            knowledge: None,
            persistence: None,
            config: OrchestratorConfig::default(),
        }
    }

    pub fn with_knowledge(mut self, retriever: Arc<dyn KnowledgeRetriever>) -> Self {
        self.knowledge = Some(retriever);
        self
    }

    pub fn with_persistence(mut self, store: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(store);
        self
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Execute a chain. Validation, agent resolution and mode checks happen
    /// before any step runs and are returned synchronously.
    pub async fn execute(
        &self,
        chain: &ChainDefinition,
        request: ExecutionRequest,
    ) -> Result<ExecutionOutcome, ChainError> {
        let mode = request.mode.unwrap_or(chain.mode);
        chain.validate()?;
        if request.streaming && !mode.supports_streaming() {
            return Err(ChainError::UnsupportedExecutionMode(format!(
                "streaming is not supported in {} mode",
                mode
            )));
        }
        let plan = self.plan(chain, mode)?;

        let ExecutionRequest {
            input,
            context,
            streaming,
            cancel,
            ..
        } = request;
        let ctx = ExecutionContext::new(input, context);
        let record = ExecutionRecord::new(&chain.id, mode);

        tracing::info!(
            "[Orchestrator] Executing chain '{}' ({} steps, {} mode{}) as {}",
            chain.id,
            plan.steps.len(),
            mode,
            if streaming { ", streaming" } else { "" },
            record.execution_id
        );

        if streaming {
            return Ok(ExecutionOutcome::Streaming(
                self.spawn_streaming(plan, record, ctx, cancel),
            ));
        }

        let result = match mode {
            ExecutionMode::Parallel => self.run_parallel(&plan, record, ctx, &cancel).await?,
            ExecutionMode::Sequential | ExecutionMode::Conditional => {
                self.run_buffered(&plan, record, ctx, &cancel).await?
            }
        };
        Ok(ExecutionOutcome::Completed(result))
    }

    /// Execute and wait for the buffered result.
    pub async fn execute_buffered(
        &self,
        chain: &ChainDefinition,
        mut request: ExecutionRequest,
    ) -> Result<ExecutionResult, ChainError> {
        request.streaming = false;
        match self.execute(chain, request).await? {
            ExecutionOutcome::Completed(result) => Ok(result),
            ExecutionOutcome::Streaming(_) => Err(ChainError::UnsupportedExecutionMode(
                "buffered execution produced a stream".to_string(),
            )),
        }
    }

    /// Execute with the final step's output delivered incrementally.
    pub async fn execute_streaming(
        &self,
        chain: &ChainDefinition,
        mut request: ExecutionRequest,
    ) -> Result<StreamingExecution, ChainError> {
        request.streaming = true;
        match self.execute(chain, request).await? {
            ExecutionOutcome::Streaming(streaming) => Ok(streaming),
            ExecutionOutcome::Completed(_) => Err(ChainError::UnsupportedExecutionMode(
                "streaming execution completed without a stream".to_string(),
            )),
        }
    }

    /// Load a chain through the persistence collaborator and execute it.
    pub async fn execute_by_id(
        &self,
        chain_id: &str,
        request: ExecutionRequest,
    ) -> Result<ExecutionOutcome, ChainError> {
        let store = self
            .persistence
            .as_ref()
            .ok_or(ChainError::Persistence(StoreError::NotConfigured))?;
        let chain = store
            .load_chain(chain_id)
            .await?
            .ok_or_else(|| ChainError::ChainNotFound(chain_id.to_string()))?;
        self.execute(&chain, request).await
    }

    /// Hand a terminal record to the persistence collaborator. Failures are
    /// logged; they never change the execution's outcome.
    pub(crate) async fn persist(&self, record: &ExecutionRecord) {
        let Some(store) = &self.persistence else {
            return;
        };
        if let Err(e) = store.save_execution(record).await {
            tracing::warn!(
                "[Orchestrator] Failed to save execution {}: {}",
                record.execution_id,
                e
            );
        }
    }
}
