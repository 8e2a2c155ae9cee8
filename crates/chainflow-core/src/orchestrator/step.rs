//! One step attempt: input preparation, invocation with timeout and
//! cancellation, and fallback handling.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::ChainOrchestrator;
use crate::agent::{AgentCapability, AgentError, CanonicalInput, CanonicalOutput};
use crate::error::ChainError;
use crate::knowledge;
use crate::models::{
    AgentRef, AgentStepSpec, ChainDefinition, ExecutionMode, StepExecutionRecord, StepFailure,
    StepRef,
};
use crate::stream::ChunkSink;
use crate::transform::{DataTransformer, ExecutionContext};

/// A step with its agents resolved from the registry.
#[derive(Clone)]
pub(crate) struct ResolvedStep {
    pub spec: AgentStepSpec,
    pub agent: Arc<dyn AgentCapability>,
    pub fallback_agent: Option<(AgentRef, Arc<dyn AgentCapability>)>,
}

/// A validated chain, snapshotted for one execution.
#[derive(Clone)]
pub(crate) struct ExecutionPlan {
    pub chain_id: String,
    pub mode: ExecutionMode,
    /// In position order.
    pub steps: Vec<ResolvedStep>,
}

pub(crate) enum StepOutcome {
    Completed(CanonicalOutput),
    /// The step failed but declared a fallback; `output` is what the
    /// fallback contributed, if anything.
    Fallback {
        output: Option<CanonicalOutput>,
        error: AgentError,
    },
    Failed(AgentError),
    Cancelled,
}

impl ChainOrchestrator {
    /// Resolve every agent reference up front so a missing agent fails the
    /// execution before any step runs.
    pub(crate) fn plan(
        &self,
        chain: &ChainDefinition,
        mode: ExecutionMode,
    ) -> Result<ExecutionPlan, ChainError> {
        let mut steps = Vec::with_capacity(chain.steps.len());
        for spec in chain.ordered_steps() {
            let registered = self.registry.resolve(&spec.agent).ok_or_else(|| {
                ChainError::AgentNotFound(format!(
                    "'{}' (step {} of chain '{}')",
                    spec.agent.id, spec.position, chain.id
                ))
            })?;

            let fallback_agent = match spec.fallback.as_ref().and_then(|f| f.agent.as_ref()) {
                Some(fallback_ref) => {
                    let fallback = self.registry.resolve(fallback_ref).ok_or_else(|| {
                        ChainError::AgentNotFound(format!(
                            "'{}' (fallback of step {} of chain '{}')",
                            fallback_ref.id, spec.position, chain.id
                        ))
                    })?;
                    let mut fallback_ref = fallback_ref.clone();
                    fallback_ref.name.get_or_insert_with(|| fallback.name.clone());
                    Some((fallback_ref, Arc::clone(&fallback.agent)))
                }
                None => None,
            };

            let mut spec = spec.clone();
            spec.agent.name.get_or_insert_with(|| registered.name.clone());
            steps.push(ResolvedStep {
                spec,
                agent: Arc::clone(&registered.agent),
                fallback_agent,
            });
        }

        Ok(ExecutionPlan {
            chain_id: chain.id.clone(),
            mode,
            steps,
        })
    }

    /// Build the step's input and apply knowledge augmentation, which never
    /// fails the step.
    pub(crate) async fn prepare_input(
        &self,
        spec: &AgentStepSpec,
        ctx: &ExecutionContext,
        previous: Option<&CanonicalOutput>,
    ) -> CanonicalInput {
        let mut input = DataTransformer::build_input(spec, ctx, previous);
        if let Some(knowledge_spec) = &spec.knowledge {
            match knowledge::augment(self.knowledge.as_deref(), &input.query, knowledge_spec).await {
                Ok(augmented) => input.query = augmented,
                Err(e) => tracing::warn!(
                    "[Orchestrator] Step {}: proceeding without knowledge augmentation: {}",
                    spec.position,
                    e
                ),
            }
        }
        input
    }

    fn step_timeout(&self, spec: &AgentStepSpec) -> Duration {
        spec.timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.default_step_timeout)
    }

    /// Invoke an agent, bounded by the step timeout and the cancellation
    /// token. A cancelled call is dropped mid-flight.
    async fn invoke(
        &self,
        agent: &Arc<dyn AgentCapability>,
        input: CanonicalInput,
        timeout: Duration,
        cancel: &CancellationToken,
        sink: Option<&ChunkSink<'_>>,
    ) -> Result<CanonicalOutput, AgentError> {
        let call = async {
            match sink {
                Some(sink) => {
                    let mut output = agent.invoke_stream(input, sink).await?;
                    if output.content.is_empty() && sink.chunk_count() > 0 {
                        output.content = sink.assembled_text();
                    }
                    Ok(output)
                }
                None => agent.invoke(input).await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AgentError::cancelled()),
            result = tokio::time::timeout(timeout, call) => match result {
                Ok(result) => result,
                Err(_) => Err(AgentError::timeout(timeout.as_secs())),
            },
        }
    }

    /// Run one step to a terminal outcome, returning every attempt record.
    pub(crate) async fn run_step(
        &self,
        step: &ResolvedStep,
        input: CanonicalInput,
        cancel: &CancellationToken,
        sink: Option<&ChunkSink<'_>>,
    ) -> (StepOutcome, Vec<StepExecutionRecord>) {
        let spec = &step.spec;
        let timeout = self.step_timeout(spec);
        let input_snapshot = input.to_value();
        let mut attempts = Vec::new();

        let mut primary = StepExecutionRecord::new(StepRef::from_spec(spec), 1);
        primary.start(input_snapshot.clone());
        tracing::info!(
            "[Orchestrator] Step {} ({}) running",
            spec.position,
            spec.agent.label()
        );

        let error = match self.invoke(&step.agent, input.clone(), timeout, cancel, sink).await {
            Ok(output) => {
                primary.complete(output.to_value());
                attempts.push(primary);
                tracing::info!(
                    "[Orchestrator] Step {} ({}) completed",
                    spec.position,
                    spec.agent.label()
                );
                return (StepOutcome::Completed(output), attempts);
            }
            Err(e) => e,
        };

        if error.is_cancelled() || sink.is_some_and(|s| s.is_disconnected()) {
            primary.fail(StepFailure::from(&error));
            attempts.push(primary);
            return (StepOutcome::Cancelled, attempts);
        }

        let Some(fallback) = &spec.fallback else {
            tracing::warn!(
                "[Orchestrator] Step {} ({}) failed [{}]: {}",
                spec.position,
                spec.agent.label(),
                error.code,
                error.message
            );
            primary.fail(StepFailure::from(&error));
            attempts.push(primary);
            return (StepOutcome::Failed(error), attempts);
        };

        tracing::warn!(
            "[Orchestrator] Step {} ({}) failed [{}], falling back: {}",
            spec.position,
            spec.agent.label(),
            error.code,
            error.message
        );

        // Whatever the failed attempt streamed is not this step's output.
        if !discard_partial(sink, spec.position).await {
            primary.fail(StepFailure::from(&AgentError::cancelled()));
            attempts.push(primary);
            return (StepOutcome::Cancelled, attempts);
        }

        // Alternate agent, as a new attempt with the same input.
        if let Some((fallback_ref, fallback_agent)) = &step.fallback_agent {
            primary.fall_back(StepFailure::from(&error), None);
            attempts.push(primary);

            let mut step_ref = StepRef::from_spec(spec);
            step_ref.agent = fallback_ref.clone();
            let mut retry = StepExecutionRecord::new(step_ref, 2);
            retry.start(input_snapshot);

            return match self.invoke(fallback_agent, input, timeout, cancel, sink).await {
                Ok(output) => {
                    retry.complete(output.to_value());
                    attempts.push(retry);
                    tracing::info!(
                        "[Orchestrator] Step {} recovered via fallback agent {}",
                        spec.position,
                        fallback_ref.label()
                    );
                    (
                        StepOutcome::Fallback {
                            output: Some(output),
                            error,
                        },
                        attempts,
                    )
                }
                Err(e) if e.is_cancelled() => {
                    retry.fail(StepFailure::from(&e));
                    attempts.push(retry);
                    (StepOutcome::Cancelled, attempts)
                }
                Err(e) => {
                    tracing::warn!(
                        "[Orchestrator] Fallback agent {} for step {} failed too: {}",
                        fallback_ref.label(),
                        spec.position,
                        e
                    );
                    retry.fail(StepFailure::from(&e));
                    attempts.push(retry);
                    if !discard_partial(sink, spec.position).await {
                        return (StepOutcome::Cancelled, attempts);
                    }
                    (StepOutcome::Fallback { output: None, error }, attempts)
                }
            };
        }

        // Literal payload, or record-and-continue.
        let output = fallback.output.as_ref().map(CanonicalOutput::from_fallback);
        primary.fall_back(
            StepFailure::from(&error),
            output.as_ref().map(CanonicalOutput::to_value),
        );
        attempts.push(primary);
        (StepOutcome::Fallback { output, error }, attempts)
    }
}

/// Retract a failed attempt's streamed text. False when the consumer is gone.
async fn discard_partial(sink: Option<&ChunkSink<'_>>, position: u32) -> bool {
    let Some(sink) = sink else {
        return true;
    };
    match sink.retract("attempt failed, output withdrawn").await {
        Ok(()) => true,
        Err(e) => {
            tracing::info!(
                "[Orchestrator] Step {}: stream consumer gone during fallback: {}",
                position,
                e
            );
            false
        }
    }
}
