//! Single-flow execution (sequential and conditional modes), buffered or
//! streamed.

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::step::{ExecutionPlan, StepOutcome};
use super::{ChainOrchestrator, ExecutionResult, StreamingExecution};
use crate::agent::{AgentError, CanonicalOutput};
use crate::condition;
use crate::error::ChainError;
use crate::message::{CanonicalMessage, Role};
use crate::models::{
    AgentStepSpec, ExecutionMode, ExecutionRecord, StepExecutionRecord, StepFailure, StepRef,
};
use crate::stream::{self, ChunkSink, EventSender};
use crate::transform::{DataTransformer, ExecutionContext};

/// How a single flow ended.
pub(crate) enum FlowEnd {
    Completed {
        /// The last output any step contributed.
        output: Option<CanonicalOutput>,
        /// Whether the final step delivered text through the stream.
        streamed: bool,
    },
    Failed {
        position: u32,
        agent: String,
        error: AgentError,
    },
    Cancelled,
}

impl ChainOrchestrator {
    /// Drive the steps in position order. With `events`, the final step is
    /// invoked through a [`ChunkSink`] and earlier steps report progress.
    pub(crate) async fn run_flow(
        &self,
        plan: &ExecutionPlan,
        record: &mut ExecutionRecord,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
        events: Option<&EventSender>,
    ) -> FlowEnd {
        record.start();
        let total = plan.steps.len();
        let mut previous: Option<CanonicalOutput> = None;
        let mut streamed = false;

        for (index, step) in plan.steps.iter().enumerate() {
            let spec = &step.spec;
            let is_last = index + 1 == total;

            if cancel.is_cancelled() {
                tracing::info!(
                    "[Orchestrator] Execution {} cancelled before step {}",
                    record.execution_id,
                    spec.position
                );
                return FlowEnd::Cancelled;
            }
            if events.is_some_and(EventSender::is_disconnected) {
                tracing::info!(
                    "[Orchestrator] Stream consumer of {} went away, stopping",
                    record.execution_id
                );
                return FlowEnd::Cancelled;
            }

            if let Some(condition) = &spec.condition {
                if plan.mode == ExecutionMode::Conditional {
                    let tree = ctx.tree(previous.as_ref().map(CanonicalOutput::to_value));
                    let skipped = match condition::evaluate(condition, &tree) {
                        Ok(true) => None,
                        Ok(false) => Some(None),
                        Err(e) => {
                            tracing::warn!(
                                "[Orchestrator] Step {}: condition '{}' not evaluable, skipping: {}",
                                spec.position,
                                condition,
                                e
                            );
                            Some(Some(StepFailure::new(
                                e.to_string(),
                                "condition_evaluation_error",
                            )))
                        }
                    };
                    if let Some(reason) = skipped {
                        let mut rec = StepExecutionRecord::new(StepRef::from_spec(spec), 1);
                        rec.skip(reason);
                        record.steps.push(rec);
                        tracing::info!(
                            "[Orchestrator] Step {} ({}) skipped",
                            spec.position,
                            spec.agent.label()
                        );
                        self.emit_progress(events, "step_skipped", spec, index, total)
                            .await;
                        continue;
                    }
                } else {
                    tracing::debug!(
                        "[Orchestrator] Step {}: condition ignored in {} mode",
                        spec.position,
                        plan.mode
                    );
                }
            }

            let input = self.prepare_input(spec, ctx, previous.as_ref()).await;
            let sink = events.filter(|_| is_last).map(ChunkSink::new);
            let (outcome, attempts) = self.run_step(step, input, cancel, sink.as_ref()).await;
            record.steps.extend(attempts);
            if let Some(sink) = &sink {
                streamed = sink.chunk_count() > 0;
            }

            match outcome {
                StepOutcome::Completed(output) => {
                    self.absorb(spec, record, ctx, &output);
                    previous = Some(output);
                    self.emit_progress(events, "step_completed", spec, index, total)
                        .await;
                }
                StepOutcome::Fallback { output, .. } => {
                    if let Some(output) = output {
                        self.absorb(spec, record, ctx, &output);
                        previous = Some(output);
                    }
                    self.emit_progress(events, "step_fallback", spec, index, total)
                        .await;
                }
                StepOutcome::Failed(error) => {
                    return FlowEnd::Failed {
                        position: spec.position,
                        agent: spec.agent.label().to_string(),
                        error,
                    }
                }
                StepOutcome::Cancelled => return FlowEnd::Cancelled,
            }
        }

        FlowEnd::Completed {
            output: previous,
            streamed,
        }
    }

    /// Fold a contributing output into the context and the usage totals.
    pub(super) fn absorb(
        &self,
        spec: &AgentStepSpec,
        record: &mut ExecutionRecord,
        ctx: &mut ExecutionContext,
        output: &CanonicalOutput,
    ) {
        if let Some(usage) = &output.usage {
            record.usage.add(usage);
        }
        DataTransformer::fold_output(spec, ctx, output);
    }

    /// Status event after a non-final step.
    async fn emit_progress(
        &self,
        events: Option<&EventSender>,
        stage: &str,
        spec: &AgentStepSpec,
        index: usize,
        total: usize,
    ) {
        let Some(tx) = events else {
            return;
        };
        if !self.config.emit_status || index + 1 == total {
            return;
        }
        let status = CanonicalMessage::status(
            stage,
            Some(format!("step {} ({})", spec.position, spec.agent.label())),
            Some((index + 1) as f64 / total as f64),
        )
        .with_metadata("position", spec.position);
        if let Err(e) = tx.send(status).await {
            tracing::debug!("[Orchestrator] Status event not delivered: {}", e);
        }
    }

    /// Record a flow's end on the execution record.
    fn conclude(&self, record: &mut ExecutionRecord, end: &FlowEnd) {
        match end {
            FlowEnd::Completed { output, .. } => {
                record.complete(output.as_ref().map(|o| Value::String(o.content.clone())));
                tracing::info!(
                    "[Orchestrator] Execution {} completed ({} step records)",
                    record.execution_id,
                    record.steps.len()
                );
            }
            FlowEnd::Failed {
                position,
                agent,
                error,
            } => {
                record.fail(StepFailure::new(
                    format!("step {} ({}) failed: {}", position, agent, error.message),
                    error.code.clone(),
                ));
                tracing::warn!(
                    "[Orchestrator] Execution {} failed at step {}",
                    record.execution_id,
                    position
                );
            }
            FlowEnd::Cancelled => {
                record.fail(StepFailure::new("execution cancelled", "cancelled"));
                tracing::info!("[Orchestrator] Execution {} cancelled", record.execution_id);
            }
        }
    }

    pub(crate) async fn run_buffered(
        &self,
        plan: &ExecutionPlan,
        mut record: ExecutionRecord,
        mut ctx: ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ChainError> {
        let end = self.run_flow(plan, &mut record, &mut ctx, cancel, None).await;
        self.conclude(&mut record, &end);
        self.persist(&record).await;

        match end {
            FlowEnd::Completed { .. } => Ok(ExecutionResult {
                output: record.result.clone(),
                record,
                context: ctx.into_entries(),
            }),
            FlowEnd::Failed {
                position,
                agent,
                error,
            } => Err(ChainError::StepExecution {
                execution_id: record.execution_id.clone(),
                position,
                agent,
                message: error.message,
                code: error.code,
                record: Box::new(record),
            }),
            FlowEnd::Cancelled => Err(ChainError::Cancelled {
                execution_id: record.execution_id.clone(),
                record: Box::new(record),
            }),
        }
    }

    /// Run the flow on a task that owns the event sender. The stream always
    /// ends with exactly one Done or Error.
    pub(crate) fn spawn_streaming(
        &self,
        plan: ExecutionPlan,
        mut record: ExecutionRecord,
        mut ctx: ExecutionContext,
        cancel: CancellationToken,
    ) -> StreamingExecution {
        let (tx, event_stream) = stream::channel(self.config.stream_buffer);
        let execution_id = record.execution_id.clone();
        let this = self.clone();

        let handle = tokio::spawn(async move {
            let end = this
                .run_flow(&plan, &mut record, &mut ctx, &cancel, Some(&tx))
                .await;
            this.conclude(&mut record, &end);

            let terminal = match &end {
                FlowEnd::Completed { output, streamed } => {
                    // Nothing reached the stream from the final step (skipped,
                    // or a fallback payload): deliver the last output whole.
                    if let (false, Some(output)) = (*streamed, output) {
                        let text = CanonicalMessage::text(Role::Assistant, output.content.clone());
                        if let Err(e) = tx.send(text).await {
                            tracing::debug!("[Orchestrator] Final output not delivered: {}", e);
                        }
                    }
                    CanonicalMessage::done("stop")
                }
                FlowEnd::Failed {
                    position,
                    agent,
                    error,
                } => CanonicalMessage::error(
                    format!("Step {} ({}) failed: {}", position, agent, error.message),
                    "step_execution_error",
                )
                .with_metadata("position", *position)
                .with_metadata("agent", agent.clone())
                .with_metadata("agentErrorCode", error.code.clone()),
                FlowEnd::Cancelled => CanonicalMessage::error("execution cancelled", "cancelled"),
            }
            .with_metadata("executionId", record.execution_id.clone());

            if let Err(e) = tx.send(terminal).await {
                tracing::debug!("[Orchestrator] Terminal event not delivered: {}", e);
            }

            this.persist(&record).await;
            record
        });

        StreamingExecution {
            execution_id,
            stream: event_stream,
            handle,
        }
    }
}
