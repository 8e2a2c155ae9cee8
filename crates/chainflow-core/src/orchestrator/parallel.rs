//! Parallel fan-out: every step runs on its own task against the same
//! pre-execution snapshot, and the results are merged in position order.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::step::{ExecutionPlan, StepOutcome};
use super::{ChainOrchestrator, ExecutionResult};
use crate::agent::CanonicalOutput;
use crate::error::ChainError;
use crate::models::{ExecutionRecord, StepExecutionRecord, StepFailure, StepRef};
use crate::transform::ExecutionContext;

type Branch = (StepOutcome, Vec<StepExecutionRecord>);

impl ChainOrchestrator {
    pub(crate) async fn run_parallel(
        &self,
        plan: &ExecutionPlan,
        mut record: ExecutionRecord,
        mut ctx: ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ChainError> {
        record.start();
        let snapshot = Arc::new(ctx.clone());

        // ─── Fan out ────────────────────────────────────────────────────
        let mut handles: Vec<JoinHandle<Branch>> = Vec::with_capacity(plan.steps.len());
        for step in &plan.steps {
            let this = self.clone();
            let step = step.clone();
            let snapshot = Arc::clone(&snapshot);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let input = this.prepare_input(&step.spec, &snapshot, None).await;
                this.run_step(&step, input, &cancel, None).await
            }));
        }
        tracing::info!(
            "[Orchestrator] Execution {} dispatched {} parallel branches",
            record.execution_id,
            handles.len()
        );

        // ─── Fan in (position order) ────────────────────────────────────
        let mut cancelled = false;
        let mut results = Vec::new();
        let mut failures = Vec::new();

        for (step, mut handle) in plan.steps.iter().zip(handles) {
            let spec = &step.spec;
            let joined = if cancelled {
                if handle.is_finished() {
                    Some(handle.await)
                } else {
                    handle.abort();
                    None
                }
            } else {
                tokio::select! {
                    biased;
                    joined = &mut handle => Some(joined),
                    _ = cancel.cancelled() => {
                        cancelled = true;
                        if handle.is_finished() {
                            Some(handle.await)
                        } else {
                            handle.abort();
                            None
                        }
                    }
                }
            };

            let (outcome, attempts) = match joined {
                Some(Ok(branch)) => branch,
                Some(Err(e)) => {
                    tracing::error!(
                        "[Orchestrator] Branch for step {} did not finish: {}",
                        spec.position,
                        e
                    );
                    let failure = StepFailure::new(e.to_string(), "branch_panicked");
                    let mut rec = StepExecutionRecord::new(StepRef::from_spec(spec), 1);
                    rec.start(Value::Null);
                    rec.fail(failure.clone());
                    record.steps.push(rec);
                    failures.push(failure_entry(spec.position, spec.agent.label(), &failure, false));
                    continue;
                }
                None => {
                    let failure = StepFailure::new("branch aborted by cancellation", "cancelled");
                    failures.push(failure_entry(spec.position, spec.agent.label(), &failure, false));
                    continue;
                }
            };
            record.steps.extend(attempts);

            match outcome {
                StepOutcome::Completed(output) => {
                    results.push(result_entry(spec.position, spec.agent.label(), &output, false));
                    self.absorb(spec, &mut record, &mut ctx, &output);
                }
                StepOutcome::Fallback { output, error } => {
                    if let Some(output) = output {
                        results.push(result_entry(spec.position, spec.agent.label(), &output, true));
                        self.absorb(spec, &mut record, &mut ctx, &output);
                    } else {
                        let failure = StepFailure::from(&error);
                        failures.push(failure_entry(spec.position, spec.agent.label(), &failure, true));
                    }
                }
                StepOutcome::Failed(error) => {
                    let failure = StepFailure::from(&error);
                    failures.push(failure_entry(spec.position, spec.agent.label(), &failure, false));
                }
                StepOutcome::Cancelled => {
                    cancelled = true;
                    failures.push(failure_entry(
                        spec.position,
                        spec.agent.label(),
                        &StepFailure::new("execution cancelled", "cancelled"),
                        false,
                    ));
                }
            }
        }

        if cancelled {
            record.fail(StepFailure::new("execution cancelled", "cancelled"));
            tracing::info!("[Orchestrator] Execution {} cancelled", record.execution_id);
            self.persist(&record).await;
            return Err(ChainError::Cancelled {
                execution_id: record.execution_id.clone(),
                record: Box::new(record),
            });
        }

        tracing::info!(
            "[Orchestrator] Execution {} completed: {} succeeded, {} failed",
            record.execution_id,
            results.len(),
            failures.len()
        );
        record.complete(Some(json!({ "results": results, "failures": failures })));
        self.persist(&record).await;

        Ok(ExecutionResult {
            output: record.result.clone(),
            record,
            context: ctx.into_entries(),
        })
    }
}

fn result_entry(position: u32, agent: &str, output: &CanonicalOutput, fallback: bool) -> Value {
    let mut entry = Map::new();
    entry.insert("position".into(), json!(position));
    entry.insert("agent".into(), json!(agent));
    entry.insert("content".into(), json!(output.content));
    if fallback {
        entry.insert("fallback".into(), json!(true));
    }
    Value::Object(entry)
}

fn failure_entry(position: u32, agent: &str, failure: &StepFailure, fallback: bool) -> Value {
    let mut entry = Map::new();
    entry.insert("position".into(), json!(position));
    entry.insert("agent".into(), json!(agent));
    entry.insert("error".into(), json!(failure.message));
    entry.insert("code".into(), json!(failure.code));
    if fallback {
        entry.insert("fallback".into(), json!(true));
    }
    Value::Object(entry)
}
