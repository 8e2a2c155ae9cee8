//! End-to-end chain execution against scripted agents.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chainflow_core::knowledge::{KnowledgeSpec, RetrievalMode, StaticKnowledge};
use chainflow_core::message::MessageKind;
use chainflow_core::models::{AgentRef, ExecutionStatus, FallbackSpec, StepStatus};
use chainflow_core::store::{InMemoryStore, Persistence};
use chainflow_core::{
    AgentCapability, AgentError, AgentRegistry, AgentStepSpec, CanonicalInput, CanonicalOutput,
    ChainDefinition, ChainError, ChainOrchestrator, ChunkSink, ExecutionMode, ExecutionRequest,
    StreamingExecution, Usage,
};
use serde_json::json;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

// ─── Scripted agents ──────────────────────────────────────────────────────

/// Replies with a fixed text (or error) and remembers every query it saw.
struct Scripted {
    reply: Result<String, AgentError>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    queries: Mutex<Vec<String>>,
}

impl Scripted {
    fn ok(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Ok(reply.to_string()),
            delay: None,
            calls: AtomicUsize::new(0),
            queries: Mutex::new(Vec::new()),
        })
    }

    fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Err(AgentError::new(message).with_code("upstream_error")),
            delay: None,
            calls: AtomicUsize::new(0),
            queries: Mutex::new(Vec::new()),
        })
    }

    fn slow(reply: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            reply: Ok(reply.to_string()),
            delay: Some(delay),
            calls: AtomicUsize::new(0),
            queries: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentCapability for Scripted {
    async fn invoke(&self, input: CanonicalInput) -> Result<CanonicalOutput, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().unwrap().push(input.query);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.reply
            .clone()
            .map(|text| CanonicalOutput::text(text).with_usage(Usage::new(10, 5)))
    }
}

/// Streams its answer in fixed pieces.
struct Chunked(Vec<&'static str>);

#[async_trait]
impl AgentCapability for Chunked {
    async fn invoke(&self, _input: CanonicalInput) -> Result<CanonicalOutput, AgentError> {
        Ok(CanonicalOutput::text(self.0.concat()))
    }

    async fn invoke_stream(
        &self,
        _input: CanonicalInput,
        sink: &ChunkSink<'_>,
    ) -> Result<CanonicalOutput, AgentError> {
        for piece in &self.0 {
            sink.text(*piece).await?;
        }
        // Content left empty: the orchestrator assembles it from the chunks.
        Ok(CanonicalOutput::default())
    }
}

/// Streams part of an answer, then the connection drops.
struct BreaksMidStream(&'static str);

#[async_trait]
impl AgentCapability for BreaksMidStream {
    async fn invoke(&self, _input: CanonicalInput) -> Result<CanonicalOutput, AgentError> {
        Err(AgentError::new("connection reset").with_code("upstream_error"))
    }

    async fn invoke_stream(
        &self,
        _input: CanonicalInput,
        sink: &ChunkSink<'_>,
    ) -> Result<CanonicalOutput, AgentError> {
        sink.text(self.0).await?;
        Err(AgentError::new("connection reset").with_code("upstream_error"))
    }
}

/// Streams its first piece, then holds the rest until released.
struct Gated {
    first: &'static str,
    rest: &'static str,
    release: Notify,
}

impl Gated {
    fn new(first: &'static str, rest: &'static str) -> Arc<Self> {
        Arc::new(Self {
            first,
            rest,
            release: Notify::new(),
        })
    }
}

#[async_trait]
impl AgentCapability for Gated {
    async fn invoke(&self, _input: CanonicalInput) -> Result<CanonicalOutput, AgentError> {
        Ok(CanonicalOutput::text(format!("{}{}", self.first, self.rest)))
    }

    async fn invoke_stream(
        &self,
        _input: CanonicalInput,
        sink: &ChunkSink<'_>,
    ) -> Result<CanonicalOutput, AgentError> {
        sink.text(self.first).await?;
        self.release.notified().await;
        sink.text(self.rest).await?;
        Ok(CanonicalOutput::default())
    }
}

/// Answers, but trips the execution's cancellation token on the way out.
struct CancelsOnReturn(CancellationToken);

#[async_trait]
impl AgentCapability for CancelsOnReturn {
    async fn invoke(&self, _input: CanonicalInput) -> Result<CanonicalOutput, AgentError> {
        self.0.cancel();
        Ok(CanonicalOutput::text("last word"))
    }
}

fn orchestrator(registry: AgentRegistry) -> ChainOrchestrator {
    ChainOrchestrator::new(Arc::new(registry))
}

fn step(id: &str, position: u32) -> AgentStepSpec {
    AgentStepSpec::new(AgentRef::id(id), position)
}

// ─── Sequential ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_sequential_result_is_last_output() {
    let (a, b, c) = (Scripted::ok("one"), Scripted::ok("two"), Scripted::ok("three"));
    let orch = orchestrator(
        AgentRegistry::new()
            .with("a", "A", a.clone())
            .with("b", "B", b.clone())
            .with("c", "C", c.clone()),
    );
    // Declared out of order; runs in position order.
    let chain = ChainDefinition::new("seq", "three steps", ExecutionMode::Sequential)
        .with_step(step("c", 3))
        .with_step(step("a", 1))
        .with_step(step("b", 2));

    let result = orch
        .execute_buffered(&chain, ExecutionRequest::new("start"))
        .await
        .unwrap();

    assert_eq!(result.output_text(), Some("three"));
    assert_eq!(result.record.status, ExecutionStatus::Completed);
    assert_eq!(result.record.steps.len(), 3);
    let positions: Vec<u32> = result.record.steps.iter().map(|s| s.step.position).collect();
    assert_eq!(positions, vec![1, 2, 3]);
    assert!(result
        .record
        .steps
        .iter()
        .all(|s| s.status == StepStatus::Completed));
    assert_eq!(b.queries(), vec!["one".to_string()]);
    assert_eq!(c.queries(), vec!["two".to_string()]);
    assert_eq!(result.record.usage.total(), 45);
    assert_eq!(result.context.get("B_result"), Some(&json!("two")));
}

#[tokio::test]
async fn test_research_output_becomes_answer_query() {
    let research = Scripted::ok("Paris is the capital of France.");
    let answer = Scripted::ok("Paris.");
    let orch = orchestrator(
        AgentRegistry::new()
            .with("research", "Research", research.clone())
            .with("answer", "Answer", answer.clone()),
    );
    let chain = ChainDefinition::new("chain-1", "research then answer", ExecutionMode::Sequential)
        .with_step(AgentStepSpec::new(AgentRef::new("research", "Research"), 1))
        .with_step(AgentStepSpec::new(AgentRef::new("answer", "Answer"), 2));

    orch.execute_buffered(&chain, ExecutionRequest::new("What is the capital of France?"))
        .await
        .unwrap();

    assert_eq!(
        research.queries(),
        vec!["What is the capital of France?".to_string()]
    );
    assert_eq!(
        answer.queries(),
        vec!["Paris is the capital of France.".to_string()]
    );
}

#[tokio::test]
async fn test_input_and_output_mappings() {
    let research = Scripted::ok("Paris");
    let answer = Scripted::ok("ok");
    let orch = orchestrator(
        AgentRegistry::new()
            .with("research", "Research", research.clone())
            .with("answer", "Answer", answer.clone()),
    );
    let chain = ChainDefinition::new("mapped", "mapped", ExecutionMode::Sequential)
        .with_step(step("research", 1).with_output("city", "${content}"))
        .with_step(
            step("answer", 2)
                .with_input("query", "City: ${city}, user ${user.name}")
                .with_input("parameters.temperature", 0.2),
        );

    let result = orch
        .execute_buffered(
            &chain,
            ExecutionRequest::new("q").with_context("user", json!({ "name": "ada" })),
        )
        .await
        .unwrap();

    assert_eq!(answer.queries(), vec!["City: Paris, user ada".to_string()]);
    assert_eq!(result.context.get("city"), Some(&json!("Paris")));
    let input = result.record.step(2).and_then(|s| s.input.clone()).unwrap();
    assert_eq!(input["parameters"]["temperature"], json!(0.2));
}

#[tokio::test]
async fn test_failure_without_fallback_halts_chain() {
    let (a, b, c) = (Scripted::ok("one"), Scripted::failing("boom"), Scripted::ok("three"));
    let orch = orchestrator(
        AgentRegistry::new()
            .with("a", "A", a.clone())
            .with("b", "B", b.clone())
            .with("c", "C", c.clone()),
    );
    let chain = ChainDefinition::new("halts", "halts", ExecutionMode::Sequential)
        .with_step(step("a", 1))
        .with_step(step("b", 2))
        .with_step(step("c", 3));

    let err = orch
        .execute_buffered(&chain, ExecutionRequest::new("start"))
        .await
        .unwrap_err();

    assert_eq!(err.code(), "step_execution_error");
    match &err {
        ChainError::StepExecution {
            position,
            agent,
            code,
            record,
            ..
        } => {
            assert_eq!(*position, 2);
            assert_eq!(agent, "B");
            assert_eq!(code, "upstream_error");
            assert_eq!(record.status, ExecutionStatus::Failed);
            assert_eq!(record.steps.len(), 2);
            assert_eq!(record.steps[1].status, StepStatus::Failed);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(c.calls(), 0);
}

#[tokio::test]
async fn test_empty_chain_is_rejected_before_execution() {
    let store = Arc::new(InMemoryStore::new());
    let orch = orchestrator(AgentRegistry::new()).with_persistence(store.clone());
    let chain = ChainDefinition::new("empty", "empty", ExecutionMode::Sequential);

    let err = orch
        .execute_buffered(&chain, ExecutionRequest::new("x"))
        .await
        .unwrap_err();

    assert!(matches!(err, ChainError::Validation(_)));
    assert!(err.record().is_none());
    assert!(store.list_executions("empty").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_agent_fails_before_any_step() {
    let a = Scripted::ok("one");
    let orch = orchestrator(AgentRegistry::new().with("a", "A", a.clone()));
    let chain = ChainDefinition::new("missing", "missing", ExecutionMode::Sequential)
        .with_step(step("a", 1))
        .with_step(step("ghost", 2));

    let err = orch
        .execute_buffered(&chain, ExecutionRequest::new("x"))
        .await
        .unwrap_err();

    assert_eq!(err.code(), "agent_not_found");
    assert_eq!(a.calls(), 0);
}

// ─── Fallback, timeout, cancellation ──────────────────────────────────────

#[tokio::test]
async fn test_fallback_payload_flows_forward() {
    let next = Scripted::ok("done");
    let orch = orchestrator(
        AgentRegistry::new()
            .with("flaky", "Flaky", Scripted::failing("down"))
            .with("next", "Next", next.clone()),
    );
    let chain = ChainDefinition::new("fb", "fallback", ExecutionMode::Sequential)
        .with_step(step("flaky", 1).with_fallback(FallbackSpec {
            agent: None,
            output: Some(json!("cached answer")),
        }))
        .with_step(step("next", 2));

    let result = orch
        .execute_buffered(&chain, ExecutionRequest::new("q"))
        .await
        .unwrap();

    assert_eq!(result.record.step(1).map(|s| s.status), Some(StepStatus::Fallback));
    assert_eq!(next.queries(), vec!["cached answer".to_string()]);
    assert_eq!(result.output_text(), Some("done"));
}

#[tokio::test]
async fn test_fallback_agent_runs_as_second_attempt() {
    let backup = Scripted::ok("backup answer");
    let orch = orchestrator(
        AgentRegistry::new()
            .with("primary", "Primary", Scripted::failing("down"))
            .with("backup", "Backup", backup.clone()),
    );
    let chain = ChainDefinition::new("fb2", "fallback agent", ExecutionMode::Sequential).with_step(
        step("primary", 1).with_fallback(FallbackSpec {
            agent: Some(AgentRef::id("backup")),
            output: None,
        }),
    );

    let result = orch
        .execute_buffered(&chain, ExecutionRequest::new("question"))
        .await
        .unwrap();

    let attempts = result.record.attempts(1);
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].status, StepStatus::Fallback);
    assert_eq!(attempts[1].attempt, 2);
    assert_eq!(attempts[1].status, StepStatus::Completed);
    assert_eq!(attempts[1].step.agent.id, "backup");
    assert_eq!(backup.queries(), vec!["question".to_string()]);
    assert_eq!(result.output_text(), Some("backup answer"));
}

#[tokio::test]
async fn test_fallback_without_payload_continues() {
    let next = Scripted::ok("next");
    let orch = orchestrator(
        AgentRegistry::new()
            .with("flaky", "Flaky", Scripted::failing("down"))
            .with("next", "Next", next.clone()),
    );
    let chain = ChainDefinition::new("fb3", "record and continue", ExecutionMode::Sequential)
        .with_step(step("flaky", 1).with_fallback(FallbackSpec::default()))
        .with_step(step("next", 2));

    let result = orch
        .execute_buffered(&chain, ExecutionRequest::new("original"))
        .await
        .unwrap();

    // Nothing was contributed, so the next step sees the chain input.
    assert_eq!(next.queries(), vec!["original".to_string()]);
    assert_eq!(result.record.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn test_step_timeout_is_a_step_failure() {
    let orch = orchestrator(
        AgentRegistry::new()
            .with("slow", "Slow", Scripted::slow("late", Duration::from_secs(30))),
    );
    let chain = ChainDefinition::new("timeout", "timeout", ExecutionMode::Sequential)
        .with_step(step("slow", 1).with_timeout_secs(1));

    let err = orch
        .execute_buffered(&chain, ExecutionRequest::new("q"))
        .await
        .unwrap_err();

    match err {
        ChainError::StepExecution { code, record, .. } => {
            assert_eq!(code, "timeout");
            let failure = record.step(1).and_then(|s| s.error.clone()).unwrap();
            assert_eq!(failure.code, "timeout");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_cancellation_stops_in_flight_step() {
    let (slow, after) = (
        Scripted::slow("late", Duration::from_secs(30)),
        Scripted::ok("never"),
    );
    let orch = orchestrator(
        AgentRegistry::new()
            .with("slow", "Slow", slow.clone())
            .with("after", "After", after.clone()),
    );
    let chain = ChainDefinition::new("cancel", "cancel", ExecutionMode::Sequential)
        .with_step(step("slow", 1))
        .with_step(step("after", 2));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = orch
        .execute_buffered(&chain, ExecutionRequest::new("q").with_cancel(cancel))
        .await
        .unwrap_err();

    assert_eq!(err.code(), "cancelled");
    let record = err.record().unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.step(1).and_then(|s| s.error.clone()).unwrap().code, "cancelled");
    assert_eq!(after.calls(), 0);
}

// ─── Parallel ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_parallel_isolates_failures() {
    let (a, c) = (Scripted::ok("alpha"), Scripted::ok("gamma"));
    let orch = orchestrator(
        AgentRegistry::new()
            .with("a", "Alpha", a.clone())
            .with("b", "Beta", Scripted::failing("beta broke"))
            .with("c", "Gamma", c.clone()),
    );
    let chain = ChainDefinition::new("par", "fan out", ExecutionMode::Parallel)
        .with_step(step("a", 1))
        .with_step(step("b", 2))
        .with_step(step("c", 3));

    let result = orch
        .execute_buffered(&chain, ExecutionRequest::new("shared input"))
        .await
        .unwrap();

    assert_eq!(result.record.status, ExecutionStatus::Completed);
    let output = result.output.unwrap();
    let results = output["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["agent"], json!("Alpha"));
    assert_eq!(results[0]["content"], json!("alpha"));
    assert_eq!(results[1]["position"], json!(3));
    let failures = output["failures"].as_array().unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0]["position"], json!(2));
    assert_eq!(failures[0]["code"], json!("upstream_error"));

    assert_eq!(result.record.count_with_status(StepStatus::Completed), 2);
    assert_eq!(result.record.count_with_status(StepStatus::Failed), 1);
    assert_eq!(a.queries(), vec!["shared input".to_string()]);
    assert_eq!(c.queries(), vec!["shared input".to_string()]);
    assert_eq!(result.context.get("Gamma_result"), Some(&json!("gamma")));
}

#[tokio::test]
async fn test_parallel_cancel_after_branches_finished_completes() {
    let cancel = CancellationToken::new();
    let orch = orchestrator(
        AgentRegistry::new()
            .with("a", "Alpha", Scripted::ok("alpha"))
            .with("late", "Late", Arc::new(CancelsOnReturn(cancel.clone()))),
    );
    let chain = ChainDefinition::new("par", "fan out", ExecutionMode::Parallel)
        .with_step(step("a", 1))
        .with_step(step("late", 2));

    let result = orch
        .execute_buffered(&chain, ExecutionRequest::new("q").with_cancel(cancel.clone()))
        .await
        .unwrap();

    assert!(cancel.is_cancelled());
    assert_eq!(result.record.status, ExecutionStatus::Completed);
    let output = result.output.unwrap();
    assert_eq!(output["results"].as_array().map(Vec::len), Some(2));
    assert_eq!(output["results"][1]["content"], json!("last word"));
    assert_eq!(output["failures"].as_array().map(Vec::len), Some(0));
}

#[tokio::test]
async fn test_parallel_rejects_streaming() {
    let orch = orchestrator(AgentRegistry::new().with("a", "A", Scripted::ok("x")));
    let chain =
        ChainDefinition::new("par", "fan out", ExecutionMode::Parallel).with_step(step("a", 1));

    let err = orch
        .execute_streaming(&chain, ExecutionRequest::new("q"))
        .await
        .err()
        .unwrap();
    assert_eq!(err.code(), "unsupported_execution_mode");
}

// ─── Conditional ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_false_condition_skips_without_invoking() {
    let (research, answer) = (Scripted::ok("Paris"), Scripted::ok("never"));
    let orch = orchestrator(
        AgentRegistry::new()
            .with("research", "Research", research.clone())
            .with("answer", "Answer", answer.clone()),
    );
    let chain = ChainDefinition::new("cond", "conditional", ExecutionMode::Conditional)
        .with_step(step("research", 1))
        .with_step(step("answer", 2).with_condition("Research_result contains \"Berlin\""));

    let result = orch
        .execute_buffered(&chain, ExecutionRequest::new("q"))
        .await
        .unwrap();

    assert_eq!(answer.calls(), 0);
    assert_eq!(result.record.step(2).map(|s| s.status), Some(StepStatus::Skipped));
    assert_eq!(result.output_text(), Some("Paris"));
}

#[tokio::test]
async fn test_true_condition_runs_step() {
    let answer = Scripted::ok("answered");
    let orch = orchestrator(
        AgentRegistry::new()
            .with("research", "Research", Scripted::ok("Paris"))
            .with("answer", "Answer", answer.clone()),
    );
    let chain = ChainDefinition::new("cond", "conditional", ExecutionMode::Conditional)
        .with_step(step("research", 1))
        .with_step(step("answer", 2).with_condition("${previous_output.content} == \"Paris\""));

    let result = orch
        .execute_buffered(&chain, ExecutionRequest::new("q"))
        .await
        .unwrap();

    assert_eq!(answer.calls(), 1);
    assert_eq!(result.output_text(), Some("answered"));
}

#[tokio::test]
async fn test_unparsable_condition_skips_with_error() {
    let answer = Scripted::ok("never");
    let orch = orchestrator(AgentRegistry::new().with("answer", "Answer", answer.clone()));
    let chain = ChainDefinition::new("cond", "conditional", ExecutionMode::Conditional)
        .with_step(step("answer", 1).with_condition("(input =="));

    let result = orch
        .execute_buffered(&chain, ExecutionRequest::new("q"))
        .await
        .unwrap();

    let record = result.record.step(1).unwrap();
    assert_eq!(record.status, StepStatus::Skipped);
    assert_eq!(
        record.error.as_ref().map(|e| e.code.as_str()),
        Some("condition_evaluation_error")
    );
    assert_eq!(answer.calls(), 0);
}

#[tokio::test]
async fn test_sequential_mode_ignores_conditions() {
    let answer = Scripted::ok("ran anyway");
    let orch = orchestrator(AgentRegistry::new().with("answer", "Answer", answer.clone()));
    let chain = ChainDefinition::new("seq", "sequential", ExecutionMode::Sequential)
        .with_step(step("answer", 1).with_condition("false"));

    orch.execute_buffered(&chain, ExecutionRequest::new("q"))
        .await
        .unwrap();
    assert_eq!(answer.calls(), 1);
}

// ─── Knowledge ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_knowledge_augments_query() {
    let agent = Scripted::ok("ok");
    let kb = StaticKnowledge::new().with_document("geo", "Paris is the capital of France.");
    let orch = orchestrator(
        AgentRegistry::new()
            .with("a", "A", agent.clone()),
    ).with_knowledge(Arc::new(kb));
    let chain = ChainDefinition::new("kb", "knowledge", ExecutionMode::Sequential).with_step(
        step("a", 1).with_knowledge(KnowledgeSpec::new(
            vec!["geo".to_string()],
            RetrievalMode::Semantic,
        )),
    );

    orch.execute_buffered(&chain, ExecutionRequest::new("Capital?"))
        .await
        .unwrap();
    assert_eq!(
        agent.queries(),
        vec!["Capital?\n\nRelated knowledge: Paris is the capital of France.".to_string()]
    );
}

#[tokio::test]
async fn test_missing_retriever_leaves_query_unchanged() {
    let agent = Scripted::ok("ok");
    let orch = orchestrator(AgentRegistry::new().with("a", "A", agent.clone()));
    let chain = ChainDefinition::new("kb", "knowledge", ExecutionMode::Sequential).with_step(
        step("a", 1).with_knowledge(KnowledgeSpec::new(
            vec!["geo".to_string()],
            RetrievalMode::Semantic,
        )),
    );

    orch.execute_buffered(&chain, ExecutionRequest::new("Capital?"))
        .await
        .unwrap();
    assert_eq!(agent.queries(), vec!["Capital?".to_string()]);
}

// ─── Streaming ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_streaming_final_step_chunks() {
    let orch = orchestrator(
        AgentRegistry::new()
            .with("research", "Research", Scripted::ok("notes"))
            .with("answer", "Answer", Arc::new(Chunked(vec!["The ", "answer ", "is 42."]))),
    );
    let chain = ChainDefinition::new("stream", "streamed", ExecutionMode::Sequential)
        .with_step(step("research", 1))
        .with_step(step("answer", 2));

    let streaming = orch
        .execute_streaming(&chain, ExecutionRequest::new("q"))
        .await
        .unwrap();
    let summary = streaming.stream.collect().await;

    assert!(summary.is_success());
    assert_eq!(summary.text, "The answer is 42.");
    let kinds: Vec<MessageKind> = summary.messages.iter().map(|m| m.kind()).collect();
    assert_eq!(kinds.first(), Some(&MessageKind::Status));
    assert_eq!(kinds.iter().filter(|k| **k == MessageKind::Done).count(), 1);
    assert_eq!(kinds.last(), Some(&MessageKind::Done));

    let record = streaming.handle.await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.result, Some(json!("The answer is 42.")));
}

#[tokio::test]
async fn test_streaming_failure_ends_with_error() {
    let orch = orchestrator(
        AgentRegistry::new()
            .with("research", "Research", Scripted::ok("notes"))
            .with("answer", "Answer", Scripted::failing("model offline")),
    );
    let chain = ChainDefinition::new("stream", "streamed", ExecutionMode::Sequential)
        .with_step(step("research", 1))
        .with_step(step("answer", 2));

    let streaming = orch
        .execute_streaming(&chain, ExecutionRequest::new("q"))
        .await
        .unwrap();
    let summary = streaming.stream.collect().await;

    let error = summary.error().unwrap();
    assert_eq!(error.code, "step_execution_error");
    assert!(error.message.contains("model offline"));
    let terminal = summary.terminal.as_ref().unwrap();
    assert_eq!(terminal.metadata.get("position"), Some(&json!(2)));
    assert_eq!(terminal.metadata.get("agentErrorCode"), Some(&json!("upstream_error")));

    let record = streaming.handle.await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn test_streaming_skipped_final_step_emits_last_output() {
    let orch = orchestrator(
        AgentRegistry::new()
            .with("research", "Research", Scripted::ok("Paris"))
            .with("answer", "Answer", Scripted::ok("never")),
    );
    let chain = ChainDefinition::new("stream", "streamed", ExecutionMode::Conditional)
        .with_step(step("research", 1))
        .with_step(step("answer", 2).with_condition("false"));

    let streaming = orch
        .execute_streaming(&chain, ExecutionRequest::new("q"))
        .await
        .unwrap();
    let summary = streaming.stream.collect().await;

    assert!(summary.is_success());
    assert_eq!(summary.text, "Paris");
}

#[tokio::test]
async fn test_streaming_fallback_payload_replaces_partial_output() {
    let orch = orchestrator(
        AgentRegistry::new().with("answer", "Answer", Arc::new(BreaksMidStream("partial "))),
    );
    let chain = ChainDefinition::new("stream", "streamed", ExecutionMode::Sequential).with_step(
        step("answer", 1).with_fallback(FallbackSpec {
            agent: None,
            output: Some(json!("cached")),
        }),
    );

    let streaming = orch
        .execute_streaming(&chain, ExecutionRequest::new("q"))
        .await
        .unwrap();
    let summary = streaming.stream.collect().await;

    assert!(summary.is_success());
    assert_eq!(summary.text, "cached");
    let record = streaming.handle.await.unwrap();
    assert_eq!(record.result, Some(json!("cached")));
    assert_eq!(record.step(1).map(|s| s.status), Some(StepStatus::Fallback));
}

#[tokio::test]
async fn test_streaming_fallback_agent_replaces_partial_output() {
    let backup = Scripted::ok("backup");
    let orch = orchestrator(
        AgentRegistry::new()
            .with("answer", "Answer", Arc::new(BreaksMidStream("partial ")))
            .with("backup", "Backup", backup.clone()),
    );
    let chain = ChainDefinition::new("stream", "streamed", ExecutionMode::Sequential).with_step(
        step("answer", 1).with_fallback(FallbackSpec {
            agent: Some(AgentRef::id("backup")),
            output: None,
        }),
    );

    let streaming = orch
        .execute_streaming(&chain, ExecutionRequest::new("q"))
        .await
        .unwrap();
    let summary = streaming.stream.collect().await;

    assert!(summary.is_success());
    assert_eq!(summary.text, "backup");
    let record = streaming.handle.await.unwrap();
    assert_eq!(record.result, Some(json!("backup")));
    assert_eq!(record.attempts(1).len(), 2);
    assert_eq!(backup.calls(), 1);
}

#[tokio::test]
async fn test_consumer_disconnect_during_final_step_cancels() {
    let (answer, backup) = (Gated::new("first ", "second"), Scripted::ok("backup"));
    let orch = orchestrator(
        AgentRegistry::new()
            .with("answer", "Answer", answer.clone())
            .with("backup", "Backup", backup.clone()),
    );
    let chain = ChainDefinition::new("stream", "streamed", ExecutionMode::Sequential).with_step(
        step("answer", 1).with_fallback(FallbackSpec {
            agent: Some(AgentRef::id("backup")),
            output: None,
        }),
    );

    let StreamingExecution {
        mut stream, handle, ..
    } = orch
        .execute_streaming(&chain, ExecutionRequest::new("q"))
        .await
        .unwrap();
    let first = stream.next().await.unwrap();
    assert_eq!(first.kind(), MessageKind::Text);

    drop(stream);
    answer.release.notify_one();

    let record = handle.await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.error.as_ref().map(|e| e.code.as_str()), Some("cancelled"));
    assert_eq!(record.attempts(1).len(), 1);
    assert_eq!(record.step(1).and_then(|s| s.error.clone()).unwrap().code, "stream_closed");
    assert_eq!(backup.calls(), 0);
}

// ─── Persistence ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_execute_by_id_loads_and_records() {
    let store = Arc::new(InMemoryStore::new());
    let orch = orchestrator(AgentRegistry::new().with("a", "A", Scripted::ok("stored run")))
        .with_persistence(store.clone());
    let chain =
        ChainDefinition::new("saved", "saved", ExecutionMode::Sequential).with_step(step("a", 1));
    store.save_chain(&chain).await.unwrap();

    let result = orch
        .execute_by_id("saved", ExecutionRequest::new("q"))
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(result.output_text(), Some("stored run"));

    let history = store.list_executions("saved").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].execution_id, result.record.execution_id);
    assert_eq!(history[0].status, ExecutionStatus::Completed);

    let err = orch
        .execute_by_id("unknown", ExecutionRequest::new("q"))
        .await
        .err()
        .unwrap();
    assert_eq!(err.code(), "chain_not_found");
}

#[tokio::test]
async fn test_execute_by_id_requires_persistence() {
    let orch = orchestrator(AgentRegistry::new());
    let err = orch
        .execute_by_id("any", ExecutionRequest::new("q"))
        .await
        .err()
        .unwrap();
    assert_eq!(err.code(), "persistence_error");
}
