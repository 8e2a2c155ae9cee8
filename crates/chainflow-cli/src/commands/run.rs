//! `chainflow run` / `chainflow exec` — execute a chain, buffered or streamed.

use chainflow_core::message::to_sse;
use chainflow_core::store::Persistence;
use chainflow_core::{
    CancellationToken, ChainDefinition, ChainError, ChainOrchestrator, ExecutionMode,
    ExecutionOutcome, ExecutionRecord, ExecutionRequest, StreamingExecution,
};
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;

use super::{load_registry, open_store, orchestrator, print_json};

pub struct RunOptions<'a> {
    pub input: &'a str,
    pub context: &'a [String],
    pub mode: Option<&'a str>,
    pub stream: bool,
    pub agents_file: Option<&'a str>,
    pub db_path: &'a str,
}

/// Run a chain from a YAML file.
pub async fn run(chain_file: &str, opts: RunOptions<'_>) -> Result<(), String> {
    let chain = ChainDefinition::from_file(chain_file)?;
    tracing::info!(
        "[CLI] Loaded chain '{}' ({} steps, {} mode) from {}",
        chain.id,
        chain.steps.len(),
        chain.mode,
        chain_file
    );

    let registry = load_registry(opts.agents_file, &chain)?;
    let orch = orchestrator(registry, open_store(opts.db_path)?);
    execute_and_report(&orch, &chain, &opts).await
}

/// Run a chain previously stored with `chainflow save`.
pub async fn exec(chain_id: &str, opts: RunOptions<'_>) -> Result<(), String> {
    let store = open_store(opts.db_path)?;
    let chain = store
        .load_chain(chain_id)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("Chain '{}' not found in {}", chain_id, opts.db_path))?;

    let registry = load_registry(opts.agents_file, &chain)?;
    let orch = orchestrator(registry, store);
    execute_and_report(&orch, &chain, &opts).await
}

async fn execute_and_report(
    orch: &ChainOrchestrator,
    chain: &ChainDefinition,
    opts: &RunOptions<'_>,
) -> Result<(), String> {
    let request = build_request(opts)?;
    let interrupt = watch_ctrl_c(request.cancel.clone());
    let reported = match orch.execute(chain, request).await {
        Ok(outcome) => report(outcome).await,
        Err(e) => Err(describe(e)),
    };
    interrupt.abort();
    reported
}

/// Cancel the execution on Ctrl-C until the returned task is aborted.
fn watch_ctrl_c(cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("[CLI] Interrupted, cancelling execution");
            cancel.cancel();
        }
    })
}

fn build_request(opts: &RunOptions<'_>) -> Result<ExecutionRequest, String> {
    let mut request = ExecutionRequest::new(opts.input);
    request.context = parse_context(opts.context)?;
    if let Some(mode) = opts.mode {
        let mode = ExecutionMode::from_str(mode).ok_or_else(|| {
            format!("Unknown mode '{}' (expected sequential, parallel or conditional)", mode)
        })?;
        request = request.with_mode(mode);
    }
    if opts.stream {
        request = request.streaming();
    }
    Ok(request)
}

/// `key=value` pairs; values are parsed as JSON when possible.
pub fn parse_context(pairs: &[String]) -> Result<Map<String, Value>, String> {
    let mut context = Map::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| format!("Invalid context entry '{}' (expected key=value)", pair))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(format!("Invalid context entry '{}': empty key", pair));
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        context.insert(key.to_string(), value);
    }
    Ok(context)
}

fn describe(e: ChainError) -> String {
    match e.record() {
        Some(record) => format!("{} [{}] (execution {})", e, e.code(), record.execution_id),
        None => format!("{} [{}]", e, e.code()),
    }
}

async fn report(outcome: ExecutionOutcome) -> Result<(), String> {
    match outcome {
        ExecutionOutcome::Completed(result) => {
            print_json(&summary(&result.record, result.output.as_ref()));
            Ok(())
        }
        ExecutionOutcome::Streaming(streaming) => stream_to_stdout(streaming).await,
    }
}

/// Print every event as an SSE frame, then check the final record.
async fn stream_to_stdout(streaming: StreamingExecution) -> Result<(), String> {
    let StreamingExecution {
        execution_id,
        mut stream,
        handle,
    } = streaming;

    while let Some(msg) = stream.next().await {
        print!("{}", to_sse(&msg).render());
    }

    let record = handle
        .await
        .map_err(|e| format!("Execution {} did not finish: {}", execution_id, e))?;
    match &record.error {
        Some(error) => Err(format!(
            "Execution {} failed [{}]: {}",
            execution_id, error.code, error.message
        )),
        None => Ok(()),
    }
}

fn summary(record: &ExecutionRecord, output: Option<&Value>) -> Value {
    let steps: Vec<Value> = record
        .steps
        .iter()
        .map(|s| {
            json!({
                "position": s.step.position,
                "agent": s.step.agent.label(),
                "attempt": s.attempt,
                "status": s.status.as_str(),
            })
        })
        .collect();
    json!({
        "executionId": record.execution_id,
        "chainId": record.chain_id,
        "mode": record.mode.as_str(),
        "status": record.status.as_str(),
        "steps": steps,
        "usage": record.usage,
        "output": output,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_context_values() {
        let ctx = parse_context(&[
            "lang=fr".to_string(),
            "limit=3".to_string(),
            "user={\"name\":\"ada\"}".to_string(),
        ])
        .unwrap();
        assert_eq!(ctx["lang"], json!("fr"));
        assert_eq!(ctx["limit"], json!(3));
        assert_eq!(ctx["user"]["name"], json!("ada"));

        assert!(parse_context(&["novalue".to_string()]).is_err());
        assert!(parse_context(&["=x".to_string()]).is_err());
    }

    #[tokio::test]
    async fn test_interrupt_watcher_stops_when_aborted() {
        let cancel = CancellationToken::new();
        let watcher = watch_ctrl_c(cancel.clone());
        watcher.abort();

        let joined = watcher.await;
        assert!(joined.unwrap_err().is_cancelled());
        assert!(!cancel.is_cancelled());
    }
}
