//! Data Transformer — builds a step's input from the execution context and
//! folds the step's output back into it.
//!
//! Mapping sources are literals, whole references (`${previous_output.content}`,
//! which keep their JSON type) or templates with embedded references
//! (`"Answer: ${Research_result}"`, always text). A source that fails to
//! resolve skips its target field with a warning; it never fails the step.

pub mod context;
pub mod path;

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::agent::{CanonicalInput, CanonicalOutput};
use crate::models::AgentStepSpec;

pub use context::ExecutionContext;
pub use path::{Path, PathError};

/// `${ path }` references.
static REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{\s*([^}]*?)\s*\}").expect("static regex"));

/// A mapping source that is exactly one reference.
static WHOLE_REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\$\{\s*([^}]*?)\s*\}$").expect("static regex"));

pub struct DataTransformer;

impl DataTransformer {
    /// Compute a step's input.
    ///
    /// `query` defaults to the previous output's content, or to the chain's
    /// initial input for the first step.
    pub fn build_input(
        step: &AgentStepSpec,
        ctx: &ExecutionContext,
        previous: Option<&CanonicalOutput>,
    ) -> CanonicalInput {
        let tree = ctx.tree(previous.map(CanonicalOutput::to_value));
        let mut input = CanonicalInput::default();
        let mut query: Option<String> = None;

        for (target, source) in &step.input_mapping {
            let value = match Self::resolve_source(source, &tree) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(
                        "[Transformer] Step {}: skipping input field '{}': {}",
                        step.position,
                        target,
                        e
                    );
                    continue;
                }
            };
            if target == "query" {
                query = Some(value_to_text(&value));
                continue;
            }
            if let Err(e) = route_field(&mut input, target, value) {
                tracing::warn!(
                    "[Transformer] Step {}: cannot assign input field '{}': {}",
                    step.position,
                    target,
                    e
                );
            }
        }

        input.query = query.unwrap_or_else(|| match previous {
            Some(prev) => prev.content.clone(),
            None => ctx.input().to_string(),
        });
        tracing::debug!(
            "[Transformer] Step {} input built ({} mapped fields)",
            step.position,
            step.input_mapping.len()
        );
        input
    }

    /// Fold a step's output into the context: position/name result keys plus
    /// explicit output mappings resolved against the raw output.
    pub fn fold_output(step: &AgentStepSpec, ctx: &mut ExecutionContext, output: &CanonicalOutput) {
        ctx.record_step_output(step.position, step.agent.name.as_deref(), &output.content);

        if step.output_mapping.is_empty() {
            return;
        }
        let raw = output.to_value();
        for (target, source) in &step.output_mapping {
            let value = match Self::resolve_source(&Value::String(source.clone()), &raw) {
                // A bare path (`content`) is accepted as well as `${content}`.
                Ok(Value::String(s)) if s == *source && !source.contains("${") => {
                    match path::resolve(&raw, source) {
                        Ok(v) => v.clone(),
                        Err(e) => {
                            tracing::warn!(
                                "[Transformer] Step {}: skipping output field '{}': {}",
                                step.position,
                                target,
                                e
                            );
                            continue;
                        }
                    }
                }
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(
                        "[Transformer] Step {}: skipping output field '{}': {}",
                        step.position,
                        target,
                        e
                    );
                    continue;
                }
            };
            if let Err(e) = ctx.set_path(target, value) {
                tracing::warn!(
                    "[Transformer] Step {}: cannot set context key '{}': {}",
                    step.position,
                    target,
                    e
                );
            }
        }
    }

    /// Evaluate one mapping source against `tree`.
    pub fn resolve_source(source: &Value, tree: &Value) -> Result<Value, PathError> {
        let Value::String(text) = source else {
            return Ok(source.clone());
        };

        if let Some(caps) = WHOLE_REFERENCE.captures(text) {
            let expr = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            return path::resolve(tree, expr).cloned();
        }

        if !text.contains("${") {
            return Ok(source.clone());
        }

        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for caps in REFERENCE.captures_iter(text) {
            let (Some(whole), Some(expr)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            out.push_str(&text[last..whole.start()]);
            out.push_str(&value_to_text(path::resolve(tree, expr.as_str())?));
            last = whole.end();
        }
        out.push_str(&text[last..]);
        Ok(Value::String(out))
    }
}

/// Route a mapped value by its target prefix.
fn route_field(input: &mut CanonicalInput, target: &str, value: Value) -> Result<(), PathError> {
    let (map, rest) = if let Some(rest) = target.strip_prefix("context.") {
        (&mut input.context, rest)
    } else if let Some(rest) = target.strip_prefix("metadata.") {
        (&mut input.metadata, rest)
    } else if let Some(rest) = target.strip_prefix("parameters.") {
        (&mut input.parameters, rest)
    } else {
        (&mut input.parameters, target)
    };
    set_in_map(map, rest, value)
}

fn set_in_map(map: &mut Map<String, Value>, target: &str, value: Value) -> Result<(), PathError> {
    let path = Path::parse(target)?;
    let mut root = Value::Object(std::mem::take(map));
    let result = path.set(&mut root, value);
    if let Value::Object(m) = root {
        *map = m;
    }
    result
}

/// Text form of a value: strings verbatim, null empty, everything else JSON.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AgentRef;
    use serde_json::json;

    fn step(position: u32) -> AgentStepSpec {
        AgentStepSpec::new(AgentRef::new("agent", "Answer"), position)
    }

    #[test]
    fn test_default_query_pipes_previous_output() {
        let ctx = ExecutionContext::new("What is the capital of France?", Map::new());
        let first = DataTransformer::build_input(&step(1), &ctx, None);
        assert_eq!(first.query, "What is the capital of France?");

        let prev = CanonicalOutput::text("Paris is the capital of France.");
        let second = DataTransformer::build_input(&step(2), &ctx, Some(&prev));
        assert_eq!(second.query, "Paris is the capital of France.");
    }

    #[test]
    fn test_prefix_routing() {
        let mut seed = Map::new();
        seed.insert("user".to_string(), json!({ "lang": "fr", "tier": 2 }));
        let ctx = ExecutionContext::new("q", seed);
        let spec = step(1)
            .with_input("query", "Translate to ${user.lang}: ${input}")
            .with_input("context.tier", "${user.tier}")
            .with_input("metadata.source", "cli")
            .with_input("parameters.temperature", 0.2)
            .with_input("style", "terse");

        let input = DataTransformer::build_input(&spec, &ctx, None);
        assert_eq!(input.query, "Translate to fr: q");
        assert_eq!(input.context["tier"], 2);
        assert_eq!(input.metadata["source"], "cli");
        assert_eq!(input.parameters["temperature"], 0.2);
        assert_eq!(input.parameters["style"], "terse");
    }

    #[test]
    fn test_unresolvable_fields_are_skipped() {
        let ctx = ExecutionContext::new("fallback query", Map::new());
        let spec = step(1)
            .with_input("query", "${nope.missing}")
            .with_input("parameters.bad", "${a..b}")
            .with_input("parameters.good", "ok");

        let input = DataTransformer::build_input(&spec, &ctx, None);
        assert_eq!(input.query, "fallback query");
        assert!(input.parameters.get("bad").is_none());
        assert_eq!(input.parameters["good"], "ok");
    }

    #[test]
    fn test_whole_reference_keeps_json_type() {
        let tree = json!({ "scores": [1, 2] });
        let v = DataTransformer::resolve_source(&json!("${scores}"), &tree).unwrap();
        assert_eq!(v, json!([1, 2]));
        let t = DataTransformer::resolve_source(&json!("n=${scores[1]}"), &tree).unwrap();
        assert_eq!(t, json!("n=2"));
    }

    #[test]
    fn test_fold_output_records_and_maps() {
        let mut ctx = ExecutionContext::new("q", Map::new());
        let spec = step(2)
            .with_output("final_answer", "${content}")
            .with_output("tokens", "usage.output_tokens")
            .with_output("ignored", "${metadata.absent}");
        let out = CanonicalOutput::text("42").with_usage(crate::agent::Usage::new(3, 7));

        DataTransformer::fold_output(&spec, &mut ctx, &out);
        assert_eq!(ctx.get("step_2_result"), Some(&json!("42")));
        assert_eq!(ctx.get("Answer_result"), Some(&json!("42")));
        assert_eq!(ctx.get("final_answer"), Some(&json!("42")));
        assert_eq!(ctx.get("tokens"), Some(&json!(7)));
        assert!(ctx.get("ignored").is_none());
    }
}
