//! Execution records — the per-execution and per-step-attempt lifecycle.
//!
//! ```text
//! step:  Pending ──► Running ──► Completed | Failed | Skipped | Fallback
//!           └────────────────────────────► Skipped
//! chain: Pending ──► Running ──► Completed | Failed
//! ```
//!
//! Records are owned by value: an `ExecutionRecord` holds its
//! `StepExecutionRecord`s, nothing points back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::{AgentError, Usage};
use crate::models::chain::{AgentRef, AgentStepSpec, ExecutionMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Fallback,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Fallback => "fallback",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    pub fn can_transition_to(&self, next: Self) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Running | Self::Skipped),
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which step (and which agent) an attempt belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRef {
    pub position: u32,
    pub agent: AgentRef,
    pub role: String,
}

impl StepRef {
    pub fn from_spec(spec: &AgentStepSpec) -> Self {
        Self {
            position: spec.position,
            agent: spec.agent.clone(),
            role: spec.role.clone(),
        }
    }
}

/// Structured error attached to a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub message: String,
    pub code: String,
}

impl StepFailure {
    pub fn new(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: code.into(),
        }
    }
}

impl From<&AgentError> for StepFailure {
    fn from(e: &AgentError) -> Self {
        Self::new(e.message.clone(), e.code.clone())
    }
}

/// One attempt at one step. A fallback re-invocation gets a new record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepExecutionRecord {
    pub id: String,
    pub step: StepRef,
    pub attempt: u32,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepFailure>,
}

impl StepExecutionRecord {
    pub fn new(step: StepRef, attempt: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            step,
            attempt,
            status: StepStatus::Pending,
            started_at: None,
            ended_at: None,
            input: None,
            output: None,
            error: None,
        }
    }

    /// Move to `next`, refusing (and logging) illegal transitions.
    pub fn transition(&mut self, next: StepStatus) -> bool {
        if !self.status.can_transition_to(next) {
            tracing::warn!(
                "[ExecutionRecord] Refusing step {} transition {} -> {}",
                self.step.position,
                self.status,
                next
            );
            return false;
        }
        let now = Utc::now();
        if next == StepStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.ended_at = Some(now);
        }
        self.status = next;
        true
    }

    pub fn start(&mut self, input: Value) {
        if self.transition(StepStatus::Running) {
            self.input = Some(input);
        }
    }

    pub fn complete(&mut self, output: Value) {
        if self.transition(StepStatus::Completed) {
            self.output = Some(output);
        }
    }

    pub fn fail(&mut self, error: StepFailure) {
        if self.transition(StepStatus::Failed) {
            self.error = Some(error);
        }
    }

    pub fn skip(&mut self, error: Option<StepFailure>) {
        if self.transition(StepStatus::Skipped) {
            self.error = error;
        }
    }

    /// Failed, but the chain continues; `output` is the substitute payload, if any.
    pub fn fall_back(&mut self, error: StepFailure, output: Option<Value>) {
        if self.transition(StepStatus::Fallback) {
            self.error = Some(error);
            self.output = output;
        }
    }
}

/// One execution of a chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub chain_id: String,
    pub mode: ExecutionMode,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub steps: Vec<StepExecutionRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default)]
    pub usage: Usage,
}

impl ExecutionRecord {
    pub fn new(chain_id: impl Into<String>, mode: ExecutionMode) -> Self {
        Self {
            execution_id: uuid::Uuid::new_v4().to_string(),
            chain_id: chain_id.into(),
            mode,
            status: ExecutionStatus::Pending,
            started_at: None,
            ended_at: None,
            steps: Vec::new(),
            error: None,
            result: None,
            usage: Usage::default(),
        }
    }

    pub fn transition(&mut self, next: ExecutionStatus) -> bool {
        if !self.status.can_transition_to(next) {
            tracing::warn!(
                "[ExecutionRecord] Refusing execution {} transition {} -> {}",
                self.execution_id,
                self.status.as_str(),
                next.as_str()
            );
            return false;
        }
        let now = Utc::now();
        match next {
            ExecutionStatus::Running => self.started_at = Some(now),
            ExecutionStatus::Completed | ExecutionStatus::Failed => self.ended_at = Some(now),
            ExecutionStatus::Pending => {}
        }
        self.status = next;
        true
    }

    pub fn start(&mut self) {
        self.transition(ExecutionStatus::Running);
    }

    pub fn complete(&mut self, result: Option<Value>) {
        if self.transition(ExecutionStatus::Completed) {
            self.result = result;
        }
    }

    pub fn fail(&mut self, error: StepFailure) {
        if self.transition(ExecutionStatus::Failed) {
            self.error = Some(error);
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Latest attempt recorded for a position.
    pub fn step(&self, position: u32) -> Option<&StepExecutionRecord> {
        self.steps.iter().rev().find(|s| s.step.position == position)
    }

    /// All attempts recorded for a position, in order.
    pub fn attempts(&self, position: u32) -> Vec<&StepExecutionRecord> {
        self.steps
            .iter()
            .filter(|s| s.step.position == position)
            .collect()
    }

    pub fn count_with_status(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }
}
