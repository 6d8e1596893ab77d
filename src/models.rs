use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Config;
use crate::context::{ContextPatch, SharedContext};
use crate::session::SessionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub registry: SessionRegistry,
}

pub type SessionId = Uuid;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    pub active_sessions: usize,
    pub llm_configured: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub session_id: SessionId,
    pub current_stage: Stage,
}

#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub session_id: SessionId,
    pub current_stage: Stage,
    pub messages: Vec<crate::display::DisplayMessage>,
}

/// One phase of the fixed analytical pipeline, in workflow order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Formulation,
    Eda,
    Dag,
    Identification,
    Estimation,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Formulation,
        Stage::Eda,
        Stage::Dag,
        Stage::Identification,
        Stage::Estimation,
    ];

    pub fn index(self) -> usize {
        Self::ALL.iter().position(|s| *s == self).unwrap_or(0)
    }

    /// The following stage in the fixed order; `None` after Estimation.
    pub fn next(self) -> Option<Stage> {
        Self::ALL.get(self.index() + 1).copied()
    }

    pub fn label(self) -> &'static str {
        match self {
            Stage::Formulation => "Formulation",
            Stage::Eda => "EDA",
            Stage::Dag => "DAG",
            Stage::Identification => "Identification",
            Stage::Estimation => "Estimation",
        }
    }

    pub fn from_name(name: &str) -> Option<Stage> {
        match name.trim().to_lowercase().as_str() {
            "formulation" | "problem_formulation" => Some(Stage::Formulation),
            "eda" | "exploration" | "exploratory" => Some(Stage::Eda),
            "dag" | "causal_graph" => Some(Stage::Dag),
            "identification" => Some(Stage::Identification),
            "estimation" => Some(Stage::Estimation),
            _ => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub row_count: usize,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectEstimate {
    pub effect: f64,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_interval: Option<(f64, f64)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub std_error: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p_value: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Moderate,
    Minor,
}

/// A domain-level finding against an identification assumption (e.g. positivity).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssumptionViolation {
    pub assumption: String,
    pub severity: Severity,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationRecord {
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageState {
    pub status: StageStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_result: Option<AgentResult>,
    pub iterations: Vec<IterationRecord>,
}

impl Default for StageState {
    fn default() -> Self {
        Self {
            status: StageStatus::Pending,
            attempts: 0,
            last_result: None,
            iterations: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSession {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub current_stage: Stage,
    pub shared_context: SharedContext,
    /// Append-only, role-tagged.
    pub conversation_history: Vec<ConversationEntry>,
    pub stage_states: BTreeMap<Stage, StageState>,
    /// Stage whose last result asked for another iteration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_iteration: Option<Stage>,
}

impl WorkflowSession {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            current_stage: Stage::Formulation,
            shared_context: SharedContext::default(),
            conversation_history: Vec::new(),
            stage_states: Stage::ALL.iter().map(|s| (*s, StageState::default())).collect(),
            pending_iteration: None,
        }
    }

    pub fn append(&mut self, role: Role, content: impl Into<String>) {
        self.conversation_history.push(ConversationEntry {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn stage_state(&self, stage: Stage) -> Option<&StageState> {
        self.stage_states.get(&stage)
    }

    pub fn stage_state_mut(&mut self, stage: Stage) -> &mut StageState {
        self.stage_states.entry(stage).or_default()
    }

    /// Discard everything learned so far. History is kept.
    pub fn restart(&mut self) {
        self.current_stage = Stage::Formulation;
        self.shared_context = SharedContext::default();
        self.stage_states = Stage::ALL.iter().map(|s| (*s, StageState::default())).collect();
        self.pending_iteration = None;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub stage: Stage,
    pub description: String,
    /// Opaque payload; usually `{"message": <raw user text>}`.
    pub input: serde_json::Value,
}

impl Task {
    pub fn for_message(stage: Stage, description: impl Into<String>, message: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            stage,
            description: description.into(),
            input: serde_json::json!({ "message": message }),
        }
    }

    pub fn message(&self) -> &str {
        self.input
            .get("message")
            .and_then(|v| v.as_str())
            .or_else(|| self.input.as_str())
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackKind {
    Error,
    Warning,
    Info,
    Success,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub kind: FeedbackKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
}

impl Feedback {
    pub fn new(kind: FeedbackKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            suggested_action: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(FeedbackKind::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(FeedbackKind::Error, message)
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.suggested_action = Some(action.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormulationOutput {
    pub treatment: Option<String>,
    pub outcome: Option<String>,
    #[serde(default)]
    pub confounders: Vec<String>,
    #[serde(default)]
    pub population: Option<String>,
    #[serde(default)]
    pub question: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdaCheck {
    #[serde(default)]
    pub name: String,
    /// `None` when the check was described but not conclusive.
    #[serde(default)]
    pub passed: Option<bool>,
    #[serde(default)]
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EdaOutput {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub checks: Vec<EdaCheck>,
    #[serde(default)]
    pub violations: Vec<AssumptionViolation>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub execution_output: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentificationOutput {
    #[serde(default)]
    pub adjustment_set: Vec<String>,
    #[serde(default)]
    pub strategy: String,
    #[serde(default)]
    pub rationale: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EstimationOutput {
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub estimate: Option<EffectEstimate>,
    #[serde(default)]
    pub interpretation: String,
    #[serde(default)]
    pub code: Option<String>,
}

/// Typed payload of an agent result, one variant per handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageOutput {
    Formulation(FormulationOutput),
    Eda(EdaOutput),
    Identification(IdentificationOutput),
    Estimation(EstimationOutput),
    Dataset(DatasetDescriptor),
    Answer { text: String },
}

impl StageOutput {
    /// Whether the output carries anything that completes its stage.
    pub fn is_substantive(&self) -> bool {
        match self {
            StageOutput::Formulation(o) => o.treatment.is_some() || o.outcome.is_some(),
            StageOutput::Eda(o) => {
                !o.checks.is_empty() || !o.violations.is_empty() || !o.summary.trim().is_empty()
            }
            StageOutput::Identification(o) => !o.adjustment_set.is_empty(),
            StageOutput::Estimation(o) => o.estimate.is_some(),
            StageOutput::Dataset(_) => true,
            StageOutput::Answer { text } => !text.trim().is_empty(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<StageOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<Feedback>,
    #[serde(default)]
    pub suggested_next_steps: Vec<String>,
    pub requires_iteration: bool,
    /// Context writes proposed by the agent; merged by the router.
    #[serde(default)]
    pub patch: ContextPatch,
    #[serde(default)]
    pub diagnostics: Vec<String>,
}

impl AgentResult {
    pub fn completed(data: StageOutput, patch: ContextPatch) -> Self {
        Self {
            success: true,
            data: Some(data),
            patch,
            ..Default::default()
        }
    }

    pub fn needs_iteration(data: Option<StageOutput>, patch: ContextPatch, feedback: Feedback) -> Self {
        Self {
            success: true,
            data,
            feedback: Some(feedback),
            requires_iteration: true,
            patch,
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>, remediation: Option<&str>) -> Self {
        let error = error.into();
        let mut feedback = Feedback::error(error.clone());
        if let Some(action) = remediation {
            feedback = feedback.with_action(action);
        }
        Self {
            success: false,
            error: Some(error),
            feedback: Some(feedback),
            ..Default::default()
        }
    }

    pub fn with_diagnostic(mut self, diagnostic: impl Into<String>) -> Self {
        self.diagnostics.push(diagnostic.into());
        self
    }

    /// Attach feedback unless the result already carries a more severe one.
    pub fn with_feedback(mut self, feedback: Feedback) -> Self {
        if self.feedback.is_none() {
            self.feedback = Some(feedback);
        }
        self
    }

    pub fn has_critical_violation(&self) -> bool {
        let in_data = match &self.data {
            Some(StageOutput::Eda(o)) => o.violations.iter().any(|v| v.severity == Severity::Critical),
            _ => false,
        };
        in_data || self.patch.violations.iter().any(|v| v.severity == Severity::Critical)
    }

    /// `success == false` implies an error; `requires_iteration` implies feedback.
    pub fn is_consistent(&self) -> bool {
        (self.success || self.error.is_some()) && (!self.requires_iteration || self.feedback.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_is_forward_and_bounded() {
        assert_eq!(Stage::Formulation.next(), Some(Stage::Eda));
        assert_eq!(Stage::Identification.next(), Some(Stage::Estimation));
        assert_eq!(Stage::Estimation.next(), None);
        for pair in Stage::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn test_stage_serde_names() {
        assert_eq!(serde_json::to_string(&Stage::Eda).unwrap(), "\"eda\"");
        assert_eq!(Stage::from_name("Estimation"), Some(Stage::Estimation));
        assert_eq!(Stage::from_name("nonsense"), None);
    }

    #[test]
    fn test_result_constructors_hold_invariants() {
        let failed = AgentResult::failed("boom", Some("retry later"));
        assert!(!failed.success);
        assert!(failed.is_consistent());
        assert_eq!(
            failed.feedback.as_ref().and_then(|f| f.suggested_action.as_deref()),
            Some("retry later")
        );

        let iterate = AgentResult::needs_iteration(None, ContextPatch::default(), Feedback::warning("again"));
        assert!(iterate.success && iterate.requires_iteration);
        assert!(iterate.is_consistent());
    }

    #[test]
    fn test_critical_violation_detection() {
        let output = EdaOutput {
            violations: vec![AssumptionViolation {
                assumption: "positivity".to_string(),
                severity: Severity::Critical,
                description: "no treated units above 80".to_string(),
                recommendation: None,
            }],
            ..Default::default()
        };
        let result = AgentResult::completed(StageOutput::Eda(output), ContextPatch::default());
        assert!(result.has_critical_violation());
    }

    #[test]
    fn test_restart_clears_context_but_keeps_history() {
        let mut session = WorkflowSession::new(Uuid::new_v4());
        session.append(Role::User, "hello");
        session.shared_context.treatment = Some("aspirin".to_string());
        session.current_stage = Stage::Estimation;

        session.restart();

        assert_eq!(session.current_stage, Stage::Formulation);
        assert!(session.shared_context.treatment.is_none());
        assert_eq!(session.conversation_history.len(), 1);
        assert_eq!(session.stage_states.len(), Stage::ALL.len());
    }

    #[test]
    fn test_task_message_payload() {
        let task = Task::for_message(Stage::Eda, "explore", "check overlap");
        assert_eq!(task.message(), "check overlap");
    }
}
