//! Intent Planner
//!
//! Classifies a user message into an intent, extracts a partial causal
//! specification and proposes an execution plan. The completion service is
//! asked first; when it is unavailable or its reply has no readable JSON
//! object, the deterministic [`fallback`] classifier answers instead.
//!
//! Domain invariants are enforced here regardless of what the model said:
//! confidence is clamped to `[0, 1]`, missing causal-spec fields are filled
//! from the context, and stage prerequisites are injected.

pub mod fallback;
pub mod prerequisites;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::agents::parsing::extract_json_object;
use crate::context::SharedContext;
use crate::llm::LLM;
use crate::models::{ConversationEntry, Stage};

const SYSTEM_PROMPT: &str = "You route messages in a guided causal-analysis assistant. Respond with JSON only.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentType {
    Formulation,
    Eda,
    Estimation,
    Dag,
    Identification,
    GeneralQuestion,
    WorkflowControl,
    DatasetOperation,
}

impl IntentType {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
            "formulation" | "problem_formulation" => Some(Self::Formulation),
            "eda" | "exploration" | "exploratory_analysis" => Some(Self::Eda),
            "estimation" => Some(Self::Estimation),
            "dag" | "causal_graph" => Some(Self::Dag),
            "identification" => Some(Self::Identification),
            "general_question" | "general" | "question" => Some(Self::GeneralQuestion),
            "workflow_control" | "control" => Some(Self::WorkflowControl),
            "dataset_operation" | "dataset" | "data" => Some(Self::DatasetOperation),
            _ => None,
        }
    }

    /// The workflow stage this intent dispatches to, if any.
    pub fn stage(self) -> Option<Stage> {
        match self {
            Self::Formulation => Some(Stage::Formulation),
            Self::Eda => Some(Stage::Eda),
            Self::Dag => Some(Stage::Dag),
            Self::Identification => Some(Stage::Identification),
            Self::Estimation => Some(Stage::Estimation),
            Self::GeneralQuestion | Self::WorkflowControl | Self::DatasetOperation => None,
        }
    }

    pub fn handler_name(self) -> &'static str {
        match self {
            Self::Formulation => "formulation",
            Self::Eda => "eda",
            Self::Dag => "dag",
            Self::Identification => "identification",
            Self::Estimation => "estimation",
            Self::GeneralQuestion => "general",
            Self::WorkflowControl => "router",
            Self::DatasetOperation => "dataset",
        }
    }

    pub fn default_action(self) -> &'static str {
        match self {
            Self::Formulation => "formulate_question",
            Self::Eda => "run_exploratory_checks",
            Self::Dag => "build_causal_graph",
            Self::Identification => "select_adjustment_set",
            Self::Estimation => "estimate_effect",
            Self::GeneralQuestion => "answer_question",
            Self::WorkflowControl => "control_workflow",
            Self::DatasetOperation => "load_dataset",
        }
    }

    pub fn expected_output(self) -> &'static str {
        match self {
            Self::Formulation => "treatment, outcome and candidate confounders",
            Self::Eda => "assumption checks and violations",
            Self::Dag => "causal graph",
            Self::Identification => "adjustment set",
            Self::Estimation => "effect estimate",
            Self::GeneralQuestion => "answer",
            Self::WorkflowControl => "updated workflow state",
            Self::DatasetOperation => "dataset descriptor",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    #[serde(rename = "type")]
    pub kind: IntentType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    pub user_goal: String,
    pub requires_dataset: bool,
    pub requires_prior_stages: Vec<Stage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CausalSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub treatment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(default)]
    pub confounders: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub population: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub agent: String,
    pub action: String,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub expected_output: String,
    /// Indices of earlier steps this one waits for.
    #[serde(default)]
    pub depends_on: Vec<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    #[serde(default)]
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub prerequisites: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanSource {
    Model,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerResult {
    pub intent: Intent,
    pub causal_spec: CausalSpec,
    pub execution_plan: ExecutionPlan,
    pub confidence: f64,
    pub reasoning: String,
    pub source: PlanSource,
}

// Shape requested from the model. Everything is optional so that partial
// replies still parse; `into_result` fills the gaps.
#[derive(Debug, Deserialize)]
struct RawIntent {
    #[serde(rename = "type", alias = "intent_type", alias = "kind")]
    kind: String,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default, alias = "userGoal")]
    user_goal: Option<String>,
    #[serde(default, alias = "requiresDataset")]
    requires_dataset: bool,
    #[serde(default, alias = "requiresPriorStages")]
    requires_prior_stages: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    intent: RawIntent,
    #[serde(default, alias = "causalSpec")]
    causal_spec: CausalSpec,
    #[serde(default, alias = "executionPlan")]
    execution_plan: ExecutionPlan,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    reasoning: String,
}

impl RawPlan {
    fn into_result(self, message: &str) -> Option<PlannerResult> {
        let kind = IntentType::from_name(&self.intent.kind)?;
        Some(PlannerResult {
            intent: Intent {
                kind,
                subtype: self.intent.subtype.filter(|s| !s.trim().is_empty()),
                user_goal: self
                    .intent
                    .user_goal
                    .filter(|g| !g.trim().is_empty())
                    .unwrap_or_else(|| message.to_string()),
                requires_dataset: self.intent.requires_dataset,
                requires_prior_stages: self
                    .intent
                    .requires_prior_stages
                    .iter()
                    .filter_map(|s| Stage::from_name(s))
                    .collect(),
            },
            causal_spec: self.causal_spec,
            execution_plan: self.execution_plan,
            confidence: self.confidence.unwrap_or(0.5),
            reasoning: self.reasoning,
            source: PlanSource::Model,
        })
    }
}

pub struct IntentPlanner {
    llm: Option<LLM>,
    history_window: usize,
}

impl IntentPlanner {
    pub fn new(llm: Option<LLM>, history_window: usize) -> Self {
        Self { llm, history_window }
    }

    pub async fn analyze(
        &self,
        message: &str,
        history: &[ConversationEntry],
        context: &SharedContext,
        current_stage: Stage,
    ) -> PlannerResult {
        let raw = match &self.llm {
            Some(llm) => self.ask_model(llm, message, history, context, current_stage).await,
            None => None,
        };

        let result = raw.unwrap_or_else(|| {
            let result = fallback::classify(message);
            warn!(
                intent = ?result.intent.kind,
                confidence = result.confidence,
                "Using keyword fallback classification"
            );
            result
        });

        let result = enrich(result, context);
        info!(
            intent = ?result.intent.kind,
            subtype = ?result.intent.subtype,
            source = ?result.source,
            confidence = result.confidence,
            "Message classified"
        );
        result
    }

    async fn ask_model(
        &self,
        llm: &LLM,
        message: &str,
        history: &[ConversationEntry],
        context: &SharedContext,
        current_stage: Stage,
    ) -> Option<PlannerResult> {
        let prompt = self.create_prompt(message, history, context, current_stage);
        let reply = match llm.complete(SYSTEM_PROMPT, &prompt).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "Planner completion call failed");
                return None;
            }
        };

        let Some(json) = extract_json_object(&reply) else {
            warn!("Planner reply contained no JSON object");
            return None;
        };
        match serde_json::from_str::<RawPlan>(json) {
            Ok(raw) => {
                let result = raw.into_result(message);
                if result.is_none() {
                    warn!("Planner reply named an unknown intent type");
                }
                result
            }
            Err(e) => {
                warn!(error = %e, "Planner reply did not match the expected shape");
                None
            }
        }
    }

    fn create_prompt(
        &self,
        message: &str,
        history: &[ConversationEntry],
        context: &SharedContext,
        current_stage: Stage,
    ) -> String {
        let start = history.len().saturating_sub(self.history_window);
        let recent = history[start..]
            .iter()
            .map(|entry| format!("{:?}: {}", entry.role, entry.content))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            r#"CURRENT STAGE: {stage}

ANALYSIS CONTEXT:
{summary}

RECENT CONVERSATION:
{recent}

USER MESSAGE:
{message}

TASK:
Classify the message. Intent types: formulation, eda, estimation, dag, identification,
general_question, workflow_control (subtypes: restart, continue, affirmative), dataset_operation.
Extract any treatment/outcome/confounders mentioned and propose an ordered execution plan.

OUTPUT FORMAT (respond with ONLY valid JSON):
{{
  "intent": {{
    "type": "formulation",
    "subtype": null,
    "user_goal": "what the user wants",
    "requires_dataset": false,
    "requires_prior_stages": ["formulation"]
  }},
  "causal_spec": {{"treatment": null, "outcome": null, "confounders": [], "population": null}},
  "execution_plan": {{
    "steps": [{{"agent": "formulation", "action": "...", "input": {{}}, "expected_output": "...", "depends_on": []}}],
    "prerequisites": []
  }},
  "confidence": 0.0,
  "reasoning": "one sentence"
}}"#,
            stage = current_stage,
            summary = context.summary(),
            recent = if recent.is_empty() { "(none)".to_string() } else { recent },
            message = message,
        )
    }

    /// Three to five next-step suggestions for the updated context.
    pub async fn suggest_next_steps(&self, context: &SharedContext, current_stage: Stage) -> Vec<String> {
        if let Some(llm) = &self.llm {
            let prompt = format!(
                "CURRENT STAGE: {}\n\nANALYSIS CONTEXT:\n{}\n\nSuggest 3 to 5 short next steps for the user, \
                 phrased as things they could type. Respond with ONLY a JSON object: {{\"suggestions\": [\"...\"]}}",
                current_stage,
                context.summary()
            );
            match llm.complete(SYSTEM_PROMPT, &prompt).await {
                Ok(reply) => {
                    if let Some(steps) = parse_suggestions(&reply) {
                        return steps;
                    }
                    debug!("Suggestion reply unusable, using defaults");
                }
                Err(e) => debug!(error = %e, "Suggestion call failed, using defaults"),
            }
        }
        default_suggestions(context, current_stage)
    }
}

/// Clamp confidence, backfill the causal spec from context and inject the
/// prerequisites every intent of a given type carries.
pub fn enrich(mut result: PlannerResult, context: &SharedContext) -> PlannerResult {
    result.confidence = if result.confidence.is_nan() {
        0.0
    } else {
        result.confidence.clamp(0.0, 1.0)
    };

    let spec = &mut result.causal_spec;
    if is_blank(&spec.treatment) {
        spec.treatment = context.treatment.clone();
    }
    if is_blank(&spec.outcome) {
        spec.outcome = context.outcome.clone();
    }
    if spec.confounders.is_empty() {
        spec.confounders = context.confounders.clone();
    }

    let intent = &mut result.intent;
    match intent.kind {
        IntentType::Estimation | IntentType::Identification | IntentType::Dag => {
            if !intent.requires_prior_stages.contains(&Stage::Formulation) {
                debug!(intent = ?intent.kind, "Injecting formulation prerequisite");
                intent.requires_prior_stages.insert(0, Stage::Formulation);
            }
        }
        IntentType::Eda => intent.requires_dataset = true,
        _ => {}
    }

    result
}

fn is_blank(value: &Option<String>) -> bool {
    !value.as_ref().is_some_and(|v| !v.trim().is_empty())
}

fn parse_suggestions(reply: &str) -> Option<Vec<String>> {
    #[derive(Deserialize)]
    struct Suggestions {
        #[serde(alias = "next_steps", alias = "steps")]
        suggestions: Vec<String>,
    }

    let parsed: Suggestions = serde_json::from_str(extract_json_object(reply)?).ok()?;
    let steps: Vec<String> = parsed
        .suggestions
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .take(5)
        .collect();
    (steps.len() >= 3).then_some(steps)
}

pub fn default_suggestions(context: &SharedContext, current_stage: Stage) -> Vec<String> {
    let pair = match (&context.treatment, &context.outcome) {
        (Some(t), Some(o)) => format!("{} on {}", t, o),
        _ => "the treatment on the outcome".to_string(),
    };
    let critical = context
        .violations
        .iter()
        .find(|v| v.severity == crate::models::Severity::Critical);

    if !context.has_causal_question() {
        vec![
            "Ask a causal question, e.g. \"Does aspirin reduce heart attacks?\"".to_string(),
            "Load a dataset, e.g. \"load data/cohort.csv\"".to_string(),
            "Type \"help\" to see what I can do".to_string(),
        ]
    } else if let Some(violation) = critical {
        vec![
            format!("Address the critical {} finding before estimating", violation.assumption),
            "Rerun the exploratory checks after restricting the population".to_string(),
            "Ask which variables cause the violation".to_string(),
            "Type \"restart\" to reformulate the question".to_string(),
        ]
    } else if context.dataset.is_none() {
        vec![
            "Load a dataset, e.g. \"load data/cohort.csv\"".to_string(),
            format!("List further confounders of {}", pair),
            "Ask \"what should I adjust for?\"".to_string(),
        ]
    } else if current_stage <= Stage::Eda && !context.extensions.contains_key("eda") {
        vec![
            "Check overlap between treatment groups".to_string(),
            "Look at missing values in the key variables".to_string(),
            "Ask \"what should I adjust for?\"".to_string(),
        ]
    } else if !context.has_adjustment_set() {
        vec![
            "Ask \"what should I adjust for?\"".to_string(),
            format!("Review the candidate confounders of {}", pair),
            "Run more exploratory checks".to_string(),
        ]
    } else if context.estimate.is_none() {
        vec![
            format!("Estimate the effect of {}", pair),
            "Ask which estimator suits this data".to_string(),
            "Review the adjustment set".to_string(),
        ]
    } else {
        vec![
            "Ask how to interpret the estimate".to_string(),
            "Try an alternative estimator to check robustness".to_string(),
            "Ask about sensitivity to unmeasured confounding".to_string(),
            "Type \"restart\" to analyse a new question".to_string(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AssumptionViolation, DatasetDescriptor, Role, Severity};
    use crate::testing::ScriptedLLM;
    use chrono::Utc;

    fn planner_with(replies: Vec<&str>) -> (IntentPlanner, std::sync::Arc<ScriptedLLM>) {
        let scripted = ScriptedLLM::new(replies.into_iter().map(|r| Ok(r.to_string())).collect());
        (IntentPlanner::new(Some(LLM::new(scripted.clone(), "test")), 2), scripted)
    }

    #[tokio::test]
    async fn test_model_reply_is_used_and_clamped() {
        let (planner, _) = planner_with(vec![
            r#"{"intent":{"type":"formulation","user_goal":"frame question","requires_dataset":false,"requires_prior_stages":[]},
                "causal_spec":{"treatment":"aspirin","outcome":"stroke"},"confidence":1.7,"reasoning":"explicit question"}"#,
        ]);

        let result = planner
            .analyze("Does aspirin prevent stroke?", &[], &SharedContext::default(), Stage::Formulation)
            .await;

        assert_eq!(result.source, PlanSource::Model);
        assert_eq!(result.intent.kind, IntentType::Formulation);
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.causal_spec.treatment.as_deref(), Some("aspirin"));
    }

    #[tokio::test]
    async fn test_prerequisites_are_injected_into_model_output() {
        let (planner, _) = planner_with(vec![
            r#"{"intent":{"type":"estimation","requires_prior_stages":[]},"confidence":0.9}"#,
            r#"{"intent":{"type":"eda","requires_dataset":false},"confidence":0.9}"#,
        ]);
        let ctx = SharedContext::default();

        let estimation = planner.analyze("estimate it", &[], &ctx, Stage::Formulation).await;
        assert_eq!(estimation.intent.requires_prior_stages, vec![Stage::Formulation]);

        let eda = planner.analyze("explore", &[], &ctx, Stage::Formulation).await;
        assert!(eda.intent.requires_dataset);
    }

    #[tokio::test]
    async fn test_service_failure_falls_back() {
        let planner = IntentPlanner::new(Some(LLM::new(ScriptedLLM::failing(), "test")), 6);
        let result = planner
            .analyze("y", &[], &SharedContext::default(), Stage::Formulation)
            .await;
        assert_eq!(result.source, PlanSource::Fallback);
        assert_eq!(result.intent.subtype.as_deref(), Some("affirmative"));
    }

    #[tokio::test]
    async fn test_unreadable_reply_falls_back() {
        let (planner, _) = planner_with(vec!["I think the user wants formulation."]);
        let result = planner
            .analyze("Does aspirin reduce heart attacks?", &[], &SharedContext::default(), Stage::Formulation)
            .await;
        assert_eq!(result.source, PlanSource::Fallback);
        assert_eq!(result.intent.kind, IntentType::Formulation);
    }

    #[tokio::test]
    async fn test_unknown_intent_type_falls_back() {
        let (planner, _) = planner_with(vec![r#"{"intent":{"type":"astrology"},"confidence":0.9}"#]);
        let result = planner
            .analyze("help", &[], &SharedContext::default(), Stage::Formulation)
            .await;
        assert_eq!(result.source, PlanSource::Fallback);
    }

    #[tokio::test]
    async fn test_prompt_includes_only_recent_history() {
        let (planner, scripted) = planner_with(vec![r#"{"intent":{"type":"general_question"}}"#]);
        let history: Vec<ConversationEntry> = ["first", "second", "third"]
            .iter()
            .map(|c| ConversationEntry {
                role: Role::User,
                content: c.to_string(),
                timestamp: Utc::now(),
            })
            .collect();

        planner
            .analyze("hello", &history, &SharedContext::default(), Stage::Formulation)
            .await;

        let prompt = &scripted.requests()[0].messages[0].content;
        assert!(!prompt.contains("User: first"));
        assert!(prompt.contains("User: second"));
        assert!(prompt.contains("User: third"));
    }

    #[test]
    fn test_backfill_from_context() {
        let ctx = SharedContext {
            treatment: Some("statin".to_string()),
            outcome: Some("mi".to_string()),
            confounders: vec!["age".to_string()],
            ..Default::default()
        };
        let result = enrich(fallback::classify("estimate the effect"), &ctx);
        assert_eq!(result.causal_spec.treatment.as_deref(), Some("statin"));
        assert_eq!(result.causal_spec.confounders, vec!["age".to_string()]);
    }

    #[test]
    fn test_nan_confidence_is_clamped() {
        let mut result = fallback::classify("hi");
        result.confidence = f64::NAN;
        assert_eq!(enrich(result, &SharedContext::default()).confidence, 0.0);
    }

    #[tokio::test]
    async fn test_suggestions_fall_back_to_defaults() {
        let planner = IntentPlanner::new(None, 6);
        let steps = planner.suggest_next_steps(&SharedContext::default(), Stage::Formulation).await;
        assert!((3..=5).contains(&steps.len()));
    }

    #[tokio::test]
    async fn test_suggestions_from_model() {
        let (planner, _) = planner_with(vec![r#"{"suggestions":["a","b","c","d","e","f"]}"#]);
        let steps = planner.suggest_next_steps(&SharedContext::default(), Stage::Formulation).await;
        assert_eq!(steps, vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn test_default_suggestions_always_three_to_five() {
        let dataset = DatasetDescriptor {
            name: "d".to_string(),
            path: None,
            row_count: 1,
            columns: vec![],
        };
        let mut ctx = SharedContext::default();
        let check = |ctx: &SharedContext, stage| {
            let n = default_suggestions(ctx, stage).len();
            assert!((3..=5).contains(&n), "got {} suggestions", n);
        };

        check(&ctx, Stage::Formulation);
        ctx.treatment = Some("t".to_string());
        ctx.outcome = Some("o".to_string());
        check(&ctx, Stage::Eda);
        ctx.dataset = Some(dataset);
        check(&ctx, Stage::Eda);
        ctx.adjustment_set = Some(vec!["age".to_string()]);
        check(&ctx, Stage::Estimation);
        ctx.violations.push(AssumptionViolation {
            assumption: "positivity".to_string(),
            severity: Severity::Critical,
            description: "none".to_string(),
            recommendation: None,
        });
        let steps = default_suggestions(&ctx, Stage::Eda);
        assert!(steps[0].contains("positivity"));
    }
}
