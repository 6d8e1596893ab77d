//! Identification Agent
//!
//! Proposes the adjustment set (and the identification strategy behind it)
//! for the formulated treatment/outcome pair.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use super::parsing::{field_value, list_value, parse_reply};
use super::{ask, finish, unparseable, StageAgent};
use crate::context::{ContextField, ContextPatch, SharedContext};
use crate::executor::CodeExecutor;
use crate::llm::LLM;
use crate::models::{AgentResult, IdentificationOutput, Stage, StageOutput, Task};

const SYSTEM_PROMPT: &str = "You are an expert in causal identification (back-door, front-door, instrumental variables). Respond with JSON only.";

const READS: &[ContextField] = &[
    ContextField::Treatment,
    ContextField::Outcome,
    ContextField::Confounders,
    ContextField::Dataset,
    ContextField::Violations,
];
const WRITES: &[ContextField] = &[
    ContextField::AdjustmentSet,
    ContextField::Confounders,
    ContextField::Extensions,
];

#[derive(Debug, Deserialize)]
struct IdentificationReply {
    #[serde(default, alias = "adjustment_variables", alias = "adjust_for")]
    adjustment_set: Vec<String>,
    #[serde(default, alias = "method")]
    strategy: String,
    #[serde(default, alias = "justification", alias = "reasoning")]
    rationale: String,
}

pub struct IdentificationAgent {
    llm: Option<LLM>,
}

impl IdentificationAgent {
    pub fn new(llm: Option<LLM>) -> Self {
        Self { llm }
    }

    fn create_prompt(message: &str, context: &SharedContext) -> String {
        format!(
            r#"USER REQUEST:
{message}

CURRENT ANALYSIS CONTEXT:
{summary}

TASK:
Choose a minimal sufficient adjustment set that blocks every back-door path from the treatment
to the outcome. Do not include the treatment, the outcome, mediators or colliders. Name the
identification strategy you rely on and explain the choice briefly.

OUTPUT FORMAT (respond with ONLY valid JSON):
{{
  "adjustment_set": ["variable", "..."],
  "strategy": "backdoor|frontdoor|instrumental variables",
  "rationale": "short explanation"
}}"#,
            message = message,
            summary = context.summary(),
        )
    }

    fn heuristic(reply: &str) -> Option<IdentificationReply> {
        let adjustment_set = list_value(
            reply,
            &["adjustment_set", "adjustment set", "adjust_for", "adjust for"],
        );
        let strategy = field_value(reply, &["strategy", "method"]).unwrap_or_default();
        if adjustment_set.is_empty() && strategy.is_empty() {
            return None;
        }
        Some(IdentificationReply {
            adjustment_set,
            strategy,
            rationale: field_value(reply, &["rationale", "justification", "reasoning"]).unwrap_or_default(),
        })
    }
}

/// Drop the treatment and the outcome from a proposed set, plus blanks and duplicates.
fn clean_adjustment_set(set: Vec<String>, context: &SharedContext) -> Vec<String> {
    let excluded: Vec<&str> = [context.treatment.as_deref(), context.outcome.as_deref()]
        .into_iter()
        .flatten()
        .collect();

    let mut cleaned: Vec<String> = Vec::new();
    for item in set {
        let item = item.trim().to_string();
        if item.is_empty() || excluded.iter().any(|e| e.eq_ignore_ascii_case(&item)) {
            continue;
        }
        if !cleaned.iter().any(|c| c.eq_ignore_ascii_case(&item)) {
            cleaned.push(item);
        }
    }
    cleaned
}

#[async_trait]
impl StageAgent for IdentificationAgent {
    fn name(&self) -> &'static str {
        "identification"
    }

    fn stage(&self) -> Stage {
        Stage::Identification
    }

    fn reads(&self) -> &'static [ContextField] {
        READS
    }

    fn writes(&self) -> &'static [ContextField] {
        WRITES
    }

    async fn execute(
        &self,
        task: &Task,
        context: &SharedContext,
        _executor: Option<&dyn CodeExecutor>,
    ) -> AgentResult {
        if !context.has_causal_question() {
            return AgentResult::failed(
                "Identification needs a treatment and an outcome.",
                Some("complete formulation first, e.g. 'does X affect Y?'"),
            );
        }
        info!(task_id = %task.id, "Selecting adjustment set");

        let prompt = Self::create_prompt(task.message(), context);
        let reply = match ask(self.llm.as_ref(), self.name(), SYSTEM_PROMPT, &prompt).await {
            Ok(reply) => reply,
            Err(failed) => return failed,
        };

        let Some(parsed) = parse_reply(self.name(), &reply, Self::heuristic) else {
            return unparseable(self.name(), "ask for the adjustment set again");
        };
        let (reply, degraded) = parsed.into_parts();

        let output = IdentificationOutput {
            adjustment_set: clean_adjustment_set(reply.adjustment_set, context),
            strategy: reply.strategy.trim().to_string(),
            rationale: reply.rationale.trim().to_string(),
        };

        let mut patch = ContextPatch::default();
        if !output.adjustment_set.is_empty() {
            patch.adjustment_set = Some(output.adjustment_set.clone());
            patch.confounders = output.adjustment_set.clone();
            patch.extensions.insert(
                "identification".to_string(),
                serde_json::json!({
                    "strategy": output.strategy,
                    "rationale": output.rationale,
                }),
            );
        }

        finish(
            StageOutput::Identification(output),
            patch,
            degraded,
            "No adjustment set could be identified.",
            "list the variables that affect both the treatment and the outcome",
        )
    }
}
