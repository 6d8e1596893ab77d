//! Formulation Agent
//!
//! Turns the user's question into a causal specification: which variable is
//! the treatment, which is the outcome, and which variables plausibly
//! confound them.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use super::parsing::{field_value, list_value, parse_reply};
use super::{ask, finish, unparseable, StageAgent};
use crate::context::{ContextField, ContextPatch, SharedContext};
use crate::executor::CodeExecutor;
use crate::llm::LLM;
use crate::models::{AgentResult, FormulationOutput, Stage, StageOutput, Task};

const SYSTEM_PROMPT: &str = "You are an epidemiologist helping a user turn a question into a precise causal question. Respond with JSON only.";

const READS: &[ContextField] = &[
    ContextField::Treatment,
    ContextField::Outcome,
    ContextField::Confounders,
    ContextField::Dataset,
];
const WRITES: &[ContextField] = &[
    ContextField::Treatment,
    ContextField::Outcome,
    ContextField::Confounders,
    ContextField::Extensions,
];

/// Raw JSON shape requested from the model.
#[derive(Debug, Deserialize)]
struct FormulationReply {
    #[serde(default, alias = "exposure", alias = "intervention")]
    treatment: Option<String>,
    #[serde(default, alias = "response")]
    outcome: Option<String>,
    #[serde(default, alias = "covariates")]
    confounders: Vec<String>,
    #[serde(default)]
    population: Option<String>,
    #[serde(default, alias = "causal_question")]
    question: Option<String>,
}

pub struct FormulationAgent {
    llm: Option<LLM>,
}

impl FormulationAgent {
    pub fn new(llm: Option<LLM>) -> Self {
        Self { llm }
    }

    fn create_prompt(message: &str, context: &SharedContext) -> String {
        let columns = context
            .dataset
            .as_ref()
            .map(|ds| ds.columns.join(", "))
            .unwrap_or_else(|| "(no dataset loaded)".to_string());

        format!(
            r#"USER MESSAGE:
{message}

CURRENT ANALYSIS CONTEXT:
{summary}

AVAILABLE COLUMNS:
{columns}

TASK:
Identify the treatment (exposure/intervention), the outcome, and variables that plausibly
affect both. Prefer dataset column names when a column clearly matches.

OUTPUT FORMAT (respond with ONLY valid JSON):
{{
  "treatment": "name of the treatment variable or null",
  "outcome": "name of the outcome variable or null",
  "confounders": ["variable", "..."],
  "population": "target population or null",
  "question": "one-sentence causal question"
}}"#,
            message = message,
            summary = context.summary(),
            columns = columns,
        )
    }

    fn heuristic(reply: &str) -> Option<FormulationReply> {
        let treatment = field_value(reply, &["treatment", "exposure", "intervention"]);
        let outcome = field_value(reply, &["outcome", "response"]);
        let confounders = list_value(reply, &["confounders", "covariates"]);
        if treatment.is_none() && outcome.is_none() && confounders.is_empty() {
            return None;
        }
        Some(FormulationReply {
            treatment,
            outcome,
            confounders,
            population: field_value(reply, &["population"]),
            question: field_value(reply, &["question", "causal_question"]),
        })
    }

    fn into_result(reply: FormulationReply, degraded: Option<String>) -> AgentResult {
        let output = FormulationOutput {
            treatment: non_empty(reply.treatment),
            outcome: non_empty(reply.outcome),
            confounders: reply.confounders,
            population: non_empty(reply.population),
            question: non_empty(reply.question),
        };

        let mut patch = ContextPatch {
            treatment: output.treatment.clone(),
            outcome: output.outcome.clone(),
            confounders: output.confounders.clone(),
            ..Default::default()
        };
        if output.population.is_some() || output.question.is_some() {
            patch.extensions.insert(
                "formulation".to_string(),
                serde_json::json!({
                    "population": output.population,
                    "question": output.question,
                }),
            );
        }

        finish(
            StageOutput::Formulation(output),
            patch,
            degraded,
            "I couldn't identify a treatment or an outcome in that message.",
            "phrase the question as 'does X affect Y?'",
        )
    }
}

#[async_trait]
impl StageAgent for FormulationAgent {
    fn name(&self) -> &'static str {
        "formulation"
    }

    fn stage(&self) -> Stage {
        Stage::Formulation
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
        info!(task_id = %task.id, "Formulating causal question");

        let prompt = Self::create_prompt(task.message(), context);
        let reply = match ask(self.llm.as_ref(), self.name(), SYSTEM_PROMPT, &prompt).await {
            Ok(reply) => reply,
            Err(failed) => return failed,
        };

        match parse_reply(self.name(), &reply, Self::heuristic) {
            Some(parsed) => {
                let (value, degraded) = parsed.into_parts();
                Self::into_result(value, degraded)
            }
            None => unparseable(self.name(), "restate the treatment and the outcome explicitly"),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("null"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedLLM;

    fn agent_with(replies: Vec<&str>) -> FormulationAgent {
        let scripted = ScriptedLLM::new(replies.into_iter().map(|r| Ok(r.to_string())).collect());
        FormulationAgent::new(Some(LLM::new(scripted, "test")))
    }

    #[tokio::test]
    async fn test_structured_reply_sets_fields() {
        let agent = agent_with(vec![
            r#"{"treatment":"aspirin","outcome":"heart attacks","confounders":["age"],"question":"Does aspirin reduce heart attacks?"}"#,
        ]);
        let task = Task::for_message(Stage::Formulation, "formulate", "Does aspirin reduce heart attacks?");

        let result = agent.execute(&task, &SharedContext::default(), None).await;

        assert!(result.success);
        assert!(!result.requires_iteration);
        assert!(result.diagnostics.is_empty());
        assert_eq!(result.patch.treatment.as_deref(), Some("aspirin"));
        assert_eq!(result.patch.outcome.as_deref(), Some("heart attacks"));
        assert_eq!(result.patch.confounders, vec!["age".to_string()]);
        assert!(result.patch.extensions.contains_key("formulation"));
    }

    #[tokio::test]
    async fn test_prose_reply_degrades_with_warning() {
        let agent = agent_with(vec!["Treatment: smoking\nOutcome: lung cancer\nConfounders: age, income"]);
        let task = Task::for_message(Stage::Formulation, "formulate", "smoking and cancer");

        let result = agent.execute(&task, &SharedContext::default(), None).await;

        assert!(result.success);
        assert_eq!(result.patch.treatment.as_deref(), Some("smoking"));
        assert_eq!(result.diagnostics.len(), 1);
        assert!(result.feedback.is_some());
    }

    #[tokio::test]
    async fn test_empty_object_is_a_no_op() {
        let agent = agent_with(vec![r#"{"treatment": null, "outcome": null}"#]);
        let task = Task::for_message(Stage::Formulation, "formulate", "hmm");

        let result = agent.execute(&task, &SharedContext::default(), None).await;

        assert!(result.success);
        assert!(result.requires_iteration);
        assert!(result.patch.is_empty());
        assert!(result.is_consistent());
    }

    #[tokio::test]
    async fn test_service_failure_is_a_failed_result() {
        let agent = FormulationAgent::new(Some(LLM::new(ScriptedLLM::failing(), "test")));
        let task = Task::for_message(Stage::Formulation, "formulate", "does x affect y");

        let result = agent.execute(&task, &SharedContext::default(), None).await;

        assert!(!result.success);
        assert!(result.error.is_some());
        assert!(result.patch.is_empty());
    }

    #[tokio::test]
    async fn test_gibberish_reply_requests_iteration() {
        let agent = agent_with(vec!["I am not sure what you mean."]);
        let task = Task::for_message(Stage::Formulation, "formulate", "???");

        let result = agent.execute(&task, &SharedContext::default(), None).await;

        assert!(result.success);
        assert!(result.requires_iteration);
        assert!(!result.diagnostics.is_empty());
    }
}
