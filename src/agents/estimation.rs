//! Estimation Agent
//!
//! Picks an estimator given the adjustment set, asks for code that computes
//! the effect, and (when a code executor is attached) takes the estimate from
//! the program's output instead of the model's guess.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use super::parsing::{field_value, number_value, parse_reply};
use super::{ask, finish, run_generated_code, unparseable, StageAgent};
use crate::context::{ContextField, ContextPatch, SharedContext};
use crate::executor::CodeExecutor;
use crate::llm::LLM;
use crate::models::{
    AgentResult, EffectEstimate, EstimationOutput, Feedback, Stage, StageOutput, Task,
};

const SYSTEM_PROMPT: &str = "You are a statistician estimating causal effects from observational data. Respond with JSON only.";

const READS: &[ContextField] = &[
    ContextField::Treatment,
    ContextField::Outcome,
    ContextField::AdjustmentSet,
    ContextField::Dataset,
    ContextField::Violations,
];
const WRITES: &[ContextField] = &[ContextField::Estimate, ContextField::Extensions];

#[derive(Debug, Deserialize)]
struct EstimateReply {
    #[serde(default, alias = "ate", alias = "value")]
    effect: Option<f64>,
    #[serde(default, alias = "ci")]
    confidence_interval: Option<(f64, f64)>,
    #[serde(default)]
    std_error: Option<f64>,
    #[serde(default)]
    p_value: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct EstimationReply {
    #[serde(default, alias = "estimator")]
    method: String,
    #[serde(default)]
    estimate: Option<EstimateReply>,
    #[serde(default)]
    interpretation: String,
    #[serde(default, alias = "python_code")]
    code: Option<String>,
}

pub struct EstimationAgent {
    llm: Option<LLM>,
}

impl EstimationAgent {
    pub fn new(llm: Option<LLM>) -> Self {
        Self { llm }
    }

    fn create_prompt(message: &str, context: &SharedContext) -> String {
        let path = context
            .dataset
            .as_ref()
            .and_then(|ds| ds.path.clone())
            .unwrap_or_else(|| "data.csv".to_string());

        format!(
            r#"USER REQUEST:
{message}

CURRENT ANALYSIS CONTEXT:
{summary}

TASK:
Choose an estimator appropriate for the adjustment set (regression adjustment, propensity score
weighting or matching, doubly robust). Provide Python code that reads "{path}", estimates the
average treatment effect, and prints a final line of JSON:
{{"effect": <float>, "confidence_interval": [<low>, <high>], "p_value": <float>}}
If you cannot run anything, give your best estimate from the information available or null.

OUTPUT FORMAT (respond with ONLY valid JSON):
{{
  "method": "estimator name",
  "estimate": {{"effect": 0.0, "confidence_interval": [0.0, 0.0], "std_error": null, "p_value": null}},
  "interpretation": "one or two sentences for a non-specialist",
  "code": "python code"
}}"#,
            message = message,
            summary = context.summary(),
            path = path,
        )
    }

    fn heuristic(reply: &str) -> Option<EstimationReply> {
        let method = field_value(reply, &["method", "estimator"]).unwrap_or_default();
        let effect = number_value(reply, &["effect", "ate", "estimate"]);
        if method.is_empty() && effect.is_none() {
            return None;
        }
        Some(EstimationReply {
            method,
            estimate: effect.map(|effect| EstimateReply {
                effect: Some(effect),
                confidence_interval: None,
                std_error: None,
                p_value: number_value(reply, &["p_value", "p-value", "p"]),
            }),
            interpretation: field_value(reply, &["interpretation"]).unwrap_or_default(),
            code: None,
        })
    }

    /// The last stdout line that is a JSON object with an `effect` field.
    fn estimate_from_stdout(stdout: &str) -> Option<EstimateReply> {
        stdout
            .lines()
            .rev()
            .map(str::trim)
            .filter(|line| line.starts_with('{'))
            .filter_map(|line| serde_json::from_str::<EstimateReply>(line).ok())
            .find(|estimate| estimate.effect.is_some())
    }
}

#[async_trait]
impl StageAgent for EstimationAgent {
    fn name(&self) -> &'static str {
        "estimation"
    }

    fn stage(&self) -> Stage {
        Stage::Estimation
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
        executor: Option<&dyn CodeExecutor>,
    ) -> AgentResult {
        if !context.has_causal_question() {
            return AgentResult::failed(
                "Estimation needs a treatment and an outcome.",
                Some("complete formulation first, e.g. 'does X affect Y?'"),
            );
        }
        if !context.has_adjustment_set() {
            return AgentResult::needs_iteration(
                None,
                ContextPatch::default(),
                Feedback::warning("No adjustment set has been identified yet, so the estimate would be confounded.")
                    .with_action("run identification first, e.g. 'what should I adjust for?'"),
            );
        }
        info!(task_id = %task.id, "Estimating causal effect");

        let prompt = Self::create_prompt(task.message(), context);
        let reply = match ask(self.llm.as_ref(), self.name(), SYSTEM_PROMPT, &prompt).await {
            Ok(reply) => reply,
            Err(failed) => return failed,
        };

        let Some(parsed) = parse_reply(self.name(), &reply, Self::heuristic) else {
            return unparseable(self.name(), "ask for the estimate again");
        };
        let (reply, degraded) = parsed.into_parts();

        let method = reply.method.trim().to_string();
        let code = reply.code.filter(|c| !c.trim().is_empty());
        let mut estimate = reply.estimate;

        let mut execution_diagnostic = None;
        match run_generated_code(executor, context, code.as_deref()).await {
            Some(Ok(result)) => {
                if let Some(computed) = Self::estimate_from_stdout(&result.stdout()) {
                    debug!(effect = ?computed.effect, "Using executed estimate");
                    estimate = Some(computed);
                }
            }
            Some(Err(diagnostic)) => execution_diagnostic = Some(diagnostic),
            None => {}
        }

        let output = EstimationOutput {
            estimate: estimate.and_then(|e| {
                Some(EffectEstimate {
                    effect: e.effect?,
                    method: if method.is_empty() { "unspecified".to_string() } else { method.clone() },
                    confidence_interval: e.confidence_interval,
                    std_error: e.std_error,
                    p_value: e.p_value,
                })
            }),
            method,
            interpretation: reply.interpretation.trim().to_string(),
            code,
        };

        let mut patch = ContextPatch {
            estimate: output.estimate.clone(),
            ..Default::default()
        };
        if output.estimate.is_some() {
            patch.extensions.insert(
                "estimation".to_string(),
                serde_json::json!({ "interpretation": output.interpretation }),
            );
        }

        let result = finish(
            StageOutput::Estimation(output),
            patch,
            degraded,
            "No effect estimate was produced.",
            "attach the dataset and ask to run the estimation",
        );
        match execution_diagnostic {
            Some(diagnostic) => result.with_diagnostic(diagnostic),
            None => result,
        }
    }
}
