//! EDA Agent
//!
//! Exploratory checks of the loaded dataset against the identification
//! assumptions (positivity/overlap, missingness, balance). Any critical
//! finding blocks the workflow until the user addresses it.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use super::parsing::{field_value, parse_reply};
use super::{ask, finish, run_generated_code, unparseable, StageAgent};
use crate::context::{ContextField, ContextPatch, SharedContext};
use crate::executor::CodeExecutor;
use crate::llm::LLM;
use crate::models::{
    AgentResult, AssumptionViolation, EdaCheck, EdaOutput, Feedback, FeedbackKind, Severity, Stage,
    StageOutput, Task,
};

const SYSTEM_PROMPT: &str = "You are a careful applied statistician reviewing a dataset before a causal analysis. Respond with JSON only.";

const READS: &[ContextField] = &[
    ContextField::Treatment,
    ContextField::Outcome,
    ContextField::Confounders,
    ContextField::Dataset,
];
const WRITES: &[ContextField] = &[ContextField::Violations, ContextField::Extensions];

const MAX_OUTPUT_CHARS: usize = 4000;

#[derive(Debug, Deserialize)]
struct EdaReply {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    checks: Vec<EdaCheck>,
    #[serde(default, alias = "assumption_violations")]
    violations: Vec<AssumptionViolation>,
    #[serde(default, alias = "python_code")]
    code: Option<String>,
}

pub struct EdaAgent {
    llm: Option<LLM>,
}

impl EdaAgent {
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
Plan exploratory checks for this causal question: covariate balance between treatment groups,
positivity/overlap, missing data, and outcome distribution. Report any assumption violations with
a severity of "critical" (the analysis cannot proceed), "moderate" or "minor".
Provide pandas code that reads "{path}" and prints its findings.

OUTPUT FORMAT (respond with ONLY valid JSON):
{{
  "summary": "two or three sentences",
  "checks": [{{"name": "check name", "passed": true, "detail": "what was found"}}],
  "violations": [{{"assumption": "positivity", "severity": "critical|moderate|minor", "description": "...", "recommendation": "..."}}],
  "code": "python code or null"
}}"#,
            message = message,
            summary = context.summary(),
            path = path,
        )
    }

    fn heuristic(reply: &str) -> Option<EdaReply> {
        let mut violations = Vec::new();
        for line in reply.lines() {
            let line = line.trim().trim_start_matches(['-', '*', ' ']);
            let lower = line.to_lowercase();
            let severity = if lower.starts_with("critical") {
                Severity::Critical
            } else if lower.starts_with("moderate") {
                Severity::Moderate
            } else if lower.starts_with("minor") {
                Severity::Minor
            } else {
                continue;
            };
            let Some((_, rest)) = line.split_once(':') else {
                continue;
            };
            let rest = rest.trim();
            let assumption = rest
                .split([' ', '-', ','])
                .find(|w| !w.is_empty())
                .unwrap_or("assumption")
                .to_lowercase();
            violations.push(AssumptionViolation {
                assumption,
                severity,
                description: rest.to_string(),
                recommendation: None,
            });
        }

        let summary = field_value(reply, &["summary"]).unwrap_or_default();
        if summary.is_empty() && violations.is_empty() {
            return None;
        }
        Some(EdaReply {
            summary,
            checks: Vec::new(),
            violations,
            code: None,
        })
    }

    fn severity_feedback(violations: &[AssumptionViolation]) -> Option<Feedback> {
        let critical: Vec<&AssumptionViolation> = violations
            .iter()
            .filter(|v| v.severity == Severity::Critical)
            .collect();

        if let Some(first) = critical.first() {
            let names = critical.iter().map(|v| v.assumption.as_str()).collect::<Vec<_>>().join(", ");
            return Some(
                Feedback::error(format!("Critical assumption violation: {}. Estimation is blocked.", names))
                    .with_action(
                        first
                            .recommendation
                            .clone()
                            .unwrap_or_else(|| "address the violation and rerun the exploratory checks".to_string()),
                    ),
            );
        }

        if violations.is_empty() {
            return None;
        }
        let listed = violations
            .iter()
            .map(|v| format!("{} ({:?})", v.assumption, v.severity).to_lowercase())
            .collect::<Vec<_>>()
            .join(", ");
        Some(Feedback::new(
            FeedbackKind::Info,
            format!("Non-blocking findings: {}", listed),
        ))
    }
}

#[async_trait]
impl StageAgent for EdaAgent {
    fn name(&self) -> &'static str {
        "eda"
    }

    fn stage(&self) -> Stage {
        Stage::Eda
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
        let Some(dataset) = &context.dataset else {
            return AgentResult::failed(
                "Exploratory analysis needs a dataset, but none is loaded.",
                Some("load a dataset first, e.g. 'load data/study.csv'"),
            );
        };
        info!(task_id = %task.id, dataset = %dataset.name, "Running exploratory checks");

        let prompt = Self::create_prompt(task.message(), context);
        let reply = match ask(self.llm.as_ref(), self.name(), SYSTEM_PROMPT, &prompt).await {
            Ok(reply) => reply,
            Err(failed) => return failed,
        };

        let Some(parsed) = parse_reply(self.name(), &reply, Self::heuristic) else {
            return unparseable(self.name(), "ask again for the exploratory checks");
        };
        let (reply, degraded) = parsed.into_parts();

        let mut output = EdaOutput {
            summary: reply.summary,
            checks: reply.checks,
            violations: reply.violations,
            code: reply.code.filter(|c| !c.trim().is_empty()),
            execution_output: None,
        };

        let mut execution_diagnostic = None;
        match run_generated_code(executor, context, output.code.as_deref()).await {
            Some(Ok(result)) => {
                let mut stdout = result.stdout();
                if stdout.len() > MAX_OUTPUT_CHARS {
                    let mut cut = MAX_OUTPUT_CHARS;
                    while !stdout.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    stdout.truncate(cut);
                }
                output.execution_output = Some(stdout);
            }
            Some(Err(diagnostic)) => execution_diagnostic = Some(diagnostic),
            None => {}
        }

        let mut patch = ContextPatch {
            violations: output.violations.clone(),
            ..Default::default()
        };
        patch.extensions.insert(
            "eda".to_string(),
            serde_json::json!({
                "summary": output.summary,
                "checks": output.checks,
            }),
        );

        let feedback = Self::severity_feedback(&output.violations);
        let critical = output.violations.iter().any(|v| v.severity == Severity::Critical);

        let mut result = if critical {
            warn!(task_id = %task.id, "Critical assumption violation found");
            let feedback = feedback.unwrap_or_else(|| Feedback::error("Critical assumption violation"));
            let mut result = AgentResult::needs_iteration(Some(StageOutput::Eda(output)), patch, feedback);
            if let Some(diagnostic) = degraded {
                result = result.with_diagnostic(diagnostic);
            }
            result
        } else {
            let result = finish(
                StageOutput::Eda(output),
                patch,
                degraded,
                "The exploratory analysis came back empty.",
                "ask for specific checks, e.g. 'check overlap between treatment groups'",
            );
            match feedback {
                Some(f) => result.with_feedback(f),
                None => result,
            }
        };

        if let Some(diagnostic) = execution_diagnostic {
            result = result.with_diagnostic(diagnostic);
        }
        result
    }
}
