//! Agent System
//!
//! Stage agents turn a (task, shared context) pair into a completion-service
//! call and parse the reply into a typed [`AgentResult`]:
//!
//! - **Formulation**: extracts treatment, outcome and candidate confounders
//! - **EDA**: exploratory checks and assumption findings on the loaded dataset
//! - **Identification**: proposes an adjustment set
//! - **Estimation**: chooses a method and produces an effect estimate
//!
//! Two non-stage handlers sit next to them: the dataset loader and the
//! general answerer.
//!
//! ```text
//! Task + SharedContext
//!      │
//!      ▼
//! ┌─────────────┐   missing fields   ┌──────────────────────┐
//! │ preconditions│──────────────────▶│ failed / iterate      │
//! └─────────────┘                    └──────────────────────┘
//!      │
//!      ▼
//! ┌─────────────┐   JSON object      ┌──────────────────────┐
//! │ completion  │──────────────────▶│ Structured result     │
//! │  service    │   otherwise        ├──────────────────────┤
//! └─────────────┘──────────────────▶│ Heuristic + warning   │
//!                                    └──────────────────────┘
//! ```
//!
//! Agents never mutate the context; they return a [`ContextPatch`] limited
//! to the fields they declare in [`StageAgent::writes`].

pub mod parsing;
pub mod formulation;
pub mod eda;
pub mod identification;
pub mod estimation;
pub mod dataset;
pub mod general;

pub use dataset::DatasetLoader;
pub use eda::EdaAgent;
pub use estimation::EstimationAgent;
pub use formulation::FormulationAgent;
pub use general::GeneralAgent;
pub use identification::IdentificationAgent;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, warn};

use crate::context::{ContextField, ContextPatch, SharedContext};
use crate::executor::{CodeExecutor, ExecuteOptions, ExecutionResult};
use crate::llm::LLM;
use crate::models::{AgentResult, Feedback, Stage, StageOutput, Task};
use crate::utils::retry::describe;

#[async_trait]
pub trait StageAgent: Send + Sync {
    fn name(&self) -> &'static str;

    fn stage(&self) -> Stage;

    /// Context fields the agent reads.
    fn reads(&self) -> &'static [ContextField];

    /// Context fields the agent may write; anything else in its patch is dropped.
    fn writes(&self) -> &'static [ContextField];

    async fn execute(
        &self,
        task: &Task,
        context: &SharedContext,
        executor: Option<&dyn CodeExecutor>,
    ) -> AgentResult;
}

/// Stage → agent table. Stages without an agent are skipped by auto-advance.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<Stage, Arc<dyn StageAgent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Formulation, EDA, Identification and Estimation. DAG has no agent.
    pub fn standard(llm: Option<LLM>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(FormulationAgent::new(llm.clone())));
        registry.register(Arc::new(EdaAgent::new(llm.clone())));
        registry.register(Arc::new(IdentificationAgent::new(llm.clone())));
        registry.register(Arc::new(EstimationAgent::new(llm)));
        registry
    }

    pub fn register(&mut self, agent: Arc<dyn StageAgent>) {
        self.agents.insert(agent.stage(), agent);
    }

    pub fn get(&self, stage: Stage) -> Option<Arc<dyn StageAgent>> {
        self.agents.get(&stage).cloned()
    }

    pub fn contains(&self, stage: Stage) -> bool {
        self.agents.contains_key(&stage)
    }

    /// The first stage after `stage` that has a registered agent.
    pub fn next_registered_after(&self, stage: Stage) -> Option<Stage> {
        let mut cursor = stage.next();
        while let Some(candidate) = cursor {
            if self.contains(candidate) {
                return Some(candidate);
            }
            cursor = candidate.next();
        }
        None
    }
}

/// Call the completion service, turning a service failure into a failed result.
pub(crate) async fn ask(
    llm: Option<&LLM>,
    agent: &str,
    system: &str,
    instruction: &str,
) -> Result<String, AgentResult> {
    let Some(llm) = llm else {
        warn!(agent, "No completion service configured");
        return Err(AgentResult::failed(
            format!("{} agent cannot run: no completion service is configured", agent),
            Some("set an API key for the configured LLM provider"),
        ));
    };

    llm.complete(system, instruction).await.map_err(|e| {
        error!(agent, error = %e, "Completion service call failed");
        AgentResult::failed(describe(&e), Some("try again in a moment"))
    })
}

/// Run generated code when both an executor and a dataset are available.
/// Failures are returned as a diagnostic; they never abort the stage.
pub(crate) async fn run_generated_code(
    executor: Option<&dyn CodeExecutor>,
    context: &SharedContext,
    code: Option<&str>,
) -> Option<Result<ExecutionResult, String>> {
    let executor = executor?;
    let code = code.filter(|c| !c.trim().is_empty())?;
    context.dataset.as_ref()?;

    match executor.execute(code, ExecuteOptions::default()).await {
        Ok(result) if result.success => Some(Ok(result)),
        Ok(result) => {
            let reason = result
                .error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string());
            warn!(reason = %reason, "Generated code failed");
            Some(Err(format!("Code execution failed: {}", reason)))
        }
        Err(e) => {
            warn!(error = %e, "Code executor unavailable");
            Some(Err(format!("Code execution failed: {}", e)))
        }
    }
}

/// Finish a parsed reply: empty outputs become an iteration request and
/// heuristic parses carry a warning plus a diagnostic entry.
pub(crate) fn finish(
    output: StageOutput,
    patch: ContextPatch,
    degraded: Option<String>,
    empty_message: &str,
    empty_action: &str,
) -> AgentResult {
    let mut result = if output.is_substantive() {
        AgentResult::completed(output, patch)
    } else {
        AgentResult::needs_iteration(
            Some(output),
            patch,
            Feedback::warning(empty_message).with_action(empty_action),
        )
    };

    if let Some(diagnostic) = degraded {
        result = result
            .with_diagnostic(diagnostic)
            .with_feedback(Feedback::warning(
                "The reply was not well-formed; fields were extracted heuristically and should be double-checked.",
            ));
    }
    result
}

/// A reply that yielded nothing at all, even heuristically.
pub(crate) fn unparseable(agent: &str, stage_hint: &str) -> AgentResult {
    warn!(agent, "Reply could not be parsed, even heuristically");
    AgentResult::needs_iteration(
        None,
        ContextPatch::default(),
        Feedback::warning(format!("I couldn't make sense of the {} reply.", agent)).with_action(stage_hint),
    )
    .with_diagnostic(format!("{} output was unparseable", agent))
}

/// User-facing rendering of a stage output.
pub fn render_output(output: &StageOutput) -> String {
    match output {
        StageOutput::Formulation(o) => {
            let mut text = format!(
                "**Causal question**\n- Treatment: {}\n- Outcome: {}",
                o.treatment.as_deref().unwrap_or("(unclear)"),
                o.outcome.as_deref().unwrap_or("(unclear)")
            );
            if !o.confounders.is_empty() {
                text.push_str(&format!("\n- Candidate confounders: {}", o.confounders.join(", ")));
            }
            if let Some(population) = &o.population {
                text.push_str(&format!("\n- Population: {}", population));
            }
            text
        }
        StageOutput::Eda(o) => {
            let mut text = String::from("**Exploratory checks**");
            if !o.summary.is_empty() {
                text.push_str(&format!("\n{}", o.summary));
            }
            for check in &o.checks {
                let mark = match check.passed {
                    Some(true) => "pass",
                    Some(false) => "FAIL",
                    None => "n/a",
                };
                text.push_str(&format!("\n- [{}] {}: {}", mark, check.name, check.detail));
            }
            for v in &o.violations {
                text.push_str(&format!("\n- {:?} violation of {}: {}", v.severity, v.assumption, v.description));
            }
            if let Some(code) = &o.code {
                text.push_str(&format!("\n\n```python\n{}\n```", code.trim()));
            }
            if let Some(out) = &o.execution_output {
                text.push_str(&format!("\n\nOutput:\n```\n{}\n```", out.trim()));
            }
            text
        }
        StageOutput::Identification(o) => format!(
            "**Identification** ({})\n- Adjustment set: {{{}}}\n{}",
            if o.strategy.is_empty() { "strategy unspecified" } else { o.strategy.as_str() },
            o.adjustment_set.join(", "),
            o.rationale
        ),
        StageOutput::Estimation(o) => {
            let mut text = format!("**Estimation** via {}", if o.method.is_empty() { "(unspecified)" } else { o.method.as_str() });
            if let Some(est) = &o.estimate {
                text.push_str(&format!("\n- Effect: {:.4}", est.effect));
                if let Some((lo, hi)) = est.confidence_interval {
                    text.push_str(&format!(" (95% CI {:.4} to {:.4})", lo, hi));
                }
                if let Some(p) = est.p_value {
                    text.push_str(&format!(", p = {:.4}", p));
                }
            }
            if !o.interpretation.is_empty() {
                text.push_str(&format!("\n{}", o.interpretation));
            }
            if let Some(code) = &o.code {
                text.push_str(&format!("\n\n```python\n{}\n```", code.trim()));
            }
            text
        }
        StageOutput::Dataset(ds) => format!(
            "Loaded dataset **{}**: {} rows, {} columns ({})",
            ds.name,
            ds.row_count,
            ds.columns.len(),
            ds.columns.join(", ")
        ),
        StageOutput::Answer { text } => text.clone(),
    }
}
