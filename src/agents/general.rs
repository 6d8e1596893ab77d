//! Answers `general_question` messages. Greetings and help requests are
//! served from templates; anything else goes to the completion service with
//! the context summary attached.

use tracing::info;

use super::ask;
use crate::context::{ContextPatch, SharedContext};
use crate::llm::LLM;
use crate::models::{AgentResult, Feedback, Stage, StageOutput, Task};

const SYSTEM_PROMPT: &str = "You are a friendly causal-inference tutor. Answer briefly and concretely, in plain language, using the user's analysis context when it is relevant.";

const GREETING: &str = "Hello! I can walk you through a causal analysis: we formulate the question, explore the data, pick an adjustment set and estimate the effect. What would you like to find out?";

const HELP: &str = r#"Here is what I can do:
- Formulate a causal question: "Does aspirin reduce heart attacks?"
- Load a dataset: "load data/cohort.csv"
- Explore the data and check assumptions: "check overlap between treatment groups"
- Choose an adjustment set: "what should I adjust for?"
- Estimate the effect: "estimate the effect"
- Start over: "restart""#;

pub struct GeneralAgent {
    llm: Option<LLM>,
}

impl GeneralAgent {
    pub fn new(llm: Option<LLM>) -> Self {
        Self { llm }
    }

    pub fn name(&self) -> &'static str {
        "general"
    }

    pub async fn execute(
        &self,
        task: &Task,
        subtype: Option<&str>,
        context: &SharedContext,
        current_stage: Stage,
    ) -> AgentResult {
        match subtype {
            Some("greeting") => return answer(GREETING.to_string()),
            Some("help") => return answer(HELP.to_string()),
            _ => {}
        }

        info!(task_id = %task.id, "Answering general question");
        let prompt = format!(
            "CURRENT STAGE: {stage}\n\nANALYSIS CONTEXT:\n{summary}\n\nQUESTION:\n{question}",
            stage = current_stage,
            summary = context.summary(),
            question = task.message(),
        );

        match ask(self.llm.as_ref(), self.name(), SYSTEM_PROMPT, &prompt).await {
            Ok(reply) if !reply.trim().is_empty() => answer(reply.trim().to_string()),
            Ok(_) => AgentResult::needs_iteration(
                None,
                ContextPatch::default(),
                Feedback::warning("I didn't get an answer to that.").with_action("try rephrasing the question"),
            ),
            Err(failed) => failed,
        }
    }
}

fn answer(text: String) -> AgentResult {
    AgentResult::completed(StageOutput::Answer { text }, ContextPatch::default())
}
