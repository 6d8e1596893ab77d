//! Stage Router
//!
//! Processes one user turn against one session:
//!
//! 1. append the message to the conversation history
//! 2. re-surface a stage that is waiting for another iteration
//! 3. classify the message with the [`IntentPlanner`]
//! 4. gate on [`prerequisites::check`]; a non-empty result stops the turn
//! 5. dispatch to the matching handler and merge its declared writes
//! 6. update stage state and auto-advance (forward only)
//! 7. emit next-step suggestions
//!
//! Handler failures never escape a turn; they become exactly one error
//! message on the display sink.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::agents::{render_output, AgentRegistry, DatasetLoader, GeneralAgent, StageAgent};
use crate::config::Config;
use crate::context::ContextField;
use crate::display::{DisplayKind, DisplayMessage, DisplaySink};
use crate::executor::CodeExecutor;
use crate::llm::LLM;
use crate::models::{AgentResult, IterationRecord, Role, Stage, StageStatus, Task, WorkflowSession};
use crate::planner::{prerequisites, IntentPlanner, IntentType, PlannerResult};

pub struct Orchestrator {
    planner: IntentPlanner,
    agents: AgentRegistry,
    dataset_loader: DatasetLoader,
    general: GeneralAgent,
}

/// Emits to the sink and records the message in the session history.
struct Turn<'a> {
    session: &'a mut WorkflowSession,
    sink: &'a dyn DisplaySink,
}

impl Turn<'_> {
    fn emit(&mut self, message: DisplayMessage) {
        let role = match message.kind {
            DisplayKind::AssistantMessage => Role::Assistant,
            DisplayKind::SystemMessage | DisplayKind::Error => Role::System,
        };
        self.session.append(role, message.content.clone());
        self.sink.emit(message);
    }
}

impl Orchestrator {
    pub fn new(
        planner: IntentPlanner,
        agents: AgentRegistry,
        dataset_loader: DatasetLoader,
        general: GeneralAgent,
    ) -> Self {
        Self {
            planner,
            agents,
            dataset_loader,
            general,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let llm = LLM::from_config(&config.llm);
        if llm.is_none() {
            warn!(
                provider = %config.llm.provider,
                "No API key configured; planner will use keyword fallback and stage agents will fail"
            );
        }
        Self::new(
            IntentPlanner::new(llm.clone(), config.planner.history_window),
            AgentRegistry::standard(llm.clone()),
            DatasetLoader::new(config.executor.data_dir.clone()),
            GeneralAgent::new(llm),
        )
    }

    pub async fn process_message(
        &self,
        session: &mut WorkflowSession,
        message: &str,
        executor: Option<&dyn CodeExecutor>,
        sink: &dyn DisplaySink,
    ) {
        let session_id = session.id;
        let history_len = session.conversation_history.len();
        session.append(Role::User, message);
        let mut turn = Turn { session, sink };

        if let Some(stage) = turn.session.pending_iteration {
            Self::resurface(&mut turn, stage);
        }

        let plan = self
            .planner
            .analyze(
                message,
                &turn.session.conversation_history[..history_len],
                &turn.session.shared_context,
                turn.session.current_stage,
            )
            .await;

        if plan.intent.kind == IntentType::WorkflowControl {
            Self::handle_control(&mut turn, &plan);
        } else {
            let mut missing = prerequisites::check(&plan, &turn.session.shared_context);
            if let Some(blocker) = plan.intent.kind.stage().and_then(|s| critical_blocker(turn.session, s)) {
                missing.push(format!(
                    "the critical assumption violation found during {} must be resolved",
                    blocker
                ));
            }
            if missing.is_empty() {
                self.dispatch(&mut turn, &plan, message, executor).await;
            } else {
                info!(session_id = %session_id, intent = ?plan.intent.kind, missing = ?missing, "Prerequisites unmet, not dispatching");
                let listed = missing.iter().map(|m| format!("- {}", m)).collect::<Vec<_>>().join("\n");
                turn.emit(
                    DisplayMessage::assistant(format!("Before I can do that:\n{}", listed))
                        .at_stage(turn.session.current_stage)
                        .with_metadata(serde_json::json!({ "missing": missing })),
                );
            }
        }

        let suggestions = self
            .planner
            .suggest_next_steps(&turn.session.shared_context, turn.session.current_stage)
            .await;
        if let Some(stage) = plan.intent.kind.stage() {
            if let Some(last) = turn.session.stage_state_mut(stage).last_result.as_mut() {
                last.suggested_next_steps = suggestions.clone();
            }
        }
        let listed = suggestions.iter().map(|s| format!("- {}", s)).collect::<Vec<_>>().join("\n");
        turn.emit(
            DisplayMessage::assistant(format!("Next steps:\n{}", listed))
                .from_agent("planner")
                .with_metadata(serde_json::json!({ "suggestions": suggestions })),
        );
    }

    fn resurface(turn: &mut Turn<'_>, stage: Stage) {
        let feedback = turn
            .session
            .stage_state(stage)
            .and_then(|s| s.last_result.as_ref())
            .and_then(|r| r.feedback.clone());

        let mut content = format!("The {} stage still needs another pass.", stage);
        if let Some(feedback) = feedback {
            content.push_str(&format!(" {}", feedback.message));
            if let Some(action) = feedback.suggested_action {
                content.push_str(&format!(" Suggested: {}.", action));
            }
        }
        debug!(session_id = %turn.session.id, stage = ?stage, "Re-surfacing pending stage");
        turn.emit(DisplayMessage::system(content).at_stage(stage));
    }

    fn handle_control(turn: &mut Turn<'_>, plan: &PlannerResult) {
        let subtype = plan.intent.subtype.as_deref().unwrap_or("continue");
        info!(session_id = %turn.session.id, subtype, "Workflow control");

        if subtype == "restart" {
            turn.session.restart();
            turn.emit(
                DisplayMessage::system("Starting over. The analysis context has been cleared.")
                    .at_stage(Stage::Formulation),
            );
            return;
        }

        let stage = turn.session.current_stage;
        let content = match turn.session.pending_iteration {
            Some(pending) => format!(
                "We're still on the {} stage. Tell me how you'd like to address the feedback above, or ask to rerun it.",
                pending
            ),
            None => format!("We're at the {} stage. {}", stage, stage_prompt(stage)),
        };
        turn.emit(DisplayMessage::system(content).at_stage(stage));
    }

    async fn dispatch(
        &self,
        turn: &mut Turn<'_>,
        plan: &PlannerResult,
        message: &str,
        executor: Option<&dyn CodeExecutor>,
    ) {
        let session_id = turn.session.id;
        let kind = plan.intent.kind;
        let mut task = Task::for_message(
            kind.stage().unwrap_or(turn.session.current_stage),
            plan.intent.user_goal.clone(),
            message,
        );
        task.input["causal_spec"] = serde_json::to_value(&plan.causal_spec).unwrap_or_default();

        match kind {
            IntentType::GeneralQuestion => {
                let result = self
                    .general
                    .execute(
                        &task,
                        plan.intent.subtype.as_deref(),
                        &turn.session.shared_context,
                        turn.session.current_stage,
                    )
                    .await;
                Self::apply_side_result(turn, self.general.name(), result, &[]);
            }
            IntentType::DatasetOperation => {
                let result = self.dataset_loader.execute(&task).await;
                Self::apply_side_result(turn, self.dataset_loader.name(), result, DatasetLoader::WRITES);
            }
            _ => {
                let Some(stage) = kind.stage() else {
                    return;
                };
                match self.agents.get(stage) {
                    Some(agent) => self.run_stage(turn, agent, &task, executor).await,
                    None => {
                        info!(session_id = %session_id, stage = ?stage, "No agent registered for stage");
                        turn.emit(
                            DisplayMessage::system(format!(
                                "The {} stage has no handler configured and is skipped in this workflow.",
                                stage
                            ))
                            .at_stage(stage),
                        );
                    }
                }
            }
        }
    }

    /// Results from handlers outside the stage pipeline: merge and report only.
    fn apply_side_result(turn: &mut Turn<'_>, agent: &str, result: AgentResult, writes: &[ContextField]) {
        if !result.success {
            turn.emit(failure_message(agent, &result, None));
            return;
        }
        let merge = turn.session.shared_context.merge(&result.patch, writes);
        if !merge.rejected.is_empty() {
            warn!(agent, rejected = ?merge.rejected, "Dropped undeclared context writes");
        }
        turn.session.shared_context = merge.context;

        if let Some(data) = &result.data {
            turn.emit(DisplayMessage::assistant(render_output(data)).from_agent(agent));
        }
        if let Some(feedback) = &result.feedback {
            turn.emit(DisplayMessage::system(feedback_text(feedback)).from_agent(agent));
        }
    }

    async fn run_stage(
        &self,
        turn: &mut Turn<'_>,
        agent: Arc<dyn StageAgent>,
        task: &Task,
        executor: Option<&dyn CodeExecutor>,
    ) {
        let session_id = turn.session.id;
        let stage = agent.stage();
        let attempt = {
            let state = turn.session.stage_state_mut(stage);
            state.status = StageStatus::InProgress;
            state.attempts += 1;
            state.attempts
        };
        info!(session_id = %session_id, stage = ?stage, agent = agent.name(), attempt, "Dispatching stage agent");

        let visible = turn.session.shared_context.view(agent.reads());
        let result = agent.execute(task, &visible, executor).await;
        debug_assert!(result.is_consistent());

        let record = IterationRecord {
            attempt,
            timestamp: Utc::now(),
            action: task.description.clone(),
            result: result.data.as_ref().and_then(|d| serde_json::to_value(d).ok()),
        };

        if !result.success {
            warn!(session_id = %session_id, stage = ?stage, error = ?result.error, "Stage agent failed");
            turn.emit(failure_message(agent.name(), &result, Some(stage)));
            let state = turn.session.stage_state_mut(stage);
            state.status = StageStatus::Failed;
            state.iterations.push(record);
            state.last_result = Some(result);
            return;
        }

        let merge = turn.session.shared_context.merge(&result.patch, agent.writes());
        if !merge.rejected.is_empty() {
            warn!(session_id = %session_id, agent = agent.name(), rejected = ?merge.rejected, "Dropped undeclared context writes");
        }
        debug!(session_id = %session_id, applied = ?merge.applied, "Context merged");
        turn.session.shared_context = merge.context;

        if let Some(data) = &result.data {
            let mut msg = DisplayMessage::assistant(render_output(data))
                .from_agent(agent.name())
                .at_stage(stage);
            if !result.diagnostics.is_empty() {
                msg = msg.with_metadata(serde_json::json!({ "diagnostics": result.diagnostics }));
            }
            turn.emit(msg);
        }
        if let Some(feedback) = &result.feedback {
            turn.emit(
                DisplayMessage::system(feedback_text(feedback))
                    .from_agent(agent.name())
                    .at_stage(stage),
            );
        }

        let substantive = result.data.as_ref().is_some_and(|d| d.is_substantive());
        let advance = !result.requires_iteration && !result.has_critical_violation() && substantive;

        if advance {
            if turn.session.pending_iteration == Some(stage) {
                turn.session.pending_iteration = None;
            }
            let state = turn.session.stage_state_mut(stage);
            state.status = StageStatus::Completed;
            state.iterations.push(record);
            state.last_result = Some(result);
            self.advance_from(turn, stage);
        } else {
            info!(session_id = %session_id, stage = ?stage, "Stage needs another iteration");
            turn.session.pending_iteration = Some(stage);
            let state = turn.session.stage_state_mut(stage);
            state.status = StageStatus::InProgress;
            state.iterations.push(record);
            state.last_result = Some(result);
        }
    }

    /// Move to the next registered stage, never backwards and never past Estimation.
    fn advance_from(&self, turn: &mut Turn<'_>, completed: Stage) {
        let Some(next) = self.agents.next_registered_after(completed) else {
            debug!(session_id = %turn.session.id, stage = ?completed, "Final stage completed");
            return;
        };
        if next <= turn.session.current_stage {
            return;
        }
        if let Some(pending) = turn.session.pending_iteration.filter(|p| *p < next) {
            debug!(session_id = %turn.session.id, pending = ?pending, "Earlier stage still pending, not advancing");
            return;
        }
        info!(session_id = %turn.session.id, from = ?turn.session.current_stage, to = ?next, "Advancing stage");
        turn.session.current_stage = next;
        turn.emit(
            DisplayMessage::system(format!("{} complete. Moving on to {}.", completed, next)).at_stage(next),
        );
    }
}

/// An earlier stage still waiting on a critical assumption violation.
fn critical_blocker(session: &WorkflowSession, target: Stage) -> Option<Stage> {
    let pending = session.pending_iteration.filter(|p| *p < target)?;
    session
        .stage_state(pending)
        .and_then(|s| s.last_result.as_ref())
        .is_some_and(|r| r.has_critical_violation())
        .then_some(pending)
}

fn failure_message(agent: &str, result: &AgentResult, stage: Option<Stage>) -> DisplayMessage {
    let mut content = result
        .error
        .clone()
        .unwrap_or_else(|| format!("The {} step failed.", agent));
    if let Some(action) = result.feedback.as_ref().and_then(|f| f.suggested_action.as_deref()) {
        content.push_str(&format!(" Suggested: {}.", action));
    }
    let msg = DisplayMessage::error(content).from_agent(agent);
    match stage {
        Some(stage) => msg.at_stage(stage),
        None => msg,
    }
}

fn feedback_text(feedback: &crate::models::Feedback) -> String {
    match &feedback.suggested_action {
        Some(action) => format!("{} Suggested: {}.", feedback.message, action),
        None => feedback.message.clone(),
    }
}

fn stage_prompt(stage: Stage) -> &'static str {
    match stage {
        Stage::Formulation => "Tell me the causal question, e.g. \"Does aspirin reduce heart attacks?\"",
        Stage::Eda => "Load a dataset or ask me to check overlap and missing data.",
        Stage::Dag => "Describe how the variables relate to each other.",
        Stage::Identification => "Ask \"what should I adjust for?\"",
        Stage::Estimation => "Ask me to estimate the effect.",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SharedContext;
    use crate::display::TurnCollector;
    use crate::models::DatasetDescriptor;
    use crate::testing::ScriptedLLM;
    use uuid::Uuid;

    fn orchestrator(replies: Vec<&str>) -> (Orchestrator, Arc<ScriptedLLM>) {
        let scripted = ScriptedLLM::new(replies.into_iter().map(|r| Ok(r.to_string())).collect());
        let llm = LLM::new(scripted.clone(), "test");
        (
            Orchestrator::new(
                IntentPlanner::new(None, 6),
                AgentRegistry::standard(Some(llm.clone())),
                DatasetLoader::new("."),
                GeneralAgent::new(Some(llm)),
            ),
            scripted,
        )
    }

    fn formulated_with_dataset() -> SharedContext {
        SharedContext {
            treatment: Some("statin".to_string()),
            outcome: Some("mi".to_string()),
            dataset: Some(DatasetDescriptor {
                name: "cohort".to_string(),
                path: Some("cohort.csv".to_string()),
                row_count: 100,
                columns: vec!["statin".to_string(), "mi".to_string(), "age".to_string()],
            }),
            ..Default::default()
        }
    }

    fn errors(messages: &[DisplayMessage]) -> usize {
        messages.iter().filter(|m| m.kind == DisplayKind::Error).count()
    }

    #[tokio::test]
    async fn test_scenario_a_formulation_advances_to_eda() {
        let (orch, _) = orchestrator(vec![
            r#"{"treatment":"aspirin","outcome":"heart attacks","confounders":["age"]}"#,
        ]);
        let mut session = WorkflowSession::new(Uuid::new_v4());
        let sink = TurnCollector::new();

        orch.process_message(&mut session, "Does aspirin reduce heart attacks?", None, &sink)
            .await;

        assert_eq!(session.shared_context.treatment.as_deref(), Some("aspirin"));
        assert_eq!(session.shared_context.outcome.as_deref(), Some("heart attacks"));
        assert_eq!(session.current_stage, Stage::Eda);
        assert_eq!(
            session.stage_state(Stage::Formulation).unwrap().status,
            StageStatus::Completed
        );
        let messages = sink.into_messages();
        assert_eq!(errors(&messages), 0);
        assert!(messages.last().unwrap().content.starts_with("Next steps:"));
    }

    #[tokio::test]
    async fn test_scenario_b_unmet_prerequisites_block_dispatch() {
        let (orch, scripted) = orchestrator(vec![]);
        let mut session = WorkflowSession::new(Uuid::new_v4());
        let sink = TurnCollector::new();

        orch.process_message(&mut session, "estimate the effect", None, &sink).await;

        assert_eq!(scripted.call_count(), 0);
        assert_eq!(session.stage_state(Stage::Estimation).unwrap().attempts, 0);
        let messages = sink.into_messages();
        let blocked = &messages[0];
        assert_eq!(
            blocked.metadata,
            Some(serde_json::json!({ "missing": ["treatment and outcome must be defined"] }))
        );
    }

    #[tokio::test]
    async fn test_scenario_c_affirmative_invokes_no_agent() {
        let (orch, scripted) = orchestrator(vec![]);
        let mut session = WorkflowSession::new(Uuid::new_v4());
        let sink = TurnCollector::new();

        orch.process_message(&mut session, "y", None, &sink).await;

        assert_eq!(scripted.call_count(), 0);
        let messages = sink.into_messages();
        assert_eq!(messages[0].kind, DisplayKind::SystemMessage);
        assert!(messages[0].content.contains("Formulation"));
    }

    #[tokio::test]
    async fn test_scenario_d_critical_violation_blocks_advance() {
        let (orch, _) = orchestrator(vec![
            r#"{"summary":"No overlap above age 70.","checks":[],
                "violations":[{"assumption":"positivity","severity":"critical","description":"no untreated patients over 70"}]}"#,
        ]);
        let mut session = WorkflowSession::new(Uuid::new_v4());
        session.shared_context = formulated_with_dataset();
        session.current_stage = Stage::Eda;
        let sink = TurnCollector::new();

        orch.process_message(&mut session, "check overlap between groups", None, &sink)
            .await;

        assert_eq!(session.current_stage, Stage::Eda);
        assert_eq!(session.pending_iteration, Some(Stage::Eda));
        let state = session.stage_state(Stage::Eda).unwrap();
        assert!(state.last_result.as_ref().unwrap().requires_iteration);
        assert_eq!(state.status, StageStatus::InProgress);
        assert_eq!(session.shared_context.violations.len(), 1);

        // The next turn re-surfaces the pending stage before anything else.
        let sink = TurnCollector::new();
        orch.process_message(&mut session, "y", None, &sink).await;
        let messages = sink.into_messages();
        assert!(messages[0].content.contains("EDA stage still needs another pass"));
        assert_eq!(session.current_stage, Stage::Eda);
    }

    #[tokio::test]
    async fn test_critical_violation_blocks_later_stages() {
        let (orch, scripted) = orchestrator(vec![
            r#"{"summary":"No overlap above age 70.","checks":[],
                "violations":[{"assumption":"positivity","severity":"critical","description":"no untreated patients over 70"}]}"#,
            r#"{"adjustment_set":["age"],"strategy":"backdoor"}"#,
        ]);
        let mut session = WorkflowSession::new(Uuid::new_v4());
        session.shared_context = formulated_with_dataset();
        session.current_stage = Stage::Eda;

        orch.process_message(&mut session, "check overlap between groups", None, &TurnCollector::new())
            .await;
        assert_eq!(session.pending_iteration, Some(Stage::Eda));

        let sink = TurnCollector::new();
        orch.process_message(&mut session, "what should I adjust for?", None, &sink)
            .await;

        assert_eq!(scripted.call_count(), 1);
        assert_eq!(session.current_stage, Stage::Eda);
        assert_eq!(session.pending_iteration, Some(Stage::Eda));
        assert!(session.shared_context.adjustment_set.is_none());
        assert_eq!(session.stage_state(Stage::Identification).unwrap().attempts, 0);
        let messages = sink.into_messages();
        assert!(messages
            .iter()
            .any(|m| m.content.contains("critical assumption violation found during EDA")));
    }

    #[tokio::test]
    async fn test_pending_stage_holds_advance() {
        let (orch, _) = orchestrator(vec![r#"{"adjustment_set":["age"],"strategy":"backdoor"}"#]);
        let mut session = WorkflowSession::new(Uuid::new_v4());
        session.shared_context = formulated_with_dataset();
        session.current_stage = Stage::Eda;
        session.pending_iteration = Some(Stage::Eda);

        orch.process_message(&mut session, "what should I adjust for?", None, &TurnCollector::new())
            .await;

        assert_eq!(session.shared_context.adjustment_set, Some(vec!["age".to_string()]));
        assert_eq!(session.current_stage, Stage::Eda);
    }

    #[tokio::test]
    async fn test_scenario_e_service_failure_emits_one_error() {
        let llm = LLM::new(ScriptedLLM::failing(), "test");
        let orch = Orchestrator::new(
            IntentPlanner::new(Some(llm.clone()), 6),
            AgentRegistry::standard(Some(llm.clone())),
            DatasetLoader::new("."),
            GeneralAgent::new(Some(llm)),
        );
        let mut session = WorkflowSession::new(Uuid::new_v4());
        let before = session.shared_context.clone();
        let sink = TurnCollector::new();

        orch.process_message(&mut session, "Does aspirin reduce heart attacks?", None, &sink)
            .await;

        let messages = sink.into_messages();
        assert_eq!(errors(&messages), 1);
        assert_eq!(session.shared_context, before);
        assert_eq!(session.current_stage, Stage::Formulation);
        assert_eq!(
            session.stage_state(Stage::Formulation).unwrap().status,
            StageStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_restart_clears_context() {
        let (orch, _) = orchestrator(vec![]);
        let mut session = WorkflowSession::new(Uuid::new_v4());
        session.shared_context = formulated_with_dataset();
        session.current_stage = Stage::Identification;
        let sink = TurnCollector::new();

        orch.process_message(&mut session, "restart", None, &sink).await;

        assert_eq!(session.current_stage, Stage::Formulation);
        assert_eq!(session.shared_context, SharedContext::default());
        assert!(!session.conversation_history.is_empty());
    }

    #[tokio::test]
    async fn test_advance_is_forward_only() {
        let (orch, _) = orchestrator(vec![r#"{"treatment":"statin","outcome":"stroke"}"#]);
        let mut session = WorkflowSession::new(Uuid::new_v4());
        session.shared_context = formulated_with_dataset();
        session.current_stage = Stage::Estimation;
        let sink = TurnCollector::new();

        orch.process_message(&mut session, "Does statin reduce stroke?", None, &sink)
            .await;

        assert_eq!(session.current_stage, Stage::Estimation);
        assert_eq!(session.shared_context.outcome.as_deref(), Some("stroke"));
    }

    #[tokio::test]
    async fn test_identification_skips_unregistered_dag() {
        let (orch, _) = orchestrator(vec![r#"{"adjustment_set":["age"],"strategy":"backdoor"}"#]);
        let mut session = WorkflowSession::new(Uuid::new_v4());
        session.shared_context = formulated_with_dataset();
        session.current_stage = Stage::Eda;
        let sink = TurnCollector::new();

        orch.process_message(&mut session, "what should I adjust for?", None, &sink)
            .await;

        assert_eq!(session.current_stage, Stage::Estimation);
        assert_eq!(session.shared_context.adjustment_set, Some(vec!["age".to_string()]));
    }

    #[tokio::test]
    async fn test_dag_request_without_agent_is_reported() {
        let (orch, scripted) = orchestrator(vec![]);
        let mut session = WorkflowSession::new(Uuid::new_v4());
        session.shared_context = formulated_with_dataset();
        let sink = TurnCollector::new();

        orch.process_message(&mut session, "draw the causal graph", None, &sink).await;

        assert_eq!(scripted.call_count(), 0);
        let messages = sink.into_messages();
        assert!(messages[0].content.contains("no handler"));
    }

    #[tokio::test]
    async fn test_history_records_both_sides() {
        let (orch, _) = orchestrator(vec![]);
        let mut session = WorkflowSession::new(Uuid::new_v4());
        let sink = TurnCollector::new();

        orch.process_message(&mut session, "hi", None, &sink).await;

        assert_eq!(session.conversation_history[0].role, Role::User);
        assert_eq!(session.conversation_history[0].content, "hi");
        assert!(session
            .conversation_history
            .iter()
            .any(|e| e.role == Role::Assistant));
        assert!(!session.shared_context.confounders.iter().any(|c| c.is_empty()));
    }
}
