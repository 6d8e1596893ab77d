//! Session Registry
//!
//! Sessions are keyed by [`SessionId`]. Each one is owned by a spawned task
//! that drains a bounded command queue, so turn N+1 only starts after turn
//! N has merged its context. Callers talk to it through [`SessionRegistry`].

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::router::Orchestrator;
use crate::config::{Config, ExecutorConfig};
use crate::display::{DisplayMessage, TurnCollector};
use crate::executor::{self, CodeExecutor};
use crate::models::{SessionId, Stage, WorkflowSession};
use crate::types::{AppError, AppResult};

/// What one turn produced, captured before the next turn can start.
#[derive(Debug, Clone)]
pub struct TurnReply {
    pub current_stage: Stage,
    pub messages: Vec<DisplayMessage>,
}

pub enum SessionCommand {
    Message {
        text: String,
        reply: oneshot::Sender<TurnReply>,
    },
    Snapshot {
        reply: oneshot::Sender<WorkflowSession>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
pub struct SessionRegistry {
    orchestrator: Arc<Orchestrator>,
    executor_config: ExecutorConfig,
    queue_depth: usize,
    inner: Arc<RwLock<HashMap<SessionId, mpsc::Sender<SessionCommand>>>>,
}

impl SessionRegistry {
    pub fn new(orchestrator: Arc<Orchestrator>, config: &Config) -> Self {
        Self {
            orchestrator,
            executor_config: config.executor.clone(),
            queue_depth: config.sessions.queue_depth.max(1),
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn create(&self) -> SessionId {
        let id = Uuid::new_v4();
        let executor = executor::from_config(&self.executor_config).await;
        let (tx, rx) = mpsc::channel(self.queue_depth);

        tokio::spawn(run_session(
            WorkflowSession::new(id),
            self.orchestrator.clone(),
            executor,
            rx,
        ));
        self.inner.write().await.insert(id, tx);

        info!(session_id = %id, "Session created");
        id
    }

    pub async fn send_message(&self, id: SessionId, text: impl Into<String>) -> AppResult<TurnReply> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(AppError::InvalidRequest("Message must not be empty".to_string()));
        }
        let (reply, rx) = oneshot::channel();
        self.send(id, SessionCommand::Message { text, reply }).await?;
        rx.await.map_err(|_| AppError::SessionClosed(id.to_string()))
    }

    pub async fn snapshot(&self, id: SessionId) -> AppResult<WorkflowSession> {
        let (reply, rx) = oneshot::channel();
        self.send(id, SessionCommand::Snapshot { reply }).await?;
        rx.await.map_err(|_| AppError::SessionClosed(id.to_string()))
    }

    pub async fn close(&self, id: SessionId) -> AppResult<()> {
        let tx = self
            .inner
            .write()
            .await
            .remove(&id)
            .ok_or_else(|| AppError::NotFound(format!("Session {} not found", id)))?;

        let (reply, rx) = oneshot::channel();
        if tx.send(SessionCommand::Close { reply }).await.is_ok() {
            let _ = rx.await;
        }
        info!(session_id = %id, "Session closed");
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn send(&self, id: SessionId, command: SessionCommand) -> AppResult<()> {
        let tx = self
            .inner
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Session {} not found", id)))?;

        tx.send(command)
            .await
            .map_err(|_| AppError::SessionClosed(id.to_string()))
    }
}

async fn run_session(
    mut session: WorkflowSession,
    orchestrator: Arc<Orchestrator>,
    executor: Option<Arc<dyn CodeExecutor>>,
    mut rx: mpsc::Receiver<SessionCommand>,
) {
    let id = session.id;
    while let Some(command) = rx.recv().await {
        match command {
            SessionCommand::Message { text, reply } => {
                let collector = TurnCollector::new();
                orchestrator
                    .process_message(&mut session, &text, executor.as_deref(), &collector)
                    .await;
                let turn = TurnReply {
                    current_stage: session.current_stage,
                    messages: collector.into_messages(),
                };
                if reply.send(turn).is_err() {
                    debug!(session_id = %id, "Caller went away before the turn finished");
                }
            }
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(session.clone());
            }
            SessionCommand::Close { reply } => {
                let _ = reply.send(());
                break;
            }
        }
    }

    if let Some(executor) = executor {
        if let Err(e) = executor.disconnect().await {
            warn!(session_id = %id, error = %e, "Failed to disconnect code executor");
        }
    }
    debug!(session_id = %id, "Session task finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentRegistry, DatasetLoader, GeneralAgent};
    use crate::models::Role;
    use crate::planner::IntentPlanner;

    fn registry() -> SessionRegistry {
        let orchestrator = Orchestrator::new(
            IntentPlanner::new(None, 6),
            AgentRegistry::standard(None),
            DatasetLoader::new("."),
            GeneralAgent::new(None),
        );
        SessionRegistry::new(Arc::new(orchestrator), &Config::default())
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let registry = registry();
        let a = registry.create().await;
        let b = registry.create().await;
        assert_ne!(a, b);
        assert_eq!(registry.len().await, 2);

        tokio_test::assert_ok!(registry.send_message(a, "hi").await);

        assert_eq!(registry.snapshot(a).await.unwrap().conversation_history[0].content, "hi");
        assert!(registry.snapshot(b).await.unwrap().conversation_history.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_turns_are_serialized() {
        let registry = registry();
        let id = registry.create().await;

        let (first, second) = tokio::join!(
            registry.send_message(id, "y"),
            registry.send_message(id, "next")
        );
        assert!(!first.unwrap().messages.is_empty());
        assert!(!second.unwrap().messages.is_empty());

        let history = registry.snapshot(id).await.unwrap().conversation_history;
        let user_positions: Vec<usize> = history
            .iter()
            .enumerate()
            .filter(|(_, e)| e.role == Role::User)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(user_positions.len(), 2);
        // Each turn's replies land before the next user message.
        assert!(user_positions[1] - user_positions[0] > 1);
        assert!(history.last().is_some_and(|e| e.role != Role::User));
    }

    #[tokio::test]
    async fn test_reply_carries_stage_after_turn() {
        let registry = registry();
        let id = registry.create().await;

        let reply = registry.send_message(id, "restart").await.unwrap();

        assert_eq!(reply.current_stage, Stage::Formulation);
        assert!(reply.messages.iter().any(|m| m.content.starts_with("Starting over")));
    }

    #[tokio::test]
    async fn test_close_removes_session() {
        let registry = registry();
        let id = registry.create().await;

        tokio_test::assert_ok!(registry.close(id).await);

        assert!(registry.is_empty().await);
        assert!(matches!(registry.send_message(id, "hi").await, Err(AppError::NotFound(_))));
        assert!(matches!(registry.close(id).await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_empty_message_rejected() {
        let registry = registry();
        let id = registry.create().await;
        assert!(matches!(
            registry.send_message(id, "   ").await,
            Err(AppError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let registry = registry();
        assert!(matches!(
            registry.snapshot(Uuid::new_v4()).await,
            Err(AppError::NotFound(_))
        ));
    }
}
