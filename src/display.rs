//! Display Sink
//!
//! One-way push of user-visible messages. The router never reads anything
//! back from a sink.

use std::io::Write;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::models::Stage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayKind {
    AssistantMessage,
    SystemMessage,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayMessage {
    pub kind: DisplayKind,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl DisplayMessage {
    pub fn new(kind: DisplayKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            agent_name: None,
            stage: None,
            metadata: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(DisplayKind::AssistantMessage, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(DisplayKind::SystemMessage, content)
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::new(DisplayKind::Error, content)
    }

    pub fn from_agent(mut self, agent: &str) -> Self {
        self.agent_name = Some(agent.to_string());
        self
    }

    pub fn at_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

pub trait DisplaySink: Send + Sync {
    fn emit(&self, message: DisplayMessage);
}

/// Buffers the messages of one turn so they can be returned as a response.
#[derive(Default)]
pub struct TurnCollector {
    messages: Mutex<Vec<DisplayMessage>>,
}

impl TurnCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_messages(self) -> Vec<DisplayMessage> {
        self.messages.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> Vec<DisplayMessage> {
        match self.messages.lock() {
            Ok(messages) => messages.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl DisplaySink for TurnCollector {
    fn emit(&self, message: DisplayMessage) {
        match self.messages.lock() {
            Ok(mut messages) => messages.push(message),
            Err(poisoned) => poisoned.into_inner().push(message),
        }
    }
}

/// Plain-text rendering for the interactive CLI.
pub struct StdoutSink;

impl DisplaySink for StdoutSink {
    fn emit(&self, message: DisplayMessage) {
        let prefix = match (message.kind, &message.agent_name) {
            (DisplayKind::Error, _) => "[error]".to_string(),
            (DisplayKind::SystemMessage, _) => "[system]".to_string(),
            (DisplayKind::AssistantMessage, Some(agent)) => format!("[{}]", agent),
            (DisplayKind::AssistantMessage, None) => "[assistant]".to_string(),
        };
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{} {}\n", prefix, message.content);
    }
}
