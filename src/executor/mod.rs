//! Code Execution Service
//!
//! The contract the stage agents use to run generated analysis code, plus a
//! local Python implementation. The orchestration core never retries a
//! timed-out call and keeps at most one call outstanding per session.

pub mod python;

pub use python::PythonExecutor;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::ExecutorConfig;
use crate::types::AppResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputType {
    Stream,
    DisplayData,
    ExecuteResult,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    pub output_type: OutputType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl ExecutionOutput {
    pub fn stream(text: impl Into<String>) -> Self {
        Self {
            output_type: OutputType::Stream,
            text: Some(text.into()),
            data: None,
            metadata: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub name: String,
    pub message: String,
    pub traceback: Vec<String>,
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub outputs: Vec<ExecutionOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    pub execution_time_ms: u64,
}

impl ExecutionResult {
    /// Concatenated text of all stream outputs.
    pub fn stdout(&self) -> String {
        self.outputs
            .iter()
            .filter(|o| o.output_type == OutputType::Stream)
            .filter_map(|o| o.text.as_deref())
            .collect::<Vec<_>>()
            .join("")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecuteOptions {
    pub timeout: Option<Duration>,
    /// Run without recording the cell in session state.
    pub silent: bool,
}

#[async_trait]
pub trait CodeExecutor: Send + Sync {
    async fn connect(&self, target: &str) -> AppResult<()>;

    async fn execute(&self, code: &str, options: ExecuteOptions) -> AppResult<ExecutionResult>;

    async fn get_variable(&self, name: &str) -> AppResult<Option<serde_json::Value>>;

    async fn disconnect(&self) -> AppResult<()>;
}

/// A connected local executor when `PYTHON_EXECUTABLE` is set, otherwise `None`.
pub async fn from_config(config: &ExecutorConfig) -> Option<Arc<dyn CodeExecutor>> {
    let interpreter = config.python_executable.as_deref()?;
    let executor = PythonExecutor::new(Duration::from_secs(config.timeout_secs));
    match executor.connect(interpreter).await {
        Ok(()) => Some(Arc::new(executor)),
        Err(e) => {
            warn!(interpreter, error = %e, "Code executor unavailable; generated code will not run");
            None
        }
    }
}
