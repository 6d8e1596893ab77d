// Test doubles for the completion service and the code executor.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::executor::{CodeExecutor, ExecuteOptions, ExecutionError, ExecutionOutput, ExecutionResult};
use crate::llm::LLMAdapter;
use crate::types::{AppError, AppResult, LLMRequest, LLMResponse, TokenUsage};

/// Replays canned replies in order; errors once the script runs out.
pub struct ScriptedLLM {
    replies: Mutex<VecDeque<AppResult<String>>>,
    always_fail: bool,
    requests: Mutex<Vec<LLMRequest>>,
}

impl ScriptedLLM {
    pub fn new(replies: Vec<AppResult<String>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            always_fail: false,
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Every call fails with a service-invocation error.
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(VecDeque::new()),
            always_fail: true,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<LLMRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl LLMAdapter for ScriptedLLM {
    async fn create_chat_completion(&self, request: &LLMRequest) -> AppResult<LLMResponse> {
        self.requests.lock().unwrap().push(request.clone());
        if self.always_fail {
            return Err(AppError::ServiceInvocation("connection refused".to_string()));
        }
        let next = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(AppError::ServiceInvocation("script exhausted".to_string())));
        next.map(|content| LLMResponse {
            content,
            finish_reason: "stop".to_string(),
            usage: TokenUsage::default(),
        })
    }
}

/// Returns the same canned result for every cell and records the code it saw.
pub struct FakeExecutor {
    result: ExecutionResult,
    executed: Mutex<Vec<String>>,
}

impl FakeExecutor {
    pub fn printing(stdout: &str) -> Self {
        Self {
            result: ExecutionResult {
                success: true,
                outputs: vec![ExecutionOutput::stream(stdout)],
                error: None,
                execution_time_ms: 1,
            },
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(name: &str, message: &str) -> Self {
        Self {
            result: ExecutionResult {
                success: false,
                outputs: Vec::new(),
                error: Some(ExecutionError {
                    name: name.to_string(),
                    message: message.to_string(),
                    traceback: Vec::new(),
                }),
                execution_time_ms: 1,
            },
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl CodeExecutor for FakeExecutor {
    async fn connect(&self, _target: &str) -> AppResult<()> {
        Ok(())
    }

    async fn execute(&self, code: &str, _options: ExecuteOptions) -> AppResult<ExecutionResult> {
        self.executed.lock().unwrap().push(code.to_string());
        Ok(self.result.clone())
    }

    async fn get_variable(&self, _name: &str) -> AppResult<Option<serde_json::Value>> {
        Ok(None)
    }

    async fn disconnect(&self) -> AppResult<()> {
        Ok(())
    }
}
