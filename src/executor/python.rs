// Local Python executor: one interpreter process per cell, with session state
// rebuilt by replaying earlier successful cells (stdout suppressed).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{CodeExecutor, ExecuteOptions, ExecutionError, ExecutionOutput, ExecutionResult, OutputType};
use crate::types::{AppError, AppResult};

#[derive(Default)]
struct KernelState {
    interpreter: Option<String>,
    cells: Vec<String>,
}

pub struct PythonExecutor {
    default_timeout: Duration,
    // Held for the whole call so a session never has two executions in flight.
    state: Mutex<KernelState>,
}

impl PythonExecutor {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            default_timeout,
            state: Mutex::new(KernelState::default()),
        }
    }

    fn build_script(prior_cells: &[String], code: &str) -> AppResult<String> {
        let engine = base64::engine::general_purpose::STANDARD;
        let prior = serde_json::to_string(prior_cells)
            .map_err(|e| AppError::Internal(format!("Failed to encode cell history: {}", e)))?;

        Ok(format!(
            r#"import base64, contextlib, io, json
__oc_ns = {{"__name__": "__main__"}}
with contextlib.redirect_stdout(io.StringIO()):
    for __oc_cell in json.loads(base64.b64decode("{prior}").decode("utf-8")):
        exec(compile(__oc_cell, "<history>", "exec"), __oc_ns)
exec(compile(base64.b64decode("{code}").decode("utf-8"), "<cell>", "exec"), __oc_ns)
"#,
            prior = engine.encode(prior),
            code = engine.encode(code),
        ))
    }

    fn parse_error(stderr: &str) -> ExecutionError {
        let traceback: Vec<String> = stderr.lines().map(|l| l.to_string()).collect();
        let last = traceback
            .iter()
            .rev()
            .find(|l| !l.trim().is_empty())
            .cloned()
            .unwrap_or_default();

        let (name, message) = match last.split_once(": ") {
            Some((name, message)) if !name.contains(' ') => (name.to_string(), message.to_string()),
            _ if last.trim().is_empty() => ("Error".to_string(), "process exited with an error".to_string()),
            _ => ("Error".to_string(), last.trim().to_string()),
        };

        ExecutionError {
            name,
            message,
            traceback,
        }
    }

    fn is_identifier(name: &str) -> bool {
        let mut chars = name.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    }
}

#[async_trait]
impl CodeExecutor for PythonExecutor {
    async fn connect(&self, target: &str) -> AppResult<()> {
        let probe = timeout(
            Duration::from_secs(10),
            Command::new(target).arg("--version").output(),
        )
        .await;

        match probe {
            Ok(Ok(output)) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
                info!(interpreter = %target, version = %version, "Code executor connected");
                let mut state = self.state.lock().await;
                state.interpreter = Some(target.to_string());
                state.cells.clear();
                Ok(())
            }
            Ok(Ok(output)) => Err(AppError::ServiceInvocation(format!(
                "Interpreter {} exited with {}",
                target, output.status
            ))),
            Ok(Err(e)) => Err(AppError::ServiceInvocation(format!(
                "Failed to start interpreter {}: {}",
                target, e
            ))),
            Err(_) => Err(AppError::ServiceInvocation(format!(
                "Interpreter {} did not respond",
                target
            ))),
        }
    }

    async fn execute(&self, code: &str, options: ExecuteOptions) -> AppResult<ExecutionResult> {
        let mut state = self.state.lock().await;
        let interpreter = state
            .interpreter
            .clone()
            .ok_or_else(|| AppError::Execution("Code executor is not connected".to_string()))?;

        let script = Self::build_script(&state.cells, code)?;
        let limit = options.timeout.unwrap_or(self.default_timeout);
        let start = Instant::now();

        let mut cmd = Command::new(&interpreter);
        cmd.arg("-c").arg(script).kill_on_drop(true);

        let output = timeout(limit, cmd.output()).await;
        let elapsed = start.elapsed().as_millis() as u64;

        match output {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                let success = output.status.success();

                let mut outputs = Vec::new();
                if !stdout.is_empty() {
                    outputs.push(ExecutionOutput::stream(stdout));
                }

                let error = if success {
                    if !stderr.trim().is_empty() {
                        outputs.push(ExecutionOutput {
                            output_type: OutputType::Stream,
                            text: Some(stderr),
                            data: None,
                            metadata: Some(serde_json::json!({ "name": "stderr" })),
                        });
                    }
                    if !options.silent {
                        state.cells.push(code.to_string());
                    }
                    None
                } else {
                    let error = Self::parse_error(&stderr);
                    outputs.push(ExecutionOutput {
                        output_type: OutputType::Error,
                        text: Some(error.to_string()),
                        data: None,
                        metadata: None,
                    });
                    Some(error)
                };

                debug!(success, execution_time_ms = elapsed, "Cell executed");
                Ok(ExecutionResult {
                    success,
                    outputs,
                    error,
                    execution_time_ms: elapsed,
                })
            }
            Ok(Err(e)) => Err(AppError::Execution(format!("Failed to run interpreter: {}", e))),
            Err(_) => {
                warn!(timeout_ms = limit.as_millis() as u64, "Cell timed out");
                Ok(ExecutionResult {
                    success: false,
                    outputs: Vec::new(),
                    error: Some(ExecutionError {
                        name: "TimeoutError".to_string(),
                        message: format!("Execution timed out after {}ms", limit.as_millis()),
                        traceback: Vec::new(),
                    }),
                    execution_time_ms: elapsed,
                })
            }
        }
    }

    async fn get_variable(&self, name: &str) -> AppResult<Option<serde_json::Value>> {
        if !Self::is_identifier(name) {
            return Err(AppError::InvalidRequest(format!("Not a variable name: {}", name)));
        }

        let code = format!("import json as __oc_json\nprint(__oc_json.dumps({}, default=str))", name);
        let result = self
            .execute(&code, ExecuteOptions { timeout: None, silent: true })
            .await?;

        if let Some(error) = &result.error {
            if error.name == "NameError" {
                return Ok(None);
            }
            return Err(AppError::Execution(error.to_string()));
        }

        let stdout = result.stdout();
        let last = stdout.lines().last().unwrap_or_default();
        serde_json::from_str(last)
            .map(Some)
            .map_err(|e| AppError::ResponseParse(format!("Variable {} is not JSON-serializable: {}", name, e)))
    }

    async fn disconnect(&self) -> AppResult<()> {
        let mut state = self.state.lock().await;
        state.interpreter = None;
        state.cells.clear();
        Ok(())
    }
}
