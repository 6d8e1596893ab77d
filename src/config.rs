use anyhow::Result;
use serde::Deserialize;
use std::env;

use crate::types::LLMProvider;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub llm: LLMConfig,
    pub planner: PlannerConfig,
    pub executor: ExecutorConfig,
    pub sessions: SessionConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub cors_allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LLMConfig {
    pub provider: LLMProvider,
    pub model: String,
    pub openai_api_key: String,
    pub anthropic_api_key: String,
    pub groq_api_key: String,
    pub base_url: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
}

impl LLMConfig {
    /// API key for the selected provider, if one is configured.
    pub fn active_api_key(&self) -> Option<String> {
        let key = match self.provider {
            LLMProvider::OpenAI => &self.openai_api_key,
            LLMProvider::Anthropic => &self.anthropic_api_key,
            LLMProvider::Groq => &self.groq_api_key,
        };
        if key.trim().is_empty() {
            None
        } else {
            Some(key.clone())
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlannerConfig {
    /// How many trailing history entries are embedded in the classification prompt.
    pub history_window: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    pub python_executable: Option<String>,
    pub timeout_secs: u64,
    /// Base directory for relative dataset paths.
    pub data_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub queue_depth: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            server: ServerConfig {
                port: env::var("PORT")
                    .unwrap_or_else(|_| "3000".to_string())
                    .parse()?,
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                cors_allowed_origins: env::var("ALLOWED_ORIGINS")
                    .unwrap_or_else(|_| "http://localhost:3000,http://localhost:5173".to_string())
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            },
            llm: LLMConfig {
                provider: env::var("LLM_PROVIDER")
                    .unwrap_or_else(|_| "openai".to_string())
                    .parse()?,
                model: env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
                openai_api_key: env::var("OPENAI_API_KEY").unwrap_or_default(),
                anthropic_api_key: env::var("ANTHROPIC_API_KEY").unwrap_or_default(),
                groq_api_key: env::var("GROQ_API_KEY").unwrap_or_default(),
                base_url: env::var("LLM_BASE_URL").ok().filter(|s| !s.trim().is_empty()),
                temperature: env::var("LLM_TEMPERATURE")
                    .unwrap_or_else(|_| "0.2".to_string())
                    .parse()?,
                max_tokens: env::var("LLM_MAX_TOKENS")
                    .unwrap_or_else(|_| "2048".to_string())
                    .parse()?,
                max_attempts: env::var("LLM_MAX_ATTEMPTS")
                    .unwrap_or_else(|_| "1".to_string())
                    .parse()?,
                retry_base_delay_ms: env::var("LLM_RETRY_BASE_DELAY_MS")
                    .unwrap_or_else(|_| "500".to_string())
                    .parse()?,
            },
            planner: PlannerConfig {
                history_window: env::var("PLANNER_HISTORY_WINDOW")
                    .unwrap_or_else(|_| "6".to_string())
                    .parse()?,
            },
            executor: ExecutorConfig {
                python_executable: env::var("PYTHON_EXECUTABLE").ok().filter(|s| !s.trim().is_empty()),
                timeout_secs: env::var("EXECUTION_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "60".to_string())
                    .parse()?,
                data_dir: env::var("DATA_DIR").unwrap_or_else(|_| ".".to_string()),
            },
            sessions: SessionConfig {
                queue_depth: env::var("SESSION_QUEUE_DEPTH")
                    .unwrap_or_else(|_| "16".to_string())
                    .parse()?,
            },
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                port: 3000,
                host: "0.0.0.0".to_string(),
                cors_allowed_origins: vec![],
            },
            llm: LLMConfig {
                provider: LLMProvider::OpenAI,
                model: "gpt-4o-mini".to_string(),
                openai_api_key: String::new(),
                anthropic_api_key: String::new(),
                groq_api_key: String::new(),
                base_url: None,
                temperature: 0.2,
                max_tokens: 2048,
                max_attempts: 1,
                retry_base_delay_ms: 500,
            },
            planner: PlannerConfig { history_window: 6 },
            executor: ExecutorConfig {
                python_executable: None,
                timeout_secs: 60,
                data_dir: ".".to_string(),
            },
            sessions: SessionConfig { queue_depth: 16 },
        }
    }
}
