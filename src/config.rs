//! Environment configuration
//!
//! Loaded once at start-up. Missing API keys are allowed here; the backend
//! reports them as `auth_error` on first use.

use crate::error::OrchestrationError;
use crate::llm::{anthropic, gemini, BackendConfig, RetryPolicy};
use crate::Result;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash";
const DEFAULT_REASONING_BASE_URL: &str = "https://api.deepseek.com/v1";
const DEFAULT_REASONING_MODEL: &str = "deepseek-reasoner";
const DEFAULT_MATH_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MATH_MODEL: &str = "o3-mini";
const DEFAULT_CFO_MODEL: &str = "claude-opus-4-20250514";
const DEFAULT_PORT: u16 = 8080;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub fast: BackendConfig,
    pub reasoning: BackendConfig,
    pub math: BackendConfig,
    pub cfo: BackendConfig,
    pub context_fetch_timeout: Duration,
    pub database_url: Option<String>,
    pub port: u16,
}

impl OrchestratorConfig {
    /// Read `.env` (if present) and the process environment.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let retry = RetryPolicy {
            max_attempts: parse_or(&get, "AI_MAX_RETRIES", 3u32)?.max(1),
            base_delay: Duration::from_millis(parse_or(&get, "AI_RETRY_BASE_MS", 1000u64)?),
            max_delay: Duration::from_millis(parse_or(&get, "AI_RETRY_MAX_MS", 10_000u64)?),
            ..RetryPolicy::default()
        };
        let request_timeout = Duration::from_secs(parse_or(&get, "AI_REQUEST_TIMEOUT_SECS", 60u64)?);

        let backend = |key_var: &str, model: String, base_url: String| {
            let api_key = get(key_var).unwrap_or_else(|| {
                warn!("{} not set; that backend will fail with auth_error", key_var);
                String::new()
            });
            BackendConfig::new(api_key, model, base_url)
                .with_retry(retry.clone())
                .with_request_timeout(request_timeout)
        };

        let port = match get("PORT").or_else(|| get("API_PORT")) {
            Some(raw) => parse_value("PORT", &raw)?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            fast: backend(
                "GEMINI_API_KEY",
                or("GEMINI_MODEL", DEFAULT_GEMINI_MODEL),
                gemini::DEFAULT_BASE_URL.to_string(),
            ),
            reasoning: backend(
                "REASONING_API_KEY",
                or("REASONING_MODEL", DEFAULT_REASONING_MODEL),
                or("REASONING_BASE_URL", DEFAULT_REASONING_BASE_URL),
            ),
            math: backend(
                "MATH_API_KEY",
                or("MATH_MODEL", DEFAULT_MATH_MODEL),
                or("MATH_BASE_URL", DEFAULT_MATH_BASE_URL),
            ),
            cfo: backend(
                "ANTHROPIC_API_KEY",
                or("CFO_MODEL", DEFAULT_CFO_MODEL),
                anthropic::DEFAULT_BASE_URL.to_string(),
            ),
            context_fetch_timeout: Duration::from_millis(parse_or(
                &get,
                "CONTEXT_FETCH_TIMEOUT_MS",
                5000u64,
            )?),
            database_url: get("DATABASE_URL").or_else(|| get("POSTGRES_URL")),
            port,
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| OrchestrationError::ConfigError(format!("{} has invalid value '{}'", key, raw)))
}
