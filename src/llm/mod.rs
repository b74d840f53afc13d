//! Model client layer
//!
//! One trait, [`ModelClient`], in front of every backend protocol. Each
//! implementation owns its retry loop and reports failures only as
//! classified [`ModelError`]s, never as raw provider errors.

use crate::error::{ModelError, OrchestrationError};
use crate::models::{AIResponse, ChatMessage, ModelAccess, ToolDefinition};
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub mod anthropic;
pub mod coerce;
pub mod gemini;
pub mod openai;
pub mod pricing;
pub mod retry;
pub mod stream;

pub use anthropic::AnthropicClient;
pub use gemini::GeminiClient;
pub use openai::OpenAiCompatClient;
pub use retry::{ProviderFailure, RetryPolicy};
pub use stream::{ChatStream, StreamChunk, StreamMetrics};

pub const DEFAULT_MAX_TOKENS: u32 = 1024;
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Provider-neutral chat request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub system_prompt: Option<String>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            system_prompt: None,
            tools: Vec::new(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Uniform send/stream contract over one backend.
#[async_trait]
pub trait ModelClient: Send + Sync {
    fn access(&self) -> ModelAccess;

    /// Exact backend model identifier, e.g. `gemini-2.0-flash`.
    fn model_id(&self) -> &str;

    async fn send_chat(&self, request: &ChatRequest) -> std::result::Result<AIResponse, ModelError>;

    /// Start a stream. Retries cover establishing the stream only; once
    /// chunks flow, failures arrive as a terminal error chunk.
    async fn stream_chat(
        &self,
        request: &ChatRequest,
    ) -> std::result::Result<ChatStream, ModelError>;
}

/// Connection settings shared by every HTTP backend.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub api_key: String,
    pub model_id: String,
    pub base_url: String,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl BackendConfig {
    pub fn new(api_key: impl Into<String>, model_id: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model_id: model_id.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            request_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Long-lived, connection-pooled HTTP client.
pub(crate) fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(8)
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| OrchestrationError::ConfigError(format!("Failed to build HTTP client: {}", e)))
}

/// Send a request and turn any non-2xx status into a [`ProviderFailure`].
pub(crate) async fn send_checked(
    request: reqwest::RequestBuilder,
) -> std::result::Result<reqwest::Response, ProviderFailure> {
    let response = request.send().await.map_err(ProviderFailure::from_reqwest)?;
    let status = response.status();

    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(ProviderFailure::Status {
        status: status.as_u16(),
        body,
    })
}

/// [`send_checked`] with a deadline on receiving the response headers.
///
/// Streams cannot use `RequestBuilder::timeout`, which would also cap the
/// body; the idle gap between events is bounded in `spawn_sse_stream`.
pub(crate) async fn send_with_deadline(
    request: reqwest::RequestBuilder,
    deadline: Duration,
) -> std::result::Result<reqwest::Response, ProviderFailure> {
    tokio::time::timeout(deadline, send_checked(request))
        .await
        .map_err(|_| {
            ProviderFailure::Timeout(format!("no response within {}ms", deadline.as_millis()))
        })?
}

/// Registry of configured backends, keyed by capability.
#[derive(Clone, Default)]
pub struct ModelRegistry {
    clients: HashMap<ModelAccess, Arc<dyn ModelClient>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, client: Arc<dyn ModelClient>) {
        self.clients.insert(client.access(), client);
    }

    pub fn with(mut self, client: Arc<dyn ModelClient>) -> Self {
        self.register(client);
        self
    }

    pub fn get(&self, access: ModelAccess) -> Result<Arc<dyn ModelClient>> {
        self.clients
            .get(&access)
            .cloned()
            .ok_or(OrchestrationError::ModelUnavailable(access))
    }

    pub fn contains(&self, access: ModelAccess) -> bool {
        self.clients.contains_key(&access)
    }

    /// Build the four production backends from configuration.
    pub fn from_config(config: &crate::config::OrchestratorConfig) -> Result<Self> {
        Ok(Self::new()
            .with(Arc::new(GeminiClient::new(ModelAccess::Fast, config.fast.clone())?))
            .with(Arc::new(OpenAiCompatClient::new(
                ModelAccess::Reasoning,
                config.reasoning.clone(),
            )?))
            .with(Arc::new(OpenAiCompatClient::new(ModelAccess::Math, config.math.clone())?))
            .with(Arc::new(AnthropicClient::new(ModelAccess::Cfo, config.cfo.clone())?)))
    }
}
