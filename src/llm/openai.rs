//! OpenAI-compatible chat completions backend
//!
//! Serves both the reasoning and math tiers; only the base URL, key and
//! model id differ. Tool-call arguments arrive as JSON strings, and in a
//! stream they arrive in fragments keyed by index.

use super::coerce::parse_arguments;
use super::retry::{with_retry, ProviderFailure};
use super::stream::{spawn_sse_stream, SseDecoder, StreamChunk, StreamUsage};
use super::{
    http_client, send_checked, send_with_deadline, BackendConfig, ChatRequest, ChatStream,
    ModelClient,
};
use crate::error::ModelError;
use crate::llm::pricing::calculate_cost;
use crate::models::{AIResponse, ChatRole, ModelAccess, ToolCall};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info};

pub struct OpenAiCompatClient {
    access: ModelAccess,
    client: Client,
    config: BackendConfig,
}

impl OpenAiCompatClient {
    pub fn new(access: ModelAccess, config: BackendConfig) -> crate::Result<Self> {
        Ok(Self {
            access,
            client: http_client()?,
            config,
        })
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.config.base_url)
    }

    fn build_request(&self, request: &ChatRequest, stream: bool) -> CompletionRequest {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(prompt) = &request.system_prompt {
            messages.push(WireMessage {
                role: "system",
                content: prompt.clone(),
            });
        }
        messages.extend(request.messages.iter().map(|m| WireMessage {
            role: match m.role {
                ChatRole::User => "user",
                ChatRole::Assistant => "assistant",
            },
            content: m.content.clone(),
        }));

        let reasoning = is_reasoning_model(&self.config.model_id);

        CompletionRequest {
            model: self.config.model_id.clone(),
            messages,
            max_tokens: (!reasoning).then_some(request.max_tokens),
            max_completion_tokens: reasoning.then_some(request.max_tokens),
            temperature: (!reasoning).then_some(request.temperature),
            tools: request
                .tools
                .iter()
                .map(|t| WireTool {
                    kind: "function",
                    function: WireFunction {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.parameters.clone(),
                    },
                })
                .collect(),
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
        }
    }

    fn post(&self, url: &str) -> reqwest::RequestBuilder {
        self.client.post(url).bearer_auth(&self.config.api_key)
    }
}

/// o-series models take `max_completion_tokens` and reject `temperature`.
fn is_reasoning_model(model_id: &str) -> bool {
    let id = model_id.rsplit('/').next().unwrap_or(model_id);
    let mut chars = id.chars();
    matches!(chars.next(), Some('o')) && chars.next().is_some_and(|c| c.is_ascii_digit())
}

#[async_trait::async_trait]
impl ModelClient for OpenAiCompatClient {
    fn access(&self) -> ModelAccess {
        self.access
    }

    fn model_id(&self) -> &str {
        &self.config.model_id
    }

    async fn send_chat(&self, request: &ChatRequest) -> Result<AIResponse, ModelError> {
        if self.config.api_key.is_empty() {
            return Err(ProviderFailure::MissingCredentials.into_model_error(self.access));
        }

        let url = self.url();
        let body = self.build_request(request, false);
        let timeout = self.config.request_timeout;

        info!(backend = %self.access, model = %self.config.model_id, "Calling chat completions API");

        let (url, body) = (url.as_str(), &body);
        let response: CompletionResponse =
            with_retry(&self.config.retry, self.access, move || async move {
                let response = send_checked(self.post(url).timeout(timeout).json(body)).await?;
                response
                    .json::<CompletionResponse>()
                    .await
                    .map_err(ProviderFailure::from_reqwest)
            })
            .await?;

        let choice = response.choices.into_iter().next().ok_or_else(|| {
            ProviderFailure::Decode("No choices in completion response".to_string())
                .into_model_error(self.access)
        })?;

        let usage = response.usage.unwrap_or_default();
        debug!(
            finish_reason = ?choice.finish_reason,
            tokens_in = usage.prompt_tokens,
            tokens_out = usage.completion_tokens,
            "completion received"
        );

        Ok(AIResponse {
            text: choice.message.content.unwrap_or_default(),
            tokens_in: usage.prompt_tokens,
            tokens_out: usage.completion_tokens,
            cost: calculate_cost(self.access, usage.prompt_tokens, usage.completion_tokens),
            backend: self.access,
            model_id: self.config.model_id.clone(),
            tool_calls: choice
                .message
                .tool_calls
                .into_iter()
                .map(|call| ToolCall {
                    id: call.id,
                    name: call.function.name,
                    arguments: parse_arguments(&call.function.arguments),
                })
                .collect(),
        })
    }

    async fn stream_chat(&self, request: &ChatRequest) -> Result<ChatStream, ModelError> {
        if self.config.api_key.is_empty() {
            return Err(ProviderFailure::MissingCredentials.into_model_error(self.access));
        }

        let url = self.url();
        let body = self.build_request(request, true);

        let timeout = self.config.request_timeout;

        let (url, body) = (url.as_str(), &body);
        let response = with_retry(&self.config.retry, self.access, move || async move {
            send_with_deadline(self.post(url).json(body), timeout).await
        })
        .await?;

        Ok(spawn_sse_stream(
            response,
            self.access,
            self.config.model_id.clone(),
            timeout,
            CompletionDecoder::default(),
        ))
    }
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

#[derive(Debug, Default)]
struct CompletionDecoder {
    usage: StreamUsage,
    tool_calls: BTreeMap<u32, PartialToolCall>,
}

impl SseDecoder for CompletionDecoder {
    fn on_event(
        &mut self,
        _event: &str,
        data: &str,
        out: &mut Vec<StreamChunk>,
    ) -> Result<bool, ProviderFailure> {
        if data.trim() == "[DONE]" {
            return Ok(true);
        }

        let chunk: StreamResponse = serde_json::from_str(data)
            .map_err(|e| ProviderFailure::Decode(format!("completion stream chunk: {}", e)))?;

        if let Some(error) = chunk.error {
            return Err(ProviderFailure::Status {
                status: error.status_hint(),
                body: error.message,
            });
        }

        for choice in chunk.choices {
            if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
                out.push(StreamChunk::text(text));
            }
            for fragment in choice.delta.tool_calls {
                let entry = self.tool_calls.entry(fragment.index).or_default();
                if fragment.id.is_some() {
                    entry.id = fragment.id;
                }
                if let Some(function) = fragment.function {
                    if let Some(name) = function.name {
                        entry.name.push_str(&name);
                    }
                    if let Some(arguments) = function.arguments {
                        entry.arguments.push_str(&arguments);
                    }
                }
            }
        }

        if let Some(usage) = chunk.usage {
            self.usage = StreamUsage {
                tokens_in: usage.prompt_tokens,
                tokens_out: usage.completion_tokens,
            };
        }

        Ok(false)
    }

    fn finish(&mut self, out: &mut Vec<StreamChunk>) -> StreamUsage {
        for (_, call) in std::mem::take(&mut self.tool_calls) {
            out.push(StreamChunk::ToolCall {
                call: ToolCall {
                    id: call.id,
                    name: call.name,
                    arguments: parse_arguments(&call.arguments),
                },
            });
        }
        self.usage
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunction,
}

#[derive(Debug, Serialize)]
struct WireFunction {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ResponseToolCall>,
}

#[derive(Debug, Deserialize)]
struct ResponseToolCall {
    id: Option<String>,
    function: ResponseFunction,
}

#[derive(Debug, Deserialize)]
struct ResponseFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<Usage>,
    error: Option<StreamError>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallFragment>,
}

#[derive(Debug, Deserialize)]
struct ToolCallFragment {
    #[serde(default)]
    index: u32,
    id: Option<String>,
    function: Option<FunctionFragment>,
}

#[derive(Debug, Deserialize)]
struct FunctionFragment {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    #[serde(default)]
    message: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

impl StreamError {
    /// Map the error type string onto the HTTP status it corresponds to.
    fn status_hint(&self) -> u16 {
        match self.kind.as_deref() {
            Some("rate_limit_exceeded") | Some("rate_limit_error") => 429,
            Some("authentication_error") | Some("invalid_api_key") => 401,
            Some("invalid_request_error") => 400,
            _ => 500,
        }
    }
}
