//! Anthropic Messages API backend (CFO tier)
//!
//! Streaming follows the typed event protocol: `message_start` carries input
//! usage, `content_block_*` events carry text and tool-use JSON deltas, and
//! `message_delta` carries the final output token count.

use super::coerce::{coerce_arguments, parse_arguments};
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

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicClient {
    access: ModelAccess,
    client: Client,
    config: BackendConfig,
}

impl AnthropicClient {
    pub fn new(access: ModelAccess, config: BackendConfig) -> crate::Result<Self> {
        Ok(Self {
            access,
            client: http_client()?,
            config,
        })
    }

    fn url(&self) -> String {
        format!("{}/v1/messages", self.config.base_url)
    }

    fn build_request(&self, request: &ChatRequest, stream: bool) -> MessageRequest {
        MessageRequest {
            model: self.config.model_id.clone(),
            max_tokens: request.max_tokens,
            messages: request
                .messages
                .iter()
                .map(|m| ApiMessage {
                    role: match m.role {
                        ChatRole::User => "user",
                        ChatRole::Assistant => "assistant",
                    },
                    content: m.content.clone(),
                })
                .collect(),
            system: request.system_prompt.clone(),
            temperature: request.temperature,
            tools: request
                .tools
                .iter()
                .map(|t| ApiTool {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    input_schema: t.parameters.clone(),
                })
                .collect(),
            stream,
        }
    }

    fn post(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", API_VERSION)
    }
}

#[async_trait::async_trait]
impl ModelClient for AnthropicClient {
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

        info!(model = %self.config.model_id, "Calling Anthropic Messages API");

        let (url, body) = (url.as_str(), &body);
        let response: MessageResponse =
            with_retry(&self.config.retry, self.access, move || async move {
                let response = send_checked(self.post(url).timeout(timeout).json(body)).await?;
                response
                    .json::<MessageResponse>()
                    .await
                    .map_err(ProviderFailure::from_reqwest)
            })
            .await?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in response.content {
            match block {
                ResponseBlock::Text { text: t } => text.push_str(&t),
                ResponseBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                    id: Some(id),
                    name,
                    arguments: coerce_arguments(input),
                }),
                ResponseBlock::Other => {}
            }
        }

        debug!(
            stop_reason = ?response.stop_reason,
            tokens_in = response.usage.input_tokens,
            tokens_out = response.usage.output_tokens,
            "Anthropic response received"
        );

        Ok(AIResponse {
            text,
            tokens_in: response.usage.input_tokens,
            tokens_out: response.usage.output_tokens,
            cost: calculate_cost(
                self.access,
                response.usage.input_tokens,
                response.usage.output_tokens,
            ),
            backend: self.access,
            model_id: self.config.model_id.clone(),
            tool_calls,
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
            MessagesDecoder::default(),
        ))
    }
}

#[derive(Debug, Default)]
struct PendingToolUse {
    id: String,
    name: String,
    json: String,
}

#[derive(Debug, Default)]
struct MessagesDecoder {
    usage: StreamUsage,
    tool_uses: BTreeMap<u32, PendingToolUse>,
}

impl MessagesDecoder {
    fn parse<'a, T: Deserialize<'a>>(event: &str, data: &'a str) -> Result<T, ProviderFailure> {
        serde_json::from_str(data)
            .map_err(|e| ProviderFailure::Decode(format!("failed to parse {}: {}", event, e)))
    }
}

impl SseDecoder for MessagesDecoder {
    fn on_event(
        &mut self,
        event: &str,
        data: &str,
        out: &mut Vec<StreamChunk>,
    ) -> Result<bool, ProviderFailure> {
        match event {
            "message_start" => {
                let start: SseMessageStart = Self::parse(event, data)?;
                self.usage.tokens_in = start.message.usage.input_tokens;
                self.usage.tokens_out = start.message.usage.output_tokens;
            }
            "content_block_start" => {
                let start: SseContentBlockStart = Self::parse(event, data)?;
                if let StartBlock::ToolUse { id, name } = start.content_block {
                    self.tool_uses.insert(
                        start.index,
                        PendingToolUse {
                            id,
                            name,
                            json: String::new(),
                        },
                    );
                }
            }
            "content_block_delta" => {
                let delta: SseContentBlockDelta = Self::parse(event, data)?;
                match delta.delta {
                    SseDelta::TextDelta { text } if !text.is_empty() => {
                        out.push(StreamChunk::text(text));
                    }
                    SseDelta::InputJsonDelta { partial_json } => {
                        if let Some(pending) = self.tool_uses.get_mut(&delta.index) {
                            pending.json.push_str(&partial_json);
                        }
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                let stop: SseContentBlockStop = Self::parse(event, data)?;
                if let Some(pending) = self.tool_uses.remove(&stop.index) {
                    out.push(StreamChunk::ToolCall {
                        call: ToolCall {
                            id: Some(pending.id),
                            name: pending.name,
                            arguments: parse_arguments(&pending.json),
                        },
                    });
                }
            }
            "message_delta" => {
                let delta: SseMessageDelta = Self::parse(event, data)?;
                if let Some(usage) = delta.usage {
                    self.usage.tokens_out = usage.output_tokens;
                }
            }
            "message_stop" => return Ok(true),
            "error" => {
                let error: SseError = Self::parse(event, data)?;
                return Err(ProviderFailure::Status {
                    status: status_for_error_type(&error.error.kind),
                    body: error.error.message,
                });
            }
            // ping and unknown future event types
            _ => {}
        }
        Ok(false)
    }

    fn finish(&mut self, out: &mut Vec<StreamChunk>) -> StreamUsage {
        // Blocks that never saw content_block_stop.
        for (_, pending) in std::mem::take(&mut self.tool_uses) {
            out.push(StreamChunk::ToolCall {
                call: ToolCall {
                    id: Some(pending.id),
                    name: pending.name,
                    arguments: parse_arguments(&pending.json),
                },
            });
        }
        self.usage
    }
}

fn status_for_error_type(kind: &str) -> u16 {
    match kind {
        "rate_limit_error" => 429,
        "authentication_error" => 401,
        "permission_error" => 403,
        "overloaded_error" => 529,
        "api_error" => 500,
        "invalid_request_error" => 400,
        _ => 0,
    }
}

#[derive(Debug, Serialize)]
struct MessageRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    temperature: f32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiTool>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ApiTool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    #[serde(default)]
    content: Vec<ResponseBlock>,
    stop_reason: Option<String>,
    #[serde(default)]
    usage: ApiUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct SseMessageStart {
    message: SseMessage,
}

#[derive(Debug, Deserialize)]
struct SseMessage {
    #[serde(default)]
    usage: ApiUsage,
}

#[derive(Debug, Deserialize)]
struct SseContentBlockStart {
    index: u32,
    content_block: StartBlock,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StartBlock {
    ToolUse {
        id: String,
        name: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct SseContentBlockDelta {
    index: u32,
    delta: SseDelta,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SseDelta {
    TextDelta {
        text: String,
    },
    InputJsonDelta {
        partial_json: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct SseContentBlockStop {
    index: u32,
}

#[derive(Debug, Deserialize)]
struct SseMessageDelta {
    usage: Option<SseDeltaUsage>,
}

#[derive(Debug, Deserialize)]
struct SseDeltaUsage {
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct SseError {
    error: SseErrorDetail,
}

#[derive(Debug, Deserialize)]
struct SseErrorDetail {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AiErrorKind;
    use crate::llm::RetryPolicy;
    use crate::models::ChatMessage;
    use futures::StreamExt;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client(base_url: &str) -> AnthropicClient {
        let config = BackendConfig::new("test-api-key", "claude-test", base_url)
            .with_retry(RetryPolicy::immediate(3));
        AnthropicClient::new(ModelAccess::Cfo, config).unwrap()
    }

    fn request() -> ChatRequest {
        ChatRequest::new(vec![ChatMessage::user("Should we restructure our debt?")])
            .with_system_prompt("You are a CFO")
    }

    #[tokio::test]
    async fn test_send_chat_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "test-api-key"))
            .and(header("anthropic-version", API_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "msg_test",
                "type": "message",
                "role": "assistant",
                "content": [
                    {"type": "text", "text": "Consolidate the two cards."},
                    {"type": "tool_use", "id": "tu_1", "name": "schedule", "input": {"notify": "True"}}
                ],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 300, "output_tokens": 80}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let response = test_client(&server.uri()).send_chat(&request()).await.unwrap();

        assert_eq!(response.text, "Consolidate the two cards.");
        assert_eq!(response.tokens_in, 300);
        assert_eq!(response.tokens_out, 80);
        assert_eq!(response.backend, ModelAccess::Cfo);
        assert_eq!(response.tool_calls[0].id.as_deref(), Some("tu_1"));
        assert_eq!(response.tool_calls[0].arguments["notify"], json!(true));
    }

    #[tokio::test]
    async fn test_retry_on_429_then_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [{"type": "text", "text": "done"}],
                "usage": {"input_tokens": 1, "output_tokens": 1}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let response = test_client(&server.uri()).send_chat(&request()).await.unwrap();
        assert_eq!(response.text, "done");
    }

    #[tokio::test]
    async fn test_stream_messages() {
        let server = MockServer::start().await;
        let sse = concat!(
            "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":25,\"output_tokens\":1}}}\n\n",
            "event: content_block_start\ndata: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
            "event: ping\ndata: {\"type\":\"ping\"}\n\n",
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hello\"}}\n\n",
            "event: content_block_stop\ndata: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
            "event: content_block_start\ndata: {\"type\":\"content_block_start\",\"index\":1,\"content_block\":{\"type\":\"tool_use\",\"id\":\"tu_9\",\"name\":\"calc\",\"input\":{}}}\n\n",
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{\\\"exact\\\": \"}}\n\n",
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"\\\"false\\\"}\"}}\n\n",
            "event: content_block_stop\ndata: {\"type\":\"content_block_stop\",\"index\":1}\n\n",
            "event: message_delta\ndata: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":15}}\n\n",
            "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
        );
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse),
            )
            .mount(&server)
            .await;

        let stream = test_client(&server.uri()).stream_chat(&request()).await.unwrap();
        let chunks: Vec<StreamChunk> = stream.collect().await;

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], StreamChunk::text("Hello"));
        match &chunks[1] {
            StreamChunk::ToolCall { call } => {
                assert_eq!(call.name, "calc");
                assert_eq!(call.arguments["exact"], json!(false));
            }
            other => panic!("expected tool call, got {:?}", other),
        }
        match &chunks[2] {
            StreamChunk::Done { metrics } => {
                assert_eq!(metrics.tokens_in, 25);
                assert_eq!(metrics.tokens_out, 15);
            }
            other => panic!("expected Done, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mid_stream_error_event_terminates_stream() {
        let server = MockServer::start().await;
        let sse = concat!(
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Part\"}}\n\n",
            "event: error\ndata: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}\n\n",
        );
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse),
            )
            .mount(&server)
            .await;

        let stream = test_client(&server.uri()).stream_chat(&request()).await.unwrap();
        let chunks: Vec<StreamChunk> = stream.collect().await;

        assert_eq!(chunks.len(), 2);
        match &chunks[1] {
            StreamChunk::Error { kind, message } => {
                assert_eq!(*kind, AiErrorKind::ProviderError);
                assert!(!message.contains("Overloaded"));
            }
            other => panic!("expected Error, got {:?}", other),
        }
    }
}
