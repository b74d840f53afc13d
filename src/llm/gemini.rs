//! Gemini backend (fast tier)
//!
//! Uses a long-lived reqwest::Client for connection pooling. Streaming goes
//! through `streamGenerateContent?alt=sse`, one JSON candidate per event.

use super::coerce::coerce_arguments;
use super::retry::{with_retry, ProviderFailure};
use super::stream::{spawn_sse_stream, SseDecoder, StreamChunk, StreamUsage};
use super::{
    http_client, send_checked, send_with_deadline, BackendConfig, ChatRequest, ChatStream,
    ModelClient,
};
use crate::error::ModelError;
use crate::llm::pricing::calculate_cost;
use crate::models::{AIResponse, ChatMessage, ChatRole, ModelAccess, ToolCall};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Reusable Gemini client (connection-pooled)
pub struct GeminiClient {
    access: ModelAccess,
    client: Client,
    config: BackendConfig,
}

impl GeminiClient {
    pub fn new(access: ModelAccess, config: BackendConfig) -> crate::Result<Self> {
        Ok(Self {
            access,
            client: http_client()?,
            config,
        })
    }

    fn endpoint(&self, method: &str) -> String {
        format!(
            "{}/models/{}:{}",
            self.config.base_url, self.config.model_id, method
        )
    }

    fn build_request(&self, request: &ChatRequest) -> GeminiRequest {
        let tools = if request.tools.is_empty() {
            Vec::new()
        } else {
            vec![GeminiTool {
                function_declarations: request
                    .tools
                    .iter()
                    .map(|t| FunctionDeclaration {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.parameters.clone(),
                    })
                    .collect(),
            }]
        };

        GeminiRequest {
            contents: request.messages.iter().map(to_content).collect(),
            system_instruction: request.system_prompt.as_ref().map(|prompt| Content {
                role: None,
                parts: vec![Part::text(prompt)],
            }),
            generation_config: GenerationConfig {
                temperature: request.temperature,
                top_p: 0.9,
                top_k: 40,
                max_output_tokens: request.max_tokens,
            },
            tools,
        }
    }

    fn post(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .header("x-goog-api-key", &self.config.api_key)
    }
}

fn to_content(message: &ChatMessage) -> Content {
    let role = match message.role {
        ChatRole::User => "user",
        ChatRole::Assistant => "model",
    };
    Content {
        role: Some(role.to_string()),
        parts: vec![Part::text(&message.content)],
    }
}

#[async_trait::async_trait]
impl ModelClient for GeminiClient {
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

        let url = self.endpoint("generateContent");
        let body = self.build_request(request);
        let timeout = self.config.request_timeout;

        info!(model = %self.config.model_id, "Calling Gemini API");

        let (url, body) = (url.as_str(), &body);
        let response: GeminiResponse = with_retry(&self.config.retry, self.access, move || async move {
            let response = send_checked(self.post(url).timeout(timeout).json(body)).await?;
            response
                .json::<GeminiResponse>()
                .await
                .map_err(ProviderFailure::from_reqwest)
        })
        .await?;

        if let Some(error) = response.error {
            return Err(error.into_failure().into_model_error(self.access));
        }

        let candidate = response.candidates.into_iter().next().ok_or_else(|| {
            ProviderFailure::Decode("No candidates in Gemini response".to_string())
                .into_model_error(self.access)
        })?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
            if let Some(t) = part.text {
                text.push_str(&t);
            }
            if let Some(call) = part.function_call {
                tool_calls.push(call.into_tool_call());
            }
        }

        let usage = response.usage_metadata.unwrap_or_default();
        debug!(
            finish_reason = ?candidate.finish_reason,
            tokens_in = usage.prompt_token_count,
            tokens_out = usage.candidates_token_count,
            "Gemini response received"
        );

        Ok(AIResponse {
            text,
            tokens_in: usage.prompt_token_count,
            tokens_out: usage.candidates_token_count,
            cost: calculate_cost(
                self.access,
                usage.prompt_token_count,
                usage.candidates_token_count,
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

        let url = format!("{}?alt=sse", self.endpoint("streamGenerateContent"));
        let body = self.build_request(request);

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
            GeminiDecoder::default(),
        ))
    }
}

/// Each SSE event carries a partial `GenerateContentResponse`.
#[derive(Debug, Default)]
struct GeminiDecoder {
    usage: StreamUsage,
}

impl SseDecoder for GeminiDecoder {
    fn on_event(
        &mut self,
        _event: &str,
        data: &str,
        out: &mut Vec<StreamChunk>,
    ) -> Result<bool, ProviderFailure> {
        let chunk: GeminiResponse = serde_json::from_str(data)
            .map_err(|e| ProviderFailure::Decode(format!("Gemini stream chunk: {}", e)))?;

        if let Some(error) = chunk.error {
            return Err(error.into_failure());
        }

        for candidate in chunk.candidates {
            for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
                if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                    out.push(StreamChunk::text(text));
                }
                if let Some(call) = part.function_call {
                    out.push(StreamChunk::ToolCall {
                        call: call.into_tool_call(),
                    });
                }
            }
        }

        // Usage is cumulative; the last report wins.
        if let Some(usage) = chunk.usage_metadata {
            self.usage = StreamUsage {
                tokens_in: usage.prompt_token_count,
                tokens_out: usage.candidates_token_count,
            };
        }

        Ok(false)
    }

    fn finish(&mut self, _out: &mut Vec<StreamChunk>) -> StreamUsage {
        self.usage
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<GeminiTool>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCall>,
}

impl Part {
    fn text(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            function_call: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

impl FunctionCall {
    fn into_tool_call(self) -> ToolCall {
        ToolCall {
            id: None,
            name: self.name,
            arguments: coerce_arguments(self.args),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    max_output_tokens: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiTool {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct FunctionDeclaration {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
    error: Option<GeminiApiError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

#[derive(Debug, Deserialize)]
struct GeminiApiError {
    #[serde(default)]
    code: u16,
    #[serde(default)]
    message: String,
}

impl GeminiApiError {
    fn into_failure(self) -> ProviderFailure {
        ProviderFailure::Status {
            status: self.code,
            body: self.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AiErrorKind;
    use crate::llm::RetryPolicy;
    use crate::models::ToolDefinition;
    use futures::StreamExt;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client(base_url: &str) -> GeminiClient {
        let config = BackendConfig::new("test-key", "gemini-test", base_url)
            .with_retry(RetryPolicy::immediate(3));
        GeminiClient::new(ModelAccess::Fast, config).unwrap()
    }

    fn request() -> ChatRequest {
        ChatRequest::new(vec![ChatMessage::user("What is an emergency fund?")])
            .with_system_prompt("You are a financial advisor")
    }

    #[test]
    fn test_request_serialization() {
        let client = test_client("http://localhost");
        let req = request().with_tools(vec![ToolDefinition {
            name: "get_balance".into(),
            description: "Look up a balance".into(),
            parameters: json!({"type": "object"}),
        }]);
        let json = serde_json::to_value(client.build_request(&req)).unwrap();

        assert_eq!(json["contents"][0]["role"], "user");
        assert_eq!(
            json["systemInstruction"]["parts"][0]["text"],
            "You are a financial advisor"
        );
        assert_eq!(json["generationConfig"]["maxOutputTokens"], 1024);
        assert_eq!(
            json["tools"][0]["functionDeclarations"][0]["name"],
            "get_balance"
        );
    }

    #[tokio::test]
    async fn test_send_chat_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-test:generateContent"))
            .and(header("x-goog-api-key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{
                    "content": {"role": "model", "parts": [
                        {"text": "Three to six months "},
                        {"text": "of expenses."},
                        {"functionCall": {"name": "flag", "args": {"urgent": "false"}}}
                    ]},
                    "finishReason": "STOP"
                }],
                "usageMetadata": {"promptTokenCount": 40, "candidatesTokenCount": 12}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let response = test_client(&server.uri()).send_chat(&request()).await.unwrap();

        assert_eq!(response.text, "Three to six months of expenses.");
        assert_eq!(response.tokens_in, 40);
        assert_eq!(response.tokens_out, 12);
        assert_eq!(response.backend, ModelAccess::Fast);
        assert_eq!(response.model_id, "gemini-test");
        assert_eq!(response.tool_calls[0].arguments["urgent"], json!(false));
        assert!(response.cost > 0.0);
    }

    #[tokio::test]
    async fn test_rate_limit_then_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("quota"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{"content": {"parts": [{"text": "ok"}]}}]
            })))
            .mount(&server)
            .await;

        let response = test_client(&server.uri()).send_chat(&request()).await.unwrap();
        assert_eq!(response.text, "ok");
        // Missing usage metadata means zero tokens, not a failure.
        assert_eq!(response.tokens_in, 0);
    }

    #[tokio::test]
    async fn test_auth_error_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_string("API key invalid"))
            .expect(1)
            .mount(&server)
            .await;

        let err = test_client(&server.uri())
            .send_chat(&request())
            .await
            .unwrap_err();
        assert_eq!(err.kind, AiErrorKind::AuthError);
        assert!(!err.to_string().contains("API key invalid"));
    }

    #[tokio::test]
    async fn test_missing_api_key() {
        let config = BackendConfig::new("", "gemini-test", "http://localhost");
        let client = GeminiClient::new(ModelAccess::Fast, config).unwrap();
        let err = client.send_chat(&request()).await.unwrap_err();
        assert_eq!(err.kind, AiErrorKind::AuthError);
    }

    #[tokio::test]
    async fn test_stream_chat() {
        let server = MockServer::start().await;
        let sse = concat!(
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Build \"}]}}]}\n\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"savings.\"}]}}],",
            "\"usageMetadata\":{\"promptTokenCount\":30,\"candidatesTokenCount\":4}}\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/models/gemini-test:streamGenerateContent"))
            .and(query_param("alt", "sse"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse),
            )
            .mount(&server)
            .await;

        let stream = test_client(&server.uri()).stream_chat(&request()).await.unwrap();
        let chunks: Vec<StreamChunk> = stream.collect().await;

        assert_eq!(chunks[0], StreamChunk::text("Build "));
        assert_eq!(chunks[1], StreamChunk::text("savings."));
        match &chunks[2] {
            StreamChunk::Done { metrics } => {
                assert_eq!(metrics.tokens_in, 30);
                assert_eq!(metrics.tokens_out, 4);
            }
            other => panic!("expected Done, got {:?}", other),
        }
        assert_eq!(chunks.len(), 3);
    }

    #[test]
    fn test_decoder_surfaces_inline_error() {
        let mut decoder = GeminiDecoder::default();
        let mut out = Vec::new();
        let failure = decoder
            .on_event(
                "message",
                r#"{"error":{"code":503,"message":"overloaded"}}"#,
                &mut out,
            )
            .unwrap_err();
        assert_eq!(failure.classify(), AiErrorKind::ProviderError);
    }
}
