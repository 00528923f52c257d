//! OpenAI adapter: chat completions for the generating stages and the
//! embeddings endpoint for strategy retrieval.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{
    EmbeddingRequest, EmbeddingResponse, FinishReason, ProviderAdapter, Request, Response,
    ResponseFormat, Role, Usage,
};
use advocate_types::AdvocateError;

const PROVIDER: &str = "openai";

pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

#[derive(Debug)]
pub struct OpenAiAdapter {
    api_key: String,
    client: reqwest::Client,
    base_url: String,
    default_model: String,
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<JsonFormat>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: Role,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct JsonFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    prompt_tokens_details: Option<PromptDetails>,
}

#[derive(Debug, Deserialize)]
struct PromptDetails {
    cached_tokens: Option<u64>,
}

#[derive(Debug, Serialize)]
struct EmbeddingsBody<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
    encoding_format: &'static str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsReply {
    #[serde(default)]
    model: String,
    #[serde(default)]
    data: Vec<EmbeddingItem>,
    #[serde(default)]
    usage: Option<EmbeddingUsage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Debug, Default, Deserialize)]
struct EmbeddingUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

impl OpenAiAdapter {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            client: reqwest::Client::new(),
            base_url: "https://api.openai.com".to_string(),
            default_model: "gpt-4o".to_string(),
        }
    }

    /// Reads `OPENAI_API_KEY`, and `OPENAI_BASE_URL` for proxies.
    pub fn from_env() -> Result<Self, AdvocateError> {
        let key = std::env::var("OPENAI_API_KEY").map_err(|_| AdvocateError::AuthError {
            provider: PROVIDER.into(),
        })?;
        let adapter = Self::new(key);
        Ok(match std::env::var("OPENAI_BASE_URL") {
            Ok(url) => adapter.with_base_url(url),
            Err(_) => adapter,
        })
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    /// Embed `request.inputs` in one call. An empty model selects
    /// [`DEFAULT_EMBEDDING_MODEL`].
    pub async fn embed(
        &self,
        request: &EmbeddingRequest,
    ) -> Result<EmbeddingResponse, AdvocateError> {
        let model = if request.model.is_empty() {
            DEFAULT_EMBEDDING_MODEL
        } else {
            request.model.as_str()
        };
        if request.inputs.is_empty() {
            return Ok(EmbeddingResponse {
                model: model.to_string(),
                vectors: Vec::new(),
                usage: Usage::default(),
            });
        }

        let body = EmbeddingsBody {
            model,
            input: &request.inputs,
            dimensions: request.dimensions,
            encoding_format: "float",
        };
        let text = self.post("/v1/embeddings", &body).await?;
        into_embeddings(parse_body(&text, "embeddings")?, request.inputs.len())
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<String, AdvocateError> {
        let resp = self
            .client
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(0, e.to_string()))?;

        let status = resp.status();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<f64>().ok());
        let text = resp
            .text()
            .await
            .map_err(|e| transport_error(0, e.to_string()))?;

        if !status.is_success() {
            return Err(map_error(status, retry_after, &text));
        }
        Ok(text)
    }

    fn chat_request<'a>(&self, request: &'a Request) -> ChatRequest<'a> {
        ChatRequest {
            model: &request.model,
            messages: request
                .messages
                .iter()
                .map(|m| ChatMessage {
                    role: m.role,
                    content: &m.content,
                })
                .collect(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            seed: request.seed,
            response_format: matches!(request.response_format, Some(ResponseFormat::JsonObject))
                .then_some(JsonFormat { kind: "json_object" }),
        }
    }
}

fn transport_error(status: u16, message: impl Into<String>) -> AdvocateError {
    AdvocateError::ProviderError {
        provider: PROVIDER.into(),
        status,
        message: message.into(),
        retryable: true,
    }
}

fn into_response(body: ChatResponse) -> Result<Response, AdvocateError> {
    let choice = body
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| transport_error(200, "response contained no choices"))?;

    let finish_reason = match choice.finish_reason.as_deref() {
        Some("length") => FinishReason::MaxTokens,
        Some("content_filter") => FinishReason::ContentFilter,
        _ => FinishReason::EndTurn,
    };

    let usage = body.usage.unwrap_or_default();
    Ok(Response {
        id: body.id,
        text: choice.message.content.unwrap_or_default().trim().to_string(),
        usage: Usage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            cache_read_tokens: usage.prompt_tokens_details.and_then(|d| d.cached_tokens),
            total_tokens: usage.prompt_tokens + usage.completion_tokens,
        },
        model: body.model,
        finish_reason,
    })
}

fn parse_body<T: DeserializeOwned>(text: &str, what: &str) -> Result<T, AdvocateError> {
    serde_json::from_str(text).map_err(|e| AdvocateError::ProviderError {
        provider: PROVIDER.into(),
        status: 200,
        message: format!("unreadable {what} body: {e}"),
        retryable: false,
    })
}

/// Put vectors back in input order and check every input got exactly one.
fn into_embeddings(
    body: EmbeddingsReply,
    expected: usize,
) -> Result<EmbeddingResponse, AdvocateError> {
    let mut data = body.data;
    data.sort_by_key(|item| item.index);
    let in_order = data.iter().enumerate().all(|(i, item)| item.index == i);
    if data.len() != expected || !in_order {
        return Err(AdvocateError::ProviderError {
            provider: PROVIDER.into(),
            status: 200,
            message: format!("expected {expected} embeddings, got {}", data.len()),
            retryable: false,
        });
    }

    let usage = body.usage.unwrap_or_default();
    Ok(EmbeddingResponse {
        model: body.model,
        vectors: data.into_iter().map(|item| item.embedding).collect(),
        usage: Usage {
            input_tokens: usage.prompt_tokens,
            output_tokens: 0,
            cache_read_tokens: None,
            total_tokens: usage.total_tokens,
        },
    })
}

/// Map a non-success status onto the error taxonomy. 429 and 5xx are
/// retryable; `retry_after` is the `Retry-After` header in seconds.
fn map_error(status: reqwest::StatusCode, retry_after: Option<f64>, body: &str) -> AdvocateError {
    let message = serde_json::from_str::<ErrorEnvelope>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.to_string());

    match status.as_u16() {
        429 => AdvocateError::RateLimited {
            provider: PROVIDER.into(),
            retry_after_ms: retry_after.map(|s| (s * 1000.0) as u64).unwrap_or(1000),
        },
        401 | 403 => AdvocateError::AuthError {
            provider: PROVIDER.into(),
        },
        code @ (408 | 500..=599) => transport_error(code, message),
        code => AdvocateError::ProviderError {
            provider: PROVIDER.into(),
            status: code,
            message,
            retryable: false,
        },
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    async fn complete(&self, request: &Request) -> Result<Response, AdvocateError> {
        let text = self
            .post("/v1/chat/completions", &self.chat_request(request))
            .await?;
        into_response(parse_body(&text, "completion")?)
    }

    fn name(&self) -> &str {
        PROVIDER
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn context_window_size(&self) -> usize {
        128_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Message;

    fn parse(json: &str) -> Result<Response, AdvocateError> {
        into_response(serde_json::from_str(json).unwrap())
    }

    #[test]
    fn request_body_carries_sampling_and_json_mode() {
        let adapter = OpenAiAdapter::new("k".into());
        let mut req = Request::new(
            "gpt-4o",
            vec![Message::system("persona"), Message::user("<comment>hi</comment>")],
        );
        req.max_tokens = Some(400);
        req.temperature = Some(0.7);
        req.seed = Some(7);
        req.response_format = Some(ResponseFormat::JsonObject);

        let body = serde_json::to_value(adapter.chat_request(&req)).unwrap();
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "<comment>hi</comment>");
        assert_eq!(body["max_tokens"], 400);
        assert_eq!(body["seed"], 7);
        assert_eq!(body["response_format"]["type"], "json_object");
    }

    #[test]
    fn request_body_omits_unset_options() {
        let adapter = OpenAiAdapter::new("k".into());
        let req = Request::new("gpt-4o", vec![Message::user("Hi")]);
        let body = serde_json::to_value(adapter.chat_request(&req)).unwrap();
        for key in ["max_tokens", "temperature", "seed", "response_format"] {
            assert!(body.get(key).is_none(), "{key} should be omitted");
        }
    }

    #[test]
    fn response_maps_text_usage_and_finish() {
        let resp = parse(
            r#"{"id": "chatcmpl-1", "model": "gpt-4o",
                "choices": [{"message": {"content": " {\"rebuttal\": \"x\"} "}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 100, "completion_tokens": 50,
                          "prompt_tokens_details": {"cached_tokens": 10}}}"#,
        )
        .unwrap();
        assert_eq!(resp.text, "{\"rebuttal\": \"x\"}");
        assert_eq!(resp.finish_reason, FinishReason::EndTurn);
        assert_eq!(resp.usage.total_tokens, 150);
        assert_eq!(resp.usage.cache_read_tokens, Some(10));
    }

    #[test]
    fn truncated_response_reports_max_tokens() {
        let resp = parse(
            r#"{"choices": [{"message": {"content": "{\"reply\": \"cut"}, "finish_reason": "length"}]}"#,
        )
        .unwrap();
        assert_eq!(resp.finish_reason, FinishReason::MaxTokens);
        assert_eq!(resp.usage.input_tokens, 0);
    }

    #[test]
    fn empty_choices_is_retryable() {
        assert!(parse(r#"{"id": "c2", "choices": []}"#).unwrap_err().is_retryable());
    }

    fn embeddings(json: &str, expected: usize) -> Result<EmbeddingResponse, AdvocateError> {
        into_embeddings(serde_json::from_str(json).unwrap(), expected)
    }

    #[test]
    fn embeddings_body_requests_float_vectors() {
        let inputs = vec!["theme naturalistic fallacy".to_string()];
        let body = EmbeddingsBody {
            model: DEFAULT_EMBEDDING_MODEL,
            input: &inputs,
            dimensions: Some(256),
            encoding_format: "float",
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "text-embedding-3-small");
        assert_eq!(json["input"][0], "theme naturalistic fallacy");
        assert_eq!(json["dimensions"], 256);
        assert_eq!(json["encoding_format"], "float");
    }

    #[test]
    fn embeddings_are_returned_in_input_order() {
        let resp = embeddings(
            r#"{"model": "text-embedding-3-small",
                "data": [{"index": 1, "embedding": [0.0, 1.0]},
                         {"index": 0, "embedding": [1.0, 0.0]}],
                "usage": {"prompt_tokens": 8, "total_tokens": 8}}"#,
            2,
        )
        .unwrap();
        assert_eq!(resp.vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
        assert_eq!(resp.usage.input_tokens, 8);
    }

    #[test]
    fn missing_embedding_is_an_error() {
        let err = embeddings(r#"{"data": [{"index": 0, "embedding": [1.0]}]}"#, 2).unwrap_err();
        assert!(err.to_string().contains("expected 2 embeddings"));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn empty_embedding_input_makes_no_call() {
        let adapter = OpenAiAdapter::new("k".into()).with_base_url("http://127.0.0.1:9".into());
        let resp = adapter
            .embed(&EmbeddingRequest {
                model: String::new(),
                inputs: vec![],
                dimensions: None,
            })
            .await
            .unwrap();
        assert!(resp.vectors.is_empty());
        assert_eq!(resp.model, DEFAULT_EMBEDDING_MODEL);
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let adapter = OpenAiAdapter::new("k".into()).with_base_url("https://proxy.local/".into());
        assert_eq!(adapter.base_url, "https://proxy.local");
    }

    #[test]
    fn rate_limit_uses_retry_after_header() {
        let err = map_error(reqwest::StatusCode::TOO_MANY_REQUESTS, Some(3.0), "{}");
        assert!(matches!(
            err,
            AdvocateError::RateLimited {
                retry_after_ms: 3000,
                ..
            }
        ));
    }

    #[test]
    fn auth_failures_are_not_retried() {
        let err = map_error(
            reqwest::StatusCode::UNAUTHORIZED,
            None,
            r#"{"error": {"message": "invalid api key"}}"#,
        );
        assert!(matches!(err, AdvocateError::AuthError { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn server_errors_are_retryable_with_message() {
        match map_error(
            reqwest::StatusCode::SERVICE_UNAVAILABLE,
            None,
            r#"{"error": {"message": "overloaded"}}"#,
        ) {
            AdvocateError::ProviderError {
                retryable,
                status,
                message,
                ..
            } => {
                assert!(retryable);
                assert_eq!(status, 503);
                assert_eq!(message, "overloaded");
            }
            other => panic!("expected ProviderError, got {other:?}"),
        }
    }

    #[test]
    fn client_errors_keep_raw_body() {
        match map_error(reqwest::StatusCode::BAD_REQUEST, None, "plain text body") {
            AdvocateError::ProviderError {
                retryable, message, ..
            } => {
                assert!(!retryable);
                assert_eq!(message, "plain text body");
            }
            other => panic!("expected ProviderError, got {other:?}"),
        }
    }
}
