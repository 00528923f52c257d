//! Schema-checked calls to the generation service.
//!
//! Every generating stage goes through [`StructuredCaller::call`], which
//! layers two independent retry loops:
//!
//! - transport: timeouts, rate limits and 5xx responses are retried with
//!   backoff via [`execute_with_retry`]; once spent they surface as
//!   `ServiceUnavailable`.
//! - format: a reply that is not valid JSON for the stage schema, or fails the
//!   stage's own checks, is sent back with a stricter correction message. Once
//!   spent the stage fails with `GenerationFailed`.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;

use advocate_llm::{LlmClient, Message, Request, ResponseFormat};
use advocate_types::{AdvocateError, Result};

use crate::config::AdvocateConfig;
use crate::retry::{execute_with_retry, BackoffPolicy};

/// A stage's expected JSON payload.
pub trait StageOutput: DeserializeOwned {
    const STAGE: &'static str;
    /// Shown to the model in the prompt and in correction messages.
    const SCHEMA: &'static str;

    /// Checks serde cannot express. The message goes back to the model.
    fn check(&self) -> std::result::Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct GenerationSettings {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub seed: Option<u64>,
    pub call_timeout: Duration,
    pub max_format_retries: usize,
    pub max_service_retries: usize,
    pub backoff: BackoffPolicy,
}

impl From<&AdvocateConfig> for GenerationSettings {
    fn from(config: &AdvocateConfig) -> Self {
        Self {
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            seed: config.seed,
            call_timeout: config.call_timeout(),
            max_format_retries: config.max_format_retries,
            max_service_retries: config.max_service_retries,
            backoff: config.backoff(),
        }
    }
}

#[derive(Clone)]
pub struct StructuredCaller {
    client: Arc<LlmClient>,
    settings: GenerationSettings,
}

impl StructuredCaller {
    pub fn new(client: Arc<LlmClient>, settings: GenerationSettings) -> Self {
        Self { client, settings }
    }

    pub fn settings(&self) -> &GenerationSettings {
        &self.settings
    }

    /// Run `messages` until the response parses as `T` and passes both
    /// `T::check` and `extra`.
    pub async fn call<T, V>(&self, mut messages: Vec<Message>, extra: V) -> Result<T>
    where
        T: StageOutput,
        V: Fn(&T) -> std::result::Result<(), String>,
    {
        let attempts = self.settings.max_format_retries + 1;
        for attempt in 1..=attempts {
            let text = self.complete_once(&messages, T::STAGE).await?;
            let outcome = parse_stage::<T>(&text).and_then(|parsed| {
                let checked = parsed.check().and_then(|_| extra(&parsed));
                checked
                    .map(|_| parsed)
                    .map_err(|message| AdvocateError::MalformedOutput {
                        stage: T::STAGE.to_string(),
                        message,
                    })
            });

            match outcome {
                Ok(parsed) => return Ok(parsed),
                Err(err) => {
                    tracing::warn!(stage = T::STAGE, attempt, attempts, error = %err, "Stage output rejected");
                    messages.push(Message::assistant(text));
                    messages.push(Message::user(correction_message(&err, T::SCHEMA)));
                }
            }
        }

        Err(AdvocateError::GenerationFailed {
            stage: T::STAGE.to_string(),
            attempts,
        })
    }

    async fn complete_once(&self, messages: &[Message], stage: &str) -> Result<String> {
        let mut request = Request::new(self.settings.model.clone(), messages.to_vec());
        request.max_tokens = Some(self.settings.max_tokens);
        request.temperature = Some(self.settings.temperature);
        request.seed = self.settings.seed;
        request.response_format = Some(ResponseFormat::JsonObject);

        let client = &self.client;
        let request = &request;
        let timeout = self.settings.call_timeout;

        let result = execute_with_retry(
            move || async move {
                match tokio::time::timeout(timeout, client.complete(request)).await {
                    Ok(res) => res,
                    Err(_) => Err(AdvocateError::RequestTimeout {
                        provider: request.provider.clone().unwrap_or_else(|| "llm".into()),
                        timeout_ms: timeout.as_millis() as u64,
                    }),
                }
            },
            self.settings.max_service_retries,
            &self.settings.backoff,
            stage,
        )
        .await;

        match result {
            Ok(response) => Ok(response.text),
            Err(e) if e.is_transport_failure() => {
                tracing::error!(stage, error = %e, "Generation service unreachable");
                Err(AdvocateError::ServiceUnavailable {
                    message: format!("{stage}: {e}"),
                })
            }
            Err(e) => Err(e),
        }
    }
}

/// Parse the JSON object in `text`, tolerating prose or code fences around it.
pub fn parse_stage<T: StageOutput>(text: &str) -> Result<T> {
    let json = extract_json(text).ok_or_else(|| AdvocateError::MalformedOutput {
        stage: T::STAGE.to_string(),
        message: "response contained no JSON object".into(),
    })?;
    serde_json::from_str(json).map_err(|e| AdvocateError::MalformedOutput {
        stage: T::STAGE.to_string(),
        message: e.to_string(),
    })
}

/// The slice from the first `{` to the last `}`.
pub fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn correction_message(err: &AdvocateError, schema: &str) -> String {
    let detail = match err {
        AdvocateError::MalformedOutput { message, .. } => message.as_str(),
        _ => "invalid output",
    };
    format!(
        "Your previous response was rejected: {detail}.\n\
         Respond again with ONLY a single JSON object matching this schema, \
         with no prose and no code fences:\n{schema}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use advocate_llm::{FinishReason, ProviderAdapter, Response, Usage};
    use async_trait::async_trait;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Deserialize)]
    struct Echo {
        word: String,
    }

    impl StageOutput for Echo {
        const STAGE: &'static str = "echo";
        const SCHEMA: &'static str = r#"{"word": string}"#;

        fn check(&self) -> std::result::Result<(), String> {
            if self.word.is_empty() {
                Err("word must not be empty".into())
            } else {
                Ok(())
            }
        }
    }

    /// Plays back scripted results in order, repeating the last one.
    struct ScriptedProvider {
        script: Mutex<Vec<Result<String>>>,
        calls: Arc<AtomicUsize>,
        seen: Arc<Mutex<Vec<Vec<Message>>>>,
    }

    impl ScriptedProvider {
        fn new(script: Vec<Result<String>>) -> Self {
            Self {
                script: Mutex::new(script),
                calls: Arc::new(AtomicUsize::new(0)),
                seen: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedProvider {
        async fn complete(&self, request: &Request) -> Result<Response> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(request.messages.clone());
            let mut script = self.script.lock().unwrap();
            let next = if script.len() > 1 {
                script.remove(0)
            } else {
                match &script[0] {
                    Ok(t) => Ok(t.clone()),
                    Err(_) => Err(AdvocateError::RequestTimeout {
                        provider: "scripted".into(),
                        timeout_ms: 1,
                    }),
                }
            };
            next.map(|text| Response {
                id: "r".into(),
                text,
                usage: Usage::default(),
                model: "mock-model".into(),
                finish_reason: FinishReason::EndTurn,
            })
        }

        fn name(&self) -> &str {
            "scripted"
        }

        fn default_model(&self) -> &str {
            "mock-model"
        }

        fn supports_json_mode(&self) -> bool {
            true
        }

        fn context_window_size(&self) -> usize {
            8_000
        }
    }

    fn settings() -> GenerationSettings {
        GenerationSettings {
            model: "mock-model".into(),
            temperature: 0.0,
            max_tokens: 100,
            seed: Some(1),
            call_timeout: Duration::from_secs(5),
            max_format_retries: 2,
            max_service_retries: 2,
            backoff: BackoffPolicy::None,
        }
    }

    fn caller(provider: ScriptedProvider) -> StructuredCaller {
        StructuredCaller::new(Arc::new(LlmClient::new().with_provider(provider)), settings())
    }

    fn no_extra(_: &Echo) -> std::result::Result<(), String> {
        Ok(())
    }

    #[test]
    fn extract_json_strips_fences_and_prose() {
        assert_eq!(
            extract_json("Sure! ```json\n{\"word\": \"hi\"}\n```"),
            Some("{\"word\": \"hi\"}")
        );
        assert_eq!(extract_json("no json here"), None);
        assert_eq!(extract_json("} backwards {"), None);
    }

    #[tokio::test]
    async fn valid_first_response_is_one_call() {
        let provider = ScriptedProvider::new(vec![Ok(r#"{"word":"hi"}"#.into())]);
        let calls = provider.calls.clone();
        let out: Echo = caller(provider).call(vec![Message::user("x")], no_extra).await.unwrap();
        assert_eq!(out.word, "hi");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_then_valid_sends_correction() {
        let provider = ScriptedProvider::new(vec![
            Ok("not json at all".into()),
            Ok(r#"{"word":"ok"}"#.into()),
        ]);
        let calls = provider.calls.clone();
        let seen = provider.seen.clone();
        let out: Echo = caller(provider).call(vec![Message::user("x")], no_extra).await.unwrap();
        assert_eq!(out.word, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let second = &seen.lock().unwrap()[1];
        assert_eq!(second.len(), 3);
        assert!(second[2].content.contains("rejected"));
        assert!(second[2].content.contains(Echo::SCHEMA));
    }

    #[tokio::test]
    async fn format_retries_exhausted_is_generation_failed() {
        let provider = ScriptedProvider::new(vec![Ok(r#"{"word":""}"#.into())]);
        let calls = provider.calls.clone();
        let err = caller(provider)
            .call::<Echo, _>(vec![Message::user("x")], no_extra)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AdvocateError::GenerationFailed { attempts: 3, .. }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn extra_validator_can_reject() {
        let provider = ScriptedProvider::new(vec![
            Ok(r#"{"word":"forbidden"}"#.into()),
            Ok(r#"{"word":"fine"}"#.into()),
        ]);
        let out: Echo = caller(provider)
            .call(vec![Message::user("x")], |e: &Echo| {
                if e.word == "forbidden" {
                    Err("word is not allowed".into())
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();
        assert_eq!(out.word, "fine");
    }

    #[tokio::test]
    async fn transport_failures_become_service_unavailable() {
        let provider = ScriptedProvider::new(vec![Err(AdvocateError::RequestTimeout {
            provider: "scripted".into(),
            timeout_ms: 1,
        })]);
        let calls = provider.calls.clone();
        let err = caller(provider)
            .call::<Echo, _>(vec![Message::user("x")], no_extra)
            .await
            .unwrap_err();
        assert!(matches!(err, AdvocateError::ServiceUnavailable { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn auth_errors_are_not_retried() {
        let provider = ScriptedProvider::new(vec![
            Err(AdvocateError::AuthError {
                provider: "scripted".into(),
            }),
            Ok(r#"{"word":"never"}"#.into()),
        ]);
        let calls = provider.calls.clone();
        let err = caller(provider)
            .call::<Echo, _>(vec![Message::user("x")], no_extra)
            .await
            .unwrap_err();
        assert!(matches!(err, AdvocateError::AuthError { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
