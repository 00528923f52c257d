use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use advocate_types::AdvocateError;

use crate::{DynProvider, ProviderAdapter, Request, Response};

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

pub trait Middleware: Send + Sync {
    fn before(&self, _request: &mut Request) {}
    fn after(&self, _request: &Request, _response: &mut Response) {}
}

// ---------------------------------------------------------------------------
// Built-in middleware: LoggingMiddleware
// ---------------------------------------------------------------------------

pub struct LoggingMiddleware;

impl Middleware for LoggingMiddleware {
    fn before(&self, request: &mut Request) {
        tracing::debug!(
            model = %request.model,
            messages = request.messages.len(),
            json_mode = request.response_format.is_some(),
            "LLM request"
        );
    }

    fn after(&self, _request: &Request, response: &mut Response) {
        tracing::debug!(
            model = %response.model,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            finish = ?response.finish_reason,
            "LLM response"
        );
    }
}

// ---------------------------------------------------------------------------
// Built-in middleware: CostTrackingMiddleware
// ---------------------------------------------------------------------------

/// Token totals seen by a [`CostTrackingMiddleware`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageTotals {
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Accumulates token usage across every call made through a client.
/// Clones share the same counters, so keep one to read totals later.
#[derive(Clone, Default)]
pub struct CostTrackingMiddleware {
    totals: Arc<[AtomicU64; 3]>,
}

impl CostTrackingMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn totals(&self) -> UsageTotals {
        UsageTotals {
            requests: self.totals[0].load(Ordering::Relaxed),
            input_tokens: self.totals[1].load(Ordering::Relaxed),
            output_tokens: self.totals[2].load(Ordering::Relaxed),
        }
    }

    pub fn total_input_tokens(&self) -> u64 {
        self.totals().input_tokens
    }

    pub fn total_output_tokens(&self) -> u64 {
        self.totals().output_tokens
    }
}

impl Middleware for CostTrackingMiddleware {
    fn after(&self, _request: &Request, response: &mut Response) {
        self.totals[0].fetch_add(1, Ordering::Relaxed);
        self.totals[1].fetch_add(response.usage.input_tokens, Ordering::Relaxed);
        self.totals[2].fetch_add(response.usage.output_tokens, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// ModelCatalog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub id: &'static str,
    pub provider: &'static str,
    pub context_window: usize,
    pub supports_json_mode: bool,
}

/// Chat models the pipeline is known to work with.
const KNOWN_MODELS: &[ModelInfo] = &[
    ModelInfo { id: "gpt-4o", provider: "openai", context_window: 128_000, supports_json_mode: true },
    ModelInfo { id: "gpt-4o-mini", provider: "openai", context_window: 128_000, supports_json_mode: true },
    ModelInfo { id: "gpt-4.1", provider: "openai", context_window: 1_047_576, supports_json_mode: true },
    ModelInfo { id: "gpt-4.1-mini", provider: "openai", context_window: 1_047_576, supports_json_mode: true },
    ModelInfo { id: "gpt-3.5-turbo", provider: "openai", context_window: 16_385, supports_json_mode: true },
];

#[derive(Default)]
pub struct ModelCatalog;

impl ModelCatalog {
    pub fn new() -> Self {
        Self
    }

    pub fn lookup(&self, model: &str) -> Option<&'static ModelInfo> {
        KNOWN_MODELS.iter().find(|m| m.id == model)
    }

    pub fn provider_for_model(&self, model: &str) -> Option<&'static str> {
        self.lookup(model).map(|m| m.provider)
    }
}

// ---------------------------------------------------------------------------
// LlmClient
// ---------------------------------------------------------------------------

/// Routes requests to registered providers and runs the middleware chain
/// around each call.
#[derive(Default)]
pub struct LlmClient {
    providers: HashMap<String, DynProvider>,
    /// First registered provider; used when nothing else resolves.
    fallback: Option<String>,
    model_catalog: ModelCatalog,
    middleware: Vec<Box<dyn Middleware>>,
}

impl LlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_provider(&mut self, provider: impl ProviderAdapter + 'static) {
        let name = provider.name().to_string();
        self.fallback.get_or_insert_with(|| name.clone());
        self.providers.insert(name, DynProvider::new(provider));
    }

    pub fn with_provider(mut self, provider: impl ProviderAdapter + 'static) -> Self {
        self.register_provider(provider);
        self
    }

    /// Middleware runs in registration order before the call and again after it.
    pub fn with_middleware(mut self, m: impl Middleware + 'static) -> Self {
        self.middleware.push(Box::new(m));
        self
    }

    pub fn model_catalog(&self) -> &ModelCatalog {
        &self.model_catalog
    }

    pub async fn complete(&self, request: &Request) -> Result<Response, AdvocateError> {
        let provider = self.resolve_provider(request)?;
        let mut outgoing = request.clone();
        if outgoing.model.is_empty() {
            outgoing.model = provider.default_model().to_string();
        }
        if outgoing.response_format.is_some() && !provider.supports_json_mode() {
            tracing::debug!(provider = provider.name(), "JSON mode unsupported, relying on prompt");
            outgoing.response_format = None;
        }
        self.middleware.iter().for_each(|m| m.before(&mut outgoing));

        let mut response = provider.complete(&outgoing).await?;
        self.middleware
            .iter()
            .for_each(|m| m.after(&outgoing, &mut response));
        Ok(response)
    }

    /// Explicit `provider` field, then the catalog's provider for the model,
    /// then the first registered provider.
    fn resolve_provider(&self, request: &Request) -> Result<&DynProvider, AdvocateError> {
        if let Some(name) = &request.provider {
            return self
                .providers
                .get(name)
                .ok_or_else(|| AdvocateError::ConfigError(format!("provider '{name}' not registered")));
        }

        self.model_catalog
            .provider_for_model(&request.model)
            .and_then(|name| self.providers.get(name))
            .or_else(|| self.fallback.as_ref().and_then(|n| self.providers.get(n)))
            .ok_or_else(|| AdvocateError::ConfigError("no language-model provider registered".into()))
    }

    /// A client with every provider whose credentials are present.
    pub fn from_env() -> Result<Self, AdvocateError> {
        let adapter = crate::OpenAiAdapter::from_env().map_err(|_| {
            AdvocateError::ConfigError("OPENAI_API_KEY is not set; no provider available".into())
        })?;
        Ok(Self::new().with_provider(adapter))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FinishReason, Message, Usage};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct MockProvider {
        name: &'static str,
        call_count: Arc<AtomicUsize>,
    }

    impl MockProvider {
        fn named(name: &'static str) -> Self {
            Self {
                name,
                call_count: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl ProviderAdapter for MockProvider {
        async fn complete(&self, _request: &Request) -> Result<Response, AdvocateError> {
            self.call_count.fetch_add(1, Ordering::Relaxed);
            Ok(Response {
                id: format!("{}-resp", self.name),
                text: format!("Hello from {}", self.name),
                usage: Usage {
                    input_tokens: 10,
                    output_tokens: 20,
                    cache_read_tokens: None,
                    total_tokens: 30,
                },
                model: "mock-model".into(),
                finish_reason: FinishReason::EndTurn,
            })
        }

        fn name(&self) -> &str {
            self.name
        }

        fn default_model(&self) -> &str {
            "mock-model"
        }

        fn supports_json_mode(&self) -> bool {
            true
        }

        fn context_window_size(&self) -> usize {
            128_000
        }
    }

    fn make_request(model: &str, provider: Option<&str>) -> Request {
        let mut req = Request::new(model, vec![Message::user("hello")]);
        req.provider = provider.map(String::from);
        req
    }

    #[tokio::test]
    async fn explicit_provider_wins() {
        let client = LlmClient::new()
            .with_provider(MockProvider::named("openai"))
            .with_provider(MockProvider::named("local"));

        let resp = client
            .complete(&make_request("gpt-4o", Some("local")))
            .await
            .unwrap();
        assert_eq!(resp.text, "Hello from local");
    }

    #[test]
    fn catalog_knows_openai_chat_models() {
        let catalog = ModelCatalog::new();
        let info = catalog.lookup("gpt-4o-mini").unwrap();
        assert_eq!(info.provider, "openai");
        assert!(info.supports_json_mode);
        assert_eq!(catalog.provider_for_model("gpt-3.5-turbo"), Some("openai"));
        assert!(catalog.lookup("llama-3").is_none());
    }

    #[tokio::test]
    async fn catalog_routes_by_model_name() {
        let client = LlmClient::new()
            .with_provider(MockProvider::named("local"))
            .with_provider(MockProvider::named("openai"));

        let resp = client.complete(&make_request("gpt-4o", None)).await.unwrap();
        assert_eq!(resp.id, "openai-resp");
    }

    #[tokio::test]
    async fn unknown_model_falls_back_to_first_registered() {
        let client = LlmClient::new()
            .with_provider(MockProvider::named("local"))
            .with_provider(MockProvider::named("other"));

        let resp = client
            .complete(&make_request("house-model", None))
            .await
            .unwrap();
        assert_eq!(resp.text, "Hello from local");
    }

    #[test]
    fn unresolvable_provider_is_config_error() {
        let client = LlmClient::new();
        assert!(matches!(
            client.resolve_provider(&make_request("gpt-4o", Some("missing"))),
            Err(AdvocateError::ConfigError(_))
        ));
        assert!(matches!(
            client.resolve_provider(&make_request("gpt-4o", None)),
            Err(AdvocateError::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn middleware_sees_request_and_response() {
        struct SeedPinner {
            seen_after: Arc<AtomicUsize>,
        }

        impl Middleware for SeedPinner {
            fn before(&self, request: &mut Request) {
                request.seed.get_or_insert(42);
            }
            fn after(&self, request: &Request, _response: &mut Response) {
                assert_eq!(request.seed, Some(42));
                self.seen_after.fetch_add(1, Ordering::Relaxed);
            }
        }

        let seen_after = Arc::new(AtomicUsize::new(0));
        let client = LlmClient::new()
            .with_middleware(SeedPinner {
                seen_after: seen_after.clone(),
            })
            .with_provider(MockProvider::named("local"));

        client.complete(&make_request("m", None)).await.unwrap();
        assert_eq!(seen_after.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn cost_tracking_counts_requests_and_tokens() {
        let cost = CostTrackingMiddleware::new();
        let client = LlmClient::new()
            .with_middleware(cost.clone())
            .with_provider(MockProvider::named("local"));

        let req = make_request("m", None);
        client.complete(&req).await.unwrap();
        client.complete(&req).await.unwrap();

        assert_eq!(
            cost.totals(),
            UsageTotals {
                requests: 2,
                input_tokens: 20,
                output_tokens: 40,
            }
        );
    }
}
