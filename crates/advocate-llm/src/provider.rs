use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;

use advocate_types::AdvocateError;

use crate::{Request, Response};

/// An opaque text-completion service.
///
/// Adapters translate [`Request`] into the vendor's wire format and map its
/// failures onto [`AdvocateError`] so the retry layer can classify them.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn complete(&self, request: &Request) -> Result<Response, AdvocateError>;

    fn name(&self) -> &str;

    /// Used when a request leaves `model` empty.
    fn default_model(&self) -> &str;

    /// Whether the service honours `ResponseFormat::JsonObject`. When it does
    /// not, the client drops the format and relies on prompt instructions.
    fn supports_json_mode(&self) -> bool {
        true
    }

    fn context_window_size(&self) -> usize;
}

/// Shared handle to a registered adapter.
#[derive(Clone)]
pub struct DynProvider(Arc<dyn ProviderAdapter>);

impl DynProvider {
    pub fn new(provider: impl ProviderAdapter + 'static) -> Self {
        Self(Arc::new(provider))
    }
}

impl Deref for DynProvider {
    type Target = dyn ProviderAdapter;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}
