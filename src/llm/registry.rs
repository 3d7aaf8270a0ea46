//! Provider registry: maps backend ids to adapters and routes prefixed
//! model ids (`"groq/llama-3.3-70b"`) to the owning backend.

use std::collections::HashMap;
use std::sync::Arc;

use super::helpers::strip_model_prefix;
use super::provider::ProviderAdapter;

pub struct ProviderRegistry {
    adapters: HashMap<&'static str, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// Registry with every compiled-in backend registered.
    pub fn with_defaults() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();
        #[cfg(feature = "openai")]
        {
            registry = registry
                .register(Arc::new(super::openai::OpenAiCompatible::openai()))
                .register(Arc::new(super::openai::OpenAiCompatible::groq()))
                .register(Arc::new(super::openai::OpenAiCompatible::cerebras()))
                .register(Arc::new(super::openai::OpenAiCompatible::mistral()))
                .register(Arc::new(super::openai::OpenAiCompatible::ollama()));
        }
        #[cfg(feature = "anthropic")]
        {
            registry = registry.register(Arc::new(super::anthropic::AnthropicAdapter::new()));
        }
        #[cfg(feature = "gemini")]
        {
            registry = registry.register(Arc::new(super::gemini::GeminiAdapter::new()));
        }
        registry
    }

    pub fn register(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters.insert(adapter.id(), adapter);
        self
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<&'static str> {
        self.adapters.keys().copied().collect()
    }

    /// Resolve an adapter from a model id carrying a route prefix. Returns
    /// the adapter together with the stripped model id.
    pub fn resolve_model(&self, model: &str) -> Option<(Arc<dyn ProviderAdapter>, String)> {
        for adapter in self.adapters.values() {
            if let Some(prefix) = adapter.capabilities().model_prefix {
                if model.starts_with(prefix) {
                    let stripped = strip_model_prefix(model, Some(prefix)).to_string();
                    return Some((adapter.clone(), stripped));
                }
            }
        }
        None
    }

    /// Run every adapter's one-time setup. Failures are logged and skipped
    /// so a single unreachable backend does not block the rest.
    pub async fn initialize_all(&self) {
        for (id, adapter) in &self.adapters {
            if let Err(err) = adapter.initialize().await {
                log::warn!("provider {} failed to initialize: {}", id, err);
            }
        }
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
