//! Engine name to provider lookup, built from config.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use animo_core::config::Config;

use crate::anthropic::AnthropicProvider;
use crate::openai::OpenAiProvider;
use crate::{Credentials, LlmProvider};

const OPENAI_DEFAULT_MODEL: &str = "gpt-4o";
const ANTHROPIC_DEFAULT_MODEL: &str = "claude-3-5-sonnet-20240620";

/// A provider ready to call: client, credentials, and fallback model.
#[derive(Clone)]
pub struct ProviderEntry {
    pub provider: Arc<dyn LlmProvider>,
    pub credentials: Credentials,
    pub default_model: String,
}

/// Providers keyed by engine name (`"openai"`, `"anthropic"`).
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    entries: HashMap<String, ProviderEntry>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every configured provider that has an API key.
    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::new();
        for provider_config in config.providers() {
            let Some(api_key) = provider_config.resolve_api_key() else {
                warn!(provider = %provider_config.id, "No API key; provider disabled");
                continue;
            };
            let base_url = provider_config.base_url.as_deref();
            let (provider, default_model): (Arc<dyn LlmProvider>, &str) =
                match provider_config.id.as_str() {
                    "openai" => (Arc::new(OpenAiProvider::new(base_url)), OPENAI_DEFAULT_MODEL),
                    "anthropic" => (
                        Arc::new(AnthropicProvider::new(base_url)),
                        ANTHROPIC_DEFAULT_MODEL,
                    ),
                    other => {
                        warn!(provider = other, "Unknown provider id; skipping");
                        continue;
                    }
                };
            debug!(provider = %provider_config.id, "Provider registered");
            registry.register(
                provider_config.id.clone(),
                ProviderEntry {
                    provider,
                    credentials: Credentials::ApiKey { api_key },
                    default_model: provider_config
                        .default_model
                        .clone()
                        .unwrap_or_else(|| default_model.to_string()),
                },
            );
        }
        registry
    }

    pub fn register(&mut self, engine: impl Into<String>, entry: ProviderEntry) {
        self.entries.insert(engine.into(), entry);
    }

    pub fn get(&self, engine: &str) -> Option<&ProviderEntry> {
        self.entries.get(engine)
    }

    /// Provider for a model name: `claude-*` goes to Anthropic, the rest to OpenAI.
    pub fn for_model(&self, model: &str) -> Option<&ProviderEntry> {
        if model.starts_with("claude-") {
            self.get("anthropic")
        } else {
            self.get("openai")
        }
    }

    pub fn engines(&self) -> Vec<&str> {
        let mut engines: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        engines.sort_unstable();
        engines
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
