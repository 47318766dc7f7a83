//! Provider registry.
//!
//! Constructs and holds all configured LLM provider instances. At startup the
//! registry resolves authentication (env vars, direct keys) and instantiates
//! the appropriate adapter for each configured provider, in the order they
//! appear in the config. The first provider to mount successfully is the
//! default used when a request names none.

use crate::anthropic::AnthropicProvider;
use crate::openai_compat::OpenAiCompatProvider;
use crate::traits::LlmProvider;
use ad_domain::config::{LlmConfig, ProviderKind};
use ad_domain::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;

pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    order: Vec<String>,
    init_errors: Vec<ProviderInitError>,
}

/// Records a provider that failed to initialize.
#[derive(Debug, Clone)]
pub struct ProviderInitError {
    pub provider_id: String,
    pub kind: String,
    pub error: String,
}

/// Mask substrings that look like API keys or bearer tokens in an error
/// message before it reaches logs or the readiness endpoint.
fn mask_secrets(msg: &str) -> String {
    let mut result = msg.to_string();
    for word in msg.split(|c: char| c.is_whitespace() || c == '\'' || c == '"' || c == ',') {
        let trimmed = word.trim();
        if trimmed.len() >= 20 && trimmed.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            let masked = if trimmed.len() > 8 {
                format!("{}...{}", &trimmed[..4], &trimmed[trimmed.len() - 4..])
            } else {
                "***masked***".to_string()
            };
            result = result.replace(trimmed, &masked);
        }
    }
    result
}

impl ProviderRegistry {
    /// Build the registry from the application's [`LlmConfig`].
    ///
    /// Providers that fail to initialize are logged and skipped rather than
    /// aborting the entire startup, unless every configured provider fails,
    /// in which case construction errors out — a daemon with no usable
    /// provider cannot serve a single chat request.
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let mut providers: HashMap<String, Arc<dyn LlmProvider>> = HashMap::new();
        // (id, priority), pushed in declaration order so a stable sort below
        // ties priority to insertion order exactly.
        let mut ordered: Vec<(String, i32)> = Vec::new();
        let mut init_errors: Vec<ProviderInitError> = Vec::new();

        for pc in &config.providers {
            let result: Result<Arc<dyn LlmProvider>> = match pc.kind {
                ProviderKind::OpenaiCompat => {
                    OpenAiCompatProvider::from_config(pc).map(|p| Arc::new(p) as Arc<dyn LlmProvider>)
                }
                ProviderKind::Anthropic => {
                    AnthropicProvider::from_config(pc).map(|p| Arc::new(p) as Arc<dyn LlmProvider>)
                }
            };

            match result {
                Ok(provider) => {
                    tracing::info!(provider_id = %pc.id, kind = ?pc.kind, "registered LLM provider");
                    ordered.push((pc.id.clone(), pc.priority));
                    providers.insert(pc.id.clone(), provider);
                }
                Err(e) => {
                    let safe_error = mask_secrets(&e.to_string());
                    tracing::warn!(provider_id = %pc.id, kind = ?pc.kind, error = %safe_error, "failed to initialize LLM provider, skipping");
                    init_errors.push(ProviderInitError { provider_id: pc.id.clone(), kind: format!("{:?}", pc.kind), error: safe_error });
                }
            }
        }

        if providers.is_empty() && !config.providers.is_empty() {
            return Err(Error::Config("all configured LLM providers failed to initialize".into()));
        }

        // Ascending priority, default 100, tie-break on declaration order.
        ordered.sort_by_key(|(_, priority)| *priority);
        let order: Vec<String> = ordered.into_iter().map(|(id, _)| id).collect();

        Ok(Self { providers, order, init_errors })
    }

    /// Build a registry directly from already-instantiated providers,
    /// bypassing config-driven construction — used to mount providers that
    /// aren't wire adapters (test doubles, in-process providers).
    pub fn from_parts(
        providers: HashMap<String, Arc<dyn LlmProvider>>,
        order: Vec<String>,
        init_errors: Vec<ProviderInitError>,
    ) -> Self {
        Self { providers, order, init_errors }
    }

    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers.get(provider_id).cloned()
    }

    /// The highest-priority provider (ascending priority, ties broken by
    /// declaration order) — used when a turn names no provider explicitly.
    pub fn default_provider(&self) -> Option<Arc<dyn LlmProvider>> {
        self.order.first().and_then(|id| self.providers.get(id)).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn LlmProvider>)> {
        self.providers.iter()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn list_providers(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn init_errors(&self) -> &[ProviderInitError] {
        &self.init_errors
    }
}
