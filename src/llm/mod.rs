//! LLM integration.
//!
//! Supports:
//! - **Grok**: x.ai chat completions
//! - **OpenAI**: chat completions
//!
//! Both go through `OpenAiCompatProvider`. `FailoverProvider` chains them
//! in the order the system config names.

pub mod failover;
pub mod openai_compat;
pub mod provider;

pub use failover::FailoverProvider;
pub use openai_compat::OpenAiCompatProvider;
pub use provider::*;

use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};

use crate::config::{AppConfig, ProviderKind, SystemConfig};
use crate::error::LlmError;

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: ProviderKind,
    pub api_key: SecretString,
    pub base_url: String,
    pub model: String,
}

impl LlmConfig {
    pub fn from_app(app: &AppConfig, backend: ProviderKind) -> Self {
        let settings = app.provider(backend);
        Self {
            backend,
            api_key: settings.api_key.clone(),
            base_url: settings.base_url.clone(),
            model: settings.model.clone(),
        }
    }
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    if config.api_key.expose_secret().trim().is_empty() {
        let var = match config.backend {
            ProviderKind::Grok => "GROK_API_KEY",
            ProviderKind::OpenAi => "OPENAI_API_KEY",
        };
        return Err(LlmError::NotConfigured {
            provider: config.backend.to_string(),
            hint: format!("set {var}"),
        });
    }

    let provider = OpenAiCompatProvider::new(
        config.backend.to_string(),
        config.base_url.clone(),
        config.api_key.clone(),
        config.model.clone(),
    )?;
    tracing::info!(provider = %config.backend, model = %config.model, "LLM provider ready");
    Ok(Arc::new(provider))
}

/// Build the generation chain: primary first, then fallback.
///
/// Backends without credentials are skipped with a warning. An empty chain
/// is a configuration error.
pub fn provider_chain(app: &AppConfig, system: &SystemConfig) -> Result<FailoverProvider, LlmError> {
    let mut providers = Vec::new();
    for kind in [system.primary_provider, system.fallback_provider] {
        match create_provider(&LlmConfig::from_app(app, kind)) {
            Ok(p) => providers.push(p),
            Err(e) if e.is_config() => {
                tracing::warn!(provider = %kind, "Skipping unconfigured provider: {e}");
            }
            Err(e) => return Err(e),
        }
    }

    if providers.is_empty() {
        return Err(LlmError::NotConfigured {
            provider: "all".into(),
            hint: "set GROK_API_KEY or OPENAI_API_KEY".into(),
        });
    }
    Ok(FailoverProvider::new(providers))
}
