//! Ordered provider fallback.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::provider::{CompletionRequest, CompletionResponse, LlmProvider};
use crate::error::LlmError;

/// Tries each provider in order; the first success wins.
///
/// Failures are logged and collected. Configuration errors stop the walk
/// immediately since another backend cannot fix them.
pub struct FailoverProvider {
    providers: Vec<Arc<dyn LlmProvider>>,
    label: String,
}

impl FailoverProvider {
    pub fn new(providers: Vec<Arc<dyn LlmProvider>>) -> Self {
        let label = providers
            .iter()
            .map(|p| p.name().to_string())
            .collect::<Vec<_>>()
            .join("->");
        Self { providers, label }
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[async_trait]
impl LlmProvider for FailoverProvider {
    fn name(&self) -> &str {
        &self.label
    }

    fn model_name(&self) -> &str {
        self.providers
            .first()
            .map(|p| p.model_name())
            .unwrap_or("none")
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let mut reasons = Vec::new();

        for (attempt, provider) in self.providers.iter().enumerate() {
            match provider.complete(request.clone()).await {
                Ok(resp) => {
                    if attempt > 0 {
                        warn!(
                            provider = provider.name(),
                            attempt = attempt + 1,
                            "Completion served by fallback provider"
                        );
                    }
                    return Ok(resp);
                }
                Err(e) if e.is_config() => return Err(e),
                Err(e) => {
                    warn!(provider = provider.name(), error = %e, "Provider failed");
                    reasons.push(format!("{}: {e}", provider.name()));
                }
            }
        }

        Err(LlmError::AllProvidersFailed { reasons })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::llm::provider::{ChatMessage, FinishReason};

    struct Scripted {
        name: &'static str,
        fail: Option<fn(&str) -> LlmError>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn ok(name: &'static str) -> Arc<Self> {
            Arc::new(Self { name, fail: None, calls: AtomicUsize::new(0) })
        }

        fn failing(name: &'static str, fail: fn(&str) -> LlmError) -> Arc<Self> {
            Arc::new(Self { name, fail: Some(fail), calls: AtomicUsize::new(0) })
        }
    }

    #[async_trait]
    impl LlmProvider for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, _req: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(fail) = self.fail {
                return Err(fail(self.name));
            }
            Ok(CompletionResponse {
                content: format!("from {}", self.name),
                input_tokens: 1,
                output_tokens: 1,
                finish_reason: FinishReason::Stop,
                provider: self.name.to_string(),
            })
        }
    }

    fn rate_limited(p: &str) -> LlmError {
        LlmError::RateLimited { provider: p.into(), retry_after: None }
    }

    fn not_configured(p: &str) -> LlmError {
        LlmError::NotConfigured { provider: p.into(), hint: "no key".into() }
    }

    fn request() -> CompletionRequest {
        CompletionRequest::new(vec![ChatMessage::user("hello")])
    }

    #[tokio::test]
    async fn primary_success_skips_fallback() {
        let primary = Scripted::ok("grok");
        let fallback = Scripted::ok("openai");
        let chain = FailoverProvider::new(vec![primary.clone(), fallback.clone()]);

        let resp = chain.complete(request()).await.unwrap();
        assert_eq!(resp.provider, "grok");
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn falls_back_once_on_failure() {
        let primary = Scripted::failing("grok", rate_limited);
        let fallback = Scripted::ok("openai");
        let chain = FailoverProvider::new(vec![primary.clone(), fallback.clone()]);

        let resp = chain.complete(request()).await.unwrap();
        assert_eq!(resp.provider, "openai");
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn collects_all_errors() {
        let chain = FailoverProvider::new(vec![
            Scripted::failing("grok", rate_limited),
            Scripted::failing("openai", rate_limited),
        ]);
        match chain.complete(request()).await {
            Err(LlmError::AllProvidersFailed { reasons }) => {
                assert_eq!(reasons.len(), 2);
                assert!(reasons[0].starts_with("grok:"));
                assert!(reasons[1].starts_with("openai:"));
            }
            other => panic!("expected AllProvidersFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn config_error_is_not_retried() {
        let fallback = Scripted::ok("openai");
        let chain = FailoverProvider::new(vec![
            Scripted::failing("grok", not_configured),
            fallback.clone(),
        ]);
        let err = chain.complete(request()).await.unwrap_err();
        assert!(err.is_config());
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn label_joins_provider_names() {
        let chain = FailoverProvider::new(vec![Scripted::ok("grok"), Scripted::ok("openai")]);
        assert_eq!(chain.name(), "grok->openai");
        assert_eq!(chain.len(), 2);
    }
}
