// src/provider.rs - Upstream provider configuration and request dispatch

use serde_json::Value;

/// Known upstream flavors. OpenRouter wants attribution headers on every
/// request; everything else speaks plain OpenAI-compatible HTTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenRouter,
    OpenAiCompatible,
}

/// Tagged upstream configuration with a single dispatch point for building
/// chat-completion requests.
#[derive(Debug, Clone)]
pub struct UpstreamProvider {
    pub base_url: String,
    api_key: Option<String>,
    kind: ProviderKind,
}

impl UpstreamProvider {
    pub fn from_config(base_url: &str, api_key: Option<&str>) -> Self {
        let kind = if base_url.contains("openrouter.ai") {
            ProviderKind::OpenRouter
        } else {
            ProviderKind::OpenAiCompatible
        };
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.map(|k| k.to_string()),
            kind,
        }
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    pub fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    /// Build the upstream POST with auth and provider-specific headers.
    pub fn chat_completion_request(
        &self,
        client: &reqwest::Client,
        body: &Value,
    ) -> reqwest::RequestBuilder {
        let mut builder = client
            .post(self.chat_completions_url())
            .header("Content-Type", "application/json")
            .json(body);

        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        if self.kind == ProviderKind::OpenRouter {
            builder = builder
                .header("HTTP-Referer", "https://streamfix.dev")
                .header("X-Title", "StreamFix Gateway");
        }

        builder
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openrouter_detected_from_url() {
        let provider = UpstreamProvider::from_config("https://openrouter.ai/api/v1", Some("key"));
        assert_eq!(provider.kind(), ProviderKind::OpenRouter);
    }

    #[test]
    fn test_local_upstream_is_openai_compatible() {
        let provider = UpstreamProvider::from_config("http://localhost:1234/v1", None);
        assert_eq!(provider.kind(), ProviderKind::OpenAiCompatible);
    }

    #[test]
    fn test_chat_completions_url_joins_cleanly() {
        let provider = UpstreamProvider::from_config("http://localhost:1234/v1/", None);
        assert_eq!(
            provider.chat_completions_url(),
            "http://localhost:1234/v1/chat/completions"
        );
    }
}
