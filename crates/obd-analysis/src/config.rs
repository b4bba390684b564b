//! AI provider configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    /// Bound on each provider call
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Providers in the order they are tried
    #[serde(default = "default_providers")]
    pub providers: Vec<ProviderConfig>,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            providers: default_providers(),
        }
    }
}

impl AiConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// No AI providers; analysis uses the catalog only
    pub fn disabled() -> Self {
        Self {
            providers: Vec::new(),
            ..Default::default()
        }
    }
}

fn default_request_timeout_ms() -> u64 {
    20_000
}

fn default_providers() -> Vec<ProviderConfig> {
    vec![
        ProviderConfig::anthropic("claude-3-5-sonnet-20241022"),
        ProviderConfig::openai("gpt-4o"),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    #[serde(rename = "openai")]
    OpenAi,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::OpenAi => "openai",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub model: String,
    /// API base URL; the provider appends its own path
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Environment variable holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Key given directly, takes precedence over `api_key_env`
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl ProviderConfig {
    pub fn anthropic(model: impl Into<String>) -> Self {
        Self::new(ProviderKind::Anthropic, model)
    }

    pub fn openai(model: impl Into<String>) -> Self {
        Self::new(ProviderKind::OpenAi, model)
    }

    fn new(kind: ProviderKind, model: impl Into<String>) -> Self {
        Self {
            kind,
            model: model.into(),
            endpoint: None,
            api_key_env: None,
            api_key: None,
            max_tokens: default_max_tokens(),
            enabled: true,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn endpoint(&self) -> String {
        let endpoint = self.endpoint.clone().unwrap_or_else(|| {
            match self.kind {
                ProviderKind::Anthropic => "https://api.anthropic.com/v1",
                ProviderKind::OpenAi => "https://api.openai.com/v1",
            }
            .to_string()
        });
        endpoint.trim_end_matches('/').to_string()
    }

    pub fn api_key_env(&self) -> String {
        self.api_key_env.clone().unwrap_or_else(|| {
            match self.kind {
                ProviderKind::Anthropic => "ANTHROPIC_API_KEY",
                ProviderKind::OpenAi => "OPENAI_API_KEY",
            }
            .to_string()
        })
    }

    /// Configured key, or the value of the key environment variable
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var(self.api_key_env()).ok())
            .filter(|key| !key.trim().is_empty())
    }
}

fn default_max_tokens() -> u32 {
    4000
}

fn default_enabled() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_order() {
        let config = AiConfig::default();
        let kinds: Vec<ProviderKind> = config.providers.iter().map(|p| p.kind).collect();
        assert_eq!(kinds, vec![ProviderKind::Anthropic, ProviderKind::OpenAi]);
        assert_eq!(config.request_timeout(), Duration::from_secs(20));
    }

    #[test]
    fn test_provider_table() {
        let config: AiConfig = toml::from_str(
            r#"
request_timeout_ms = 15000

[[providers]]
kind = "openai"
model = "gpt-4o-mini"
endpoint = "http://localhost:8080/v1/"
api_key_env = "LOCAL_LLM_KEY"

[[providers]]
kind = "anthropic"
model = "claude-3-5-haiku-latest"
enabled = false
"#,
        )
        .unwrap();
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers[0].endpoint(), "http://localhost:8080/v1");
        assert_eq!(config.providers[0].api_key_env(), "LOCAL_LLM_KEY");
        assert_eq!(config.providers[1].max_tokens, 4000);
        assert!(!config.providers[1].enabled);
        assert_eq!(
            config.providers[1].endpoint(),
            "https://api.anthropic.com/v1"
        );
    }

    #[test]
    fn test_explicit_key_wins() {
        let provider = ProviderConfig::openai("gpt-4o")
            .with_api_key("sk-test")
            .with_endpoint("http://127.0.0.1:1");
        assert_eq!(provider.resolve_api_key().as_deref(), Some("sk-test"));
    }
}
