//! Anthropic Messages API provider

use std::time::Duration;

use async_trait::async_trait;
use obd_core::AiProviderError;
use serde::{Deserialize, Serialize};

use super::prompt::{build_user_prompt, parse_response, SYSTEM_PROMPT};
use super::{request_error, status_error, AiProvider, EnrichmentRequest, EnrichmentResponse};
use crate::config::ProviderConfig;

const NAME: &str = "anthropic";
const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    system: String,
    messages: Vec<AnthropicMessage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorResponse {
    error: AnthropicErrorDetail,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorDetail {
    message: String,
}

pub struct AnthropicProvider {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    max_tokens: u32,
    api_key: String,
    timeout: Duration,
}

impl AnthropicProvider {
    pub fn new(client: reqwest::Client, config: &ProviderConfig, api_key: String) -> Self {
        Self {
            client,
            endpoint: config.endpoint(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            api_key,
            timeout: Duration::from_secs(30),
        }
    }

    /// Timeout reported in errors; the pipeline enforces its own bound
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl AiProvider for AnthropicProvider {
    fn name(&self) -> &str {
        NAME
    }

    async fn enrich(
        &self,
        request: &EnrichmentRequest,
    ) -> Result<EnrichmentResponse, AiProviderError> {
        let url = format!("{}/messages", self.endpoint);
        let body = AnthropicRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            system: SYSTEM_PROMPT.to_string(),
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content: build_user_prompt(request),
            }],
        };

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| request_error(NAME, self.timeout, e))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<AnthropicErrorResponse>(&error_text)
                .map(|e| e.error.message)
                .unwrap_or(error_text);
            return Err(status_error(NAME, status.as_u16(), message));
        }

        let parsed: AnthropicResponse = response.json().await.map_err(|e| {
            AiProviderError::InvalidResponse {
                provider: NAME.to_string(),
                message: e.to_string(),
            }
        })?;
        let text: String = parsed
            .content
            .into_iter()
            .filter_map(|block| block.text)
            .collect();
        if text.trim().is_empty() {
            return Err(AiProviderError::InvalidResponse {
                provider: NAME.to_string(),
                message: "empty response".to_string(),
            });
        }
        parse_response(NAME, &text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use obd_core::VehicleContext;
    use serde_json::{json, Value};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn provider(endpoint: String) -> AnthropicProvider {
        let config = ProviderConfig::anthropic("claude-test").with_endpoint(endpoint);
        AnthropicProvider::new(reqwest::Client::new(), &config, "key-123".to_string())
    }

    fn request() -> EnrichmentRequest {
        EnrichmentRequest {
            vehicle: VehicleContext::new("car-1"),
            vehicle_info: Default::default(),
            codes: Vec::new(),
            sensors: Vec::new(),
            observations: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_successful_enrichment() {
        let router = Router::new().route(
            "/messages",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                assert_eq!(headers["x-api-key"], "key-123");
                assert_eq!(body["model"], "claude-test");
                let text = json!({
                    "severity": "high",
                    "diagnoses": [{"name": "Ignition coil failure", "confidence": 0.8, "codes": ["P0301"]}]
                })
                .to_string();
                Json(json!({"content": [{"type": "text", "text": text}]}))
            }),
        );
        let endpoint = serve(router).await;

        let response = provider(endpoint).enrich(&request()).await.unwrap();
        assert_eq!(response.severity.as_deref(), Some("high"));
        assert_eq!(response.diagnoses[0].codes, vec!["P0301"]);
    }

    #[tokio::test]
    async fn test_auth_failure() {
        let router = Router::new().route(
            "/messages",
            post(|| async {
                (
                    StatusCode::UNAUTHORIZED,
                    Json(json!({"error": {"type": "authentication_error", "message": "invalid x-api-key"}})),
                )
            }),
        );
        let endpoint = serve(router).await;

        let err = provider(endpoint).enrich(&request()).await.unwrap_err();
        assert_eq!(
            err,
            AiProviderError::Auth {
                provider: "anthropic".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_server_error_message() {
        let router = Router::new().route(
            "/messages",
            post(|| async {
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({"error": {"type": "overloaded_error", "message": "Overloaded"}})),
                )
            }),
        );
        let endpoint = serve(router).await;

        let err = provider(endpoint).enrich(&request()).await.unwrap_err();
        assert_eq!(
            err,
            AiProviderError::Api {
                provider: "anthropic".to_string(),
                status: 503,
                message: "Overloaded".to_string(),
            }
        );
    }
}
