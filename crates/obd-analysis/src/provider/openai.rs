//! OpenAI-compatible chat completions provider

use std::time::Duration;

use async_trait::async_trait;
use obd_core::AiProviderError;
use serde::{Deserialize, Serialize};

use super::prompt::{build_user_prompt, parse_response, SYSTEM_PROMPT};
use super::{request_error, status_error, AiProvider, EnrichmentRequest, EnrichmentResponse};
use crate::config::ProviderConfig;

const NAME: &str = "openai";

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct OpenAIResponseFormat {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    max_tokens: u32,
    response_format: OpenAIResponseFormat,
}

#[derive(Debug, Deserialize)]
struct OpenAIMessageResponse {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessageResponse,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAIErrorResponse {
    error: OpenAIErrorDetail,
}

#[derive(Debug, Deserialize)]
struct OpenAIErrorDetail {
    message: String,
}

pub struct OpenAiProvider {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    max_tokens: u32,
    api_key: String,
    timeout: Duration,
}

impl OpenAiProvider {
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

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl AiProvider for OpenAiProvider {
    fn name(&self) -> &str {
        NAME
    }

    async fn enrich(
        &self,
        request: &EnrichmentRequest,
    ) -> Result<EnrichmentResponse, AiProviderError> {
        let url = format!("{}/chat/completions", self.endpoint);
        let body = OpenAIRequest {
            model: self.model.clone(),
            messages: vec![
                OpenAIMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                OpenAIMessage {
                    role: "user".to_string(),
                    content: build_user_prompt(request),
                },
            ],
            max_tokens: self.max_tokens,
            response_format: OpenAIResponseFormat {
                kind: "json_object".to_string(),
            },
        };

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| request_error(NAME, self.timeout, e))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<OpenAIErrorResponse>(&error_text)
                .map(|e| e.error.message)
                .unwrap_or(error_text);
            return Err(status_error(NAME, status.as_u16(), message));
        }

        let parsed: OpenAIResponse = response.json().await.map_err(|e| {
            AiProviderError::InvalidResponse {
                provider: NAME.to_string(),
                message: e.to_string(),
            }
        })?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| AiProviderError::InvalidResponse {
                provider: NAME.to_string(),
                message: "no message content".to_string(),
            })?;
        parse_response(NAME, &content)
    }
}
