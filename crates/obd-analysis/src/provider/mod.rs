//! AI enrichment providers
//!
//! Providers are interchangeable behind [`AiProvider`]; the pipeline tries them
//! in configured order and falls back to the catalog when all of them fail.

pub mod anthropic;
mod lenient;
pub mod openai;
pub mod prompt;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use obd_core::{
    AiProviderError, RepairSuggestion, SensorObservation, SensorReading, TroubleCode,
    VehicleContext, VehicleInfo,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiProvider;

use crate::config::{AiConfig, ProviderKind};

/// Uniform enrichment request passed to every provider
#[derive(Debug, Clone, Serialize)]
pub struct EnrichmentRequest {
    pub vehicle: VehicleContext,
    pub vehicle_info: VehicleInfo,
    pub codes: Vec<TroubleCode>,
    pub sensors: Vec<SensorReading>,
    pub observations: Vec<SensorObservation>,
}

/// Structured narrative returned by a provider
///
/// Every field is optional on the wire and decoded leniently; severities are
/// free text and parsed by the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EnrichmentResponse {
    #[serde(default, deserialize_with = "lenient::optional_text")]
    pub severity: Option<String>,
    #[serde(default, deserialize_with = "lenient::list")]
    pub diagnoses: Vec<AiDiagnosis>,
    #[serde(default, deserialize_with = "lenient::list")]
    pub diy_repairs: Vec<AiRepair>,
    #[serde(default, deserialize_with = "lenient::list")]
    pub professional_repairs: Vec<AiRepair>,
    #[serde(default, deserialize_with = "lenient::list")]
    pub safety_warnings: Vec<AiWarning>,
    #[serde(default, deserialize_with = "lenient::optional_text")]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AiDiagnosis {
    #[serde(default, deserialize_with = "lenient::text")]
    pub name: String,
    #[serde(default, deserialize_with = "lenient::text")]
    pub description: String,
    #[serde(default, deserialize_with = "lenient::number")]
    pub confidence: Option<f64>,
    #[serde(default, deserialize_with = "lenient::optional_text")]
    pub severity: Option<String>,
    /// Trouble codes the diagnosis explains
    #[serde(default, deserialize_with = "lenient::list")]
    pub codes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AiRepair {
    #[serde(default, deserialize_with = "lenient::text")]
    pub issue_name: String,
    #[serde(default, deserialize_with = "lenient::text")]
    pub repair_name: String,
    #[serde(default, deserialize_with = "lenient::text")]
    pub description: String,
    #[serde(default, deserialize_with = "lenient::number")]
    pub difficulty: Option<f64>,
    #[serde(default, deserialize_with = "lenient::optional_text")]
    pub estimated_cost: Option<String>,
    #[serde(default, deserialize_with = "lenient::list")]
    pub steps: Vec<String>,
}

impl AiRepair {
    pub fn into_suggestion(self) -> RepairSuggestion {
        RepairSuggestion {
            issue_name: self.issue_name,
            repair_name: self.repair_name,
            description: self.description,
            difficulty: self.difficulty.map(|d| d.round().clamp(1.0, 5.0) as u8),
            estimated_cost: self.estimated_cost,
            steps: self.steps,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AiWarning {
    #[serde(default, deserialize_with = "lenient::text")]
    pub text: String,
    #[serde(default, deserialize_with = "lenient::optional_text")]
    pub issue_name: Option<String>,
}

/// A generative-text service that can enrich a diagnosis
#[async_trait]
pub trait AiProvider: Send + Sync {
    /// Name used in logs and recorded on enriched results
    fn name(&self) -> &str;

    async fn enrich(
        &self,
        request: &EnrichmentRequest,
    ) -> Result<EnrichmentResponse, AiProviderError>;
}

/// Build the enabled providers in configured order
///
/// A provider without an API key is skipped with a warning.
pub fn create_providers(config: &AiConfig) -> Vec<Arc<dyn AiProvider>> {
    let client = match reqwest::Client::builder()
        .timeout(config.request_timeout())
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "Failed to build HTTP client, AI enrichment disabled");
            return Vec::new();
        }
    };

    let mut providers: Vec<Arc<dyn AiProvider>> = Vec::new();
    for provider in config.providers.iter().filter(|p| p.enabled) {
        let Some(api_key) = provider.resolve_api_key() else {
            warn!(
                provider = provider.kind.as_str(),
                env = %provider.api_key_env(),
                "API key not set, provider skipped"
            );
            continue;
        };
        debug!(provider = provider.kind.as_str(), model = %provider.model, "AI provider enabled");
        let timeout = config.request_timeout();
        match provider.kind {
            ProviderKind::Anthropic => providers.push(Arc::new(
                AnthropicProvider::new(client.clone(), provider, api_key).with_timeout(timeout),
            )),
            ProviderKind::OpenAi => providers.push(Arc::new(
                OpenAiProvider::new(client.clone(), provider, api_key).with_timeout(timeout),
            )),
        }
    }
    providers
}

/// Map a transport-level failure to the provider error taxonomy
pub(crate) fn request_error(provider: &str, timeout: Duration, error: reqwest::Error) -> AiProviderError {
    if error.is_timeout() {
        AiProviderError::Timeout {
            provider: provider.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }
    } else {
        AiProviderError::Network {
            provider: provider.to_string(),
            message: error.to_string(),
        }
    }
}

/// Map a non-success HTTP status to the provider error taxonomy
pub(crate) fn status_error(provider: &str, status: u16, message: String) -> AiProviderError {
    match status {
        401 | 403 => AiProviderError::Auth {
            provider: provider.to_string(),
        },
        429 => AiProviderError::RateLimited {
            provider: provider.to_string(),
        },
        _ => AiProviderError::Api {
            provider: provider.to_string(),
            status,
            message,
        },
    }
}
