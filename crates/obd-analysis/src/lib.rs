//! obd-analysis - Diagnosis of trouble codes with optional AI enrichment
//!
//! The catalog baseline always produces a complete result. Configured AI
//! providers are tried in order to add detail on top of it.

pub mod baseline;
pub mod config;
pub mod pipeline;
pub mod provider;

pub use baseline::{observe_sensors, Baseline};
pub use config::{AiConfig, ProviderConfig, ProviderKind};
pub use pipeline::{AnalysisInput, AnalysisPipeline};
pub use provider::{create_providers, AiProvider, EnrichmentRequest, EnrichmentResponse};
