//! Analysis pipeline
//!
//! Builds the catalog baseline, asks the configured AI providers in order for
//! a narrative, and merges the first usable answer over the baseline. Provider
//! failures are logged and absorbed; [`AnalysisPipeline::analyze`] always
//! returns a result.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use obd_core::{
    AnalysisResult, Diagnosis, DiagnosisSource, ReferenceCatalog, RepairSuggestion,
    SafetyWarning, SensorObservation, SensorReading, Severity, TroubleCode, VehicleContext,
    VehicleInfo,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::baseline::{observe_sensors, push_warning, Baseline};
use crate::config::AiConfig;
use crate::provider::{
    create_providers, AiDiagnosis, AiProvider, AiRepair, EnrichmentRequest, EnrichmentResponse,
};

/// Confidence used when a provider omits one
const AI_DEFAULT_CONFIDENCE: f64 = 0.7;

/// Everything the pipeline needs to know about one scan
#[derive(Debug, Clone, Default)]
pub struct AnalysisInput {
    pub vehicle: VehicleContext,
    pub vehicle_info: VehicleInfo,
    pub codes: Vec<TroubleCode>,
    pub sensors: Vec<SensorReading>,
}

pub struct AnalysisPipeline {
    catalog: Arc<ReferenceCatalog>,
    providers: Vec<Arc<dyn AiProvider>>,
    request_timeout: Duration,
}

impl AnalysisPipeline {
    pub fn new(
        catalog: Arc<ReferenceCatalog>,
        providers: Vec<Arc<dyn AiProvider>>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            catalog,
            providers,
            request_timeout,
        }
    }

    /// Pipeline with the providers enabled in `config`
    pub fn from_config(catalog: Arc<ReferenceCatalog>, config: &AiConfig) -> Self {
        Self::new(catalog, create_providers(config), config.request_timeout())
    }

    /// Pipeline that never calls out; results come from the catalog alone
    pub fn baseline_only(catalog: Arc<ReferenceCatalog>) -> Self {
        Self::new(catalog, Vec::new(), Duration::from_secs(20))
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    pub fn catalog(&self) -> &Arc<ReferenceCatalog> {
        &self.catalog
    }

    /// Analyze one scan
    ///
    /// Cancelling `cancel` abandons any in-flight provider call; the baseline
    /// result is returned in that case.
    pub async fn analyze(&self, input: AnalysisInput, cancel: &CancellationToken) -> AnalysisResult {
        let observations = observe_sensors(&input.sensors);
        if input.codes.is_empty() {
            debug!("No trouble codes, skipping analysis");
            return AnalysisResult::no_issues(observations);
        }

        let baseline = Baseline::build(&self.catalog, &input.codes);
        let code_count = input.codes.len();
        let request = EnrichmentRequest {
            vehicle: input.vehicle,
            vehicle_info: input.vehicle_info,
            codes: input.codes,
            sensors: input.sensors,
            observations,
        };
        let enrichment = self.enrich(&request, cancel).await;

        let result = self.merge(baseline, enrichment, request.observations, code_count);
        info!(
            severity = %result.severity,
            diagnoses = result.diagnoses.len(),
            enriched_by = result.enriched_by.as_deref().unwrap_or("none"),
            "Analysis complete"
        );
        result
    }

    /// First successful provider response, in configured order
    async fn enrich(
        &self,
        request: &EnrichmentRequest,
        cancel: &CancellationToken,
    ) -> Option<(String, EnrichmentResponse)> {
        for provider in &self.providers {
            let name = provider.name();
            debug!(provider = name, "Requesting AI enrichment");

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(provider = name, "Analysis cancelled, abandoning AI call");
                    return None;
                }
                outcome = tokio::time::timeout(self.request_timeout, provider.enrich(request)) => outcome,
            };

            match outcome {
                Ok(Ok(response)) => {
                    info!(provider = name, diagnoses = response.diagnoses.len(), "AI enrichment received");
                    return Some((name.to_string(), response));
                }
                Ok(Err(e)) => {
                    warn!(provider = name, error = %e, "AI provider failed");
                }
                Err(_) => {
                    warn!(
                        provider = name,
                        timeout_ms = self.request_timeout.as_millis() as u64,
                        "AI provider timed out"
                    );
                }
            }
        }
        if !self.providers.is_empty() {
            warn!("No AI provider answered, using catalog analysis");
        }
        None
    }

    fn merge(
        &self,
        baseline: Baseline,
        enrichment: Option<(String, EnrichmentResponse)>,
        observations: Vec<SensorObservation>,
        code_count: usize,
    ) -> AnalysisResult {
        let Baseline {
            mut severity,
            mut diagnoses,
            mut diy_repairs,
            mut professional_repairs,
            mut safety_warnings,
        } = baseline;

        let mut summary = None;
        let mut enriched_by = None;

        if let Some((provider, response)) = enrichment {
            if let Some(overall) = response.severity.as_deref().and_then(parse_severity) {
                severity = severity.max(overall);
            }
            for ai in response.diagnoses {
                merge_diagnosis(&mut diagnoses, ai);
            }
            merge_repairs(&mut diy_repairs, response.diy_repairs);
            merge_repairs(&mut professional_repairs, response.professional_repairs);
            for warning in response.safety_warnings {
                push_warning(
                    &mut safety_warnings,
                    SafetyWarning {
                        text: warning.text,
                        issue_name: warning.issue_name,
                    },
                );
            }
            summary = response.summary.filter(|s| !s.trim().is_empty());
            enriched_by = Some(provider);
        }

        severity = severity.max(Severity::max_of(diagnoses.iter().map(|d| d.severity)));
        diagnoses.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| b.confidence.partial_cmp(&a.confidence).unwrap_or(Ordering::Equal))
        });

        if severity.is_serious() {
            if let Some(text) = self.catalog.serious_warning() {
                if !safety_warnings.iter().any(|w| w.text == text) {
                    safety_warnings.insert(
                        0,
                        SafetyWarning {
                            text: text.to_string(),
                            issue_name: None,
                        },
                    );
                }
            }
        }

        if professional_repairs.is_empty() {
            if let Some(fallback) = self.catalog.fallback_repair() {
                professional_repairs.push(RepairSuggestion {
                    issue_name: "General diagnosis".to_string(),
                    repair_name: fallback.repair_name.clone(),
                    description: fallback.description.clone(),
                    difficulty: fallback.difficulty,
                    estimated_cost: fallback.estimated_cost.clone(),
                    steps: Vec::new(),
                });
            }
        }

        let summary = summary.unwrap_or_else(|| {
            generated_summary(severity, &diagnoses, code_count, enriched_by.is_some())
        });

        AnalysisResult {
            severity,
            diagnoses,
            diy_repairs,
            professional_repairs,
            safety_warnings,
            observations,
            summary,
            enriched_by,
        }
    }
}

fn parse_severity(text: &str) -> Option<Severity> {
    match text.parse() {
        Ok(severity) => Some(severity),
        Err(e) => {
            debug!(error = %e, "Ignoring provider severity");
            None
        }
    }
}

/// Provider confidence within `[0, 1]`, `None` when missing or not a number
fn stated_confidence(value: Option<f64>) -> Option<f64> {
    value.filter(|c| c.is_finite()).map(|c| c.clamp(0.0, 1.0))
}

fn clamp_confidence(value: Option<f64>) -> f64 {
    stated_confidence(value).unwrap_or(AI_DEFAULT_CONFIDENCE)
}

/// Attach an AI diagnosis to the baseline entries for the codes it names, or
/// append it when it names none of them
fn merge_diagnosis(diagnoses: &mut Vec<Diagnosis>, ai: AiDiagnosis) {
    if ai.name.trim().is_empty() {
        return;
    }
    let stated = stated_confidence(ai.confidence);
    let severity = ai.severity.as_deref().and_then(parse_severity);

    let mut matched = false;
    for diagnosis in diagnoses
        .iter_mut()
        .filter(|d| d.source != DiagnosisSource::Ai)
        .filter(|d| ai.codes.iter().any(|code| d.covers(code)))
    {
        matched = true;
        let note = if ai.description.is_empty() {
            ai.name.clone()
        } else {
            format!("{}: {}", ai.name, ai.description)
        };
        diagnosis.detail = Some(match diagnosis.detail.take() {
            Some(existing) => format!("{}\n{}", existing, note),
            None => note,
        });
        // Without a stated confidence the baseline value stands
        if let Some(stated) = stated {
            diagnosis.confidence = stated;
        }
        if let Some(severity) = severity {
            diagnosis.severity = diagnosis.severity.max(severity);
        }
    }

    if !matched {
        diagnoses.push(Diagnosis {
            name: ai.name,
            description: ai.description,
            confidence: clamp_confidence(ai.confidence),
            severity: severity.unwrap_or(Severity::None),
            codes: ai.codes.iter().map(|c| c.trim().to_ascii_uppercase()).collect(),
            source: DiagnosisSource::Ai,
            detail: None,
        });
    }
}

fn merge_repairs(repairs: &mut Vec<RepairSuggestion>, incoming: Vec<AiRepair>) {
    for repair in incoming {
        if repair.repair_name.trim().is_empty() {
            continue;
        }
        if repairs
            .iter()
            .any(|r| r.repair_name.eq_ignore_ascii_case(repair.repair_name.trim()))
        {
            continue;
        }
        repairs.push(repair.into_suggestion());
    }
}

fn generated_summary(
    severity: Severity,
    diagnoses: &[Diagnosis],
    code_count: usize,
    enriched: bool,
) -> String {
    let mut summary = format!(
        "{} trouble code(s) found with overall severity {}.",
        code_count, severity
    );
    if let Some(top) = diagnoses.first() {
        summary.push_str(&format!(" Most significant: {}.", top.name));
    }
    if severity.is_serious() {
        summary.push_str(" Have the vehicle inspected before driving further.");
    }
    if !enriched {
        summary.push_str(" This analysis is based on the reference catalog only.");
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    use async_trait::async_trait;
    use obd_core::{AiProviderError, CodeKind};
    use pretty_assertions::assert_eq;

    use crate::provider::AiWarning;

    enum Script {
        Respond(EnrichmentResponse),
        Fail(AiProviderError),
        Hang,
    }

    struct ScriptedProvider {
        name: &'static str,
        script: Script,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(name: &'static str, script: Script) -> Arc<Self> {
            Arc::new(Self {
                name,
                script,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(AtomicOrdering::SeqCst)
        }
    }

    #[async_trait]
    impl AiProvider for ScriptedProvider {
        fn name(&self) -> &str {
            self.name
        }

        async fn enrich(
            &self,
            _request: &EnrichmentRequest,
        ) -> Result<EnrichmentResponse, AiProviderError> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            match &self.script {
                Script::Respond(response) => Ok(response.clone()),
                Script::Fail(e) => Err(e.clone()),
                Script::Hang => std::future::pending().await,
            }
        }
    }

    fn catalog() -> Arc<ReferenceCatalog> {
        Arc::new(ReferenceCatalog::builtin().unwrap())
    }

    fn input(catalog: &ReferenceCatalog, codes: &[&str]) -> AnalysisInput {
        AnalysisInput {
            vehicle: VehicleContext::new("car-1"),
            codes: codes
                .iter()
                .map(|c| {
                    let resolved = catalog.resolve(c);
                    TroubleCode {
                        code: resolved.code,
                        description: resolved.description,
                        severity: resolved.severity,
                        kind: CodeKind::Stored,
                        freeze_frame: None,
                    }
                })
                .collect(),
            ..Default::default()
        }
    }

    fn pipeline(catalog: Arc<ReferenceCatalog>, providers: Vec<Arc<ScriptedProvider>>) -> AnalysisPipeline {
        let providers = providers
            .into_iter()
            .map(|p| p as Arc<dyn AiProvider>)
            .collect();
        AnalysisPipeline::new(catalog, providers, Duration::from_secs(10))
    }

    fn coil_response() -> EnrichmentResponse {
        EnrichmentResponse {
            severity: Some("high".into()),
            diagnoses: vec![
                AiDiagnosis {
                    name: "Ignition coil failure".into(),
                    description: "Cylinder 1 coil breaks down under load".into(),
                    confidence: Some(1.7),
                    severity: Some("critical".into()),
                    codes: vec!["p0301".into()],
                },
                AiDiagnosis {
                    name: "Vacuum leak".into(),
                    description: "Lean condition at idle".into(),
                    confidence: Some(0.4),
                    severity: Some("low".into()),
                    codes: Vec::new(),
                },
            ],
            diy_repairs: vec![AiRepair {
                issue_name: "Ignition coil failure".into(),
                repair_name: "Replace cylinder 1 ignition coil".into(),
                difficulty: Some(2.0),
                estimated_cost: Some("$50-$150".into()),
                ..Default::default()
            }],
            safety_warnings: vec![AiWarning {
                text: "Avoid hard acceleration until repaired".into(),
                issue_name: None,
            }],
            summary: Some("The engine is misfiring on cylinder 1.".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_empty_codes_no_issues() {
        let primary = ScriptedProvider::new("primary", Script::Respond(coil_response()));
        let catalog = catalog();
        let pipeline = pipeline(catalog.clone(), vec![primary.clone()]);

        let result = pipeline
            .analyze(input(&catalog, &[]), &CancellationToken::new())
            .await;
        assert_eq!(result.severity, Severity::None);
        assert!(result.diagnoses.is_empty());
        assert!(!result.summary.is_empty());
        assert_eq!(primary.calls(), 0);
    }

    #[tokio::test]
    async fn test_baseline_only_severity() {
        let catalog = catalog();
        let pipeline = AnalysisPipeline::baseline_only(catalog.clone());

        let result = pipeline
            .analyze(input(&catalog, &["P0301", "P0420"]), &CancellationToken::new())
            .await;
        assert_eq!(result.severity, Severity::High);
        assert!(result.covers_code("P0301"));
        assert!(result.covers_code("P0420"));
        assert_eq!(result.enriched_by, None);
        assert_eq!(result.diagnoses[0].severity, Severity::High);
        // Serious results carry the general warning first
        assert_eq!(
            result.safety_warnings[0].text,
            catalog.serious_warning().unwrap()
        );
        assert!(result.summary.contains("reference catalog"));
    }

    #[tokio::test]
    async fn test_fallback_repair_added() {
        let catalog = catalog();
        let pipeline = AnalysisPipeline::baseline_only(catalog.clone());

        // P0301 is DIY only, so the generic shop visit is suggested
        let result = pipeline
            .analyze(input(&catalog, &["P0301"]), &CancellationToken::new())
            .await;
        assert_eq!(result.professional_repairs.len(), 1);
        assert_eq!(
            result.professional_repairs[0].estimated_cost.as_deref(),
            Some("$80-$150")
        );
    }

    #[tokio::test]
    async fn test_enrichment_merges_over_baseline() {
        let primary = ScriptedProvider::new("primary", Script::Respond(coil_response()));
        let catalog = catalog();
        let pipeline = pipeline(catalog.clone(), vec![primary]);

        let result = pipeline
            .analyze(input(&catalog, &["P0301", "P0420"]), &CancellationToken::new())
            .await;

        assert_eq!(result.enriched_by.as_deref(), Some("primary"));
        assert_eq!(result.severity, Severity::Critical);
        assert!(result.covers_code("P0301"));
        assert!(result.covers_code("P0420"));

        let misfire = result.diagnoses.iter().find(|d| d.covers("P0301")).unwrap();
        assert_eq!(misfire.source, DiagnosisSource::Catalog);
        assert_eq!(misfire.confidence, 1.0);
        assert_eq!(misfire.severity, Severity::Critical);
        assert!(misfire.detail.as_deref().unwrap().starts_with("Ignition coil failure"));

        let leak = result.diagnoses.iter().find(|d| d.name == "Vacuum leak").unwrap();
        assert_eq!(leak.source, DiagnosisSource::Ai);
        assert_eq!(leak.severity, Severity::Low);

        // Sorted most severe first
        assert!(result
            .diagnoses
            .windows(2)
            .all(|w| w[0].severity >= w[1].severity));
        assert!(result
            .diy_repairs
            .iter()
            .any(|r| r.repair_name == "Replace cylinder 1 ignition coil"));
        assert!(result
            .safety_warnings
            .iter()
            .any(|w| w.text == "Avoid hard acceleration until repaired"));
        assert_eq!(result.summary, "The engine is misfiring on cylinder 1.");
    }

    #[tokio::test]
    async fn test_provider_cannot_lower_severity() {
        let response = EnrichmentResponse {
            severity: Some("low".into()),
            diagnoses: vec![AiDiagnosis {
                name: "Minor misfire".into(),
                severity: Some("low".into()),
                codes: vec!["P0301".into()],
                ..Default::default()
            }],
            ..Default::default()
        };
        let primary = ScriptedProvider::new("primary", Script::Respond(response));
        let catalog = catalog();
        let pipeline = pipeline(catalog.clone(), vec![primary]);

        let result = pipeline
            .analyze(input(&catalog, &["P0301"]), &CancellationToken::new())
            .await;
        assert_eq!(result.severity, Severity::High);
        assert_eq!(result.diagnoses[0].severity, Severity::High);
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_timeout_falls_back_to_secondary() {
        let primary = ScriptedProvider::new("primary", Script::Hang);
        let secondary = ScriptedProvider::new("secondary", Script::Respond(coil_response()));
        let catalog = catalog();
        let pipeline = pipeline(catalog.clone(), vec![primary.clone(), secondary.clone()]);

        let result = pipeline
            .analyze(input(&catalog, &["P0301"]), &CancellationToken::new())
            .await;
        assert_eq!(primary.calls(), 1);
        assert_eq!(secondary.calls(), 1);
        assert_eq!(result.enriched_by.as_deref(), Some("secondary"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_providers_fail_uses_baseline() {
        let primary = ScriptedProvider::new("primary", Script::Hang);
        let secondary = ScriptedProvider::new(
            "secondary",
            Script::Fail(AiProviderError::RateLimited {
                provider: "secondary".into(),
            }),
        );
        let catalog = catalog();
        let pipeline = pipeline(catalog.clone(), vec![primary, secondary.clone()]);

        let result = pipeline
            .analyze(input(&catalog, &["P0301", "P0420", "P1234"]), &CancellationToken::new())
            .await;
        assert_eq!(secondary.calls(), 1);
        assert_eq!(result.enriched_by, None);
        assert_eq!(result.severity, Severity::High);
        for code in ["P0301", "P0420", "P1234"] {
            assert!(result.covers_code(code), "{} not covered", code);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_abandons_ai_call() {
        let primary = ScriptedProvider::new("primary", Script::Hang);
        let secondary = ScriptedProvider::new("secondary", Script::Respond(coil_response()));
        let catalog = catalog();
        let pipeline = pipeline(catalog.clone(), vec![primary.clone(), secondary.clone()]);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = tokio::time::Instant::now();
        let result = pipeline.analyze(input(&catalog, &["P0301"]), &cancel).await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(primary.calls(), 1);
        assert_eq!(secondary.calls(), 0);
        assert_eq!(result.enriched_by, None);
        assert!(result.covers_code("P0301"));
    }

    #[tokio::test]
    async fn test_missing_ai_confidence_keeps_catalog_value() {
        let response = EnrichmentResponse {
            diagnoses: vec![AiDiagnosis {
                name: "Worn spark plug".into(),
                codes: vec!["P0301".into()],
                ..Default::default()
            }],
            ..Default::default()
        };
        let primary = ScriptedProvider::new("primary", Script::Respond(response));
        let catalog = catalog();
        let baseline = AnalysisPipeline::baseline_only(catalog.clone())
            .analyze(input(&catalog, &["P0301"]), &CancellationToken::new())
            .await;
        let result = pipeline(catalog.clone(), vec![primary])
            .analyze(input(&catalog, &["P0301"]), &CancellationToken::new())
            .await;

        let before = baseline.diagnoses.iter().find(|d| d.covers("P0301")).unwrap();
        let after = result.diagnoses.iter().find(|d| d.covers("P0301")).unwrap();
        assert!(after.detail.is_some());
        assert_eq!(after.confidence, before.confidence);
        assert!(after.confidence > AI_DEFAULT_CONFIDENCE);
    }

    #[test]
    fn test_confidence_clamped() {
        assert_eq!(clamp_confidence(Some(-0.5)), 0.0);
        assert_eq!(clamp_confidence(Some(3.0)), 1.0);
        assert_eq!(clamp_confidence(Some(f64::NAN)), AI_DEFAULT_CONFIDENCE);
        assert_eq!(clamp_confidence(None), AI_DEFAULT_CONFIDENCE);
    }
}
