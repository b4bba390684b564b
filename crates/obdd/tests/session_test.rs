//! Session lifecycle tests against the simulated adapter
//!
//! Run with: cargo test -p obdd --test session_test

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use obd_analysis::AnalysisPipeline;
use obd_core::{
    ClearOutcome, DiagError, EndpointChoice, EndpointDescriptor, ProgressEvent, ReferenceCatalog,
    Severity, TransportKind, VehicleContext,
};
use obd_link::config::SimulatorConfig;
use obd_link::transport::{ClearBehavior, SimulatedTransport};
use obd_link::{Discovery, LinkConfig};
use obdd::{JsonSessionStore, MemorySessionStore, SessionOrchestrator};
use pretty_assertions::assert_eq;

fn catalog() -> Arc<ReferenceCatalog> {
    Arc::new(ReferenceCatalog::builtin().unwrap())
}

fn simulated(transport: Arc<SimulatedTransport>) -> SessionOrchestrator {
    let mut config = LinkConfig::simulated();
    config.retry.base_delay_ms = 10;
    config.timeouts.acquisition_ms = 300;
    SessionOrchestrator::builder(config, catalog())
        .transport(transport)
        .store(Arc::new(MemorySessionStore::new()))
        .build()
}

fn transport() -> Arc<SimulatedTransport> {
    Arc::new(SimulatedTransport::new(&SimulatorConfig::default()))
}

async fn scan(orchestrator: &SessionOrchestrator, vehicle_id: &str) -> obd_core::DiagnosticSession {
    let handle = orchestrator
        .begin_session(VehicleContext::new(vehicle_id), EndpointChoice::Auto)
        .await
        .unwrap();
    let session = orchestrator.run_full_scan(handle).await.unwrap();
    orchestrator.end_session(handle).await.unwrap();
    session
}

#[tokio::test]
async fn test_full_scan_in_simulation() {
    let orchestrator = simulated(transport());
    let session = scan(&orchestrator, "civic").await;

    assert!(session.success);
    assert!(session.simulated);
    assert_eq!(session.protocol, "simulated");
    assert!(session.is_complete());

    let codes: Vec<&str> = session.trouble_codes.iter().map(|c| c.code.as_str()).collect();
    assert_eq!(codes, vec!["P0301", "P0420"]);
    assert_eq!(
        session.vehicle_info.vin.as_deref(),
        Some("1HGCM82633A004352")
    );
    assert!(!session.sensor_readings.is_empty());

    // Misfire (high) plus catalyst (medium)
    let analysis = session.analysis.as_ref().unwrap();
    assert_eq!(analysis.severity, Severity::High);
    assert!(analysis.covers_code("P0301"));
    assert!(analysis.covers_code("P0420"));
    assert!(!analysis.safety_warnings.is_empty());
    assert!(analysis.enriched_by.is_none());
}

#[tokio::test]
async fn test_every_code_gets_a_diagnosis() {
    let transport = transport();
    transport.set_stored_codes(vec!["P0301".into(), "P1999".into(), "U0100".into()]);
    let orchestrator = simulated(transport);

    let session = scan(&orchestrator, "civic").await;
    let analysis = session.analysis.unwrap();
    for code in &session.trouble_codes {
        assert!(analysis.covers_code(&code.code), "{} not covered", code.code);
    }
    let unknown = session
        .trouble_codes
        .iter()
        .find(|c| c.code == "P1999")
        .unwrap();
    assert_eq!(unknown.severity, Severity::Medium);
}

#[tokio::test]
async fn test_no_codes() {
    let transport = transport();
    transport.set_stored_codes(Vec::new());
    let orchestrator = simulated(transport);

    let session = scan(&orchestrator, "civic").await;
    assert!(session.success);
    assert!(session.trouble_codes.is_empty());
    let analysis = session.analysis.unwrap();
    assert_eq!(analysis.severity, Severity::None);
    assert!(analysis.diagnoses.is_empty());
}

#[tokio::test]
async fn test_freeze_frame_attached_to_trigger_code() {
    let orchestrator = simulated(transport());
    let session = scan(&orchestrator, "civic").await;

    let with_frame: Vec<&str> = session
        .trouble_codes
        .iter()
        .filter(|c| c.freeze_frame.is_some())
        .map(|c| c.code.as_str())
        .collect();
    assert!(with_frame.len() <= 1);
}

#[tokio::test]
async fn test_failed_code_read_is_recorded() {
    let transport = transport();
    transport.stall_command("03");
    let orchestrator = simulated(transport);

    let session = scan(&orchestrator, "civic").await;
    assert!(!session.success);
    assert!(session.error.is_some());
    assert!(session.analysis.is_none());

    let history = orchestrator.load_history("civic", 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, session.id);
}

#[tokio::test]
async fn test_simulation_matches_full_handshake() {
    let simulated_session = scan(&simulated(transport()), "civic").await;

    // Same simulated adapter, driven through the real handshake
    let mut config = LinkConfig::default();
    config.retry.base_delay_ms = 10;
    let orchestrator = SessionOrchestrator::builder(config, catalog())
        .transport(transport())
        .build();
    let handle = orchestrator
        .begin_session(
            VehicleContext::new("civic"),
            EndpointChoice::Explicit(SimulatedTransport::endpoint()),
        )
        .await
        .unwrap();
    let handshake_session = orchestrator.run_full_scan(handle).await.unwrap();
    orchestrator.end_session(handle).await.unwrap();

    assert!(!handshake_session.simulated);
    assert_ne!(handshake_session.protocol, "simulated");

    let codes = |s: &obd_core::DiagnosticSession| -> Vec<String> {
        s.trouble_codes.iter().map(|c| c.code.clone()).collect()
    };
    let pids = |s: &obd_core::DiagnosticSession| -> Vec<u8> {
        s.sensor_readings.iter().map(|r| r.pid).collect()
    };
    assert_eq!(codes(&simulated_session), codes(&handshake_session));
    assert_eq!(pids(&simulated_session), pids(&handshake_session));
    assert_eq!(
        simulated_session.vehicle_info.vin,
        handshake_session.vehicle_info.vin
    );
    assert_eq!(
        simulated_session.severity(),
        handshake_session.severity()
    );
}

#[tokio::test]
async fn test_clear_then_read() {
    let orchestrator = simulated(transport());
    let handle = orchestrator
        .begin_session(VehicleContext::new("civic"), EndpointChoice::Auto)
        .await
        .unwrap();

    assert_eq!(
        orchestrator.clear_codes(handle).await.unwrap(),
        ClearOutcome::Cleared
    );
    let session = orchestrator.run_full_scan(handle).await.unwrap();
    assert!(session.trouble_codes.is_empty());
    orchestrator.end_session(handle).await.unwrap();
}

#[tokio::test]
async fn test_clear_not_taking_effect() {
    let transport = transport();
    transport.set_clear_behavior(ClearBehavior::Ignored);
    let orchestrator = simulated(transport);
    let handle = orchestrator
        .begin_session(VehicleContext::new("civic"), EndpointChoice::Auto)
        .await
        .unwrap();

    match orchestrator.clear_codes(handle).await.unwrap() {
        ClearOutcome::VerificationFailed { remaining } => {
            assert!(remaining.contains(&"P0301".to_string()));
        }
        other => panic!("expected verification failure, got {:?}", other),
    }
    orchestrator.end_session(handle).await.unwrap();
}

#[tokio::test]
async fn test_clear_rejected() {
    let transport = transport();
    transport.set_clear_behavior(ClearBehavior::Rejected);
    let orchestrator = simulated(transport);
    let handle = orchestrator
        .begin_session(VehicleContext::new("civic"), EndpointChoice::Auto)
        .await
        .unwrap();

    let err = orchestrator.clear_codes(handle).await.unwrap_err();
    assert_eq!(err.kind(), "acquisition");
    orchestrator.end_session(handle).await.unwrap();
}

#[tokio::test]
async fn test_second_session_for_vehicle_conflicts() {
    let orchestrator = simulated(transport());
    let first = orchestrator
        .begin_session(VehicleContext::new("civic"), EndpointChoice::Auto)
        .await
        .unwrap();

    let err = orchestrator
        .begin_session(VehicleContext::new("civic"), EndpointChoice::Auto)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        DiagError::Conflict {
            vehicle_id: "civic".into()
        }
    );

    // The existing session is untouched
    assert_eq!(orchestrator.active_session_for("civic"), Some(first));
    assert!(orchestrator.run_full_scan(first).await.unwrap().success);

    // Other vehicles are independent
    let other = orchestrator
        .begin_session(VehicleContext::new("accord"), EndpointChoice::Auto)
        .await
        .unwrap();
    orchestrator.end_session(other).await.unwrap();
    orchestrator.end_session(first).await.unwrap();

    assert_eq!(orchestrator.active_session_for("civic"), None);
    let again = orchestrator
        .begin_session(VehicleContext::new("civic"), EndpointChoice::Auto)
        .await
        .unwrap();
    orchestrator.end_session(again).await.unwrap();
}

#[tokio::test]
async fn test_failed_connect_releases_vehicle() {
    let transport = transport();
    transport.set_silent(true);
    let mut config = LinkConfig::default();
    config.retry.base_delay_ms = 10;
    config.timeouts.handshake_ms = 100;
    let orchestrator = SessionOrchestrator::builder(config, catalog())
        .transport(transport.clone())
        .build();
    let mut events = orchestrator.subscribe();

    let err = orchestrator
        .begin_session(
            VehicleContext::new("civic"),
            EndpointChoice::Explicit(SimulatedTransport::endpoint()),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "connection");
    assert_eq!(orchestrator.active_session_for("civic"), None);
    assert!(transport.close_count() >= 1);

    let mut failed = false;
    while let Ok(event) = events.try_recv() {
        failed |= matches!(event, ProgressEvent::ConnectionFailed { .. });
    }
    assert!(failed);
}

#[tokio::test]
async fn test_progress_events_in_order() {
    let orchestrator = simulated(transport());
    let mut events = orchestrator.subscribe();
    scan(&orchestrator, "civic").await;

    let mut names = Vec::new();
    while let Ok(event) = events.try_recv() {
        names.push(match event {
            ProgressEvent::Connecting { .. } => "connecting",
            ProgressEvent::ConnectionEstablished { .. } => "established",
            ProgressEvent::ConnectionFailed { .. } => "failed",
            ProgressEvent::CodesFound { .. } => "codes",
            ProgressEvent::SensorsRead { .. } => "sensors",
            ProgressEvent::AnalysisStarted { .. } => "analysis_started",
            ProgressEvent::AnalysisComplete { .. } => "analysis_complete",
            ProgressEvent::SessionSaved { .. } => "saved",
            ProgressEvent::SessionClosed { .. } => "closed",
        });
    }
    assert_eq!(
        names,
        vec![
            "connecting",
            "established",
            "codes",
            "sensors",
            "analysis_started",
            "analysis_complete",
            "saved",
            "closed",
        ]
    );
}

struct FixedDiscovery(Vec<EndpointDescriptor>);

#[async_trait]
impl Discovery for FixedDiscovery {
    async fn discover(&self) -> Vec<EndpointDescriptor> {
        self.0.clone()
    }
}

fn candidates() -> Vec<EndpointDescriptor> {
    let now = Utc::now();
    vec![
        EndpointDescriptor::new(TransportKind::Wireless, "/dev/rfcomm0", "OBDLink MX")
            .with_last_seen(now),
        EndpointDescriptor::new(TransportKind::Wired, "/dev/ttyUSB1", "Old cable")
            .with_last_seen(now - ChronoDuration::days(3)),
        EndpointDescriptor::new(TransportKind::Wired, "/dev/ttyUSB0", "New cable")
            .with_last_seen(now - ChronoDuration::minutes(5)),
    ]
}

#[tokio::test]
async fn test_ports_wired_first() {
    let mut config = LinkConfig::simulated();
    config.retry.base_delay_ms = 10;
    let orchestrator = SessionOrchestrator::builder(config, catalog())
        .transport(transport())
        .discovery(Arc::new(FixedDiscovery(candidates())))
        .build();

    let ports: Vec<String> = orchestrator
        .scan_ports()
        .await
        .into_iter()
        .map(|p| p.address)
        .collect();
    assert_eq!(ports, vec!["/dev/ttyUSB0", "/dev/ttyUSB1", "/dev/rfcomm0"]);
}

#[tokio::test]
async fn test_auto_falls_through_to_next_candidate() {
    let transport = transport();
    let mut config = LinkConfig::simulated();
    config.retry.attempts = 2;
    config.retry.base_delay_ms = 10;
    // Every attempt on the first candidate fails
    transport.fail_next_opens(2);
    let orchestrator = SessionOrchestrator::builder(config, catalog())
        .transport(transport.clone())
        .discovery(Arc::new(FixedDiscovery(candidates())))
        .build();
    let mut events = orchestrator.subscribe();

    let handle = orchestrator
        .begin_session(VehicleContext::new("civic"), EndpointChoice::Auto)
        .await
        .unwrap();
    assert_eq!(transport.open_count(), 3);

    let mut connected_to = None;
    while let Ok(event) = events.try_recv() {
        if let ProgressEvent::ConnectionEstablished { endpoint, .. } = event {
            connected_to = Some(endpoint.address);
        }
    }
    assert_eq!(connected_to.as_deref(), Some("/dev/ttyUSB1"));
    orchestrator.end_session(handle).await.unwrap();
}

#[tokio::test]
async fn test_history_in_json_store() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = SessionOrchestrator::builder(LinkConfig::simulated(), catalog())
        .transport(transport())
        .store(Arc::new(JsonSessionStore::new(dir.path())))
        .build();

    let first = scan(&orchestrator, "civic").await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = scan(&orchestrator, "civic").await;

    let history = orchestrator.load_history("civic", 10).await.unwrap();
    let ids: Vec<_> = history.iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![second.id, first.id]);
    assert_eq!(history[1], first);

    assert!(orchestrator.load_history("accord", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_live_data_with_extras() {
    let orchestrator = simulated(transport());
    let handle = orchestrator
        .begin_session(VehicleContext::new("civic"), EndpointChoice::Auto)
        .await
        .unwrap();

    let defaults = orchestrator.get_live_data(handle, &[]).await.unwrap();
    let extended = orchestrator.get_live_data(handle, &[0x0D]).await.unwrap();
    assert!(extended.iter().any(|r| r.pid == 0x0D));
    assert!(extended.len() >= defaults.len());
    orchestrator.end_session(handle).await.unwrap();

    assert!(matches!(
        orchestrator.get_live_data(handle, &[]).await,
        Err(DiagError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn test_baseline_pipeline_is_default() {
    let orchestrator = simulated(transport());
    assert_eq!(orchestrator.catalog().len(), catalog().len());
    let pipeline = AnalysisPipeline::baseline_only(catalog());
    assert!(pipeline.provider_names().is_empty());
}
