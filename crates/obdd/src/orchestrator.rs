//! Session orchestrator
//!
//! Owns every active link session, keyed by vehicle. Operations on one
//! session are serialized through its link mutex; sessions for different
//! vehicles run independently. Each session carries a cancellation token
//! that `end_session` fires before closing the link, so hardware I/O and AI
//! calls in flight are abandoned rather than waited out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use obd_analysis::{AnalysisInput, AnalysisPipeline};
use obd_core::{
    AcquisitionError, ClearOutcome, CodeKind, ConnectionError, DiagError, DiagResult,
    DiagnosticSession, EndpointChoice, EndpointDescriptor, ProgressEvent, ReferenceCatalog,
    SensorReading, SessionHandle, TroubleCode, VehicleContext, VehicleInfo,
};
use obd_link::discovery::order_endpoints;
use obd_link::{
    create_transport, Acquisition, Discovery, LinkConfig, LinkSession, LinkState,
    SimulatedDiscovery, SystemDiscovery, Transport,
};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::storage::{create_store, MemorySessionStore, SessionStore};

const EVENT_CAPACITY: usize = 64;

struct ActiveSession {
    vehicle: VehicleContext,
    endpoint: EndpointDescriptor,
    link: tokio::sync::Mutex<LinkSession>,
    state: watch::Receiver<LinkState>,
    cancel: CancellationToken,
}

impl ActiveSession {
    /// Exclusive access to the link, unless the session is ended first
    async fn lock(&self) -> DiagResult<MutexGuard<'_, LinkSession>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(DiagError::Cancelled),
            guard = self.link.lock() => Ok(guard),
        }
    }
}

#[derive(Default)]
struct Registry {
    /// Vehicles with a session being opened or open
    by_vehicle: HashMap<String, SessionHandle>,
    sessions: HashMap<SessionHandle, Arc<ActiveSession>>,
}

impl Registry {
    fn release(&mut self, vehicle_id: &str, handle: SessionHandle) {
        if self.by_vehicle.get(vehicle_id) == Some(&handle) {
            self.by_vehicle.remove(vehicle_id);
        }
        self.sessions.remove(&handle);
    }
}

pub struct OrchestratorBuilder {
    link_config: LinkConfig,
    catalog: Arc<ReferenceCatalog>,
    transport: Option<Arc<dyn Transport>>,
    discovery: Option<Arc<dyn Discovery>>,
    pipeline: Option<AnalysisPipeline>,
    store: Option<Arc<dyn SessionStore>>,
    cancel_grace: Duration,
}

impl OrchestratorBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn discovery(mut self, discovery: Arc<dyn Discovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn pipeline(mut self, pipeline: AnalysisPipeline) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn build(self) -> SessionOrchestrator {
        let link_config = self.link_config;
        let transport = self
            .transport
            .unwrap_or_else(|| create_transport(&link_config));
        let discovery: Arc<dyn Discovery> = match self.discovery {
            Some(discovery) => discovery,
            None if link_config.simulation => Arc::new(SimulatedDiscovery),
            None => Arc::new(SystemDiscovery::new(link_config.discovery.clone())),
        };
        let pipeline = self
            .pipeline
            .unwrap_or_else(|| AnalysisPipeline::baseline_only(self.catalog.clone()));
        let store: Arc<dyn SessionStore> = match self.store {
            Some(store) => store,
            None => Arc::new(MemorySessionStore::new()),
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        SessionOrchestrator {
            acquisition: Acquisition::new(self.catalog, &link_config.sensors),
            link_config,
            transport,
            discovery,
            pipeline,
            store,
            registry: Arc::new(Mutex::new(Registry::default())),
            events,
            cancel_grace: self.cancel_grace,
        }
    }
}

/// Façade over discovery, link sessions, acquisition, analysis and storage
pub struct SessionOrchestrator {
    link_config: LinkConfig,
    transport: Arc<dyn Transport>,
    discovery: Arc<dyn Discovery>,
    acquisition: Acquisition,
    pipeline: AnalysisPipeline,
    store: Arc<dyn SessionStore>,
    registry: Arc<Mutex<Registry>>,
    events: broadcast::Sender<ProgressEvent>,
    cancel_grace: Duration,
}

impl SessionOrchestrator {
    pub fn builder(link_config: LinkConfig, catalog: Arc<ReferenceCatalog>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            link_config,
            catalog,
            transport: None,
            discovery: None,
            pipeline: None,
            store: None,
            cancel_grace: Duration::from_secs(2),
        }
    }

    /// Orchestrator wired from application configuration
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let catalog = config.catalog.build()?;
        let pipeline = AnalysisPipeline::from_config(catalog.clone(), &config.ai);
        info!(
            simulation = config.link.simulation,
            providers = ?pipeline.provider_names(),
            catalog_entries = catalog.len(),
            "Orchestrator configured"
        );
        Ok(Self::builder(config.link.clone(), catalog)
            .pipeline(pipeline)
            .store(create_store(&config.storage))
            .cancel_grace(config.cancel_grace())
            .build())
    }

    /// Progress events for all sessions
    ///
    /// Slow subscribers lag and lose events; they never hold up a session.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ProgressEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Candidate adapters, wired first
    pub async fn scan_ports(&self) -> Vec<EndpointDescriptor> {
        let endpoints = order_endpoints(self.discovery.discover().await);
        info!(count = endpoints.len(), "Port scan complete");
        endpoints
    }

    /// Connect to the vehicle's adapter and register the session
    ///
    /// Fails with [`DiagError::Conflict`] if the vehicle already has a session,
    /// leaving that session untouched. With [`EndpointChoice::Auto`] each
    /// discovered candidate is tried in order until one connects.
    pub async fn begin_session(
        &self,
        vehicle: VehicleContext,
        choice: EndpointChoice,
    ) -> DiagResult<SessionHandle> {
        let handle = SessionHandle::new();
        {
            let mut registry = self.registry.lock();
            if registry.by_vehicle.contains_key(&vehicle.vehicle_id) {
                warn!(vehicle_id = %vehicle.vehicle_id, "Session already active for vehicle");
                return Err(DiagError::Conflict {
                    vehicle_id: vehicle.vehicle_id.clone(),
                });
            }
            registry.by_vehicle.insert(vehicle.vehicle_id.clone(), handle);
        }

        let cancel = CancellationToken::new();
        let (link, endpoint) = match self.connect(&vehicle, choice, &cancel).await {
            Ok(connected) => connected,
            Err(e) => {
                self.registry.lock().release(&vehicle.vehicle_id, handle);
                self.emit(ProgressEvent::ConnectionFailed {
                    vehicle_id: vehicle.vehicle_id.clone(),
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        let protocol = link.protocol().to_string();
        let active = Arc::new(ActiveSession {
            vehicle: vehicle.clone(),
            endpoint: endpoint.clone(),
            state: link.watch_state(),
            link: tokio::sync::Mutex::new(link),
            cancel,
        });
        self.registry.lock().sessions.insert(handle, active);

        info!(
            session = %handle,
            vehicle_id = %vehicle.vehicle_id,
            endpoint = %endpoint.address,
            protocol = %protocol,
            "Session started"
        );
        self.emit(ProgressEvent::ConnectionEstablished {
            session: handle,
            endpoint,
            protocol,
        });
        Ok(handle)
    }

    async fn connect(
        &self,
        vehicle: &VehicleContext,
        choice: EndpointChoice,
        cancel: &CancellationToken,
    ) -> DiagResult<(LinkSession, EndpointDescriptor)> {
        let candidates = match choice {
            EndpointChoice::Explicit(endpoint) => vec![endpoint],
            EndpointChoice::Auto => self.scan_ports().await,
        };
        if candidates.is_empty() {
            return Err(ConnectionError::NoEndpoint.into());
        }

        let mut last_error = DiagError::from(ConnectionError::NoEndpoint);
        for endpoint in candidates {
            self.emit(ProgressEvent::Connecting {
                vehicle_id: vehicle.vehicle_id.clone(),
                endpoint: endpoint.address.clone(),
            });
            let mut link = LinkSession::with_cancel(
                self.link_config.clone(),
                self.transport.clone(),
                cancel.clone(),
            );
            match link.connect(endpoint.clone()).await {
                Ok(()) => return Ok((link, endpoint)),
                Err(e) => {
                    link.close().await;
                    warn!(
                        vehicle_id = %vehicle.vehicle_id,
                        endpoint = %endpoint.address,
                        error = %e,
                        "Connection attempt failed"
                    );
                    // Only link-level failures move on to the next candidate
                    if !matches!(e, DiagError::Connection(_) | DiagError::Protocol { .. }) {
                        return Err(e);
                    }
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    fn active(&self, handle: SessionHandle) -> DiagResult<Arc<ActiveSession>> {
        self.registry
            .lock()
            .sessions
            .get(&handle)
            .cloned()
            .ok_or_else(|| DiagError::SessionNotFound(handle.to_string()))
    }

    /// Read codes, a freeze frame, vehicle info and live sensors, then analyze
    ///
    /// A failed trouble-code read yields an unsuccessful session rather than an
    /// error. AI failures never fail the scan. Ending the session mid-scan
    /// returns [`DiagError::Cancelled`] and discards any analysis.
    pub async fn run_full_scan(&self, handle: SessionHandle) -> DiagResult<DiagnosticSession> {
        let active = self.active(handle)?;
        let mut session = DiagnosticSession::new(Uuid::new_v4(), active.vehicle.clone(), Utc::now());
        session.endpoint = Some(active.endpoint.clone());

        let mut link = active.lock().await?;
        session.protocol = link.protocol().to_string();
        session.simulated = link.is_simulated();

        let codes = match self.acquisition.read_trouble_codes(&mut link).await {
            Ok(codes) => codes,
            Err(AcquisitionError::Cancelled { .. }) => return Err(DiagError::Cancelled),
            Err(e) => {
                drop(link);
                warn!(session = %handle, error = %e, "Trouble code read failed");
                let session = session.complete(false, Some(e.to_string()));
                self.persist(handle, &session).await;
                return Ok(session);
            }
        };
        self.emit(ProgressEvent::CodesFound {
            session: handle,
            count: codes.len(),
        });

        let codes = self.attach_freeze_frame(&mut link, codes).await?;
        let vehicle_info = best_effort(
            "read_vehicle_info",
            self.acquisition.read_vehicle_info(&mut link).await,
        )?
        .unwrap_or_else(|| VehicleInfo {
            protocol: Some(link.protocol().to_string()),
            ..Default::default()
        });
        let sensors = best_effort(
            "read_live_sensors",
            self.acquisition.read_live_sensors(&mut link, &[]).await,
        )?
        .unwrap_or_default();
        drop(link);
        self.emit(ProgressEvent::SensorsRead {
            session: handle,
            count: sensors.len(),
        });

        self.emit(ProgressEvent::AnalysisStarted { session: handle });
        let input = AnalysisInput {
            vehicle: active.vehicle.clone(),
            vehicle_info: vehicle_info.clone(),
            codes: codes.clone(),
            sensors: sensors.clone(),
        };
        let analysis = self.pipeline.analyze(input, &active.cancel).await;
        if active.cancel.is_cancelled() {
            info!(session = %handle, "Scan cancelled, analysis discarded");
            return Err(DiagError::Cancelled);
        }
        self.emit(ProgressEvent::AnalysisComplete {
            session: handle,
            severity: analysis.severity,
            enriched_by: analysis.enriched_by.clone(),
        });

        session.vehicle_info = vehicle_info;
        session.trouble_codes = codes;
        session.sensor_readings = sensors;
        session.analysis = Some(analysis);
        let session = session.complete(true, None);
        info!(
            session = %handle,
            codes = session.trouble_codes.len(),
            severity = %session.severity(),
            "Full scan complete"
        );
        self.persist(handle, &session).await;
        Ok(session)
    }

    /// Attach the freeze frame to the stored code that triggered it
    async fn attach_freeze_frame(
        &self,
        link: &mut LinkSession,
        mut codes: Vec<TroubleCode>,
    ) -> DiagResult<Vec<TroubleCode>> {
        for code in codes.iter_mut().filter(|c| c.kind == CodeKind::Stored) {
            let frame = best_effort(
                "read_freeze_frame",
                self.acquisition.read_freeze_frame(link, &code.code).await,
            )?;
            if let Some(Some(frame)) = frame {
                code.freeze_frame = Some(frame);
                break;
            }
        }
        Ok(codes)
    }

    async fn persist(&self, handle: SessionHandle, session: &DiagnosticSession) {
        match self.store.save_session(session).await {
            Ok(record_id) => self.emit(ProgressEvent::SessionSaved {
                session: handle,
                record_id,
            }),
            // The caller still gets the session
            Err(e) => warn!(session = %handle, error = %e, "Failed to save session"),
        }
    }

    /// One poll of the default sensors plus `extras`
    pub async fn get_live_data(
        &self,
        handle: SessionHandle,
        extras: &[u8],
    ) -> DiagResult<Vec<SensorReading>> {
        let active = self.active(handle)?;
        let mut link = active.lock().await?;
        let readings = self
            .acquisition
            .read_live_sensors(&mut link, extras)
            .await
            .map_err(acquisition_error)?;
        drop(link);
        self.emit(ProgressEvent::SensorsRead {
            session: handle,
            count: readings.len(),
        });
        Ok(readings)
    }

    /// Clear trouble codes and verify with a re-read
    pub async fn clear_codes(&self, handle: SessionHandle) -> DiagResult<ClearOutcome> {
        let active = self.active(handle)?;
        let mut link = active.lock().await?;
        self.acquisition
            .clear_trouble_codes(&mut link)
            .await
            .map_err(acquisition_error)
    }

    /// Cancel in-flight work, close the link and forget the session
    ///
    /// Safe to call at any time; ending an unknown or already-ended session is
    /// a no-op.
    pub async fn end_session(&self, handle: SessionHandle) -> DiagResult<()> {
        let active = self.registry.lock().sessions.get(&handle).cloned();
        let Some(active) = active else {
            debug!(session = %handle, "End requested for inactive session");
            return Ok(());
        };

        active.cancel.cancel();
        // The handle ends now; the vehicle stays claimed until the adapter is closed
        self.registry.lock().sessions.remove(&handle);

        match tokio::time::timeout(self.cancel_grace, active.link.lock()).await {
            Ok(mut link) => {
                link.close().await;
                drop(link);
                finish_end(&self.registry, &self.events, &active, handle);
            }
            Err(_) => {
                warn!(
                    session = %handle,
                    grace_ms = self.cancel_grace.as_millis() as u64,
                    "In-flight operation did not stop in time, closing in background"
                );
                let registry = Arc::clone(&self.registry);
                let events = self.events.clone();
                let active = active.clone();
                tokio::spawn(async move {
                    active.link.lock().await.close().await;
                    finish_end(&registry, &events, &active, handle);
                });
            }
        }
        Ok(())
    }

    /// End every active session
    pub async fn shutdown(&self) {
        let handles: Vec<SessionHandle> = self.registry.lock().sessions.keys().copied().collect();
        for handle in handles {
            if let Err(e) = self.end_session(handle).await {
                warn!(session = %handle, error = %e, "Failed to end session");
            }
        }
    }

    /// Recent sessions for a vehicle, newest first
    pub async fn load_history(
        &self,
        vehicle_id: &str,
        limit: usize,
    ) -> DiagResult<Vec<DiagnosticSession>> {
        self.store
            .load_recent_sessions(vehicle_id, limit)
            .await
            .map_err(|e| DiagError::Storage(e.to_string()))
    }

    pub fn link_state(&self, handle: SessionHandle) -> Option<LinkState> {
        let active = self.registry.lock().sessions.get(&handle).cloned();
        active.map(|a| *a.state.borrow())
    }

    /// Follow a session's link state, including after it ends
    pub fn watch_link(&self, handle: SessionHandle) -> Option<watch::Receiver<LinkState>> {
        let active = self.registry.lock().sessions.get(&handle).cloned();
        active.map(|a| a.state.clone())
    }

    pub fn active_session_for(&self, vehicle_id: &str) -> Option<SessionHandle> {
        let registry = self.registry.lock();
        registry
            .by_vehicle
            .get(vehicle_id)
            .filter(|handle| registry.sessions.contains_key(handle))
            .copied()
    }

    pub fn catalog(&self) -> &Arc<ReferenceCatalog> {
        self.pipeline.catalog()
    }
}

/// Free the vehicle once its adapter is closed
fn finish_end(
    registry: &Mutex<Registry>,
    events: &broadcast::Sender<ProgressEvent>,
    active: &ActiveSession,
    handle: SessionHandle,
) {
    registry.lock().release(&active.vehicle.vehicle_id, handle);
    info!(session = %handle, vehicle_id = %active.vehicle.vehicle_id, "Session ended");
    let _ = events.send(ProgressEvent::SessionClosed { session: handle });
}

fn acquisition_error(error: AcquisitionError) -> DiagError {
    match error {
        AcquisitionError::Cancelled { .. } => DiagError::Cancelled,
        other => DiagError::Acquisition(other),
    }
}

/// Optional step of a scan: failures are logged, cancellation is not absorbed
fn best_effort<T>(operation: &str, result: Result<T, AcquisitionError>) -> DiagResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(AcquisitionError::Cancelled { .. }) => Err(DiagError::Cancelled),
        Err(e) => {
            warn!(operation, error = %e, "Optional scan step failed");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MockSessionStore, StorageError};
    use obd_link::config::SimulatorConfig;
    use obd_link::transport::SimulatedTransport;

    fn orchestrator(store: Arc<dyn SessionStore>) -> SessionOrchestrator {
        let catalog = Arc::new(ReferenceCatalog::builtin().unwrap());
        let config = LinkConfig::simulated();
        let transport = Arc::new(SimulatedTransport::new(&SimulatorConfig::default()));
        SessionOrchestrator::builder(config, catalog)
            .transport(transport)
            .store(store)
            .build()
    }

    #[tokio::test]
    async fn test_save_failure_keeps_result() {
        let mut store = MockSessionStore::new();
        store.expect_save_session().times(1).returning(|_| {
            Err(StorageError::Io {
                path: "/readonly".into(),
                message: "permission denied".into(),
            })
        });
        let orchestrator = orchestrator(Arc::new(store));
        let mut events = orchestrator.subscribe();

        let handle = orchestrator
            .begin_session(VehicleContext::new("car-1"), EndpointChoice::Auto)
            .await
            .unwrap();
        let session = orchestrator.run_full_scan(handle).await.unwrap();
        assert!(session.success);
        assert!(session.analysis.is_some());
        orchestrator.end_session(handle).await.unwrap();

        let mut saw_saved = false;
        while let Ok(event) = events.try_recv() {
            saw_saved |= matches!(event, ProgressEvent::SessionSaved { .. });
        }
        assert!(!saw_saved);
    }

    #[tokio::test]
    async fn test_history_error_is_storage_error() {
        let mut store = MockSessionStore::new();
        store
            .expect_load_recent_sessions()
            .returning(|_, _| Err(StorageError::Serialization("bad record".into())));
        let orchestrator = orchestrator(Arc::new(store));

        let err = orchestrator.load_history("car-1", 5).await.unwrap_err();
        assert_eq!(err.kind(), "storage");
    }

    #[tokio::test]
    async fn test_unknown_handle() {
        let orchestrator = orchestrator(Arc::new(MemorySessionStore::new()));
        let handle = SessionHandle::new();
        assert!(matches!(
            orchestrator.run_full_scan(handle).await,
            Err(DiagError::SessionNotFound(_))
        ));
        // Ending an unknown session is a no-op
        orchestrator.end_session(handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_vehicle_stays_claimed_until_background_close() {
        let catalog = Arc::new(ReferenceCatalog::builtin().unwrap());
        let transport = Arc::new(SimulatedTransport::new(&SimulatorConfig::default()));
        let orchestrator = SessionOrchestrator::builder(LinkConfig::simulated(), catalog)
            .transport(transport)
            .store(Arc::new(MemorySessionStore::new()))
            .cancel_grace(Duration::from_millis(50))
            .build();
        let mut events = orchestrator.subscribe();

        let handle = orchestrator
            .begin_session(VehicleContext::new("car-1"), EndpointChoice::Auto)
            .await
            .unwrap();
        let active = orchestrator.registry.lock().sessions.get(&handle).cloned().unwrap();
        // Stands in for an operation that ignores cancellation
        let held = active.link.lock().await;

        orchestrator.end_session(handle).await.unwrap();
        assert_eq!(orchestrator.active_session_for("car-1"), None);
        assert!(matches!(
            orchestrator
                .begin_session(VehicleContext::new("car-1"), EndpointChoice::Auto)
                .await,
            Err(DiagError::Conflict { .. })
        ));
        assert_ne!(*active.state.borrow(), LinkState::Closed);

        drop(held);
        loop {
            match events.recv().await.unwrap() {
                ProgressEvent::SessionClosed { session } if session == handle => break,
                _ => {}
            }
        }
        assert_eq!(*active.state.borrow(), LinkState::Closed);

        let next = orchestrator
            .begin_session(VehicleContext::new("car-1"), EndpointChoice::Auto)
            .await
            .unwrap();
        assert_ne!(next, handle);
        orchestrator.end_session(next).await.unwrap();
    }

    #[test]
    fn test_best_effort() {
        let ok: DiagResult<Option<u8>> = best_effort("op", Ok(1));
        assert_eq!(ok.unwrap(), Some(1));

        let failed: DiagResult<Option<u8>> =
            best_effort("op", Err(AcquisitionError::failed("op", "NO DATA")));
        assert_eq!(failed.unwrap(), None);

        let cancelled: DiagResult<Option<u8>> = best_effort(
            "op",
            Err(AcquisitionError::Cancelled {
                operation: "op".into(),
            }),
        );
        assert_eq!(cancelled.unwrap_err(), DiagError::Cancelled);
    }
}
