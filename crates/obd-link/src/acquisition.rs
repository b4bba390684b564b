//! Trouble code and sensor acquisition over a connected link
//!
//! Every operation moves the link to `Acquiring` for its duration, runs under
//! the acquisition timeout and the session's cancellation token, and returns
//! the link to `Connected` whatever the outcome.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use obd_core::{
    AcquisitionError, ClearOutcome, CodeKind, ReferenceCatalog, SensorReading, TroubleCode,
    VehicleInfo,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SensorConfig;
use crate::elm::{self, dtc, info_type, mode, pid, ElmReply};
use crate::session::LinkSession;
use crate::transport::TransportError;

const READ_CODES: &str = "read_trouble_codes";
const READ_FREEZE_FRAME: &str = "read_freeze_frame";
const READ_SENSORS: &str = "read_live_sensors";
const CLEAR_CODES: &str = "clear_trouble_codes";
const VERIFY_CLEAR: &str = "verify_clear";
const READ_INFO: &str = "read_vehicle_info";

/// Code queries in resolution order; a code reported twice keeps the first kind
const CODE_QUERIES: [(u8, CodeKind); 3] = [
    (mode::STORED_CODES, CodeKind::Stored),
    (mode::PENDING_CODES, CodeKind::Pending),
    (mode::PERMANENT_CODES, CodeKind::Permanent),
];

/// Reads and normalizes vehicle data from a [`LinkSession`]
pub struct Acquisition {
    catalog: Arc<ReferenceCatalog>,
    default_pids: Vec<u8>,
}

impl Acquisition {
    pub fn new(catalog: Arc<ReferenceCatalog>, sensors: &SensorConfig) -> Self {
        Self {
            catalog,
            default_pids: sensors.default_pids.clone(),
        }
    }

    pub fn default_pids(&self) -> &[u8] {
        &self.default_pids
    }

    /// Stored, pending and permanent codes resolved against the catalog
    ///
    /// Unknown codes are kept with the catalog's unknown-code severity.
    pub async fn read_trouble_codes(
        &self,
        link: &mut LinkSession,
    ) -> Result<Vec<TroubleCode>, AcquisitionError> {
        link.begin_operation(READ_CODES)?;
        let (timeout, cancel) = (link.acquisition_timeout(), link.cancel_token());
        let result = bounded(READ_CODES, timeout, &cancel, self.trouble_codes(link)).await;
        link.end_operation();

        if let Ok(codes) = &result {
            info!(
                session_id = %link.id(),
                count = codes.len(),
                "Trouble codes read"
            );
        }
        result
    }

    async fn trouble_codes(
        &self,
        link: &mut LinkSession,
    ) -> Result<Vec<TroubleCode>, AcquisitionError> {
        let mut seen = HashSet::new();
        let mut codes = Vec::new();

        for (service, kind) in CODE_QUERIES {
            let found = if kind == CodeKind::Stored {
                query_codes(link, READ_CODES, service).await?
            } else {
                optional_codes(link, READ_CODES, service).await?
            };

            for code in found {
                if !seen.insert(code.clone()) {
                    continue;
                }
                let resolved = self.catalog.resolve(&code);
                if !resolved.known {
                    debug!(code = %code, severity = %resolved.severity, "Code not in reference catalog");
                }
                codes.push(TroubleCode {
                    code: resolved.code,
                    description: resolved.description,
                    severity: resolved.severity,
                    kind,
                    freeze_frame: None,
                });
            }
        }
        Ok(codes)
    }

    /// Sensor snapshot of freeze frame 0 if it was recorded for `code`
    ///
    /// Absence (no frame, or a frame belonging to another code) is `Ok(None)`.
    pub async fn read_freeze_frame(
        &self,
        link: &mut LinkSession,
        code: &str,
    ) -> Result<Option<Vec<SensorReading>>, AcquisitionError> {
        link.begin_operation(READ_FREEZE_FRAME)?;
        let (timeout, cancel) = (link.acquisition_timeout(), link.cancel_token());
        let result = bounded(
            READ_FREEZE_FRAME,
            timeout,
            &cancel,
            self.freeze_frame(link, code),
        )
        .await;
        link.end_operation();
        result
    }

    async fn freeze_frame(
        &self,
        link: &mut LinkSession,
        code: &str,
    ) -> Result<Option<Vec<SensorReading>>, AcquisitionError> {
        let trigger_request = elm::request(mode::FREEZE_FRAME, &[0x02, 0x00]);
        let reply = send(link, READ_FREEZE_FRAME, &trigger_request).await?;
        match dtc::parse_freeze_frame_code(&reply) {
            Some(trigger) if trigger.eq_ignore_ascii_case(code) => {}
            _ => return Ok(None),
        }

        let mut readings = Vec::new();
        for &requested in &self.default_pids {
            let Some(spec) = pid::spec(requested) else {
                continue;
            };
            if !link.is_supported(requested) {
                continue;
            }
            let command = elm::request(mode::FREEZE_FRAME, &[requested, 0x00]);
            let reply = send(link, READ_FREEZE_FRAME, &command).await?;
            if let Some(value) = reply
                .payload(&[mode::response(mode::FREEZE_FRAME), requested, 0x00])
                .and_then(|data| spec.decode(data))
            {
                readings.push(SensorReading::new(requested, spec.name, value, spec.unit));
            }
        }

        Ok(if readings.is_empty() {
            None
        } else {
            Some(readings)
        })
    }

    /// Default parameters plus `extras`; unsupported parameters are left out
    pub async fn read_live_sensors(
        &self,
        link: &mut LinkSession,
        extras: &[u8],
    ) -> Result<Vec<SensorReading>, AcquisitionError> {
        link.begin_operation(READ_SENSORS)?;
        let (timeout, cancel) = (link.acquisition_timeout(), link.cancel_token());
        let result = bounded(READ_SENSORS, timeout, &cancel, self.live_sensors(link, extras)).await;
        link.end_operation();

        if let Ok(readings) = &result {
            debug!(session_id = %link.id(), count = readings.len(), "Live sensors read");
        }
        result
    }

    async fn live_sensors(
        &self,
        link: &mut LinkSession,
        extras: &[u8],
    ) -> Result<Vec<SensorReading>, AcquisitionError> {
        let mut requested_set = Vec::with_capacity(self.default_pids.len() + extras.len());
        for &requested in self.default_pids.iter().chain(extras) {
            if !requested_set.contains(&requested) {
                requested_set.push(requested);
            }
        }

        let mut readings = Vec::new();
        for requested in requested_set {
            let Some(spec) = pid::spec(requested) else {
                debug!(pid = requested, "No decoder for parameter");
                continue;
            };
            if !link.is_supported(requested) {
                continue;
            }
            let command = elm::request(mode::CURRENT_DATA, &[requested]);
            let reply = send(link, READ_SENSORS, &command).await?;
            let Some(value) = reply
                .payload(&[mode::response(mode::CURRENT_DATA), requested])
                .and_then(|data| spec.decode(data))
            else {
                debug!(pid = requested, "Parameter reported no data");
                continue;
            };
            let history = link.record_sample(requested, value);
            readings.push(SensorReading::new(requested, spec.name, value, spec.unit).with_history(history));
        }
        Ok(readings)
    }

    /// Clear codes, then re-read stored and pending codes to verify
    ///
    /// A refused clear is an error. Once the vehicle has acknowledged the
    /// clear, a failed re-read is [`ClearOutcome::Unverified`]. The re-read
    /// gets its own timeout budget.
    pub async fn clear_trouble_codes(
        &self,
        link: &mut LinkSession,
    ) -> Result<ClearOutcome, AcquisitionError> {
        link.begin_operation(CLEAR_CODES)?;
        let (timeout, cancel) = (link.acquisition_timeout(), link.cancel_token());
        let result = match bounded(CLEAR_CODES, timeout, &cancel, send_clear(link)).await {
            Ok(()) => match bounded(VERIFY_CLEAR, timeout, &cancel, verify_clear(link)).await {
                Err(AcquisitionError::Cancelled { .. }) => Err(AcquisitionError::Cancelled {
                    operation: CLEAR_CODES.to_string(),
                }),
                Err(e) => Ok(ClearOutcome::Unverified {
                    reason: e.to_string(),
                }),
                Ok(outcome) => Ok(outcome),
            },
            Err(e) => Err(e),
        };
        link.end_operation();

        match &result {
            Ok(ClearOutcome::Cleared) => info!(session_id = %link.id(), "Trouble codes cleared"),
            Ok(ClearOutcome::VerificationFailed { remaining }) => warn!(
                session_id = %link.id(),
                remaining = ?remaining,
                "Codes still active after clear"
            ),
            Ok(ClearOutcome::Unverified { reason }) => warn!(
                session_id = %link.id(),
                error = %reason,
                "Clear acknowledged but verification failed"
            ),
            Err(_) => {}
        }
        result
    }

    /// VIN, ECU name and protocol; fields the vehicle does not report are `None`
    pub async fn read_vehicle_info(
        &self,
        link: &mut LinkSession,
    ) -> Result<VehicleInfo, AcquisitionError> {
        link.begin_operation(READ_INFO)?;
        let (timeout, cancel) = (link.acquisition_timeout(), link.cancel_token());
        let result = bounded(READ_INFO, timeout, &cancel, vehicle_info(link)).await;
        link.end_operation();
        result
    }
}

async fn send_clear(link: &mut LinkSession) -> Result<(), AcquisitionError> {
    let reply = send(link, CLEAR_CODES, &elm::request(mode::CLEAR_CODES, &[])).await?;
    if let ElmReply::Fault(fault) = &reply {
        return Err(AcquisitionError::failed(
            CLEAR_CODES,
            format!("clear refused: {}", fault),
        ));
    }
    if reply.payload(&[mode::response(mode::CLEAR_CODES)]).is_none() {
        return Err(AcquisitionError::failed(CLEAR_CODES, "clear not acknowledged"));
    }
    Ok(())
}

async fn verify_clear(link: &mut LinkSession) -> Result<ClearOutcome, AcquisitionError> {
    let mut remaining = query_codes(link, VERIFY_CLEAR, mode::STORED_CODES).await?;
    for code in optional_codes(link, VERIFY_CLEAR, mode::PENDING_CODES).await? {
        if !remaining.contains(&code) {
            remaining.push(code);
        }
    }

    Ok(if remaining.is_empty() {
        ClearOutcome::Cleared
    } else {
        ClearOutcome::VerificationFailed { remaining }
    })
}

async fn vehicle_info(link: &mut LinkSession) -> Result<VehicleInfo, AcquisitionError> {
    let vin = read_info_text(link, info_type::VIN).await?;
    let ecu_name = read_info_text(link, info_type::ECU_NAME).await?;
    Ok(VehicleInfo {
        vin,
        ecu_name,
        protocol: Some(link.protocol().to_string()),
    })
}

/// Mode 09 text item; CAN sends one message, older buses one line per 4-byte frame
async fn read_info_text(
    link: &mut LinkSession,
    item: u8,
) -> Result<Option<String>, AcquisitionError> {
    let command = elm::request(mode::VEHICLE_INFO, &[item]);
    let reply = send(link, READ_INFO, &command).await?;
    let prefix = [mode::response(mode::VEHICLE_INFO), item];

    let mut bytes: Vec<u8> = Vec::new();
    for payload in reply.payloads(&prefix) {
        // Leading byte is the item count (CAN) or frame sequence number
        bytes.extend(payload.iter().skip(1));
    }
    let text: String = bytes
        .into_iter()
        .filter(|b| b.is_ascii_graphic() || *b == b' ')
        .map(char::from)
        .collect();
    let text = text.trim();
    Ok((!text.is_empty()).then(|| text.to_string()))
}

/// Codes reported by one query; `NO DATA` is an empty list
async fn query_codes(
    link: &mut LinkSession,
    operation: &str,
    service: u8,
) -> Result<Vec<String>, AcquisitionError> {
    let reply = send(link, operation, &elm::request(service, &[])).await?;
    if let ElmReply::Fault(fault) = &reply {
        return Err(AcquisitionError::failed(operation, fault.to_string()));
    }
    Ok(dtc::parse_codes(&reply, mode::response(service)))
}

/// Codes from a query older vehicles may refuse; a refusal reads as none
///
/// Transport failures and timeouts still propagate.
async fn optional_codes(
    link: &mut LinkSession,
    operation: &str,
    service: u8,
) -> Result<Vec<String>, AcquisitionError> {
    let reply = send(link, operation, &elm::request(service, &[])).await?;
    if let ElmReply::Fault(fault) = &reply {
        debug!(session_id = %link.id(), service, error = %fault, "Code query unsupported");
        return Ok(Vec::new());
    }
    Ok(dtc::parse_codes(&reply, mode::response(service)))
}

async fn send(
    link: &mut LinkSession,
    operation: &str,
    command: &str,
) -> Result<ElmReply, AcquisitionError> {
    let timeout = link.acquisition_timeout();
    link.request(command)
        .await
        .map_err(|e| transport_failure(operation, timeout, e))
}

fn transport_failure(operation: &str, timeout: Duration, error: TransportError) -> AcquisitionError {
    match error {
        TransportError::Timeout(_) => AcquisitionError::Timeout {
            operation: operation.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        },
        other => AcquisitionError::failed(operation, other.to_string()),
    }
}

/// Run `work` under the per-call timeout, abandoning it if the session is cancelled
async fn bounded<T>(
    operation: &str,
    timeout: Duration,
    cancel: &CancellationToken,
    work: impl Future<Output = Result<T, AcquisitionError>>,
) -> Result<T, AcquisitionError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AcquisitionError::Cancelled {
            operation: operation.to_string(),
        }),
        result = tokio::time::timeout(timeout, work) => result.unwrap_or_else(|_| {
            Err(AcquisitionError::Timeout {
                operation: operation.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LinkConfig, SimulatorConfig};
    use crate::session::LinkState;
    use crate::transport::{ClearBehavior, SimulatedTransport};
    use obd_core::{Severity, Trend};
    use pretty_assertions::assert_eq;

    fn catalog() -> Arc<ReferenceCatalog> {
        Arc::new(ReferenceCatalog::builtin().unwrap())
    }

    async fn connected(fixture: SimulatorConfig) -> (LinkSession, Arc<SimulatedTransport>, Acquisition) {
        let config = LinkConfig::default();
        let transport = Arc::new(SimulatedTransport::new(&fixture));
        let acquisition = Acquisition::new(catalog(), &config.sensors);
        let mut link = LinkSession::new(config, transport.clone());
        link.connect(SimulatedTransport::endpoint()).await.unwrap();
        (link, transport, acquisition)
    }

    #[tokio::test]
    async fn test_codes_resolved_against_catalog() {
        let fixture = SimulatorConfig {
            stored_codes: vec!["P0301".into(), "P0420".into()],
            pending_codes: vec!["P0420".into(), "P1234".into()],
            permanent_codes: vec!["P0420".into()],
            ..Default::default()
        };
        let (mut link, _, acquisition) = connected(fixture).await;

        let codes = acquisition.read_trouble_codes(&mut link).await.unwrap();
        let summary: Vec<(&str, Severity, CodeKind)> = codes
            .iter()
            .map(|c| (c.code.as_str(), c.severity, c.kind))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("P0301", Severity::High, CodeKind::Stored),
                ("P0420", Severity::Medium, CodeKind::Stored),
                ("P1234", Severity::Medium, CodeKind::Pending),
            ]
        );
        assert!(!codes[2].description.is_empty());
        assert_eq!(link.state(), LinkState::Connected);
    }

    #[tokio::test]
    async fn test_no_codes() {
        let fixture = SimulatorConfig {
            stored_codes: Vec::new(),
            ..Default::default()
        };
        let (mut link, _, acquisition) = connected(fixture).await;
        assert!(acquisition.read_trouble_codes(&mut link).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_live_sensors_skip_unsupported() {
        let (mut link, _, acquisition) = connected(SimulatorConfig::default()).await;

        let readings = acquisition
            .read_live_sensors(&mut link, &[pid::VEHICLE_SPEED])
            .await
            .unwrap();
        let pids: Vec<u8> = readings.iter().map(|r| r.pid).collect();
        assert!(pids.contains(&pid::ENGINE_RPM));
        assert!(pids.contains(&pid::VEHICLE_SPEED));
        // The fixture vehicle does not report fuel pressure
        assert!(!pids.contains(&pid::FUEL_PRESSURE));
        assert!(readings.iter().all(|r| r.trend == Trend::Unknown));

        let voltage = readings.iter().find(|r| r.pid == pid::MODULE_VOLTAGE).unwrap();
        assert!((voltage.value - 14.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_trend_builds_over_polls() {
        let (mut link, _, acquisition) = connected(SimulatorConfig::default()).await;
        let mut coolant = None;
        for _ in 0..2 {
            let readings = acquisition.read_live_sensors(&mut link, &[]).await.unwrap();
            coolant = readings.into_iter().find(|r| r.pid == pid::COOLANT_TEMP);
        }
        let coolant = coolant.unwrap();
        assert_eq!(coolant.history.len(), 2);
        assert_eq!(coolant.trend, Trend::Rising);
    }

    #[tokio::test]
    async fn test_clear_and_verify() {
        let (mut link, _, acquisition) = connected(SimulatorConfig::default()).await;
        let outcome = acquisition.clear_trouble_codes(&mut link).await.unwrap();
        assert_eq!(outcome, ClearOutcome::Cleared);
        assert!(acquisition.read_trouble_codes(&mut link).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_verification_mismatch() {
        let (mut link, transport, acquisition) = connected(SimulatorConfig::default()).await;
        transport.set_clear_behavior(ClearBehavior::Ignored);

        let outcome = acquisition.clear_trouble_codes(&mut link).await.unwrap();
        assert_eq!(
            outcome,
            ClearOutcome::VerificationFailed {
                remaining: vec!["P0301".to_string(), "P0420".to_string()]
            }
        );
    }

    #[tokio::test]
    async fn test_clear_refused_is_command_failure() {
        let (mut link, transport, acquisition) = connected(SimulatorConfig::default()).await;
        transport.set_clear_behavior(ClearBehavior::Rejected);

        let err = acquisition.clear_trouble_codes(&mut link).await.unwrap_err();
        assert!(matches!(err, AcquisitionError::Failed { .. }));
        assert_eq!(link.state(), LinkState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_acknowledged_but_reread_stalls() {
        let (mut link, transport, acquisition) = connected(SimulatorConfig::default()).await;
        transport.stall_command("03");

        let outcome = acquisition.clear_trouble_codes(&mut link).await.unwrap();
        let ClearOutcome::Unverified { reason } = outcome else {
            panic!("expected unverified outcome, got {:?}", outcome);
        };
        assert!(reason.contains("timed out"));
        assert_eq!(link.state(), LinkState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_pending_reread_failure_is_not_cleared() {
        let (mut link, transport, acquisition) = connected(SimulatorConfig::default()).await;
        transport.stall_command("07");

        let outcome = acquisition.clear_trouble_codes(&mut link).await.unwrap();
        assert!(matches!(outcome, ClearOutcome::Unverified { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_keeps_link_connected() {
        let (mut link, transport, acquisition) = connected(SimulatorConfig::default()).await;
        transport.stall_command("03");

        let err = acquisition.read_trouble_codes(&mut link).await.unwrap_err();
        assert!(matches!(err, AcquisitionError::Timeout { .. }));
        assert!(err.is_retryable());
        assert_eq!(link.state(), LinkState::Connected);

        // The link stays usable for other operations
        assert!(!acquisition.read_live_sensors(&mut link, &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_operation() {
        let (mut link, _, acquisition) = connected(SimulatorConfig::default()).await;
        link.cancel_token().cancel();
        let err = acquisition.read_trouble_codes(&mut link).await.unwrap_err();
        assert!(matches!(err, AcquisitionError::Cancelled { .. }));
        assert_eq!(link.state(), LinkState::Connected);
    }

    #[tokio::test]
    async fn test_requires_connected_link() {
        let config = LinkConfig::default();
        let transport = Arc::new(SimulatedTransport::new(&SimulatorConfig::default()));
        let acquisition = Acquisition::new(catalog(), &config.sensors);
        let mut link = LinkSession::new(config, transport);

        let err = acquisition.read_trouble_codes(&mut link).await.unwrap_err();
        assert_eq!(
            err,
            AcquisitionError::NotConnected {
                state: "idle".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_freeze_frame_for_trigger_code() {
        let (mut link, _, acquisition) = connected(SimulatorConfig::default()).await;

        let frame = acquisition
            .read_freeze_frame(&mut link, "P0301")
            .await
            .unwrap()
            .unwrap();
        let coolant = frame.iter().find(|r| r.pid == pid::COOLANT_TEMP).unwrap();
        assert_eq!(coolant.value, 95.0);

        assert_eq!(
            acquisition.read_freeze_frame(&mut link, "P0420").await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_vehicle_info() {
        let (mut link, _, acquisition) = connected(SimulatorConfig::default()).await;
        let info = acquisition.read_vehicle_info(&mut link).await.unwrap();
        assert_eq!(info.vin.as_deref(), Some("1HGCM82633A004352"));
        assert_eq!(info.ecu_name.as_deref(), Some("ECM-EngineControl"));
        assert_eq!(info.protocol.as_deref(), Some("ISO 15765-4 (CAN 11/500)"));
    }
}
