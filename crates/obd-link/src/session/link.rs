//! Link session for one ELM327 adapter

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use obd_core::{AcquisitionError, ConnectionError, DiagError, DiagResult, EndpointDescriptor};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::LinkState;
use crate::config::LinkConfig;
use crate::elm::{self, mode, pid, response, ElmReply};
use crate::transport::{Transport, TransportError, TransportHandle};

/// Protocol label recorded in simulation mode
pub const SIMULATED_PROTOCOL: &str = "simulated";

/// One adapter connection and its state machine
///
/// Owned by a single caller at a time; the orchestrator keeps it behind a
/// per-session lock. The state can be observed without that lock through
/// [`LinkSession::watch_state`].
pub struct LinkSession {
    id: Uuid,
    config: LinkConfig,
    transport: Arc<dyn Transport>,
    state: watch::Sender<LinkState>,
    endpoint: Option<EndpointDescriptor>,
    protocol: String,
    handle: Option<Box<dyn TransportHandle>>,
    connect_started_at: Option<DateTime<Utc>>,
    connect_completed_at: Option<DateTime<Utc>>,
    supported_pids: BTreeSet<u8>,
    history: HashMap<u8, VecDeque<f64>>,
    cancel: CancellationToken,
}

impl LinkSession {
    pub fn new(config: LinkConfig, transport: Arc<dyn Transport>) -> Self {
        Self::with_cancel(config, transport, CancellationToken::new())
    }

    /// Create a session whose I/O is interrupted when `cancel` fires
    pub fn with_cancel(
        config: LinkConfig,
        transport: Arc<dyn Transport>,
        cancel: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(LinkState::Idle);
        Self {
            id: Uuid::new_v4(),
            config,
            transport,
            state,
            endpoint: None,
            protocol: "auto".to_string(),
            handle: None,
            connect_started_at: None,
            connect_completed_at: None,
            supported_pids: BTreeSet::new(),
            history: HashMap::new(),
            cancel,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Receiver that follows every state change
    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    pub fn endpoint(&self) -> Option<&EndpointDescriptor> {
        self.endpoint.as_ref()
    }

    /// Detected protocol name, "auto" before detection, "simulated" in simulation mode
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn is_simulated(&self) -> bool {
        self.config.simulation
    }

    pub fn connect_started_at(&self) -> Option<DateTime<Utc>> {
        self.connect_started_at
    }

    pub fn connect_completed_at(&self) -> Option<DateTime<Utc>> {
        self.connect_completed_at
    }

    pub fn supported_pids(&self) -> &BTreeSet<u8> {
        &self.supported_pids
    }

    pub fn is_supported(&self, requested: u8) -> bool {
        self.supported_pids.contains(&requested)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn acquisition_timeout(&self) -> Duration {
        self.config.timeouts.acquisition()
    }

    fn transition(&self, next: LinkState) -> DiagResult<()> {
        let current = self.state();
        if !current.can_transition_to(next) {
            return Err(DiagError::InvalidState(format!(
                "cannot move link from {} to {}",
                current, next
            )));
        }
        debug!(session_id = %self.id, from = %current, to = %next, "Link state transition");
        self.state.send_replace(next);
        Ok(())
    }

    /// Move to `Faulted` and hand the error back
    fn fault(&self, error: DiagError) -> DiagError {
        let current = self.state();
        if current.can_transition_to(LinkState::Faulted) {
            debug!(session_id = %self.id, from = %current, error = %error, "Link faulted");
            self.state.send_replace(LinkState::Faulted);
        }
        error
    }

    fn endpoint_address(&self) -> String {
        self.endpoint
            .as_ref()
            .map(|e| e.address.clone())
            .unwrap_or_default()
    }

    /// Open the endpoint, initialize the adapter and resolve the vehicle protocol
    ///
    /// On failure the link is left `Faulted`; call [`close`](Self::close) to
    /// release whatever was opened.
    pub async fn connect(&mut self, endpoint: EndpointDescriptor) -> DiagResult<()> {
        if self.state() != LinkState::Idle {
            return Err(DiagError::InvalidState(format!(
                "connect requires an idle link, link is {}",
                self.state()
            )));
        }
        self.endpoint = Some(endpoint);
        self.connect_started_at = Some(Utc::now());

        let cancel = self.cancel.clone();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DiagError::Cancelled),
            result = self.establish() => result,
        };

        match result {
            Ok(()) => {
                self.connect_completed_at = Some(Utc::now());
                info!(
                    session_id = %self.id,
                    endpoint = %self.endpoint_address(),
                    protocol = %self.protocol,
                    supported_pids = self.supported_pids.len(),
                    "Link connected"
                );
                Ok(())
            }
            Err(e) => Err(self.fault(e)),
        }
    }

    async fn establish(&mut self) -> DiagResult<()> {
        if self.config.simulation {
            let handle = self.open_with_retry().await?;
            self.handle = Some(handle);
            self.read_supported_pids().await;
            self.protocol = SIMULATED_PROTOCOL.to_string();
            return self.transition(LinkState::Connected);
        }

        self.transition(LinkState::Scanning)?;
        let handle = self.open_with_retry().await?;
        self.handle = Some(handle);

        self.transition(LinkState::Connecting)?;
        self.initialize_adapter().await?;

        self.transition(LinkState::Handshaking)?;
        self.detect_protocol().await?;
        self.read_supported_pids().await;
        self.protocol = self.describe_protocol().await;

        self.transition(LinkState::Connected)
    }

    async fn open_with_retry(&mut self) -> DiagResult<Box<dyn TransportHandle>> {
        let endpoint = self
            .endpoint
            .clone()
            .ok_or(DiagError::Connection(ConnectionError::NoEndpoint))?;
        let attempts = self.config.retry.attempts.max(1);
        let timeout = self.config.timeouts.connect();
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let result = tokio::time::timeout(timeout, self.transport.open(&endpoint)).await;
            match result {
                Ok(Ok(handle)) => {
                    debug!(
                        session_id = %self.id,
                        endpoint = %endpoint.address,
                        attempt,
                        "Endpoint opened"
                    );
                    return Ok(handle);
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("open timed out after {} ms", timeout.as_millis()),
            }

            warn!(
                session_id = %self.id,
                endpoint = %endpoint.address,
                attempt,
                attempts,
                error = %last_error,
                "Failed to open endpoint"
            );
            if attempt < attempts {
                tokio::time::sleep(self.config.retry.backoff(attempt)).await;
            }
        }

        Err(DiagError::Connection(ConnectionError::OpenFailed {
            endpoint: endpoint.address,
            message: last_error,
        }))
    }

    /// Reset the adapter and apply the initialization sequence
    async fn initialize_adapter(&mut self) -> DiagResult<()> {
        let timeout = self.config.timeouts.handshake();
        let banner = self.handshake_command(elm::RESET, timeout).await?;
        if !banner.to_ascii_uppercase().contains(elm::BANNER) {
            debug!(session_id = %self.id, banner = %banner, "Adapter did not report an ELM banner");
        }

        for command in elm::INIT_SEQUENCE {
            let reply = self.handshake_command(command, timeout).await?;
            if !reply.contains("OK") {
                debug!(session_id = %self.id, command, reply = %reply, "Adapter rejected setting");
            }
        }

        let select = elm::set_protocol(self.config.protocol_selector());
        self.handshake_command(&select, timeout).await?;
        Ok(())
    }

    async fn handshake_command(&mut self, command: &str, timeout: Duration) -> DiagResult<String> {
        match self.exchange(command, timeout).await {
            Ok(raw) => Ok(response::text(&raw, command)),
            Err(TransportError::Timeout(_)) => {
                Err(DiagError::Connection(ConnectionError::HandshakeTimeout {
                    endpoint: self.endpoint_address(),
                    timeout_ms: timeout.as_millis() as u64,
                }))
            }
            Err(e) => Err(DiagError::Connection(ConnectionError::OpenFailed {
                endpoint: self.endpoint_address(),
                message: e.to_string(),
            })),
        }
    }

    /// Issue `0100` until the vehicle answers; the adapter searches protocols meanwhile
    async fn detect_protocol(&mut self) -> DiagResult<()> {
        let timeout = self.config.timeouts.acquisition();
        let attempts = self.config.detect_attempts.max(1);
        let command = elm::request(mode::CURRENT_DATA, &[0x00]);
        let mut last = String::from("no reply");

        for attempt in 1..=attempts {
            match self.exchange(&command, timeout).await {
                Ok(raw) => {
                    let reply = response::parse(&raw, &command);
                    if reply.payload(&[0x41, 0x00]).is_some() {
                        debug!(session_id = %self.id, attempt, "Vehicle protocol resolved");
                        return Ok(());
                    }
                    last = match reply {
                        ElmReply::Fault(fault) => fault.to_string(),
                        other => format!("unexpected reply {:?}", other),
                    };
                }
                Err(e) => last = e.to_string(),
            }
            debug!(session_id = %self.id, attempt, error = %last, "Protocol detection attempt failed");
        }

        Err(DiagError::Protocol {
            endpoint: self.endpoint_address(),
            message: format!("no vehicle protocol after {} attempts: {}", attempts, last),
        })
    }

    /// Record supported PIDs from the `0100`, `0120`, ... bitmaps; best-effort
    async fn read_supported_pids(&mut self) {
        let timeout = self.config.timeouts.acquisition();
        self.supported_pids.clear();

        for base in pid::SUPPORT_RANGES {
            let command = elm::request(mode::CURRENT_DATA, &[base]);
            let reply = match self.exchange(&command, timeout).await {
                Ok(raw) => response::parse(&raw, &command),
                Err(e) => {
                    debug!(session_id = %self.id, command = %command, error = %e, "Support bitmap unavailable");
                    break;
                }
            };
            let Some(bitmap) = reply.payload(&[0x41, base]) else {
                break;
            };
            let pids = pid::parse_support_bitmap(base, bitmap);
            let next = base.checked_add(0x20);
            self.supported_pids.extend(pids.iter().copied());
            match next {
                Some(next) if pids.contains(&next) => continue,
                _ => break,
            }
        }
    }

    async fn describe_protocol(&mut self) -> String {
        let timeout = self.config.timeouts.handshake();
        match self.exchange(elm::DESCRIBE_PROTOCOL, timeout).await {
            Ok(raw) => {
                let text = response::text(&raw, elm::DESCRIBE_PROTOCOL);
                let name = text.trim_start_matches("AUTO,").trim();
                if name.is_empty() {
                    "auto".to_string()
                } else {
                    name.to_string()
                }
            }
            Err(_) => "auto".to_string(),
        }
    }

    /// Send one command and read the raw reply up to the prompt
    pub async fn exchange(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<String, TransportError> {
        let handle = self
            .handle
            .as_mut()
            .ok_or(TransportError::ConnectionClosed)?;
        handle.discard_input().await?;
        handle
            .write(format!("{}{}", command, elm::TERMINATOR).as_bytes())
            .await?;
        let raw = handle.read(timeout).await?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    /// Send an OBD-II request and parse the reply
    pub async fn request(&mut self, command: &str) -> Result<ElmReply, TransportError> {
        let timeout = self.config.timeouts.acquisition();
        let raw = self.exchange(command, timeout).await?;
        Ok(response::parse(&raw, command))
    }

    /// Enter `Acquiring`; fails unless the link is `Connected`
    pub fn begin_operation(&self, operation: &str) -> Result<(), AcquisitionError> {
        let current = self.state();
        if current != LinkState::Connected {
            return Err(AcquisitionError::NotConnected {
                state: current.to_string(),
            });
        }
        debug!(session_id = %self.id, operation, "Acquisition started");
        self.state.send_replace(LinkState::Acquiring);
        Ok(())
    }

    /// Return to `Connected` after an operation, whatever its outcome
    pub fn end_operation(&self) {
        if self.state() == LinkState::Acquiring {
            self.state.send_replace(LinkState::Connected);
        }
    }

    /// Append a value to the parameter's rolling history and return the window
    pub fn record_sample(&mut self, requested: u8, value: f64) -> Vec<f64> {
        let limit = self.config.sensors.history_len.max(1);
        let window = self.history.entry(requested).or_default();
        window.push_back(value);
        while window.len() > limit {
            window.pop_front();
        }
        window.iter().copied().collect()
    }

    /// Release the transport handle and move to `Closed`
    ///
    /// Always succeeds; closing a closed link is a no-op.
    pub async fn close(&mut self) {
        let current = self.state();
        if current == LinkState::Closed {
            return;
        }
        if current.can_transition_to(LinkState::Closing) {
            debug!(session_id = %self.id, from = %current, to = %LinkState::Closing, "Link state transition");
            self.state.send_replace(LinkState::Closing);
        }

        if let Some(mut handle) = self.handle.take() {
            if let Err(e) = handle.close().await {
                warn!(session_id = %self.id, error = %e, "Error releasing transport handle");
            }
        }
        self.history.clear();
        self.state.send_replace(LinkState::Closed);
        info!(session_id = %self.id, endpoint = %self.endpoint_address(), "Link closed");
    }
}

impl std::fmt::Debug for LinkSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("endpoint", &self.endpoint)
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}
