//! Session state machine
//!
//! Owns every piece of session state and applies driver events and user
//! commands to it one at a time. It is driven by
//! [`SessionController`](crate::controller::SessionController), which
//! guarantees that no two calls overlap.
//!
//! ```text
//! Idle -> Scanning -> Discovered -> Connecting -> Connected -> Authenticating
//!      -> Authenticated -> DiscoveringServices(i) -> EnablingServices -> Ready
//!      -> Disconnecting -> Idle
//! ```
//!
//! Any driver failure passes through `Failed(stage)` and lands in `Idle`.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::config::{CentralConfig, DongleLink, ScanParams, MAX_REPORT_ENTRIES, MAX_REPORT_REF_BYTES};
use crate::dispatcher::DriverEvent;
use crate::driver::{describe_disconnect_reason, DongleDriver, DriverCode, DriverResult};
use crate::endpoint::{format_hex, EndpointTable, ReportEndpoint};
use crate::error::{CentralError, Result};
use crate::gateway::{DataIoGateway, IoDirection, IoOutcome, IoRequest};
use crate::notify::{Notifier, SessionNotification};
use crate::pairing::{AuthOutcome, PairingCoordinator};
use crate::peer::{ConnectionTarget, DiscoveredPeer, PeerAddress};
use crate::registry::DeviceRegistry;
use crate::selector::TargetSelector;
use crate::services::{DiscoveryStep, ServiceEnumerator};

/// Where the session is in its lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SessionState {
    /// No session; start and recovery state
    Idle,
    /// Scanning for advertisers
    Scanning,
    /// A connection target is locked
    Discovered,
    /// Connection requested
    Connecting,
    /// Link up, authentication not yet started
    Connected,
    /// Authentication running or failed
    Authenticating,
    /// Authentication succeeded
    Authenticated,
    /// Waiting for the i-th service query
    DiscoveringServices(usize),
    /// Waiting for service enablement
    EnablingServices,
    /// Endpoints available for data I/O
    Ready,
    /// Disconnect requested
    Disconnecting,
    /// A stage failed; the session is being reset
    Failed(String),
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "Idle"),
            SessionState::Scanning => write!(f, "Scanning"),
            SessionState::Discovered => write!(f, "Discovered"),
            SessionState::Connecting => write!(f, "Connecting"),
            SessionState::Connected => write!(f, "Connected"),
            SessionState::Authenticating => write!(f, "Authenticating"),
            SessionState::Authenticated => write!(f, "Authenticated"),
            SessionState::DiscoveringServices(i) => write!(f, "DiscoveringServices({})", i),
            SessionState::EnablingServices => write!(f, "EnablingServices"),
            SessionState::Ready => write!(f, "Ready"),
            SessionState::Disconnecting => write!(f, "Disconnecting"),
            SessionState::Failed(stage) => write!(f, "Failed({})", stage),
        }
    }
}

/// Read-only copy of the session for the presentation layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    /// Current state
    pub state: SessionState,
    /// Whether `dongle_init` succeeded
    pub dongle_ready: bool,
    /// Whether a link is up
    pub connected: bool,
    /// Whether the link is authenticated
    pub authenticated: bool,
    /// Locked connection target
    pub target: Option<ConnectionTarget>,
    /// Discovered peers in first-seen order
    pub peers: Vec<DiscoveredPeer>,
    /// Endpoint labels in dongle order
    pub endpoints: Vec<String>,
    /// Selected endpoint label
    pub selected_endpoint: Option<String>,
    /// Status of the last failed authentication on this link
    pub auth_failure: Option<u8>,
    /// Data requests in flight
    pub pending_io: usize,
}

/// The session core
pub struct SessionStateMachine<D: DongleDriver> {
    driver: Arc<D>,
    state: SessionState,
    link: DongleLink,
    scan: ScanParams,
    auto_connect: bool,
    registry: DeviceRegistry,
    selector: TargetSelector,
    pairing: PairingCoordinator,
    services: ServiceEnumerator,
    endpoints: EndpointTable,
    gateway: DataIoGateway,
    notifier: Notifier,
    dongle_ready: bool,
    connected: bool,
    authenticated: bool,
    auth_failure: Option<u8>,
}

impl<D: DongleDriver> SessionStateMachine<D> {
    /// Create an idle session over `driver`
    pub fn new(driver: Arc<D>, config: &CentralConfig) -> Self {
        Self {
            driver,
            state: SessionState::Idle,
            link: config.link.clone(),
            scan: config.scan,
            auto_connect: config.selection.auto_connect,
            registry: DeviceRegistry::new(),
            selector: TargetSelector::new(&config.selection),
            pairing: PairingCoordinator::new(config.auth.clone()),
            services: ServiceEnumerator::new(config.services.clone()),
            endpoints: EndpointTable::default(),
            gateway: DataIoGateway::new(config.io.request_timeout),
            notifier: Notifier::new(config.notification_capacity),
            dongle_ready: false,
            connected: false,
            authenticated: false,
            auth_failure: None,
        }
    }

    /// Current state
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// The driver commands go to
    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    /// Discovered peers
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Endpoints of the current session
    pub fn endpoints(&self) -> &EndpointTable {
        &self.endpoints
    }

    /// Locked connection target
    pub fn target(&self) -> Option<&ConnectionTarget> {
        self.selector.target()
    }

    /// Notification publisher
    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Immutable copy of the session
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state.clone(),
            dongle_ready: self.dongle_ready,
            connected: self.connected,
            authenticated: self.authenticated,
            target: self.selector.target().cloned(),
            peers: self.registry.peers().to_vec(),
            endpoints: self
                .endpoints
                .endpoints()
                .iter()
                .map(|e| e.label.clone())
                .collect(),
            selected_endpoint: self.endpoints.selected().map(|e| e.label.clone()),
            auth_failure: self.auth_failure,
            pending_io: self.gateway.pending_count(),
        }
    }

    // ===== Driver events =====

    /// Apply one driver callback
    pub async fn handle_event(&mut self, event: DriverEvent) {
        trace!(kind = event.kind(), state = %self.state, "Driver event");
        match event {
            DriverEvent::Discovered {
                address_label,
                name,
                address,
                rssi,
            } => self.on_discovered(address, &address_label, &name, rssi).await,
            DriverEvent::Connected { address } => self.on_connected(address).await,
            DriverEvent::PasskeyRequired { passkey } => self.on_passkey_required(&passkey),
            DriverEvent::Authenticated { status } => self.on_authenticated(status).await,
            DriverEvent::ServiceDiscovered {
                last_handle,
                char_count,
            } => self.on_service_discovered(last_handle, char_count).await,
            DriverEvent::ServiceEnabled { count } => self.on_service_enabled(count).await,
            DriverEvent::Disconnected { reason } => self.on_disconnected(reason),
            DriverEvent::Failed { stage } => self.fail(&stage, None),
            DriverEvent::DataReceived { handle, data } => {
                self.notifier
                    .log(format!("rx 0x{:04X}: {}", handle, format_hex(&data)));
                self.notifier.publish(SessionNotification::DataReceived {
                    handle,
                    data: data.to_vec(),
                });
            }
            DriverEvent::DataSent { handle, data } => {
                self.notifier
                    .log(format!("tx 0x{:04X}: {}", handle, format_hex(&data)));
                self.notifier.publish(SessionNotification::DataSent {
                    handle,
                    data: data.to_vec(),
                });
            }
        }
    }

    async fn on_discovered(&mut self, address: PeerAddress, address_label: &str, name: &str, rssi: i8) {
        // Advertisement reports can trail a scan-stop; they still refresh the
        // registry but can no longer lock a target.
        if !matches!(self.state, SessionState::Scanning | SessionState::Discovered) {
            trace!(%address, state = %self.state, "Ignoring advertisement outside scan");
            return;
        }

        let (peer, inserted) = self.registry.upsert(address, address_label, name, rssi);
        let peer = peer.clone();
        if inserted {
            self.notifier.log(format!("found {}", peer.label()));
        }
        self.publish_peers();

        if self.state != SessionState::Scanning {
            return;
        }
        if let Some(target) = self.selector.offer(&peer) {
            if self.lock_target(target).await.is_ok() && self.auto_connect {
                if let Err(err) = self.connect().await {
                    debug!(error = %err, "Auto-connect not issued");
                }
            }
        }
    }

    async fn on_connected(&mut self, address: PeerAddress) {
        if self.state != SessionState::Connecting {
            debug!(%address, state = %self.state, "Ignoring unexpected connection");
            return;
        }

        self.connected = true;
        self.auth_failure = None;
        self.notifier.log(format!("connected {}", address));
        self.transition(SessionState::Connected);

        match self.pairing.begin(self.driver.as_ref()).await {
            Ok(()) => self.transition(SessionState::Authenticating),
            Err(err) => self.fail_on(&err),
        }
    }

    fn on_passkey_required(&mut self, passkey: &str) {
        if self.state != SessionState::Authenticating {
            debug!(state = %self.state, "Ignoring passkey outside authentication");
            return;
        }
        self.pairing.on_passkey_required(passkey);
        self.notifier.log(format!("passkey {}", passkey));
        self.notifier.publish(SessionNotification::PasskeyDisplay {
            passkey: passkey.to_string(),
        });
    }

    async fn on_authenticated(&mut self, status: u8) {
        if self.state != SessionState::Authenticating {
            debug!(status, state = %self.state, "Ignoring authentication result");
            return;
        }

        match self.pairing.on_authenticated(status) {
            AuthOutcome::Authenticated => {
                self.authenticated = true;
                self.auth_failure = None;
                self.notifier.log("authenticated");
                self.transition(SessionState::Authenticated);

                let step = self.services.start(self.driver.as_ref()).await;
                self.apply_discovery_step(step);
            }
            AuthOutcome::Failed(status) => {
                self.auth_failure = Some(status);
                self.notifier.log(format!("auth fail status:{}", status));
                self.notifier
                    .publish(SessionNotification::AuthenticationFailed { status });
            }
        }
    }

    async fn on_service_discovered(&mut self, last_handle: u16, char_count: u16) {
        let current = match self.state {
            SessionState::DiscoveringServices(i) if self.services.cursor() == Some(i) => i,
            _ => {
                debug!(last_handle, state = %self.state, "Ignoring stray service discovery");
                return;
            }
        };

        if let Some(query) = self.services.queries().get(current) {
            self.notifier.log(format!(
                "service {} discovered, last handle 0x{:04X}, {} chars",
                query, last_handle, char_count
            ));
        }

        match self
            .services
            .on_discovered(self.driver.as_ref(), last_handle)
            .await
        {
            Some(step) => self.apply_discovery_step(step),
            None => debug!("Service discovery no longer active"),
        }
    }

    fn apply_discovery_step(&mut self, step: Result<DiscoveryStep>) {
        match step {
            Ok(DiscoveryStep::Next(index)) => {
                self.transition(SessionState::DiscoveringServices(index))
            }
            Ok(DiscoveryStep::Enabling) => self.transition(SessionState::EnablingServices),
            Err(err) => self.fail_on(&err),
        }
    }

    async fn on_service_enabled(&mut self, count: u16) {
        if self.state != SessionState::EnablingServices {
            debug!(count, state = %self.state, "Ignoring service enablement");
            return;
        }

        let list = match self
            .driver
            .report_char_list(MAX_REPORT_ENTRIES, MAX_REPORT_REF_BYTES)
            .await
        {
            Ok(list) => list,
            Err(code) => return self.fail("report_char_list", Some(code)),
        };

        let (table, dropped) = EndpointTable::from_report_list(&list);
        if dropped > 0 {
            self.notifier
                .log(format!("report list truncated, {} entries dropped", dropped));
        }
        self.endpoints = table;
        self.gateway.clear();
        self.notifier.log(format!(
            "{} services enabled, {} endpoints",
            count,
            self.endpoints.len()
        ));
        self.publish_endpoints();
        self.transition(SessionState::Ready);
    }

    fn on_disconnected(&mut self, reason: u8) {
        self.notifier
            .log(format!("disconnected: {}", describe_disconnect_reason(reason)));
        self.reset_session();
    }

    // ===== Commands =====

    /// Open the serial link to the dongle
    pub async fn init_dongle(&mut self) -> Result<()> {
        self.require("init_dongle", |s| *s == SessionState::Idle)?;

        let result = self
            .driver
            .dongle_init(&self.link.port, self.link.baud_rate)
            .await;
        match result {
            Ok(()) => {
                self.dongle_ready = true;
                self.notifier.log(format!(
                    "dongle init ok ({} @ {})",
                    self.link.port, self.link.baud_rate
                ));
                Ok(())
            }
            Err(code) => {
                self.notifier.log(format!("dongle init fail code:{}", code));
                Err(CentralError::Driver {
                    stage: "dongle_init",
                    code,
                })
            }
        }
    }

    /// Reset the dongle and the whole session
    pub async fn reset_dongle(&mut self) -> Result<()> {
        if self.connected {
            if let Err(code) = self.driver.dongle_disconnect().await {
                warn!(%code, "Disconnect before reset failed");
            }
        }
        let result = self.driver.dongle_reset().await;
        self.reset_session();
        self.dongle_ready = false;

        match result {
            Ok(()) => {
                self.notifier.log("dongle reset ok");
                Ok(())
            }
            Err(code) => {
                self.notifier.log(format!("dongle reset fail code:{}", code));
                Err(CentralError::Driver {
                    stage: "dongle_reset",
                    code,
                })
            }
        }
    }

    /// Clear the registry and start scanning
    pub async fn start_scan(&mut self) -> Result<()> {
        self.require("start_scan", |s| {
            matches!(
                s,
                SessionState::Idle | SessionState::Discovered | SessionState::Ready
            )
        })?;
        if !self.dongle_ready {
            return Err(CentralError::DongleNotReady);
        }

        self.registry.clear();
        self.selector.release();
        self.publish_peers();

        let result = self.driver.scan_start(&self.scan).await;
        self.check("scan_start", result)?;
        self.notifier.log(format!(
            "scan started ({:.1}ms/{:.1}ms)",
            self.scan.interval_ms(),
            self.scan.window_ms()
        ));
        self.transition(SessionState::Scanning);
        Ok(())
    }

    /// Stop scanning without locking a target
    pub async fn stop_scan(&mut self) -> Result<()> {
        self.require("stop_scan", |s| *s == SessionState::Scanning)?;

        let result = self.driver.scan_stop().await;
        self.check("scan_stop", result)?;
        self.notifier.log("scan stopped");
        let next = if self.connected && !self.endpoints.is_empty() {
            SessionState::Ready
        } else {
            SessionState::Idle
        };
        self.transition(next);
        Ok(())
    }

    /// Lock a registry entry picked by the user
    pub async fn select_peer(&mut self, address: &str) -> Result<ConnectionTarget> {
        self.require("select_peer", |s| {
            matches!(s, SessionState::Scanning | SessionState::Discovered)
        })?;

        let peer = self
            .registry
            .find_by_label(address)
            .cloned()
            .ok_or_else(|| CentralError::UnknownPeer(address.to_string()))?;
        let target = self.selector.select(&peer)?;
        self.lock_target(target.clone()).await?;
        Ok(target)
    }

    async fn lock_target(&mut self, target: ConnectionTarget) -> Result<()> {
        if self.state == SessionState::Scanning {
            let result = self.driver.scan_stop().await;
            self.check("scan_stop", result)?;
        }

        self.notifier
            .log(format!("target locked {}", target.address_label));
        self.notifier
            .publish(SessionNotification::TargetLocked { target });
        self.transition(SessionState::Discovered);
        Ok(())
    }

    /// Connect to the locked target
    pub async fn connect(&mut self) -> Result<()> {
        self.require("connect", |s| {
            matches!(s, SessionState::Discovered | SessionState::Ready)
        })?;
        let target = self.selector.target().cloned().ok_or(CentralError::NoTarget)?;

        let result = self.driver.conn_start(&target.address).await;
        self.check("conn_start", result)?;
        self.notifier
            .log(format!("connecting to {}", target.address_label));
        self.transition(SessionState::Connecting);
        Ok(())
    }

    /// Ask the dongle to drop the link
    pub async fn disconnect(&mut self) -> Result<()> {
        if !self.connected && self.state != SessionState::Connecting {
            return Err(self.invalid_state("disconnect"));
        }

        let result = self.driver.dongle_disconnect().await;
        self.check("dongle_disconnect", result)?;
        self.notifier.log("disconnecting");
        self.transition(SessionState::Disconnecting);
        Ok(())
    }

    /// Change the selected endpoint
    pub fn select_endpoint(&mut self, label: &str) -> Result<ReportEndpoint> {
        self.require("select_endpoint", |s| *s == SessionState::Ready)?;

        let endpoint = self.endpoints.select(label)?.clone();
        self.notifier
            .log(format!("endpoint {} selected", endpoint.label));
        self.publish_endpoints();
        Ok(endpoint)
    }

    /// Validate a request against the selected endpoint
    pub fn begin_io(&mut self, direction: IoDirection, payload_hex: Option<&str>) -> Result<IoRequest> {
        let command = match direction {
            IoDirection::Read => "read",
            IoDirection::Write => "write",
        };
        self.require(command, |s| *s == SessionState::Ready)?;
        self.gateway.begin(&self.endpoints, direction, payload_hex)
    }

    /// Select `label` if needed, then validate the request
    pub fn submit_io_request(
        &mut self,
        direction: IoDirection,
        label: &str,
        payload_hex: Option<&str>,
    ) -> Result<IoRequest> {
        self.require("submit_io_request", |s| *s == SessionState::Ready)?;

        let endpoint = self.endpoints.find(label)?;
        let reselect = self.endpoints.selected() != Some(&endpoint);
        let request = self.gateway.begin_on(endpoint, direction, payload_hex)?;

        // Only an accepted request moves the selection
        if reselect {
            if let Err(err) = self.select_endpoint(&request.endpoint.label) {
                self.gateway.finish(&request);
                return Err(err);
            }
        }
        Ok(request)
    }

    /// Record the result of a finished request
    pub fn complete_io(&mut self, request: &IoRequest, result: Result<IoOutcome>) -> Result<IoOutcome> {
        let label = &request.endpoint.label;
        if !self.gateway.finish(request) {
            // Started before the last reset; the link it ran on is gone
            let verb = match request.direction {
                IoDirection::Read => "read",
                IoDirection::Write => "write",
            };
            self.notifier
                .log(format!("{} {}: late result dropped after reset", verb, label));
            return result;
        }

        match &result {
            Ok(IoOutcome::Read(data)) => {
                self.notifier
                    .log(format!("read {}: {}", label, format_hex(data)));
                self.notifier.publish(SessionNotification::ReadCompleted {
                    endpoint: label.clone(),
                    data: data.to_vec(),
                });
            }
            Ok(IoOutcome::Written(len)) => {
                self.notifier.log(format!(
                    "write {}: {} ok",
                    label,
                    format_hex(&request.payload)
                ));
                self.notifier.publish(SessionNotification::WriteCompleted {
                    endpoint: label.clone(),
                    len: *len,
                });
            }
            Err(err) => {
                let verb = match request.direction {
                    IoDirection::Read => "read",
                    IoDirection::Write => "write",
                };
                match err.driver_code() {
                    Some(code) => self.notifier.log(format!("{} fail code:{}", verb, code)),
                    None => self.notifier.log(format!("{} fail: {}", verb, err)),
                };
            }
        }
        result
    }

    /// Drop the link and release the dongle
    pub async fn shutdown(&mut self) {
        if self.connected {
            if let Err(code) = self.driver.dongle_disconnect().await {
                warn!(%code, "Disconnect on shutdown failed");
            }
        }
        if self.dongle_ready {
            if let Err(code) = self.driver.dongle_reset().await {
                warn!(%code, "Reset on shutdown failed");
            }
        }
        self.reset_session();
        self.dongle_ready = false;
        self.notifier.log("session stopped");
    }

    // ===== Internals =====

    fn transition(&mut self, to: SessionState) {
        if self.state == to {
            return;
        }
        let from = std::mem::replace(&mut self.state, to.clone());
        self.notifier.log(format!("state {} -> {}", from, to));
        self.notifier
            .publish(SessionNotification::StateChanged { from, to });
    }

    fn require(&self, command: &'static str, allowed: impl Fn(&SessionState) -> bool) -> Result<()> {
        if allowed(&self.state) {
            Ok(())
        } else {
            Err(self.invalid_state(command))
        }
    }

    fn invalid_state(&self, command: &'static str) -> CentralError {
        CentralError::InvalidState {
            command,
            state: self.state.clone(),
        }
    }

    /// Reset on a failed driver command
    fn check<T>(&mut self, stage: &'static str, result: DriverResult<T>) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(code) => {
                self.fail(stage, Some(code));
                Err(CentralError::Driver { stage, code })
            }
        }
    }

    fn fail_on(&mut self, err: &CentralError) {
        match err {
            CentralError::Driver { stage, code } => self.fail(stage, Some(*code)),
            other => self.fail(other.error_code(), None),
        }
    }

    fn fail(&mut self, stage: &str, code: Option<DriverCode>) {
        match code {
            Some(code) => self.notifier.log(format!("{} fail code:{}", stage, code)),
            None => self.notifier.log(format!("{} fail", stage)),
        };
        warn!(stage, ?code, state = %self.state, "Session failed, resetting");

        if self.state != SessionState::Idle {
            self.transition(SessionState::Failed(stage.to_string()));
        }
        self.reset_session();
    }

    /// Back to `Idle`; the registry is kept
    fn reset_session(&mut self) {
        self.selector.release();
        self.pairing.reset();
        self.services.reset();
        self.gateway.clear();
        self.connected = false;
        self.authenticated = false;
        self.auth_failure = None;
        if !self.endpoints.is_empty() {
            self.endpoints.clear();
            self.publish_endpoints();
        }
        self.transition(SessionState::Idle);
    }

    fn publish_peers(&self) {
        self.notifier.publish(SessionNotification::PeersChanged {
            peers: self.registry.peers().to_vec(),
        });
    }

    fn publish_endpoints(&self) {
        self.notifier.publish(SessionNotification::EndpointsChanged {
            endpoints: self.endpoints.endpoints().to_vec(),
            selected: self.endpoints.selected().map(|e| e.label.clone()),
        });
    }
}
