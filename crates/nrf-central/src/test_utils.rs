//! Driver doubles for tests and offline use
//!
//! - [`MockDongle`] records every command and returns scripted results. It
//!   never fires callbacks; tests inject those through an
//!   [`EventDispatcher`] themselves.
//! - [`SimulatedDongle`] answers each command with the callbacks a real
//!   dongle would fire, so a full session can run without hardware.
//!
//! # Example
//!
//! ```rust,ignore
//! use nrf_central::{CentralConfig, MockDongle, SessionController};
//!
//! let driver = MockDongle::new();
//! let (controller, handle, dispatcher) =
//!     SessionController::new(driver.clone(), CentralConfig::default())?;
//! tokio::spawn(controller.run());
//!
//! handle.init_dongle().await?;
//! handle.start_scan().await?;
//! dispatcher.on_discovered("112233445566", "Remote", 0, [0x11, 0x22, 0x33, 0x44, 0x55, 0x66], -40);
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::{CentralConfig, ScanParams};
use crate::controller::{SessionController, SessionHandle};
use crate::dispatcher::EventDispatcher;
use crate::driver::{
    DongleDriver, DriverCode, DriverResult, ReportCharList, REASON_LOCAL_HOST_TERMINATED,
};
use crate::error::Result;
use crate::pairing::{IoCapabilities, Passkey, SecurityParams};
use crate::peer::{PeerAddress, ADDRESS_LEN};
use crate::services::ServiceQuery;

/// A command as recorded by [`MockDongle`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    /// `dongle_init`
    DongleInit {
        /// Serial port
        port: String,
        /// Baud rate
        baud_rate: u32,
    },
    /// `dongle_reset`
    DongleReset,
    /// `dongle_disconnect`
    DongleDisconnect,
    /// `scan_start`
    ScanStart(ScanParams),
    /// `scan_stop`
    ScanStop,
    /// `conn_start`
    ConnStart(PeerAddress),
    /// `auth_set_params`
    AuthSetParams(SecurityParams),
    /// `auth_start`
    AuthStart {
        /// Bond flag
        bond: bool,
        /// Keypress flag
        keypress: bool,
        /// I/O capabilities
        io_caps: IoCapabilities,
        /// Passkey digits
        passkey: Option<String>,
    },
    /// `service_discovery_start`
    ServiceDiscoveryStart(ServiceQuery),
    /// `service_enable_start`
    ServiceEnableStart,
    /// `report_char_list`
    ReportCharList {
        /// Handle capacity
        max_handles: usize,
        /// Reference byte capacity
        max_ref_bytes: usize,
    },
    /// `data_read`
    DataRead {
        /// Handle
        handle: u16,
        /// Timeout
        timeout: Duration,
    },
    /// `data_read_by_report_ref`
    DataReadByReportRef {
        /// Report reference
        report_ref: [u8; 2],
        /// Timeout
        timeout: Duration,
    },
    /// `data_write`
    DataWrite {
        /// Handle
        handle: u16,
        /// Payload
        data: Vec<u8>,
        /// Timeout
        timeout: Duration,
    },
    /// `data_write_by_report_ref`
    DataWriteByReportRef {
        /// Report reference
        report_ref: [u8; 2],
        /// Payload
        data: Vec<u8>,
        /// Timeout
        timeout: Duration,
    },
}

impl DriverCall {
    /// Driver command name
    pub fn command(&self) -> &'static str {
        match self {
            DriverCall::DongleInit { .. } => "dongle_init",
            DriverCall::DongleReset => "dongle_reset",
            DriverCall::DongleDisconnect => "dongle_disconnect",
            DriverCall::ScanStart(_) => "scan_start",
            DriverCall::ScanStop => "scan_stop",
            DriverCall::ConnStart(_) => "conn_start",
            DriverCall::AuthSetParams(_) => "auth_set_params",
            DriverCall::AuthStart { .. } => "auth_start",
            DriverCall::ServiceDiscoveryStart(_) => "service_discovery_start",
            DriverCall::ServiceEnableStart => "service_enable_start",
            DriverCall::ReportCharList { .. } => "report_char_list",
            DriverCall::DataRead { .. } => "data_read",
            DriverCall::DataReadByReportRef { .. } => "data_read_by_report_ref",
            DriverCall::DataWrite { .. } => "data_write",
            DriverCall::DataWriteByReportRef { .. } => "data_write_by_report_ref",
        }
    }

    fn is_read(&self) -> bool {
        matches!(
            self,
            DriverCall::DataRead { .. } | DriverCall::DataReadByReportRef { .. }
        )
    }

    fn is_write(&self) -> bool {
        matches!(
            self,
            DriverCall::DataWrite { .. } | DriverCall::DataWriteByReportRef { .. }
        )
    }
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<DriverCall>,
    failures: HashMap<&'static str, VecDeque<DriverCode>>,
    reads: VecDeque<Bytes>,
    report_list: ReportCharList,
    stall: Option<Duration>,
}

/// Recording driver with scripted results
///
/// Clones share state, so a test can keep one clone while the session owns
/// another.
#[derive(Debug, Clone, Default)]
pub struct MockDongle {
    state: Arc<Mutex<MockState>>,
}

impl MockDongle {
    /// Create a mock where every command succeeds
    pub fn new() -> Self {
        Self::default()
    }

    /// Every command issued so far, in order
    pub fn calls(&self) -> Vec<DriverCall> {
        self.state.lock().calls.clone()
    }

    /// Number of times a command was issued
    pub fn count(&self, command: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.command() == command)
            .count()
    }

    /// Forget recorded calls
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Make the next call of `command` (or a data read/write of either form
    /// when `command` is `data_read`/`data_write`) return `code`
    pub fn fail_next(&self, command: &'static str, code: DriverCode) {
        self.state
            .lock()
            .failures
            .entry(command)
            .or_default()
            .push_back(code);
    }

    /// Queue bytes for the next read
    pub fn queue_read(&self, data: &[u8]) {
        self.state
            .lock()
            .reads
            .push_back(Bytes::copy_from_slice(data));
    }

    /// Report list returned by `report_char_list`
    pub fn set_report_list(&self, list: ReportCharList) {
        self.state.lock().report_list = list;
    }

    /// Report list of `n` entries with handles `0x10, 0x14, ..` and report
    /// references `[i+1, 1]`
    pub fn set_report_entries(&self, n: usize) {
        let handles = (0..n).map(|i| 0x10 + 4 * i as u16).collect();
        let refs = (0..n).flat_map(|i| [(i + 1) as u8, 0x01]).collect();
        self.set_report_list(ReportCharList {
            handles,
            refs,
            count: n,
        });
    }

    /// Make data reads and writes take this long before answering
    pub fn stall_reads(&self, delay: Duration) {
        self.state.lock().stall = Some(delay);
    }

    fn record(&self, call: DriverCall) -> DriverResult<()> {
        let mut state = self.state.lock();
        let command = call.command();
        let alias = if call.is_read() {
            Some("data_read")
        } else if call.is_write() {
            Some("data_write")
        } else {
            None
        };
        state.calls.push(call);

        for key in std::iter::once(command).chain(alias) {
            if let Some(code) = state.failures.get_mut(key).and_then(VecDeque::pop_front) {
                return Err(code);
            }
        }
        Ok(())
    }

    async fn data_call(&self, call: DriverCall) -> DriverResult<()> {
        let stall = self.state.lock().stall;
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }
        self.record(call)
    }

    fn next_read(&self) -> Bytes {
        self.state.lock().reads.pop_front().unwrap_or_default()
    }
}

#[async_trait]
impl DongleDriver for MockDongle {
    async fn dongle_init(&self, port: &str, baud_rate: u32) -> DriverResult<()> {
        self.record(DriverCall::DongleInit {
            port: port.to_string(),
            baud_rate,
        })
    }

    async fn dongle_reset(&self) -> DriverResult<()> {
        self.record(DriverCall::DongleReset)
    }

    async fn dongle_disconnect(&self) -> DriverResult<()> {
        self.record(DriverCall::DongleDisconnect)
    }

    async fn scan_start(&self, params: &ScanParams) -> DriverResult<()> {
        self.record(DriverCall::ScanStart(*params))
    }

    async fn scan_stop(&self) -> DriverResult<()> {
        self.record(DriverCall::ScanStop)
    }

    async fn conn_start(&self, address: &PeerAddress) -> DriverResult<()> {
        self.record(DriverCall::ConnStart(*address))
    }

    async fn auth_set_params(&self, params: &SecurityParams) -> DriverResult<()> {
        self.record(DriverCall::AuthSetParams(*params))
    }

    async fn auth_start(
        &self,
        bond: bool,
        keypress: bool,
        io_caps: IoCapabilities,
        passkey: Option<&Passkey>,
    ) -> DriverResult<()> {
        self.record(DriverCall::AuthStart {
            bond,
            keypress,
            io_caps,
            passkey: passkey.map(|p| p.as_str().to_string()),
        })
    }

    async fn service_discovery_start(&self, query: ServiceQuery) -> DriverResult<()> {
        self.record(DriverCall::ServiceDiscoveryStart(query))
    }

    async fn service_enable_start(&self) -> DriverResult<()> {
        self.record(DriverCall::ServiceEnableStart)
    }

    async fn report_char_list(
        &self,
        max_handles: usize,
        max_ref_bytes: usize,
    ) -> DriverResult<ReportCharList> {
        self.record(DriverCall::ReportCharList {
            max_handles,
            max_ref_bytes,
        })?;
        Ok(self.state.lock().report_list.clone())
    }

    async fn data_read(&self, handle: u16, timeout: Duration) -> DriverResult<Bytes> {
        self.data_call(DriverCall::DataRead { handle, timeout }).await?;
        Ok(self.next_read())
    }

    async fn data_read_by_report_ref(
        &self,
        report_ref: [u8; 2],
        timeout: Duration,
    ) -> DriverResult<Bytes> {
        self.data_call(DriverCall::DataReadByReportRef {
            report_ref,
            timeout,
        })
        .await?;
        Ok(self.next_read())
    }

    async fn data_write(&self, handle: u16, data: &[u8], timeout: Duration) -> DriverResult<()> {
        self.data_call(DriverCall::DataWrite {
            handle,
            data: data.to_vec(),
            timeout,
        })
        .await
    }

    async fn data_write_by_report_ref(
        &self,
        report_ref: [u8; 2],
        data: &[u8],
        timeout: Duration,
    ) -> DriverResult<()> {
        self.data_call(DriverCall::DataWriteByReportRef {
            report_ref,
            data: data.to_vec(),
            timeout,
        })
        .await
    }

    fn name(&self) -> &str {
        "MockDongle"
    }
}

/// A session over a fresh [`MockDongle`], plus a clone of the mock for
/// inspecting calls
pub fn mock_session(
    config: CentralConfig,
) -> Result<(
    SessionController<MockDongle>,
    SessionHandle,
    EventDispatcher,
    MockDongle,
)> {
    let driver = MockDongle::new();
    let (controller, handle, dispatcher) = SessionController::new(driver.clone(), config)?;
    Ok((controller, handle, dispatcher, driver))
}

/// An advertiser the simulated radio reports while scanning
#[derive(Debug, Clone)]
pub struct SimulatedPeer {
    /// Address bytes
    pub address: [u8; ADDRESS_LEN],
    /// Address type tag
    pub address_type: u8,
    /// Advertised name
    pub name: String,
    /// Signal strength in dBm
    pub rssi: i8,
}

impl SimulatedPeer {
    fn address_label(&self) -> String {
        self.address.iter().map(|b| format!("{:02X}", b)).collect()
    }
}

/// Driver that answers commands with the callbacks real hardware would fire
///
/// Callbacks go to the dispatcher given to [`SimulatedDongle::attach`];
/// commands issued before that succeed silently.
#[derive(Debug, Clone)]
pub struct SimulatedDongle {
    inner: MockDongle,
    dispatcher: Arc<Mutex<Option<EventDispatcher>>>,
    peers: Vec<SimulatedPeer>,
    connected: Arc<Mutex<Option<PeerAddress>>>,
}

impl Default for SimulatedDongle {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDongle {
    /// Simulated radio with two advertisers: a weak one and a strong
    /// HID peripheral
    pub fn new() -> Self {
        Self::with_peers(vec![
            SimulatedPeer {
                address: [0xD3, 0x11, 0x52, 0x6A, 0x01, 0x9C],
                address_type: 1,
                name: String::new(),
                rssi: -82,
            },
            SimulatedPeer {
                address: [0xC8, 0x7F, 0x54, 0x2E, 0x10, 0x4B],
                address_type: 1,
                name: "Gear VR Controller".to_string(),
                rssi: -45,
            },
        ])
    }

    /// Simulated radio with the given advertisers
    pub fn with_peers(peers: Vec<SimulatedPeer>) -> Self {
        let inner = MockDongle::new();
        inner.set_report_entries(3);
        Self {
            inner,
            dispatcher: Arc::new(Mutex::new(None)),
            peers,
            connected: Arc::new(Mutex::new(None)),
        }
    }

    /// Route callbacks to a session
    pub fn attach(&self, dispatcher: EventDispatcher) {
        *self.dispatcher.lock() = Some(dispatcher);
    }

    /// Recorder of every command issued
    pub fn recorder(&self) -> &MockDongle {
        &self.inner
    }

    fn emit(&self, f: impl FnOnce(&EventDispatcher)) {
        if let Some(dispatcher) = self.dispatcher.lock().as_ref() {
            f(dispatcher);
        }
    }
}

#[async_trait]
impl DongleDriver for SimulatedDongle {
    async fn dongle_init(&self, port: &str, baud_rate: u32) -> DriverResult<()> {
        debug!(port, baud_rate, "Simulated dongle init");
        self.inner.dongle_init(port, baud_rate).await
    }

    async fn dongle_reset(&self) -> DriverResult<()> {
        *self.connected.lock() = None;
        self.inner.dongle_reset().await
    }

    async fn dongle_disconnect(&self) -> DriverResult<()> {
        self.inner.dongle_disconnect().await?;
        if self.connected.lock().take().is_some() {
            self.emit(|d| d.on_disconnected(REASON_LOCAL_HOST_TERMINATED));
        }
        Ok(())
    }

    async fn scan_start(&self, params: &ScanParams) -> DriverResult<()> {
        self.inner.scan_start(params).await?;
        for peer in &self.peers {
            self.emit(|d| {
                d.on_discovered(
                    &peer.address_label(),
                    &peer.name,
                    peer.address_type,
                    peer.address,
                    peer.rssi,
                )
            });
        }
        Ok(())
    }

    async fn scan_stop(&self) -> DriverResult<()> {
        self.inner.scan_stop().await
    }

    async fn conn_start(&self, address: &PeerAddress) -> DriverResult<()> {
        self.inner.conn_start(address).await?;
        *self.connected.lock() = Some(*address);
        self.emit(|d| d.on_connected(address.kind.as_u8(), address.bytes));
        Ok(())
    }

    async fn auth_set_params(&self, params: &SecurityParams) -> DriverResult<()> {
        self.inner.auth_set_params(params).await
    }

    async fn auth_start(
        &self,
        bond: bool,
        keypress: bool,
        io_caps: IoCapabilities,
        passkey: Option<&Passkey>,
    ) -> DriverResult<()> {
        self.inner.auth_start(bond, keypress, io_caps, passkey).await?;
        if let Some(passkey) = passkey {
            self.emit(|d| d.on_passkey_required(passkey.as_str()));
        }
        self.emit(|d| d.on_authenticated(0));
        Ok(())
    }

    async fn service_discovery_start(&self, query: ServiceQuery) -> DriverResult<()> {
        self.inner.service_discovery_start(query).await?;
        let index = self.inner.count("service_discovery_start") as u16;
        self.emit(|d| d.on_service_discovered(0x10 * index + 0x0F, 2));
        Ok(())
    }

    async fn service_enable_start(&self) -> DriverResult<()> {
        self.inner.service_enable_start().await?;
        self.emit(|d| d.on_service_enabled(3));
        Ok(())
    }

    async fn report_char_list(
        &self,
        max_handles: usize,
        max_ref_bytes: usize,
    ) -> DriverResult<ReportCharList> {
        self.inner.report_char_list(max_handles, max_ref_bytes).await
    }

    async fn data_read(&self, handle: u16, timeout: Duration) -> DriverResult<Bytes> {
        self.inner.data_read(handle, timeout).await?;
        Ok(Bytes::copy_from_slice(&handle.to_le_bytes()))
    }

    async fn data_read_by_report_ref(
        &self,
        report_ref: [u8; 2],
        timeout: Duration,
    ) -> DriverResult<Bytes> {
        self.inner.data_read_by_report_ref(report_ref, timeout).await?;
        Ok(Bytes::copy_from_slice(&[report_ref[0], 0x00, 0x00, 0x00]))
    }

    async fn data_write(&self, handle: u16, data: &[u8], timeout: Duration) -> DriverResult<()> {
        self.inner.data_write(handle, data, timeout).await?;
        self.emit(|d| d.on_data_sent(handle, data));
        Ok(())
    }

    async fn data_write_by_report_ref(
        &self,
        report_ref: [u8; 2],
        data: &[u8],
        timeout: Duration,
    ) -> DriverResult<()> {
        self.inner
            .data_write_by_report_ref(report_ref, data, timeout)
            .await
    }

    fn name(&self) -> &str {
        "SimulatedDongle"
    }
}
