//! Command boundary to the radio dongle
//!
//! The dongle driver owns the serial transport, the BLE stack and the
//! security primitives. The session only calls into it through
//! [`DongleDriver`] and learns about completions through
//! [`crate::dispatcher::EventDispatcher`].
//!
//! Every command returns a numeric result code in the underlying driver,
//! where `0` means success. Here that is modelled as
//! [`DriverResult`]: `Ok` for success, `Err(DriverCode)` carrying the opaque
//! non-zero code otherwise.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::config::ScanParams;
use crate::pairing::{IoCapabilities, Passkey, SecurityParams};
use crate::peer::PeerAddress;
use crate::services::ServiceQuery;

/// Peer closed the connection
pub const REASON_REMOTE_USER_TERMINATED: u8 = 0x13;

/// This host closed the connection
pub const REASON_LOCAL_HOST_TERMINATED: u8 = 0x16;

/// Link supervision timeout
pub const REASON_SUPERVISION_TIMEOUT: u8 = 0x08;

/// Non-zero result code reported by the dongle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DriverCode(u32);

impl DriverCode {
    /// Wrap a raw code
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw numeric value
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Map a raw result code to a [`DriverResult`]
    pub fn check(raw: u32) -> DriverResult<()> {
        if raw == 0 {
            Ok(())
        } else {
            Err(DriverCode(raw))
        }
    }
}

impl fmt::Display for DriverCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of a driver command
pub type DriverResult<T> = std::result::Result<T, DriverCode>;

/// Raw report characteristic list as returned by the dongle
///
/// `handles[i]` pairs with `refs[2 * i..2 * i + 2]`. `count` is what the
/// driver claims; it is not trusted beyond the lengths of the two buffers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportCharList {
    /// Attribute handles
    pub handles: Vec<u16>,
    /// Report reference bytes, two per handle
    pub refs: Vec<u8>,
    /// Number of entries the driver reported
    pub count: usize,
}

/// Render a disconnect reason for log lines
pub fn describe_disconnect_reason(reason: u8) -> String {
    match reason {
        REASON_REMOTE_USER_TERMINATED => "remote user terminated (0x13)".to_string(),
        REASON_LOCAL_HOST_TERMINATED => "local host terminated (0x16)".to_string(),
        REASON_SUPERVISION_TIMEOUT => "supervision timeout (0x08)".to_string(),
        other => format!("reason 0x{:02X}", other),
    }
}

/// Commands the session issues to the dongle
///
/// Scan, connect, authentication and service commands only start an
/// operation; completion arrives later as a callback. Data reads and writes
/// block up to the given timeout.
#[async_trait]
pub trait DongleDriver: Send + Sync {
    /// Open the serial link and bring up the BLE stack
    async fn dongle_init(&self, port: &str, baud_rate: u32) -> DriverResult<()>;

    /// Reset the dongle
    async fn dongle_reset(&self) -> DriverResult<()>;

    /// Disconnect the current peer
    async fn dongle_disconnect(&self) -> DriverResult<()>;

    /// Start scanning for advertisements
    async fn scan_start(&self, params: &ScanParams) -> DriverResult<()>;

    /// Stop scanning
    async fn scan_stop(&self) -> DriverResult<()>;

    /// Start connecting to a peer
    async fn conn_start(&self, address: &PeerAddress) -> DriverResult<()>;

    /// Set security parameters for one key-distribution role
    async fn auth_set_params(&self, params: &SecurityParams) -> DriverResult<()>;

    /// Start authentication
    async fn auth_start(
        &self,
        bond: bool,
        keypress: bool,
        io_caps: IoCapabilities,
        passkey: Option<&Passkey>,
    ) -> DriverResult<()>;

    /// Start discovery of one primary service
    async fn service_discovery_start(&self, query: ServiceQuery) -> DriverResult<()>;

    /// Enable notifications on every discovered characteristic
    async fn service_enable_start(&self) -> DriverResult<()>;

    /// Fetch up to `max_handles` report characteristics
    async fn report_char_list(
        &self,
        max_handles: usize,
        max_ref_bytes: usize,
    ) -> DriverResult<ReportCharList>;

    /// Read a characteristic by attribute handle
    async fn data_read(&self, handle: u16, timeout: Duration) -> DriverResult<Bytes>;

    /// Read a report characteristic by its report reference
    async fn data_read_by_report_ref(
        &self,
        report_ref: [u8; 2],
        timeout: Duration,
    ) -> DriverResult<Bytes>;

    /// Write a characteristic by attribute handle
    async fn data_write(&self, handle: u16, data: &[u8], timeout: Duration) -> DriverResult<()>;

    /// Write a report characteristic by its report reference
    async fn data_write_by_report_ref(
        &self,
        report_ref: [u8; 2],
        data: &[u8],
        timeout: Duration,
    ) -> DriverResult<()>;

    /// Driver name (for logging)
    fn name(&self) -> &str;
}
