//! Data read/write against enabled report endpoints
//!
//! Requests are validated completely before any driver call: the endpoint
//! label must parse and exist, a write payload must be well-formed hex, and
//! the endpoint must not already have a request in flight. The driver call
//! itself runs under an explicit timeout. Result code 0 is success; any
//! other code is handed back verbatim.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::driver::DongleDriver;
use crate::endpoint::{parse_hex_payload, EndpointKey, EndpointTable, ReportEndpoint};
use crate::error::{CentralError, Result};

/// Slack added on top of the driver's own timeout before giving up on it
pub const IO_DEADLINE_SLACK: Duration = Duration::from_millis(250);

/// Direction of a data request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IoDirection {
    /// Read from the endpoint
    Read,
    /// Write to the endpoint
    Write,
}

impl fmt::Display for IoDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoDirection::Read => write!(f, "READ"),
            IoDirection::Write => write!(f, "WRITE"),
        }
    }
}

impl FromStr for IoDirection {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "READ" => Ok(IoDirection::Read),
            "WRITE" => Ok(IoDirection::Write),
            other => Err(format!("unknown direction '{}'", other)),
        }
    }
}

/// A validated request, ready to hand to the driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoRequest {
    /// Read or write
    pub direction: IoDirection,
    /// Target endpoint
    pub endpoint: ReportEndpoint,
    /// Bytes to write (empty for reads)
    pub payload: Vec<u8>,
    /// Timeout passed to the driver
    pub timeout: Duration,
    generation: u64,
}

/// Successful outcome of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoOutcome {
    /// Bytes read
    Read(Bytes),
    /// Number of bytes written
    Written(usize),
}

/// Tracks in-flight requests, one per endpoint
#[derive(Debug, Default)]
pub struct DataIoGateway {
    pending: HashSet<u16>,
    generation: u64,
    timeout: Duration,
}

impl DataIoGateway {
    /// Create a gateway applying `timeout` to every request
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: HashSet::new(),
            generation: 0,
            timeout,
        }
    }

    /// Validate a request against the selected endpoint and mark it pending
    pub fn begin(
        &mut self,
        endpoints: &EndpointTable,
        direction: IoDirection,
        payload_hex: Option<&str>,
    ) -> Result<IoRequest> {
        let endpoint = endpoints
            .selected()
            .cloned()
            .ok_or(CentralError::NoEndpointSelected)?;
        self.begin_on(endpoint, direction, payload_hex)
    }

    /// Validate a request against `endpoint` and mark it pending
    ///
    /// Both forms of an endpoint share one characteristic, so the pending
    /// set is keyed by handle.
    pub fn begin_on(
        &mut self,
        endpoint: ReportEndpoint,
        direction: IoDirection,
        payload_hex: Option<&str>,
    ) -> Result<IoRequest> {
        let payload = match direction {
            IoDirection::Read => Vec::new(),
            IoDirection::Write => parse_hex_payload(payload_hex.unwrap_or_default())?,
        };

        if !self.pending.insert(endpoint.key.handle()) {
            return Err(CentralError::EndpointBusy(endpoint.label));
        }

        debug!(%direction, endpoint = %endpoint.label, len = payload.len(), "Data request accepted");
        Ok(IoRequest {
            direction,
            endpoint,
            payload,
            timeout: self.timeout,
            generation: self.generation,
        })
    }

    /// Whether `request` was started since the last [`DataIoGateway::clear`]
    pub fn is_current(&self, request: &IoRequest) -> bool {
        request.generation == self.generation
    }

    /// Release the endpoint of a finished request
    ///
    /// Requests started before the last [`DataIoGateway::clear`] are ignored
    /// so they cannot release a newer request on the same endpoint. Returns
    /// whether the request was current.
    pub fn finish(&mut self, request: &IoRequest) -> bool {
        let current = self.is_current(request);
        if current {
            self.pending.remove(&request.endpoint.key.handle());
        }
        current
    }

    /// Whether a request is in flight on this endpoint
    pub fn is_pending(&self, key: &EndpointKey) -> bool {
        self.pending.contains(&key.handle())
    }

    /// Number of requests in flight
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Forget every in-flight request
    pub fn clear(&mut self) {
        self.pending.clear();
        self.generation += 1;
    }
}

/// Run a validated request against the driver
pub async fn execute<D: DongleDriver + ?Sized>(driver: &D, request: &IoRequest) -> Result<IoOutcome> {
    let stage = match request.direction {
        IoDirection::Read => "data_read",
        IoDirection::Write => "data_write",
    };
    let deadline = request.timeout + IO_DEADLINE_SLACK;

    let call = async {
        match (request.direction, request.endpoint.key) {
            (IoDirection::Read, EndpointKey::Handle { handle }) => driver
                .data_read(handle, request.timeout)
                .await
                .map(IoOutcome::Read),
            (IoDirection::Read, EndpointKey::ReportRef { report_ref, .. }) => driver
                .data_read_by_report_ref(report_ref, request.timeout)
                .await
                .map(IoOutcome::Read),
            (IoDirection::Write, EndpointKey::Handle { handle }) => driver
                .data_write(handle, &request.payload, request.timeout)
                .await
                .map(|()| IoOutcome::Written(request.payload.len())),
            (IoDirection::Write, EndpointKey::ReportRef { report_ref, .. }) => driver
                .data_write_by_report_ref(report_ref, &request.payload, request.timeout)
                .await
                .map(|()| IoOutcome::Written(request.payload.len())),
        }
    };

    match tokio::time::timeout(deadline, call).await {
        Ok(Ok(outcome)) => Ok(outcome),
        Ok(Err(code)) => Err(CentralError::Driver { stage, code }),
        Err(_) => Err(CentralError::IoTimeout {
            stage,
            timeout_ms: request.timeout.as_millis() as u64,
        }),
    }
}
