//! Error types for the BLE central session
//!
//! Errors fall into two families. Local errors (validation and guard
//! failures) are detected before any driver call is issued and never change
//! session state. Driver errors carry the opaque non-zero result code the
//! dongle returned, tagged with the stage that produced it.

use thiserror::Error;

use crate::driver::DriverCode;
use crate::session::SessionState;

/// Main error type for session operations
#[derive(Error, Debug)]
pub enum CentralError {
    // ===== Validation Errors =====
    /// Endpoint label has the wrong shape or a non-hex token
    #[error("Invalid endpoint label '{label}': {reason}")]
    InvalidEndpointLabel {
        /// The rejected label
        label: String,
        /// Why it was rejected
        reason: String,
    },

    /// Write payload contains a token that is not a hex byte
    #[error("Invalid hex payload: token '{token}' is not a byte")]
    InvalidHexPayload {
        /// The offending token
        token: String,
    },

    /// Peer address could not be parsed
    #[error("Invalid peer address: {0}")]
    InvalidAddress(String),

    /// Scan interval/window out of range
    #[error("Invalid scan parameters: {0}")]
    InvalidScanParams(String),

    /// Endpoint label is well-formed but not in the current endpoint list
    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(String),

    /// Address is not in the device registry
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    // ===== Guard Errors =====
    /// Command issued in a state that does not accept it
    #[error("Command '{command}' not accepted in state {state}")]
    InvalidState {
        /// Command name
        command: &'static str,
        /// State at the time of the command
        state: SessionState,
    },

    /// Connect requested without a locked target
    #[error("No connection target selected")]
    NoTarget,

    /// Manual selection attempted while a target is already locked
    #[error("Connection target already locked")]
    TargetAlreadyLocked,

    /// Data I/O requested without a selected endpoint
    #[error("No endpoint selected")]
    NoEndpointSelected,

    /// Dongle has not been initialised
    #[error("Dongle is not initialised")]
    DongleNotReady,

    /// Another request is still in flight on the same endpoint
    #[error("Endpoint {0} already has a pending request")]
    EndpointBusy(String),

    // ===== Driver Errors =====
    /// Driver returned a non-zero result code
    #[error("{stage} failed, code:{code}")]
    Driver {
        /// Command that failed
        stage: &'static str,
        /// Raw driver result code
        code: DriverCode,
    },

    /// Data request did not complete in time
    #[error("{stage} timed out after {timeout_ms}ms")]
    IoTimeout {
        /// Read or write
        stage: &'static str,
        /// Requested timeout in milliseconds
        timeout_ms: u64,
    },

    // ===== Replay Errors =====
    /// Replay script line could not be parsed
    #[error("Replay script line {line}: {reason}")]
    ReplayParse {
        /// 1-based line number
        line: usize,
        /// Parse failure
        reason: String,
    },

    // ===== Configuration Errors =====
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ===== General Errors =====
    /// Session task has stopped
    #[error("Session channel closed")]
    ChannelClosed,

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CentralError {
    /// Errors detected before any driver call; these never change session state
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            CentralError::InvalidEndpointLabel { .. }
                | CentralError::InvalidHexPayload { .. }
                | CentralError::InvalidAddress(_)
                | CentralError::InvalidScanParams(_)
                | CentralError::UnknownEndpoint(_)
                | CentralError::UnknownPeer(_)
                | CentralError::InvalidState { .. }
                | CentralError::NoTarget
                | CentralError::TargetAlreadyLocked
                | CentralError::NoEndpointSelected
                | CentralError::DongleNotReady
                | CentralError::EndpointBusy(_)
        )
    }

    /// Raw driver code, if the dongle reported this failure
    pub fn driver_code(&self) -> Option<DriverCode> {
        match self {
            CentralError::Driver { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            CentralError::InvalidEndpointLabel { .. } => "INVALID_ENDPOINT_LABEL",
            CentralError::InvalidHexPayload { .. } => "INVALID_HEX_PAYLOAD",
            CentralError::InvalidAddress(_) => "INVALID_ADDRESS",
            CentralError::InvalidScanParams(_) => "INVALID_SCAN_PARAMS",
            CentralError::UnknownEndpoint(_) => "UNKNOWN_ENDPOINT",
            CentralError::UnknownPeer(_) => "UNKNOWN_PEER",
            CentralError::InvalidState { .. } => "INVALID_STATE",
            CentralError::NoTarget => "NO_TARGET",
            CentralError::TargetAlreadyLocked => "TARGET_ALREADY_LOCKED",
            CentralError::NoEndpointSelected => "NO_ENDPOINT_SELECTED",
            CentralError::DongleNotReady => "DONGLE_NOT_READY",
            CentralError::EndpointBusy(_) => "ENDPOINT_BUSY",
            CentralError::Driver { .. } => "DRIVER_FAILURE",
            CentralError::IoTimeout { .. } => "IO_TIMEOUT",
            CentralError::ReplayParse { .. } => "REPLAY_PARSE",
            CentralError::InvalidConfig(_) => "INVALID_CONFIG",
            CentralError::ChannelClosed => "CHANNEL_CLOSED",
            CentralError::Io(_) => "IO_ERROR",
            CentralError::Json(_) => "JSON_ERROR",
        }
    }
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, CentralError>;

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for CentralError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        CentralError::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for CentralError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        CentralError::ChannelClosed
    }
}
