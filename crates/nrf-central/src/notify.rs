//! Outward notifications and the numbered session log
//!
//! Everything the presentation layer sees is an owned snapshot sent over a
//! broadcast channel; nothing handed out here aliases session state.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::fmt;
use tokio::sync::broadcast;
use tracing::{info, trace};

use crate::endpoint::ReportEndpoint;
use crate::peer::{ConnectionTarget, DiscoveredPeer};
use crate::session::SessionState;

/// One line of the user-visible session log
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLine {
    /// Sequence number, starting at 1
    pub seq: u64,
    /// Local wall-clock time the line was written
    pub timestamp: DateTime<Local>,
    /// Message text
    pub message: String,
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {}",
            self.seq,
            self.timestamp.format("%M:%S%.3f"),
            self.message
        )
    }
}

/// Generates sequentially numbered, timestamped log lines
#[derive(Debug, Default)]
pub struct SessionLog {
    next_seq: u64,
}

impl SessionLog {
    /// Create a log starting at line 1
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce the next line
    pub fn line(&mut self, message: impl Into<String>) -> LogLine {
        self.next_seq += 1;
        LogLine {
            seq: self.next_seq,
            timestamp: Local::now(),
            message: message.into(),
        }
    }

    /// Number of lines written so far
    pub fn written(&self) -> u64 {
        self.next_seq
    }
}

/// Notifications published to the presentation layer
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionNotification {
    /// Session state changed
    StateChanged {
        /// Previous state
        from: SessionState,
        /// New state
        to: SessionState,
    },

    /// Discovered peer list changed
    PeersChanged {
        /// Registry contents in first-seen order
        peers: Vec<DiscoveredPeer>,
    },

    /// A connection target was locked
    TargetLocked {
        /// The locked target
        target: ConnectionTarget,
    },

    /// The dongle wants this passkey shown to the user
    PasskeyDisplay {
        /// Passkey digits
        passkey: String,
    },

    /// Authentication failed; link stays up
    AuthenticationFailed {
        /// Status reported by the dongle
        status: u8,
    },

    /// Endpoint list or selection changed
    EndpointsChanged {
        /// Endpoints in dongle order
        endpoints: Vec<ReportEndpoint>,
        /// Selected endpoint label
        selected: Option<String>,
    },

    /// A read completed successfully
    ReadCompleted {
        /// Endpoint label
        endpoint: String,
        /// Bytes read
        data: Vec<u8>,
    },

    /// A write completed successfully
    WriteCompleted {
        /// Endpoint label
        endpoint: String,
        /// Bytes written
        len: usize,
    },

    /// Unsolicited data from the peer
    DataReceived {
        /// Attribute handle
        handle: u16,
        /// Payload
        data: Vec<u8>,
    },

    /// The dongle confirmed data was sent
    DataSent {
        /// Attribute handle
        handle: u16,
        /// Payload
        data: Vec<u8>,
    },

    /// A session log line
    Log(LogLine),
}

/// Publishes notifications and keeps the log numbering
#[derive(Debug)]
pub struct Notifier {
    tx: broadcast::Sender<SessionNotification>,
    log: SessionLog,
}

impl Notifier {
    /// Create a notifier with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            log: SessionLog::new(),
        }
    }

    /// New receiver for notifications published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SessionNotification> {
        self.tx.subscribe()
    }

    /// Sending half, for handles that hand out receivers
    pub fn sender(&self) -> broadcast::Sender<SessionNotification> {
        self.tx.clone()
    }

    /// Publish a notification; dropped silently when nobody listens
    pub fn publish(&self, notification: SessionNotification) {
        if self.tx.send(notification).is_err() {
            trace!("No notification subscribers");
        }
    }

    /// Append a log line, mirror it to tracing and publish it
    pub fn log(&mut self, message: impl Into<String>) -> LogLine {
        let line = self.log.line(message);
        info!(seq = line.seq, "{}", line.message);
        self.publish(SessionNotification::Log(line.clone()));
        line
    }
}
