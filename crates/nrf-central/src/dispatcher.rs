//! Callback boundary from the dongle
//!
//! The driver fires callbacks on its own thread. [`EventDispatcher`] turns
//! each callback into a [`DriverEvent`] and queues it for the session task,
//! which is the only consumer. Queue order is arrival order.

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::trace;

use crate::peer::{AddressType, PeerAddress, ADDRESS_LEN};

/// A callback from the dongle, queued for the session task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    /// Advertisement received while scanning
    Discovered {
        /// Address as formatted by the dongle
        address_label: String,
        /// Advertised name, possibly empty
        name: String,
        /// Address and type tag
        address: PeerAddress,
        /// Signal strength in dBm
        rssi: i8,
    },
    /// Link established
    Connected {
        /// Address of the connected peer
        address: PeerAddress,
    },
    /// Passkey to show to the user
    PasskeyRequired {
        /// Passkey digits
        passkey: String,
    },
    /// Authentication finished
    Authenticated {
        /// 0 on success
        status: u8,
    },
    /// One service discovery query finished
    ServiceDiscovered {
        /// Last attribute handle of the service
        last_handle: u16,
        /// Characteristics found in the service
        char_count: u16,
    },
    /// Service enablement finished
    ServiceEnabled {
        /// Characteristics enabled
        count: u16,
    },
    /// Link closed
    Disconnected {
        /// HCI reason code
        reason: u8,
    },
    /// A multi-step operation failed inside the driver
    Failed {
        /// Stage that failed
        stage: String,
    },
    /// Notification or indication data from the peer
    DataReceived {
        /// Attribute handle
        handle: u16,
        /// Payload
        data: Bytes,
    },
    /// Write confirmed by the peer
    DataSent {
        /// Attribute handle
        handle: u16,
        /// Payload
        data: Bytes,
    },
}

impl DriverEvent {
    /// Short event name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            DriverEvent::Discovered { .. } => "discovered",
            DriverEvent::Connected { .. } => "connected",
            DriverEvent::PasskeyRequired { .. } => "passkey_required",
            DriverEvent::Authenticated { .. } => "authenticated",
            DriverEvent::ServiceDiscovered { .. } => "service_discovered",
            DriverEvent::ServiceEnabled { .. } => "service_enabled",
            DriverEvent::Disconnected { .. } => "disconnected",
            DriverEvent::Failed { .. } => "failed",
            DriverEvent::DataReceived { .. } => "data_received",
            DriverEvent::DataSent { .. } => "data_sent",
        }
    }
}

/// Thread-safe sink for driver callbacks
///
/// Cloneable and usable from any thread without a runtime. Events sent
/// after the session task has stopped are dropped.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    tx: mpsc::UnboundedSender<DriverEvent>,
}

impl EventDispatcher {
    /// Create a dispatcher and the receiving end for the session task
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DriverEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue an event
    pub fn dispatch(&self, event: DriverEvent) {
        if let Err(err) = self.tx.send(event) {
            trace!(kind = err.0.kind(), "Session stopped, dropping driver event");
        }
    }

    /// Whether the session task is still receiving
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// `on_discovered(addrString, name, addrType, addr[6], rssi)`
    pub fn on_discovered(
        &self,
        address_label: &str,
        name: &str,
        address_type: u8,
        address: [u8; ADDRESS_LEN],
        rssi: i8,
    ) {
        self.dispatch(DriverEvent::Discovered {
            address_label: address_label.to_string(),
            name: name.to_string(),
            address: PeerAddress::new(AddressType::from(address_type), address),
            rssi,
        });
    }

    /// `on_connected(addrType, addr[6])`
    pub fn on_connected(&self, address_type: u8, address: [u8; ADDRESS_LEN]) {
        self.dispatch(DriverEvent::Connected {
            address: PeerAddress::new(AddressType::from(address_type), address),
        });
    }

    /// `on_passkey_required(passkey)`
    pub fn on_passkey_required(&self, passkey: &str) {
        self.dispatch(DriverEvent::PasskeyRequired {
            passkey: passkey.to_string(),
        });
    }

    /// `on_authenticated(status)`
    pub fn on_authenticated(&self, status: u8) {
        self.dispatch(DriverEvent::Authenticated { status });
    }

    /// `on_service_discovered(lastHandle, charCount)`
    pub fn on_service_discovered(&self, last_handle: u16, char_count: u16) {
        self.dispatch(DriverEvent::ServiceDiscovered {
            last_handle,
            char_count,
        });
    }

    /// `on_service_enabled(count)`
    pub fn on_service_enabled(&self, count: u16) {
        self.dispatch(DriverEvent::ServiceEnabled { count });
    }

    /// `on_disconnected(reason)`
    pub fn on_disconnected(&self, reason: u8) {
        self.dispatch(DriverEvent::Disconnected { reason });
    }

    /// `on_failed(stage)`
    pub fn on_failed(&self, stage: &str) {
        self.dispatch(DriverEvent::Failed {
            stage: stage.to_string(),
        });
    }

    /// `on_data_received(handle, bytes, len)`
    pub fn on_data_received(&self, handle: u16, data: &[u8]) {
        self.dispatch(DriverEvent::DataReceived {
            handle,
            data: Bytes::copy_from_slice(data),
        });
    }

    /// `on_data_sent(handle, bytes, len)`
    pub fn on_data_sent(&self, handle: u16, data: &[u8]) {
        self.dispatch(DriverEvent::DataSent {
            handle,
            data: Bytes::copy_from_slice(data),
        });
    }
}
