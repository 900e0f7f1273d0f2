//! BLE Central Session Controller for nRF Connectivity Dongles
//!
//! This crate drives the central role of a Bluetooth Low Energy radio dongle
//! through its command/callback boundary. It sequences scanning, target
//! selection, connection, pairing, service discovery, service enablement
//! and data I/O into one coherent session.
//!
//! # Architecture
//!
//! The session runs in four layers:
//!
//! 1. **Driver Boundary** - [`DongleDriver`] commands out, [`EventDispatcher`] callbacks in
//! 2. **Session Components** - registry, target selection, pairing, services, data I/O
//! 3. **State Machine** - [`SessionStateMachine`] owns all session state
//! 4. **Controller** - [`SessionController`] serializes events and commands onto one task
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use nrf_central::{CentralConfigBuilder, SessionController, SessionNotification, SimulatedDongle};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CentralConfigBuilder::new()
//!         .port("/dev/ttyACM0")
//!         .min_rssi(-60)
//!         .passkey("123456")
//!         .build();
//!
//!     let driver = SimulatedDongle::new();
//!     let (controller, handle, dispatcher) = SessionController::new(driver.clone(), config)?;
//!     driver.attach(dispatcher);
//!     tokio::spawn(controller.run());
//!
//!     let mut notifications = handle.subscribe();
//!     handle.init_dongle().await?;
//!     handle.start_scan().await?;
//!
//!     while let Ok(notification) = notifications.recv().await {
//!         if let SessionNotification::Log(line) = notification {
//!             println!("{}", line);
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Session Flow
//!
//! 1. `init_dongle` opens the serial link
//! 2. `start_scan` clears the peer list and scans
//! 3. The first peer passing the address/RSSI filter is locked (or the user picks one)
//! 4. `connect` issues the connection; pairing starts as soon as the link is up
//! 5. Services are discovered one query at a time, then enabled
//! 6. The report endpoint list is fetched and the session is `Ready`
//! 7. `read`/`write` run against the selected endpoint under a timeout
//!
//! Any driver failure or disconnect resets the session to `Idle`. The peer
//! list survives the reset; only a new scan clears it.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Core modules
pub mod config;
pub mod error;
pub mod peer;

// Driver boundary
pub mod dispatcher;
pub mod driver;

// Session components
pub mod endpoint;
pub mod gateway;
pub mod pairing;
pub mod registry;
pub mod selector;
pub mod services;

// Session orchestration
pub mod controller;
pub mod notify;
pub mod session;

// Collaborators
pub mod replay;

// Testing utilities
pub mod test_utils;

// Re-exports for convenience - core
pub use config::{
    CentralConfig, CentralConfigBuilder, DongleLink, IoConfig, ScanParams, SelectionConfig,
    SelectionMode,
};
pub use error::{CentralError, Result};
pub use peer::{normalize_address, AddressType, ConnectionTarget, DiscoveredPeer, PeerAddress};

// Re-exports for convenience - driver boundary
pub use dispatcher::{DriverEvent, EventDispatcher};
pub use driver::{describe_disconnect_reason, DongleDriver, DriverCode, DriverResult, ReportCharList};

// Re-exports for convenience - session components
pub use endpoint::{format_hex, parse_hex_payload, EndpointKey, EndpointTable, ReportEndpoint};
pub use gateway::{DataIoGateway, IoDirection, IoOutcome, IoRequest};
pub use pairing::{
    AuthConfig, AuthOutcome, IoCapabilities, KeyDistribution, KeyRole, PairingCoordinator, Passkey,
    SecurityParams,
};
pub use registry::DeviceRegistry;
pub use selector::TargetSelector;
pub use services::{default_service_queries, ServiceEnumerator, ServiceQuery};

// Re-exports for convenience - orchestration
pub use controller::{SessionCommand, SessionController, SessionHandle};
pub use notify::{LogLine, SessionLog, SessionNotification};
pub use session::{SessionSnapshot, SessionState, SessionStateMachine};

// Re-exports for convenience - collaborators and testing
pub use replay::{ReplayReport, ReplayScript, ReplayStep};
pub use test_utils::{mock_session, DriverCall, MockDongle, SimulatedDongle, SimulatedPeer};

// Protocol constants re-exports
pub use config::{
    DEFAULT_BAUD_RATE, DEFAULT_IO_TIMEOUT_MS, MAX_REPORT_ENTRIES, MAX_REPORT_REF_BYTES,
};
pub use driver::{
    REASON_LOCAL_HOST_TERMINATED, REASON_REMOTE_USER_TERMINATED, REASON_SUPERVISION_TIMEOUT,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
