//! SessionController - the single serialization point of a session
//!
//! Driver callbacks, user commands and data I/O completions all funnel into
//! one task that owns the [`SessionStateMachine`]. Nothing else touches
//! session state.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐  DriverEvent   ┌───────────────────────┐
//! │ EventDispatcher│───────────────►│                       │
//! │ (driver thread)│                │   SessionController   │
//! └────────────────┘                │                       │
//! ┌────────────────┐ SessionCommand │  SessionStateMachine  │──► DongleDriver
//! │ SessionHandle  │───────────────►│                       │
//! │ (any task)     │◄──── oneshot ──│                       │
//! └────────────────┘                └───────────┬───────────┘
//!         ▲                                     │ spawn
//!         │ broadcast                    ┌──────▼──────┐
//!         └──── SessionNotification      │  data I/O   │── completion ──┐
//!                                        └─────────────┘                │
//!                                                   (back into the loop)┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use nrf_central::{CentralConfig, SessionController, SimulatedDongle};
//!
//! let driver = SimulatedDongle::new();
//! let (controller, handle, dispatcher) =
//!     SessionController::new(driver.clone(), CentralConfig::default())?;
//! driver.attach(dispatcher);
//! tokio::spawn(controller.run());
//!
//! handle.init_dongle().await?;
//! handle.start_scan().await?;
//! ```

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, trace};

use crate::config::CentralConfig;
use crate::dispatcher::{DriverEvent, EventDispatcher};
use crate::driver::DongleDriver;
use crate::endpoint::ReportEndpoint;
use crate::error::Result;
use crate::gateway::{self, IoDirection, IoOutcome, IoRequest};
use crate::notify::SessionNotification;
use crate::peer::ConnectionTarget;
use crate::session::{SessionSnapshot, SessionStateMachine};

/// Capacity of the command queue
const COMMAND_QUEUE_CAPACITY: usize = 64;

type Reply<T> = oneshot::Sender<Result<T>>;

/// Commands accepted by the session task
#[derive(Debug)]
pub enum SessionCommand {
    /// Open the dongle link
    InitDongle(Reply<()>),
    /// Reset the dongle and the session
    ResetDongle(Reply<()>),
    /// Start scanning
    StartScan(Reply<()>),
    /// Stop scanning
    StopScan(Reply<()>),
    /// Lock a peer by address
    SelectPeer {
        /// Address string
        address: String,
        /// Reply channel
        reply: Reply<ConnectionTarget>,
    },
    /// Connect to the target
    Connect(Reply<()>),
    /// Disconnect
    Disconnect(Reply<()>),
    /// Select an endpoint by label
    SelectEndpoint {
        /// Endpoint label
        label: String,
        /// Reply channel
        reply: Reply<ReportEndpoint>,
    },
    /// Read or write
    Io {
        /// Read or write
        direction: IoDirection,
        /// Endpoint to select first; the current selection when absent
        label: Option<String>,
        /// Hex payload for writes
        payload: Option<String>,
        /// Reply channel, answered when the request completes
        reply: Reply<IoOutcome>,
    },
    /// Copy of the session
    Snapshot(oneshot::Sender<SessionSnapshot>),
    /// Release the dongle and stop the task
    Shutdown(oneshot::Sender<()>),
}

/// Handle for talking to a running session
#[derive(Clone)]
pub struct SessionHandle {
    command_tx: mpsc::Sender<SessionCommand>,
    notifications: broadcast::Sender<SessionNotification>,
}

impl SessionHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> SessionCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.command_tx.send(make(tx)).await?;
        rx.await?
    }

    /// Open the serial link to the dongle
    pub async fn init_dongle(&self) -> Result<()> {
        self.request(SessionCommand::InitDongle).await
    }

    /// Reset the dongle; the session returns to `Idle`
    pub async fn reset_dongle(&self) -> Result<()> {
        self.request(SessionCommand::ResetDongle).await
    }

    /// Clear the peer list and start scanning
    pub async fn start_scan(&self) -> Result<()> {
        self.request(SessionCommand::StartScan).await
    }

    /// Stop scanning
    pub async fn stop_scan(&self) -> Result<()> {
        self.request(SessionCommand::StopScan).await
    }

    /// Lock a discovered peer as the connection target
    pub async fn select_peer(&self, address: &str) -> Result<ConnectionTarget> {
        let address = address.to_string();
        self.request(|reply| SessionCommand::SelectPeer { address, reply })
            .await
    }

    /// Connect to the locked target
    pub async fn connect(&self) -> Result<()> {
        self.request(SessionCommand::Connect).await
    }

    /// Drop the link
    pub async fn disconnect(&self) -> Result<()> {
        self.request(SessionCommand::Disconnect).await
    }

    /// Select the endpoint used by [`SessionHandle::read`] and [`SessionHandle::write`]
    pub async fn select_endpoint(&self, label: &str) -> Result<ReportEndpoint> {
        let label = label.to_string();
        self.request(|reply| SessionCommand::SelectEndpoint { label, reply })
            .await
    }

    /// Read from the selected endpoint
    pub async fn read(&self) -> Result<Bytes> {
        match self.io(IoDirection::Read, None, None).await? {
            IoOutcome::Read(data) => Ok(data),
            IoOutcome::Written(_) => Ok(Bytes::new()),
        }
    }

    /// Write a hex payload such as `"01 a0 ff"` to the selected endpoint
    pub async fn write(&self, payload_hex: &str) -> Result<usize> {
        match self
            .io(IoDirection::Write, None, Some(payload_hex.to_string()))
            .await?
        {
            IoOutcome::Written(len) => Ok(len),
            IoOutcome::Read(_) => Ok(0),
        }
    }

    /// Select `label` if it differs from the current selection, then read
    /// or write exactly like a manual request
    pub async fn submit_io_request(
        &self,
        direction: IoDirection,
        label: &str,
        payload_hex: &str,
    ) -> Result<IoOutcome> {
        let payload = match direction {
            IoDirection::Read => None,
            IoDirection::Write => Some(payload_hex.to_string()),
        };
        self.io(direction, Some(label.to_string()), payload).await
    }

    async fn io(
        &self,
        direction: IoDirection,
        label: Option<String>,
        payload: Option<String>,
    ) -> Result<IoOutcome> {
        self.request(|reply| SessionCommand::Io {
            direction,
            label,
            payload,
            reply,
        })
        .await
    }

    /// Copy of the current session
    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.command_tx.send(SessionCommand::Snapshot(tx)).await?;
        Ok(rx.await?)
    }

    /// Receive notifications published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SessionNotification> {
        self.notifications.subscribe()
    }

    /// Release the dongle and stop the session task
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.command_tx.send(SessionCommand::Shutdown(tx)).await?;
        Ok(rx.await?)
    }
}

/// A finished data request on its way back into the loop
struct IoCompletion {
    request: IoRequest,
    result: Result<IoOutcome>,
    reply: Reply<IoOutcome>,
}

/// Task that owns a session
pub struct SessionController<D: DongleDriver + 'static> {
    session: SessionStateMachine<D>,
    event_rx: mpsc::UnboundedReceiver<DriverEvent>,
    command_rx: mpsc::Receiver<SessionCommand>,
    io_tx: mpsc::UnboundedSender<IoCompletion>,
    io_rx: mpsc::UnboundedReceiver<IoCompletion>,
}

impl<D: DongleDriver + 'static> SessionController<D> {
    /// Create a controller, a handle for commands and the dispatcher the
    /// driver delivers callbacks to
    pub fn new(driver: D, config: CentralConfig) -> Result<(Self, SessionHandle, EventDispatcher)> {
        config.validate()?;

        let (dispatcher, event_rx) = EventDispatcher::channel();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let (io_tx, io_rx) = mpsc::unbounded_channel();
        let session = SessionStateMachine::new(Arc::new(driver), &config);

        let handle = SessionHandle {
            command_tx,
            notifications: session.notifier().sender(),
        };

        let controller = Self {
            session,
            event_rx,
            command_rx,
            io_tx,
            io_rx,
        };
        Ok((controller, handle, dispatcher))
    }

    /// Run until shutdown or until every handle is dropped
    ///
    /// Queued driver events are applied before commands, so a command always
    /// sees every callback that arrived ahead of it.
    pub async fn run(mut self) -> Result<()> {
        info!(driver = self.session.driver().name(), "Starting session controller");

        loop {
            tokio::select! {
                biased;

                Some(event) = self.event_rx.recv() => {
                    self.session.handle_event(event).await;
                }

                Some(done) = self.io_rx.recv() => {
                    let result = self.session.complete_io(&done.request, done.result);
                    if done.reply.send(result).is_err() {
                        trace!("I/O requester went away");
                    }
                }

                command = self.command_rx.recv() => {
                    match command {
                        Some(SessionCommand::Shutdown(reply)) => {
                            info!("Session shutdown requested");
                            self.session.shutdown().await;
                            let _ = reply.send(());
                            break;
                        }
                        Some(command) => self.handle_command(command).await,
                        None => {
                            info!("All session handles dropped");
                            self.session.shutdown().await;
                            break;
                        }
                    }
                }
            }
        }

        info!("Session controller stopped");
        Ok(())
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::InitDongle(reply) => {
                let _ = reply.send(self.session.init_dongle().await);
            }
            SessionCommand::ResetDongle(reply) => {
                let _ = reply.send(self.session.reset_dongle().await);
            }
            SessionCommand::StartScan(reply) => {
                let _ = reply.send(self.session.start_scan().await);
            }
            SessionCommand::StopScan(reply) => {
                let _ = reply.send(self.session.stop_scan().await);
            }
            SessionCommand::SelectPeer { address, reply } => {
                let _ = reply.send(self.session.select_peer(&address).await);
            }
            SessionCommand::Connect(reply) => {
                let _ = reply.send(self.session.connect().await);
            }
            SessionCommand::Disconnect(reply) => {
                let _ = reply.send(self.session.disconnect().await);
            }
            SessionCommand::SelectEndpoint { label, reply } => {
                let _ = reply.send(self.session.select_endpoint(&label));
            }
            SessionCommand::Io {
                direction,
                label,
                payload,
                reply,
            } => {
                let begun = match label {
                    Some(label) => {
                        self.session
                            .submit_io_request(direction, &label, payload.as_deref())
                    }
                    None => self.session.begin_io(direction, payload.as_deref()),
                };
                match begun {
                    Ok(request) => self.spawn_io(request, reply),
                    Err(err) => {
                        debug!(error = %err, "Data request rejected");
                        let _ = reply.send(Err(err));
                    }
                }
            }
            SessionCommand::Snapshot(reply) => {
                let _ = reply.send(self.session.snapshot());
            }
            SessionCommand::Shutdown(reply) => {
                let _ = reply.send(());
            }
        }
    }

    /// Run a request off the loop so callbacks keep flowing while it blocks
    fn spawn_io(&self, request: IoRequest, reply: Reply<IoOutcome>) {
        let driver = Arc::clone(self.session.driver());
        let io_tx = self.io_tx.clone();

        tokio::spawn(async move {
            let result = gateway::execute(driver.as_ref(), &request).await;
            if io_tx
                .send(IoCompletion {
                    request,
                    result,
                    reply,
                })
                .is_err()
            {
                trace!("Session stopped before I/O completed");
            }
        });
    }
}
