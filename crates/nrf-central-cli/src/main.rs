//! nrf-central - interactive console for a BLE central session
//!
//! This binary runs one session over the in-process simulated dongle:
//! - Commands typed on stdin go through the session handle
//! - Session log lines and results are printed as they are published
//! - `--replay` runs a replay script against a session brought up to `Ready`

mod console;

use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use console::{ConsoleCommand, HELP};
use nrf_central::{
    format_hex, CentralConfig, IoDirection, IoOutcome, ReplayScript, SelectionMode,
    SessionController, SessionHandle, SessionNotification, SessionState, SimulatedDongle,
};

/// How long `--replay` waits for the session to reach `Ready`
const READY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "nrf-central")]
#[command(about = "BLE central session console for nRF connectivity dongles")]
struct Args {
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Serial port of the dongle
    #[arg(long)]
    port: Option<String>,

    /// Baud rate of the dongle link
    #[arg(long)]
    baud: Option<u32>,

    /// Only accept this peer address
    #[arg(long)]
    address: Option<String>,

    /// Minimum RSSI in dBm for a peer to be accepted
    #[arg(long, allow_hyphen_values = true)]
    min_rssi: Option<i8>,

    /// Pick the target by hand instead of filtering
    #[arg(long)]
    manual: bool,

    /// Connect as soon as a target is locked
    #[arg(long)]
    auto_connect: bool,

    /// Fixed pairing passkey (sanitized to 6 digits)
    #[arg(long)]
    passkey: Option<String>,

    /// Run this replay script and exit
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long, short)]
    verbose: bool,
}

impl Args {
    fn build_config(&self) -> anyhow::Result<CentralConfig> {
        let mut config = match &self.config {
            Some(path) => CentralConfig::from_json_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => CentralConfig::default(),
        };

        if let Some(port) = &self.port {
            config.link.port = port.clone();
        }
        if let Some(baud) = self.baud {
            config.link.baud_rate = baud;
        }
        if let Some(address) = &self.address {
            config.selection.address = Some(address.clone());
        }
        if let Some(min_rssi) = self.min_rssi {
            config.selection.min_rssi = min_rssi;
        }
        if self.manual {
            config.selection.mode = SelectionMode::Manual;
        }
        if self.auto_connect || self.replay.is_some() {
            config.selection.auto_connect = true;
        }
        if let Some(passkey) = &self.passkey {
            config.auth.passkey = Some(nrf_central::Passkey::sanitize(passkey));
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Session log lines go to stdout; diagnostics go to stderr
    let default_level = if args.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = args.build_config()?;
    info!(port = %config.link.port, baud = config.link.baud_rate, "Starting nrf-central");

    let driver = SimulatedDongle::new();
    let (controller, handle, dispatcher) = SessionController::new(driver.clone(), config)?;
    driver.attach(dispatcher);
    let session_task = tokio::spawn(controller.run());

    let printer = tokio::spawn(print_notifications(handle.subscribe()));

    let result = match &args.replay {
        Some(path) => run_replay(&handle, path).await,
        None => run_console(&handle).await,
    };

    handle.shutdown().await?;
    session_task.await??;
    printer.abort();
    result
}

async fn print_notifications(mut rx: broadcast::Receiver<SessionNotification>) {
    loop {
        match rx.recv().await {
            Ok(SessionNotification::Log(line)) => println!("{}", line),
            Ok(SessionNotification::PasskeyDisplay { passkey }) => {
                println!(">> passkey: {}", passkey)
            }
            Ok(SessionNotification::PeersChanged { peers }) => {
                for (i, peer) in peers.iter().enumerate() {
                    println!("   [{}] {}", i, peer.label());
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Console fell behind on notifications");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn run_console(handle: &SessionHandle) -> anyhow::Result<()> {
    println!("nrf-central {} - type 'help' for commands", nrf_central::VERSION);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let command = match ConsoleCommand::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(message) => {
                println!("{}", message);
                continue;
            }
        };
        if command == ConsoleCommand::Quit {
            break;
        }
        if let Err(err) = execute(handle, command).await {
            println!("error: {}", err);
        }
    }
    Ok(())
}

async fn execute(handle: &SessionHandle, command: ConsoleCommand) -> anyhow::Result<()> {
    match command {
        ConsoleCommand::Help => println!("{}", HELP),
        ConsoleCommand::Init => handle.init_dongle().await?,
        ConsoleCommand::Scan => handle.start_scan().await?,
        ConsoleCommand::Stop => handle.stop_scan().await?,
        ConsoleCommand::Select(address) => {
            let target = handle.select_peer(&address).await?;
            println!("target {}", target.address_label);
        }
        ConsoleCommand::Connect => handle.connect().await?,
        ConsoleCommand::Disconnect => handle.disconnect().await?,
        ConsoleCommand::Endpoint(label) => {
            handle.select_endpoint(&label).await?;
        }
        ConsoleCommand::Read(label) => {
            let outcome = match label {
                Some(label) => {
                    handle
                        .submit_io_request(IoDirection::Read, &label, "")
                        .await?
                }
                None => IoOutcome::Read(handle.read().await?),
            };
            print_outcome(&outcome);
        }
        ConsoleCommand::Write { label, payload } => {
            let outcome = match label {
                Some(label) => {
                    handle
                        .submit_io_request(IoDirection::Write, &label, &payload)
                        .await?
                }
                None => IoOutcome::Written(handle.write(&payload).await?),
            };
            print_outcome(&outcome);
        }
        ConsoleCommand::Replay(path) => {
            let script = ReplayScript::load(&path).await?;
            report_replay(&script.run(handle).await);
        }
        ConsoleCommand::Status => {
            let snapshot = handle.snapshot().await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        ConsoleCommand::Reset => handle.reset_dongle().await?,
        ConsoleCommand::Quit => {}
    }
    Ok(())
}

fn print_outcome(outcome: &IoOutcome) {
    match outcome {
        IoOutcome::Read(data) => println!("<< {}", format_hex(data)),
        IoOutcome::Written(len) => println!(">> {} bytes written", len),
    }
}

fn report_replay(report: &nrf_central::ReplayReport) {
    for step in &report.completed {
        print!("{}: ", step.caption);
        print_outcome(&step.outcome);
    }
    if let Some(failure) = &report.failure {
        println!(
            "replay stopped at step {} ({}): {}",
            failure.index + 1,
            failure.caption,
            failure.error
        );
    }
}

/// Bring the session up with auto-connect, run the script, report
async fn run_replay(handle: &SessionHandle, path: &Path) -> anyhow::Result<()> {
    let script = ReplayScript::load(path).await?;

    handle.init_dongle().await?;
    handle.start_scan().await?;

    let deadline = tokio::time::Instant::now() + READY_TIMEOUT;
    loop {
        let snapshot = handle.snapshot().await?;
        if snapshot.state == SessionState::Ready {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("session did not become ready (state {})", snapshot.state);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let report = script.run(handle).await;
    report_replay(&report);
    if let Some(failure) = report.failure {
        return Err(failure.error.into());
    }
    Ok(())
}
