//! Integration tests for the BLE central session
//!
//! These tests drive a full `SessionController` through its handle with a
//! recording mock dongle and hand-injected callbacks, covering:
//! - Discovery upsert and target locking
//! - The connect, pair, discover, enable path to `Ready`
//! - Reset on disconnect and driver failure
//! - Data I/O, pending-request rejection and timeouts
//! - Replay scripts and the simulated dongle

use nrf_central::{
    mock_session, CentralConfig, CentralConfigBuilder, CentralError, DriverCall, DriverCode,
    EndpointKey, EventDispatcher, IoDirection, IoOutcome, MockDongle, Passkey, ReplayScript,
    SelectionMode, SessionController, SessionHandle, SessionNotification, SessionState,
    SimulatedDongle,
};
use std::time::Duration;
use tokio::sync::broadcast;

// ============================================================================
// Test Infrastructure
// ============================================================================

fn address(last: u8) -> [u8; 6] {
    [0x11, 0x22, 0x33, 0x44, 0x55, last]
}

fn label(last: u8) -> String {
    format!("1122334455{:02X}", last)
}

fn advertise(dispatcher: &EventDispatcher, last: u8, name: &str, rssi: i8) {
    dispatcher.on_discovered(&label(last), name, 0, address(last), rssi);
}

fn start(config: CentralConfig) -> (SessionHandle, EventDispatcher, MockDongle) {
    let (controller, handle, dispatcher, driver) = mock_session(config).unwrap();
    tokio::spawn(controller.run());
    (handle, dispatcher, driver)
}

async fn scanning(config: CentralConfig) -> (SessionHandle, EventDispatcher, MockDongle) {
    let (handle, dispatcher, driver) = start(config);
    handle.init_dongle().await.unwrap();
    handle.start_scan().await.unwrap();
    (handle, dispatcher, driver)
}

/// Scan, lock peer 1, connect and report the link up
async fn authenticating(config: CentralConfig) -> (SessionHandle, EventDispatcher, MockDongle) {
    let (handle, dispatcher, driver) = scanning(config).await;
    advertise(&dispatcher, 1, "Remote", -40);
    handle.connect().await.unwrap();
    dispatcher.on_connected(0, address(1));

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Authenticating);
    (handle, dispatcher, driver)
}

/// Run the whole happy path with `endpoints` report entries
async fn ready(endpoints: usize) -> (SessionHandle, EventDispatcher, MockDongle) {
    let (handle, dispatcher, driver) = authenticating(CentralConfig::default()).await;
    driver.set_report_entries(endpoints);

    dispatcher.on_authenticated(0);
    for i in 0..3u16 {
        dispatcher.on_service_discovered(0x10 * (i + 1) + 0x0F, 2);
    }
    dispatcher.on_service_enabled(endpoints as u16);

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Ready);
    (handle, dispatcher, driver)
}

fn drain(rx: &mut broadcast::Receiver<SessionNotification>) -> Vec<SessionNotification> {
    let mut out = Vec::new();
    while let Ok(notification) = rx.try_recv() {
        out.push(notification);
    }
    out
}

fn states(notifications: &[SessionNotification]) -> Vec<SessionState> {
    notifications
        .iter()
        .filter_map(|n| match n {
            SessionNotification::StateChanged { to, .. } => Some(to.clone()),
            _ => None,
        })
        .collect()
}

// ============================================================================
// Discovery and Target Selection
// ============================================================================

#[tokio::test]
async fn test_repeat_sightings_upsert_one_entry() {
    let config = CentralConfigBuilder::new()
        .selection_mode(SelectionMode::Manual)
        .build();
    let (handle, dispatcher, _driver) = scanning(config).await;

    advertise(&dispatcher, 1, "", -70);
    advertise(&dispatcher, 1, "Remote", -50);
    advertise(&dispatcher, 1, "", -65);

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.peers.len(), 1);
    assert_eq!(snapshot.peers[0].rssi, -65);
    assert_eq!(snapshot.peers[0].name.as_deref(), Some("Remote"));
    assert_eq!(snapshot.state, SessionState::Scanning);
}

#[tokio::test]
async fn test_rssi_threshold_locks_on_second_sighting() {
    let config = CentralConfigBuilder::new().min_rssi(-50).build();
    let (handle, dispatcher, driver) = scanning(config).await;

    advertise(&dispatcher, 1, "Remote", -60);
    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Scanning);
    assert!(snapshot.target.is_none());

    advertise(&dispatcher, 1, "Remote", -40);
    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Discovered);
    assert_eq!(snapshot.target.unwrap().address_label, label(1));
    assert_eq!(driver.count("scan_stop"), 1);
}

#[tokio::test]
async fn test_locked_target_ignores_later_sightings() {
    let (handle, dispatcher, driver) = scanning(CentralConfig::default()).await;

    advertise(&dispatcher, 1, "First", -80);
    advertise(&dispatcher, 2, "Stronger", -10);
    advertise(&dispatcher, 1, "First", -5);

    let snapshot = handle.snapshot().await.unwrap();
    let target = snapshot.target.unwrap();
    assert_eq!(target.address.bytes, address(1));
    assert_eq!(snapshot.peers.len(), 2);
    assert_eq!(driver.count("scan_stop"), 1);
}

#[tokio::test]
async fn test_address_filter_ignores_separators_and_case() {
    let config = CentralConfigBuilder::new()
        .target_address("11:22:33:44:55:0a")
        .build();
    let (handle, dispatcher, _driver) = scanning(config).await;

    advertise(&dispatcher, 0x09, "", -20);
    advertise(&dispatcher, 0x0A, "", -90);

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.target.unwrap().address.bytes, address(0x0A));
}

#[tokio::test]
async fn test_manual_selection() {
    let config = CentralConfigBuilder::new()
        .selection_mode(SelectionMode::Manual)
        .build();
    let (handle, dispatcher, driver) = scanning(config).await;

    advertise(&dispatcher, 1, "", -40);
    advertise(&dispatcher, 2, "", -30);
    assert_eq!(handle.snapshot().await.unwrap().state, SessionState::Scanning);

    let target = handle.select_peer("11-22-33-44-55-02").await.unwrap();
    assert_eq!(target.address.bytes, address(2));
    assert_eq!(driver.count("scan_stop"), 1);
    assert_eq!(handle.snapshot().await.unwrap().state, SessionState::Discovered);

    let err = handle.select_peer(&label(1)).await.unwrap_err();
    assert!(matches!(err, CentralError::TargetAlreadyLocked));
}

#[tokio::test]
async fn test_select_unknown_peer_rejected() {
    let config = CentralConfigBuilder::new()
        .selection_mode(SelectionMode::Manual)
        .build();
    let (handle, _dispatcher, driver) = scanning(config).await;
    driver.clear_calls();

    let err = handle.select_peer("AABBCCDDEEFF").await.unwrap_err();
    assert!(matches!(err, CentralError::UnknownPeer(_)));
    assert!(driver.calls().is_empty());
}

#[tokio::test]
async fn test_stop_scan_keeps_peers() {
    let config = CentralConfigBuilder::new().min_rssi(0).build();
    let (handle, dispatcher, driver) = scanning(config).await;
    advertise(&dispatcher, 1, "", -40);

    handle.stop_scan().await.unwrap();
    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Idle);
    assert_eq!(snapshot.peers.len(), 1);
    assert_eq!(driver.count("scan_stop"), 1);
}

#[tokio::test]
async fn test_auto_connect_on_lock() {
    let config = CentralConfigBuilder::new().auto_connect(true).build();
    let (handle, dispatcher, driver) = scanning(config).await;

    advertise(&dispatcher, 3, "Remote", -40);

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Connecting);
    assert_eq!(driver.count("conn_start"), 1);
}

#[tokio::test]
async fn test_no_auto_connect_by_default() {
    let (handle, dispatcher, driver) = scanning(CentralConfig::default()).await;
    advertise(&dispatcher, 3, "Remote", -40);

    assert_eq!(handle.snapshot().await.unwrap().state, SessionState::Discovered);
    assert_eq!(driver.count("conn_start"), 0);
}

// ============================================================================
// Connection, Pairing and Services
// ============================================================================

#[tokio::test]
async fn test_happy_path_reaches_ready() {
    let (handle, _dispatcher, driver) = ready(4).await;

    let snapshot = handle.snapshot().await.unwrap();
    assert!(snapshot.connected);
    assert!(snapshot.authenticated);
    assert_eq!(snapshot.endpoints.len(), 4);
    assert_eq!(snapshot.selected_endpoint.as_deref(), Some("01 01 0010"));

    let commands: Vec<&str> = driver.calls().iter().map(|c| c.command()).collect();
    assert_eq!(
        commands,
        vec![
            "dongle_init",
            "scan_start",
            "scan_stop",
            "conn_start",
            "auth_set_params",
            "auth_set_params",
            "auth_start",
            "service_discovery_start",
            "service_discovery_start",
            "service_discovery_start",
            "service_enable_start",
            "report_char_list",
        ]
    );
}

#[tokio::test]
async fn test_passkey_is_sanitized_before_auth_start() {
    let config = CentralConfigBuilder::new().passkey("12a45b").build();
    let (_handle, _dispatcher, driver) = authenticating(config).await;

    let passkey = driver.calls().into_iter().find_map(|c| match c {
        DriverCall::AuthStart { passkey, .. } => passkey,
        _ => None,
    });
    assert_eq!(passkey.as_deref(), Some("120450"));
    assert_eq!(Passkey::sanitize("12").as_str(), "120000");
}

#[tokio::test]
async fn test_passkey_display_is_published() {
    let (handle, dispatcher, _driver) = authenticating(CentralConfig::default()).await;
    let mut rx = handle.subscribe();

    dispatcher.on_passkey_required("654321");
    handle.snapshot().await.unwrap();

    assert!(drain(&mut rx).iter().any(|n| matches!(
        n,
        SessionNotification::PasskeyDisplay { passkey } if passkey == "654321"
    )));
}

#[tokio::test]
async fn test_auth_failure_keeps_link_without_retry() {
    let (handle, dispatcher, driver) = authenticating(CentralConfig::default()).await;
    let mut rx = handle.subscribe();

    dispatcher.on_authenticated(0x85);

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Authenticating);
    assert!(snapshot.connected);
    assert!(!snapshot.authenticated);
    assert_eq!(snapshot.auth_failure, Some(0x85));
    assert_eq!(driver.count("auth_start"), 1);
    assert_eq!(driver.count("service_discovery_start"), 0);
    assert!(drain(&mut rx)
        .iter()
        .any(|n| matches!(n, SessionNotification::AuthenticationFailed { status: 0x85 })));

    handle.disconnect().await.unwrap();
    assert_eq!(handle.snapshot().await.unwrap().state, SessionState::Disconnecting);
    assert_eq!(driver.count("dongle_disconnect"), 1);
}

#[tokio::test]
async fn test_stray_service_discovered_is_ignored() {
    let (handle, dispatcher, driver) = authenticating(CentralConfig::default()).await;

    dispatcher.on_service_discovered(0x1F, 2);
    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Authenticating);
    assert_eq!(driver.count("service_discovery_start"), 0);

    dispatcher.on_authenticated(0);
    dispatcher.on_service_discovered(0x1F, 2);
    assert_eq!(
        handle.snapshot().await.unwrap().state,
        SessionState::DiscoveringServices(1)
    );
}

#[tokio::test]
async fn test_stray_service_discovered_in_ready() {
    let (handle, dispatcher, driver) = ready(2).await;

    dispatcher.on_service_discovered(0x4F, 1);
    dispatcher.on_service_enabled(2);

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Ready);
    assert_eq!(driver.count("service_discovery_start"), 3);
    assert_eq!(driver.count("report_char_list"), 1);
}

// ============================================================================
// Reset and Failure Handling
// ============================================================================

#[tokio::test]
async fn test_disconnect_reset_is_idempotent() {
    let (handle, dispatcher, _driver) = ready(2).await;

    dispatcher.on_disconnected(0x13);
    let first = handle.snapshot().await.unwrap();
    assert_eq!(first.state, SessionState::Idle);
    assert!(first.target.is_none());
    assert!(!first.connected);
    assert!(!first.authenticated);
    assert!(first.endpoints.is_empty());
    assert_eq!(first.peers.len(), 1);

    dispatcher.on_disconnected(0x13);
    assert_eq!(handle.snapshot().await.unwrap(), first);

    dispatcher.on_failed("conn_start");
    assert_eq!(handle.snapshot().await.unwrap(), first);
}

#[tokio::test]
async fn test_only_start_scan_clears_registry() {
    let (handle, dispatcher, _driver) = ready(2).await;
    dispatcher.on_failed("service_enable");
    assert_eq!(handle.snapshot().await.unwrap().peers.len(), 1);

    handle.start_scan().await.unwrap();
    assert!(handle.snapshot().await.unwrap().peers.is_empty());
}

#[tokio::test]
async fn test_failed_command_resets_through_failed_state() {
    let (handle, dispatcher, driver) = scanning(CentralConfig::default()).await;
    advertise(&dispatcher, 1, "", -40);
    assert_eq!(handle.snapshot().await.unwrap().state, SessionState::Discovered);
    let mut rx = handle.subscribe();
    driver.fail_next("conn_start", DriverCode::new(8));

    let err = handle.connect().await.unwrap_err();
    assert_eq!(err.driver_code(), Some(DriverCode::new(8)));

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Idle);
    assert!(snapshot.target.is_none());
    assert_eq!(snapshot.peers.len(), 1);
    assert_eq!(
        states(&drain(&mut rx)),
        vec![
            SessionState::Failed("conn_start".to_string()),
            SessionState::Idle
        ]
    );
}

#[tokio::test]
async fn test_on_failed_mid_discovery_resets() {
    let (handle, dispatcher, driver) = authenticating(CentralConfig::default()).await;
    dispatcher.on_authenticated(0);
    dispatcher.on_failed("service_discovery");

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Idle);
    assert!(!snapshot.connected);

    // late completion of the abandoned query
    dispatcher.on_service_discovered(0x1F, 2);
    handle.snapshot().await.unwrap();
    assert_eq!(driver.count("service_discovery_start"), 1);
}

#[tokio::test]
async fn test_auth_driver_failure_resets() {
    let (handle, dispatcher, driver) = scanning(CentralConfig::default()).await;
    advertise(&dispatcher, 1, "", -40);
    handle.connect().await.unwrap();
    driver.fail_next("auth_set_params", DriverCode::new(3));

    dispatcher.on_connected(0, address(1));

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Idle);
    assert_eq!(driver.count("auth_start"), 0);
}

#[tokio::test]
async fn test_guards_issue_no_driver_calls() {
    let (handle, _dispatcher, driver) = start(CentralConfig::default());

    assert!(matches!(
        handle.start_scan().await.unwrap_err(),
        CentralError::DongleNotReady
    ));
    assert!(handle.connect().await.unwrap_err().is_local());
    assert!(handle.disconnect().await.unwrap_err().is_local());
    assert!(handle.read().await.unwrap_err().is_local());
    assert!(handle.write("01").await.unwrap_err().is_local());
    assert!(handle.select_endpoint("0010").await.unwrap_err().is_local());
    assert!(handle.stop_scan().await.unwrap_err().is_local());

    assert!(driver.calls().is_empty());
}

#[tokio::test]
async fn test_reset_dongle() {
    let (handle, _dispatcher, driver) = ready(1).await;

    handle.reset_dongle().await.unwrap();

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Idle);
    assert!(!snapshot.dongle_ready);
    assert_eq!(driver.count("dongle_disconnect"), 1);
    assert_eq!(driver.count("dongle_reset"), 1);
    assert!(matches!(
        handle.start_scan().await.unwrap_err(),
        CentralError::DongleNotReady
    ));
}

// ============================================================================
// Data I/O
// ============================================================================

#[tokio::test]
async fn test_read_and_write_selected_endpoint() {
    let (handle, _dispatcher, driver) = ready(2).await;
    let mut rx = handle.subscribe();
    driver.queue_read(&[0xAA, 0x55]);

    let data = handle.read().await.unwrap();
    assert_eq!(&data[..], &[0xAA, 0x55]);

    handle.select_endpoint("02 01 0014").await.unwrap();
    assert_eq!(handle.write("0a 0b 0c").await.unwrap(), 3);

    let calls = driver.calls();
    assert!(calls.contains(&DriverCall::DataReadByReportRef {
        report_ref: [0x01, 0x01],
        timeout: Duration::from_secs(2),
    }));
    assert!(calls.contains(&DriverCall::DataWriteByReportRef {
        report_ref: [0x02, 0x01],
        data: vec![0x0A, 0x0B, 0x0C],
        timeout: Duration::from_secs(2),
    }));

    let notifications = drain(&mut rx);
    assert!(notifications.iter().any(|n| matches!(
        n,
        SessionNotification::ReadCompleted { endpoint, data } if endpoint == "01 01 0010" && data == &vec![0xAA, 0x55]
    )));
    assert!(notifications
        .iter()
        .any(|n| matches!(n, SessionNotification::WriteCompleted { len: 3, .. })));
}

#[tokio::test]
async fn test_plain_handle_read_and_write() {
    let (handle, _dispatcher, driver) = ready(2).await;
    driver.clear_calls();
    driver.queue_read(&[0x64]);

    let outcome = handle
        .submit_io_request(IoDirection::Read, "0010", "")
        .await
        .unwrap();
    assert_eq!(outcome, IoOutcome::Read(vec![0x64].into()));

    let outcome = handle
        .submit_io_request(IoDirection::Write, "14", "01 02")
        .await
        .unwrap();
    assert_eq!(outcome, IoOutcome::Written(2));

    assert_eq!(
        driver.calls(),
        vec![
            DriverCall::DataRead {
                handle: 0x0010,
                timeout: Duration::from_secs(2),
            },
            DriverCall::DataWrite {
                handle: 0x0014,
                data: vec![0x01, 0x02],
                timeout: Duration::from_secs(2),
            },
        ]
    );

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.selected_endpoint.as_deref(), Some("0014"));

    let err = handle
        .submit_io_request(IoDirection::Read, "0018", "")
        .await
        .unwrap_err();
    assert!(matches!(err, CentralError::UnknownEndpoint(_)));
}

#[tokio::test]
async fn test_rejected_request_keeps_selection() {
    let (handle, _dispatcher, driver) = ready(2).await;
    driver.clear_calls();
    let mut rx = handle.subscribe();

    let err = handle
        .submit_io_request(IoDirection::Write, "02 01 0014", "0a zz")
        .await
        .unwrap_err();
    assert!(matches!(err, CentralError::InvalidHexPayload { .. }));

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.selected_endpoint.as_deref(), Some("01 01 0010"));
    assert!(!drain(&mut rx)
        .iter()
        .any(|n| matches!(n, SessionNotification::EndpointsChanged { .. })));
    assert!(driver.calls().is_empty());
}

#[tokio::test]
async fn test_late_result_after_disconnect_is_not_published() {
    let (handle, dispatcher, driver) = ready(1).await;
    driver.stall_reads(Duration::from_millis(200));

    let pending = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.read().await })
    };
    while handle.snapshot().await.unwrap().pending_io == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let mut rx = handle.subscribe();
    dispatcher.on_disconnected(0x13);
    pending.await.unwrap().unwrap();

    let notifications = drain(&mut rx);
    assert!(!notifications
        .iter()
        .any(|n| matches!(n, SessionNotification::ReadCompleted { .. })));
    assert!(notifications.iter().any(|n| matches!(
        n,
        SessionNotification::Log(line) if line.message.contains("late result dropped")
    )));
    assert_eq!(handle.snapshot().await.unwrap().state, SessionState::Idle);
}

#[tokio::test]
async fn test_malformed_payload_rejected_locally() {
    let (handle, _dispatcher, driver) = ready(1).await;
    driver.clear_calls();

    let err = handle.write("01 zz").await.unwrap_err();
    assert!(matches!(err, CentralError::InvalidHexPayload { .. }));
    assert!(driver.calls().is_empty());
}

#[tokio::test]
async fn test_driver_code_surfaced_without_reset() {
    let (handle, _dispatcher, driver) = ready(1).await;
    driver.fail_next("data_read", DriverCode::new(0x3401));

    let err = handle.read().await.unwrap_err();
    assert_eq!(err.driver_code(), Some(DriverCode::new(0x3401)));
    assert_eq!(handle.snapshot().await.unwrap().state, SessionState::Ready);
}

#[tokio::test]
async fn test_one_pending_request_per_endpoint() {
    let (handle, _dispatcher, driver) = ready(2).await;
    driver.stall_reads(Duration::from_millis(300));

    let first = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.read().await })
    };
    while handle.snapshot().await.unwrap().pending_io == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let err = handle.read().await.unwrap_err();
    assert!(matches!(err, CentralError::EndpointBusy(_)));

    let other = handle
        .submit_io_request(IoDirection::Read, "02 01 0014", "")
        .await;
    assert!(other.is_ok());

    assert!(first.await.unwrap().is_ok());
    assert_eq!(handle.snapshot().await.unwrap().pending_io, 0);
}

#[tokio::test(start_paused = true)]
async fn test_read_times_out() {
    let config = CentralConfigBuilder::new()
        .request_timeout(Duration::from_millis(100))
        .build();
    let (handle, dispatcher, driver) = authenticating(config).await;
    driver.set_report_entries(1);
    dispatcher.on_authenticated(0);
    for _ in 0..3 {
        dispatcher.on_service_discovered(0x1F, 1);
    }
    dispatcher.on_service_enabled(1);
    driver.stall_reads(Duration::from_secs(60));

    let err = handle.read().await.unwrap_err();
    assert!(matches!(err, CentralError::IoTimeout { timeout_ms: 100, .. }));

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Ready);
    assert_eq!(snapshot.pending_io, 0);
}

#[tokio::test]
async fn test_unsolicited_data_is_published() {
    let (handle, dispatcher, _driver) = ready(1).await;
    let mut rx = handle.subscribe();

    dispatcher.on_data_received(0x0010, &[1, 2, 3]);
    handle.snapshot().await.unwrap();

    assert!(drain(&mut rx).iter().any(|n| matches!(
        n,
        SessionNotification::DataReceived { handle: 0x0010, data } if data == &vec![1, 2, 3]
    )));
    assert_eq!(handle.snapshot().await.unwrap().state, SessionState::Ready);
}

#[test]
fn test_endpoint_label_forms() {
    assert_eq!(
        "01 02 00a4".parse::<EndpointKey>().unwrap(),
        EndpointKey::ReportRef {
            report_ref: [0x01, 0x02],
            handle: 0x00A4,
        }
    );
    assert_eq!(
        "00a4".parse::<EndpointKey>().unwrap(),
        EndpointKey::Handle { handle: 0x00A4 }
    );
    assert!("01 00a4".parse::<EndpointKey>().unwrap_err().is_local());
}

// ============================================================================
// Replay and Log
// ============================================================================

#[tokio::test]
async fn test_replay_script_runs_through_handle() {
    let (handle, _dispatcher, driver) = ready(2).await;
    driver.queue_read(&[0x42]);
    let script = ReplayScript::parse(
        "# caption, endpoint, direction, payload\n\
         status, 01 01 0010, READ,\n\
         battery, 0010, READ,\n\
         led, 02 01 0014, WRITE, 0a 0b\n",
    )
    .unwrap();

    let report = script.run(&handle).await;
    assert!(report.is_complete());
    assert_eq!(report.completed.len(), 3);
    assert_eq!(report.completed[2].outcome, IoOutcome::Written(2));
    assert!(driver.calls().contains(&DriverCall::DataRead {
        handle: 0x0010,
        timeout: Duration::from_secs(2),
    }));

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.selected_endpoint.as_deref(), Some("02 01 0014"));
}

#[tokio::test]
async fn test_replay_stops_at_first_failure() {
    let (handle, _dispatcher, _driver) = ready(1).await;
    let script = ReplayScript::parse(
        "a, 01 01 0010, READ,\n\
         b, 09 09 0099, READ,\n\
         c, 01 01 0010, READ,\n",
    )
    .unwrap();

    let report = script.run(&handle).await;
    assert_eq!(report.completed.len(), 1);
    let failure = report.failure.unwrap();
    assert_eq!(failure.index, 1);
    assert!(matches!(failure.error, CentralError::UnknownEndpoint(_)));
}

#[tokio::test]
async fn test_log_lines_are_sequential() {
    let (handle, _dispatcher, _driver) = start(CentralConfig::default());
    let mut rx = handle.subscribe();

    handle.init_dongle().await.unwrap();
    handle.start_scan().await.unwrap();

    let seqs: Vec<u64> = drain(&mut rx)
        .into_iter()
        .filter_map(|n| match n {
            SessionNotification::Log(line) => Some(line.seq),
            _ => None,
        })
        .collect();
    assert!(seqs.len() >= 3);
    assert!(seqs.windows(2).all(|w| w[1] == w[0] + 1));
}

// ============================================================================
// Simulated Dongle
// ============================================================================

#[tokio::test]
async fn test_simulated_session_end_to_end() {
    let driver = SimulatedDongle::new();
    let config = CentralConfigBuilder::new().min_rssi(-60).passkey("1234").build();
    let (controller, handle, dispatcher) = SessionController::new(driver.clone(), config).unwrap();
    driver.attach(dispatcher);
    let task = tokio::spawn(controller.run());

    handle.init_dongle().await.unwrap();
    handle.start_scan().await.unwrap();
    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Discovered);
    assert_eq!(snapshot.peers.len(), 2);

    handle.connect().await.unwrap();
    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Ready);
    assert_eq!(snapshot.endpoints.len(), 3);

    let data = handle.read().await.unwrap();
    assert_eq!(data[0], 0x01);

    handle.disconnect().await.unwrap();
    assert_eq!(handle.snapshot().await.unwrap().state, SessionState::Idle);

    handle.shutdown().await.unwrap();
    task.await.unwrap().unwrap();
    assert_eq!(driver.recorder().count("dongle_reset"), 1);
}
