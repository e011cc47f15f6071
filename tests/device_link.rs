use iotide_lib::{IdeContext, IdeSettings};
use iotide_serial::serial::bridge::serve;
use iotide_serial::serial::port_scanner::{build_port_descriptor, rank_for_auto_connect};
use iotide_serial::serial::{
    BackendKind, EventKind, HostProcessTransport, LastDeviceRecord, LastDeviceStore,
    PortDescriptor, ReplClient, SerialErrorKind, SerialEvent, SerialSessionManager, SessionState,
    SimulatedTransport,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn settings(dir: &tempfile::TempDir) -> IdeSettings {
    IdeSettings {
        data_dir: Some(dir.path().to_path_buf()),
        ..IdeSettings::default()
    }
}

fn echo_device() -> Arc<SimulatedTransport> {
    let sim = SimulatedTransport::new();
    sim.set_responder(SimulatedTransport::echo_repl());
    sim
}

/// Host-process transport talking to an in-memory bridge that drives `sim`.
fn bridged(sim: Arc<SimulatedTransport>) -> Arc<HostProcessTransport> {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client);
    let (server_read, server_write) = tokio::io::split(server);
    tokio::spawn(serve(sim, server_read, server_write));
    HostProcessTransport::from_streams(client_read, client_write)
}

fn counter(session: &SerialSessionManager, kind: EventKind) -> Arc<AtomicUsize> {
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    session.on(kind, move |_| {
        h.fetch_add(1, Ordering::SeqCst);
    });
    hits
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_echo_scenario_through_context() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = IdeContext::with_transport(settings(&dir), echo_device());

    ctx.auto_connect().await.unwrap();
    let response = ctx.repl().send_command("1+1").await.unwrap();
    assert_eq!(response, "1+1");
    assert_eq!(ctx.session().listener_count(EventKind::Data), 1); // monitor only

    ctx.shutdown().await;
    assert_eq!(ctx.session().state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_only_one_connection_at_a_time() {
    let dir = tempfile::tempdir().unwrap();
    let sim = SimulatedTransport::with_ports(vec![
        PortDescriptor::from_path("/dev/ttyUSB0"),
        PortDescriptor::from_path("/dev/ttyUSB1"),
    ]);
    let ctx = IdeContext::with_transport(settings(&dir), sim.clone());
    let disconnects = counter(ctx.session(), EventKind::Disconnected);

    ctx.connect_path("/dev/ttyUSB0", None).await.unwrap();
    ctx.connect_path("/dev/ttyUSB1", None).await.unwrap();
    ctx.connect_path("/dev/ttyUSB0", None).await.unwrap();

    // The simulated port refuses a second open, so every switch closed first.
    assert_eq!(sim.open_attempts().len(), 3);
    assert_eq!(disconnects.load(Ordering::SeqCst), 2);
    assert_eq!(ctx.session().connection().unwrap().port.path, "/dev/ttyUSB0");

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_twice_is_harmless() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = IdeContext::with_transport(settings(&dir), echo_device());
    ctx.auto_connect().await.unwrap();

    ctx.session().disconnect().await.unwrap();
    ctx.session().disconnect().await.unwrap();
    assert_eq!(ctx.session().state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_unplug_mid_command_rejects_and_notifies() {
    let dir = tempfile::tempdir().unwrap();
    let sim = SimulatedTransport::new();
    let ctx = IdeContext::with_transport(settings(&dir), sim.clone());
    ctx.auto_connect().await.unwrap();
    let disconnects = counter(ctx.session(), EventKind::Disconnected);

    let repl = ctx.repl().clone();
    let pending = tokio::spawn(async move {
        repl.send_command_and_wait("import time; time.sleep(60)", Duration::from_secs(30))
            .await
    });
    settle().await;
    sim.simulate_unplug();

    let err = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .expect("pending command must not hang")
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind, SerialErrorKind::Disconnected);
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.session().listener_count(EventKind::Disconnected), 1);
}

#[test]
fn test_ranking_puts_known_vendor_first() {
    let mut a = PortDescriptor::from_path("A");
    a.manufacturer = Some("Generic".into());
    let mut b = PortDescriptor::from_path("B");
    b.manufacturer = Some("Silicon Labs CP210x".into());

    let ranked = rank_for_auto_connect(vec![a, b]);
    let paths: Vec<&str> = ranked.iter().map(|p| p.path.as_str()).collect();
    assert_eq!(paths, vec!["B", "A"]);
}

#[tokio::test]
async fn test_stale_last_device_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let sim = SimulatedTransport::with_ports(vec![
        build_port_descriptor("/dev/ttyS0", None, None, None, None, None),
        build_port_descriptor("/dev/ttyUSB0", Some(0x303A), Some(0x1001), None, None, None),
    ]);
    let eight_days_ms = 8 * 24 * 60 * 60 * 1000;
    LastDeviceStore::in_dir(dir.path())
        .save_record(&LastDeviceRecord {
            path: "/dev/ttyS0".into(),
            manufacturer: None,
            serial_number: None,
            timestamp: chrono::Utc::now().timestamp_millis() - eight_days_ms,
        })
        .unwrap();

    let ctx = IdeContext::with_transport(settings(&dir), sim.clone());
    let info = ctx.auto_connect().await.unwrap();
    assert_eq!(info.port.path, "/dev/ttyUSB0");
    assert_eq!(sim.open_attempts(), vec!["/dev/ttyUSB0".to_string()]);

    // The successful connection refreshes the record.
    let record = LastDeviceStore::in_dir(dir.path()).load().unwrap();
    assert_eq!(record.path, "/dev/ttyUSB0");
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_monitor_captures_both_directions() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = IdeContext::with_transport(settings(&dir), echo_device());
    ctx.auto_connect().await.unwrap();

    ctx.send_line("help()").await.unwrap();
    settle().await;

    let export = ctx
        .monitor()
        .export(iotide_serial::serial::ExportFormat::PlainText, true);
    assert!(export.contains("help()"));
    assert!(export.contains(">>>"));

    let path = ctx
        .monitor()
        .write_export(dir.path(), iotide_serial::serial::ExportFormat::Csv, false)
        .unwrap();
    assert!(path.file_name().unwrap().to_string_lossy().starts_with("serial-log-"));
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_session_over_bridge() {
    let dir = tempfile::tempdir().unwrap();
    let sim = echo_device();
    let ctx = IdeContext::with_transport(settings(&dir), bridged(sim.clone()));
    assert_eq!(ctx.backend(), BackendKind::HostProcess);

    let events = Arc::new(std::sync::Mutex::new(Vec::new()));
    let e = events.clone();
    ctx.session().on(EventKind::Disconnected, move |event| {
        e.lock().unwrap().push(event.clone());
    });

    let info = ctx.auto_connect().await.unwrap();
    assert_eq!(info.port.path, "/dev/ttySIM0");
    assert_eq!(info.backend, BackendKind::HostProcess);

    let response = ctx.repl().send_command("x = 1").await.unwrap();
    assert_eq!(response, "x = 1");
    assert_eq!(sim.written(), vec![b"x = 1\n".to_vec()]);

    sim.simulate_unplug();
    settle().await;
    assert_eq!(ctx.session().state(), SessionState::Disconnected);
    assert_eq!(*events.lock().unwrap(), vec![SerialEvent::Disconnected]);
}

#[tokio::test]
async fn test_upload_over_bridge_escapes_quotes() {
    let dir = tempfile::tempdir().unwrap();
    let sim = echo_device();
    let session = SerialSessionManager::new(bridged(sim.clone()), LastDeviceStore::in_dir(dir.path()));
    session.auto_connect().await.unwrap();

    let repl = ReplClient::new(session.clone());
    repl.upload_file("main.py", "print('hi')\n").await.unwrap();

    let writes: Vec<String> = sim
        .written()
        .into_iter()
        .map(|w| String::from_utf8(w).unwrap())
        .collect();
    assert_eq!(
        writes,
        vec![
            "f = open('main.py', 'w')\n",
            "f.write('print(\\'hi\\')\\n')\n",
            "f.close()\n",
        ]
    );
    session.shutdown().await;
}
