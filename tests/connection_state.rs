mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use common::{arduino, MockSerial};
use sensorlink_lib::device::{ConnectionState, DeviceError, DeviceManager, ReconnectPolicy};
use sensorlink_lib::events::{EventBus, LinkEvent};
use sensorlink_lib::serial::{PortInfo, SerialEndpoint, SerialError};

fn endpoint(path: Option<&str>) -> SerialEndpoint {
    SerialEndpoint {
        path: path.map(str::to_string),
        line_delimiter: "\r\n".to_string(),
        ..SerialEndpoint::default()
    }
}

fn manager(backend: Arc<MockSerial>, path: Option<&str>) -> (DeviceManager, mpsc::Receiver<String>, EventBus) {
    let (lines_tx, lines_rx) = mpsc::channel(64);
    let events = EventBus::default();
    let manager = DeviceManager::new(
        endpoint(path),
        backend,
        ReconnectPolicy::default(),
        events.clone(),
        lines_tx,
        false,
    );
    (manager, lines_rx, events)
}

#[tokio::test]
async fn test_connect_opens_configured_port() {
    let (backend, mut links) = MockSerial::new(vec![]);
    let (manager, _lines, events) = manager(backend.clone(), Some("/dev/ttyMOCK0"));
    let mut rx = events.subscribe();

    manager.connect().await.unwrap();

    let status = manager.status().await;
    assert_eq!(status.state, ConnectionState::Open);
    assert_eq!(status.port.as_deref(), Some("/dev/ttyMOCK0"));
    assert!(status.session_id.is_some());
    assert_eq!(status.retry_count, 0);

    let (path, _device) = links.recv().await.unwrap();
    assert_eq!(path, "/dev/ttyMOCK0");

    let mut transitions = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let LinkEvent::StatusChanged(change) = event {
            transitions.push((change.previous, change.current));
        }
    }
    assert_eq!(
        transitions,
        vec![
            (ConnectionState::Idle, ConnectionState::Connecting),
            (ConnectionState::Connecting, ConnectionState::Open),
        ]
    );
}

#[tokio::test]
async fn test_connect_while_open_is_noop() {
    let (backend, _links) = MockSerial::new(vec![]);
    let (manager, _lines, _events) = manager(backend.clone(), Some("/dev/ttyMOCK0"));

    manager.connect().await.unwrap();
    manager.connect().await.unwrap();
    assert_eq!(backend.open_calls(), 1, "second connect must not reopen");
}

#[tokio::test(start_paused = true)]
async fn test_connect_while_connecting_is_coalesced() {
    let (backend, _links) = MockSerial::new(vec![]);
    backend.set_open_delay(Duration::from_millis(500));
    let (manager, _lines, _events) = manager(backend.clone(), Some("/dev/ttyMOCK0"));

    let first = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.connect().await })
    };
    while manager.state().await != ConnectionState::Connecting {
        tokio::task::yield_now().await;
    }

    manager.connect().await.unwrap();
    assert_eq!(manager.state().await, ConnectionState::Connecting);

    first.await.unwrap().unwrap();
    assert_eq!(manager.state().await, ConnectionState::Open);
    assert_eq!(backend.open_calls(), 1, "only one attempt may be in flight");
}

#[tokio::test(start_paused = true)]
async fn test_open_failures_stop_after_max_retries() {
    let (backend, _links) = MockSerial::new(vec![]);
    backend.set_failing(true);
    let (manager, _lines, _events) = manager(backend.clone(), Some("/dev/ttyMOCK0"));

    let err = manager.connect().await.unwrap_err();
    assert!(matches!(err, DeviceError::SerialError(_)));
    let status = manager.status().await;
    assert_eq!(status.state, ConnectionState::Reconnecting);
    assert_eq!(status.retry_count, 1);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(backend.open_calls(), 6, "initial attempt plus five retries");
    let status = manager.status().await;
    assert_eq!(status.state, ConnectionState::Closed);
    assert_eq!(status.retry_count, 5);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(backend.open_calls(), 6, "no retries once the budget is spent");

    // Explicit reconnect resets the budget
    backend.set_failing(false);
    manager.force_reconnect().await.unwrap();
    let status = manager.status().await;
    assert_eq!(status.state, ConnectionState::Open);
    assert_eq!(status.retry_count, 0);
    assert_eq!(backend.open_calls(), 7);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_waits_fixed_delay() {
    let (backend, _links) = MockSerial::new(vec![]);
    backend.set_failing(true);
    let (manager, _lines, _events) = manager(backend.clone(), Some("/dev/ttyMOCK0"));

    let _ = manager.connect().await;
    tokio::time::sleep(Duration::from_millis(2900)).await;
    assert_eq!(backend.open_calls(), 1);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(backend.open_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_lost_link_reconnects() {
    let (backend, mut links) = MockSerial::new(vec![]);
    let (manager, _lines, events) = manager(backend.clone(), Some("/dev/ttyMOCK0"));
    let mut rx = events.subscribe();

    manager.connect().await.unwrap();
    let (_, device) = links.recv().await.unwrap();
    drop(device);

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(backend.open_calls(), 2);
    assert_eq!(manager.state().await, ConnectionState::Open);
    assert_eq!(manager.status().await.retry_count, 0);

    let mut saw_lost = false;
    while let Ok(event) = rx.try_recv() {
        if let LinkEvent::StatusChanged(change) = event {
            if change.previous == ConnectionState::Open && change.current == ConnectionState::Closed {
                assert!(change.detail.contains("lost"));
                saw_lost = true;
            }
        }
    }
    assert!(saw_lost, "expected an Open -> Closed transition");
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_suppresses_reconnect() {
    let (backend, mut links) = MockSerial::new(vec![]);
    let (manager, _lines, _events) = manager(backend.clone(), Some("/dev/ttyMOCK0"));

    manager.connect().await.unwrap();
    let (_, mut device) = links.recv().await.unwrap();

    manager.disconnect().await.unwrap();
    let status = manager.status().await;
    assert_eq!(status.state, ConnectionState::Closed);
    assert_eq!(status.retry_count, status.max_retries);

    let mut buf = [0u8; 8];
    assert_eq!(device.read(&mut buf).await.unwrap(), 0, "host side must be closed");

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(backend.open_calls(), 1);

    // Idempotent
    manager.disconnect().await.unwrap();
    assert_eq!(manager.state().await, ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_pending_reconnect() {
    let (backend, _links) = MockSerial::new(vec![]);
    backend.set_failing(true);
    let (manager, _lines, _events) = manager(backend.clone(), Some("/dev/ttyMOCK0"));

    let _ = manager.connect().await;
    assert_eq!(manager.state().await, ConnectionState::Reconnecting);

    manager.disconnect().await.unwrap();
    assert_eq!(manager.state().await, ConnectionState::Closed);

    backend.set_failing(false);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(backend.open_calls(), 1);
}

#[tokio::test]
async fn test_lines_are_split_on_delimiter() {
    let (backend, mut links) = MockSerial::new(vec![]);
    let (manager, mut lines, _events) = manager(backend, Some("/dev/ttyMOCK0"));

    manager.connect().await.unwrap();
    let (_, mut device) = links.recv().await.unwrap();

    device.write_all(b"{\"a\":1}\r\npart").await.unwrap();
    device.write_all(b"ial\r\n\r\n").await.unwrap();

    assert_eq!(lines.recv().await.unwrap(), "{\"a\":1}");
    assert_eq!(lines.recv().await.unwrap(), "partial");
    assert_eq!(lines.recv().await.unwrap(), "");
}

#[tokio::test]
async fn test_send_data_writes_to_port() {
    let (backend, mut links) = MockSerial::new(vec![]);
    let (manager, _lines, events) = manager(backend, Some("/dev/ttyMOCK0"));
    let mut rx = events.subscribe();

    let err = manager.send_data(b"PING\n").await.unwrap_err();
    assert!(matches!(err, DeviceError::NotConnected));

    manager.connect().await.unwrap();
    let (_, mut device) = links.recv().await.unwrap();

    assert_eq!(manager.send_data(b"PING\n").await.unwrap(), 5);
    let mut buf = [0u8; 5];
    device.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"PING\n");

    let mut sent = None;
    while let Ok(event) = rx.try_recv() {
        if let LinkEvent::DataSent { bytes } = event {
            sent = Some(bytes);
        }
    }
    assert_eq!(sent, Some(5));
}

#[tokio::test]
async fn test_auto_detect_prefers_known_vendor() {
    let (backend, mut links) = MockSerial::new(vec![PortInfo::bare("/dev/ttyS0"), arduino("/dev/ttyACM0")]);
    let (manager, _lines, _events) = manager(backend, None);

    manager.connect().await.unwrap();
    let (path, _device) = links.recv().await.unwrap();
    assert_eq!(path, "/dev/ttyACM0");
}

#[tokio::test(start_paused = true)]
async fn test_auto_detect_without_ports_waits_for_explicit_connect() {
    let (backend, _links) = MockSerial::new(vec![]);
    let (manager, _lines, _events) = manager(backend.clone(), None);

    let err = manager.connect().await.unwrap_err();
    assert!(matches!(err, DeviceError::SerialError(SerialError::NoPortsAvailable)));
    assert_eq!(manager.state().await, ConnectionState::Closed);

    backend.add_port(arduino("/dev/ttyACM0"));
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(manager.state().await, ConnectionState::Closed, "discovery is not retried by the timer");
    assert_eq!(backend.list_calls(), 1);

    manager.connect().await.unwrap();
    assert_eq!(manager.state().await, ConnectionState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_enumeration_failure_is_not_retried() {
    let (backend, _links) = MockSerial::new(vec![arduino("/dev/ttyACM0")]);
    backend.set_enumeration_failing(true);
    let (manager, _lines, events) = manager(backend.clone(), None);
    let mut rx = events.subscribe();

    let err = manager.connect().await.unwrap_err();
    assert!(matches!(err, DeviceError::SerialError(SerialError::EnumerationFailed(_))));

    let status = manager.status().await;
    assert_eq!(status.state, ConnectionState::Closed);
    assert_eq!(status.retry_count, 0);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(backend.list_calls(), 1);
    assert_eq!(backend.open_calls(), 0);

    let mut states = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let LinkEvent::StatusChanged(change) = event {
            states.push(change.current);
        }
    }
    assert_eq!(states, vec![ConnectionState::Connecting, ConnectionState::Closed]);

    backend.set_enumeration_failing(false);
    manager.connect().await.unwrap();
    assert_eq!(backend.list_calls(), 2);
    assert_eq!(manager.state().await, ConnectionState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_completes_while_write_is_blocked() {
    let (backend, mut links) = MockSerial::new(vec![]);
    let (manager, _lines, _events) = manager(backend, Some("/dev/ttyMOCK0"));

    manager.connect().await.unwrap();
    // The device never reads, so the pipe fills up and the write parks
    let (_, _device) = links.recv().await.unwrap();

    let writer = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.send_data(&[b'x'; 16384]).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!writer.is_finished());

    let status = tokio::time::timeout(Duration::from_secs(2), manager.status()).await;
    assert_eq!(status.unwrap().state, ConnectionState::Open);

    tokio::time::timeout(Duration::from_secs(2), manager.disconnect())
        .await
        .expect("disconnect must not wait for the stalled write")
        .unwrap();
    assert_eq!(manager.state().await, ConnectionState::Closed);

    let result = tokio::time::timeout(Duration::from_secs(2), writer)
        .await
        .expect("stalled write must be cancelled")
        .unwrap();
    assert!(matches!(result, Err(DeviceError::NotConnected)));
}

#[tokio::test]
async fn test_long_line_without_delimiter_is_trimmed() {
    let (backend, mut links) = MockSerial::new(vec![]);
    let (manager, mut lines, _events) = manager(backend, Some("/dev/ttyMOCK0"));

    manager.connect().await.unwrap();
    let (_, mut device) = links.recv().await.unwrap();

    device.write_all(&[b'x'; 12000]).await.unwrap();
    device.write_all(b"tail\r\n").await.unwrap();

    let line = lines.recv().await.unwrap();
    assert!(line.ends_with("tail"));
    // Reads arrive in 512 byte chunks, so the cap can be overshot by one chunk
    assert!(line.len() <= 8192 + 512, "line of {} bytes was not trimmed", line.len());
    assert!(line.len() > 4096);
    assert_eq!(manager.state().await, ConnectionState::Open);
}

#[tokio::test]
async fn test_scan_switches_to_better_port() {
    let (backend, mut links) = MockSerial::new(vec![PortInfo::bare("/dev/ttyS0")]);
    let (manager, _lines, events) = manager(backend.clone(), None);
    let mut rx = events.subscribe();

    manager.connect().await.unwrap();
    let (path, _first_device) = links.recv().await.unwrap();
    assert_eq!(path, "/dev/ttyS0");

    backend.add_port(arduino("/dev/ttyACM0"));

    let scan = manager.scan_for_better_ports().await.unwrap();
    assert!(!scan.switched, "switching is off by default");
    assert_eq!(scan.best.as_ref().map(|p| p.port_name.as_str()), Some("/dev/ttyACM0"));

    manager.set_dynamic_port_switching(true).await;
    let scan = manager.scan_for_better_ports().await.unwrap();
    assert!(scan.switched);
    assert_eq!(scan.current.as_deref(), Some("/dev/ttyACM0"));
    let (path, _second_device) = links.recv().await.unwrap();
    assert_eq!(path, "/dev/ttyACM0");

    let status = manager.status().await;
    assert_eq!(status.state, ConnectionState::Open);
    assert_eq!(status.port.as_deref(), Some("/dev/ttyACM0"));

    let mut switched = None;
    while let Ok(event) = rx.try_recv() {
        if let LinkEvent::PortSwitched { from, to } = event {
            switched = Some((from, to));
        }
    }
    assert_eq!(
        switched,
        Some((Some("/dev/ttyS0".to_string()), "/dev/ttyACM0".to_string()))
    );

    // Already on the best port
    let scan = manager.scan_for_better_ports().await.unwrap();
    assert!(!scan.switched);
}
