use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use brickpilot::attribute::{AttributeRegistry, DeviceDescriptor, DeviceKind};
use brickpilot::pid::{PidController, PidProbe};
use brickpilot::stream::{StreamError, StreamServer, StreamServerConfig, StreamServerHandle};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const FREQUENCY: f64 = 20.0;
const READ_TIMEOUT: Duration = Duration::from_secs(3);

fn folder_of(test: &str) -> PathBuf {
    std::env::temp_dir().join("brickpilot_stream_test").join(test)
}

fn motor_folder(test: &str) -> PathBuf {
    let folder = folder_of(test);
    let _ = std::fs::remove_dir_all(&folder);
    std::fs::create_dir_all(&folder).unwrap();
    std::fs::write(folder.join("position"), "42\n").unwrap();
    std::fs::write(folder.join("duty_cycle"), "-17\n").unwrap();
    folder
}

async fn start_server(test: &str, max_connections: usize) -> StreamServerHandle {
    let mut registry = AttributeRegistry::new();
    registry.register_device(
        DeviceDescriptor::new("A", DeviceKind::TachoMotor, motor_folder(test)).unwrap(),
    );

    let mut pid = PidController::proportional(2.0).unwrap();
    pid.set_set_point(10.0);
    pid.step();
    let probe = PidProbe::new("pid");
    probe.publish(&pid);
    registry.register_virtual(probe.to_virtual_device());

    let config = StreamServerConfig {
        enabled: true,
        address: "127.0.0.1".to_string(),
        port: 0,
        max_connections,
        frequency: FREQUENCY,
    };
    StreamServer::serve(&config, Arc::new(registry)).await.unwrap()
}

async fn request(server: &StreamServerHandle, request: &str) -> TcpStream {
    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    stream
}

/// Reads until `count` complete samples arrived
async fn read_samples(stream: &mut TcpStream, count: usize) -> Vec<(f64, String)> {
    let mut received = String::new();
    let mut buffer = [0u8; 512];

    while received.matches(';').count() < count {
        let n = timeout(READ_TIMEOUT, stream.read(&mut buffer))
            .await
            .expect("timed out waiting for samples")
            .unwrap();
        assert!(n > 0, "stream closed after {:?}", received);
        received.push_str(std::str::from_utf8(&buffer[..n]).unwrap());
    }

    received
        .split(';')
        .filter(|sample| !sample.is_empty())
        .take(count)
        .map(|sample| {
            let (time, value) = sample.split_once(',').unwrap();
            (time.parse().unwrap(), value.to_string())
        })
        .collect()
}

/// True when the peer closes without sending anything
async fn closed_without_data(stream: &mut TcpStream) -> bool {
    let mut buffer = [0u8; 64];
    match timeout(READ_TIMEOUT, stream.read(&mut buffer)).await {
        Ok(Ok(0)) => true,
        // A reset is also a close with no payload
        Ok(Err(_)) => true,
        Ok(Ok(_)) => false,
        Err(_) => false,
    }
}

/// Drains whatever is in flight; true once the peer has closed
async fn read_until_closed(stream: &mut TcpStream) -> bool {
    let mut buffer = [0u8; 512];
    for _ in 0..50 {
        match timeout(READ_TIMEOUT, stream.read(&mut buffer)).await {
            Ok(Ok(0)) | Ok(Err(_)) => return true,
            Ok(Ok(_)) => continue,
            Err(_) => return false,
        }
    }
    false
}

async fn wait_for_sessions(server: &StreamServerHandle, expected: usize) {
    for _ in 0..100 {
        if server.active_sessions() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "expected {} active sessions, found {}",
        expected,
        server.active_sessions()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn streams_samples_at_server_frequency() {
    let mut server = start_server("round_trip", 5).await;
    let mut client = request(&server, "STREAM:outA!Position;").await;

    let samples = read_samples(&mut client, 6).await;
    assert!(samples[0].0 >= 0.0);
    assert!(samples.iter().all(|(_, value)| value == "42"));

    let period = 1.0 / FREQUENCY;
    let mean_interval = (samples[5].0 - samples[0].0) / 5.0;
    assert!(
        mean_interval > period * 0.7 && mean_interval < period * 1.5,
        "mean interval {} for period {}",
        mean_interval,
        period
    );
    assert!(samples.windows(2).all(|pair| pair[1].0 > pair[0].0));

    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pid_state_is_streamable() {
    let mut server = start_server("pid_probe", 5).await;
    let mut client = request(&server, "STREAM:pid!ControlVariable;").await;

    let samples = read_samples(&mut client, 2).await;
    assert_eq!(samples[0].1, "20");

    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn garbage_request_closes_only_that_connection() {
    let mut server = start_server("garbage", 5).await;
    let mut healthy = request(&server, "STREAM:A!Duty_Cycle;").await;
    read_samples(&mut healthy, 1).await;

    let mut garbage = request(&server, "GARBAGE").await;
    garbage.shutdown().await.unwrap();
    assert!(closed_without_data(&mut garbage).await);

    let mut unknown = request(&server, "STREAM:outD!Position;").await;
    assert!(closed_without_data(&mut unknown).await);

    let samples = read_samples(&mut healthy, 3).await;
    assert!(samples.iter().all(|(_, value)| value == "-17"));

    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connections_over_capacity_are_refused() {
    let mut server = start_server("capacity", 2).await;

    let mut first = request(&server, "STREAM:outA!Position;").await;
    let mut second = request(&server, "STREAM:outA!Position;").await;
    read_samples(&mut first, 1).await;
    read_samples(&mut second, 1).await;
    assert_eq!(server.active_sessions(), 2);

    let mut third = TcpStream::connect(server.local_addr()).await.unwrap();
    let _ = third.write_all(b"STREAM:outA!Position;").await;
    assert!(closed_without_data(&mut third).await);

    // Both live sessions keep streaming
    read_samples(&mut first, 2).await;
    read_samples(&mut second, 2).await;

    // A slot frees up once a client leaves
    drop(first);
    wait_for_sessions(&server, 1).await;
    let mut fourth = request(&server, "STREAM:outA!Position;").await;
    read_samples(&mut fourth, 1).await;

    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_closes_listener_and_sessions() {
    let mut server = start_server("stop", 5).await;
    let addr = server.local_addr();
    let mut client = request(&server, "STREAM:outA!Position;").await;
    read_samples(&mut client, 1).await;

    server.stop().await.unwrap();
    assert!(TcpStream::connect(addr).await.is_err());

    // The session ends; whatever was in flight drains, then EOF
    assert!(read_until_closed(&mut client).await);
    wait_for_sessions(&server, 0).await;

    // Idempotent
    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreadable_attribute_ends_only_its_session() {
    let mut server = start_server("fault", 5).await;
    let mut healthy = request(&server, "STREAM:A!Duty_Cycle;").await;
    let mut failing = request(&server, "STREAM:outA!Position;").await;
    read_samples(&mut healthy, 1).await;
    read_samples(&mut failing, 1).await;
    wait_for_sessions(&server, 2).await;

    std::fs::write(folder_of("fault").join("position"), "not-a-number\n").unwrap();
    assert!(read_until_closed(&mut failing).await);
    wait_for_sessions(&server, 1).await;

    let samples = read_samples(&mut healthy, 2).await;
    assert!(samples.iter().all(|(_, value)| value == "-17"));

    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn request_without_property_is_refused() {
    let mut server = start_server("no_property", 5).await;

    let mut client = request(&server, "STREAM:outA;").await;
    assert!(closed_without_data(&mut client).await);
    wait_for_sessions(&server, 0).await;

    server.stop().await.unwrap();
}

#[tokio::test]
async fn unrepresentable_frequency_is_rejected_before_binding() {
    let registry = Arc::new(AttributeRegistry::new());
    for frequency in [0.0, f64::NAN, 1e-20] {
        let config = StreamServerConfig {
            enabled: true,
            address: "127.0.0.1".to_string(),
            port: 0,
            max_connections: 1,
            frequency,
        };
        let result = StreamServer::serve(&config, registry.clone()).await;
        assert!(
            matches!(result, Err(StreamError::InvalidConfig(_))),
            "{} Hz accepted",
            frequency
        );
    }
}

// A single runtime thread: a read stuck in the kernel must not starve other sessions
#[tokio::test(flavor = "current_thread")]
async fn stalled_device_read_leaves_other_sessions_running() {
    let mut server = start_server("stalled", 5).await;
    let position = folder_of("stalled").join("position");
    std::fs::remove_file(&position).unwrap();
    let created = std::process::Command::new("mkfifo")
        .arg(&position)
        .status()
        .unwrap();
    assert!(created.success());

    // Opening a fifo without a writer blocks until one shows up
    let _stalled = request(&server, "STREAM:outA!Position;").await;
    let mut healthy = request(&server, "STREAM:outA!Duty_Cycle;").await;
    let samples = read_samples(&mut healthy, 3).await;
    assert!(samples.iter().all(|(_, value)| value == "-17"));

    server.stop().await.unwrap();
    assert!(read_until_closed(&mut healthy).await);
    wait_for_sessions(&server, 0).await;

    // Release the abandoned read so the blocking pool can drain
    std::fs::write(&position, "0\n").unwrap();
}
