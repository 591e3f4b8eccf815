use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use brickpilot::app::App;
use brickpilot::attribute::{AttributeSource, AttributeValue, DeviceKind};
use brickpilot::config::{BrickConfig, DeviceConfig};
use brickpilot::gamepad::{AxisKind, InputEvent, StepBinding};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn fake_sysfs(test: &str) -> PathBuf {
    let root = std::env::temp_dir().join("brickpilot_app_test").join(test);
    let _ = fs::remove_dir_all(&root);

    for (folder, position) in [("motor0", "0"), ("motor1", "90")] {
        let motor = root.join("tacho-motor").join(folder);
        fs::create_dir_all(&motor).unwrap();
        fs::write(motor.join("driver_name"), "lego-ev3-l-motor\n").unwrap();
        fs::write(motor.join("command"), "").unwrap();
        fs::write(motor.join("duty_cycle_sp"), "0\n").unwrap();
        fs::write(motor.join("position"), format!("{}\n", position)).unwrap();
    }
    root
}

fn read(path: &Path) -> String {
    fs::read_to_string(path).unwrap().trim().to_string()
}

fn config_for(root: &Path) -> BrickConfig {
    let mut config = BrickConfig::remote_control();
    for (device, folder) in config.devices.iter_mut().zip(["motor0", "motor1"]) {
        device.path = root.join("tacho-motor").join(folder);
    }
    config.gamepad.enabled = false;
    config.server.address = "127.0.0.1".to_string();
    config.server.port = 0;
    config
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remote_control_layout_drives_motors() {
    let root = fake_sysfs("drive");
    let drive = root.join("tacho-motor/motor0");
    let steer = root.join("tacho-motor/motor1");

    let app = App::build(config_for(&root)).unwrap();
    let router = app.router();
    let mut running = app.start().await.unwrap();
    assert_eq!(read(&drive.join("command")), "run-direct");
    assert_eq!(read(&steer.join("command")), "run-direct");

    // Half trigger, stick centered: drive at 50 %, steer pulls back from 90
    router.route(&InputEvent::new(AxisKind::RightTrigger, 0.5));
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(read(&drive.join("duty_cycle_sp")), "50");
    // kp = 100/60, error = -90, clamped to -100
    assert_eq!(read(&steer.join("duty_cycle_sp")), "-100");

    let addr = running.stream_addr().unwrap();
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"STREAM:pid!ControlVariable;").await.unwrap();
    let mut buffer = [0u8; 128];
    let n = tokio::time::timeout(Duration::from_secs(3), client.read(&mut buffer))
        .await
        .unwrap()
        .unwrap();
    let sample = std::str::from_utf8(&buffer[..n]).unwrap();
    assert!(sample.contains(",-100;"), "unexpected sample {:?}", sample);

    running.shutdown().await;
    assert!(running.loops().iter().all(|handle| !handle.is_running()));
    assert_eq!(read(&drive.join("command")), "reset");
    assert_eq!(read(&steer.join("command")), "reset");

    // No loop writes after shutdown
    fs::write(drive.join("duty_cycle_sp"), "7").unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(read(&drive.join("duty_cycle_sp")), "7");

    fs::remove_dir_all(&root).unwrap();
}

#[tokio::test]
async fn missing_device_fails_before_anything_starts() {
    let root = fake_sysfs("missing");
    fs::remove_dir_all(root.join("tacho-motor/motor1")).unwrap();

    assert!(App::build(config_for(&root)).is_err());
    assert_eq!(read(&root.join("tacho-motor/motor0/command")), "");

    fs::remove_dir_all(&root).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sensor_mode_and_button_steps_are_wired() {
    let root = fake_sysfs("steps");

    let lift = root.join("tacho-motor").join("motor2");
    fs::create_dir_all(&lift).unwrap();
    fs::write(lift.join("driver_name"), "lego-ev3-m-motor\n").unwrap();
    fs::write(lift.join("command"), "").unwrap();
    fs::write(lift.join("position_sp"), "0\n").unwrap();
    fs::write(lift.join("duty_cycle_sp"), "0\n").unwrap();

    let sensor = root.join("lego-sensor").join("sensor0");
    fs::create_dir_all(&sensor).unwrap();
    fs::write(sensor.join("driver_name"), "lego-ev3-ir\n").unwrap();
    fs::write(sensor.join("mode"), "IR-PROX\n").unwrap();
    fs::write(sensor.join("value0"), "-12\n").unwrap();

    let mut config = config_for(&root);
    config.server.enabled = false;
    config.devices.push(DeviceConfig {
        port: "C".into(),
        kind: DeviceKind::TachoMotor,
        path: lift.clone(),
        mode: None,
    });
    config.devices.push(DeviceConfig {
        port: "2".into(),
        kind: DeviceKind::InfraredSensor,
        path: sensor.clone(),
        mode: Some("IR-SEEK".into()),
    });
    config.gamepad.steps.push(StepBinding {
        button: AxisKind::ButtonX,
        port: "C".into(),
        increment: 10,
        duty_cycle: Some(50),
    });

    let app = App::build(config).unwrap();
    assert_eq!(read(&sensor.join("mode")), "IR-SEEK");

    let registry = app.registry();
    let router = app.router();
    let mut running = app.start().await.unwrap();
    // Only loop actuators are switched to run-direct
    assert_eq!(read(&lift.join("command")), "");

    router.route(&InputEvent::new(AxisKind::ButtonX, 1.0));
    assert_eq!(read(&lift.join("position_sp")), "10");
    assert_eq!(read(&lift.join("duty_cycle_sp")), "50");
    assert_eq!(read(&lift.join("command")), "run-to-rel-pos");

    let mut heading = registry.open_source("in2", "SeekHeading_1").unwrap();
    assert_eq!(heading.read().unwrap(), AttributeValue::Int(-12));

    running.shutdown().await;
    fs::remove_dir_all(&root).unwrap();
}
