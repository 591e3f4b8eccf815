//! TOML configuration
//!
//! Loaded once at startup from `<config dir>/brickpilot/config.toml` or from the
//! file named by `BRICKPILOT_CONFIG`. Everything the process runs (devices,
//! gamepad bindings, control loops and the stream server) is described here and
//! validated before anything starts.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::attribute::{normalize_port, AttributeError, DeviceKind};
use crate::control::tick_period;
use crate::gamepad::{AxisBinding, AxisKind, GamepadSettings, GAMEPAD_DEVICE, SETPOINT_DEVICE};
use crate::signal::{SignalChain, Transform};
use crate::stream::StreamServerConfig;

pub const CONFIG_ENV: &str = "BRICKPILOT_CONFIG";
const CONFIG_DIR: &str = "brickpilot";
const CONFIG_FILE: &str = "config.toml";
const DEFAULT_PROBE: &str = "pid";

// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("No configuration directory available, set {}", CONFIG_ENV)]
    NoConfigDir,

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Attribute error: {0}")]
    Attribute(#[from] AttributeError),
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// `trace`, `debug`, `info`, `warn` or `error`
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn tracing_level(&self) -> Result<tracing::Level, ConfigError> {
        self.level
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("Unknown log level: {}", self.level)))
    }
}

/// A physical device and the folder holding its attribute files
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct DeviceConfig {
    pub port: String,
    pub kind: DeviceKind,
    pub path: PathBuf,
    /// Sensor mode written at startup, e.g. `IR-SEEK`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct AttributeRef {
    pub port: String,
    pub property: String,
}

impl AttributeRef {
    pub fn new(port: &str, property: &str) -> Self {
        Self {
            port: port.to_string(),
            property: property.to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum LawConfig {
    Pid {
        kp: f64,
        #[serde(default)]
        kd: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
    Direct {
        #[serde(default = "unit_gain")]
        gain: f64,
    },
}

fn unit_gain() -> f64 {
    1.0
}

fn default_loop_frequency() -> f64 {
    30.0
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct LoopConfig {
    pub name: String,
    pub actuator: AttributeRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_variable: Option<AttributeRef>,
    /// Name of a gamepad binding target
    pub setpoint: String,
    #[serde(default = "default_loop_frequency")]
    pub frequency: f64,
    pub law: LawConfig,
    /// Virtual device the PID state is published under
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe: Option<String>,
}

impl LoopConfig {
    /// Virtual device name for PID loops, `None` for direct loops
    pub fn probe_name(&self) -> Option<&str> {
        match self.law {
            LawConfig::Pid { .. } => Some(self.probe.as_deref().unwrap_or(DEFAULT_PROBE)),
            LawConfig::Direct { .. } => None,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct BrickConfig {
    pub logging: LoggingConfig,
    pub server: StreamServerConfig,
    pub gamepad: GamepadSettings,
    pub devices: Vec<DeviceConfig>,
    pub loops: Vec<LoopConfig>,
}


impl BrickConfig {
    /// Remote-control layout: the right trigger drives the motor on `outA`, the
    /// right stick steers the motor on `outB` through a position PID loop.
    pub fn remote_control() -> Self {
        let max_control = 100.0;
        let fade_zone = 60.0;

        Self {
            gamepad: GamepadSettings {
                bindings: vec![
                    AxisBinding {
                        axis: AxisKind::RightTrigger,
                        target: "drive".to_string(),
                        transforms: SignalChain::new(vec![Transform::Scale {
                            from: [0.0, 1.0],
                            to: [0.0, 100.0],
                        }]),
                    },
                    AxisBinding {
                        axis: AxisKind::RightStickX,
                        target: "steer".to_string(),
                        transforms: SignalChain::new(vec![Transform::Scale {
                            from: [-1.0, 1.0],
                            to: [-720.0, 720.0],
                        }]),
                    },
                ],
                ..GamepadSettings::default()
            },
            devices: vec![
                DeviceConfig {
                    port: "outA".to_string(),
                    kind: DeviceKind::TachoMotor,
                    path: PathBuf::from("/sys/class/tacho-motor/motor0"),
                    mode: None,
                },
                DeviceConfig {
                    port: "outB".to_string(),
                    kind: DeviceKind::TachoMotor,
                    path: PathBuf::from("/sys/class/tacho-motor/motor1"),
                    mode: None,
                },
            ],
            loops: vec![
                LoopConfig {
                    name: "drive".to_string(),
                    actuator: AttributeRef::new("outA", "Duty_Cycle_SP"),
                    process_variable: None,
                    setpoint: "drive".to_string(),
                    frequency: 30.0,
                    law: LawConfig::Direct { gain: 1.0 },
                    probe: None,
                },
                LoopConfig {
                    name: "steer".to_string(),
                    actuator: AttributeRef::new("outB", "Duty_Cycle_SP"),
                    process_variable: Some(AttributeRef::new("outB", "Position")),
                    setpoint: "steer".to_string(),
                    frequency: 30.0,
                    law: LawConfig::Pid {
                        kp: max_control / fade_zone,
                        kd: 0.05,
                        min: Some(-max_control),
                        max: Some(max_control),
                    },
                    probe: None,
                },
            ],
            ..Self::default()
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reads `path`; a missing file yields the default configuration
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        if !exists {
            debug!("No configuration at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_toml(&content)
    }

    /// Checks everything that can be checked without touching a device
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.logging.tracing_level()?;

        if self.server.enabled {
            if self.server.max_connections == 0 {
                return Err(invalid("server.max_connections must be at least 1"));
            }
            if tick_period(self.server.frequency).is_none() {
                return Err(invalid(format!(
                    "server.frequency must be positive with a representable period, got {}",
                    self.server.frequency
                )));
            }
        }

        if !(0.0..1.0).contains(&self.gamepad.deadzone) {
            return Err(invalid(format!(
                "gamepad.deadzone {} outside [0, 1)",
                self.gamepad.deadzone
            )));
        }

        let mut targets = HashSet::new();
        for binding in &self.gamepad.bindings {
            binding.transforms.validate().map_err(|reason| {
                invalid(format!("binding {} -> {}: {}", binding.axis, binding.target, reason))
            })?;
            targets.insert(binding.target.as_str());
        }

        let mut devices = std::collections::HashMap::new();
        for device in &self.devices {
            let port = normalize_port(&device.port)?;
            if devices.insert(port.clone(), device.kind).is_some() {
                return Err(invalid(format!("device port {} configured twice", port)));
            }
            if let Some(mode) = &device.mode {
                let settable = device
                    .kind
                    .property("Mode")
                    .is_some_and(|spec| spec.access.writable());
                if !settable || mode.trim().is_empty() {
                    return Err(invalid(format!(
                        "{} on {} cannot be set to mode {:?}",
                        device.kind, port, mode
                    )));
                }
            }
        }

        let mut virtual_names: HashSet<String> =
            [GAMEPAD_DEVICE, SETPOINT_DEVICE].iter().map(|s| s.to_string()).collect();
        let mut loop_names = HashSet::new();
        let mut actuators = HashSet::new();

        for control_loop in &self.loops {
            let name = control_loop.name.as_str();
            if name.is_empty() || !loop_names.insert(name) {
                return Err(invalid(format!("loop name {:?} is empty or repeated", name)));
            }
            if tick_period(control_loop.frequency).is_none() {
                return Err(invalid(format!(
                    "loop {}: frequency must be positive with a representable period, got {}",
                    name, control_loop.frequency
                )));
            }
            if !targets.contains(control_loop.setpoint.as_str()) {
                return Err(invalid(format!(
                    "loop {}: setpoint {} is not a gamepad binding target",
                    name, control_loop.setpoint
                )));
            }

            let actuator = &control_loop.actuator;
            let port = normalize_port(&actuator.port)?;
            let spec = device_property(&devices, &port, &actuator.property)?;
            if !spec.access.writable() {
                return Err(invalid(format!(
                    "loop {}: {}!{} is not writable",
                    name, port, actuator.property
                )));
            }
            if !actuators.insert((port.clone(), actuator.property.clone())) {
                return Err(invalid(format!(
                    "loop {}: actuator {}!{} is driven by another loop",
                    name, port, actuator.property
                )));
            }

            if let Some(pv) = &control_loop.process_variable {
                let pv_port = normalize_port(&pv.port)?;
                let spec = device_property(&devices, &pv_port, &pv.property)?;
                if !spec.access.readable() {
                    return Err(invalid(format!(
                        "loop {}: {}!{} is not readable",
                        name, pv_port, pv.property
                    )));
                }
            }

            match control_loop.law {
                LawConfig::Pid { kp, kd, min, max } => {
                    if control_loop.process_variable.is_none() {
                        return Err(invalid(format!(
                            "loop {}: pid law needs a process_variable",
                            name
                        )));
                    }
                    if !kp.is_finite() || !kd.is_finite() {
                        return Err(invalid(format!("loop {}: gains must be finite", name)));
                    }
                    if let (Some(min), Some(max)) = (min, max) {
                        if min > max {
                            return Err(invalid(format!(
                                "loop {}: min {} exceeds max {}",
                                name, min, max
                            )));
                        }
                    }
                }
                LawConfig::Direct { gain } => {
                    if !gain.is_finite() {
                        return Err(invalid(format!("loop {}: gain must be finite", name)));
                    }
                }
            }

            if let Some(probe) = control_loop.probe_name() {
                if devices.contains_key(probe) || !virtual_names.insert(probe.to_string()) {
                    return Err(invalid(format!(
                        "loop {}: probe name {} is already in use",
                        name, probe
                    )));
                }
            }
        }

        for step in &self.gamepad.steps {
            if !step.button.is_button() {
                return Err(invalid(format!("step on {}: {} is not a button", step.port, step.button)));
            }
            let port = normalize_port(&step.port)?;
            if devices.get(&port) != Some(&DeviceKind::TachoMotor) {
                return Err(invalid(format!("step on {}: no tacho motor configured there", port)));
            }
            if actuators.iter().any(|(driven, _)| *driven == port) {
                return Err(invalid(format!(
                    "step on {}: the motor is driven by a control loop",
                    port
                )));
            }
        }

        Ok(())
    }
}

fn device_property(
    devices: &std::collections::HashMap<String, DeviceKind>,
    port: &str,
    property: &str,
) -> Result<&'static crate::attribute::PropertySpec, ConfigError> {
    let kind = devices
        .get(port)
        .ok_or_else(|| invalid(format!("no device configured on {}", port)))?;
    kind.property(property)
        .ok_or_else(|| invalid(format!("{} on {} has no property {}", kind, port, property)))
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

/// `BRICKPILOT_CONFIG` if set, otherwise `<config dir>/brickpilot/config.toml`
pub fn config_path() -> Result<PathBuf, ConfigError> {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return Ok(PathBuf::from(path));
    }
    dirs::config_dir()
        .map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
        .ok_or(ConfigError::NoConfigDir)
}

/// Writes the remote-control layout to `path` unless a file already exists.
/// Returns whether a file was written.
pub async fn ensure_default_config(path: &Path) -> Result<bool, ConfigError> {
    let io_error = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };

    if tokio::fs::try_exists(path).await.map_err(io_error)? {
        return Ok(false);
    }

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
    }

    let content = BrickConfig::remote_control().to_toml()?;
    tokio::fs::write(path, content).await.map_err(io_error)?;
    info!("Wrote default configuration to {}", path.display());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
[logging]
level = "debug"

[server]
port = 5001
max_connections = 2

[gamepad]
deadzone = 0.1

[[gamepad.bindings]]
axis = "RightStickX"
target = "steer"
transforms = [{ kind = "scale", from = [-1.0, 1.0], to = [-720.0, 720.0] }]

[[devices]]
port = "B"
kind = "tacho-motor"
path = "/sys/class/tacho-motor/motor0"

[[loops]]
name = "steer"
actuator = { port = "outB", property = "Duty_Cycle_SP" }
process_variable = { port = "outB", property = "Position" }
setpoint = "steer"
law = { kind = "pid", kp = 1.6667, kd = 0.05, min = -100.0, max = 100.0 }
"#;

    #[test]
    fn parses_full_example() {
        let config = BrickConfig::from_toml(EXAMPLE).unwrap();
        assert_eq!(config.logging.tracing_level().unwrap(), tracing::Level::DEBUG);
        assert_eq!(config.server.port, 5001);
        assert_eq!(config.server.address, "0.0.0.0");
        assert_eq!(config.server.frequency, 30.0);
        assert_eq!(config.gamepad.bindings.len(), 1);
        assert_eq!(config.loops[0].frequency, 30.0);
        assert_eq!(config.loops[0].probe_name(), Some("pid"));
        config.validate().unwrap();
    }

    #[test]
    fn empty_file_is_the_default() {
        let config = BrickConfig::from_toml("").unwrap();
        assert_eq!(config, BrickConfig::default());
        assert!(config.devices.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn remote_control_layout_is_valid_and_round_trips() {
        let config = BrickConfig::remote_control();
        config.validate().unwrap();
        let parsed = BrickConfig::from_toml(&config.to_toml().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }

    fn expect_invalid(edit: impl FnOnce(&mut BrickConfig)) {
        let mut config = BrickConfig::from_toml(EXAMPLE).unwrap();
        edit(&mut config);
        assert!(
            matches!(config.validate(), Err(ConfigError::Invalid(_))),
            "expected invalid config: {:?}",
            config
        );
    }

    #[test]
    fn rejects_bad_server_settings() {
        expect_invalid(|c| c.server.max_connections = 0);
        expect_invalid(|c| c.server.frequency = 0.0);
        expect_invalid(|c| c.server.frequency = 1e-20);
        expect_invalid(|c| c.logging.level = "loud".into());
    }

    #[test]
    fn rejects_shared_actuators() {
        expect_invalid(|c| {
            let mut second = c.loops[0].clone();
            second.name = "steer2".into();
            second.actuator.port = "B".into();
            second.probe = Some("pid2".into());
            c.loops.push(second);
        });
    }

    #[test]
    fn rejects_bad_loop_references() {
        expect_invalid(|c| c.loops[0].setpoint = "missing".into());
        expect_invalid(|c| c.loops[0].actuator.property = "Position_Nope".into());
        expect_invalid(|c| c.loops[0].actuator.property = "Speed".into());
        expect_invalid(|c| c.loops[0].actuator.port = "outC".into());
        expect_invalid(|c| c.loops[0].process_variable = None);
        expect_invalid(|c| c.loops[0].frequency = -1.0);
        expect_invalid(|c| c.loops[0].frequency = 1e-20);
        expect_invalid(|c| c.loops[0].probe = Some(GAMEPAD_DEVICE.into()));
    }

    #[test]
    fn step_bindings_parse_and_validate() {
        let content = EXAMPLE.replace(
            "[[devices]]",
            r#"[[gamepad.steps]]
button = "ButtonX"
port = "C"
increment = 10
duty_cycle = 50

[[gamepad.steps]]
button = "ButtonB"
port = "C"
increment = -10

[[devices]]
port = "C"
kind = "tacho-motor"
path = "/sys/class/tacho-motor/motor2"

[[devices]]"#,
        );
        let config = BrickConfig::from_toml(&content).unwrap();
        assert_eq!(config.gamepad.steps.len(), 2);
        assert_eq!(config.gamepad.steps[0].duty_cycle, Some(50));
        assert_eq!(config.gamepad.steps[1].duty_cycle, None);
        config.validate().unwrap();

        let check = |edit: &dyn Fn(&mut BrickConfig)| {
            let mut config = config.clone();
            edit(&mut config);
            matches!(config.validate(), Err(ConfigError::Invalid(_)))
        };
        assert!(check(&|c: &mut BrickConfig| c.gamepad.steps[0].button = AxisKind::RightStickX));
        assert!(check(&|c: &mut BrickConfig| c.gamepad.steps[0].port = "D".into()));
        // outB is driven by the steer loop
        assert!(check(&|c: &mut BrickConfig| c.gamepad.steps[0].port = "B".into()));
    }

    #[test]
    fn sensor_modes_need_a_sensor() {
        let mut config = BrickConfig::from_toml(EXAMPLE).unwrap();
        config.devices.push(DeviceConfig {
            port: "2".into(),
            kind: DeviceKind::InfraredSensor,
            path: PathBuf::from("/sys/class/lego-sensor/sensor0"),
            mode: Some("IR-SEEK".into()),
        });
        config.validate().unwrap();

        expect_invalid(|c| c.devices[0].mode = Some("IR-SEEK".into()));
    }

    #[test]
    fn invalid_port_names_fail() {
        let mut config = BrickConfig::from_toml(EXAMPLE).unwrap();
        config.devices[0].port = "Z".into();
        assert!(matches!(config.validate(), Err(ConfigError::Attribute(_))));
    }

    #[tokio::test]
    async fn default_file_is_written_once() {
        let dir = std::env::temp_dir().join("brickpilot_config_test");
        let _ = std::fs::remove_dir_all(&dir);
        let path = dir.join("nested").join(CONFIG_FILE);

        assert_eq!(BrickConfig::load(&path).await.unwrap(), BrickConfig::default());
        assert!(ensure_default_config(&path).await.unwrap());
        assert!(!ensure_default_config(&path).await.unwrap());
        assert_eq!(
            BrickConfig::load(&path).await.unwrap(),
            BrickConfig::remote_control()
        );

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
