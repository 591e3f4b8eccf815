//! Device descriptors and their static property tables
//!
//! A device is a port, a kind and the folder that holds its attribute files.
//! Each kind carries a compile-time table mapping symbolic property names
//! (`Position`, `Duty_Cycle_SP`, ...) to the file that backs them, the value
//! type stored in that file and whether it can be read, written or both.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::{AttributeError, AttributeKey, AttributeSink, AttributeSource, AttributeValue, SysfsAttribute};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    pub fn readable(self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    pub fn writable(self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

/// How the text in an attribute file is interpreted
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    Int,
    Text,
}

#[derive(Clone, Copy, Debug)]
pub struct PropertySpec {
    pub name: &'static str,
    pub file: &'static str,
    pub kind: ValueKind,
    pub access: Access,
}

const fn prop(name: &'static str, file: &'static str, kind: ValueKind, access: Access) -> PropertySpec {
    PropertySpec {
        name,
        file,
        kind,
        access,
    }
}

static TACHO_MOTOR_PROPERTIES: &[PropertySpec] = &[
    prop("Address", "address", ValueKind::Text, Access::Read),
    prop("Driver_Name", "driver_name", ValueKind::Text, Access::Read),
    prop("Commands", "commands", ValueKind::Text, Access::Read),
    prop("Count_Per_Rot", "count_per_rot", ValueKind::Int, Access::Read),
    prop("Position", "position", ValueKind::Int, Access::ReadWrite),
    prop("Position_SP", "position_sp", ValueKind::Int, Access::ReadWrite),
    prop("Duty_Cycle", "duty_cycle", ValueKind::Int, Access::Read),
    prop("Duty_Cycle_SP", "duty_cycle_sp", ValueKind::Int, Access::ReadWrite),
    prop("Speed", "speed", ValueKind::Int, Access::Read),
    prop("Speed_SP", "speed_sp", ValueKind::Int, Access::ReadWrite),
    prop("Polarity", "polarity", ValueKind::Text, Access::ReadWrite),
    prop("Encoder_Polarity", "encoder_polarity", ValueKind::Text, Access::ReadWrite),
    prop("Stop_Command", "stop_command", ValueKind::Text, Access::ReadWrite),
];

// The meaning of value0..value7 follows `mode`: IR-PROX puts the proximity in
// value0, IR-SEEK interleaves heading/distance per channel across all eight
static INFRARED_SENSOR_PROPERTIES: &[PropertySpec] = &[
    prop("Address", "address", ValueKind::Text, Access::Read),
    prop("Driver_Name", "driver_name", ValueKind::Text, Access::Read),
    prop("Mode", "mode", ValueKind::Text, Access::ReadWrite),
    prop("Modes", "modes", ValueKind::Text, Access::Read),
    prop("Num_Values", "num_values", ValueKind::Int, Access::Read),
    prop("Proximity", "value0", ValueKind::Int, Access::Read),
    prop("SeekHeading_1", "value0", ValueKind::Int, Access::Read),
    prop("SeekDistance_1", "value1", ValueKind::Int, Access::Read),
    prop("SeekHeading_2", "value2", ValueKind::Int, Access::Read),
    prop("SeekDistance_2", "value3", ValueKind::Int, Access::Read),
    prop("SeekHeading_3", "value4", ValueKind::Int, Access::Read),
    prop("SeekDistance_3", "value5", ValueKind::Int, Access::Read),
    prop("SeekHeading_4", "value6", ValueKind::Int, Access::Read),
    prop("SeekDistance_4", "value7", ValueKind::Int, Access::Read),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceKind {
    TachoMotor,
    InfraredSensor,
}

impl DeviceKind {
    pub fn properties(self) -> &'static [PropertySpec] {
        match self {
            DeviceKind::TachoMotor => TACHO_MOTOR_PROPERTIES,
            DeviceKind::InfraredSensor => INFRARED_SENSOR_PROPERTIES,
        }
    }

    pub fn property(self, name: &str) -> Option<&'static PropertySpec> {
        self.properties().iter().find(|p| p.name == name)
    }

    /// Maps a kernel driver name to the device kind that handles it
    pub fn from_driver_name(driver: &str) -> Option<Self> {
        match driver.trim() {
            "lego-ev3-m-motor" | "lego-ev3-l-motor" => Some(DeviceKind::TachoMotor),
            "lego-ev3-ir" => Some(DeviceKind::InfraredSensor),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::TachoMotor => write!(f, "tacho-motor"),
            DeviceKind::InfraredSensor => write!(f, "infrared-sensor"),
        }
    }
}

/// Normalizes a brick port name: `A`..`D` become `outA`..`outD`, `1`..`4`
/// become `in1`..`in4`, and names already starting with `out`/`in` pass through.
pub fn normalize_port(port: &str) -> Result<String, AttributeError> {
    let port = port.trim();
    let normalized = match port {
        "A" | "B" | "C" | "D" => format!("out{}", port),
        "1" | "2" | "3" | "4" => format!("in{}", port),
        _ => port.to_string(),
    };

    let valid = match normalized.strip_prefix("out") {
        Some(rest) => !rest.is_empty(),
        None => normalized.strip_prefix("in").is_some_and(|rest| !rest.is_empty()),
    };

    if valid {
        Ok(normalized)
    } else {
        Err(AttributeError::InvalidPort(port.to_string()))
    }
}

/// A physical device on a port, backed by a folder of attribute files
#[derive(Clone, Debug)]
pub struct DeviceDescriptor {
    port: String,
    kind: DeviceKind,
    folder: PathBuf,
}

impl DeviceDescriptor {
    pub fn new(port: &str, kind: DeviceKind, folder: impl Into<PathBuf>) -> Result<Self, AttributeError> {
        Ok(Self {
            port: normalize_port(port)?,
            kind,
            folder: folder.into(),
        })
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn spec(&self, property: &str) -> Result<&'static PropertySpec, AttributeError> {
        self.kind
            .property(property)
            .ok_or_else(|| AttributeError::UnknownProperty {
                port: self.port.clone(),
                property: property.to_string(),
            })
    }

    /// Opens a fresh handle on one property. Every call yields an independent
    /// handle with its own file descriptor.
    pub fn open(&self, property: &str) -> Result<SysfsAttribute, AttributeError> {
        let spec = self.spec(property)?;
        debug!("Opening {}!{} ({})", self.port, spec.name, spec.file);
        Ok(SysfsAttribute::new(
            AttributeKey::new(&self.port, spec.name),
            self.folder.join(spec.file),
            spec.kind,
            spec.access,
        ))
    }

    /// Sends a command string to the device (`run-direct`, `reset`, ...).
    /// Only tacho motors accept commands; sensors ignore the call.
    pub fn command(&self, command: &str) -> Result<(), AttributeError> {
        if self.kind != DeviceKind::TachoMotor {
            debug!("Ignoring command {} for {} on {}", command, self.kind, self.port);
            return Ok(());
        }

        let path = self.folder.join("command");
        info!("Sending command {} to {}", command, self.port);
        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .create(false)
            .open(&path)
            .map_err(|source| AttributeError::Io {
                path: path.clone(),
                source,
            })?;
        file.write_all(command.as_bytes())
            .map_err(|source| AttributeError::Io { path, source })
    }

    pub fn run_direct(&self) -> Result<(), AttributeError> {
        self.command("run-direct")
    }

    /// Returns the motor to its idle, neutral state
    pub fn reset(&self) -> Result<(), AttributeError> {
        self.command("reset")
    }

    /// Turns the motor by `delta` tacho counts from where it stands, optionally
    /// setting the duty cycle it moves with first
    pub fn run_to_rel_pos(&self, delta: i64, duty_cycle: Option<i64>) -> Result<(), AttributeError> {
        if let Some(duty_cycle) = duty_cycle {
            self.open("Duty_Cycle_SP")?.write(&AttributeValue::Int(duty_cycle))?;
        }
        self.open("Position_SP")?.write(&AttributeValue::Int(delta))?;
        self.command("run-to-rel-pos")
    }

    /// Selects the sensor mode (`IR-PROX`, `IR-SEEK`, ...), which decides what
    /// the value attributes report
    pub fn set_mode(&self, mode: &str) -> Result<(), AttributeError> {
        info!("Setting {} on {} to mode {}", self.kind, self.port, mode);
        self.open("Mode")?.write(&AttributeValue::Text(mode.to_string()))
    }

    /// Reads `driver_name` and fails if it belongs to a different device kind.
    /// Unknown drivers are accepted with a warning.
    pub fn check_driver(&self) -> Result<(), AttributeError> {
        let mut source = self.open("Driver_Name")?;
        let driver = source.read()?.to_string();

        match DeviceKind::from_driver_name(&driver) {
            Some(kind) if kind == self.kind => Ok(()),
            Some(kind) => Err(AttributeError::DriverMismatch {
                port: self.port.clone(),
                expected: self.kind,
                found: kind,
            }),
            None => {
                warn!("Unknown driver {} on {}, assuming {}", driver, self.port, self.kind);
                Ok(())
            }
        }
    }
}
