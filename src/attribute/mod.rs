//! Sampled device attributes
//!
//! Every scalar quantity the rest of the crate touches (a motor position, a duty
//! cycle setpoint, a gamepad axis, the internal state of a PID loop) is reached
//! through one of two small capabilities:
//!
//! 1. [`AttributeSource`] - something that can be polled for its current value
//! 2. [`AttributeSink`] - something that accepts a new value
//!
//! # Architecture
//!
//! ```text
//! AttributeRegistry ──► DeviceDescriptor ──► SysfsAttribute   (file backed)
//!        │
//!        └────────────► VirtualDevice ────► SharedValue       (memory backed)
//! ```
//!
//! Handles are never shared between consumers. The control loop and every
//! stream session open their own handle so no read cursor is shared across tasks.

pub mod device;
pub mod registry;
pub mod shared;
pub mod sysfs;

use std::fmt;
use std::path::PathBuf;

pub use device::{normalize_port, Access, DeviceDescriptor, DeviceKind, PropertySpec, ValueKind};
pub use registry::{AttributeRegistry, VirtualDevice};
pub use shared::SharedValue;
pub use sysfs::SysfsAttribute;

/// Identity of a single attribute: the owning device and the property name
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AttributeKey {
    pub owner: String,
    pub name: String,
}

impl AttributeKey {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for AttributeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}", self.owner, self.name)
    }
}

/// A device-defined reading
#[derive(Clone, Debug, PartialEq)]
pub enum AttributeValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl AttributeValue {
    /// Numeric view of the value. Text is parsed, so `"12"` from a sysfs file works.
    pub fn as_f64(&self) -> Result<f64, AttributeError> {
        match self {
            AttributeValue::Int(v) => Ok(*v as f64),
            AttributeValue::Float(v) => Ok(*v),
            AttributeValue::Text(s) => {
                s.trim()
                    .parse::<f64>()
                    .map_err(|_| AttributeError::NotNumeric(s.clone()))
            }
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Int(v) => write!(f, "{}", v),
            AttributeValue::Float(v) => write!(f, "{}", v),
            AttributeValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Float(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Int(value)
    }
}

// Attribute errors
#[derive(Debug, thiserror::Error)]
pub enum AttributeError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Attribute {0} is not readable")]
    NotReadable(AttributeKey),

    #[error("Attribute {0} is not writable")]
    NotWritable(AttributeKey),

    #[error("Unknown port: {0}")]
    UnknownPort(String),

    #[error("Device on {port} is a {found}, expected a {expected}")]
    DriverMismatch {
        port: String,
        expected: DeviceKind,
        found: DeviceKind,
    },

    #[error("Invalid port name: {0}")]
    InvalidPort(String),

    #[error("Device on {port} has no property {property}")]
    UnknownProperty { port: String, property: String },

    #[error("Value is not numeric: {0:?}")]
    NotNumeric(String),

    #[error("Failed to parse {key} from {raw:?}")]
    Parse { key: AttributeKey, raw: String },
}

/// A pollable attribute. Each call reflects the most recently committed state.
pub trait AttributeSource: Send {
    fn key(&self) -> &AttributeKey;

    fn read(&mut self) -> Result<AttributeValue, AttributeError>;

    fn read_f64(&mut self) -> Result<f64, AttributeError> {
        self.read()?.as_f64()
    }
}

/// A settable attribute
pub trait AttributeSink: Send {
    fn key(&self) -> &AttributeKey;

    fn write(&mut self, value: &AttributeValue) -> Result<(), AttributeError>;
}
