use std::collections::HashMap;
use tracing::{debug, info};

use super::{
    normalize_port, AttributeError, AttributeKey, AttributeSink, AttributeSource, DeviceDescriptor,
    SharedValue,
};

/// A read-only pseudo-device made of live in-memory cells (PID state, gamepad axes)
#[derive(Clone, Debug)]
pub struct VirtualDevice {
    name: String,
    cells: Vec<SharedValue>,
}

impl VirtualDevice {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cells: Vec::new(),
        }
    }

    pub fn with_cell(mut self, cell: SharedValue) -> Self {
        self.cells.push(cell);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cell(&self, property: &str) -> Option<&SharedValue> {
        self.cells.iter().find(|c| c.key().name == property)
    }

    pub fn properties(&self) -> impl Iterator<Item = &str> {
        self.cells.iter().map(|c| c.key().name.as_str())
    }
}

/// Name-to-device table, built once during setup and then shared read-only.
///
/// Resolution of `(port, property)` happens here when a control loop is
/// configured or a stream is requested. The returned handles are independent of
/// each other, so the control loop and any number of stream sessions can poll
/// the same device without sharing a file cursor or a lock.
#[derive(Default, Debug)]
pub struct AttributeRegistry {
    devices: HashMap<String, DeviceDescriptor>,
    virtual_devices: HashMap<String, VirtualDevice>,
}

impl AttributeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_device(&mut self, device: DeviceDescriptor) {
        info!(
            "Registered {} on {} at {}",
            device.kind(),
            device.port(),
            device.folder().display()
        );
        self.devices.insert(device.port().to_string(), device);
    }

    pub fn register_virtual(&mut self, device: VirtualDevice) {
        info!(
            "Registered virtual device {} [{}]",
            device.name(),
            device.properties().collect::<Vec<_>>().join(", ")
        );
        self.virtual_devices.insert(device.name().to_string(), device);
    }

    pub fn device(&self, port: &str) -> Result<&DeviceDescriptor, AttributeError> {
        let port = normalize_port(port)?;
        self.devices
            .get(&port)
            .ok_or(AttributeError::UnknownPort(port))
    }

    pub fn contains(&self, port: &str) -> bool {
        self.virtual_devices.contains_key(port) || self.device(port).is_ok()
    }

    /// Opens a new readable handle on `port!property`
    pub fn open_source(
        &self,
        port: &str,
        property: &str,
    ) -> Result<Box<dyn AttributeSource>, AttributeError> {
        debug!("Resolving source {}!{}", port, property);

        if let Some(device) = self.virtual_devices.get(port) {
            return device
                .cell(property)
                .map(|cell| Box::new(cell.clone()) as Box<dyn AttributeSource>)
                .ok_or_else(|| AttributeError::UnknownProperty {
                    port: port.to_string(),
                    property: property.to_string(),
                });
        }

        let device = self.device(port)?;
        let spec = device.spec(property)?;
        if !spec.access.readable() {
            return Err(AttributeError::NotReadable(AttributeKey::new(
                device.port(),
                spec.name,
            )));
        }
        Ok(Box::new(device.open(property)?))
    }

    /// Opens a new writable handle on `port!property`. Virtual devices are
    /// read-only and never resolve here.
    pub fn open_sink(
        &self,
        port: &str,
        property: &str,
    ) -> Result<Box<dyn AttributeSink>, AttributeError> {
        debug!("Resolving sink {}!{}", port, property);

        if self.virtual_devices.contains_key(port) {
            return Err(AttributeError::NotWritable(AttributeKey::new(port, property)));
        }

        let device = self.device(port)?;
        let spec = device.spec(property)?;
        if !spec.access.writable() {
            return Err(AttributeError::NotWritable(AttributeKey::new(
                device.port(),
                spec.name,
            )));
        }
        Ok(Box::new(device.open(property)?))
    }
}
