use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::{AttributeError, AttributeKey, AttributeSink, AttributeSource, AttributeValue};

/// Lock-free `f64` cell shared between one writer and any number of readers.
///
/// Used for gamepad axes, PID diagnostics and anywhere a live scalar has to be
/// handed across tasks without a mutex. Clones share the same cell.
#[derive(Clone, Debug)]
pub struct SharedValue {
    key: AttributeKey,
    bits: Arc<AtomicU64>,
}

impl SharedValue {
    pub fn new(key: AttributeKey, initial: f64) -> Self {
        Self {
            key,
            bits: Arc::new(AtomicU64::new(initial.to_bits())),
        }
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }

    pub fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Release);
    }

    pub fn key(&self) -> &AttributeKey {
        &self.key
    }
}

impl AttributeSource for SharedValue {
    fn key(&self) -> &AttributeKey {
        &self.key
    }

    fn read(&mut self) -> Result<AttributeValue, AttributeError> {
        Ok(AttributeValue::Float(self.get()))
    }

    fn read_f64(&mut self) -> Result<f64, AttributeError> {
        Ok(self.get())
    }
}

impl AttributeSink for SharedValue {
    fn key(&self) -> &AttributeKey {
        &self.key
    }

    fn write(&mut self, value: &AttributeValue) -> Result<(), AttributeError> {
        self.set(value.as_f64()?);
        Ok(())
    }
}
