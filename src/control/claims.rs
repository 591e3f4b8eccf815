use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use super::ControlError;
use crate::attribute::AttributeKey;

/// Table of actuators currently driven by a running control loop.
///
/// Claiming is the only way to start a loop, and a claim is held by an
/// [`ActuatorLease`] until the loop has stopped, so two loops can never write
/// the same actuator at the same time.
#[derive(Clone, Debug, Default)]
pub struct ActuatorClaims {
    claimed: Arc<Mutex<HashSet<AttributeKey>>>,
}

impl ActuatorClaims {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(&self, key: &AttributeKey) -> Result<ActuatorLease, ControlError> {
        let mut claimed = self
            .claimed
            .lock()
            .map_err(|e| ControlError::Internal(format!("Claims table poisoned: {}", e)))?;

        if !claimed.insert(key.clone()) {
            warn!("Rejected second writer for actuator {}", key);
            return Err(ControlError::ActuatorBusy(key.clone()));
        }

        debug!("Actuator {} claimed", key);
        Ok(ActuatorLease {
            key: key.clone(),
            claims: self.claimed.clone(),
        })
    }

    pub fn is_claimed(&self, key: &AttributeKey) -> bool {
        self.claimed
            .lock()
            .map(|claimed| claimed.contains(key))
            .unwrap_or(false)
    }
}

/// Exclusive write ownership of one actuator; released on drop
#[derive(Debug)]
pub struct ActuatorLease {
    key: AttributeKey,
    claims: Arc<Mutex<HashSet<AttributeKey>>>,
}

impl ActuatorLease {
    pub fn key(&self) -> &AttributeKey {
        &self.key
    }
}

impl Drop for ActuatorLease {
    fn drop(&mut self) {
        match self.claims.lock() {
            Ok(mut claimed) => {
                claimed.remove(&self.key);
                debug!("Actuator {} released", self.key);
            }
            Err(e) => warn!("Could not release actuator {}: {}", self.key, e),
        }
    }
}
