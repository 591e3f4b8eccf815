//! Fixed-frequency control loops
//!
//! A control loop ties a control law to one actuator and its input sources:
//!
//! ```text
//! setpoint source ──┐
//!                   ├──► ControlLaw (PID / direct) ──► actuator sink
//! process variable ─┘
//! ```
//!
//! Each loop runs in its own tokio task. Write ownership of the actuator is
//! checked through [`ActuatorClaims`] before the task is spawned.

pub mod claims;
pub mod control_loop;

use std::time::Duration;

use crate::attribute::{AttributeError, AttributeKey};
use crate::pid::{PidController, PidError};

pub use claims::{ActuatorClaims, ActuatorLease};
pub use control_loop::{
    ControlLoop, ControlLoopHandle, ControlLoopSettings, LoopSnapshot, LoopState, LoopStats,
};

/// How a loop turns its inputs into an actuator command
#[derive(Clone, Debug)]
pub enum ControlLaw {
    /// Closed loop on a process variable
    Pid(PidController),
    /// Open loop: output = gain * setpoint
    Direct { gain: f64 },
}

impl ControlLaw {
    pub fn needs_process_variable(&self) -> bool {
        matches!(self, ControlLaw::Pid(_))
    }
}

/// Period of one tick at `frequency_hz`, or `None` when the frequency is not
/// positive or its period does not fit a non-zero [`Duration`]
pub fn tick_period(frequency_hz: f64) -> Option<Duration> {
    if !frequency_hz.is_finite() || frequency_hz <= 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(1.0 / frequency_hz)
        .ok()
        .filter(|period| !period.is_zero())
}

// Control errors
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("Actuator {0} is already driven by another control loop")]
    ActuatorBusy(AttributeKey),

    #[error("Invalid loop frequency: {0} Hz")]
    InvalidFrequency(f64),

    #[error("Control loop {0} needs a process variable source")]
    MissingProcessVariable(String),

    #[error("Attribute error: {0}")]
    Attribute(#[from] AttributeError),

    #[error("PID error: {0}")]
    Pid(#[from] PidError),

    #[error("Control task error: {0}")]
    TaskError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
