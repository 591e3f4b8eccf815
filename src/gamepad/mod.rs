//! Gamepad input routing
//!
//! ```text
//! gilrs thread ──► mpsc ──► router task ──► SignalChain ──► setpoint cells
//! (collector)               (AxisRouter)                    (read by loops)
//! ```
//!
//! The collector owns the `Gilrs` context on a dedicated OS thread and forwards
//! axis and button changes as [`InputEvent`]s (buttons read 0 or 1). The router
//! applies each binding's transforms and stores the result in a named setpoint
//! cell. Cells are exposed to the rest of the system as the virtual devices
//! `gamepad` (raw inputs) and `setpoint` (transformed targets), so control loops
//! and stream clients read them like any other attribute.
//!
//! Step bindings turn a button press into a relative move of a tacho motor
//! (`run-to-rel-pos`), for mechanisms positioned in discrete increments.

pub mod collector;
pub mod router;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::signal::SignalChain;

pub use collector::{CollectorHandle, CollectorSettings, EventCollector};
pub use router::{AxisRouter, GAMEPAD_DEVICE, SETPOINT_DEVICE};

// Events buffered between the gilrs thread and the router
const EVENT_QUEUE_CAPACITY: usize = 256;

/// Gamepad inputs that can be bound: analog axes and digital buttons.
/// Face buttons carry Xbox labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AxisKind {
    LeftStickX,
    LeftStickY,
    RightStickX,
    RightStickY,
    LeftTrigger,
    RightTrigger,
    ButtonA,
    ButtonB,
    ButtonX,
    ButtonY,
    LeftBumper,
    RightBumper,
    Select,
    Start,
    DPadUp,
    DPadDown,
    DPadLeft,
    DPadRight,
}

impl AxisKind {
    pub fn name(&self) -> &'static str {
        match self {
            AxisKind::LeftStickX => "LeftStickX",
            AxisKind::LeftStickY => "LeftStickY",
            AxisKind::RightStickX => "RightStickX",
            AxisKind::RightStickY => "RightStickY",
            AxisKind::LeftTrigger => "LeftTrigger",
            AxisKind::RightTrigger => "RightTrigger",
            AxisKind::ButtonA => "ButtonA",
            AxisKind::ButtonB => "ButtonB",
            AxisKind::ButtonX => "ButtonX",
            AxisKind::ButtonY => "ButtonY",
            AxisKind::LeftBumper => "LeftBumper",
            AxisKind::RightBumper => "RightBumper",
            AxisKind::Select => "Select",
            AxisKind::Start => "Start",
            AxisKind::DPadUp => "DPadUp",
            AxisKind::DPadDown => "DPadDown",
            AxisKind::DPadLeft => "DPadLeft",
            AxisKind::DPadRight => "DPadRight",
        }
    }

    pub fn is_stick(&self) -> bool {
        matches!(
            self,
            AxisKind::LeftStickX
                | AxisKind::LeftStickY
                | AxisKind::RightStickX
                | AxisKind::RightStickY
        )
    }

    /// Digital inputs reporting 0 (released) or 1 (pressed)
    pub fn is_button(&self) -> bool {
        !self.is_stick() && !matches!(self, AxisKind::LeftTrigger | AxisKind::RightTrigger)
    }
}

impl fmt::Display for AxisKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One axis or button reading from the collector
#[derive(Debug, Clone)]
pub struct InputEvent {
    pub axis: AxisKind,
    pub value: f64,
    pub timestamp: DateTime<Local>,
}

impl InputEvent {
    pub fn new(axis: AxisKind, value: f64) -> Self {
        Self {
            axis,
            value,
            timestamp: Local::now(),
        }
    }
}

/// Routes one axis through a chain of transforms into a named setpoint cell
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AxisBinding {
    pub axis: AxisKind,
    pub target: String,
    #[serde(default)]
    pub transforms: SignalChain,
}

/// Moves the tacho motor on `port` by `increment` counts on every press of
/// `button`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepBinding {
    pub button: AxisKind,
    pub port: String,
    pub increment: i64,
    /// Duty cycle written before each move; the motor's current one otherwise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duty_cycle: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GamepadSettings {
    pub enabled: bool,
    /// Stick deadzone applied by the collector before any binding
    pub deadzone: f64,
    pub bindings: Vec<AxisBinding>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepBinding>,
}

impl Default for GamepadSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            deadzone: 0.05,
            bindings: Vec::new(),
            steps: Vec::new(),
        }
    }
}

// Gamepad errors
#[derive(Debug, thiserror::Error)]
pub enum GamepadError {
    #[error("Failed to initialize gamepad input: {0}")]
    InitializationError(String),

    #[error("Failed to send event: {0}")]
    EventSendError(String),

    #[error("Invalid binding for {axis} -> {target}: {reason}")]
    InvalidBinding {
        axis: AxisKind,
        target: String,
        reason: String,
    },

    #[error("Gamepad task error: {0}")]
    TaskError(String),
}

/// Running collector thread plus router task
#[derive(Debug)]
pub struct GamepadHandle {
    shutdown: CancellationToken,
    collector: Option<CollectorHandle>,
    router_task: Option<JoinHandle<()>>,
}

impl GamepadHandle {
    /// Starts the gilrs collector thread and the router task feeding `router`
    pub fn start(
        settings: &GamepadSettings,
        router: Arc<AxisRouter>,
    ) -> Result<Self, GamepadError> {
        let (event_sender, event_receiver) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let shutdown = CancellationToken::new();

        let collector = CollectorHandle::spawn(
            CollectorSettings {
                deadzone: settings.deadzone,
            },
            event_sender,
            shutdown.child_token(),
        )?;
        let router_task = router::spawn_router(router, event_receiver, shutdown.child_token());

        info!("Gamepad input started");
        Ok(Self {
            shutdown,
            collector: Some(collector),
            router_task: Some(router_task),
        })
    }

    /// Stops routing and joins the collector thread. Calling it again is a no-op.
    pub async fn stop(&mut self) -> Result<(), GamepadError> {
        debug!("Sending shutdown signal to gamepad input");
        self.shutdown.cancel();

        if let Some(task) = self.router_task.take() {
            task.await.map_err(|e| {
                error!("Router task panicked: {}", e);
                GamepadError::TaskError(format!("Router task failed: {}", e))
            })?;
        }

        if let Some(collector) = self.collector.take() {
            collector.join().await?;
        }

        info!("Gamepad input stopped");
        Ok(())
    }
}

impl Drop for GamepadHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
