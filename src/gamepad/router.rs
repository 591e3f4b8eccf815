use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{AxisBinding, AxisKind, GamepadError, InputEvent, StepBinding};
use crate::attribute::{AttributeKey, DeviceDescriptor, DeviceKind, SharedValue, VirtualDevice};
use crate::signal::SignalChain;

/// Virtual device exposing the raw value of every bound axis
pub const GAMEPAD_DEVICE: &str = "gamepad";
/// Virtual device exposing every binding target
pub const SETPOINT_DEVICE: &str = "setpoint";

#[derive(Clone, Debug)]
struct Route {
    chain: SignalChain,
    target: SharedValue,
}

#[derive(Clone, Debug)]
struct Stepper {
    motor: DeviceDescriptor,
    increment: i64,
    duty_cycle: Option<i64>,
}

// A button counts as pressed from this value up
const PRESS_THRESHOLD: f64 = 0.5;

/// Fans axis readings out to setpoint cells.
///
/// One axis may feed several targets, each through its own transform chain.
/// Several bindings may also share a target; the last routed event wins.
/// Step bindings fire once per press, on the released-to-pressed edge.
#[derive(Debug)]
pub struct AxisRouter {
    routes: HashMap<AxisKind, Vec<Route>>,
    steppers: HashMap<AxisKind, Vec<Stepper>>,
    raw_axes: HashMap<AxisKind, SharedValue>,
    targets: HashMap<String, SharedValue>,
}

impl AxisRouter {
    pub fn new(bindings: &[AxisBinding]) -> Result<Self, GamepadError> {
        let mut routes: HashMap<AxisKind, Vec<Route>> = HashMap::new();
        let mut raw_axes = HashMap::new();
        let mut targets: HashMap<String, SharedValue> = HashMap::new();

        for binding in bindings {
            if binding.target.is_empty() {
                return Err(GamepadError::InvalidBinding {
                    axis: binding.axis,
                    target: binding.target.clone(),
                    reason: "target name is empty".to_string(),
                });
            }
            binding
                .transforms
                .validate()
                .map_err(|reason| GamepadError::InvalidBinding {
                    axis: binding.axis,
                    target: binding.target.clone(),
                    reason,
                })?;

            let target = targets
                .entry(binding.target.clone())
                .or_insert_with(|| {
                    SharedValue::new(AttributeKey::new(SETPOINT_DEVICE, &binding.target), 0.0)
                })
                .clone();
            raw_axes.entry(binding.axis).or_insert_with(|| {
                SharedValue::new(AttributeKey::new(GAMEPAD_DEVICE, binding.axis.name()), 0.0)
            });

            debug!(
                "Binding {} -> {} through {} stages",
                binding.axis,
                binding.target,
                binding.transforms.stages().len()
            );
            routes.entry(binding.axis).or_default().push(Route {
                chain: binding.transforms.clone(),
                target,
            });
        }

        info!(
            "Axis router created with {} bindings on {} axes",
            bindings.len(),
            routes.len()
        );
        Ok(Self {
            routes,
            steppers: HashMap::new(),
            raw_axes,
            targets,
        })
    }

    /// Adds a step binding moving `motor`, the device configured on the
    /// binding's port
    pub fn with_step(mut self, step: &StepBinding, motor: DeviceDescriptor) -> Result<Self, GamepadError> {
        let reject = |reason: String| GamepadError::InvalidBinding {
            axis: step.button,
            target: step.port.clone(),
            reason,
        };
        if !step.button.is_button() {
            return Err(reject(format!("{} is not a button", step.button)));
        }
        if motor.kind() != DeviceKind::TachoMotor {
            return Err(reject(format!("{} on {} cannot step", motor.kind(), motor.port())));
        }

        debug!(
            "Step binding {} -> {} by {} counts",
            step.button,
            motor.port(),
            step.increment
        );
        self.raw_axes.entry(step.button).or_insert_with(|| {
            SharedValue::new(AttributeKey::new(GAMEPAD_DEVICE, step.button.name()), 0.0)
        });
        self.steppers.entry(step.button).or_default().push(Stepper {
            motor,
            increment: step.increment,
            duty_cycle: step.duty_cycle,
        });
        Ok(self)
    }

    /// Applies one reading to every binding of its axis
    pub fn route(&self, event: &InputEvent) {
        let mut pressed = false;
        if let Some(raw) = self.raw_axes.get(&event.axis) {
            pressed = raw.get() < PRESS_THRESHOLD && event.value >= PRESS_THRESHOLD;
            raw.set(event.value);
        }

        if pressed {
            for stepper in self.steppers.get(&event.axis).into_iter().flatten() {
                debug!("{} pressed, moving {} by {}", event.axis, stepper.motor.port(), stepper.increment);
                if let Err(e) = stepper
                    .motor
                    .run_to_rel_pos(stepper.increment, stepper.duty_cycle)
                {
                    warn!("Step of {} on {} failed: {}", stepper.motor.port(), event.axis, e);
                }
            }
        }

        for route in self.routes.get(&event.axis).into_iter().flatten() {
            let value = route.chain.apply(event.value);
            route.target.set(value);
            debug!("{} {:.4} -> {} = {:.4}", event.axis, event.value, route.target.key(), value);
        }
    }

    pub fn target(&self, name: &str) -> Option<&SharedValue> {
        self.targets.get(name)
    }

    pub fn has_target(&self, name: &str) -> bool {
        self.targets.contains_key(name)
    }

    pub fn gamepad_device(&self) -> VirtualDevice {
        self.raw_axes
            .values()
            .fold(VirtualDevice::new(GAMEPAD_DEVICE), |device, cell| {
                device.with_cell(cell.clone())
            })
    }

    pub fn setpoint_device(&self) -> VirtualDevice {
        self.targets
            .values()
            .fold(VirtualDevice::new(SETPOINT_DEVICE), |device, cell| {
                device.with_cell(cell.clone())
            })
    }
}

/// Feeds events from the collector into `router` until shutdown or until the
/// collector drops its sender
pub fn spawn_router(
    router: Arc<AxisRouter>,
    mut events: mpsc::Receiver<InputEvent>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Axis router running");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown signal received for axis router");
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => router.route(&event),
                    None => {
                        info!("Gamepad event channel closed");
                        break;
                    }
                },
            }
        }
    })
}
