use chrono::Local;
use gilrs::{Axis, Button, Event, EventType, Gamepad, GamepadId, Gilrs};
use statum::{machine, state};
use std::collections::HashMap;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{AxisKind, GamepadError, InputEvent};
use crate::signal::apply_deadzone;

// Idle sleep between polls when gilrs has no pending event
const IDLE_POLL: Duration = Duration::from_millis(1);

#[derive(Clone, Debug)]
pub struct CollectorSettings {
    pub deadzone: f64,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self { deadzone: 0.05 }
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum CollectionState {
    Initializing,
    Collecting,
}

#[machine]
#[derive(Debug)]
pub struct EventCollector<S: CollectionState> {
    gilrs: Gilrs,
    active_gamepad: Option<GamepadId>,
    settings: CollectorSettings,
    event_sender: mpsc::Sender<InputEvent>,
    // Last value sent per input, unchanged readings are not forwarded
    last_values: HashMap<AxisKind, f64>,
    shutdown: CancellationToken,
}

impl EventCollector<Initializing> {
    pub fn create(
        settings: CollectorSettings,
        event_sender: mpsc::Sender<InputEvent>,
        shutdown: CancellationToken,
    ) -> Result<Self, GamepadError> {
        debug!("Creating gamepad collector with settings: {:?}", settings);

        let gilrs = match Gilrs::new() {
            Ok(g) => {
                info!("Successfully initialized gilrs");
                g
            }
            Err(e) => {
                error!("Failed to initialize gilrs: {}", e);
                return Err(GamepadError::InitializationError(e.to_string()));
            }
        };

        Ok(Self::new(
            gilrs,
            None,
            settings,
            event_sender,
            HashMap::new(),
            shutdown,
        ))
    }

    /// Picks the first connected gamepad; events from others are ignored
    pub fn initialize(mut self) -> EventCollector<Collecting> {
        let gamepads: Vec<(GamepadId, Gamepad<'_>)> = self.gilrs.gamepads().collect();

        if gamepads.is_empty() {
            warn!("No gamepad connected, accepting events from the first one to appear");
        } else {
            info!("Found {} gamepads:", gamepads.len());
            for (idx, (id, gamepad)) in gamepads.iter().enumerate() {
                info!("  [{}] ID: {}, Name: {}", idx, id, gamepad.name());
            }
            let (id, gamepad) = &gamepads[0];
            self.active_gamepad = Some(*id);
            info!("Selected gamepad: {} ({})", gamepad.name(), id);
        }

        self.transition()
    }
}

impl EventCollector<Collecting> {
    /// Forwards at most one pending event. Returns whether an event was read.
    pub fn collect_next_event(&mut self) -> Result<bool, GamepadError> {
        let Some(Event { id, event, .. }) = self.gilrs.next_event() else {
            return Ok(false);
        };

        match self.active_gamepad {
            Some(active_id) if id != active_id => {
                debug!("Skipping event from non-active gamepad: {:?}", id);
                return Ok(true);
            }
            None => {
                info!("Gamepad {} became active", id);
                self.active_gamepad = Some(id);
            }
            _ => {}
        }

        let Some(input) = self.convert_gilrs_event(event) else {
            return Ok(true);
        };

        match self.event_sender.try_send(input) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(input)) => {
                debug!("Router queue full, dropping {:?}", input);
                Ok(true)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(GamepadError::EventSendError(
                "Router channel closed".to_string(),
            )),
        }
    }

    /// Polls gilrs until shutdown or until the router goes away
    pub fn run_collection_loop(&mut self) {
        info!("Starting gamepad collection loop");

        let mut event_count: u64 = 0;
        let mut last_log_time = Local::now();
        let log_interval = chrono::Duration::seconds(30);

        while !self.shutdown.is_cancelled() {
            match self.collect_next_event() {
                Ok(true) => event_count += 1,
                Ok(false) => thread::sleep(IDLE_POLL),
                Err(e) => {
                    warn!("Stopping gamepad collection: {}", e);
                    break;
                }
            }

            let now = Local::now();
            if now - last_log_time > log_interval {
                debug!(
                    "Gamepad collector stats: {} events in last {} seconds",
                    event_count,
                    log_interval.num_seconds()
                );
                event_count = 0;
                last_log_time = now;
            }
        }

        info!("Gamepad collection loop finished");
    }

    fn convert_gilrs_event(&mut self, event: EventType) -> Option<InputEvent> {
        let (axis, raw) = match event {
            EventType::AxisChanged(axis, value, _) => (map_axis(axis)?, value),
            EventType::ButtonChanged(button, value, _) => (map_trigger(button)?, value),
            EventType::ButtonPressed(button, _) => (map_button(button)?, 1.0),
            EventType::ButtonReleased(button, _) => (map_button(button)?, 0.0),
            EventType::Connected => {
                info!("Controller connected event detected");
                return None;
            }
            EventType::Disconnected => {
                warn!("Controller disconnected event detected");
                return None;
            }
            _ => return None,
        };

        let value = shape_value(axis, f64::from(raw), self.settings.deadzone);
        if self.last_values.insert(axis, value) == Some(value) {
            return None;
        }

        debug!("{} = {:.4}", axis, value);
        Some(InputEvent::new(axis, value))
    }
}

/// Owns the collector thread
#[derive(Debug)]
pub struct CollectorHandle {
    thread: thread::JoinHandle<()>,
}

impl CollectorHandle {
    /// Spawns the gilrs thread. The `Gilrs` context is created on that thread
    /// and never leaves it.
    pub fn spawn(
        settings: CollectorSettings,
        event_sender: mpsc::Sender<InputEvent>,
        shutdown: CancellationToken,
    ) -> Result<Self, GamepadError> {
        info!("Spawning gamepad collector with settings: {:?}", settings);

        let thread = thread::Builder::new()
            .name("gamepad-collector".to_string())
            .spawn(move || {
                match EventCollector::create(settings, event_sender, shutdown) {
                    Ok(collector) => collector.initialize().run_collection_loop(),
                    Err(e) => error!("Gamepad collector not started: {}", e),
                }
            })
            .map_err(|e| GamepadError::InitializationError(e.to_string()))?;

        Ok(Self { thread })
    }

    /// Waits for the thread to exit; the shutdown token must be cancelled first
    pub async fn join(self) -> Result<(), GamepadError> {
        let thread = self.thread;
        match tokio::task::spawn_blocking(move || thread.join()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(GamepadError::TaskError(
                "Collector thread panicked".to_string(),
            )),
            Err(e) => Err(GamepadError::TaskError(e.to_string())),
        }
    }
}

fn map_axis(axis: Axis) -> Option<AxisKind> {
    match axis {
        Axis::LeftStickX => Some(AxisKind::LeftStickX),
        Axis::LeftStickY => Some(AxisKind::LeftStickY),
        Axis::RightStickX => Some(AxisKind::RightStickX),
        Axis::RightStickY => Some(AxisKind::RightStickY),
        Axis::LeftZ => Some(AxisKind::LeftTrigger),
        Axis::RightZ => Some(AxisKind::RightTrigger),
        _ => None,
    }
}

// Analog triggers report through ButtonChanged on most pads
fn map_trigger(button: Button) -> Option<AxisKind> {
    match button {
        Button::LeftTrigger2 => Some(AxisKind::LeftTrigger),
        Button::RightTrigger2 => Some(AxisKind::RightTrigger),
        _ => None,
    }
}

fn map_button(button: Button) -> Option<AxisKind> {
    match button {
        Button::South => Some(AxisKind::ButtonA),
        Button::East => Some(AxisKind::ButtonB),
        Button::West => Some(AxisKind::ButtonX),
        Button::North => Some(AxisKind::ButtonY),
        Button::LeftTrigger => Some(AxisKind::LeftBumper),
        Button::RightTrigger => Some(AxisKind::RightBumper),
        Button::Select => Some(AxisKind::Select),
        Button::Start => Some(AxisKind::Start),
        Button::DPadUp => Some(AxisKind::DPadUp),
        Button::DPadDown => Some(AxisKind::DPadDown),
        Button::DPadLeft => Some(AxisKind::DPadLeft),
        Button::DPadRight => Some(AxisKind::DPadRight),
        _ => None,
    }
}

fn shape_value(axis: AxisKind, value: f64, deadzone: f64) -> f64 {
    if axis.is_stick() {
        apply_deadzone(value, deadzone)
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sticks_and_triggers_are_mapped() {
        assert_eq!(map_axis(Axis::RightStickX), Some(AxisKind::RightStickX));
        assert_eq!(map_axis(Axis::LeftZ), Some(AxisKind::LeftTrigger));
        assert_eq!(map_axis(Axis::DPadX), None);
        assert_eq!(map_trigger(Button::RightTrigger2), Some(AxisKind::RightTrigger));
        assert_eq!(map_trigger(Button::South), None);
    }

    #[test]
    fn digital_buttons_are_mapped() {
        assert_eq!(map_button(Button::West), Some(AxisKind::ButtonX));
        assert_eq!(map_button(Button::East), Some(AxisKind::ButtonB));
        assert_eq!(map_button(Button::RightTrigger), Some(AxisKind::RightBumper));
        // Analog triggers arrive through ButtonChanged
        assert_eq!(map_button(Button::RightTrigger2), None);
        assert!(AxisKind::ButtonX.is_button());
        assert!(!AxisKind::RightTrigger.is_button());
        assert!(!AxisKind::LeftStickY.is_button());
    }

    #[test]
    fn deadzone_applies_to_sticks_only() {
        assert_eq!(shape_value(AxisKind::LeftStickX, 0.03, 0.05), 0.0);
        assert_eq!(shape_value(AxisKind::RightTrigger, 0.03, 0.05), 0.03);
        assert_eq!(shape_value(AxisKind::ButtonA, 1.0, 0.05), 1.0);
    }
}
