//! Process assembly
//!
//! ```text
//! BrickConfig ──► App::build ──► App::start ──► RunningApp::shutdown
//!                 (resolve)      (spawn)        (stop, reset motors)
//! ```
//!
//! `build` resolves every device and attribute named by the configuration, so
//! nothing is spawned unless the whole layout is usable. `shutdown` stops the
//! control loops before resetting the motors they drive.

use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::attribute::{AttributeRegistry, DeviceDescriptor};
use crate::config::{BrickConfig, ConfigError, LawConfig, LoopConfig};
use crate::control::control_loop::Configured;
use crate::control::{
    ActuatorClaims, ControlError, ControlLaw, ControlLoop, ControlLoopHandle, ControlLoopSettings,
};
use crate::gamepad::{AxisRouter, GamepadError, GamepadHandle, SETPOINT_DEVICE};
use crate::pid::{PidController, PidProbe};
use crate::stream::{StreamError, StreamServer, StreamServerHandle};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Control error: {0}")]
    Control(#[from] ControlError),

    #[error("Gamepad error: {0}")]
    Gamepad(#[from] GamepadError),

    #[error("Stream server error: {0}")]
    Stream(#[from] StreamError),
}

/// A fully resolved but not yet running system
pub struct App {
    config: BrickConfig,
    registry: Arc<AttributeRegistry>,
    router: Arc<AxisRouter>,
    loops: Vec<ControlLoop<Configured>>,
    // Motors driven by a loop, switched to run-direct on start and reset on stop
    actuators: Vec<DeviceDescriptor>,
}

impl App {
    pub fn build(config: BrickConfig) -> Result<Self, AppError> {
        config.validate()?;

        let mut router = AxisRouter::new(&config.gamepad.bindings)?;

        let mut registry = AttributeRegistry::new();
        for device in &config.devices {
            let descriptor = DeviceDescriptor::new(&device.port, device.kind, &device.path)
                .map_err(ConfigError::from)?;
            descriptor.check_driver().map_err(ConfigError::from)?;
            if let Some(mode) = &device.mode {
                descriptor.set_mode(mode).map_err(ConfigError::from)?;
            }
            registry.register_device(descriptor);
        }

        for step in &config.gamepad.steps {
            let motor = registry.device(&step.port).map_err(ConfigError::from)?.clone();
            router = router.with_step(step, motor)?;
        }
        registry.register_virtual(router.gamepad_device());
        registry.register_virtual(router.setpoint_device());
        let router = Arc::new(router);

        let probes: Vec<Option<PidProbe>> = config
            .loops
            .iter()
            .map(|control_loop| control_loop.probe_name().map(PidProbe::new))
            .collect();
        for probe in probes.iter().flatten() {
            registry.register_virtual(probe.to_virtual_device());
        }

        let mut loops = Vec::with_capacity(config.loops.len());
        let mut actuators = Vec::new();
        for (loop_config, probe) in config.loops.iter().zip(probes) {
            loops.push(build_loop(&registry, loop_config, probe)?);

            let device = registry
                .device(&loop_config.actuator.port)
                .map_err(ConfigError::from)?;
            if !actuators
                .iter()
                .any(|known: &DeviceDescriptor| known.port() == device.port())
            {
                actuators.push(device.clone());
            }
        }

        info!(
            "Assembled {} devices, {} bindings, {} step bindings, {} control loops",
            config.devices.len(),
            config.gamepad.bindings.len(),
            config.gamepad.steps.len(),
            loops.len()
        );

        Ok(Self {
            config,
            registry: Arc::new(registry),
            router,
            loops,
            actuators,
        })
    }

    pub fn registry(&self) -> Arc<AttributeRegistry> {
        self.registry.clone()
    }

    pub fn router(&self) -> Arc<AxisRouter> {
        self.router.clone()
    }

    /// Puts the motors in run-direct mode, then starts loops, gamepad input and
    /// the stream server
    pub async fn start(self) -> Result<RunningApp, AppError> {
        for device in &self.actuators {
            if let Err(e) = device.run_direct() {
                warn!("Could not switch {} to run-direct: {}", device.port(), e);
            }
        }

        let mut running = RunningApp {
            loops: Vec::with_capacity(self.loops.len()),
            gamepad: None,
            server: None,
            actuators: self.actuators,
        };

        let claims = ActuatorClaims::new();
        for control_loop in self.loops {
            match ControlLoopHandle::start(control_loop, &claims) {
                Ok(handle) => running.loops.push(handle),
                Err(e) => {
                    running.shutdown().await;
                    return Err(e.into());
                }
            }
        }

        if self.config.gamepad.enabled {
            match GamepadHandle::start(&self.config.gamepad, self.router.clone()) {
                Ok(handle) => running.gamepad = Some(handle),
                Err(e) => {
                    running.shutdown().await;
                    return Err(e.into());
                }
            }
        }

        if self.config.server.enabled {
            match StreamServer::serve(&self.config.server, self.registry.clone()).await {
                Ok(handle) => running.server = Some(handle),
                Err(e) => {
                    running.shutdown().await;
                    return Err(e.into());
                }
            }
        }

        info!("All subsystems running");
        Ok(running)
    }
}

fn build_loop(
    registry: &AttributeRegistry,
    loop_config: &LoopConfig,
    probe: Option<PidProbe>,
) -> Result<ControlLoop<Configured>, AppError> {
    let law = match loop_config.law {
        LawConfig::Pid { kp, kd, min, max } => {
            let pid = PidController::new(kp, kd)
                .and_then(|pid| pid.with_bounds(min, max))
                .map_err(ControlError::from)?;
            ControlLaw::Pid(pid)
        }
        LawConfig::Direct { gain } => ControlLaw::Direct { gain },
    };

    let set_point = registry
        .open_source(SETPOINT_DEVICE, &loop_config.setpoint)
        .map_err(ConfigError::from)?;
    let process_variable = match &loop_config.process_variable {
        Some(pv) => Some(
            registry
                .open_source(&pv.port, &pv.property)
                .map_err(ConfigError::from)?,
        ),
        None => None,
    };
    let actuator = registry
        .open_sink(&loop_config.actuator.port, &loop_config.actuator.property)
        .map_err(ConfigError::from)?;

    let control_loop = ControlLoop::create(
        ControlLoopSettings {
            name: loop_config.name.clone(),
            frequency_hz: loop_config.frequency,
        },
        law,
        set_point,
        process_variable,
        actuator,
    )?;

    Ok(match probe {
        Some(probe) => control_loop.with_probe(probe),
        None => control_loop,
    })
}

/// Handles of everything [`App::start`] spawned
#[derive(Debug)]
pub struct RunningApp {
    loops: Vec<ControlLoopHandle>,
    gamepad: Option<GamepadHandle>,
    server: Option<StreamServerHandle>,
    actuators: Vec<DeviceDescriptor>,
}

impl RunningApp {
    pub fn stream_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(StreamServerHandle::local_addr)
    }

    pub fn loops(&self) -> &[ControlLoopHandle] {
        &self.loops
    }

    /// Stops every loop, resets the motors, then stops input and the server.
    /// Failures are logged and do not interrupt the remaining steps.
    pub async fn shutdown(&mut self) {
        for handle in &mut self.loops {
            if let Err(e) = handle.stop().await {
                error!("Failed to stop loop {}: {}", handle.name(), e);
            }
            let stats = handle.stats();
            info!(
                "Loop {} finished after {} ticks ({} lag events)",
                handle.name(),
                stats.ticks,
                stats.lag_events
            );
        }

        for device in &self.actuators {
            if let Err(e) = device.reset() {
                warn!("Could not reset {}: {}", device.port(), e);
            }
        }

        if let Some(gamepad) = &mut self.gamepad {
            if let Err(e) = gamepad.stop().await {
                error!("Failed to stop gamepad input: {}", e);
            }
        }

        if let Some(server) = &mut self.server {
            if let Err(e) = server.stop().await {
                error!("Failed to stop stream server: {}", e);
            }
        }

        info!("Shutdown complete");
    }
}
