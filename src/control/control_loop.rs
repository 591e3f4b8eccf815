//! Control loop with statum state machine for its lifecycle
//!
//! # State Machine
//!
//! ```text
//! Configured ──► Running ──► Stopped
//! ```
//!
//! One tick, strictly in this order:
//!
//! 1. read the setpoint source
//! 2. read the process variable source (if the law needs one)
//! 3. step the control law
//! 4. write the result to the actuator
//!
//! The loop measures how long the tick took and sleeps for the rest of the
//! period. A tick that overruns the period skips the sleep and counts as lag.
//! Device errors are counted and logged; the loop keeps running.
//!
//! Ticks read and write sysfs files synchronously on the loop's own task. The
//! driver answers those calls without sleeping, and keeping the tick free of
//! await points is what makes cancellation land only between ticks.

use statum::{machine, state};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{tick_period, ActuatorClaims, ControlError, ControlLaw};
use crate::attribute::{AttributeSink, AttributeSource, AttributeValue};
use crate::pid::PidProbe;

// Repeated device failures and overruns are only logged once per this many ticks
const FAILURE_LOG_EVERY: u64 = 100;
const STATS_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// First occurrence and every `FAILURE_LOG_EVERY`th after it.
fn log_due(occurrences: u64) -> bool {
    occurrences % FAILURE_LOG_EVERY == 1
}

#[derive(Clone, Debug)]
pub struct ControlLoopSettings {
    pub name: String,
    pub frequency_hz: f64,
}

impl Default for ControlLoopSettings {
    fn default() -> Self {
        Self {
            name: "loop".to_string(),
            frequency_hz: 30.0,
        }
    }
}

/// Live counters of a running loop
#[derive(Debug, Default)]
pub struct LoopStats {
    ticks: AtomicU64,
    lag_events: AtomicU64,
    read_failures: AtomicU64,
    write_failures: AtomicU64,
    writes: AtomicU64,
}

impl LoopStats {
    pub fn snapshot(&self) -> LoopSnapshot {
        LoopSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            lag_events: self.lag_events.load(Ordering::Relaxed),
            read_failures: self.read_failures.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoopSnapshot {
    pub ticks: u64,
    pub lag_events: u64,
    pub read_failures: u64,
    pub write_failures: u64,
    pub writes: u64,
}

#[state]
#[derive(Debug, Clone)]
pub enum LoopState {
    Configured,
    Running,
    Stopped,
}

#[machine]
pub struct ControlLoop<S: LoopState> {
    settings: ControlLoopSettings,
    period: Duration,
    law: ControlLaw,
    set_point: Box<dyn AttributeSource>,
    process_variable: Option<Box<dyn AttributeSource>>,
    actuator: Box<dyn AttributeSink>,
    probe: Option<PidProbe>,
    stats: Arc<LoopStats>,
}

impl<S: LoopState> ControlLoop<S> {
    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn stats(&self) -> Arc<LoopStats> {
        self.stats.clone()
    }
}

impl ControlLoop<Configured> {
    pub fn create(
        settings: ControlLoopSettings,
        law: ControlLaw,
        set_point: Box<dyn AttributeSource>,
        process_variable: Option<Box<dyn AttributeSource>>,
        actuator: Box<dyn AttributeSink>,
    ) -> Result<Self, ControlError> {
        let period = tick_period(settings.frequency_hz)
            .ok_or(ControlError::InvalidFrequency(settings.frequency_hz))?;
        if law.needs_process_variable() && process_variable.is_none() {
            return Err(ControlError::MissingProcessVariable(settings.name.clone()));
        }

        info!(
            "Configured control loop {} at {} Hz driving {}",
            settings.name,
            settings.frequency_hz,
            actuator.key()
        );

        Ok(Self::new(
            settings,
            period,
            law,
            set_point,
            process_variable,
            actuator,
            None,
            Arc::new(LoopStats::default()),
        ))
    }

    /// Mirrors the PID state into `probe` after every tick
    pub fn with_probe(mut self, probe: PidProbe) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn activate(self) -> ControlLoop<Running> {
        info!("Activating control loop {}", self.settings.name);
        self.transition()
    }
}

impl ControlLoop<Running> {
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Runs one read-step-write cycle
    pub fn tick(&mut self) -> Result<f64, ControlError> {
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);

        let name = self.settings.name.as_str();
        let set_point = read_source(self.set_point.as_mut(), &self.stats, name)?;
        let process_variable = match self.process_variable.as_mut() {
            Some(source) => Some(read_source(source.as_mut(), &self.stats, name)?),
            None => None,
        };

        let output = match &mut self.law {
            ControlLaw::Pid(pid) => {
                pid.set_set_point(set_point);
                pid.set_process_variable(process_variable.unwrap_or(0.0));
                let output = pid.step();
                if let Some(probe) = &self.probe {
                    probe.publish(pid);
                }
                output
            }
            ControlLaw::Direct { gain } => *gain * set_point,
        };

        debug!(
            "Loop {}: sp={:.3} pv={:?} out={:.3}",
            self.settings.name, set_point, process_variable, output
        );

        match self.actuator.write(&AttributeValue::Float(output)) {
            Ok(()) => {
                self.stats.writes.fetch_add(1, Ordering::Relaxed);
                Ok(output)
            }
            Err(e) => {
                let failures = self.stats.write_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if log_due(failures) {
                    error!(
                        "Loop {} failed to write {} ({} failures so far): {}",
                        self.settings.name,
                        self.actuator.key(),
                        failures,
                        e
                    );
                }
                Err(e.into())
            }
        }
    }

    /// Ticks until `shutdown` is cancelled. Cancellation is observed between
    /// ticks, so a started tick always completes its write.
    pub async fn run_until_shutdown(
        mut self,
        shutdown: CancellationToken,
    ) -> ControlLoop<Stopped> {
        let period = self.period();
        info!(
            "Starting control loop {} with {:?} period",
            self.settings.name, period
        );

        let mut last_stats = Instant::now();

        loop {
            if shutdown.is_cancelled() {
                info!("Shutdown signal received for control loop {}", self.settings.name);
                break;
            }

            let tick_start = Instant::now();
            if let Err(e) = self.tick() {
                debug!("Tick of {} failed: {}", self.settings.name, e);
            }
            let elapsed = tick_start.elapsed();

            if elapsed < period {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Shutdown signal received for control loop {}", self.settings.name);
                        break;
                    }
                    _ = tokio::time::sleep(period - elapsed) => {}
                }
            } else {
                let lag_events = self.stats.lag_events.fetch_add(1, Ordering::Relaxed) + 1;
                if log_due(lag_events) {
                    warn!(
                        "Control loop {} lagging: tick took {:?} of {:?} ({} times)",
                        self.settings.name, elapsed, period, lag_events
                    );
                }
                tokio::task::yield_now().await;
            }

            if last_stats.elapsed() > STATS_LOG_INTERVAL {
                let snapshot = self.stats.snapshot();
                info!(
                    "Control loop {} stats: {} ticks, {} lag, {} read / {} write failures",
                    self.settings.name,
                    snapshot.ticks,
                    snapshot.lag_events,
                    snapshot.read_failures,
                    snapshot.write_failures
                );
                last_stats = Instant::now();
            }
        }

        info!("Control loop {} stopped", self.settings.name);
        self.transition()
    }
}

impl ControlLoop<Stopped> {}

fn read_source(
    source: &mut dyn AttributeSource,
    stats: &LoopStats,
    loop_name: &str,
) -> Result<f64, ControlError> {
    source.read_f64().map_err(|e| {
        let failures = stats.read_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if log_due(failures) {
            warn!(
                "Loop {} failed to read {} ({} failures so far): {}",
                loop_name,
                source.key(),
                failures,
                e
            );
        }
        ControlError::from(e)
    })
}

/// Handle owning a running loop task.
///
/// The actuator lease lives inside the task and is released only after the
/// last tick, so dropping the handle without [`stop`](Self::stop) still keeps
/// the actuator claimed until the loop has really exited.
#[derive(Debug)]
pub struct ControlLoopHandle {
    name: String,
    shutdown: CancellationToken,
    task_handle: Option<JoinHandle<()>>,
    stats: Arc<LoopStats>,
}

impl ControlLoopHandle {
    /// Claims the loop's actuator and spawns the loop task.
    ///
    /// Fails with [`ControlError::ActuatorBusy`] before anything is spawned when
    /// another running loop already owns the actuator.
    pub fn start(
        control_loop: ControlLoop<Configured>,
        claims: &ActuatorClaims,
    ) -> Result<Self, ControlError> {
        let lease = claims.claim(control_loop.actuator.key())?;
        let name = control_loop.name().to_string();
        let stats = control_loop.stats();

        let running = control_loop.activate();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let task_name = name.clone();
        info!("Control loop {} started on {}", name, lease.key());
        let task_handle = tokio::spawn(async move {
            let _stopped = running.run_until_shutdown(token).await;
            drop(lease);
            debug!("Control loop task finished: {}", task_name);
        });

        Ok(Self {
            name,
            shutdown,
            task_handle: Some(task_handle),
            stats,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> LoopSnapshot {
        self.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.task_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stops the loop and waits for its task to exit. Calling it again is a no-op.
    pub async fn stop(&mut self) -> Result<(), ControlError> {
        debug!("Sending shutdown signal to control loop: {}", self.name);
        self.shutdown.cancel();

        match self.task_handle.take() {
            Some(handle) => match handle.await {
                Ok(()) => {
                    debug!("Control loop task completed: {}", self.name);
                    Ok(())
                }
                Err(e) => {
                    error!("Control loop task panicked: {} - {}", self.name, e);
                    Err(ControlError::TaskError(format!(
                        "Control loop task failed: {}",
                        e
                    )))
                }
            },
            None => {
                debug!("Control loop already stopped: {}", self.name);
                Ok(())
            }
        }
    }
}

impl Drop for ControlLoopHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
