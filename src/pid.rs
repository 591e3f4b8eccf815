//! Proportional-derivative controller
//!
//! The controller holds its gains, the latest setpoint and process variable, and
//! the memory needed for the derivative term. Each call to [`PidController::step`]
//! advances it by one sample:
//!
//! ```text
//! error   = SetPoint - ProcessVariable
//! derror  = error - previous_error
//! u       = Kp * error + Kd * derror / dt
//! Control = clamp(u, min, max)
//! ```
//!
//! The first step after construction or [`PidController::reset`] has no previous
//! sample and contributes no derivative term. Later steps floor `dt` at
//! [`MIN_DERIVATIVE_DT`] so back-to-back calls cannot divide by zero.

use std::time::{Duration, Instant};

use crate::attribute::{AttributeKey, SharedValue, VirtualDevice};

/// Smallest elapsed time used for the derivative term
pub const MIN_DERIVATIVE_DT: Duration = Duration::from_millis(1);

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum PidError {
    #[error("Gain {name} must be finite, got {value}")]
    InvalidGain { name: &'static str, value: f64 },

    #[error("Output bounds are inverted: min {min} > max {max}")]
    InvertedBounds { min: f64, max: f64 },
}

#[derive(Clone, Debug)]
pub struct PidController {
    kp: f64,
    kd: f64,
    min: Option<f64>,
    max: Option<f64>,

    set_point: f64,
    process_variable: f64,
    control_variable: f64,

    previous_error: f64,
    previous_time: Option<Instant>,
}

impl PidController {
    pub fn new(kp: f64, kd: f64) -> Result<Self, PidError> {
        if !kp.is_finite() {
            return Err(PidError::InvalidGain { name: "kp", value: kp });
        }
        if !kd.is_finite() {
            return Err(PidError::InvalidGain { name: "kd", value: kd });
        }

        Ok(Self {
            kp,
            kd,
            min: None,
            max: None,
            set_point: 0.0,
            process_variable: 0.0,
            control_variable: 0.0,
            previous_error: 0.0,
            previous_time: None,
        })
    }

    /// Proportional-only controller
    pub fn proportional(kp: f64) -> Result<Self, PidError> {
        Self::new(kp, 0.0)
    }

    /// Sets the output bounds. Either side may be left open.
    pub fn with_bounds(mut self, min: Option<f64>, max: Option<f64>) -> Result<Self, PidError> {
        if let (Some(min), Some(max)) = (min, max) {
            if min > max {
                return Err(PidError::InvertedBounds { min, max });
            }
        }
        self.min = min;
        self.max = max;
        Ok(self)
    }

    pub fn kp(&self) -> f64 {
        self.kp
    }

    pub fn kd(&self) -> f64 {
        self.kd
    }

    pub fn bounds(&self) -> (Option<f64>, Option<f64>) {
        (self.min, self.max)
    }

    pub fn set_point(&self) -> f64 {
        self.set_point
    }

    pub fn set_set_point(&mut self, value: f64) {
        self.set_point = value;
    }

    pub fn process_variable(&self) -> f64 {
        self.process_variable
    }

    pub fn set_process_variable(&mut self, value: f64) {
        self.process_variable = value;
    }

    pub fn control_variable(&self) -> f64 {
        self.control_variable
    }

    /// Forgets the derivative memory and the last output
    pub fn reset(&mut self) {
        self.previous_error = 0.0;
        self.previous_time = None;
        self.control_variable = 0.0;
    }

    pub fn step(&mut self) -> f64 {
        self.step_at(Instant::now())
    }

    /// Advances the controller as if the sample was taken at `now`
    pub fn step_at(&mut self, now: Instant) -> f64 {
        let error = self.set_point - self.process_variable;

        let derivative = match self.previous_time {
            Some(previous) if self.kd != 0.0 => {
                let dt = now
                    .saturating_duration_since(previous)
                    .max(MIN_DERIVATIVE_DT)
                    .as_secs_f64();
                self.kd * (error - self.previous_error) / dt
            }
            _ => 0.0,
        };

        let unclamped = self.kp * error + derivative;
        self.control_variable = self.clamp(unclamped);

        self.previous_error = error;
        self.previous_time = Some(now);

        self.control_variable
    }

    // NaN passes through untouched; comparisons against NaN are false
    fn clamp(&self, value: f64) -> f64 {
        match (self.min, self.max) {
            (_, Some(max)) if value > max => max,
            (Some(min), _) if value < min => min,
            _ => value,
        }
    }

    /// Lazily drives the controller from two lockstep input sequences, yielding
    /// the control variable after each step. Ends when either input ends.
    pub fn iprocess<S, P>(&mut self, set_points: S, process_variables: P) -> Iprocess<'_, S::IntoIter, P::IntoIter>
    where
        S: IntoIterator<Item = f64>,
        P: IntoIterator<Item = f64>,
    {
        Iprocess {
            controller: self,
            set_points: set_points.into_iter(),
            process_variables: process_variables.into_iter(),
        }
    }
}

pub struct Iprocess<'a, S, P> {
    controller: &'a mut PidController,
    set_points: S,
    process_variables: P,
}

impl<S, P> Iterator for Iprocess<'_, S, P>
where
    S: Iterator<Item = f64>,
    P: Iterator<Item = f64>,
{
    type Item = f64;

    fn next(&mut self) -> Option<f64> {
        let set_point = self.set_points.next()?;
        let process_variable = self.process_variables.next()?;
        self.controller.set_set_point(set_point);
        self.controller.set_process_variable(process_variable);
        Some(self.controller.step())
    }
}

/// Read-only mirror of a controller's state for diagnostic streaming
#[derive(Clone, Debug)]
pub struct PidProbe {
    name: String,
    set_point: SharedValue,
    process_variable: SharedValue,
    control_variable: SharedValue,
}

impl PidProbe {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            set_point: SharedValue::new(AttributeKey::new(&name, "SetPoint"), 0.0),
            process_variable: SharedValue::new(AttributeKey::new(&name, "ProcessVariable"), 0.0),
            control_variable: SharedValue::new(AttributeKey::new(&name, "ControlVariable"), 0.0),
            name,
        }
    }

    pub fn publish(&self, controller: &PidController) {
        self.set_point.set(controller.set_point());
        self.process_variable.set(controller.process_variable());
        self.control_variable.set(controller.control_variable());
    }

    pub fn control_variable(&self) -> f64 {
        self.control_variable.get()
    }

    pub fn to_virtual_device(&self) -> VirtualDevice {
        VirtualDevice::new(&self.name)
            .with_cell(self.set_point.clone())
            .with_cell(self.process_variable.clone())
            .with_cell(self.control_variable.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proportional_output() {
        let mut pid = PidController::proportional(2.0).unwrap();
        pid.set_set_point(10.0);
        pid.set_process_variable(0.0);
        assert_eq!(pid.step(), 20.0);
        assert_eq!(pid.control_variable(), 20.0);
    }

    #[test]
    fn output_is_clamped_on_both_sides() {
        let mut pid = PidController::proportional(10.0)
            .unwrap()
            .with_bounds(Some(-100.0), Some(100.0))
            .unwrap();
        pid.set_set_point(50.0);
        assert_eq!(pid.step(), 100.0);
        pid.set_set_point(-50.0);
        assert_eq!(pid.step(), -100.0);
        pid.set_set_point(5.0);
        assert_eq!(pid.step(), 50.0);
    }

    #[test]
    fn zero_bounds_still_clamp() {
        let mut pid = PidController::proportional(1.0)
            .unwrap()
            .with_bounds(Some(0.0), None)
            .unwrap();
        pid.set_set_point(-3.0);
        assert_eq!(pid.step(), 0.0);
    }

    #[test]
    fn inverted_bounds_are_rejected() {
        let result = PidController::proportional(1.0)
            .unwrap()
            .with_bounds(Some(5.0), Some(-5.0));
        assert_eq!(result.unwrap_err(), PidError::InvertedBounds { min: 5.0, max: -5.0 });
        assert!(PidController::new(f64::INFINITY, 0.0).is_err());
    }

    #[test]
    fn first_step_has_no_derivative_term() {
        let mut pid = PidController::new(1.0, 100.0).unwrap();
        pid.set_set_point(4.0);
        assert_eq!(pid.step_at(Instant::now()), 4.0);
    }

    #[test]
    fn derivative_uses_elapsed_time() {
        let t0 = Instant::now();
        let mut pid = PidController::new(0.0, 1.0).unwrap();
        pid.set_set_point(1.0);
        pid.step_at(t0);

        // error rises from 1 to 3 over half a second
        pid.set_set_point(3.0);
        let out = pid.step_at(t0 + Duration::from_millis(500));
        assert!((out - 4.0).abs() < 1e-9);
    }

    #[test]
    fn back_to_back_steps_are_finite() {
        let t0 = Instant::now();
        let mut pid = PidController::new(1.0, 1.0).unwrap();
        pid.step_at(t0);
        pid.set_set_point(1.0);
        let out = pid.step_at(t0);
        assert!(out.is_finite());
        // dt floored at 1ms: 1 + 1 * 1 / 0.001
        assert!((out - 1001.0).abs() < 1e-6);
    }

    #[test]
    fn nan_propagates() {
        let mut pid = PidController::proportional(1.0)
            .unwrap()
            .with_bounds(Some(-1.0), Some(1.0))
            .unwrap();
        pid.set_process_variable(f64::NAN);
        assert!(pid.step().is_nan());
    }

    #[test]
    fn iprocess_runs_in_lockstep() {
        let mut pid = PidController::proportional(2.0).unwrap();
        let outputs: Vec<f64> = pid
            .iprocess(vec![1.0, 2.0, 3.0], vec![0.0, 0.0])
            .collect();
        assert_eq!(outputs, vec![2.0, 4.0]);
        assert_eq!(pid.set_point(), 2.0);
    }

    #[test]
    fn iprocess_is_lazy_over_infinite_inputs() {
        let mut pid = PidController::proportional(1.0).unwrap();
        let outputs: Vec<f64> = pid
            .iprocess(std::iter::repeat(5.0), (0..).map(|v| v as f64))
            .take(3)
            .collect();
        assert_eq!(outputs, vec![5.0, 4.0, 3.0]);
    }

    #[test]
    fn probe_mirrors_state() {
        let probe = PidProbe::new("pid");
        let mut pid = PidController::proportional(3.0).unwrap();
        pid.set_set_point(2.0);
        pid.step();
        probe.publish(&pid);

        let device = probe.to_virtual_device();
        assert_eq!(device.cell("SetPoint").unwrap().get(), 2.0);
        assert_eq!(device.cell("ControlVariable").unwrap().get(), 6.0);
        assert_eq!(probe.control_variable(), 6.0);
    }
}
