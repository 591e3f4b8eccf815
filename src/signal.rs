//! Composable value transforms applied between a gamepad axis and its target

use serde::{Deserialize, Serialize};

/// One stage of a [`SignalChain`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Transform {
    /// Linear map of `from` onto `to`; values outside `from` extrapolate
    Scale { from: [f64; 2], to: [f64; 2] },
    /// Zero below `threshold`, rescaled to the full range above it
    Deadzone { threshold: f64 },
    Invert,
    Clamp { min: f64, max: f64 },
    Gain { factor: f64 },
}

impl Transform {
    pub fn apply(&self, value: f64) -> f64 {
        match *self {
            Transform::Scale { from, to } => {
                let span = from[1] - from[0];
                if span == 0.0 {
                    return to[0];
                }
                let a = (to[1] - to[0]) / span;
                to[1] - a * (from[1] - value)
            }
            Transform::Deadzone { threshold } => apply_deadzone(value, threshold),
            Transform::Invert => -value,
            Transform::Clamp { min, max } => value.max(min).min(max),
            Transform::Gain { factor } => factor * value,
        }
    }

    /// Rejects stages that can never produce a meaningful value
    pub fn validate(&self) -> Result<(), String> {
        match *self {
            Transform::Scale { from, .. } if from[0] == from[1] => {
                Err(format!("scale input range {:?} is empty", from))
            }
            Transform::Deadzone { threshold } if !(0.0..1.0).contains(&threshold) => {
                Err(format!("deadzone {} outside [0, 1)", threshold))
            }
            Transform::Clamp { min, max } if min > max => {
                Err(format!("clamp bounds inverted: {} > {}", min, max))
            }
            _ => Ok(()),
        }
    }
}

/// Ordered list of transforms
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalChain {
    stages: Vec<Transform>,
}

impl SignalChain {
    pub fn new(stages: Vec<Transform>) -> Self {
        Self { stages }
    }

    pub fn then(mut self, stage: Transform) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn apply(&self, value: f64) -> f64 {
        self.stages
            .iter()
            .fold(value, |value, stage| stage.apply(value))
    }

    pub fn stages(&self) -> &[Transform] {
        &self.stages
    }

    pub fn validate(&self) -> Result<(), String> {
        self.stages.iter().try_for_each(Transform::validate)
    }
}

// Rescale the value to the range outside the deadzone
pub fn apply_deadzone(value: f64, deadzone: f64) -> f64 {
    if value.abs() < deadzone {
        0.0
    } else {
        value.signum() * (value.abs() - deadzone) / (1.0 - deadzone)
    }
}
