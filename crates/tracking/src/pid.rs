//! PID compensation over timestamped pixel errors.

use num_traits::Float;
use serde::{Deserialize, Serialize};

use crate::ControlError;

/// Gains shared across both axes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidGains {
    /// Proportional gain.
    pub kp: f64,
    /// Integral gain.
    pub ki: f64,
    /// Derivative gain.
    pub kd: f64,
}

impl PidGains {
    pub fn validate(&self) -> Result<(), ControlError> {
        for (name, value) in [("kp", self.kp), ("ki", self.ki), ("kd", self.kd)] {
            if !value.is_finite() || value < 0.0 {
                return Err(ControlError::InvalidRequest(format!(
                    "{name} must be finite and non-negative, got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// Integrator and derivative state for one axis.
///
/// The caller supplies the clamped inter-sample interval and decides whether
/// the derivative term is meaningful for this update; the compensator itself
/// is a pure accumulator.
#[derive(Debug, Clone, Copy)]
pub struct AxisPid<F: Float> {
    integral: F,
    previous_error: Option<F>,
    integral_limit: Option<F>,
}

impl<F: Float> AxisPid<F> {
    pub fn new() -> Self {
        Self {
            integral: F::zero(),
            previous_error: None,
            integral_limit: None,
        }
    }

    /// Anti-windup bound on the integral; `None` disables the clamp.
    pub fn set_integral_limit(&mut self, limit: Option<F>) {
        self.integral_limit = limit;
    }

    /// Feeds one error sample and returns the controller output in the same
    /// units as the error.
    pub fn update(&mut self, kp: F, ki: F, kd: F, error: F, dt: F, with_derivative: bool) -> F {
        let p_term = kp * error;

        // Integral term with anti-windup
        self.integral = self.integral + error * dt;
        if let Some(limit) = self.integral_limit {
            self.integral = self.integral.max(-limit).min(limit);
        }
        let i_term = ki * self.integral;

        let d_term = match (with_derivative, self.previous_error) {
            (true, Some(previous)) => kd * ((error - previous) / dt),
            _ => F::zero(),
        };

        self.previous_error = Some(error);
        p_term + i_term + d_term
    }

    /// Drops all accumulated state.
    pub fn reset(&mut self) {
        self.integral = F::zero();
        self.previous_error = None;
    }

    pub fn integral(&self) -> F {
        self.integral
    }
}

impl<F: Float> Default for AxisPid<F> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proportional_only_passes_the_error_through() {
        let mut pid: AxisPid<f64> = AxisPid::new();
        let out = pid.update(1.0, 0.0, 0.0, 100.0, 0.01, true);
        assert_eq!(out, 100.0);
    }

    #[test]
    fn integral_is_clamped() {
        let mut pid: AxisPid<f64> = AxisPid::new();
        pid.set_integral_limit(Some(5.0));
        for _ in 0..1000 {
            pid.update(1.0, 0.5, 0.0, 100.0, 0.2, true);
        }
        assert!(pid.integral() <= 5.0);

        for _ in 0..1000 {
            pid.update(1.0, 0.5, 0.0, -100.0, 0.2, true);
        }
        assert!(pid.integral() >= -5.0);
    }

    #[test]
    fn derivative_needs_a_prior_sample() {
        let mut pid: AxisPid<f64> = AxisPid::new();
        let first = pid.update(0.0, 0.0, 1.0, 50.0, 0.01, true);
        assert_eq!(first, 0.0);
        let second = pid.update(0.0, 0.0, 1.0, 60.0, 0.01, true);
        assert!((second - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn reset_clears_integral_and_history() {
        let mut pid: AxisPid<f64> = AxisPid::new();
        pid.update(1.0, 1.0, 1.0, 10.0, 0.1, true);
        pid.reset();
        assert_eq!(pid.integral(), 0.0);
        let out = pid.update(0.0, 0.0, 1.0, 10.0, 0.1, true);
        assert_eq!(out, 0.0);
    }
}
