//! DQ current regulation.

/// Current regulator gains.
#[derive(Clone, Copy, Debug)]
pub struct CurrentConfig {
    /// Proportional gain (per-unit voltage per A of error).
    pub kp: f32,
    /// Integral gain (per-unit voltage per A, accumulated every tick).
    pub ki: f32,
}

impl Default for CurrentConfig {
    fn default() -> Self {
        Self { kp: 1e-5, ki: 2e-3 }
    }
}

/// Per-axis PI regulators producing the DQ voltage request in per-unit of
/// the DC-link voltage. The integrators carry the steady-state voltage and
/// are clamped to half the bus each, leaving headroom for the neutral.
pub struct CurrentLoop {
    pub config: CurrentConfig,
    /// D-axis current setpoint (A).
    pub setpoint_d: f32,
    /// Q-axis current setpoint (A).
    pub setpoint_q: f32,
    integral_d: f32,
    integral_q: f32,
}

impl CurrentLoop {
    pub fn new(config: CurrentConfig) -> Self {
        Self {
            config,
            setpoint_d: 0.0,
            setpoint_q: 0.0,
            integral_d: 0.0,
            integral_q: 0.0,
        }
    }

    /// Run both axes against the fresh current estimates. Returns the
    /// per-unit (uD, uQ) request.
    pub fn update(&mut self, i_d: f32, i_q: f32) -> (f32, f32) {
        let e_d = self.setpoint_d - i_d;
        self.integral_d = (self.integral_d + self.config.ki * e_d).clamp(-0.5, 0.5);
        let u_d = self.config.kp * e_d + self.integral_d;

        let e_q = self.setpoint_q - i_q;
        self.integral_q = (self.integral_q + self.config.ki * e_q).clamp(-0.5, 0.5);
        let u_q = self.config.kp * e_q + self.integral_q;

        (u_d, u_q)
    }

    /// Drop the accumulated integrator state.
    pub fn reset(&mut self) {
        self.integral_d = 0.0;
        self.integral_q = 0.0;
    }

    /// Integrator states, for diagnostics.
    pub fn integrals(&self) -> (f32, f32) {
        (self.integral_d, self.integral_q)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_error_zero_output() {
        let mut pi = CurrentLoop::new(CurrentConfig::default());
        pi.setpoint_d = 2.0;
        pi.setpoint_q = -1.0;

        let (u_d, u_q) = pi.update(2.0, -1.0);
        assert_eq!(u_d, 0.0);
        assert_eq!(u_q, 0.0);
    }

    #[test]
    fn integral_accumulates_per_tick() {
        let mut pi = CurrentLoop::new(CurrentConfig { kp: 0.0, ki: 0.01 });
        pi.setpoint_q = 1.0;

        pi.update(0.0, 0.0);
        let (_, u_q) = pi.update(0.0, 0.0);
        assert!((u_q - 0.02).abs() < 1e-7);
    }

    #[test]
    fn integrators_clamp_at_half_bus() {
        let mut pi = CurrentLoop::new(CurrentConfig { kp: 0.0, ki: 0.2 });
        pi.setpoint_d = 10.0;
        pi.setpoint_q = -10.0;

        for _ in 0..100 {
            pi.update(0.0, 0.0);
        }

        let (x_d, x_q) = pi.integrals();
        assert_eq!(x_d, 0.5);
        assert_eq!(x_q, -0.5);
    }

    #[test]
    fn reset_clears_integrators() {
        let mut pi = CurrentLoop::new(CurrentConfig::default());
        pi.setpoint_d = 5.0;
        for _ in 0..10 {
            pi.update(0.0, 0.0);
        }

        pi.reset();
        assert_eq!(pi.integrals(), (0.0, 0.0));
    }
}
