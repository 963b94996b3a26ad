//! Outer speed regulation.
//!
//! Engaged by a mode flag; when running it shapes the Q-axis current
//! setpoint once per tick from the estimated electrical speed. Spin-up does
//! not engage it - the collaborator turns it on once the drive is released.

/// Speed regulator gains and limits.
#[derive(Clone, Copy, Debug)]
pub struct SpeedConfig {
    /// Proportional gain (A per rad/s of error).
    pub kp: f32,
    /// Integral gain (A per rad of accumulated error).
    pub ki: f32,
    /// Q-axis current limit (A).
    pub max_current: f32,
}

impl Default for SpeedConfig {
    fn default() -> Self {
        Self {
            kp: 2e-3,
            ki: 2e-2,
            max_current: 5.0,
        }
    }
}

/// PI regulator from electrical speed error to Q-axis current setpoint.
pub struct SpeedLoop {
    pub config: SpeedConfig,
    /// Target electrical speed (rad/s).
    pub target: f32,
    integral: f32,
}

impl SpeedLoop {
    pub fn new(config: SpeedConfig) -> Self {
        Self {
            config,
            target: 0.0,
            integral: 0.0,
        }
    }

    /// Returns the Q-axis current setpoint (A), clamped to the configured
    /// limit.
    pub fn update(&mut self, omega: f32, dt: f32) -> f32 {
        let limit = self.config.max_current;
        let e = self.target - omega;

        self.integral = (self.integral + self.config.ki * e * dt).clamp(-limit, limit);
        (self.config.kp * e + self.integral).clamp(-limit, limit)
    }

    pub fn reset(&mut self) {
        self.integral = 0.0;
    }
}
