//! Shared fixtures for the integration tests: a simulated motor plant fed
//! from the drive's own model, and a PWM stub that checks every duty write
//! against the modulator invariants.
#![allow(dead_code)]

use esc_firmware::model::{self, MotorParams};
use esc_firmware::{AdcScale, PwmSink};

/// Simulated motor. Integrates the same electromechanical model the
/// estimator predicts with, so a correctly wired drive tracks it exactly up
/// to ADC quantisation.
pub struct Plant {
    pub motor: MotorParams,
    pub flux: f32,
    pub load: f32,
    /// True state: iD, iQ, theta, omega.
    pub x: [f32; 4],
}

impl Plant {
    pub fn at_rest(motor: MotorParams, theta: f32) -> Self {
        Self {
            motor,
            flux: motor.flux_linkage,
            load: 0.0,
            x: [0.0, 0.0, theta, 0.0],
        }
    }

    /// Integrate one PWM period under the stator voltage `u` (V).
    pub fn step(&mut self, u: (f32, f32), dt: f32) {
        model::heun_step(&self.motor, self.flux, self.load, u, &mut self.x, dt);
    }

    /// True phase currents (A, phases A and B).
    pub fn phase_currents(&self) -> (f32, f32) {
        let (c, s) = (self.x[2].cos(), self.x[2].sin());
        let i_x = c * self.x[0] - s * self.x[1];
        let i_y = s * self.x[0] + c * self.x[1];
        (i_x, -0.5 * i_x + 0.8660254 * i_y)
    }

    /// Phase currents quantised to ADC codes.
    pub fn adc_codes(&self, adc: &AdcScale) -> (u16, u16) {
        let (i_a, i_b) = self.phase_currents();
        (
            quantise(f32::from(adc.center) + i_a / adc.gain_a),
            quantise(f32::from(adc.center) + i_b / adc.gain_b),
        )
    }
}

/// DC-link voltage quantised to an ADC code.
pub fn vbus_code(vbus: f32, adc: &AdcScale) -> u16 {
    quantise(vbus / adc.gain_u)
}

fn quantise(code: f32) -> u16 {
    code.round().clamp(0.0, 4095.0) as u16
}

/// PWM stub that records the last write and panics on any code violating
/// the duty range or the minimum-pulse rule.
pub struct RecordingPwm {
    pub resolution: u16,
    pub min_pulse: u16,
    pub last: [u16; 3],
    pub writes: u32,
}

impl RecordingPwm {
    pub fn new(resolution: u16, min_pulse: u16) -> Self {
        Self {
            resolution,
            min_pulse,
            last: [0; 3],
            writes: 0,
        }
    }
}

impl PwmSink for RecordingPwm {
    fn set_phase_duties(&mut self, duties: [u16; 3]) {
        for code in duties {
            assert!(code <= self.resolution, "duty {code} out of range");
            assert!(
                code == 0
                    || code == self.resolution
                    || (code >= self.min_pulse && code <= self.resolution - self.min_pulse),
                "duty {code} violates the minimum-pulse rule"
            );
        }
        self.last = duties;
        self.writes += 1;
    }
}
