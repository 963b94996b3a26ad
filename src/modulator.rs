//! Space-vector modulation.
//!
//! Turns a per-unit stator voltage request into three integer duty codes,
//! then reconstructs the vector those codes actually realise so the
//! estimator always sees the truth, clamping and overmodulation included.

/// Sink for the three phase duty codes computed each tick. The PWM driver
/// implements this; tests substitute a recording stub.
pub trait PwmSink {
    /// Write the phase duty codes, each in `[0, resolution]`.
    fn set_phase_duties(&mut self, duties: [u16; 3]);
}

/// Voltage-to-duty modulator.
#[derive(Clone, Copy, Debug)]
pub struct Svpwm {
    /// PWM timer resolution, ticks per period.
    pub resolution: u16,
    /// Shortest pulse the gate driver can realise, in ticks. Anything
    /// shorter is snapped to the nearer rail.
    pub min_pulse: u16,
}

impl Svpwm {
    /// Realise the requested stator voltage vector `u`.
    ///
    /// `u` is per-unit: 1.0 equals the present DC-link voltage `vbus`.
    /// With `efficient` set the neutral is snapped to a rail every period
    /// (discontinuous modulation); otherwise the vector is centred and only
    /// snapped when it would not fit.
    ///
    /// Returns the stator voltage actually applied (V), reconstructed from
    /// the integer codes written to `pwm`.
    pub fn apply(
        &self,
        u: (f32, f32),
        vbus: f32,
        efficient: bool,
        pwm: &mut impl PwmSink,
    ) -> (f32, f32) {
        const EPS: f32 = 1e-3;
        const SQRT3_2: f32 = 0.8660254;

        // Inverse Clarke to phase voltages.
        let mut u_a = u.0;
        let mut u_b = -0.5 * u.0 + SQRT3_2 * u.1;
        let mut u_c = -0.5 * u.0 - SQRT3_2 * u.1;

        let min = u_a.min(u_b).min(u_c);
        let max = u_a.max(u_b).max(u_c);
        let swing = max - min;

        let offset = if swing < 1.0 {
            if efficient {
                // Clamp one phase to whichever rail is closer so it stops
                // switching for the period.
                if min + max - EPS < 0.0 { -min } else { 1.0 - max }
            } else if min < -0.5 {
                -min
            } else if max > 0.5 {
                1.0 - max
            } else {
                0.5
            }
        } else {
            // Crop an unrealisable vector to the modulator range; one
            // neutral placement keeps all three phases inside [0, 1].
            let scale = 1.0 / swing;
            u_a *= scale;
            u_b *= scale;
            u_c *= scale;
            0.5 - (min + max) * scale * 0.5
        };

        let x_a = self.duty_code(u_a + offset);
        let x_b = self.duty_code(u_b + offset);
        let x_c = self.duty_code(u_c + offset);

        pwm.set_phase_duties([x_a, x_b, x_c]);

        // Reconstruct the applied vector from the codes actually written:
        // the realised neutral is their mean.
        let neutral = 0.33333333 * (f32::from(x_a) + f32::from(x_b) + f32::from(x_c));
        let step = vbus / f32::from(self.resolution);
        let p_a = (f32::from(x_a) - neutral) * step;
        let p_b = (f32::from(x_b) - neutral) * step;

        (p_a, 0.57735027 * p_a + 1.1547005 * p_b)
    }

    /// Convert one per-unit phase voltage to a duty code, applying the
    /// minimum-pulse rule.
    fn duty_code(&self, u: f32) -> u16 {
        let code = libm::roundf(f32::from(self.resolution) * u) as i32;
        let high = i32::from(self.resolution) - i32::from(self.min_pulse);

        if code < i32::from(self.min_pulse) {
            0
        } else if code > high {
            self.resolution
        } else {
            code as u16
        }
    }
}
