//! Continuous-time electromechanical model of the motor.
//!
//! The model feeds both the EKF prediction step and (in tests) a simulated
//! plant, so it lives apart from the estimator.

use crate::math;

/// Motor constants, either from the datasheet or from commissioning.
#[derive(Clone, Copy, Debug)]
pub struct MotorParams {
    /// Phase resistance (Ohm).
    pub rs: f32,
    /// D-axis inductance (H).
    pub ld: f32,
    /// Q-axis inductance (H).
    pub lq: f32,
    /// Pole-pair count.
    pub pole_pairs: u8,
    /// Rotor inertia (kg·m²).
    pub inertia: f32,
    /// Nameplate PM flux linkage (Wb); seeds the online estimate.
    pub flux_linkage: f32,
}

impl Default for MotorParams {
    fn default() -> Self {
        Self {
            rs: 0.1,
            ld: 5e-5,
            lq: 5e-5,
            pole_pairs: 7,
            inertia: 1e-5,
            flux_linkage: 1e-3,
        }
    }
}

/// State derivatives of the motor.
///
/// `x` is (iD, iQ, theta, omega) with currents in the rotor frame, theta the
/// electrical angle and omega the electrical angular speed. `u` is the
/// applied stator voltage in the stationary frame (V). `flux` and `load` are
/// the present estimates of the PM flux linkage (Wb) and the external load
/// torque (N·m).
pub fn derivatives(motor: &MotorParams, flux: f32, load: f32, u: (f32, f32), x: &[f32; 4]) -> [f32; 4] {
    let rx = math::cos(x[2]);
    let ry = math::sin(x[2]);

    // Applied voltage in the rotor frame.
    let u_d = rx * u.0 + ry * u.1;
    let u_q = rx * u.1 - ry * u.0;

    let zp = f32::from(motor.pole_pairs);
    let torque = 1.5 * zp * (flux - (motor.lq - motor.ld) * x[0]) * x[1];

    [
        (u_d - motor.rs * x[0] + motor.lq * x[3] * x[1]) / motor.ld,
        (u_q - motor.rs * x[1] - motor.ld * x[3] * x[0] - flux * x[3]) / motor.lq,
        x[3],
        zp * (torque - load) / motor.inertia,
    ]
}

/// Advance `x` by one step of length `dt` with the improved Euler method.
/// Theta is wrapped into (-PI, PI] after each stage.
pub fn heun_step(
    motor: &MotorParams,
    flux: f32,
    load: f32,
    u: (f32, f32),
    x: &mut [f32; 4],
    dt: f32,
) {
    let d1 = derivatives(motor, flux, load, u, x);

    let mut x2 = [
        x[0] + d1[0] * dt,
        x[1] + d1[1] * dt,
        x[2] + d1[2] * dt,
        x[3] + d1[3] * dt,
    ];
    x2[2] = math::wrap_angle(x2[2]);

    let d2 = derivatives(motor, flux, load, u, &x2);
    let h = 0.5 * dt;

    x[0] += (d1[0] + d2[0]) * h;
    x[1] += (d1[1] + d2[1]) * h;
    x[2] += (d1[2] + d2[2]) * h;
    x[3] += (d1[3] + d2[3]) * h;
    x[2] = math::wrap_angle(x[2]);
}
