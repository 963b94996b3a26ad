//! Deterministic trigonometry for the control core.
//!
//! The EKF linearisation and the rotor-axis cache must produce identical
//! results on every toolchain, so the control path evaluates fixed
//! polynomials instead of calling the platform math library. Both routines
//! fold the argument into the first quadrant and run a 7th-order Horner
//! chain; accuracy is about seven decimals for arguments in [-PI, PI].

use core::f32::consts::{FRAC_PI_2, PI};

/// Sine of `x`, for `x` in [-PI, PI].
pub fn sin(x: f32) -> f32 {
    let (x, neg) = if x < 0.0 { (-x, true) } else { (x, false) };
    let x = if x > FRAC_PI_2 { PI - x } else { x };

    let mut u = -1.3741951e-4;
    u = -2.0621440e-4 + u * x;
    u = 8.6430385e-3 + u * x;
    u = -2.4749696e-4 + u * x;
    u = -1.6655975e-1 + u * x;
    u = -2.3177562e-5 + u * x;
    u = 1.0000021e+0 + u * x;
    u = -4.0553596e-8 + u * x;

    if neg { -u } else { u }
}

/// Cosine of `x`, for `x` in [-PI, PI].
pub fn cos(x: f32) -> f32 {
    let x = if x < 0.0 { -x } else { x };
    let (x, neg) = if x > FRAC_PI_2 { (PI - x, true) } else { (x, false) };

    let mut u = 1.3804255e-4;
    u = -1.7206567e-3 + u * x;
    u = 4.2851990e-4 + u * x;
    u = 4.1352723e-2 + u * x;
    u = 1.2810877e-4 + u * x;
    u = -5.0002667e-1 + u * x;
    u = 2.2899566e-6 + u * x;
    u = 9.9999996e-1 + u * x;

    if neg { -u } else { u }
}

/// Wrap an angle into (-PI, PI]. The input is at most one revolution out of
/// range, which holds for every per-tick increment in the core.
pub fn wrap_angle(x: f32) -> f32 {
    if x < -PI {
        x + 2.0 * PI
    } else if x > PI {
        x - 2.0 * PI
    } else {
        x
    }
}
