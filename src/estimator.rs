//! Sensorless state estimation.
//!
//! A six-state extended Kalman filter over (iD, iQ, theta, omega, load,
//! flux) driven by the two measured phase currents. The filter is the only
//! rotor-position source in sensorless operation: the current loop and the
//! modulator both consume its cached rotor axes.
//!
//! The covariance is kept as the packed upper triangle of a symmetric 6x6
//! matrix in row-major order, `[P00, P10, P11, P20, P21, P22, ...]`, 21
//! entries. Row/column indices map to (iD, iQ, theta, omega, load, flux).
//! Both updates below exploit the sparsity of the measurement and transition
//! Jacobians, so every covariance entry is written out explicitly.

use crate::math;
use crate::model::{self, MotorParams};

/// sqrt(3)/2, the phase-B projection coefficient.
const SQRT3_2: f32 = 0.8660254;

/// Noise configuration for the filter.
#[derive(Clone, Copy, Debug)]
pub struct EkfConfig {
    /// Process noise added per tick to the state variances, in state order
    /// (iD, iQ, theta, omega, load, flux).
    pub q: [f32; 6],
    /// Measurement noise variance on each phase-current input (A²).
    pub r: f32,
}

impl Default for EkfConfig {
    fn default() -> Self {
        Self {
            q: [1e-8, 1e-8, 1e-8, 1e-8, 1e-4, 1e-12],
            r: 1e-2,
        }
    }
}

/// Extended Kalman filter state.
pub struct Ekf {
    /// Electrical state estimate: iD (A), iQ (A), theta (rad), omega (rad/s).
    /// Theta is kept in (-PI, PI].
    pub x: [f32; 4],
    /// External load torque estimate (N·m); covariance row 4.
    pub load: f32,
    /// PM flux linkage estimate (Wb); covariance row 5.
    pub flux: f32,
    /// Cached rotor axes (cos theta, sin theta), consistent with `x[2]`.
    pub rot: (f32, f32),
    /// Packed upper-triangular covariance.
    pub p: [f32; 21],
    pub config: EkfConfig,
    /// State snapshot (iD, iQ, cos, sin, omega) taken right after the
    /// measurement update; the time update averages it with the propagated
    /// state to linearise over the whole tick.
    snap: [f32; 5],
}

impl Ekf {
    pub fn new(config: EkfConfig, flux_seed: f32) -> Self {
        Self {
            x: [0.0; 4],
            load: 0.0,
            flux: flux_seed,
            rot: (1.0, 0.0),
            p: [0.0; 21],
            config,
            snap: [0.0; 5],
        }
    }

    /// Re-seed the filter for an aligned spin-up: zero state, wide priors on
    /// the currents, a few radians of angle/speed uncertainty, rotor axes on
    /// the D axis. The load and flux estimates survive across runs.
    pub fn reinit(&mut self) {
        self.x = [0.0; 4];
        self.p = [0.0; 21];
        self.p[0] = 1e4;
        self.p[2] = 1e4;
        self.p[5] = 5.0;
        self.p[9] = 5.0;
        self.rot = (1.0, 0.0);
    }

    /// Measurement update followed by one-step state propagation.
    ///
    /// `i_a`, `i_b` are the scaled phase currents (A); `drift` is the pair of
    /// sensor operating-point offsets learned during drift calibration;
    /// `u` is the stator voltage actually applied over the last period (V).
    ///
    /// The innovation is formed against the rotor axes cached at the end of
    /// the previous tick, which are the axes that produced the prediction.
    /// Returns the innovation pair for diagnostics.
    pub fn measure_update(
        &mut self,
        i_a: f32,
        i_b: f32,
        drift: (f32, f32),
        motor: &MotorParams,
        u: (f32, f32),
        dt: f32,
    ) -> (f32, f32) {
        let (rx, ry) = self.rot;
        let x = &mut self.x;
        let p = &mut self.p;

        // Predicted phase currents: rotate (iD, iQ) to the stationary frame,
        // project on phases A and B, subtract the sensor drifts.
        let ix = rx * x[0] - ry * x[1];
        let iy = ry * x[0] + rx * x[1];

        let ha = ix - drift.0;
        let hb = -0.5 * ix + SQRT3_2 * iy - drift.1;

        let e_a = i_a - ha;
        let e_b = i_b - hb;

        // Output Jacobian, rows A and B over (iD, iQ, theta); the load and
        // flux columns are zero.
        let c2 = -rx * x[1] - ry * x[0];
        let c = [
            rx,
            -ry,
            c2,
            -0.5 * rx + SQRT3_2 * ry,
            0.5 * ry + SQRT3_2 * rx,
            -0.5 * c2 + SQRT3_2 * (rx * x[0] - ry * x[1]),
        ];

        // PC = P * C', rows in state order, two columns.
        let pc = [
            p[0] * c[0] + p[1] * c[1] + p[3] * c[2],
            p[0] * c[3] + p[1] * c[4] + p[3] * c[5],
            p[1] * c[0] + p[2] * c[1] + p[4] * c[2],
            p[1] * c[3] + p[2] * c[4] + p[4] * c[5],
            p[3] * c[0] + p[4] * c[1] + p[5] * c[2],
            p[3] * c[3] + p[4] * c[4] + p[5] * c[5],
            p[6] * c[0] + p[7] * c[1] + p[8] * c[2],
            p[6] * c[3] + p[7] * c[4] + p[8] * c[5],
            p[10] * c[0] + p[11] * c[1] + p[12] * c[2],
            p[10] * c[3] + p[11] * c[4] + p[12] * c[5],
            p[15] * c[0] + p[16] * c[1] + p[17] * c[2],
            p[15] * c[3] + p[16] * c[4] + p[17] * c[5],
        ];

        // S = C * P * C' + R, a 2x2 symmetric matrix.
        let s00 = c[0] * pc[0] + c[1] * pc[2] + c[2] * pc[4] + self.config.r;
        let s01 = c[0] * pc[1] + c[1] * pc[3] + c[2] * pc[5];
        let s11 = c[3] * pc[1] + c[4] * pc[3] + c[5] * pc[5] + self.config.r;

        // With r > 0 and P positive semi-definite, det >= r². Skip the
        // correction if numerics broke that; the cost is one missed update.
        let det = s00 * s11 - s01 * s01;
        if det > 0.0 {
            let is0 = s11 / det;
            let is1 = -s01 / det;
            let is2 = s00 / det;

            // K = P * C' * inv(S), 6x2.
            let k = [
                pc[0] * is0 + pc[1] * is1,
                pc[0] * is1 + pc[1] * is2,
                pc[2] * is0 + pc[3] * is1,
                pc[2] * is1 + pc[3] * is2,
                pc[4] * is0 + pc[5] * is1,
                pc[4] * is1 + pc[5] * is2,
                pc[6] * is0 + pc[7] * is1,
                pc[6] * is1 + pc[7] * is2,
                pc[8] * is0 + pc[9] * is1,
                pc[8] * is1 + pc[9] * is2,
                pc[10] * is0 + pc[11] * is1,
                pc[10] * is1 + pc[11] * is2,
            ];

            // X = X + K * e. The theta correction is saturated to one
            // half-turn so a single bad residual cannot spin the estimate.
            x[0] += k[0] * e_a + k[1] * e_b;
            x[1] += k[2] * e_a + k[3] * e_b;
            let d_theta = k[4] * e_a + k[5] * e_b;
            x[2] += d_theta.clamp(-core::f32::consts::PI, core::f32::consts::PI);
            x[3] += k[6] * e_a + k[7] * e_b;
            self.load += k[8] * e_a + k[9] * e_b;
            self.flux += k[10] * e_a + k[11] * e_b;

            // P = P - K * C * P, upper triangle only.
            p[0] -= k[0] * pc[0] + k[1] * pc[1];
            p[1] -= k[2] * pc[0] + k[3] * pc[1];
            p[2] -= k[2] * pc[2] + k[3] * pc[3];
            p[3] -= k[4] * pc[0] + k[5] * pc[1];
            p[4] -= k[4] * pc[2] + k[5] * pc[3];
            p[5] -= k[4] * pc[4] + k[5] * pc[5];
            p[6] -= k[6] * pc[0] + k[7] * pc[1];
            p[7] -= k[6] * pc[2] + k[7] * pc[3];
            p[8] -= k[6] * pc[4] + k[7] * pc[5];
            p[9] -= k[6] * pc[6] + k[7] * pc[7];
            p[10] -= k[8] * pc[0] + k[9] * pc[1];
            p[11] -= k[8] * pc[2] + k[9] * pc[3];
            p[12] -= k[8] * pc[4] + k[9] * pc[5];
            p[13] -= k[8] * pc[6] + k[9] * pc[7];
            p[14] -= k[8] * pc[8] + k[9] * pc[9];
            p[15] -= k[10] * pc[0] + k[11] * pc[1];
            p[16] -= k[10] * pc[2] + k[11] * pc[3];
            p[17] -= k[10] * pc[4] + k[11] * pc[5];
            p[18] -= k[10] * pc[6] + k[11] * pc[7];
            p[19] -= k[10] * pc[8] + k[11] * pc[9];
            p[20] -= k[10] * pc[10] + k[11] * pc[11];
        }

        self.x[2] = math::wrap_angle(self.x[2]);

        // Snapshot for the trapezoidal average in the time update.
        self.snap = [self.x[0], self.x[1], self.rot.0, self.rot.1, self.x[3]];

        model::heun_step(motor, self.flux, self.load, u, &mut self.x, dt);

        self.rot = (math::cos(self.x[2]), math::sin(self.x[2]));

        (e_a, e_b)
    }

    /// Covariance time update: P = A * P * A' + Q.
    ///
    /// The transition Jacobian A is built from the state averaged over the
    /// tick (pre-update snapshot and propagated state), with the averaged
    /// rotor axes pulled back onto the unit circle by one Newton step. `u`
    /// must be the voltage stored by the modulator this tick, so the
    /// covariance is propagated across the same input the state saw.
    pub fn time_update(&mut self, motor: &MotorParams, u: (f32, f32), dt: f32) {
        let p = &mut self.p;
        let q = &self.config.q;

        let i_d = 0.5 * (self.snap[0] + self.x[0]);
        let i_q = 0.5 * (self.snap[1] + self.x[1]);
        let mut rx = 0.5 * (self.snap[2] + self.rot.0);
        let mut ry = 0.5 * (self.snap[3] + self.rot.1);
        let w = 0.5 * (self.snap[4] + self.x[3]);

        let l = (3.0 - rx * rx - ry * ry) * 0.5;
        rx *= l;
        ry *= l;

        let dt_ld = dt / motor.ld;
        let dt_lq = dt / motor.lq;
        let dt_j = dt / motor.inertia;
        let zp = f32::from(motor.pole_pairs);
        let zp2 = 1.5 * zp * zp * dt_j;

        // Nonzero entries of A - the identity terms are folded in where the
        // row couples a variable to itself.
        let a = [
            1.0 - motor.rs * dt_ld,                            // iD <- iD
            w * motor.lq * dt_ld,                              // iD <- iQ
            (rx * u.1 - ry * u.0) * dt_ld,                     // iD <- theta
            i_q * motor.lq * dt_ld,                            // iD <- omega
            -w * motor.ld * dt_lq,                             // iQ <- iD
            1.0 - motor.rs * dt_lq,                            // iQ <- iQ
            (-ry * u.1 - rx * u.0) * dt_lq,                    // iQ <- theta
            (-self.flux - i_d * motor.ld) * dt_lq,             // iQ <- omega
            -w * dt_lq,                                        // iQ <- flux
            i_q * (motor.ld - motor.lq) * zp2,                 // omega <- iD
            zp2 * (self.flux - i_d * (motor.lq - motor.ld)),   // omega <- iQ
            -zp * dt_j,                                        // omega <- load
            i_q * zp2,                                         // omega <- flux
        ];

        // PA = P * A', full 6x6 since symmetry is lost mid-product.
        let pa = [
            p[0] * a[0] + p[1] * a[1] + p[3] * a[2] + p[6] * a[3],
            p[0] * a[4] + p[1] * a[5] + p[3] * a[6] + p[6] * a[7] + p[15] * a[8],
            p[3] + p[6] * dt,
            p[0] * a[9] + p[1] * a[10] + p[6] + p[10] * a[11] + p[15] * a[12],
            p[10],
            p[15],
            p[1] * a[0] + p[2] * a[1] + p[4] * a[2] + p[7] * a[3],
            p[1] * a[4] + p[2] * a[5] + p[4] * a[6] + p[7] * a[7] + p[16] * a[8],
            p[4] + p[7] * dt,
            p[1] * a[9] + p[2] * a[10] + p[7] + p[11] * a[11] + p[16] * a[12],
            p[11],
            p[16],
            p[3] * a[0] + p[4] * a[1] + p[5] * a[2] + p[8] * a[3],
            p[3] * a[4] + p[4] * a[5] + p[5] * a[6] + p[8] * a[7] + p[17] * a[8],
            p[5] + p[8] * dt,
            p[3] * a[9] + p[4] * a[10] + p[8] + p[12] * a[11] + p[17] * a[12],
            p[12],
            p[17],
            p[6] * a[0] + p[7] * a[1] + p[8] * a[2] + p[9] * a[3],
            p[6] * a[4] + p[7] * a[5] + p[8] * a[6] + p[9] * a[7] + p[18] * a[8],
            p[8] + p[9] * dt,
            p[6] * a[9] + p[7] * a[10] + p[9] + p[13] * a[11] + p[18] * a[12],
            p[13],
            p[18],
            p[10] * a[0] + p[11] * a[1] + p[12] * a[2] + p[13] * a[3],
            p[10] * a[4] + p[11] * a[5] + p[12] * a[6] + p[13] * a[7] + p[19] * a[8],
            p[12] + p[13] * dt,
            p[10] * a[9] + p[11] * a[10] + p[13] + p[14] * a[11] + p[19] * a[12],
            p[14],
            p[19],
            p[15] * a[0] + p[16] * a[1] + p[17] * a[2] + p[18] * a[3],
            p[15] * a[4] + p[16] * a[5] + p[17] * a[6] + p[18] * a[7] + p[20] * a[8],
            p[17] + p[18] * dt,
            p[15] * a[9] + p[16] * a[10] + p[18] + p[19] * a[11] + p[20] * a[12],
            p[19],
            p[20],
        ];

        p[0] = a[0] * pa[0] + a[1] * pa[6] + a[2] * pa[12] + a[3] * pa[18] + q[0];
        p[1] = a[4] * pa[0] + a[5] * pa[6] + a[6] * pa[12] + a[7] * pa[18] + a[8] * pa[30];
        p[2] = a[4] * pa[1] + a[5] * pa[7] + a[6] * pa[13] + a[7] * pa[19] + a[8] * pa[31] + q[1];
        p[3] = pa[12] + dt * pa[18];
        p[4] = pa[13] + dt * pa[19];
        p[5] = pa[14] + dt * pa[20] + q[2];
        p[6] = a[9] * pa[0] + a[10] * pa[6] + pa[18] + a[11] * pa[24] + a[12] * pa[30];
        p[7] = a[9] * pa[1] + a[10] * pa[7] + pa[19] + a[11] * pa[25] + a[12] * pa[31];
        p[8] = a[9] * pa[2] + a[10] * pa[8] + pa[20] + a[11] * pa[26] + a[12] * pa[32];
        p[9] = a[9] * pa[3] + a[10] * pa[9] + pa[21] + a[11] * pa[27] + a[12] * pa[33] + q[3];
        p[10] = pa[24];
        p[11] = pa[25];
        p[12] = pa[26];
        p[13] = pa[27];
        p[14] = pa[28] + q[4];
        p[15] = pa[30];
        p[16] = pa[31];
        p[17] = pa[32];
        p[18] = pa[33];
        p[19] = pa[34];
        p[20] = pa[35] + q[5];
    }
}
