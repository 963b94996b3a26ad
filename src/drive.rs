//! The drive aggregate and the per-sample entry point.
//!
//! One [`Drive`] owns everything a single motor needs: configuration,
//! estimator, regulators, modulator and sequencing state. The sample
//! interrupt borrows it exclusively for the duration of each tick; any other
//! context that wants to publish a setpoint or read the estimates must hold
//! exclusion against that interrupt (mask the sample IRQ around the access).
//! Nothing in here allocates or blocks.

use crate::config::{AdcScale, ConfigError, DriveConfig, Timings};
use crate::control::{CurrentLoop, SpeedLoop};
use crate::estimator::Ekf;
use crate::fsm::{DriveState, Modes, Request, Sequencer};
use crate::model::MotorParams;
use crate::modulator::{PwmSink, Svpwm};

/// Complete state of one motor drive.
pub struct Drive {
    pub(crate) freq_hz: f32,
    pub(crate) dt: f32,
    pub adc: AdcScale,
    pub motor: MotorParams,
    pub ekf: Ekf,
    pub current: CurrentLoop,
    pub speed: SpeedLoop,
    pub modulator: Svpwm,
    pub modes: Modes,
    pub seq: Sequencer,
    pub timings: Timings,
    /// DC-link voltage estimate (V), refined during drift calibration.
    pub vbus: f32,
    /// Stator voltage vector applied over the last period (V), reconstructed
    /// by the modulator from the duty codes it actually wrote.
    pub u_applied: (f32, f32),
    /// Current-sensor operating-point drifts (A), subtracted in the EKF
    /// measurement model; learned during drift calibration.
    pub drift: (f32, f32),
}

impl Drive {
    pub fn new(config: DriveConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self {
            freq_hz: config.pwm_freq_hz,
            dt: 1.0 / config.pwm_freq_hz,
            adc: config.adc,
            motor: config.motor,
            ekf: Ekf::new(config.ekf, config.motor.flux_linkage),
            current: CurrentLoop::new(config.current),
            speed: SpeedLoop::new(config.speed),
            modulator: Svpwm {
                resolution: config.pwm_resolution,
                min_pulse: config.min_pulse_ticks(),
            },
            modes: Modes::default(),
            seq: Sequencer::new(config.probe),
            timings: config.timings,
            vbus: config.vbus,
            u_applied: (0.0, 0.0),
            drift: (0.0, 0.0),
        })
    }

    /// Post a request; the state machine consumes it on its next idle tick.
    /// Call from a context that holds exclusion against the sample
    /// interrupt.
    pub fn request(&mut self, request: Request) {
        self.seq.request = Some(request);
    }

    /// Sample period (s).
    pub fn dt(&self) -> f32 {
        self.dt
    }

    /// Per-sample entry point, called from the current-sample interrupt with
    /// the three raw ADC codes (phase A, phase B, DC link).
    pub fn feedback<P: PwmSink>(&mut self, code_a: u16, code_b: u16, code_u: u16, pwm: &mut P) {
        // Conversion to Ampere and Volt.
        let center = f32::from(self.adc.center);
        let i_a = self.adc.gain_a * (f32::from(code_a) - center) + self.adc.offset_a;
        let i_b = self.adc.gain_b * (f32::from(code_b) - center) + self.adc.offset_b;
        let u_s = self.adc.gain_u * f32::from(code_u) + self.adc.offset_u;

        self.sequence(i_a, i_b, u_s, pwm);

        if self.modes.closed_loop {
            // Correct against the new samples, then propagate one period.
            self.ekf
                .measure_update(i_a, i_b, self.drift, &self.motor, self.u_applied, self.dt);

            // Current loop on the fresh estimates; its DQ request is rotated
            // to the stator frame on the cached axes and realised at once,
            // so the stored vector is what the motor actually sees.
            let (u_d, u_q) = self.current.update(self.ekf.x[0], self.ekf.x[1]);
            let (rx, ry) = self.ekf.rot;
            let request = (rx * u_d - ry * u_q, ry * u_d + rx * u_q);
            self.u_applied =
                self.modulator
                    .apply(request, self.vbus, self.modes.efficient_modulation, pwm);

            if self.modes.speed_loop {
                // Takes effect on the next tick's current loop.
                self.current.setpoint_q = self.speed.update(self.ekf.x[3], self.dt);
            }

            // Covariance propagation across the same input the state saw.
            self.ekf.time_update(&self.motor, self.u_applied, self.dt);
        }
    }

    /// Copy of the externally observable state, for shell, CAN and telemetry
    /// layers.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            i_d: self.ekf.x[0],
            i_q: self.ekf.x[1],
            theta: self.ekf.x[2],
            omega: self.ekf.x[3],
            load: self.ekf.load,
            flux: self.ekf.flux,
            vbus: self.vbus,
            u_applied: self.u_applied,
            state: self.seq.state,
            substep: self.seq.substep,
        }
    }
}

/// Plain-data view of the estimated state.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Snapshot {
    /// D-axis current estimate (A).
    pub i_d: f32,
    /// Q-axis current estimate (A).
    pub i_q: f32,
    /// Electrical angle estimate (rad), in (-PI, PI].
    pub theta: f32,
    /// Electrical speed estimate (rad/s).
    pub omega: f32,
    /// External load torque estimate (N·m).
    pub load: f32,
    /// PM flux linkage estimate (Wb).
    pub flux: f32,
    /// DC-link voltage estimate (V).
    pub vbus: f32,
    /// Last applied stator voltage (V).
    pub u_applied: (f32, f32),
    pub state: DriveState,
    pub substep: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullPwm;

    impl PwmSink for NullPwm {
        fn set_phase_duties(&mut self, _duties: [u16; 3]) {}
    }

    #[test]
    fn tick_scales_codes_and_corrects_the_estimate() {
        let mut drive = Drive::new(DriveConfig::default()).unwrap();
        drive.modes.closed_loop = true;
        drive.vbus = 12.0;
        drive.ekf.p[0] = 1.0;
        drive.ekf.p[2] = 1.0;

        // +100 LSB on phase A, -100 LSB on phase B reads roughly
        // (1.46, -0.85) A in the stationary frame, which starts aligned with
        // the rotor frame. One tick pulls the estimate most of the way.
        drive.feedback(2148, 1948, 0, &mut NullPwm);

        assert!(
            drive.ekf.x[0] > 1.0 && drive.ekf.x[0] < 1.6,
            "iD = {}",
            drive.ekf.x[0]
        );
        assert!(
            drive.ekf.x[1] < -0.5 && drive.ekf.x[1] > -1.1,
            "iQ = {}",
            drive.ekf.x[1]
        );
    }

    #[test]
    fn idle_drive_leaves_state_untouched() {
        let mut drive = Drive::new(DriveConfig::default()).unwrap();

        drive.feedback(2048, 2048, 1000, &mut NullPwm);
        assert_eq!(drive.ekf.x, [0.0; 4]);
        assert_eq!(drive.u_applied, (0.0, 0.0));

        let snap = drive.snapshot();
        assert_eq!(snap.state, DriveState::Idle);
        assert_eq!(snap.substep, 0);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = DriveConfig::default();
        config.motor.inertia = 0.0;
        assert!(Drive::new(config).is_err());
    }
}
