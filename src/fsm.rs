//! Request-driven sequencing: commissioning, spin-up and shutdown.
//!
//! Collaborators post a [`Request`]; the machine consumes it from IDLE and
//! walks the drive through drift calibration into the requested operation.
//! Every step runs inside the sample tick, before the estimation/control
//! pipeline.

use core::f32::consts::PI;

use num_complex::Complex32;

use crate::drive::Drive;
use crate::math;
use crate::modulator::PwmSink;

/// Top-level drive state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DriveState {
    Idle,
    /// Zero-voltage averaging of the current sensors and the DC link.
    Drift,
    /// AC impedance identification.
    Impedance,
    /// Reserved for sensor path calibration.
    Calibrate,
    /// Forced alignment, then release into closed-loop run.
    Spinup,
    /// Reserved for coordinated shutdown from closed loop.
    Brake,
    /// Zero-voltage dwell on the way back to IDLE.
    End,
}

/// Requests a collaborator may post while the machine is idle. Requests that
/// are invalid in the present state are cleared silently.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Request {
    Impedance,
    Calibrate,
    Spinup,
    Brake,
}

/// Mode flags gating the per-tick pipeline.
#[derive(Clone, Copy, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Modes {
    /// EKF, current loop and modulator run every tick.
    pub closed_loop: bool,
    /// Outer speed loop shapes the Q-axis current setpoint.
    pub speed_loop: bool,
    /// Discontinuous modulation: the neutral is pinned to a rail.
    pub efficient_modulation: bool,
}

/// AC impedance probe parameters.
#[derive(Clone, Copy, Debug)]
pub struct ProbeConfig {
    /// Probe frequency (Hz).
    pub freq_hz: f32,
    /// Rotating-vector voltage amplitude (V).
    pub amplitude: f32,
    /// Transient discarded before capture starts (s).
    pub skip_s: f32,
    /// DFT capture window (s).
    pub capture_s: f32,
    /// Standing voltage bias under the rotating vector (V).
    pub bias: (f32, f32),
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            freq_hz: 1000.0,
            amplitude: 2.0,
            skip_s: 0.05,
            capture_s: 0.2,
            bias: (0.0, 0.0),
        }
    }
}

/// Rotating-vector injection with synchronous DFT accumulation.
///
/// The phasor advances by one complex multiplication per tick and is pulled
/// back onto the unit circle with a single Newton step, so it never drifts
/// in amplitude over a capture window.
pub struct ImpedanceProbe {
    pub config: ProbeConfig,
    rot: Complex32,
    step: Complex32,
    /// Smoothed stator-frame current from the previous tick.
    last: (f32, f32),
    /// Current DFT bins for the stator X and Y axes.
    pub current_x: Complex32,
    pub current_y: Complex32,
    /// Voltage DFT bins.
    pub voltage_x: Complex32,
    pub voltage_y: Complex32,
}

impl ImpedanceProbe {
    pub fn new(config: ProbeConfig) -> Self {
        Self {
            config,
            rot: Complex32::new(1.0, 0.0),
            step: Complex32::new(1.0, 0.0),
            last: (0.0, 0.0),
            current_x: Complex32::new(0.0, 0.0),
            current_y: Complex32::new(0.0, 0.0),
            voltage_x: Complex32::new(0.0, 0.0),
            voltage_y: Complex32::new(0.0, 0.0),
        }
    }

    /// Arm the probe: derive the per-tick rotation from the configured
    /// frequency and clear all four DFT bins.
    fn start(&mut self, i_xy: (f32, f32), tick_hz: f32) {
        let w = 2.0 * PI * self.config.freq_hz / tick_hz;
        self.step = Complex32::new(math::cos(w), math::sin(w));
        self.rot = Complex32::new(1.0, 0.0);
        self.last = i_xy;
        self.current_x = Complex32::new(0.0, 0.0);
        self.current_y = Complex32::new(0.0, 0.0);
        self.voltage_x = Complex32::new(0.0, 0.0);
        self.voltage_y = Complex32::new(0.0, 0.0);
    }

    /// One probe tick: smooth the current sample, advance the phasor,
    /// optionally accumulate the DFT bins, and return the voltage vector to
    /// command (V).
    ///
    /// `u_applied` is the vector realised on the previous tick, so voltage
    /// and current enter their bins over the same interval.
    fn advance(&mut self, i_xy: (f32, f32), u_applied: (f32, f32), capture: bool) -> (f32, f32) {
        let i_x = 0.5 * (self.last.0 + i_xy.0);
        let i_y = 0.5 * (self.last.1 + i_xy.1);

        self.rot = self.step * self.rot;
        let l = (3.0 - self.rot.norm_sqr()) * 0.5;
        self.rot = self.rot * l;

        if capture {
            self.current_x += self.rot * i_x;
            self.current_y += self.rot * i_y;
            self.voltage_x += self.rot * u_applied.0;
            self.voltage_y += self.rot * u_applied.1;
        }

        self.last = (i_x, i_y);

        (
            self.config.bias.0 + self.rot.re * self.config.amplitude,
            self.config.bias.1 + self.rot.im * self.config.amplitude,
        )
    }
}

/// State-machine bookkeeping.
pub struct Sequencer {
    pub state: DriveState,
    pub request: Option<Request>,
    /// Sub-step within the current state.
    pub substep: u8,
    timer: u32,
    timer_end: u32,
    sum_a: f32,
    sum_b: f32,
    sum_u: f32,
    pub probe: ImpedanceProbe,
}

impl Sequencer {
    pub fn new(probe: ProbeConfig) -> Self {
        Self {
            state: DriveState::Idle,
            request: None,
            substep: 0,
            timer: 0,
            timer_end: 0,
            sum_a: 0.0,
            sum_b: 0.0,
            sum_u: 0.0,
            probe: ImpedanceProbe::new(probe),
        }
    }
}

impl Drive {
    /// One state-machine step. `i_a`, `i_b` are the scaled phase currents,
    /// `u_s` the scaled DC-link sample.
    pub(crate) fn sequence<P: PwmSink>(&mut self, i_a: f32, i_b: f32, u_s: f32, pwm: &mut P) {
        match self.seq.state {
            DriveState::Idle => {
                if let Some(request) = self.seq.request {
                    if self.modes.closed_loop {
                        // A running drive only honours a brake request.
                        if request == Request::Brake {
                            self.seq.state = DriveState::Brake;
                        } else {
                            self.seq.request = None;
                        }
                    } else {
                        match request {
                            Request::Impedance | Request::Calibrate | Request::Spinup => {
                                // All operations enter through drift
                                // calibration; the request is kept to pick
                                // the branch afterwards.
                                self.seq.state = DriveState::Drift;
                            }
                            Request::Brake => self.seq.request = None,
                        }
                    }
                }
            }
            DriveState::Drift => self.drift_step(i_a, i_b, u_s, pwm),
            DriveState::Impedance => self.impedance_step(i_a, i_b, pwm),
            DriveState::Calibrate => {
                // Reserved: sensor calibration is commissioned offline for
                // now.
            }
            DriveState::Spinup => self.spinup_step(),
            DriveState::Brake => {
                // Reserved.
                // TODO: ramp both current setpoints to zero before dropping
                // the closed-loop flag, then fall through to End.
            }
            DriveState::End => self.end_step(pwm),
        }
    }

    /// Zero-voltage averaging. Sub-step 1 is a short window that retunes the
    /// ADC zero offsets and the DC-link estimate; sub-step 2 is the long
    /// window that learns the sensor operating-point drifts consumed by the
    /// EKF measurement model.
    fn drift_step<P: PwmSink>(&mut self, i_a: f32, i_b: f32, u_s: f32, pwm: &mut P) {
        if self.seq.substep == 0 {
            self.u_applied =
                self.modulator
                    .apply((0.0, 0.0), self.vbus, self.modes.efficient_modulation, pwm);

            self.seq.sum_a = 0.0;
            self.seq.sum_b = 0.0;
            self.seq.sum_u = 0.0;
            self.seq.timer = 0;
            self.seq.timer_end = 64;
            self.seq.substep = 1;
        } else {
            self.seq.sum_a += -i_a;
            self.seq.sum_b += -i_b;
            self.seq.sum_u += u_s - self.vbus;
            self.seq.timer += 1;

            if self.seq.timer >= self.seq.timer_end {
                let n = self.seq.timer_end as f32;
                self.vbus += self.seq.sum_u / n;

                if self.seq.substep == 1 {
                    self.adc.offset_a += self.seq.sum_a / n;
                    self.adc.offset_b += self.seq.sum_b / n;

                    self.seq.sum_a = 0.0;
                    self.seq.sum_b = 0.0;
                    self.seq.sum_u = 0.0;
                    self.seq.timer = 0;
                    self.seq.timer_end = (self.freq_hz * self.timings.drift_s) as u32;
                    self.seq.substep = 2;
                } else {
                    self.drift = (self.seq.sum_a / n, self.seq.sum_b / n);

                    self.seq.state = match self.seq.request {
                        Some(Request::Impedance) => DriveState::Impedance,
                        Some(Request::Calibrate) => DriveState::Calibrate,
                        Some(Request::Spinup) => DriveState::Spinup,
                        _ => {
                            self.seq.request = None;
                            DriveState::Idle
                        }
                    };
                    self.seq.substep = 0;
                }
            }
        }
    }

    /// Rotating-vector injection; the capture window feeds four synchronous
    /// DFT bins from which the collaborator derives R and L.
    fn impedance_step<P: PwmSink>(&mut self, i_a: f32, i_b: f32, pwm: &mut P) {
        // Stator-frame current; phase C is implicit.
        let i_x = i_a;
        let i_y = 0.57735027 * i_a + 1.1547005 * i_b;

        if self.seq.substep == 0 {
            self.seq.probe.start((i_x, i_y), self.freq_hz);
            self.seq.timer = 0;
            self.seq.timer_end = (self.freq_hz * self.seq.probe.config.skip_s) as u32;
            self.seq.substep = 1;
        } else {
            let capture = self.seq.substep == 2;
            let (u_x, u_y) = self.seq.probe.advance((i_x, i_y), self.u_applied, capture);

            self.u_applied = self.modulator.apply(
                (u_x / self.vbus, u_y / self.vbus),
                self.vbus,
                self.modes.efficient_modulation,
                pwm,
            );

            self.seq.timer += 1;
            if self.seq.timer >= self.seq.timer_end {
                if self.seq.substep == 1 {
                    self.seq.timer = 0;
                    self.seq.timer_end = (self.freq_hz * self.seq.probe.config.capture_s) as u32;
                    self.seq.substep = 2;
                } else {
                    self.seq.state = DriveState::End;
                    self.seq.substep = 0;
                }
            }
        }
    }

    /// Forced alignment: re-seed the filter, hold the rotor on the D axis,
    /// then release with a Q-axis setpoint and return to IDLE running.
    fn spinup_step(&mut self) {
        if self.seq.substep == 0 {
            self.modes.closed_loop = true;

            self.ekf.reinit();
            self.drift = (0.0, 0.0);

            self.current.setpoint_d = 1.0;
            self.current.setpoint_q = 0.0;

            self.seq.timer = 0;
            self.seq.timer_end = (self.freq_hz * self.timings.hold_s) as u32;
            self.seq.substep = 1;
        } else {
            self.seq.timer += 1;
            if self.seq.timer >= self.seq.timer_end {
                self.current.setpoint_d = 0.0;
                self.current.setpoint_q = 1.0;

                self.seq.request = None;
                self.seq.state = DriveState::Idle;
                self.seq.substep = 0;
            }
        }
    }

    /// Zero voltage, modes cleared, then a dwell long enough for the gate
    /// driver bootstrap supplies to settle before the next operation.
    fn end_step<P: PwmSink>(&mut self, pwm: &mut P) {
        if self.seq.substep == 0 {
            self.u_applied =
                self.modulator
                    .apply((0.0, 0.0), self.vbus, self.modes.efficient_modulation, pwm);

            self.modes = Modes::default();
            self.seq.timer = 0;
            self.seq.timer_end = (self.freq_hz * self.timings.end_s) as u32;
            self.seq.substep = 1;
        } else {
            self.seq.timer += 1;
            if self.seq.timer >= self.seq.timer_end {
                self.seq.request = None;
                self.seq.state = DriveState::Idle;
                self.seq.substep = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriveConfig;

    struct NullPwm;

    impl PwmSink for NullPwm {
        fn set_phase_duties(&mut self, _duties: [u16; 3]) {}
    }

    fn drive() -> Drive {
        Drive::new(DriveConfig::default()).unwrap()
    }

    #[test]
    fn idle_enters_drift_on_spinup_request() {
        let mut drive = drive();
        drive.request(Request::Spinup);

        drive.feedback(2048, 2048, 0, &mut NullPwm);
        assert_eq!(drive.seq.state, DriveState::Drift);
        // The request is kept for the branch after drift.
        assert_eq!(drive.seq.request, Some(Request::Spinup));
    }

    #[test]
    fn brake_request_is_cleared_when_not_running() {
        let mut drive = drive();
        drive.request(Request::Brake);

        drive.feedback(2048, 2048, 0, &mut NullPwm);
        assert_eq!(drive.seq.state, DriveState::Idle);
        assert_eq!(drive.seq.request, None);
    }

    #[test]
    fn running_drive_only_honours_brake() {
        let mut drive = drive();
        drive.modes.closed_loop = true;
        drive.vbus = 12.0;

        drive.request(Request::Impedance);
        drive.feedback(2048, 2048, 0, &mut NullPwm);
        assert_eq!(drive.seq.state, DriveState::Idle);
        assert_eq!(drive.seq.request, None);

        drive.request(Request::Brake);
        drive.feedback(2048, 2048, 0, &mut NullPwm);
        assert_eq!(drive.seq.state, DriveState::Brake);
    }

    #[test]
    fn probe_phasor_stays_on_unit_circle() {
        let mut probe = ImpedanceProbe::new(ProbeConfig::default());
        probe.start((0.0, 0.0), 30_000.0);

        for _ in 0..10_000 {
            probe.advance((0.0, 0.0), (0.0, 0.0), false);
            let norm = probe.rot.norm_sqr();
            assert!((norm - 1.0).abs() < 1e-3, "norm = {norm}");
        }
    }

    #[test]
    fn probe_output_is_biased_rotation() {
        let mut probe = ImpedanceProbe::new(ProbeConfig {
            amplitude: 3.0,
            bias: (1.0, -1.0),
            ..ProbeConfig::default()
        });
        probe.start((0.0, 0.0), 30_000.0);

        let (u_x, u_y) = probe.advance((0.0, 0.0), (0.0, 0.0), false);
        let off = ((u_x - 1.0) * (u_x - 1.0) + (u_y + 1.0) * (u_y + 1.0)).sqrt();
        assert!((off - 3.0).abs() < 1e-3);
    }
}
