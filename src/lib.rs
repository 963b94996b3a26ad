#![no_std]

//! Sensorless PMSM drive core for RC and robotics controllers.
//!
//! Everything here runs inside the current-sample interrupt, once per PWM
//! period: the raw ADC codes go in, three duty codes come out through the
//! [`PwmSink`] seam, and the full electromechanical state of the motor -
//! currents, angle, speed, load torque, flux linkage - is estimated along
//! the way by a six-state extended Kalman filter. No position sensor is
//! required.
//!
//! The per-tick pipeline while the drive is running:
//!
//! 1. scale the ADC codes to Ampere/Volt,
//! 2. step the request-driven state machine (drift calibration, impedance
//!    identification, spin-up, shutdown),
//! 3. EKF measurement update and state propagation,
//! 4. DQ current PI, rotated to the stator frame and realised by the
//!    space-vector modulator,
//! 5. EKF covariance propagation across the voltage actually applied.
//!
//! Hardware drivers, the console shell, persistence and CAN transport are
//! collaborators on the other side of this crate's API.

#[cfg(test)]
extern crate std;

pub mod config;
pub mod control;
pub mod drive;
pub mod estimator;
pub mod fsm;
pub mod math;
pub mod model;
pub mod modulator;

pub use config::{AdcScale, ConfigError, DriveConfig, Timings};
pub use control::{CurrentConfig, CurrentLoop, SpeedConfig, SpeedLoop};
pub use drive::{Drive, Snapshot};
pub use estimator::{Ekf, EkfConfig};
pub use fsm::{DriveState, Modes, ProbeConfig, Request};
pub use model::MotorParams;
pub use modulator::{PwmSink, Svpwm};
