//! Drive configuration and construction-time validation.
//!
//! The per-tick pipeline has no runtime error path, so everything that could
//! make it misbehave - zero sample rate, non-positive inductances, a probe
//! above Nyquist - is rejected once, when the drive is built.

use crate::control::{CurrentConfig, SpeedConfig};
use crate::estimator::EkfConfig;
use crate::fsm::ProbeConfig;
use crate::model::MotorParams;

/// Affine scaling from raw ADC codes to physical units. The offsets are
/// refined in place by drift calibration.
#[derive(Clone, Copy, Debug)]
pub struct AdcScale {
    /// Code corresponding to zero phase current (half scale of the
    /// converter).
    pub center: u16,
    /// Phase A gain (A/LSB).
    pub gain_a: f32,
    /// Phase A offset (A).
    pub offset_a: f32,
    /// Phase B gain (A/LSB).
    pub gain_b: f32,
    /// Phase B offset (A).
    pub offset_b: f32,
    /// DC-link gain (V/LSB).
    pub gain_u: f32,
    /// DC-link offset (V).
    pub offset_u: f32,
}

impl Default for AdcScale {
    fn default() -> Self {
        Self {
            center: 2048,
            gain_a: 0.01464844,
            offset_a: 0.0,
            gain_b: 0.01464844,
            offset_b: 0.0,
            gain_u: 0.00725098,
            offset_u: 0.0,
        }
    }
}

/// Commissioning phase durations.
#[derive(Clone, Copy, Debug)]
pub struct Timings {
    /// Long drift-averaging window (s).
    pub drift_s: f32,
    /// Forced-alignment hold during spin-up (s).
    pub hold_s: f32,
    /// Zero-voltage dwell before leaving the END state (s).
    pub end_s: f32,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            drift_s: 0.1,
            hold_s: 0.7,
            end_s: 0.1,
        }
    }
}

/// Rejected configuration values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    /// PWM frequency must be positive and finite.
    PwmFrequency,
    /// PWM resolution must be nonzero.
    PwmResolution,
    /// Minimum pulse width must leave room for a pulse in the period.
    MinPulse,
    /// Inductances, inertia and pole count must be positive; resistance and
    /// flux linkage non-negative.
    MotorParameter,
    /// Measurement noise must be positive, process noise non-negative.
    NoiseCovariance,
    /// Probe frequency must be positive and below the Nyquist rate of the
    /// control loop.
    ProbeFrequency,
}

/// Everything needed to build a [`crate::Drive`]. Defaults reproduce the
/// stock controller tuning.
#[derive(Clone, Copy, Debug)]
pub struct DriveConfig {
    /// PWM and current-sample frequency (Hz).
    pub pwm_freq_hz: f32,
    /// PWM timer resolution, ticks per period; duty codes span
    /// `[0, pwm_resolution]`.
    pub pwm_resolution: u16,
    /// Minimum pulse width in ticks. `None` selects the default of 250 ns
    /// worth of timer ticks.
    pub min_pulse: Option<u16>,
    /// Initial DC-link voltage (V); drift calibration refines it online.
    pub vbus: f32,
    pub adc: AdcScale,
    pub motor: MotorParams,
    pub ekf: EkfConfig,
    pub current: CurrentConfig,
    pub speed: SpeedConfig,
    pub probe: ProbeConfig,
    pub timings: Timings,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            pwm_freq_hz: 30_000.0,
            pwm_resolution: 2100,
            min_pulse: None,
            vbus: 0.0,
            adc: AdcScale::default(),
            motor: MotorParams::default(),
            ekf: EkfConfig::default(),
            current: CurrentConfig::default(),
            speed: SpeedConfig::default(),
            probe: ProbeConfig::default(),
            timings: Timings::default(),
        }
    }
}

impl DriveConfig {
    /// Minimum pulse width in ticks, applying the 250 ns default when none
    /// is configured.
    pub fn min_pulse_ticks(&self) -> u16 {
        self.min_pulse.unwrap_or_else(|| {
            libm::roundf(250e-9 * self.pwm_freq_hz * f32::from(self.pwm_resolution)) as u16
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.pwm_freq_hz > 0.0) || !self.pwm_freq_hz.is_finite() {
            return Err(ConfigError::PwmFrequency);
        }
        if self.pwm_resolution == 0 {
            return Err(ConfigError::PwmResolution);
        }
        if u32::from(self.min_pulse_ticks()) * 2 >= u32::from(self.pwm_resolution) {
            return Err(ConfigError::MinPulse);
        }

        let m = &self.motor;
        if !(m.ld > 0.0) || !(m.lq > 0.0) || !(m.inertia > 0.0) || m.pole_pairs == 0 {
            return Err(ConfigError::MotorParameter);
        }
        if !(m.rs >= 0.0) || !(m.flux_linkage >= 0.0) {
            return Err(ConfigError::MotorParameter);
        }

        if !(self.ekf.r > 0.0) || self.ekf.q.iter().any(|q| !(*q >= 0.0)) {
            return Err(ConfigError::NoiseCovariance);
        }

        if !(self.probe.freq_hz > 0.0) || self.probe.freq_hz >= 0.5 * self.pwm_freq_hz {
            return Err(ConfigError::ProbeFrequency);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(DriveConfig::default().validate(), Ok(()));
    }

    #[test]
    fn default_min_pulse_follows_timer() {
        let mut config = DriveConfig::default();
        config.pwm_freq_hz = 30_000.0;
        config.pwm_resolution = 1000;
        // 250 ns * 30 kHz * 1000 = 7.5 ticks.
        assert_eq!(config.min_pulse_ticks(), 8);

        config.min_pulse = Some(5);
        assert_eq!(config.min_pulse_ticks(), 5);
    }

    #[test]
    fn rejects_degenerate_values() {
        let mut config = DriveConfig::default();
        config.pwm_freq_hz = 0.0;
        assert_eq!(config.validate(), Err(ConfigError::PwmFrequency));

        let mut config = DriveConfig::default();
        config.motor.ld = 0.0;
        assert_eq!(config.validate(), Err(ConfigError::MotorParameter));

        let mut config = DriveConfig::default();
        config.ekf.r = 0.0;
        assert_eq!(config.validate(), Err(ConfigError::NoiseCovariance));

        let mut config = DriveConfig::default();
        config.probe.freq_hz = 20_000.0;
        assert_eq!(config.validate(), Err(ConfigError::ProbeFrequency));

        let mut config = DriveConfig::default();
        config.min_pulse = Some(1100);
        assert_eq!(config.validate(), Err(ConfigError::MinPulse));
    }
}
