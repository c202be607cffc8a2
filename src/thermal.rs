//! Heatsink fan control.
//!
//! The speed policy maps temperature to a raw speed. A small state machine on top of it gives the
//! motor a kick when starting and keeps it running for a minimum number of updates, so it neither
//! stalls at low duty nor chatters on and off around the lower threshold.

use crate::interface::TempReading;

/// Configured fan behavior. Speeds in percent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanConfig {
    /// Fan starts here, 0.1 °C.
    pub low: i16,
    /// Fan is at full speed here, 0.1 °C.
    pub high: i16,
    /// Lowest speed the motor reliably turns at.
    pub min_speed: u8,
    /// Speed used for the first updates after starting.
    pub startup_speed: u8,
    pub max_speed: u8,
    /// Thermometer updates the fan keeps running after a start.
    pub min_run: u16,
}

impl Default for FanConfig {
    fn default() -> Self {
        FanConfig {
            low: 450,
            high: 550,
            min_speed: 20,
            startup_speed: 30,
            max_speed: 100,
            min_run: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FanState {
    #[default]
    Off,
    Running,
}

/// Raw speed for a temperature, before the start/stop policy.
///
/// `previous` is only used by the relay configuration (`low >= high`), which holds its output
/// between the thresholds.
pub fn speed_policy(
    low: TempReading,
    high: TempReading,
    temp: TempReading,
    previous: u8,
    config: &FanConfig,
) -> u8 {
    let (Some(tl), Some(th), Some(t)) = (low.value(), high.value(), temp.value()) else {
        return config.max_speed;
    };

    if tl < th {
        if t > th {
            config.max_speed
        } else if t < tl {
            0
        } else {
            let span = th as i32 - tl as i32;
            let range = config.max_speed as i32 - config.min_speed as i32;
            let rise = t as i32 - tl as i32;
            let speed = config.min_speed as i32 + (rise * range + span / 2) / span;
            speed.clamp(0, u8::MAX as i32) as u8
        }
    } else if t > tl {
        config.max_speed
    } else if t < th {
        0
    } else {
        previous
    }
}

pub struct FanController {
    config: FanConfig,
    state: FanState,
    speed: u8,
    run_left: u16,
}

impl FanController {
    pub fn new(config: FanConfig) -> Self {
        Self {
            config,
            state: FanState::Off,
            speed: 0,
            run_left: 0,
        }
    }

    /// Compute the commanded speed for one thermometer update.
    pub fn control(&mut self, low: TempReading, high: TempReading, temp: TempReading) -> u8 {
        let cfg = self.config;
        let raw = speed_policy(low, high, temp, self.speed, &cfg);

        let speed = match self.state {
            FanState::Off if raw > cfg.min_speed => {
                debug!("Fan starting");
                self.state = FanState::Running;
                self.run_left = cfg.min_run;
                cfg.startup_speed
            }
            FanState::Off => 0,
            FanState::Running if self.run_left > 0 => {
                self.run_left -= 1;
                raw.max(cfg.min_speed)
            }
            FanState::Running if raw < cfg.min_speed => {
                debug!("Fan stopping");
                self.state = FanState::Off;
                0
            }
            FanState::Running => raw,
        };
        self.speed = speed.min(cfg.max_speed);
        self.speed
    }

    /// Control with the configured thresholds.
    pub fn control_with_config(&mut self, temp: TempReading, force_full: bool) -> u8 {
        let low = TempReading::Valid(self.config.low);
        let high = if force_full {
            TempReading::Failed
        } else {
            TempReading::Valid(self.config.high)
        };
        self.control(low, high, temp)
    }

    pub fn set_thresholds(&mut self, low: i16, high: i16) {
        self.config.low = low;
        self.config.high = high;
    }

    pub fn config(&self) -> &FanConfig {
        &self.config
    }

    pub fn speed(&self) -> u8 {
        self.speed
    }

    pub fn state(&self) -> FanState {
        self.state
    }
}
