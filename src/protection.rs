//! Latching over-voltage, over-current, over-power and over-temperature protection.

use modular_bitfield::prelude::*;
use strum_macros::{EnumCount, EnumIter};

use crate::{
    interface::TempReading,
    timer::{SoftTimer, Ticks},
};

/// Divisor turning `0.001 A * 0.01 V` into `0.1 W`.
pub const VI2P: u32 = 10_000;

/// Default distance below the OTP threshold where the fan is forced to full speed, 0.1 °C.
pub const OTP_MARGIN: i16 = 30;

/// The independent faults the engine latches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, EnumCount)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Fault {
    OverVoltage,
    OverCurrent,
    OverPower,
    OverTemperature,
}

/// Latched fault flags.
#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectionStatus {
    pub ovp: bool,
    pub ocp: bool,
    pub opp: bool,
    pub otp: bool,
    #[skip]
    __: B4,
}

impl ProtectionStatus {
    pub fn contains(&self, fault: Fault) -> bool {
        match fault {
            Fault::OverVoltage => self.ovp(),
            Fault::OverCurrent => self.ocp(),
            Fault::OverPower => self.opp(),
            Fault::OverTemperature => self.otp(),
        }
    }

    pub fn insert(&mut self, fault: Fault) {
        self.assign(fault, true);
    }

    pub fn remove(&mut self, fault: Fault) {
        self.assign(fault, false);
    }

    /// No fault latched.
    pub fn is_clear(&self) -> bool {
        !(self.ovp() || self.ocp() || self.opp() || self.otp())
    }

    fn assign(&mut self, fault: Fault, latched: bool) {
        match fault {
            Fault::OverVoltage => self.set_ovp(latched),
            Fault::OverCurrent => self.set_ocp(latched),
            Fault::OverPower => self.set_opp(latched),
            Fault::OverTemperature => self.set_otp(latched),
        }
    }
}

/// A protection threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Limit {
    /// Never trips.
    Disabled,
    /// Trips at or above this level.
    Level(u16),
}

impl Limit {
    /// Decode the stored form, where a threshold equal to the channel maximum means disabled.
    pub fn from_threshold(threshold: u16, max: u16) -> Self {
        if threshold >= max {
            Limit::Disabled
        } else {
            Limit::Level(threshold)
        }
    }

    /// Encode back into the stored form.
    pub fn to_threshold(self, max: u16) -> u16 {
        match self {
            Limit::Disabled => max,
            Limit::Level(level) => level.min(max),
        }
    }

    pub fn exceeded_by(self, value: u16) -> bool {
        match self {
            Limit::Disabled => false,
            Limit::Level(level) => value >= level,
        }
    }
}

/// Protection levels. All electrical protections are disabled by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectionConfig {
    /// Over-voltage level, 0.01 V.
    pub over_voltage: Limit,
    /// Over-current level, 0.001 A.
    pub over_current: Limit,
    /// Over-power level, 0.1 W.
    pub over_power: Limit,
    /// How long a level must be exceeded before tripping.
    pub trip_delay: Ticks,
    /// Over-temperature level, 0.1 °C.
    pub over_temperature: i16,
    /// Distance below `over_temperature` where the fan runs flat out, 0.1 °C.
    pub otp_margin: i16,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        ProtectionConfig {
            over_voltage: Limit::Disabled,
            over_current: Limit::Disabled,
            over_power: Limit::Disabled,
            trip_delay: 0,
            over_temperature: 600,
            otp_margin: OTP_MARGIN,
        }
    }
}

/// Fast readings available this tick. `None` when the channel produced no new sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FastReadings {
    pub voltage: Option<u16>,
    pub current: Option<u16>,
    /// Latest fast voltage, used with a fresh current sample for the power check.
    pub last_voltage: u16,
}

/// What a thermometer update asks the rest of the controller to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThermalVerdict {
    /// Run the fan at full speed regardless of its own policy.
    pub force_full_fan: bool,
    /// Sound the over-temperature warning.
    pub warn: bool,
    /// Switch the output off.
    pub trip: bool,
}

/// Power in 0.1 W from current in 0.001 A and voltage in 0.01 V.
pub fn power(current: u16, voltage: u16) -> u16 {
    let p = current as u32 * voltage as u32 / VI2P;
    p.min(u16::MAX as u32) as u16
}

pub struct ProtectionEngine {
    status: ProtectionStatus,
    ovp_timer: SoftTimer,
    ocp_timer: SoftTimer,
    opp_timer: SoftTimer,
}

impl ProtectionEngine {
    pub fn new(now: Ticks) -> Self {
        Self {
            status: ProtectionStatus::new(),
            ovp_timer: SoftTimer::new(0, now),
            ocp_timer: SoftTimer::new(0, now),
            opp_timer: SoftTimer::new(0, now),
        }
    }

    /// Restart every trip timer. Called when the output turns on.
    pub fn arm(&mut self, now: Ticks, delay: Ticks) {
        self.ovp_timer.start_with(now, delay);
        self.ocp_timer.start_with(now, delay);
        self.opp_timer.start_with(now, delay);
    }

    /// Evaluate the electrical protections for one tick while the output is on.
    ///
    /// At most one fault trips per call, checked over-voltage first. The caller switches the output
    /// off when a fault is returned.
    pub fn check_electrical(
        &mut self,
        now: Ticks,
        readings: FastReadings,
        config: &ProtectionConfig,
    ) -> Option<Fault> {
        let delay = config.trip_delay;
        if let Some(v) = readings.voltage {
            if Self::check(&mut self.ovp_timer, now, delay, config.over_voltage, v) {
                return Some(self.trip(Fault::OverVoltage, v));
            }
        }
        if let Some(i) = readings.current {
            if Self::check(&mut self.ocp_timer, now, delay, config.over_current, i) {
                return Some(self.trip(Fault::OverCurrent, i));
            }
            let v = readings.voltage.unwrap_or(readings.last_voltage);
            let p = power(i, v);
            if Self::check(&mut self.opp_timer, now, delay, config.over_power, p) {
                return Some(self.trip(Fault::OverPower, p));
            }
        }
        None
    }

    /// Timer bookkeeping shared by the electrical checks. Returns whether the fault trips.
    fn check(timer: &mut SoftTimer, now: Ticks, delay: Ticks, limit: Limit, value: u16) -> bool {
        if limit.exceeded_by(value) {
            timer.is_over(now)
        } else {
            timer.start_with(now, delay);
            false
        }
    }

    fn trip(&mut self, fault: Fault, value: u16) -> Fault {
        warn!("Protection trip {:?} at {}", fault, value);
        self.status.insert(fault);
        fault
    }

    /// Evaluate a thermometer update. Runs whether or not the output is on.
    pub fn check_thermal(
        &mut self,
        reading: TempReading,
        output_on: bool,
        config: &ProtectionConfig,
    ) -> ThermalVerdict {
        let Some(temp) = reading.value() else {
            // Unknown temperature never keeps the output locked out.
            self.status.remove(Fault::OverTemperature);
            return ThermalVerdict::default();
        };

        let warn_level = config.over_temperature.saturating_sub(config.otp_margin);
        if temp <= warn_level {
            self.status.remove(Fault::OverTemperature);
            return ThermalVerdict::default();
        }

        let mut verdict = ThermalVerdict {
            force_full_fan: true,
            warn: output_on,
            trip: false,
        };
        if temp > config.over_temperature {
            if !self.status.otp() {
                warn!("Over-temperature at {}", temp);
            }
            self.status.insert(Fault::OverTemperature);
            verdict.trip = true;
        }
        verdict
    }

    /// Clear the electrical faults. Over-temperature clears itself once the heatsink cools down.
    pub fn clear_faults(&mut self) {
        self.status.remove(Fault::OverVoltage);
        self.status.remove(Fault::OverCurrent);
        self.status.remove(Fault::OverPower);
    }

    pub fn status(&self) -> ProtectionStatus {
        self.status
    }
}
