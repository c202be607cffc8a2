//! Persisted parameters: identifiers, limits and the store contract.
//!
//! Every value the core keeps across power cycles is a `u16` addressed by a [`ParamId`]. Where it is
//! actually kept (EEPROM, flash, a file on a host) is up to the [`ParamStore`] implementation.

use heapless::index_map::FnvIndexMap;
use strum_macros::{EnumCount, EnumIter};
use thiserror::Error;

use crate::scaling::{CODE_MAX, VALUE_MAX};

/// All persisted parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumCount)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParamId {
    /// Top voltage limit, 0.01 V.
    MaxVoltage,
    /// Top current limit, 0.001 A.
    MaxCurrent,
    /// Top power limit, 0.1 W.
    MaxPower,
    /// Voltage setpoint, 0.01 V.
    Voltage,
    /// Current setpoint, 0.001 A.
    Current,
    /// Over-voltage threshold. Equal to the top limit means disabled.
    OverVoltage,
    /// Over-current threshold. Equal to the top limit means disabled.
    OverCurrent,
    /// Over-power threshold. Equal to the top limit means disabled.
    OverPower,
    /// Protection trip delay, ms.
    TripDelay,
    /// Over-temperature threshold, 0.1 °C.
    OverTemperature,
    /// Fan start temperature, 0.1 °C.
    FanLow,
    /// Fan full speed temperature, 0.1 °C.
    FanHigh,
    /// Auto-off time, s. Zero disables.
    OffTime,
    VoltageMeterMode,
    CurrentMeterMode,
    /// Keep the enable line asserted while the output is off.
    DownProgrammer,
    CalV1Value,
    CalV1Code,
    CalV2Value,
    CalV2Code,
    CalI1Value,
    CalI1Code,
    CalI2Value,
    CalI2Code,
    CalVm1Code,
    CalVm2Code,
    CalIm1Code,
    CalIm2Code,
}

/// Declared range and default of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamLimits {
    pub min: u16,
    pub nominal: u16,
    pub max: u16,
}

impl ParamLimits {
    pub const fn new(min: u16, nominal: u16, max: u16) -> Self {
        Self { min, nominal, max }
    }

    pub fn contains(&self, value: u16) -> bool {
        (self.min..=self.max).contains(&value)
    }

    pub fn clamp(&self, value: u16) -> u16 {
        value.clamp(self.min, self.max)
    }

    /// Lower the maximum, keeping the nominal value inside.
    fn trimmed(self, max: u16) -> Self {
        let max = max.max(self.min);
        Self {
            min: self.min,
            nominal: self.nominal.min(max),
            max,
        }
    }
}

/// Current top limits, which bound the setpoints, thresholds and upper calibration points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopLimits {
    pub max_voltage: u16,
    pub max_current: u16,
    pub max_power: u16,
}

impl Default for TopLimits {
    fn default() -> Self {
        Self {
            max_voltage: ParamId::MaxVoltage.base_limits().nominal,
            max_current: ParamId::MaxCurrent.base_limits().nominal,
            max_power: ParamId::MaxPower.base_limits().nominal,
        }
    }
}

impl ParamId {
    /// Limits independent of the top limits.
    pub const fn base_limits(self) -> ParamLimits {
        use ParamId as P;
        match self {
            P::MaxVoltage => ParamLimits::new(1000, 3600, VALUE_MAX),
            P::MaxCurrent => ParamLimits::new(1000, 4000, VALUE_MAX),
            P::MaxPower => ParamLimits::new(10, 1000, VALUE_MAX),
            P::Voltage => ParamLimits::new(0, 500, VALUE_MAX),
            P::Current => ParamLimits::new(0, 1000, VALUE_MAX),
            P::OverVoltage => ParamLimits::new(0, 3600, VALUE_MAX),
            P::OverCurrent => ParamLimits::new(0, 4000, VALUE_MAX),
            P::OverPower => ParamLimits::new(0, 1000, VALUE_MAX),
            P::TripDelay => ParamLimits::new(0, 0, 999),
            P::OverTemperature => ParamLimits::new(200, 600, 999),
            P::FanLow => ParamLimits::new(200, 450, 999),
            P::FanHigh => ParamLimits::new(200, 550, 999),
            // 18 hours.
            P::OffTime => ParamLimits::new(0, 0, 64_800),
            P::VoltageMeterMode | P::CurrentMeterMode => ParamLimits::new(0, 0, 2),
            P::DownProgrammer => ParamLimits::new(0, 0, 1),
            P::CalV1Value => ParamLimits::new(1, 100, 899),
            P::CalV2Value => ParamLimits::new(900, 3500, 3600),
            P::CalI1Value => ParamLimits::new(1, 100, 899),
            P::CalI2Value => ParamLimits::new(900, 1900, 4000),
            P::CalV1Code => ParamLimits::new(1, 3764, CODE_MAX),
            P::CalV2Code => ParamLimits::new(1, 60019, CODE_MAX),
            P::CalI1Code => ParamLimits::new(1, 3599, CODE_MAX),
            P::CalI2Code => ParamLimits::new(1, 30402, CODE_MAX),
            P::CalVm1Code => ParamLimits::new(1, 3764, CODE_MAX),
            P::CalVm2Code => ParamLimits::new(1, 60019, CODE_MAX),
            P::CalIm1Code => ParamLimits::new(1, 3599, CODE_MAX),
            P::CalIm2Code => ParamLimits::new(1, 30402, CODE_MAX),
        }
    }

    /// Limits with the top limits applied.
    pub fn limits(self, top: &TopLimits) -> ParamLimits {
        use ParamId as P;
        let base = self.base_limits();
        match self {
            P::Voltage | P::OverVoltage | P::CalV2Value => base.trimmed(top.max_voltage),
            P::Current | P::OverCurrent | P::CalI2Value => base.trimmed(top.max_current),
            P::OverPower => base.trimmed(top.max_power),
            _ => base,
        }
    }

    /// Parameters whose limits depend on this one.
    pub fn dependents(self) -> &'static [ParamId] {
        use ParamId as P;
        match self {
            P::MaxVoltage => &[P::Voltage, P::OverVoltage, P::CalV2Value],
            P::MaxCurrent => &[P::Current, P::OverCurrent, P::CalI2Value],
            P::MaxPower => &[P::OverPower],
            _ => &[],
        }
    }

    /// One of the top limits.
    pub fn is_top(self) -> bool {
        matches!(self, ParamId::MaxVoltage | ParamId::MaxCurrent | ParamId::MaxPower)
    }

    pub fn is_calibration(self) -> bool {
        (self as u8) >= (ParamId::CalV1Value as u8)
    }
}

/// Persistent key/value storage for parameters.
pub trait ParamStore {
    type Error: core::fmt::Debug;

    /// Stored value, `None` if the parameter was never written.
    fn get(&mut self, id: ParamId) -> Result<Option<u16>, Self::Error>;

    /// Update the working copy.
    fn set(&mut self, id: ParamId, value: u16) -> Result<(), Self::Error>;

    /// Commit the working copy to the backing medium.
    fn persist(&mut self) -> Result<(), Self::Error>;
}

/// Read a parameter, falling back to the nominal value and clamping into range.
pub fn load<S: ParamStore>(
    store: &mut S,
    id: ParamId,
    limits: ParamLimits,
) -> Result<u16, S::Error> {
    let Some(stored) = store.get(id)? else {
        return Ok(limits.nominal);
    };
    let value = limits.clamp(stored);
    if value != stored {
        warn!("Stored {:?} = {} out of range, using {}", id, stored, value);
    }
    Ok(value)
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MemoryStoreError {
    #[error("Parameter table full")]
    Full,
}

const STORE_CAPACITY: usize = 32;

/// RAM backed store with a separate persisted copy.
#[derive(Default)]
pub struct MemoryStore {
    working: FnvIndexMap<ParamId, u16, STORE_CAPACITY>,
    persisted: FnvIndexMap<ParamId, u16, STORE_CAPACITY>,
    persist_count: u32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop unsaved changes.
    pub fn revert(&mut self) {
        self.working = self.persisted.clone();
    }

    /// Value as of the last [`ParamStore::persist`].
    pub fn persisted(&self, id: ParamId) -> Option<u16> {
        self.persisted.get(&id).copied()
    }

    /// How many times the store was persisted.
    pub fn persist_count(&self) -> u32 {
        self.persist_count
    }
}

impl ParamStore for MemoryStore {
    type Error = MemoryStoreError;

    fn get(&mut self, id: ParamId) -> Result<Option<u16>, Self::Error> {
        Ok(self.working.get(&id).copied())
    }

    fn set(&mut self, id: ParamId, value: u16) -> Result<(), Self::Error> {
        self.working
            .insert(id, value)
            .map_err(|_| MemoryStoreError::Full)?;
        Ok(())
    }

    fn persist(&mut self) -> Result<(), Self::Error> {
        self.persisted = self.working.clone();
        self.persist_count += 1;
        Ok(())
    }
}
