//! Calibration data set for the four analog channels.
//!
//! The DAC channels own full (value, code) pairs. The meters are calibrated against the same
//! reference values and only keep their own measured codes.

use strum::IntoEnumIterator;
use strum_macros::EnumIter;

use crate::{
    params::{self, ParamId, ParamStore, TopLimits},
    scaling::{CODE_MAX, CalPoint, CalibrationPair, Scaler},
};

/// DAC code used for the channel not under calibration, 1/8 of full scale.
pub const DAC_CAL_CODE: u16 = CODE_MAX / 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CalChannel {
    VoltageOut,
    CurrentOut,
    VoltageIn,
    CurrentIn,
}

impl CalChannel {
    /// Value and code parameters of both points, `(value1, code1, value2, code2)`.
    pub fn params(self) -> [ParamId; 4] {
        use ParamId as P;
        match self {
            CalChannel::VoltageOut => [P::CalV1Value, P::CalV1Code, P::CalV2Value, P::CalV2Code],
            CalChannel::CurrentOut => [P::CalI1Value, P::CalI1Code, P::CalI2Value, P::CalI2Code],
            CalChannel::VoltageIn => [P::CalV1Value, P::CalVm1Code, P::CalV2Value, P::CalVm2Code],
            CalChannel::CurrentIn => [P::CalI1Value, P::CalIm1Code, P::CalI2Value, P::CalIm2Code],
        }
    }

    /// Channel whose pair a calibration parameter belongs to. Reference values map to the DAC.
    pub fn of(id: ParamId) -> Option<Self> {
        use ParamId as P;
        match id {
            P::CalV1Value | P::CalV1Code | P::CalV2Value | P::CalV2Code => Some(Self::VoltageOut),
            P::CalI1Value | P::CalI1Code | P::CalI2Value | P::CalI2Code => Some(Self::CurrentOut),
            P::CalVm1Code | P::CalVm2Code => Some(Self::VoltageIn),
            P::CalIm1Code | P::CalIm2Code => Some(Self::CurrentIn),
            _ => None,
        }
    }

    /// Meter channel measuring what this DAC channel drives.
    pub fn meter(self) -> Self {
        match self {
            CalChannel::VoltageOut | CalChannel::VoltageIn => CalChannel::VoltageIn,
            CalChannel::CurrentOut | CalChannel::CurrentIn => CalChannel::CurrentIn,
        }
    }
}

/// The four reference points set up during a calibration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RefPoint {
    Voltage1,
    Voltage2,
    Current1,
    Current2,
}

impl RefPoint {
    pub fn is_voltage(self) -> bool {
        matches!(self, RefPoint::Voltage1 | RefPoint::Voltage2)
    }

    /// DAC channel the point belongs to.
    pub fn channel(self) -> CalChannel {
        if self.is_voltage() {
            CalChannel::VoltageOut
        } else {
            CalChannel::CurrentOut
        }
    }

    pub fn value_param(self) -> ParamId {
        match self {
            RefPoint::Voltage1 => ParamId::CalV1Value,
            RefPoint::Voltage2 => ParamId::CalV2Value,
            RefPoint::Current1 => ParamId::CalI1Value,
            RefPoint::Current2 => ParamId::CalI2Value,
        }
    }

    pub fn code_param(self) -> ParamId {
        match self {
            RefPoint::Voltage1 => ParamId::CalV1Code,
            RefPoint::Voltage2 => ParamId::CalV2Code,
            RefPoint::Current1 => ParamId::CalI1Code,
            RefPoint::Current2 => ParamId::CalI2Code,
        }
    }

    pub fn meter_code_param(self) -> ParamId {
        match self {
            RefPoint::Voltage1 => ParamId::CalVm1Code,
            RefPoint::Voltage2 => ParamId::CalVm2Code,
            RefPoint::Current1 => ParamId::CalIm1Code,
            RefPoint::Current2 => ParamId::CalIm2Code,
        }
    }
}

/// The twelve stored calibration items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationData {
    pub v1: u16,
    pub v1_code: u16,
    pub v2: u16,
    pub v2_code: u16,
    pub i1: u16,
    pub i1_code: u16,
    pub i2: u16,
    pub i2_code: u16,
    pub vm1_code: u16,
    pub vm2_code: u16,
    pub im1_code: u16,
    pub im2_code: u16,
}

impl Default for CalibrationData {
    fn default() -> Self {
        Self::nominal()
    }
}

impl CalibrationData {
    /// Factory defaults.
    pub fn nominal() -> Self {
        let mut data = Self {
            v1: 0,
            v1_code: 0,
            v2: 0,
            v2_code: 0,
            i1: 0,
            i1_code: 0,
            i2: 0,
            i2_code: 0,
            vm1_code: 0,
            vm2_code: 0,
            im1_code: 0,
            im2_code: 0,
        };
        for id in ParamId::iter().filter(|id| id.is_calibration()) {
            data.set(id, id.base_limits().nominal);
        }
        data
    }

    fn slot_mut(&mut self, id: ParamId) -> Option<&mut u16> {
        use ParamId as P;
        let slot = match id {
            P::CalV1Value => &mut self.v1,
            P::CalV1Code => &mut self.v1_code,
            P::CalV2Value => &mut self.v2,
            P::CalV2Code => &mut self.v2_code,
            P::CalI1Value => &mut self.i1,
            P::CalI1Code => &mut self.i1_code,
            P::CalI2Value => &mut self.i2,
            P::CalI2Code => &mut self.i2_code,
            P::CalVm1Code => &mut self.vm1_code,
            P::CalVm2Code => &mut self.vm2_code,
            P::CalIm1Code => &mut self.im1_code,
            P::CalIm2Code => &mut self.im2_code,
            _ => return None,
        };
        Some(slot)
    }

    /// Calibration item by parameter, `None` for non-calibration parameters.
    pub fn get(&self, id: ParamId) -> Option<u16> {
        use ParamId as P;
        let value = match id {
            P::CalV1Value => self.v1,
            P::CalV1Code => self.v1_code,
            P::CalV2Value => self.v2,
            P::CalV2Code => self.v2_code,
            P::CalI1Value => self.i1,
            P::CalI1Code => self.i1_code,
            P::CalI2Value => self.i2,
            P::CalI2Code => self.i2_code,
            P::CalVm1Code => self.vm1_code,
            P::CalVm2Code => self.vm2_code,
            P::CalIm1Code => self.im1_code,
            P::CalIm2Code => self.im2_code,
            _ => return None,
        };
        Some(value)
    }

    /// Update a calibration item. Returns false for non-calibration parameters.
    pub fn set(&mut self, id: ParamId, value: u16) -> bool {
        match self.slot_mut(id) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Calibration pair of a channel.
    pub fn pair(&self, channel: CalChannel) -> CalibrationPair {
        let [p1, c1, p2, c2] = channel.params().map(|id| self.get(id).unwrap_or_default());
        CalibrationPair::new(CalPoint::new(p1, c1), CalPoint::new(p2, c2))
    }

    /// Read every item from the store, clamped to its limits.
    pub fn load<S: ParamStore>(store: &mut S, top: &TopLimits) -> Result<Self, S::Error> {
        let mut data = Self::nominal();
        for id in ParamId::iter().filter(|id| id.is_calibration()) {
            let value = params::load(store, id, id.limits(top))?;
            data.set(id, value);
        }
        Ok(data)
    }

    /// Write every item into the store's working copy.
    pub fn store<S: ParamStore>(&self, store: &mut S) -> Result<(), S::Error> {
        for id in ParamId::iter().filter(|id| id.is_calibration()) {
            if let Some(value) = self.get(id) {
                store.set(id, value)?;
            }
        }
        Ok(())
    }

    /// Pull the upper reference points inside the top limits.
    ///
    /// A clamped point gets its DAC code re-derived from the channel's current scaler. Returns
    /// whether anything changed.
    pub fn trim(&mut self, top: &TopLimits, dac_v: &Scaler, dac_i: &Scaler) -> bool {
        let mut changed = false;
        let v2_max = ParamId::CalV2Value.limits(top).max;
        if self.v2 > v2_max {
            self.v2 = v2_max;
            self.v2_code = dac_v.value_to_code(v2_max);
            changed = true;
        }
        let i2_max = ParamId::CalI2Value.limits(top).max;
        if self.i2 > i2_max {
            self.i2 = i2_max;
            self.i2_code = dac_i.value_to_code(i2_max);
            changed = true;
        }
        if changed {
            debug!("Calibration points trimmed to top limits");
        }
        changed
    }
}
