//! Fixed-point conversion between converter codes and physical values.
//!
//! A [`Scaler`] is derived from two calibration points. Both coefficients are stored pre-multiplied
//! by [`SCALE`], which is picked so the largest physical value still leaves one bit of headroom in a
//! 64-bit word after multiplying by a 16-bit code.

use crate::error::CalibrationError;

/// Largest physical value any channel reports (99.99 V, 9.999 A, 999.9 W).
pub const VALUE_MAX: u16 = 9_999;

/// Native resolution of the converters, bits.
pub const NATIVE_BITS: u32 = 12;
/// Resolution after oversampling, bits.
pub const OVERSAMPLED_BITS: u32 = 16;

/// Largest code the oversampled converters produce or accept.
pub const CODE_MAX: u16 = ((1u32 << OVERSAMPLED_BITS) - (1u32 << (OVERSAMPLED_BITS - NATIVE_BITS))) as u16;

/// Coefficient scale factor: `2^(64 - 16 - 1) / VALUE_MAX`.
pub const SCALE: i64 = (1i64 << (64 - 16 - 1)) / VALUE_MAX as i64;

/// One (physical value, raw code) calibration point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CalPoint {
    pub value: u16,
    pub code: u16,
}

impl CalPoint {
    pub const fn new(value: u16, code: u16) -> Self {
        Self { value, code }
    }
}

/// Two calibration points for one physical channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CalibrationPair {
    pub first: CalPoint,
    pub second: CalPoint,
}

impl CalibrationPair {
    pub const fn new(first: CalPoint, second: CalPoint) -> Self {
        Self { first, second }
    }

    /// Check the points describe a rising line.
    pub fn validate(&self) -> Result<(), CalibrationError> {
        let (p1, p2) = self.ordered();
        if p1.code == p2.code {
            return Err(CalibrationError::CoincidentCodes(p1.code));
        }
        if p1.value == p2.value {
            return Err(CalibrationError::CoincidentValues(p1.value));
        }
        if p2.code < p1.code {
            return Err(CalibrationError::InvertedSlope);
        }
        Ok(())
    }

    /// Points ordered by value.
    fn ordered(&self) -> (CalPoint, CalPoint) {
        if self.second.value < self.first.value {
            (self.second, self.first)
        } else {
            (self.first, self.second)
        }
    }
}

/// Affine code <-> value transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scaler {
    /// Value per code, times [`SCALE`].
    gain: i64,
    /// Value offset, times [`SCALE`].
    offset: i64,
}

impl Default for Scaler {
    /// One value unit per code.
    fn default() -> Self {
        Self::identity()
    }
}

impl Scaler {
    /// Scaler mapping each code to the value of the same number.
    pub const fn identity() -> Self {
        Self {
            gain: SCALE,
            offset: 0,
        }
    }

    /// Build a scaler from a calibration pair.
    pub fn from_pair(pair: CalibrationPair) -> Result<Self, CalibrationError> {
        let mut scaler = Self::identity();
        scaler.calibrate_pair(pair)?;
        Ok(scaler)
    }

    /// Recompute the coefficients so `code1 -> value1` and `code2 -> value2`.
    ///
    /// On error the current coefficients are kept.
    pub fn calibrate(
        &mut self,
        value1: u16,
        code1: u16,
        value2: u16,
        code2: u16,
    ) -> Result<(), CalibrationError> {
        self.calibrate_pair(CalibrationPair::new(
            CalPoint::new(value1, code1),
            CalPoint::new(value2, code2),
        ))
    }

    /// Same as [`Self::calibrate`], taking a [`CalibrationPair`].
    pub fn calibrate_pair(&mut self, pair: CalibrationPair) -> Result<(), CalibrationError> {
        pair.validate()?;
        let (p1, p2) = pair.ordered();

        let dp = (p2.value - p1.value) as i128;
        let dc = (p2.code - p1.code) as i128;
        let scale = SCALE as i128;

        let gain = (scale * dp + dc / 2) / dc;
        let offset = gain * p1.code as i128 - scale * p1.value as i128;

        self.gain = i64::try_from(gain).map_err(|_| CalibrationError::Overflow)?;
        self.offset = i64::try_from(offset).map_err(|_| CalibrationError::Overflow)?;
        Ok(())
    }

    /// Convert a raw code to a physical value, clamped to `0..=VALUE_MAX`.
    pub fn code_to_value(&self, code: u16) -> u16 {
        let scale = SCALE as i128;
        let v = (self.gain as i128 * code as i128 - self.offset as i128 + scale / 2) / scale;
        v.clamp(0, VALUE_MAX as i128) as u16
    }

    /// Convert a physical value to a raw code, clamped to `0..=CODE_MAX`.
    pub fn value_to_code(&self, value: u16) -> u16 {
        let gain = self.gain as i128;
        let c = (SCALE as i128 * value as i128 + self.offset as i128 + gain / 2) / gain;
        c.clamp(0, CODE_MAX as i128) as u16
    }

    /// Value per code coefficient, scaled by [`SCALE`].
    pub fn gain(&self) -> i64 {
        self.gain
    }

    /// Offset coefficient, scaled by [`SCALE`].
    pub fn offset(&self) -> i64 {
        self.offset
    }
}
