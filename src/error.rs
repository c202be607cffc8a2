//! Our error types for the analog core.

use thiserror::Error;

use crate::params::ParamId;

pub type Result<T, E = core::convert::Infallible> = core::result::Result<T, Error<E>>;

/// Reasons a pair of calibration points can't produce a usable scaler.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CalibrationError {
    #[error("Both calibration points use code {0}")]
    CoincidentCodes(u16),
    #[error("Both calibration points use value {0}")]
    CoincidentValues(u16),
    #[error("Calibration code falls while value rises")]
    InvertedSlope,
    #[error("Calibration coefficients out of range")]
    Overflow,
}

/// Error type for the analog core, generic over the parameter store's error.
#[derive(Error, Debug)]
pub enum Error<E: core::fmt::Debug> {
    #[error("Calibration error: {0}")]
    Calibration(CalibrationError),
    #[error("Parameter {param:?} value {value} outside {min}..={max}")]
    OutOfRange {
        param: ParamId,
        value: u16,
        min: u16,
        max: u16,
    },
    /// Output on while over-temperature is latched, or a calibration point taken in the wrong mode.
    #[error("Operation refused in the current state")]
    Refused,
    #[error("Parameter store error")]
    Store(E),
}

impl<E: core::fmt::Debug> From<CalibrationError> for Error<E> {
    fn from(err: CalibrationError) -> Self {
        Error::Calibration(err)
    }
}
