//! Small value types shared between the modules.

use strum_macros::EnumIter;

/// What a measurement channel reports as its filtered value.
#[repr(u16)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, EnumIter)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MeterMode {
    /// Decimated average.
    #[default]
    Average = 0x00,
    /// Highest sample, held for a while.
    PeakHigh = 0x01,
    /// Lowest sample, held for a while.
    PeakLow = 0x02,
}

impl TryFrom<u16> for MeterMode {
    type Error = ();
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            m if m == MeterMode::Average as u16 => Ok(MeterMode::Average),
            m if m == MeterMode::PeakHigh as u16 => Ok(MeterMode::PeakHigh),
            m if m == MeterMode::PeakLow as u16 => Ok(MeterMode::PeakLow),
            _ => Err(()),
        }
    }
}
