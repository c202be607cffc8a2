//! Calibrated DAC output channel with an on/off gate.

use crate::{
    error::CalibrationError,
    interface::DacSink,
    scaling::{CalibrationPair, Scaler},
};

/// One programmed quantity (voltage or current setpoint).
///
/// While off the sink is held at the zero code, which is the code of the channel's zero value.
/// The setpoint code is remembered and restored when the channel is switched back on.
/// A setpoint given as a value follows recalibration; a raw code stays as written.
pub struct OutputChannel<D: DacSink> {
    dac: D,
    scaler: Scaler,
    on: bool,
    /// Setpoint value, `None` after a raw code was programmed.
    value: Option<u16>,
    code: u16,
    zero_value: u16,
    zero_code: u16,
}

impl<D: DacSink> OutputChannel<D> {
    /// New channel, off, with an identity scaler. `zero_value` is what the sink gets while off.
    pub fn new(mut dac: D, zero_value: u16) -> Self {
        let scaler = Scaler::identity();
        let zero_code = scaler.value_to_code(zero_value);
        dac.write(zero_code);
        Self {
            dac,
            scaler,
            on: false,
            value: None,
            code: 0,
            zero_value,
            zero_code,
        }
    }

    /// Program a physical value.
    pub fn set_value(&mut self, value: u16) {
        self.value = Some(value);
        self.write_code(self.scaler.value_to_code(value));
    }

    /// Program a raw code. Only reaches the sink while on.
    pub fn set_code(&mut self, code: u16) {
        self.value = None;
        self.write_code(code);
    }

    fn write_code(&mut self, code: u16) {
        self.code = code;
        if self.on {
            self.dac.write(code);
        }
    }

    /// Change the value held while off.
    pub fn set_zero(&mut self, value: u16) {
        self.zero_value = value;
        self.zero_code = self.scaler.value_to_code(value);
        if !self.on {
            self.dac.write(self.zero_code);
        }
    }

    pub fn on_off(&mut self, on: bool) {
        self.on = on;
        self.dac.write(if on { self.code } else { self.zero_code });
    }

    pub fn is_on(&self) -> bool {
        self.on
    }

    /// Recalibrate. The zero code and a setpoint given as a value follow the new calibration.
    pub fn calibrate(&mut self, pair: CalibrationPair) -> Result<(), CalibrationError> {
        self.scaler.calibrate_pair(pair)?;
        self.zero_code = self.scaler.value_to_code(self.zero_value);
        if let Some(value) = self.value {
            self.code = self.scaler.value_to_code(value);
        }
        self.dac.write(if self.on { self.code } else { self.zero_code });
        Ok(())
    }

    /// Setpoint value, `None` while a raw code is programmed.
    pub fn value(&self) -> Option<u16> {
        self.value
    }

    /// Programmed setpoint code, whether or not it currently reaches the sink.
    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn zero_code(&self) -> u16 {
        self.zero_code
    }

    pub fn scaler(&self) -> &Scaler {
        &self.scaler
    }

    pub fn sink(&self) -> &D {
        &self.dac
    }
}
