//! Calibrated measurement channel on top of a raw oversampling ADC.

use fugit::MicrosDurationU32;

use crate::{
    error::CalibrationError,
    interface::AdcSource,
    scaling::{CalibrationPair, Scaler},
    timer::TickDuration,
    types::MeterMode,
};

/// Timing of a measurement channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeterConfig {
    /// How often the filtered value updates.
    pub update_period: TickDuration,
    /// Interval between raw samples from the ADC driver.
    pub sample_period: MicrosDurationU32,
    /// How long a peak stays on the display in the peak modes.
    pub hold_time: TickDuration,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            update_period: TickDuration::millis(320),
            sample_period: MicrosDurationU32::micros(1_000),
            hold_time: TickDuration::millis(1_000),
        }
    }
}

impl MeterConfig {
    /// Number of raw samples averaged into one filtered value.
    pub fn decimation(&self) -> u16 {
        Self::samples_in(self.update_period, self.sample_period)
    }

    /// Number of raw samples a peak is held for.
    pub fn hold_samples(&self) -> u16 {
        Self::samples_in(self.hold_time, self.sample_period)
    }

    fn samples_in(period: TickDuration, sample: MicrosDurationU32) -> u16 {
        let sample_us = sample.to_micros().max(1);
        let samples = period.to_micros() / sample_us;
        samples.clamp(1, u16::MAX as u32) as u16
    }
}

/// One measured quantity: a fast unfiltered reading plus a decimated one.
pub struct MeasurementChannel<A: AdcSource> {
    adc: A,
    scaler: Scaler,
    mode: MeterMode,
    decimation: u16,
    hold_samples: u16,
    accumulator: u32,
    samples: u16,
    hold: u16,
    fast_update: bool,
    fast_code: u16,
    fast_value: u16,
    ready: bool,
    code: u16,
    value: u16,
}

impl<A: AdcSource> MeasurementChannel<A> {
    pub fn new(adc: A, config: MeterConfig) -> Self {
        Self {
            adc,
            scaler: Scaler::identity(),
            mode: MeterMode::Average,
            decimation: config.decimation(),
            hold_samples: config.hold_samples(),
            accumulator: 0,
            samples: 0,
            hold: 0,
            fast_update: false,
            fast_code: 0,
            fast_value: 0,
            ready: false,
            code: 0,
            value: 0,
        }
    }

    /// Poll the ADC driver. Returns whether a raw sample was processed this tick.
    pub fn execute(&mut self) -> bool {
        if self.adc.ready() {
            let code = self.adc.code();
            self.on_raw_sample(code);
        } else {
            self.fast_update = false;
        }
        self.fast_update
    }

    /// Feed one raw sample.
    pub fn on_raw_sample(&mut self, code: u16) {
        self.fast_code = code;
        self.fast_value = self.scaler.code_to_value(code);
        self.hold = self.hold.saturating_sub(1);

        self.accumulator += code as u32;
        self.samples += 1;
        if self.samples >= self.decimation {
            let n = self.decimation as u32;
            self.code = ((self.accumulator + n / 2) / n) as u16;
            if self.mode == MeterMode::Average {
                self.value = self.scaler.code_to_value(self.code);
            }
            self.accumulator = 0;
            self.samples = 0;
            self.ready = true;
        }

        match self.mode {
            MeterMode::Average => {}
            MeterMode::PeakHigh => self.track_peak(self.fast_value >= self.value),
            MeterMode::PeakLow => self.track_peak(self.fast_value <= self.value),
        }
        self.fast_update = true;
    }

    fn track_peak(&mut self, new_peak: bool) {
        if new_peak {
            self.value = self.fast_value;
            self.hold = self.hold_samples;
        } else if self.hold == 0 {
            self.value = self.fast_value;
        }
    }

    /// Whether a filtered update happened, without consuming it.
    pub fn query(&self) -> bool {
        self.ready
    }

    /// Whether a filtered update happened. Consumes the flag.
    pub fn ready(&mut self) -> bool {
        core::mem::take(&mut self.ready)
    }

    /// Drop the partial average in progress.
    pub fn sync(&mut self) {
        self.accumulator = 0;
        self.samples = 0;
        self.ready = false;
    }

    pub fn set_mode(&mut self, mode: MeterMode) {
        self.mode = mode;
        self.hold = 0;
    }

    pub fn mode(&self) -> MeterMode {
        self.mode
    }

    /// Recalibrate. The previous calibration stays in place on error.
    pub fn calibrate(&mut self, pair: CalibrationPair) -> Result<(), CalibrationError> {
        self.scaler.calibrate_pair(pair)
    }

    pub fn scaler(&self) -> &Scaler {
        &self.scaler
    }

    /// Raw sample processed on the last poll.
    pub fn fast_update(&self) -> bool {
        self.fast_update
    }

    /// Last raw code.
    pub fn fast_code(&self) -> u16 {
        self.fast_code
    }

    /// Last raw code, calibrated.
    pub fn fast_value(&self) -> u16 {
        self.fast_value
    }

    /// Last decimated code.
    pub fn code(&self) -> u16 {
        self.code
    }

    /// Filtered value according to the meter mode.
    pub fn value(&self) -> u16 {
        self.value
    }

    pub fn decimation(&self) -> u16 {
        self.decimation
    }

    pub fn source(&self) -> &A {
        &self.adc
    }

    pub fn source_mut(&mut self) -> &mut A {
        &mut self.adc
    }
}
