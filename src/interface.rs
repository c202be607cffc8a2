//! Narrow contracts of the collaborators the analog core drives.
//!
//! Drivers, the thermometer transport, the fan PWM and the user interface all live outside this
//! crate. They only need to implement these traits.

/// Raw oversampling ADC channel.
pub trait AdcSource {
    /// Whether a new raw sample arrived since the last call. Edge triggered.
    fn ready(&mut self) -> bool;
    /// Latest raw code.
    fn code(&mut self) -> u16;
}

/// Raw DAC channel. Writes take effect immediately.
pub trait DacSink {
    fn write(&mut self, code: u16);
}

/// Result of one thermometer conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TempReading {
    /// Temperature in 0.1 °C.
    Valid(i16),
    /// The sensor did not answer or returned garbage.
    Failed,
}

impl TempReading {
    pub fn value(self) -> Option<i16> {
        match self {
            TempReading::Valid(t) => Some(t),
            TempReading::Failed => None,
        }
    }
}

/// Heatsink thermometer.
pub trait Thermometer {
    /// Returns a reading once per finished conversion, `None` otherwise.
    fn poll(&mut self) -> Option<TempReading>;
}

/// Fan PWM output.
pub trait FanDriver {
    /// Speed in percent, `0..=100`.
    fn set_speed(&mut self, percent: u8);
}

/// Supply health inputs.
pub trait PowerMonitor {
    /// Supply voltage detector reports a brownout.
    fn brownout(&mut self) -> bool;
    /// Power-good pulse input level.
    fn power_good(&mut self) -> bool;
}

/// Everything else on the board the core talks to.
pub trait Board: Thermometer + FanDriver + PowerMonitor {
    /// Regulation comparator, high while the current loop is in control.
    fn cc_signal(&mut self) -> bool;
    /// Drive the output enable line.
    fn set_output_enable(&mut self, on: bool);
    /// Busy wait.
    fn delay_ms(&mut self, ms: u32);
    /// Unconditional hardware reset. Implementations on real hardware do not return.
    fn system_reset(&mut self);
}

/// Audible cues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Tone {
    /// Protection trip or over-temperature warning.
    AlarmBell,
    /// Entered constant-current mode.
    Alarm,
    /// Entered constant-voltage mode.
    Alert,
    /// Auto-off timer ran out.
    Beep,
    /// Request refused.
    Error,
}

/// Front panel indicators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Indicator {
    Output,
    ConstantVoltage,
    ConstantCurrent,
}

/// Discrete events for the display and sound layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Notification {
    Tone(Tone),
    Indicator(Indicator, bool),
    SoundOff,
    DisplayOff,
}

/// Fire-and-forget sink for [`Notification`]s.
pub trait Notifier {
    fn notify(&mut self, event: Notification);
}
