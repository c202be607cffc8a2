//! We use this mocking module in unit tests to emulate the hardware around the analog core.

use crate::interface::{
    AdcSource, Board, DacSink, FanDriver, Notification, Notifier, PowerMonitor, TempReading,
    Thermometer,
};

/// ADC channel delivering a constant code on every poll while a level is set.
#[derive(Default)]
pub struct MockAdc {
    level: Option<u16>,
}

impl MockAdc {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` stops the sample stream.
    pub fn set_level(&mut self, level: Option<u16>) {
        self.level = level;
    }
}

impl AdcSource for MockAdc {
    fn ready(&mut self) -> bool {
        self.level.is_some()
    }

    fn code(&mut self) -> u16 {
        self.level.unwrap_or_default()
    }
}

/// DAC channel recording the codes written to it.
#[derive(Default)]
pub struct MockDac {
    writes: heapless::Vec<u16, 32>,
}

impl MockDac {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> Option<u16> {
        self.writes.last().copied()
    }

    /// Most recent writes, oldest first.
    pub fn writes(&self) -> &[u16] {
        &self.writes
    }
}

impl DacSink for MockDac {
    fn write(&mut self, code: u16) {
        if self.writes.is_full() {
            self.writes.remove(0);
        }
        // Room was made above.
        let _ = self.writes.push(code);
    }
}

/// The rest of the board.
pub struct MockBoard {
    /// Reading handed out on the next thermometer poll.
    pending_temp: Option<TempReading>,
    fan_speed: Option<u8>,
    brownout: bool,
    power_good: bool,
    cc: bool,
    output_enabled: bool,
    delayed_ms: u32,
    resets: u32,
}

impl MockBoard {
    pub fn new() -> Self {
        Self {
            pending_temp: None,
            fan_speed: None,
            brownout: false,
            power_good: true,
            cc: false,
            output_enabled: false,
            delayed_ms: 0,
            resets: 0,
        }
    }

    /// Queue a thermometer reading for the next poll.
    pub fn push_temperature(&mut self, reading: TempReading) {
        self.pending_temp = Some(reading);
    }

    pub fn set_brownout(&mut self, brownout: bool) {
        self.brownout = brownout;
    }

    pub fn set_power_good(&mut self, good: bool) {
        self.power_good = good;
    }

    pub fn set_cc(&mut self, cc: bool) {
        self.cc = cc;
    }

    pub fn fan_speed(&self) -> Option<u8> {
        self.fan_speed
    }

    pub fn output_enabled(&self) -> bool {
        self.output_enabled
    }

    pub fn delayed_ms(&self) -> u32 {
        self.delayed_ms
    }

    pub fn resets(&self) -> u32 {
        self.resets
    }
}

impl Thermometer for MockBoard {
    fn poll(&mut self) -> Option<TempReading> {
        self.pending_temp.take()
    }
}

impl FanDriver for MockBoard {
    fn set_speed(&mut self, percent: u8) {
        self.fan_speed = Some(percent);
    }
}

impl PowerMonitor for MockBoard {
    fn brownout(&mut self) -> bool {
        self.brownout
    }

    fn power_good(&mut self) -> bool {
        self.power_good
    }
}

impl Board for MockBoard {
    fn cc_signal(&mut self) -> bool {
        self.cc
    }

    fn set_output_enable(&mut self, on: bool) {
        self.output_enabled = on;
    }

    fn delay_ms(&mut self, ms: u32) {
        self.delayed_ms += ms;
    }

    fn system_reset(&mut self) {
        self.resets += 1;
    }
}

/// Notification sink keeping the most recent events.
#[derive(Default)]
pub struct MockNotifier {
    events: heapless::Vec<Notification, 64>,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[Notification] {
        &self.events
    }

    pub fn count(&self, event: Notification) -> usize {
        self.events.iter().filter(|&&e| e == event).count()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

impl Notifier for MockNotifier {
    fn notify(&mut self, event: Notification) {
        if self.events.is_full() {
            self.events.remove(0);
        }
        let _ = self.events.push(event);
    }
}
