//! The analog controller: one owner for every channel and control loop, run once per tick.

use modular_bitfield::prelude::*;
use strum::IntoEnumIterator;
use thiserror::Error as ThisError;

use crate::{
    calibration::{CalChannel, CalibrationData, DAC_CAL_CODE, RefPoint},
    error::{CalibrationError, Error, Result},
    interface::{AdcSource, Board, DacSink, Indicator, Notification, Notifier, TempReading, Tone},
    measure::{MeasurementChannel, MeterConfig},
    output::OutputChannel,
    params::{self, ParamId, ParamStore, TopLimits},
    protection::{
        FastReadings, Limit, OTP_MARGIN, ProtectionConfig, ProtectionEngine, ProtectionStatus, power,
    },
    regulation::{CVCC_DEBOUNCE, RegulationClassifier, RegulationState},
    scaling::{CODE_MAX, CalibrationPair, Scaler},
    supervisor::{PVG_LIMIT, SupplyFault, Supervisor},
    thermal::{FanConfig, FanController, FanState},
    timer::{SoftTimer, TICK_RATE_HZ, TickDuration, Ticks, ticks},
    types::MeterMode,
};

/// Voltage programmed while the output is off, 0.01 V.
pub const ZERO_VOLTAGE: u16 = 0;
/// Current programmed while the output is off, 0.001 A.
pub const ZERO_CURRENT: u16 = 1;
/// Current below which the output counts as unloaded, 0.001 A.
pub const DP_VALUE: u16 = 5;

/// The raw converters of the two analog channels.
pub struct Drivers<A, D> {
    pub adc_v: A,
    pub adc_i: A,
    pub dac_v: D,
    pub dac_i: D,
}

/// Timing and fan tuning. Use [`AnalogConfigBuilder`] to create one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalogConfig {
    pub meter: MeterConfig,
    /// Speeds and run time. Thresholds come from the parameters.
    pub fan: FanConfig,
    pub cvcc_debounce: TickDuration,
    /// Ticks the power-good input may stay low.
    pub pvg_limit: u16,
    /// Wait between shutting down and resetting on a supply fault.
    pub settle_delay: TickDuration,
    /// How long the output indicator goes dark each second of the auto-off countdown.
    pub blink_time: TickDuration,
    /// Over-temperature warning margin, 0.1 °C.
    pub otp_margin: i16,
}

impl Default for AnalogConfig {
    fn default() -> Self {
        Self {
            meter: MeterConfig::default(),
            fan: FanConfig::default(),
            cvcc_debounce: TickDuration::millis(CVCC_DEBOUNCE),
            pvg_limit: PVG_LIMIT,
            settle_delay: TickDuration::millis(1_000),
            blink_time: TickDuration::millis(200),
            otp_margin: OTP_MARGIN,
        }
    }
}

#[derive(ThisError, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AnalogConfigError {
    #[error("Fan speeds must satisfy min <= startup <= max <= 100")]
    FanSpeeds,
    #[error("Meter update period shorter than the sample period")]
    UpdatePeriod,
    #[error("Blink time must be shorter than one second")]
    BlinkTime,
}

/// Use this type to create an [`AnalogConfig`].
#[derive(Default)]
pub struct AnalogConfigBuilder {
    config: AnalogConfig,
}

impl AnalogConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let's build it!
    pub fn build(self) -> core::result::Result<AnalogConfig, AnalogConfigError> {
        let c = self.config;
        let fan = c.fan;
        if !(fan.min_speed <= fan.startup_speed
            && fan.startup_speed <= fan.max_speed
            && fan.max_speed <= 100)
        {
            return Err(AnalogConfigError::FanSpeeds);
        }
        if c.meter.update_period.to_micros() < c.meter.sample_period.to_micros() {
            return Err(AnalogConfigError::UpdatePeriod);
        }
        if ticks(c.blink_time) >= TICK_RATE_HZ {
            return Err(AnalogConfigError::BlinkTime);
        }
        Ok(c)
    }

    /// Set all meter timing at once.
    pub fn with_meter(mut self, meter: MeterConfig) -> Self {
        self.config.meter = meter;
        self
    }

    /// Set how often filtered readings update.
    pub fn with_update_period(mut self, period: TickDuration) -> Self {
        self.config.meter.update_period = period;
        self
    }

    /// Set how long peaks are held in the peak meter modes.
    pub fn with_hold_time(mut self, hold: TickDuration) -> Self {
        self.config.meter.hold_time = hold;
        self
    }

    pub fn with_fan(mut self, fan: FanConfig) -> Self {
        self.config.fan = fan;
        self
    }

    pub fn with_cvcc_debounce(mut self, debounce: TickDuration) -> Self {
        self.config.cvcc_debounce = debounce;
        self
    }

    pub fn with_pvg_limit(mut self, limit: u16) -> Self {
        self.config.pvg_limit = limit;
        self
    }

    pub fn with_settle_delay(mut self, delay: TickDuration) -> Self {
        self.config.settle_delay = delay;
        self
    }

    pub fn with_blink_time(mut self, blink: TickDuration) -> Self {
        self.config.blink_time = blink;
        self
    }

    pub fn with_otp_margin(mut self, margin: i16) -> Self {
        self.config.otp_margin = margin;
        self
    }
}

/// Status word for the host.
#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub ovp: bool,
    pub ocp: bool,
    pub opp: bool,
    pub otp: bool,
    pub cv: bool,
    pub cc: bool,
    pub output: bool,
    pub fan: bool,
}

/// Result of one control tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[must_use]
pub enum TickOutcome {
    Continue,
    /// The supervisor shut the board down and requested a reset.
    Reset(SupplyFault),
}

#[derive(Debug, Default, Clone, Copy)]
struct Leds {
    output: bool,
    cv: bool,
    cc: bool,
}

/// DAC codes changed during calibration whose meter code still has to be captured.
#[derive(Debug, Default, Clone, Copy)]
struct PendingCapture {
    voltage: bool,
    current: bool,
}

/// The analog core of the supply.
///
/// Owns both measurement and output channels, the protection engine, the regulation classifier,
/// the fan controller and the supervisor. [`Self::execute`] runs them once per millisecond tick.
pub struct AnalogController<A, D, B, S, N>
where
    A: AdcSource,
    D: DacSink,
    B: Board,
    S: ParamStore,
    N: Notifier,
{
    meter_v: MeasurementChannel<A>,
    meter_i: MeasurementChannel<A>,
    dac_v: OutputChannel<D>,
    dac_i: OutputChannel<D>,
    board: B,
    store: S,
    notifier: N,
    protection: ProtectionEngine,
    protection_config: ProtectionConfig,
    regulation: RegulationClassifier,
    fan: FanController,
    supervisor: Supervisor,
    calibration: CalibrationData,
    pending_capture: PendingCapture,
    top: TopLimits,
    voltage: u16,
    current: u16,
    down_programmer: bool,
    /// Configured auto-off time, s.
    off_time: u16,
    /// Seconds left before auto-off.
    off_left: u16,
    sec_ref: Ticks,
    blink_timer: SoftTimer,
    blink_time: Ticks,
    now: Ticks,
    out: bool,
    temperature: TempReading,
    temp_update: bool,
    dp_code: u16,
    leds: Leds,
}

impl<A, D, B, S, N> AnalogController<A, D, B, S, N>
where
    A: AdcSource,
    D: DacSink,
    B: Board,
    S: ParamStore,
    N: Notifier,
{
    /// Create the controller with the output off and load every parameter from the store.
    pub fn new(
        drivers: Drivers<A, D>,
        board: B,
        store: S,
        notifier: N,
        config: AnalogConfig,
    ) -> Result<Self, S::Error> {
        let now = 0;
        let mut controller = Self {
            meter_v: MeasurementChannel::new(drivers.adc_v, config.meter),
            meter_i: MeasurementChannel::new(drivers.adc_i, config.meter),
            dac_v: OutputChannel::new(drivers.dac_v, ZERO_VOLTAGE),
            dac_i: OutputChannel::new(drivers.dac_i, ZERO_CURRENT),
            board,
            store,
            notifier,
            protection: ProtectionEngine::new(now),
            protection_config: ProtectionConfig {
                otp_margin: config.otp_margin,
                ..ProtectionConfig::default()
            },
            regulation: RegulationClassifier::new(now, ticks(config.cvcc_debounce)),
            fan: FanController::new(config.fan),
            supervisor: Supervisor::new(config.pvg_limit, config.settle_delay),
            calibration: CalibrationData::nominal(),
            pending_capture: PendingCapture::default(),
            top: TopLimits::default(),
            voltage: 0,
            current: 0,
            down_programmer: false,
            off_time: 0,
            off_left: 0,
            sec_ref: now,
            blink_timer: SoftTimer::new(0, now),
            blink_time: ticks(config.blink_time),
            now,
            out: false,
            temperature: TempReading::Failed,
            temp_update: false,
            dp_code: 0,
            leds: Leds::default(),
        };
        controller.load()?;
        controller.apply_output(false);
        Ok(controller)
    }

    fn load(&mut self) -> Result<(), S::Error> {
        for id in ParamId::iter().filter(|id| id.is_top()) {
            let value = params::load(&mut self.store, id, id.base_limits()).map_err(Error::Store)?;
            self.set_top(id, value);
        }
        for id in ParamId::iter().filter(|id| !id.is_top() && !id.is_calibration()) {
            let value =
                params::load(&mut self.store, id, id.limits(&self.top)).map_err(Error::Store)?;
            self.apply_param(id, value)?;
        }
        self.load_calibration()
    }

    /// Run one control tick.
    pub fn execute(&mut self) -> TickOutcome {
        self.now = self.now.wrapping_add(1);
        let now = self.now;

        if let Some(fault) = self.supervisor.execute(&mut self.board, &mut self.notifier) {
            return TickOutcome::Reset(fault);
        }

        let reading = self.board.poll();
        let v_update = self.meter_v.execute();
        let i_update = self.meter_i.execute();

        if self.out {
            let readings = FastReadings {
                voltage: v_update.then_some(self.meter_v.fast_value()),
                current: i_update.then_some(self.meter_i.fast_value()),
                last_voltage: self.meter_v.fast_value(),
            };
            if self
                .protection
                .check_electrical(now, readings, &self.protection_config)
                .is_some()
            {
                self.apply_output(false);
                self.notifier.notify(Notification::Tone(Tone::AlarmBell));
            }
        }

        self.thermal_control(reading);
        self.regulation_control(now);
        self.off_timer(now);
        TickOutcome::Continue
    }

    fn thermal_control(&mut self, reading: Option<TempReading>) {
        let Some(reading) = reading else {
            self.temp_update = false;
            return;
        };
        self.temperature = reading;
        self.temp_update = true;

        let verdict = self
            .protection
            .check_thermal(reading, self.out, &self.protection_config);
        if verdict.warn {
            self.notifier.notify(Notification::Tone(Tone::AlarmBell));
        }
        if verdict.trip && self.out {
            self.apply_output(false);
        }
        let speed = self.fan.control_with_config(reading, verdict.force_full_fan);
        self.board.set_speed(speed);
    }

    fn regulation_control(&mut self, now: Ticks) {
        let cc_signal = self.out && self.board.cc_signal();
        let change = self.regulation.update(now, self.out, cc_signal);
        if change.entered_cc {
            self.notifier.notify(Notification::Tone(Tone::Alarm));
        }
        if change.entered_cv {
            self.notifier.notify(Notification::Tone(Tone::Alert));
        }
        self.update_regulation_leds();
    }

    fn off_timer(&mut self, now: Ticks) {
        if self.out && self.blink_timer.fired(now) {
            self.set_indicator(Indicator::Output, true);
        }
        if now.wrapping_sub(self.sec_ref) < TICK_RATE_HZ {
            return;
        }
        self.sec_ref = self.sec_ref.wrapping_add(TICK_RATE_HZ);
        if self.out && self.off_left > 0 {
            self.off_left -= 1;
            self.set_indicator(Indicator::Output, false);
            self.blink_timer.start_with(now, self.blink_time);
            if self.off_left == 0 {
                info!("Auto-off timer ran out");
                self.notifier.notify(Notification::Tone(Tone::Beep));
                self.apply_output(false);
            }
        }
    }

    fn set_indicator(&mut self, indicator: Indicator, on: bool) {
        let led = match indicator {
            Indicator::Output => &mut self.leds.output,
            Indicator::ConstantVoltage => &mut self.leds.cv,
            Indicator::ConstantCurrent => &mut self.leds.cc,
        };
        if *led != on {
            *led = on;
            self.notifier.notify(Notification::Indicator(indicator, on));
        }
    }

    fn update_regulation_leds(&mut self) {
        let state = self.regulation.state();
        self.set_indicator(Indicator::ConstantVoltage, state.is_cv());
        self.set_indicator(Indicator::ConstantCurrent, state.is_cc());
    }

    /// Switch the output. Switching on is refused while over-temperature is latched.
    pub fn output_control(&mut self, on: bool) -> Result<(), S::Error> {
        if on && self.protection.status().otp() {
            warn!("Output on refused, over-temperature latched");
            self.notifier.notify(Notification::Tone(Tone::Error));
            return Err(Error::Refused);
        }
        self.apply_output(on);
        Ok(())
    }

    fn apply_output(&mut self, on: bool) {
        self.dac_v.on_off(on);
        self.dac_i.on_off(on);
        self.board.set_output_enable(self.down_programmer || on);
        if on != self.out {
            info!("Output {}", if on { "on" } else { "off" });
        }
        self.out = on;
        if on {
            self.regulation.output_on();
            self.protection.arm(self.now, self.protection_config.trip_delay);
            self.sec_ref = self.now;
            self.off_left = self.off_time;
        } else {
            self.regulation.reset();
        }
        self.set_indicator(Indicator::Output, on);
        self.update_regulation_leds();
    }

    /// Clear latched over-voltage, over-current and over-power faults.
    pub fn clear_faults(&mut self) {
        self.protection.clear_faults();
    }

    /// Program the voltage setpoint, 0.01 V.
    pub fn set_voltage(&mut self, value: u16) -> Result<(), S::Error> {
        self.set_param(ParamId::Voltage, value)
    }

    /// Program the current setpoint, 0.001 A.
    pub fn set_current(&mut self, value: u16) -> Result<(), S::Error> {
        self.set_param(ParamId::Current, value)
    }

    /// Commit every parameter change to persistent storage.
    pub fn save(&mut self) -> Result<(), S::Error> {
        self.store.persist().map_err(Error::Store)
    }

    /// Validate, store and apply a parameter.
    ///
    /// Lowering a top limit pulls the parameters bounded by it down with it.
    pub fn set_param(&mut self, id: ParamId, value: u16) -> Result<(), S::Error> {
        let limits = id.limits(&self.top);
        if !limits.contains(value) {
            return Err(Error::OutOfRange {
                param: id,
                value,
                min: limits.min,
                max: limits.max,
            });
        }
        self.store.set(id, value).map_err(Error::Store)?;
        self.apply_param(id, value)
    }

    /// Current value of a parameter as applied.
    pub fn param(&self, id: ParamId) -> u16 {
        use ParamId as P;
        match id {
            P::MaxVoltage => self.top.max_voltage,
            P::MaxCurrent => self.top.max_current,
            P::MaxPower => self.top.max_power,
            P::Voltage => self.voltage,
            P::Current => self.current,
            P::OverVoltage => {
                let max = self.top.max_voltage;
                self.protection_config.over_voltage.to_threshold(max)
            }
            P::OverCurrent => {
                let max = self.top.max_current;
                self.protection_config.over_current.to_threshold(max)
            }
            P::OverPower => {
                let max = self.top.max_power;
                self.protection_config.over_power.to_threshold(max)
            }
            P::TripDelay => self.protection_config.trip_delay as u16,
            P::OverTemperature => self.protection_config.over_temperature as u16,
            P::FanLow => self.fan.config().low as u16,
            P::FanHigh => self.fan.config().high as u16,
            P::OffTime => self.off_time,
            P::VoltageMeterMode => self.meter_v.mode() as u16,
            P::CurrentMeterMode => self.meter_i.mode() as u16,
            P::DownProgrammer => self.down_programmer as u16,
            _ => self.calibration.get(id).unwrap_or_default(),
        }
    }

    fn set_top(&mut self, id: ParamId, value: u16) {
        match id {
            ParamId::MaxVoltage => self.top.max_voltage = value,
            ParamId::MaxCurrent => self.top.max_current = value,
            ParamId::MaxPower => self.top.max_power = value,
            _ => {}
        }
    }

    fn apply_param(&mut self, id: ParamId, value: u16) -> Result<(), S::Error> {
        use ParamId as P;
        match id {
            P::MaxVoltage | P::MaxCurrent | P::MaxPower => {
                self.set_top(id, value);
                self.retrim(id)?;
            }
            P::Voltage => {
                self.voltage = value;
                self.dac_v.set_value(value);
            }
            P::Current => {
                self.current = value;
                self.dac_i.set_value(value);
            }
            P::OverVoltage => {
                self.protection_config.over_voltage =
                    Limit::from_threshold(value, self.top.max_voltage);
            }
            P::OverCurrent => {
                self.protection_config.over_current =
                    Limit::from_threshold(value, self.top.max_current);
            }
            P::OverPower => {
                self.protection_config.over_power = Limit::from_threshold(value, self.top.max_power);
            }
            P::TripDelay => self.protection_config.trip_delay = value as Ticks,
            P::OverTemperature => self.protection_config.over_temperature = value as i16,
            P::FanLow => {
                let high = self.fan.config().high;
                self.fan.set_thresholds(value as i16, high);
            }
            P::FanHigh => {
                let low = self.fan.config().low;
                self.fan.set_thresholds(low, value as i16);
            }
            P::OffTime => {
                self.off_time = value;
                self.off_left = value;
            }
            P::VoltageMeterMode => self
                .meter_v
                .set_mode(MeterMode::try_from(value).unwrap_or_default()),
            P::CurrentMeterMode => self
                .meter_i
                .set_mode(MeterMode::try_from(value).unwrap_or_default()),
            P::DownProgrammer => {
                self.down_programmer = value != 0;
                self.board.set_output_enable(self.down_programmer || self.out);
            }
            _ => {
                self.calibration.set(id, value);
                self.calibrate_all();
            }
        }
        Ok(())
    }

    /// Re-validate everything bounded by a top limit.
    fn retrim(&mut self, top: ParamId) -> Result<(), S::Error> {
        for &dep in top.dependents() {
            if dep.is_calibration() {
                if self.trim_calibration() {
                    self.calibration.store(&mut self.store).map_err(Error::Store)?;
                }
                continue;
            }
            let value = dep.limits(&self.top).clamp(self.param(dep));
            self.store.set(dep, value).map_err(Error::Store)?;
            self.apply_param(dep, value)?;
        }
        Ok(())
    }

    /// Recompute all four scalers from the calibration data.
    ///
    /// A channel with unusable points keeps running on its nominal calibration.
    pub fn calibrate_all(&mut self) {
        for channel in CalChannel::iter() {
            if let Err(err) = self.calibrate(channel) {
                warn!("Calibration of {:?} rejected: {:?}, using nominal", channel, err);
                let nominal = CalibrationData::nominal().pair(channel);
                if let Err(err) = self.calibrate_with(channel, nominal) {
                    error!("Nominal calibration of {:?} rejected: {:?}", channel, err);
                }
            }
        }
    }

    /// Recompute one channel's scaler. The scaler is left as it was on error.
    pub fn calibrate(&mut self, channel: CalChannel) -> core::result::Result<(), CalibrationError> {
        let pair = self.calibration.pair(channel);
        self.calibrate_with(channel, pair)
    }

    fn calibrate_with(
        &mut self,
        channel: CalChannel,
        pair: CalibrationPair,
    ) -> core::result::Result<(), CalibrationError> {
        match channel {
            CalChannel::VoltageOut => self.dac_v.calibrate(pair)?,
            CalChannel::CurrentOut => self.dac_i.calibrate(pair)?,
            CalChannel::VoltageIn => self.meter_v.calibrate(pair)?,
            CalChannel::CurrentIn => {
                self.meter_i.calibrate(pair)?;
                self.update_dp_code();
            }
        }
        debug!("Calibrated {:?}", channel);
        Ok(())
    }

    fn update_dp_code(&mut self) {
        let scaler = self.meter_i.scaler();
        let dp = 2 * scaler.value_to_code(0) as i32 - scaler.value_to_code(DP_VALUE) as i32;
        self.dp_code = dp.clamp(0, u16::MAX as i32) as u16;
    }

    fn trim_calibration(&mut self) -> bool {
        let (dac_v, dac_i) = (*self.dac_v.scaler(), *self.dac_i.scaler());
        let trimmed = self.calibration.trim(&self.top, &dac_v, &dac_i);
        if trimmed {
            self.calibrate_all();
        }
        trimmed
    }

    /// Enter calibration: output off, reference points inside the top limits.
    pub fn begin_calibration(&mut self) {
        self.apply_output(false);
        self.trim_calibration();
        self.pending_capture = PendingCapture::default();
    }

    /// Set a reference value. Its DAC code follows from the present calibration.
    pub fn set_cal_reference(&mut self, point: RefPoint, value: u16) -> Result<(), S::Error> {
        let id = point.value_param();
        let limits = id.limits(&self.top);
        if !limits.contains(value) {
            return Err(Error::OutOfRange {
                param: id,
                value,
                min: limits.min,
                max: limits.max,
            });
        }
        let code = if point.is_voltage() {
            self.dac_v.scaler().value_to_code(value)
        } else {
            self.dac_i.scaler().value_to_code(value)
        };
        self.calibration.set(id, value);
        self.calibration.set(point.code_param(), code);
        Ok(())
    }

    /// Drive a raw DAC code for a reference point and switch the output on.
    ///
    /// The other DAC is parked at [`DAC_CAL_CODE`] so the channel under calibration is the one
    /// regulating.
    pub fn drive_cal_code(&mut self, point: RefPoint, code: u16) -> Result<(), S::Error> {
        let id = point.code_param();
        let limits = id.limits(&self.top);
        if !limits.contains(code) {
            return Err(Error::OutOfRange {
                param: id,
                value: code,
                min: limits.min,
                max: limits.max,
            });
        }
        self.calibration.set(id, code);
        self.protection.clear_faults();
        if point.is_voltage() {
            self.pending_capture.voltage = true;
            self.dac_v.set_code(code);
            self.dac_i.set_code(DAC_CAL_CODE);
        } else {
            self.pending_capture.current = true;
            self.dac_v.set_code(DAC_CAL_CODE);
            self.dac_i.set_code(code);
        }
        self.output_control(true)
    }

    /// Accept a reference point and capture the meter code for it.
    ///
    /// The output must be on and regulating the quantity being calibrated. Otherwise the point
    /// is restored from the store and the request refused.
    pub fn apply_cal_point(&mut self, point: RefPoint) -> Result<(), S::Error> {
        let state = self.regulation.state();
        let regulating = if point.is_voltage() {
            state.is_cv()
        } else {
            state.is_cc()
        };
        if !(self.out && regulating) {
            warn!("Calibration point {:?} refused in {:?}", point, state);
            self.restore_cal_point(point)?;
            self.notifier.notify(Notification::Tone(Tone::Error));
            return Err(Error::Refused);
        }
        if let Err(err) = self.calibrate(point.channel()) {
            self.restore_cal_point(point)?;
            self.notifier.notify(Notification::Tone(Tone::Error));
            return Err(err.into());
        }

        let (pending, code) = if point.is_voltage() {
            (
                core::mem::take(&mut self.pending_capture.voltage),
                self.meter_v.code(),
            )
        } else {
            (
                core::mem::take(&mut self.pending_capture.current),
                self.meter_i.code(),
            )
        };
        if pending {
            let id = point.meter_code_param();
            let previous = self.calibration.get(id).unwrap_or_default();
            self.calibration.set(id, code);
            if let Err(err) = self.calibrate(point.channel().meter()) {
                self.calibration.set(id, previous);
                return Err(err.into());
            }
            debug!("Captured meter code {} for {:?}", code, point);
        }
        Ok(())
    }

    fn restore_cal_point(&mut self, point: RefPoint) -> Result<(), S::Error> {
        for id in [point.value_param(), point.code_param()] {
            let value =
                params::load(&mut self.store, id, id.limits(&self.top)).map_err(Error::Store)?;
            self.calibration.set(id, value);
        }
        self.calibrate_all();
        Ok(())
    }

    /// Leave calibration: output off, setpoints programmed again under the current calibration.
    pub fn end_calibration(&mut self) {
        self.apply_output(false);
        self.pending_capture = PendingCapture::default();
        self.dac_v.set_value(self.voltage);
        self.dac_i.set_value(self.current);
    }

    /// Persist the calibration data and leave calibration.
    pub fn save_calibration(&mut self) -> Result<(), S::Error> {
        self.calibration.store(&mut self.store).map_err(Error::Store)?;
        self.store.persist().map_err(Error::Store)?;
        self.end_calibration();
        Ok(())
    }

    /// Back to factory calibration, persisted.
    pub fn restore_calibration_defaults(&mut self) -> Result<(), S::Error> {
        self.calibration = CalibrationData::nominal();
        self.calibrate_all();
        self.trim_calibration();
        self.save_calibration()
    }

    /// Discard unsaved calibration changes and leave calibration.
    pub fn reload_calibration(&mut self) -> Result<(), S::Error> {
        self.load_calibration()?;
        self.end_calibration();
        Ok(())
    }

    fn load_calibration(&mut self) -> Result<(), S::Error> {
        self.calibration =
            CalibrationData::load(&mut self.store, &self.top).map_err(Error::Store)?;
        self.calibrate_all();
        self.trim_calibration();
        Ok(())
    }

    /// Write raw DAC codes, bypassing calibration.
    pub fn set_dac_codes(&mut self, voltage_code: u16, current_code: u16) {
        self.dac_v.set_code(voltage_code.min(CODE_MAX));
        self.dac_i.set_code(current_code.min(CODE_MAX));
    }

    /// Latest decimated ADC codes, voltage then current.
    pub fn adc_codes(&self) -> (u16, u16) {
        (self.meter_v.code(), self.meter_i.code())
    }

    pub fn status(&self) -> Status {
        let protection = self.protection.status();
        let regulation = self.regulation.state();
        Status::new()
            .with_ovp(protection.ovp())
            .with_ocp(protection.ocp())
            .with_opp(protection.opp())
            .with_otp(protection.otp())
            .with_cv(regulation.is_cv())
            .with_cc(regulation.is_cc())
            .with_output(self.out)
            .with_fan(self.fan.state() == FanState::Running)
    }

    pub fn protection_status(&self) -> ProtectionStatus {
        self.protection.status()
    }

    pub fn regulation(&self) -> RegulationState {
        self.regulation.state()
    }

    pub fn is_output_on(&self) -> bool {
        self.out
    }

    /// Last thermometer reading.
    pub fn temperature(&self) -> TempReading {
        self.temperature
    }

    /// Whether a thermometer reading arrived on the last tick.
    pub fn temperature_updated(&self) -> bool {
        self.temp_update
    }

    pub fn fan_speed(&self) -> u8 {
        self.fan.speed()
    }

    pub fn fan_state(&self) -> FanState {
        self.fan.state()
    }

    /// Seconds left before auto-off.
    pub fn off_time_left(&self) -> u16 {
        self.off_left
    }

    /// Filtered output voltage, 0.01 V.
    pub fn measured_voltage(&self) -> u16 {
        self.meter_v.value()
    }

    /// Filtered output current, 0.001 A.
    pub fn measured_current(&self) -> u16 {
        self.meter_i.value()
    }

    /// Output power from the filtered readings, 0.1 W.
    pub fn measured_power(&self) -> u16 {
        power(self.meter_i.value(), self.meter_v.value())
    }

    /// Current meter code below which the output counts as unloaded.
    pub fn dp_code(&self) -> u16 {
        self.dp_code
    }

    /// Output is practically unloaded.
    pub fn is_unloaded(&self) -> bool {
        self.meter_i.fast_code() < self.dp_code
    }

    pub fn scaler(&self, channel: CalChannel) -> &Scaler {
        match channel {
            CalChannel::VoltageOut => self.dac_v.scaler(),
            CalChannel::CurrentOut => self.dac_i.scaler(),
            CalChannel::VoltageIn => self.meter_v.scaler(),
            CalChannel::CurrentIn => self.meter_i.scaler(),
        }
    }

    pub fn calibration(&self) -> &CalibrationData {
        &self.calibration
    }

    pub fn voltage_meter(&self) -> &MeasurementChannel<A> {
        &self.meter_v
    }

    pub fn voltage_meter_mut(&mut self) -> &mut MeasurementChannel<A> {
        &mut self.meter_v
    }

    pub fn current_meter(&self) -> &MeasurementChannel<A> {
        &self.meter_i
    }

    pub fn current_meter_mut(&mut self) -> &mut MeasurementChannel<A> {
        &mut self.meter_i
    }

    pub fn voltage_output(&self) -> &OutputChannel<D> {
        &self.dac_v
    }

    pub fn current_output(&self) -> &OutputChannel<D> {
        &self.dac_i
    }

    pub fn board(&self) -> &B {
        &self.board
    }

    pub fn board_mut(&mut self) -> &mut B {
        &mut self.board
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    pub fn notifier_mut(&mut self) -> &mut N {
        &mut self.notifier
    }

    /// Ticks since start.
    pub fn now(&self) -> Ticks {
        self.now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockAdc, MockBoard, MockDac, MockNotifier};
    use crate::params::MemoryStore;
    use crate::scaling::CalPoint;

    type TestController = AnalogController<MockAdc, MockDac, MockBoard, MemoryStore, MockNotifier>;

    fn drivers() -> Drivers<MockAdc, MockDac> {
        Drivers {
            adc_v: MockAdc::new(),
            adc_i: MockAdc::new(),
            dac_v: MockDac::new(),
            dac_i: MockDac::new(),
        }
    }

    fn with_store(store: MemoryStore) -> TestController {
        AnalogController::new(
            drivers(),
            MockBoard::new(),
            store,
            MockNotifier::new(),
            AnalogConfig::default(),
        )
        .unwrap()
    }

    fn controller() -> TestController {
        with_store(MemoryStore::new())
    }

    fn run(controller: &mut TestController, n: u32) {
        for _ in 0..n {
            assert_eq!(controller.execute(), TickOutcome::Continue);
        }
    }

    fn tone(tone: Tone) -> Notification {
        Notification::Tone(tone)
    }

    #[test]
    fn builder_validates() {
        assert!(AnalogConfigBuilder::new().build().is_ok());

        let fan = FanConfig {
            startup_speed: 10,
            ..FanConfig::default()
        };
        assert_eq!(
            AnalogConfigBuilder::new().with_fan(fan).build(),
            Err(AnalogConfigError::FanSpeeds)
        );
        assert_eq!(
            AnalogConfigBuilder::new()
                .with_blink_time(TickDuration::millis(1_000))
                .build(),
            Err(AnalogConfigError::BlinkTime)
        );
        let config = AnalogConfigBuilder::new()
            .with_update_period(TickDuration::millis(100))
            .with_pvg_limit(10)
            .build()
            .unwrap();
        assert_eq!(config.meter.decimation(), 100);
        assert_eq!(config.pvg_limit, 10);
    }

    #[test]
    fn starts_off_with_nominal_parameters() {
        let controller = controller();
        assert!(!controller.is_output_on());
        assert_eq!(controller.param(ParamId::Voltage), 500);
        assert_eq!(controller.param(ParamId::Current), 1000);
        assert_eq!(controller.param(ParamId::MaxVoltage), 3600);
        assert_eq!(controller.param(ParamId::OverVoltage), 3600);
        assert_eq!(controller.regulation(), RegulationState::Unregulated);
        assert!(!controller.board().output_enabled());

        // Off: both DACs hold their zero codes.
        let v = controller.voltage_output();
        assert_eq!(v.sink().last(), Some(v.zero_code()));
        let i = controller.current_output();
        assert_eq!(i.sink().last(), Some(i.zero_code()));
        assert_eq!(i.zero_code(), i.scaler().value_to_code(ZERO_CURRENT));
    }

    #[test]
    fn output_on_programs_setpoints() {
        let mut controller = controller();
        controller.output_control(true).unwrap();
        assert!(controller.board().output_enabled());
        assert_eq!(controller.regulation(), RegulationState::ConstantVoltage);

        // Setpoints loaded at startup are converted with the stored calibration.
        let nominal = Scaler::from_pair(CalibrationData::nominal().pair(CalChannel::VoltageOut));
        let code = nominal.unwrap().value_to_code(500);
        assert_ne!(code, 500);
        assert_eq!(controller.voltage_output().sink().last(), Some(code));
        let i = controller.current_output();
        assert_eq!(i.sink().last(), Some(i.scaler().value_to_code(1000)));

        let notifier = controller.notifier();
        assert_eq!(
            notifier.count(Notification::Indicator(Indicator::Output, true)),
            1
        );
        assert_eq!(
            notifier.count(Notification::Indicator(Indicator::ConstantVoltage, true)),
            1
        );

        controller.output_control(false).unwrap();
        assert_eq!(controller.regulation(), RegulationState::Unregulated);
        assert!(!controller.board().output_enabled());
    }

    #[test]
    fn over_voltage_scenario() {
        let mut controller = controller();
        controller.set_param(ParamId::OverVoltage, 2000).unwrap();
        controller.set_param(ParamId::TripDelay, 50).unwrap();

        let code = controller.voltage_meter().scaler().value_to_code(2500);
        controller.voltage_meter_mut().source_mut().set_level(Some(code));
        controller.output_control(true).unwrap();

        let mut tripped_at = None;
        for _ in 0..60 {
            run(&mut controller, 1);
            if tripped_at.is_none() && !controller.is_output_on() {
                tripped_at = Some(controller.now());
            }
        }
        assert_eq!(tripped_at, Some(50));
        assert!(controller.status().ovp());
        assert!(!controller.status().output());
        assert_eq!(controller.notifier().count(tone(Tone::AlarmBell)), 1);

        controller.clear_faults();
        assert!(controller.protection_status().is_clear());
    }

    #[test]
    fn disabled_protection_never_trips() {
        let mut controller = controller();
        // Thresholds at their maximum mean disabled.
        controller.set_param(ParamId::OverVoltage, 3600).unwrap();
        controller.voltage_meter_mut().source_mut().set_level(Some(CODE_MAX));
        controller.current_meter_mut().source_mut().set_level(Some(CODE_MAX));
        controller.output_control(true).unwrap();

        run(&mut controller, 2000);
        assert!(controller.is_output_on());
        assert!(controller.protection_status().is_clear());
    }

    #[test]
    fn over_current_trip() {
        let mut controller = controller();
        controller.set_param(ParamId::OverCurrent, 1500).unwrap();
        let code = controller.current_meter().scaler().value_to_code(1800);
        controller.current_meter_mut().source_mut().set_level(Some(code));
        controller.output_control(true).unwrap();

        run(&mut controller, 1);
        assert!(!controller.is_output_on());
        assert!(controller.status().ocp());
    }

    #[test]
    fn over_temperature_trips_and_locks_output() {
        let mut controller = controller();
        controller.output_control(true).unwrap();

        controller
            .board_mut()
            .push_temperature(TempReading::Valid(650));
        run(&mut controller, 1);
        assert!(controller.temperature_updated());
        assert!(!controller.is_output_on());
        assert!(controller.status().otp());
        assert_eq!(controller.notifier().count(tone(Tone::AlarmBell)), 1);

        run(&mut controller, 1);
        assert!(!controller.temperature_updated());

        assert!(matches!(
            controller.output_control(true),
            Err(Error::Refused)
        ));
        assert_eq!(controller.notifier().count(tone(Tone::Error)), 1);

        // Explicit clearing does not release the lock.
        controller.clear_faults();
        assert!(controller.output_control(true).is_err());

        controller
            .board_mut()
            .push_temperature(TempReading::Valid(500));
        run(&mut controller, 1);
        assert!(!controller.status().otp());
        assert!(controller.output_control(true).is_ok());
    }

    #[test]
    fn thermometer_failure_runs_fan_flat_out() {
        let mut controller = controller();
        controller.board_mut().push_temperature(TempReading::Failed);
        run(&mut controller, 1);
        // The first update starts the fan with its kick.
        assert_eq!(controller.board().fan_speed(), Some(30));
        assert_eq!(controller.fan_state(), FanState::Running);

        controller.board_mut().push_temperature(TempReading::Failed);
        run(&mut controller, 1);
        assert_eq!(controller.board().fan_speed(), Some(100));
        assert_eq!(controller.temperature(), TempReading::Failed);
        assert!(controller.status().fan());
    }

    #[test]
    fn fan_ramp_scenario() {
        let mut controller = controller();
        let mut last = 0;
        for t in (400..=600).step_by(10) {
            controller
                .board_mut()
                .push_temperature(TempReading::Valid(t));
            run(&mut controller, 1);
            let speed = controller.fan_speed();
            if t <= 450 {
                assert_eq!(speed, 0);
            } else if t < 550 {
                assert!(speed > last, "{t}: {speed} after {last}");
            } else {
                assert_eq!(speed, 100);
            }
            last = speed;
        }
    }

    #[test]
    fn regulation_tones_and_indicators() {
        let mut controller = controller();
        controller.output_control(true).unwrap();
        run(&mut controller, 5);
        assert_eq!(controller.notifier().count(tone(Tone::Alert)), 0);

        controller.board_mut().set_cc(true);
        run(&mut controller, 1);
        assert_eq!(controller.notifier().count(tone(Tone::Alarm)), 1);
        assert_eq!(
            controller
                .notifier()
                .count(Notification::Indicator(Indicator::ConstantCurrent, true)),
            1
        );

        run(&mut controller, CVCC_DEBOUNCE);
        assert_eq!(controller.regulation(), RegulationState::ConstantCurrent);
        assert!(controller.status().cc() && !controller.status().cv());

        controller.board_mut().set_cc(false);
        run(&mut controller, 1);
        assert_eq!(controller.notifier().count(tone(Tone::Alert)), 1);
        assert_eq!(controller.regulation(), RegulationState::Both);
    }

    #[test]
    fn auto_off_countdown() {
        let mut controller = controller();
        controller.set_param(ParamId::OffTime, 2).unwrap();
        controller.output_control(true).unwrap();

        run(&mut controller, 1000);
        assert_eq!(controller.off_time_left(), 1);
        let blink_off = Notification::Indicator(Indicator::Output, false);
        assert_eq!(controller.notifier().count(blink_off), 1);

        run(&mut controller, 200);
        assert_eq!(
            controller
                .notifier()
                .count(Notification::Indicator(Indicator::Output, true)),
            2
        );

        run(&mut controller, 799);
        assert!(controller.is_output_on());
        run(&mut controller, 1);
        assert!(!controller.is_output_on());
        assert_eq!(controller.notifier().count(tone(Tone::Beep)), 1);

        // Next time on, the countdown starts over.
        controller.output_control(true).unwrap();
        assert_eq!(controller.off_time_left(), 2);
    }

    #[test]
    fn down_programmer_keeps_enable_line() {
        let mut controller = controller();
        controller.set_param(ParamId::DownProgrammer, 1).unwrap();
        assert!(controller.board().output_enabled());

        controller.output_control(true).unwrap();
        controller.output_control(false).unwrap();
        assert!(controller.board().output_enabled());

        controller.set_param(ParamId::DownProgrammer, 0).unwrap();
        assert!(!controller.board().output_enabled());
    }

    #[test]
    fn supervisor_preempts_the_tick() {
        let mut controller = controller();
        controller.output_control(true).unwrap();
        controller.board_mut().set_brownout(true);

        assert_eq!(
            controller.execute(),
            TickOutcome::Reset(SupplyFault::Brownout)
        );
        assert!(!controller.board().output_enabled());
        assert_eq!(controller.board().resets(), 1);
        assert_eq!(controller.notifier().count(Notification::DisplayOff), 1);
    }

    #[test]
    fn setpoints_are_validated() {
        let mut controller = controller();
        assert!(matches!(
            controller.set_voltage(3601),
            Err(Error::OutOfRange {
                param: ParamId::Voltage,
                max: 3600,
                ..
            })
        ));
        controller.set_voltage(1200).unwrap();
        controller.set_current(250).unwrap();
        assert_eq!(controller.param(ParamId::Voltage), 1200);
        assert_eq!(controller.store().persisted(ParamId::Voltage), None);

        controller.save().unwrap();
        assert_eq!(controller.store().persisted(ParamId::Voltage), Some(1200));
        assert_eq!(controller.store().persisted(ParamId::Current), Some(250));
    }

    #[test]
    fn lowering_top_limit_trims_dependents() {
        let mut controller = controller();
        controller.set_voltage(3000).unwrap();
        controller.set_param(ParamId::OverVoltage, 3200).unwrap();

        controller.set_param(ParamId::MaxVoltage, 2000).unwrap();
        assert_eq!(controller.param(ParamId::Voltage), 2000);
        // Clamped to the new maximum, which disables it.
        assert_eq!(controller.param(ParamId::OverVoltage), 2000);
        assert_eq!(controller.param(ParamId::CalV2Value), 2000);
        // The new code comes from the calibration in force before the trim.
        let before = Scaler::from_pair(CalibrationData::nominal().pair(CalChannel::VoltageOut));
        assert_eq!(
            controller.param(ParamId::CalV2Code),
            before.unwrap().value_to_code(2000)
        );
    }

    #[test]
    fn stored_values_are_loaded_and_clamped() {
        let mut store = MemoryStore::new();
        store.set(ParamId::Voltage, 1234).unwrap();
        store.set(ParamId::TripDelay, 5000).unwrap();
        store.set(ParamId::VoltageMeterMode, 1).unwrap();
        let controller = with_store(store);

        assert_eq!(controller.param(ParamId::Voltage), 1234);
        assert_eq!(controller.param(ParamId::TripDelay), 999);
        assert_eq!(controller.voltage_meter().mode(), MeterMode::PeakHigh);
    }

    #[test]
    fn degenerate_stored_calibration_falls_back() {
        let mut store = MemoryStore::new();
        store.set(ParamId::CalV1Code, 5000).unwrap();
        store.set(ParamId::CalV2Code, 5000).unwrap();
        let controller = with_store(store);

        let nominal = Scaler::from_pair(CalibrationPair::new(
            CalPoint::new(100, 3764),
            CalPoint::new(3500, 60019),
        ))
        .unwrap();
        assert_eq!(*controller.scaler(CalChannel::VoltageOut), nominal);
        // Meter points are fine and used as stored.
        assert_eq!(*controller.scaler(CalChannel::VoltageIn), nominal);
    }

    #[test]
    fn dp_code_from_current_meter() {
        let controller = controller();
        let scaler = controller.scaler(CalChannel::CurrentIn);
        let expected = 2 * scaler.value_to_code(0) as i32 - scaler.value_to_code(DP_VALUE) as i32;
        assert_eq!(controller.dp_code() as i32, expected.max(0));
        // No samples yet, fast code 0.
        assert!(controller.is_unloaded());
    }

    #[test]
    fn calibration_run() {
        let mut controller = controller();
        controller.begin_calibration();

        controller
            .set_cal_reference(RefPoint::Voltage1, 200)
            .unwrap();
        let expected = controller
            .scaler(CalChannel::VoltageOut)
            .value_to_code(200);
        assert_eq!(controller.param(ParamId::CalV1Code), expected);

        controller.drive_cal_code(RefPoint::Voltage1, 7000).unwrap();
        assert!(controller.is_output_on());
        assert_eq!(controller.voltage_output().sink().last(), Some(7000));
        assert_eq!(
            controller.current_output().sink().last(),
            Some(DAC_CAL_CODE)
        );

        controller
            .voltage_meter_mut()
            .source_mut()
            .set_level(Some(7100));
        run(&mut controller, 320);
        assert_eq!(controller.adc_codes().0, 7100);

        controller.apply_cal_point(RefPoint::Voltage1).unwrap();
        assert_eq!(controller.param(ParamId::CalVm1Code), 7100);
        assert_eq!(
            controller.voltage_meter().scaler().code_to_value(7100),
            200
        );
        assert_eq!(controller.voltage_output().scaler().value_to_code(200), 7000);

        controller.save_calibration().unwrap();
        assert_eq!(controller.store().persisted(ParamId::CalV1Code), Some(7000));
        assert_eq!(controller.store().persisted(ParamId::CalVm1Code), Some(7100));

        // Saving ends the run: output off, setpoints back under the new calibration.
        assert!(!controller.is_output_on());
        let v = controller.voltage_output();
        assert_eq!(v.code(), v.scaler().value_to_code(500));
        let i = controller.current_output();
        assert_eq!(i.code(), i.scaler().value_to_code(1000));
    }

    #[test]
    fn setpoints_follow_recalibration() {
        let mut controller = controller();
        controller.set_voltage(1200).unwrap();
        controller.output_control(true).unwrap();
        let before = controller.voltage_output().code();

        controller.set_param(ParamId::CalV1Code, 4000).unwrap();
        let v = controller.voltage_output();
        let code = v.scaler().value_to_code(1200);
        assert_ne!(code, before);
        assert_eq!(v.code(), code);
        assert_eq!(v.sink().last(), Some(code));
    }

    #[test]
    fn leaving_calibration_restores_setpoints() {
        let mut controller = controller();
        controller.set_voltage(500).unwrap();
        controller.begin_calibration();
        controller.drive_cal_code(RefPoint::Voltage2, 60019).unwrap();
        assert_eq!(controller.voltage_output().sink().last(), Some(60019));
        controller.output_control(false).unwrap();

        controller.reload_calibration().unwrap();
        controller.output_control(true).unwrap();
        let v = controller.voltage_output();
        assert_eq!(v.sink().last(), Some(v.scaler().value_to_code(500)));
        let i = controller.current_output();
        assert_eq!(i.sink().last(), Some(i.scaler().value_to_code(1000)));
    }

    #[test]
    fn end_calibration_switches_off() {
        let mut controller = controller();
        controller.begin_calibration();
        controller.drive_cal_code(RefPoint::Current1, 5000).unwrap();
        assert_eq!(controller.voltage_output().code(), DAC_CAL_CODE);

        controller.end_calibration();
        assert!(!controller.is_output_on());
        let v = controller.voltage_output();
        assert_eq!(v.value(), Some(500));
        assert_eq!(v.sink().last(), Some(v.zero_code()));
        assert_eq!(controller.current_output().value(), Some(1000));
    }

    #[test]
    fn calibration_point_refused_in_wrong_mode() {
        let mut controller = controller();
        controller.begin_calibration();
        controller.drive_cal_code(RefPoint::Current1, 5000).unwrap();
        run(&mut controller, 5);

        // Voltage loop regulating, the current point can't be taken.
        assert!(matches!(
            controller.apply_cal_point(RefPoint::Current1),
            Err(Error::Refused)
        ));
        assert_eq!(controller.param(ParamId::CalI1Code), 3599);
        assert_eq!(controller.notifier().count(tone(Tone::Error)), 1);
    }

    #[test]
    fn calibration_defaults_and_reload() {
        let mut controller = controller();
        controller.set_param(ParamId::CalV1Code, 4000).unwrap();
        assert_ne!(
            controller.param(ParamId::CalV1Code),
            ParamId::CalV1Code.base_limits().nominal
        );

        controller.reload_calibration().unwrap();
        // The working copy holds the change until it is reverted.
        assert_eq!(controller.param(ParamId::CalV1Code), 4000);

        controller.restore_calibration_defaults().unwrap();
        assert_eq!(controller.calibration(), &CalibrationData::nominal());
        assert_eq!(controller.store().persisted(ParamId::CalV1Code), Some(3764));
    }

    #[test]
    fn raw_dac_codes_are_clamped() {
        let mut controller = controller();
        controller.output_control(true).unwrap();
        controller.set_dac_codes(u16::MAX, 100);
        assert_eq!(controller.voltage_output().sink().last(), Some(CODE_MAX));
        assert_eq!(controller.current_output().sink().last(), Some(100));
    }
}
