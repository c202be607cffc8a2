//! Constant-voltage / constant-current classification from the regulation comparator.

use crate::timer::{SoftTimer, Ticks};

/// How long a regulation mode stays reported after the comparator last showed it, ticks.
pub const CVCC_DEBOUNCE: Ticks = 120;

/// Reported regulation mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RegulationState {
    /// Output off.
    #[default]
    Unregulated,
    ConstantVoltage,
    ConstantCurrent,
    /// Both modes seen inside the debounce window.
    Both,
}

impl RegulationState {
    fn from_flags(cv: bool, cc: bool) -> Self {
        match (cv, cc) {
            (false, false) => RegulationState::Unregulated,
            (true, false) => RegulationState::ConstantVoltage,
            (false, true) => RegulationState::ConstantCurrent,
            (true, true) => RegulationState::Both,
        }
    }

    pub fn is_cv(self) -> bool {
        matches!(self, RegulationState::ConstantVoltage | RegulationState::Both)
    }

    pub fn is_cc(self) -> bool {
        matches!(self, RegulationState::ConstantCurrent | RegulationState::Both)
    }
}

/// Modes entered on this tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegulationChange {
    pub entered_cv: bool,
    pub entered_cc: bool,
}

pub struct RegulationClassifier {
    state: RegulationState,
    cv_timer: SoftTimer,
    cc_timer: SoftTimer,
}

impl RegulationClassifier {
    pub fn new(now: Ticks, debounce: Ticks) -> Self {
        let mut cv_timer = SoftTimer::new(debounce, now);
        let mut cc_timer = SoftTimer::new(debounce, now);
        cv_timer.force(now);
        cc_timer.force(now);
        Self {
            state: RegulationState::Unregulated,
            cv_timer,
            cc_timer,
        }
    }

    /// Classify one tick.
    ///
    /// `cc_signal` is the comparator level. The mode it shows is refreshed every tick so a mode
    /// stays reported for the debounce window after it was last seen.
    pub fn update(&mut self, now: Ticks, output_on: bool, cc_signal: bool) -> RegulationChange {
        if !output_on {
            self.state = RegulationState::Unregulated;
            return RegulationChange::default();
        }

        if cc_signal {
            self.cc_timer.start(now);
        } else {
            self.cv_timer.start(now);
        }
        let cc = cc_signal || !self.cc_timer.is_over(now);
        let cv = !cc_signal || !self.cv_timer.is_over(now);

        let previous = self.state;
        self.state = RegulationState::from_flags(cv, cc);
        RegulationChange {
            entered_cv: cv && !previous.is_cv(),
            entered_cc: cc && !previous.is_cc(),
        }
    }

    /// Output switched on: start out in constant voltage.
    pub fn output_on(&mut self) {
        self.state = RegulationState::ConstantVoltage;
    }

    /// Output switched off.
    pub fn reset(&mut self) {
        self.state = RegulationState::Unregulated;
    }

    pub fn state(&self) -> RegulationState {
        self.state
    }
}
