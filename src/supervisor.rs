//! Last-resort supply supervisor.

use crate::{
    interface::{Board, Notification, Notifier, PowerMonitor},
    timer::TickDuration,
};

/// Ticks the power-good input may stay low before the supervisor gives up.
pub const PVG_LIMIT: u16 = 50;

/// Why the supervisor reset the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SupplyFault {
    Brownout,
    PowerGoodLost,
}

pub struct Supervisor {
    pvg_absent: u16,
    pvg_limit: u16,
    settle: TickDuration,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new(PVG_LIMIT, TickDuration::millis(1_000))
    }
}

impl Supervisor {
    pub fn new(pvg_limit: u16, settle: TickDuration) -> Self {
        Self {
            pvg_absent: 0,
            pvg_limit,
            settle,
        }
    }

    /// Sample the supply inputs for one tick.
    pub fn check<P: PowerMonitor>(&mut self, monitor: &mut P) -> Option<SupplyFault> {
        if monitor.power_good() {
            self.pvg_absent = 0;
        } else {
            self.pvg_absent = self.pvg_absent.saturating_add(1);
        }

        if monitor.brownout() {
            Some(SupplyFault::Brownout)
        } else if self.pvg_absent > self.pvg_limit {
            Some(SupplyFault::PowerGoodLost)
        } else {
            None
        }
    }

    /// Check the supply and on a fault take the board down. Returns the fault that caused a reset.
    pub fn execute<B: Board, N: Notifier>(
        &mut self,
        board: &mut B,
        notifier: &mut N,
    ) -> Option<SupplyFault> {
        let fault = self.check(board)?;
        error!("Supply fault {:?}, resetting", fault);
        board.set_output_enable(false);
        notifier.notify(Notification::SoundOff);
        notifier.notify(Notification::DisplayOff);
        board.delay_ms(self.settle.to_millis());
        board.system_reset();
        Some(fault)
    }
}
