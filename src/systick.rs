//! SysTick countdown timer.
//!
//! The timer can be used for blocking delays, or armed to call back into user
//! code once (single shot) or on every expiry (periodic). The armed mode and the
//! callback live in a [`TimerState`] shared with the SysTick exception handler.

use core::cell::Cell;

use cortex_m::interrupt::{CriticalSection, Mutex};

use crate::log;
use crate::mask::{CortexMMask, InterruptMask};
use crate::mmio::{Mmio, Registers};
use crate::nvic::{InterruptLine, Nvic};
use crate::{Callback, HalError};

/// Base address of the SysTick register window.
pub const SYSTICK_BASE: usize = 0xe000_e010;

/// Largest reload value the 24 bit counter holds.
pub const MAX_TICKS: u32 = 0x00ff_ffff;

// offsets from SYSTICK_BASE
const CSR: usize = 0x0;
const RVR: usize = 0x4;
const CVR: usize = 0x8;

// csr bits
const CSR_ENABLE: u32 = 1 << 0;
const CSR_TICKINT: u32 = 1 << 1;
const CSR_CLKSOURCE: u32 = 1 << 2;
const CSR_COUNTFLAG: u32 = 1 << 16;

/// What the exception handler does on the next expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimerMode {
    /// Not armed.
    #[default]
    Idle,
    /// Stop the timer, then run the callback.
    SingleShot,
    /// Run the callback and keep counting.
    Periodic,
}

/// Mode and callback shared between the driver and the exception handler.
pub struct TimerState {
    mode: Mutex<Cell<TimerMode>>,
    callback: Mutex<Cell<Option<Callback>>>,
}

impl TimerState {
    pub const fn new() -> Self {
        TimerState {
            mode: Mutex::new(Cell::new(TimerMode::Idle)),
            callback: Mutex::new(Cell::new(None)),
        }
    }

    pub fn mode(&self, cs: &CriticalSection) -> TimerMode {
        self.mode.borrow(cs).get()
    }

    fn set_mode(&self, cs: &CriticalSection, mode: TimerMode) {
        self.mode.borrow(cs).set(mode);
    }

    fn callback(&self, cs: &CriticalSection) -> Option<Callback> {
        self.callback.borrow(cs).get()
    }

    fn set_callback(&self, cs: &CriticalSection, callback: Option<Callback>) {
        self.callback.borrow(cs).set(callback);
    }
}

impl Default for TimerState {
    fn default() -> Self {
        Self::new()
    }
}

/// State used by the hardware timer and its exception handler.
pub(crate) static TIMER_STATE: TimerState = TimerState::new();

/// Driver for the SysTick timer.
pub struct SysTick<R = Mmio, M = CortexMMask> {
    regs: R,
    nvic: Nvic<R>,
    state: &'static TimerState,
    mask: M,
}

impl SysTick<Mmio, CortexMMask> {
    /// Driver for the timer at its hardware address.
    ///
    /// Bound to the state the exception handler reads.
    ///
    /// # Safety
    ///
    /// Must only be created once, by code that owns the core peripherals.
    pub(crate) unsafe fn hardware(nvic: Nvic<Mmio>) -> Self {
        unsafe { SysTick::new(Mmio::new(SYSTICK_BASE), nvic, &TIMER_STATE, CortexMMask) }
    }
}

impl<R: Registers, M: InterruptMask> SysTick<R, M> {
    pub fn new(regs: R, nvic: Nvic<R>, state: &'static TimerState, mask: M) -> Self {
        SysTick {
            regs,
            nvic,
            state,
            mask,
        }
    }

    fn check_ticks(ticks: u32) -> Result<(), HalError> {
        if ticks == 0 || ticks > MAX_TICKS {
            log::warning!("systick: {=u32} ticks out of range", ticks);
            Err(HalError::TicksOutOfRange(ticks))
        } else {
            Ok(())
        }
    }

    /// Stops the timer and loads `ticks - 1` as its reload value, without arming the interrupt.
    ///
    /// The clock source is the processor clock with the `systick-processor-clock`
    /// feature and the AHB/8 reference clock otherwise.
    pub fn init(&mut self, ticks: u32) -> Result<(), HalError> {
        Self::check_ticks(ticks)?;

        self.mask.free(|cs| {
            self.regs.clear_bits(CSR, CSR_ENABLE);
            self.regs.write(CVR, 0);
            self.regs.write(RVR, ticks - 1);

            if cfg!(feature = "systick-processor-clock") {
                self.regs.set_bits(CSR, CSR_CLKSOURCE);
            } else {
                self.regs.clear_bits(CSR, CSR_CLKSOURCE);
            }

            self.regs.clear_bits(CSR, CSR_TICKINT);
            self.state.set_mode(cs, TimerMode::Idle);
        });

        log::debug!("systick: initialized, reload {=u32}", ticks - 1);
        Ok(())
    }

    /// Stops the timer, clears its registers and forgets the callback.
    pub fn deinit(&mut self) {
        self.mask.free(|cs| {
            disarm(&self.regs);
            self.state.set_mode(cs, TimerMode::Idle);
            self.state.set_callback(cs, None);
        });

        log::debug!("systick: stopped");
    }

    /// Busy waits for one countdown of `ticks` ticks.
    ///
    /// The reload value is `ticks` itself, one more than [`SysTick::init`] loads
    /// for the same argument. The armed mode is left as it was, but the timer is
    /// stopped afterwards, so an armed timer has to be armed again.
    pub fn delay_blocking(&mut self, ticks: u32) -> Result<(), HalError> {
        Self::check_ticks(ticks)?;

        self.regs.write(RVR, ticks);
        self.regs.set_bits(CSR, CSR_ENABLE);

        // count flag clears on read
        while !self.regs.is_set(CSR, CSR_COUNTFLAG) {
            core::hint::spin_loop();
        }

        self.regs.clear_bits(CSR, CSR_ENABLE);
        self.regs.write(RVR, 0);
        self.regs.write(CVR, 0);

        Ok(())
    }

    /// Starts the timer and runs `callback` once, after `ticks` ticks.
    pub fn arm_single_shot(&mut self, ticks: u32, callback: Callback) -> Result<(), HalError> {
        self.arm(ticks, callback, TimerMode::SingleShot)
    }

    /// Starts the timer and runs `callback` every `ticks` ticks until [`SysTick::deinit`].
    pub fn arm_periodic(&mut self, ticks: u32, callback: Callback) -> Result<(), HalError> {
        self.arm(ticks, callback, TimerMode::Periodic)
    }

    fn arm(&mut self, ticks: u32, callback: Callback, mode: TimerMode) -> Result<(), HalError> {
        Self::check_ticks(ticks)?;

        // the exception must not see the new reload value with the old mode
        self.mask.free(|cs| {
            self.regs.write(RVR, ticks);
            self.state.set_callback(cs, Some(callback));
            self.state.set_mode(cs, mode);
            self.regs.set_bits(CSR, CSR_TICKINT);
            self.nvic.set_priority(InterruptLine::SYS_TICK, 0);
            self.regs.set_bits(CSR, CSR_ENABLE);
        });

        log::debug!("systick: armed {}, reload {=u32}", mode, ticks);
        Ok(())
    }

    /// Currently armed mode.
    pub fn mode(&self) -> TimerMode {
        self.mask.free(|cs| self.state.mode(cs))
    }

    /// Runs the expiry path of the exception handler against this driver's registers.
    #[cfg(test)]
    fn on_expiry(&self) {
        expire(&self.regs, self.state, &self.mask);
    }
}

/// Stops the counter and its interrupt and zeroes the reload and current values.
fn disarm<R: Registers>(regs: &R) {
    regs.clear_bits(CSR, CSR_ENABLE);
    regs.write(RVR, 0);
    regs.write(CVR, 0);
    regs.clear_bits(CSR, CSR_TICKINT);
}

/// Expiry handling of the SysTick exception.
///
/// A single shot timer is fully stopped before its callback runs. The callback
/// itself runs outside the critical section.
fn expire<R: Registers, M: InterruptMask>(regs: &R, state: &TimerState, mask: &M) {
    let callback = mask.free(|cs| {
        if state.mode(cs) == TimerMode::SingleShot {
            disarm(regs);
            state.set_mode(cs, TimerMode::Idle);
        }

        state.callback(cs)
    });

    if let Some(callback) = callback {
        callback();
    }
}

#[cfg(not(test))]
mod handler {
    use cortex_m_rt::exception;

    use super::{expire, SYSTICK_BASE, TIMER_STATE};
    use crate::mask::CortexMMask;
    use crate::mmio::Mmio;

    #[exception]
    fn SysTick() {
        // safety: SYSTICK_BASE is the SysTick register window
        let regs = unsafe { Mmio::new(SYSTICK_BASE) };
        expire(&regs, &TIMER_STATE, &CortexMMask);
    }
}
