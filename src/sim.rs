//! Simulated registers used by the unit tests.
//!
//! The core peripherals get a [`SimRegisters`] window that models the side
//! effects the drivers depend on and logs every word write, so tests can assert
//! on the exact sequence a driver produced. Device peripherals reached through
//! the PAC get a plain RAM copy of their register block from [`ram_block`].

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::vec::Vec;

use cortex_m::interrupt::CriticalSection;

use crate::mask::InterruptMask;
use crate::mmio::Registers;

#[derive(Debug, Clone, Copy)]
enum Model {
    Plain,
    Nvic,
    Scb,
    SysTick { polls_until_wrap: u32 },
}

pub(crate) struct SimRegisters {
    model: Model,
    words: RefCell<BTreeMap<usize, u32>>,
    writes: RefCell<Vec<(usize, u32)>>,
    polls: Cell<u32>,
    count_flag: Cell<bool>,
}

// nvic bank offsets
const NVIC_ISER: usize = 0x000;
const NVIC_ICER: usize = 0x080;
const NVIC_ISPR: usize = 0x100;
const NVIC_ICPR: usize = 0x180;
const NVIC_BANK_LEN: usize = 0x20;
const NVIC_STIR: usize = 0xe00;

const SCB_AIRCR: usize = 0x0c;
const AIRCR_WRITE_KEY: u32 = 0x05fa;
const AIRCR_READ_KEY: u32 = 0xfa05;

const SYST_CSR: usize = 0x0;
const SYST_RVR: usize = 0x4;
const SYST_CVR: usize = 0x8;
const SYST_ENABLE: u32 = 1;


impl SimRegisters {
    fn with_model(model: Model) -> Self {
        SimRegisters {
            model,
            words: RefCell::new(BTreeMap::new()),
            writes: RefCell::new(Vec::new()),
            polls: Cell::new(0),
            count_flag: Cell::new(false),
        }
    }

    /// Plain memory with no side effects.
    pub(crate) fn plain() -> Self {
        Self::with_model(Model::Plain)
    }

    /// NVIC window: set/clear banks alias one state word, STIR pends a line.
    pub(crate) fn nvic() -> Self {
        Self::with_model(Model::Nvic)
    }

    /// SCB window: AIRCR only accepts writes carrying the unlock key.
    pub(crate) fn scb() -> Self {
        Self::with_model(Model::Scb)
    }

    /// SysTick window whose count flag latches after `polls_until_wrap` reads of CSR.
    pub(crate) fn systick(polls_until_wrap: u32) -> Self {
        Self::with_model(Model::SysTick { polls_until_wrap })
    }

    /// Stores `value` without any modeled side effect.
    pub(crate) fn set_word(&self, offset: usize, value: u32) {
        self.words.borrow_mut().insert(offset, value);
    }

    /// Reads the stored word without any modeled side effect.
    pub(crate) fn word(&self, offset: usize) -> u32 {
        self.words.borrow().get(&offset).copied().unwrap_or(0)
    }

    /// Every word write in order.
    pub(crate) fn writes(&self) -> Vec<(usize, u32)> {
        self.writes.borrow().clone()
    }

    /// Values written to `offset`, in order.
    pub(crate) fn writes_to(&self, offset: usize) -> Vec<u32> {
        self.writes
            .borrow()
            .iter()
            .filter(|(written, _)| *written == offset)
            .map(|(_, value)| *value)
            .collect()
    }

    pub(crate) fn clear_log(&self) {
        self.writes.borrow_mut().clear();
    }

    fn update(&self, offset: usize, f: impl FnOnce(u32) -> u32) {
        let value = f(self.word(offset));
        self.set_word(offset, value);
    }

    fn write_nvic(&self, offset: usize, value: u32) {
        match offset {
            o if (NVIC_ISER..NVIC_ISER + NVIC_BANK_LEN).contains(&o) => {
                self.update(o, |v| v | value)
            }
            o if (NVIC_ICER..NVIC_ICER + NVIC_BANK_LEN).contains(&o) => {
                self.update(o - NVIC_ICER + NVIC_ISER, |v| v & !value)
            }
            o if (NVIC_ISPR..NVIC_ISPR + NVIC_BANK_LEN).contains(&o) => {
                self.update(o, |v| v | value)
            }
            o if (NVIC_ICPR..NVIC_ICPR + NVIC_BANK_LEN).contains(&o) => {
                self.update(o - NVIC_ICPR + NVIC_ISPR, |v| v & !value)
            }
            NVIC_STIR => {
                let id = (value & 0x1ff) as usize;
                self.update(NVIC_ISPR + (id / 32) * 4, |v| v | (1 << (id % 32)));
            }
            o => self.set_word(o, value),
        }
    }

    fn read_nvic(&self, offset: usize) -> u32 {
        match offset {
            o if (NVIC_ICER..NVIC_ICER + NVIC_BANK_LEN).contains(&o) => {
                self.word(o - NVIC_ICER + NVIC_ISER)
            }
            o if (NVIC_ICPR..NVIC_ICPR + NVIC_BANK_LEN).contains(&o) => {
                self.word(o - NVIC_ICPR + NVIC_ISPR)
            }
            o => self.word(o),
        }
    }

    fn write_systick(&self, offset: usize, value: u32) {
        match offset {
            SYST_CSR => {
                if value & SYST_ENABLE != 0 && self.word(SYST_CSR) & SYST_ENABLE == 0 {
                    self.polls.set(0);
                }
                // count flag is read only
                self.set_word(SYST_CSR, value & 0x7);
            }
            SYST_RVR => self.set_word(SYST_RVR, value & 0x00ff_ffff),
            SYST_CVR => {
                self.set_word(SYST_CVR, 0);
                self.count_flag.set(false);
            }
            o => self.set_word(o, value),
        }
    }

    fn read_systick(&self, offset: usize, polls_until_wrap: u32) -> u32 {
        if offset != SYST_CSR {
            return self.word(offset);
        }

        let csr = self.word(SYST_CSR);
        if csr & SYST_ENABLE != 0 {
            self.polls.set(self.polls.get() + 1);
            if self.polls.get() >= polls_until_wrap {
                self.count_flag.set(true);
                self.polls.set(0);
            }
        }

        // reading clears the flag
        let flag = self.count_flag.replace(false);
        csr | ((flag as u32) << 16)
    }
}

impl Registers for SimRegisters {
    fn read(&self, offset: usize) -> u32 {
        match self.model {
            Model::Nvic => self.read_nvic(offset),
            Model::Scb if offset == SCB_AIRCR => {
                (AIRCR_READ_KEY << 16) | (self.word(offset) & 0xffff)
            }
            Model::SysTick { polls_until_wrap } => self.read_systick(offset, polls_until_wrap),
            _ => self.word(offset),
        }
    }

    fn write(&self, offset: usize, value: u32) {
        self.writes.borrow_mut().push((offset, value));

        match self.model {
            Model::Plain => self.set_word(offset, value),
            Model::Nvic => self.write_nvic(offset, value),
            Model::Scb => {
                if offset != SCB_AIRCR {
                    self.set_word(offset, value);
                } else if value >> 16 == AIRCR_WRITE_KEY {
                    self.set_word(offset, value & 0xffff);
                }
            }
            Model::SysTick { .. } => self.write_systick(offset, value),
        }
    }

    fn read_byte(&self, offset: usize) -> u8 {
        let shift = (offset % 4) * 8;
        (self.word(offset & !0x3) >> shift) as u8
    }

    fn write_byte(&self, offset: usize, value: u8) {
        let shift = (offset % 4) * 8;
        self.update(offset & !0x3, |word| (word & !(0xff << shift)) | ((value as u32) << shift));
    }
}

/// Zeroed RAM laid out as the register block `T` of a PAC peripheral.
///
/// Writes stick and reads return the last value written. Nothing models the
/// hardware side effects, so tests preset status bits the driver waits on.
pub(crate) fn ram_block<T>() -> &'static T {
    let words = core::mem::size_of::<T>().div_ceil(4);
    let memory: &'static mut [u32] = Box::leak(vec![0u32; words].into_boxed_slice());

    // safety: the memory is zeroed, word aligned and large enough for T, and register
    // blocks only hold interior mutable u32 cells
    unsafe { &*(memory.as_mut_ptr() as *const T) }
}

/// Word at byte `offset` of a RAM register block, including write only registers.
pub(crate) fn peek<T>(block: &T, offset: usize) -> u32 {
    assert!(offset + 4 <= core::mem::size_of::<T>(), "offset outside the block");

    // safety: in bounds, checked above
    unsafe { ((block as *const T as *const u8).add(offset) as *const u32).read_volatile() }
}

/// Stores `value` at byte `offset` of a RAM register block, including read only registers.
pub(crate) fn poke<T>(block: &T, offset: usize, value: u32) {
    assert!(offset + 4 <= core::mem::size_of::<T>(), "offset outside the block");

    // safety: in bounds, and the block is interior mutable RAM from `ram_block`
    unsafe { ((block as *const T as *const u8).add(offset) as *mut u32).write_volatile(value) }
}

/// Every word of a RAM register block.
pub(crate) fn snapshot<T>(block: &T) -> Vec<u32> {
    (0..core::mem::size_of::<T>() / 4)
        .map(|word| peek(block, word * 4))
        .collect()
}

/// Mask stand-in that counts how often a critical section was entered.
#[derive(Debug, Default)]
pub(crate) struct CountingMask {
    entered: Cell<u32>,
    depth: Cell<u32>,
    max_depth: Cell<u32>,
}

impl CountingMask {
    pub(crate) fn entered(&self) -> u32 {
        self.entered.get()
    }

    /// Deepest nesting of critical sections seen so far.
    pub(crate) fn max_depth(&self) -> u32 {
        self.max_depth.get()
    }
}

impl InterruptMask for CountingMask {
    fn free<T>(&self, f: impl FnOnce(&CriticalSection) -> T) -> T {
        self.entered.set(self.entered.get() + 1);
        self.depth.set(self.depth.get() + 1);
        self.max_depth.set(self.max_depth.get().max(self.depth.get()));

        // safety: host tests are single threaded with respect to this mask
        let result = f(unsafe { &CriticalSection::new() });

        self.depth.set(self.depth.get() - 1);
        result
    }
}
