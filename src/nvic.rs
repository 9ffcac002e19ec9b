//! Nested vectored interrupt controller.
//!
//! The NVIC keeps its per line state in five banks of eight 32 bit words
//! (set-enable, clear-enable, set-pending, clear-pending, active) and one byte of
//! priority per line. Line `n` lives in word `n / 32`, bit `n % 32` of a bank and
//! in byte `n` of the priority array.
//!
//! Only device interrupts (non-negative lines) are reachable through these banks.
//! Every operation silently ignores core exception lines; they are not errors.

use crate::log;
use crate::mmio::{Mmio, Registers};
use crate::scb::{
    self, AIRCR_PRIGROUP_MASK, AIRCR_PRIGROUP_POS, AIRCR_VECTKEY, AIRCR_VECTKEY_MASK,
    AIRCR_VECTKEY_POS,
};

/// Base address of the NVIC register window.
pub const NVIC_BASE: usize = 0xe000_e100;

/// Words in each bit bank.
pub const BANK_WORDS: usize = 8;
/// Lines addressable through the bit banks.
pub const BANK_LINES: usize = BANK_WORDS * 32;
/// Entries in the priority array.
pub const PRIORITY_SLOTS: usize = 240;
/// Priority bits implemented by the chip, left justified in each 8 bit slot.
pub const PRIORITY_BITS: u32 = 4;

// offsets from NVIC_BASE
const ISER: usize = 0x000;
const ICER: usize = 0x080;
const ISPR: usize = 0x100;
const ICPR: usize = 0x180;
const IABR: usize = 0x200;
const IP: usize = 0x300;
const STIR: usize = 0xe00;

/// A numbered interrupt source.
///
/// Negative numbers are Cortex-M4 core exceptions, non-negative numbers are
/// STM32F401 device interrupts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InterruptLine(i16);

impl InterruptLine {
    pub const NON_MASKABLE_INT: InterruptLine = InterruptLine(-14);
    pub const MEMORY_MANAGEMENT: InterruptLine = InterruptLine(-12);
    pub const BUS_FAULT: InterruptLine = InterruptLine(-11);
    pub const USAGE_FAULT: InterruptLine = InterruptLine(-10);
    pub const SV_CALL: InterruptLine = InterruptLine(-5);
    pub const DEBUG_MONITOR: InterruptLine = InterruptLine(-4);
    pub const PEND_SV: InterruptLine = InterruptLine(-2);
    pub const SYS_TICK: InterruptLine = InterruptLine(-1);

    pub const WWDG: InterruptLine = InterruptLine(0);
    pub const PVD: InterruptLine = InterruptLine(1);
    pub const TAMP_STAMP: InterruptLine = InterruptLine(2);
    pub const RTC_WKUP: InterruptLine = InterruptLine(3);
    pub const FLASH: InterruptLine = InterruptLine(4);
    pub const RCC: InterruptLine = InterruptLine(5);
    pub const EXTI0: InterruptLine = InterruptLine(6);
    pub const EXTI1: InterruptLine = InterruptLine(7);
    pub const EXTI2: InterruptLine = InterruptLine(8);
    pub const EXTI3: InterruptLine = InterruptLine(9);
    pub const EXTI4: InterruptLine = InterruptLine(10);
    pub const DMA1_STREAM0: InterruptLine = InterruptLine(11);
    pub const DMA1_STREAM1: InterruptLine = InterruptLine(12);
    pub const DMA1_STREAM2: InterruptLine = InterruptLine(13);
    pub const DMA1_STREAM3: InterruptLine = InterruptLine(14);
    pub const DMA1_STREAM4: InterruptLine = InterruptLine(15);
    pub const DMA1_STREAM5: InterruptLine = InterruptLine(16);
    pub const DMA1_STREAM6: InterruptLine = InterruptLine(17);
    pub const ADC: InterruptLine = InterruptLine(18);
    pub const EXTI9_5: InterruptLine = InterruptLine(23);
    pub const TIM1_BRK_TIM9: InterruptLine = InterruptLine(24);
    pub const TIM1_UP_TIM10: InterruptLine = InterruptLine(25);
    pub const TIM1_TRG_COM_TIM11: InterruptLine = InterruptLine(26);
    pub const TIM1_CC: InterruptLine = InterruptLine(27);
    pub const TIM2: InterruptLine = InterruptLine(28);
    pub const TIM3: InterruptLine = InterruptLine(29);
    pub const TIM4: InterruptLine = InterruptLine(30);
    pub const I2C1_EV: InterruptLine = InterruptLine(31);
    pub const I2C1_ER: InterruptLine = InterruptLine(32);
    pub const I2C2_EV: InterruptLine = InterruptLine(33);
    pub const I2C2_ER: InterruptLine = InterruptLine(34);
    pub const SPI1: InterruptLine = InterruptLine(35);
    pub const SPI2: InterruptLine = InterruptLine(36);
    pub const USART1: InterruptLine = InterruptLine(37);
    pub const USART2: InterruptLine = InterruptLine(38);
    pub const EXTI15_10: InterruptLine = InterruptLine(40);
    pub const RTC_ALARM: InterruptLine = InterruptLine(41);
    pub const OTG_FS_WKUP: InterruptLine = InterruptLine(42);
    pub const DMA1_STREAM7: InterruptLine = InterruptLine(47);
    pub const SDIO: InterruptLine = InterruptLine(49);
    pub const TIM5: InterruptLine = InterruptLine(50);
    pub const SPI3: InterruptLine = InterruptLine(51);
    pub const DMA2_STREAM0: InterruptLine = InterruptLine(56);
    pub const DMA2_STREAM1: InterruptLine = InterruptLine(57);
    pub const DMA2_STREAM2: InterruptLine = InterruptLine(58);
    pub const DMA2_STREAM3: InterruptLine = InterruptLine(59);
    pub const DMA2_STREAM4: InterruptLine = InterruptLine(60);
    pub const OTG_FS: InterruptLine = InterruptLine(67);
    pub const DMA2_STREAM5: InterruptLine = InterruptLine(68);
    pub const DMA2_STREAM6: InterruptLine = InterruptLine(69);
    pub const DMA2_STREAM7: InterruptLine = InterruptLine(70);
    pub const USART6: InterruptLine = InterruptLine(71);
    pub const I2C3_EV: InterruptLine = InterruptLine(72);
    pub const I2C3_ER: InterruptLine = InterruptLine(73);
    pub const FPU: InterruptLine = InterruptLine(81);
    pub const SPI4: InterruptLine = InterruptLine(84);

    /// Wraps a raw interrupt number.
    pub const fn new(id: i16) -> Self {
        InterruptLine(id)
    }

    /// The raw interrupt number.
    pub const fn id(self) -> i16 {
        self.0
    }

    /// True for Cortex-M core exceptions, which the NVIC banks cannot address.
    pub const fn is_core_exception(self) -> bool {
        self.0 < 0
    }

    /// Position of the line in the NVIC banks, `None` for core exceptions.
    pub const fn device_index(self) -> Option<usize> {
        if self.0 < 0 {
            None
        } else {
            Some(self.0 as usize)
        }
    }
}

impl From<i16> for InterruptLine {
    fn from(id: i16) -> Self {
        InterruptLine(id)
    }
}

/// One of the five NVIC bit banks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bank {
    SetEnable,
    /// Write one to clear an enable bit. Reads return the same state as `SetEnable`.
    ClearEnable,
    SetPending,
    /// Write one to clear a pending bit. Reads return the same state as `SetPending`.
    ClearPending,
    /// Read only, set while the line's handler is executing.
    Active,
}

impl Bank {
    const fn offset(self) -> usize {
        match self {
            Bank::SetEnable => ISER,
            Bank::ClearEnable => ICER,
            Bank::SetPending => ISPR,
            Bank::ClearPending => ICPR,
            Bank::Active => IABR,
        }
    }

    /// Offset of the word holding `index` and the mask selecting its bit.
    ///
    /// `index` must be below [`BANK_LINES`].
    pub const fn locate(self, index: usize) -> (usize, u32) {
        (self.offset() + (index / 32) * 4, 1 << (index % 32))
    }
}

/// Split between preemption priority and subpriority, as written to AIRCR.PRIGROUP.
///
/// The chip implements four priority bits, so groups 0..=3 all behave like `Preempt4Sub0`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PriorityGrouping {
    /// 4 bits of preemption priority, no subpriority.
    Preempt4Sub0 = 0,
    /// 3 bits of preemption priority, 1 bit of subpriority.
    Preempt3Sub1 = 4,
    /// 2 bits of preemption priority, 2 bits of subpriority.
    Preempt2Sub2 = 5,
    /// 1 bit of preemption priority, 3 bits of subpriority.
    Preempt1Sub3 = 6,
    /// No preemption priority, 4 bits of subpriority.
    Preempt0Sub4 = 7,
}

impl From<PriorityGrouping> for u8 {
    fn from(group: PriorityGrouping) -> u8 {
        group as u8
    }
}

/// Handle to the interrupt controller.
///
/// The controller holds no software state, so the handle is `Copy` and can be
/// given to every driver that needs to touch its own interrupt line.
#[derive(Debug, Clone, Copy)]
pub struct Nvic<R = Mmio> {
    regs: R,
    scb: R,
}

impl Nvic<Mmio> {
    /// Handle to the controller at its hardware address.
    ///
    /// # Safety
    ///
    /// Must only be created by code that owns the core peripherals.
    pub(crate) const unsafe fn hardware() -> Self {
        unsafe { Nvic::new(Mmio::new(NVIC_BASE), Mmio::new(scb::SCB_BASE)) }
    }
}

impl<R: Registers> Nvic<R> {
    /// Creates a handle from the NVIC register window and the system control block window.
    pub const fn new(regs: R, scb: R) -> Self {
        Nvic { regs, scb }
    }

    /// Bank position of `line`, if the banks can address it.
    fn bank_index(line: InterruptLine) -> Option<usize> {
        line.device_index().filter(|&index| index < BANK_LINES)
    }

    /// Priority slot of `line`, if the priority array can address it.
    fn priority_index(line: InterruptLine) -> Option<usize> {
        line.device_index().filter(|&index| index < PRIORITY_SLOTS)
    }

    /// Writes the single bit of `line` to `bank`. Other lines in the word are unaffected
    /// because every bank is write-one-to-act.
    fn write_bit(&self, bank: Bank, line: InterruptLine) {
        if let Some(index) = Self::bank_index(line) {
            let (offset, mask) = bank.locate(index);
            self.regs.write(offset, mask);
        }
    }

    fn read_bit(&self, bank: Bank, line: InterruptLine) -> bool {
        match Self::bank_index(line) {
            Some(index) => {
                let (offset, mask) = bank.locate(index);
                self.regs.is_set(offset, mask)
            }
            None => false,
        }
    }

    /// Enables the interrupt line.
    pub fn enable(&self, line: InterruptLine) {
        self.write_bit(Bank::SetEnable, line);
    }

    /// Disables the interrupt line through the clear-enable bank.
    pub fn disable(&self, line: InterruptLine) {
        self.write_bit(Bank::ClearEnable, line);
    }

    /// Returns true if the interrupt line is enabled.
    pub fn is_enabled(&self, line: InterruptLine) -> bool {
        self.read_bit(Bank::SetEnable, line)
    }

    /// Marks the interrupt line pending.
    pub fn set_pending(&self, line: InterruptLine) {
        self.write_bit(Bank::SetPending, line);
    }

    /// Removes the pending state of the interrupt line.
    pub fn clear_pending(&self, line: InterruptLine) {
        self.write_bit(Bank::ClearPending, line);
    }

    /// Returns true if the interrupt line is pending.
    pub fn is_pending(&self, line: InterruptLine) -> bool {
        self.read_bit(Bank::SetPending, line)
    }

    /// Returns true while the handler for the line is executing.
    pub fn is_active(&self, line: InterruptLine) -> bool {
        self.read_bit(Bank::Active, line)
    }

    /// Pends the interrupt line through the software trigger register.
    pub fn trigger(&self, line: InterruptLine) {
        if let Some(index) = Self::bank_index(line) {
            self.regs.write(STIR, index as u32);
        }
    }

    /// Sets the preemption / subpriority split. Only the low three bits of `group` are used.
    ///
    /// AIRCR discards any write that does not carry the vector key, so the key and
    /// the new group go out in a single store computed from one read.
    pub fn set_priority_grouping(&self, group: impl Into<u8>) {
        let group = (group.into() as u32) & 0x7;

        let snapshot = self.scb.read(scb::AIRCR);
        let value = (snapshot & !(AIRCR_VECTKEY_MASK | AIRCR_PRIGROUP_MASK))
            | (AIRCR_VECTKEY << AIRCR_VECTKEY_POS)
            | (group << AIRCR_PRIGROUP_POS);
        self.scb.write(scb::AIRCR, value);

        log::debug!("nvic priority grouping set to {=u32}", group);
    }

    /// Current AIRCR.PRIGROUP value.
    pub fn priority_grouping(&self) -> u8 {
        ((self.scb.read(scb::AIRCR) & AIRCR_PRIGROUP_MASK) >> AIRCR_PRIGROUP_POS) as u8
    }

    /// Sets the priority of a device interrupt, 0 being the most urgent.
    ///
    /// Only the low four bits of `priority` are kept. Core exception lines are ignored.
    pub fn set_priority(&self, line: InterruptLine, priority: u8) {
        if let Some(index) = Self::priority_index(line) {
            let slot = ((priority as u32) << (8 - PRIORITY_BITS)) as u8;
            self.regs.write_byte(IP + index, slot);
        }
    }

    /// Priority of a device interrupt. Core exception lines always report 0.
    pub fn get_priority(&self, line: InterruptLine) -> u8 {
        match Self::priority_index(line) {
            Some(index) => self.regs.read_byte(IP + index) >> (8 - PRIORITY_BITS),
            None => 0,
        }
    }
}
