//! Memory-mapped register access.
//!
//! The Cortex-M core drivers talk to their registers through the [`Registers`]
//! trait instead of raw pointers, so the same driver code runs against the real
//! register window on the chip and against a simulated one in tests.

use core::ptr::{read_volatile, write_volatile};

/// Access to one peripheral's register window, addressed by byte offset from its base.
pub trait Registers {
    /// Reads the 32 bit register at `offset`.
    fn read(&self, offset: usize) -> u32;

    /// Writes the 32 bit register at `offset`.
    fn write(&self, offset: usize, value: u32);

    /// Reads a single byte wide register, such as one NVIC priority slot.
    fn read_byte(&self, offset: usize) -> u8;

    /// Writes a single byte wide register.
    fn write_byte(&self, offset: usize, value: u8);

    /// Read-modify-write of the register at `offset`.
    fn modify(&self, offset: usize, f: impl FnOnce(u32) -> u32) {
        let value = self.read(offset);
        self.write(offset, f(value));
    }

    /// Sets every bit of `mask` in the register at `offset`.
    fn set_bits(&self, offset: usize, mask: u32) {
        self.modify(offset, |value| value | mask);
    }

    /// Clears every bit of `mask` in the register at `offset`.
    fn clear_bits(&self, offset: usize, mask: u32) {
        self.modify(offset, |value| value & !mask);
    }

    /// Returns true if any bit of `mask` is set in the register at `offset`.
    fn is_set(&self, offset: usize, mask: u32) -> bool {
        self.read(offset) & mask != 0
    }
}

impl<T: Registers> Registers for &T {
    fn read(&self, offset: usize) -> u32 {
        (**self).read(offset)
    }

    fn write(&self, offset: usize, value: u32) {
        (**self).write(offset, value)
    }

    fn read_byte(&self, offset: usize) -> u8 {
        (**self).read_byte(offset)
    }

    fn write_byte(&self, offset: usize, value: u8) {
        (**self).write_byte(offset, value)
    }
}

/// A register window at a fixed physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mmio {
    base: usize,
}

impl Mmio {
    /// Creates a register window starting at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be the base address of a peripheral register window on this chip,
    /// and every offset later passed to the accessors must lie inside that window.
    pub const unsafe fn new(base: usize) -> Self {
        Mmio { base }
    }

    /// Base address of the window.
    pub const fn base(&self) -> usize {
        self.base
    }
}

impl Registers for Mmio {
    fn read(&self, offset: usize) -> u32 {
        // safety: the constructor guarantees base + offset is a valid register
        unsafe { read_volatile((self.base + offset) as *const u32) }
    }

    fn write(&self, offset: usize, value: u32) {
        // safety: the constructor guarantees base + offset is a valid register
        unsafe { write_volatile((self.base + offset) as *mut u32, value) }
    }

    fn read_byte(&self, offset: usize) -> u8 {
        // safety: the constructor guarantees base + offset is a valid register
        unsafe { read_volatile((self.base + offset) as *const u8) }
    }

    fn write_byte(&self, offset: usize, value: u8) {
        // safety: the constructor guarantees base + offset is a valid register
        unsafe { write_volatile((self.base + offset) as *mut u8, value) }
    }
}
