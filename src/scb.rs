//! System control block register map.
//!
//! Only AIRCR is driven by this crate (priority grouping, see [`crate::nvic`]);
//! the remaining offsets are listed so board code can reach them through the same window.

/// Base address of the system control block.
pub const SCB_BASE: usize = 0xe000_ed00;

/// CPUID base register (read only).
pub const CPUID: usize = 0x00;
/// Interrupt control and state register.
pub const ICSR: usize = 0x04;
/// Vector table offset register.
pub const VTOR: usize = 0x08;
/// Application interrupt and reset control register.
pub const AIRCR: usize = 0x0c;
/// System control register.
pub const SCR: usize = 0x10;
/// Configuration and control register.
pub const CCR: usize = 0x14;
/// First system handler priority register (SHPR1..SHPR3 follow, one word each).
pub const SHPR: usize = 0x18;
/// System handler control and state register.
pub const SHCSR: usize = 0x24;
/// Configurable fault status register.
pub const CFSR: usize = 0x28;

// aircr fields
pub(crate) const AIRCR_VECTKEY_POS: u32 = 16;
pub(crate) const AIRCR_VECTKEY_MASK: u32 = 0xffff << AIRCR_VECTKEY_POS;
/// Key that must accompany every AIRCR write.
pub const AIRCR_VECTKEY: u32 = 0x05fa;
pub(crate) const AIRCR_PRIGROUP_POS: u32 = 8;
pub(crate) const AIRCR_PRIGROUP_MASK: u32 = 0x7 << AIRCR_PRIGROUP_POS;
