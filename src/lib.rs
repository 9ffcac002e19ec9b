//! Peripheral access for the STM32F401.
//!
//! Drivers for the Cortex-M4 interrupt controller and SysTick timer, and for the
//! RCC, FLASH and DMA peripherals of the chip. The core drivers reach their
//! registers through [`mmio::Registers`], the device drivers through the
//! `stm32f4` peripheral access crate.

#![cfg_attr(not(test), no_std)]

pub mod dma;
pub mod flash;
mod log;
pub mod mask;
pub mod mmio;
pub mod nvic;
pub mod rcc;
pub mod scb;
#[cfg(test)]
mod sim;
pub mod systick;

use once_cell::sync::OnceCell;
use stm32f4::stm32f401::{DMA1, DMA2};
use thiserror_no_std::Error;

pub use dma::Dma;
pub use flash::Flash;
pub use mask::{CortexMMask, InterruptMask};
pub use nvic::{InterruptLine, Nvic, PriorityGrouping};
pub use rcc::Rcc;
pub use systick::{SysTick, TimerMode};

/// Parameterless function run from interrupt context.
pub type Callback = &'static (dyn Fn() + Sync);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HalError {
    #[error("Error: {0} ticks does not fit the 24 bit timer")]
    TicksOutOfRange(u32),
    #[error("Error: pll factors out of range")]
    InvalidPllConfig,
    #[error("Error: flash controller stayed locked")]
    FlashLocked,
    #[error("Error: address is not a programmable flash word")]
    FlashAddress,
    #[error("Error writing to flash, status {0:#x}")]
    FlashOperation(u32),
    #[error("Error: dma stream {0} does not exist")]
    InvalidStream(u8),
}

/// Interrupt controller handle shared with interrupt handlers.
static NVIC: OnceCell<Nvic> = OnceCell::new();

/// The interrupt controller, once [`Peripherals::take`] has run.
pub fn nvic() -> Option<&'static Nvic> {
    NVIC.get()
}

/// Contains the peripherals of the STM32F401 driven by this crate.
pub struct Peripherals {
    pub nvic: Nvic,
    pub systick: SysTick,
    pub rcc: Rcc,
    pub flash: Flash,
    pub dma1: Dma<DMA1>,
    pub dma2: Dma<DMA2>,
}

impl Peripherals {
    /// Initializes all peripherals and returns them.
    ///
    /// Returns `None` if the Cortex-M core peripherals or the device peripherals were
    /// already taken.
    pub fn take() -> Option<Peripherals> {
        // owning the core singleton stands in for owning the nvic and systick windows
        let _core = cortex_m::Peripherals::take()?;
        let device = stm32f4::stm32f401::Peripherals::take()?;

        // safety: the core singleton can only be taken once, so each driver is created once
        let (nvic, systick) = unsafe {
            let nvic = Nvic::hardware();
            (nvic, SysTick::hardware(nvic))
        };

        let mut rcc = Rcc::new(device.RCC);
        let flash = Flash::new(device.FLASH);

        let dma1 = Dma::new(
            device.DMA1,
            dma::Controller::Dma1,
            dma::Controller::Dma1.handlers(),
            CortexMMask,
            &mut rcc,
        );
        let dma2 = Dma::new(
            device.DMA2,
            dma::Controller::Dma2,
            dma::Controller::Dma2.handlers(),
            CortexMMask,
            &mut rcc,
        );

        let _ = NVIC.set(nvic);
        log::info!("stm32f401 peripherals taken");

        Some(Peripherals {
            nvic,
            systick,
            rcc,
            flash,
            dma1,
            dma2,
        })
    }
}

/// Aligns `addr` up to the power 2 alignment `align`
/// `align` must be a power of 2
pub const fn align_up(addr: usize, align: usize) -> usize {
    (addr + align - 1) & !(align - 1)
}

/// Aligns `addr` down to the power 2 alignment `align`
/// `align` must be a power of 2
pub const fn align_down(addr: usize, align: usize) -> usize {
    addr & !(align - 1)
}
