//! DMA controllers.
//!
//! Each of the two controllers has eight streams. A stream is configured and
//! started by [`Dma::init_stream`]; when its transfer completes, the stream's
//! interrupt vector must call [`on_stream_interrupt`], which acknowledges the
//! transfer-complete flag and runs the callback registered for the stream.

use core::cell::Cell;
use core::ops::Deref;

use cortex_m::interrupt::{CriticalSection, Mutex};
use stm32f4::stm32f401::{dma2, rcc, DMA1, DMA2};

use crate::log;
use crate::mask::{CortexMMask, InterruptMask};
use crate::nvic::InterruptLine;
use crate::rcc::{PeripheralClock, Rcc};
use crate::{Callback, HalError};

/// Streams per controller.
pub const STREAM_COUNT: usize = 8;

/// Transfer complete flag of stream `n % 4` in LISR/LIFCR or HISR/HIFCR.
const TCIF_BITS: [u32; 4] = [5, 11, 21, 27];

/// One of the two DMA controllers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Controller {
    Dma1,
    Dma2,
}

impl Controller {
    /// The controller's register block. Both controllers share one layout.
    pub fn registers(self) -> *const dma2::RegisterBlock {
        match self {
            Controller::Dma1 => DMA1::ptr(),
            Controller::Dma2 => DMA2::ptr(),
        }
    }

    const fn clock(self) -> PeripheralClock {
        match self {
            Controller::Dma1 => PeripheralClock::Dma1,
            Controller::Dma2 => PeripheralClock::Dma2,
        }
    }

    /// Callbacks used by the hardware controller and its interrupt vectors.
    pub fn handlers(self) -> &'static StreamHandlers {
        match self {
            Controller::Dma1 => &DMA1_HANDLERS,
            Controller::Dma2 => &DMA2_HANDLERS,
        }
    }

    /// NVIC line of one of the controller's streams.
    pub const fn interrupt_line(self, stream: u8) -> Option<InterruptLine> {
        let line = match (self, stream) {
            (Controller::Dma1, 0..=6) => InterruptLine::DMA1_STREAM0.id() + stream as i16,
            (Controller::Dma1, 7) => InterruptLine::DMA1_STREAM7.id(),
            (Controller::Dma2, 0..=4) => InterruptLine::DMA2_STREAM0.id() + stream as i16,
            (Controller::Dma2, 5..=7) => InterruptLine::DMA2_STREAM5.id() + (stream - 5) as i16,
            _ => return None,
        };

        Some(InterruptLine::new(line))
    }
}

/// Transfer direction, as encoded in SxCR.DIR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    PeripheralToMemory = 0,
    MemoryToPeripheral = 1,
    MemoryToMemory = 2,
}

/// Arbitration priority between streams of one controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Priority {
    Low = 0,
    Medium = 1,
    High = 2,
    VeryHigh = 3,
}

/// FIFO fill level that triggers a memory burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FifoThreshold {
    Quarter = 0,
    Half = 1,
    ThreeQuarters = 2,
    Full = 3,
}

/// How a stream transfers data.
#[derive(Clone, Copy)]
pub struct DmaConfig {
    /// Request channel, only the low three bits are used.
    pub channel: u8,
    pub direction: Direction,
    pub peripheral_increment: bool,
    pub memory_increment: bool,
    pub priority: Priority,
    /// FIFO mode when true, direct mode otherwise.
    pub fifo: bool,
    pub fifo_threshold: FifoThreshold,
    /// Run on every transfer complete interrupt.
    pub callback: Option<Callback>,
}

/// What a stream transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub stream: u8,
    pub peripheral_address: u32,
    pub memory_address: u32,
    pub items: u16,
}

/// Transfer complete callbacks of one controller, one slot per stream.
pub struct StreamHandlers {
    slots: Mutex<[Cell<Option<Callback>>; STREAM_COUNT]>,
}

impl StreamHandlers {
    pub const fn new() -> Self {
        const EMPTY: Cell<Option<Callback>> = Cell::new(None);

        StreamHandlers {
            slots: Mutex::new([EMPTY; STREAM_COUNT]),
        }
    }

    fn get(&self, cs: &CriticalSection, stream: usize) -> Option<Callback> {
        self.slots.borrow(cs)[stream].get()
    }

    fn set(&self, cs: &CriticalSection, stream: usize, callback: Option<Callback>) {
        self.slots.borrow(cs)[stream].set(callback);
    }
}

impl Default for StreamHandlers {
    fn default() -> Self {
        Self::new()
    }
}

static DMA1_HANDLERS: StreamHandlers = StreamHandlers::new();
static DMA2_HANDLERS: StreamHandlers = StreamHandlers::new();

/// Driver for one DMA controller.
pub struct Dma<R, M = CortexMMask> {
    regs: R,
    controller: Controller,
    handlers: &'static StreamHandlers,
    mask: M,
}

impl<R: Deref<Target = dma2::RegisterBlock>, M: InterruptMask> Dma<R, M> {
    /// Creates the driver and enables the controller's clock.
    pub(crate) fn new<C: Deref<Target = rcc::RegisterBlock>>(
        regs: R,
        controller: Controller,
        handlers: &'static StreamHandlers,
        mask: M,
        rcc: &mut Rcc<C>,
    ) -> Self {
        rcc.set_clock_enabled(controller.clock(), true);

        Dma {
            regs,
            controller,
            handlers,
            mask,
        }
    }

    pub fn controller(&self) -> Controller {
        self.controller
    }

    fn check_stream(stream: u8) -> Result<usize, HalError> {
        if (stream as usize) < STREAM_COUNT {
            Ok(stream as usize)
        } else {
            log::warning!("dma: no stream {=u8}", stream);
            Err(HalError::InvalidStream(stream))
        }
    }

    /// Configures a stream, registers its callback and starts it.
    pub fn init_stream(
        &mut self,
        config: &DmaConfig,
        stream: &StreamConfig,
    ) -> Result<(), HalError> {
        let index = Self::check_stream(stream.stream)?;
        let st = self.regs.st(index);

        // stream registers are only writable while it is disabled
        st.cr().modify(|_, cr| cr.en().clear_bit());
        st.cr().reset();

        // safety: addresses and item counts accept any value
        st.par().write(|par| unsafe { par.pa().bits(stream.peripheral_address) });
        st.m0ar().write(|m0ar| unsafe { m0ar.m0a().bits(stream.memory_address) });
        st.ndtr().write(|ndtr| unsafe { ndtr.ndt().bits(stream.items) });

        // safety: every enum discriminant is a defined encoding of its field, the
        // channel is masked to the width of CHSEL
        st.cr().write(|cr| unsafe {
            cr.pl()
                .bits(config.priority as u8)
                .dir()
                .bits(config.direction as u8)
                .chsel()
                .bits(config.channel & 0x7)
                .minc()
                .bit(config.memory_increment)
                .pinc()
                .bit(config.peripheral_increment)
        });

        // direct mode is disabled to use the fifo
        // safety: as above
        st.fcr().write(|fcr| unsafe {
            fcr.dmdis()
                .bit(config.fifo)
                .fth()
                .bits(config.fifo_threshold as u8)
        });

        self.mask.free(|cs| self.handlers.set(cs, index, config.callback));

        st.cr().modify(|_, cr| cr.tcie().set_bit());
        st.cr().modify(|_, cr| cr.en().set_bit());

        log::debug!(
            "dma: {} stream {=u8} started, {=u16} items",
            self.controller,
            stream.stream,
            stream.items
        );
        Ok(())
    }

    /// Stops a stream, restores its registers to their reset values and drops its callback.
    pub fn deinit_stream(&mut self, stream: u8) -> Result<(), HalError> {
        let index = Self::check_stream(stream)?;
        let st = self.regs.st(index);

        st.cr().modify(|_, cr| cr.en().clear_bit());
        st.cr().reset();
        st.fcr().reset();
        st.m0ar().reset();
        st.m1ar().reset();
        st.ndtr().reset();
        st.par().reset();

        self.mask.free(|cs| self.handlers.set(cs, index, None));

        log::debug!("dma: {} stream {=u8} stopped", self.controller, stream);
        Ok(())
    }

    /// Returns true while the stream is enabled.
    pub fn is_enabled(&self, stream: u8) -> bool {
        match Self::check_stream(stream) {
            Ok(index) => self.regs.st(index).cr().read().en().bit_is_set(),
            Err(_) => false,
        }
    }

    /// Returns true once the stream has raised its transfer complete flag.
    pub fn is_transfer_complete(&self, stream: u8) -> bool {
        let Ok(index) = Self::check_stream(stream) else {
            return false;
        };

        let flags = if index < 4 {
            self.regs.lisr().read().bits()
        } else {
            self.regs.hisr().read().bits()
        };

        flags & 1 << TCIF_BITS[index % 4] != 0
    }

    /// Runs the interrupt path of a stream against this driver's registers.
    pub fn on_stream_interrupt(&self, stream: u8) {
        stream_interrupt(&self.regs, self.handlers, &self.mask, stream);
    }
}

/// Acknowledges the transfer complete flag of a stream and runs its callback.
///
/// Called from the stream's interrupt vector, for example
/// `on_stream_interrupt(Controller::Dma2, 0)` from `DMA2_Stream0`.
pub fn on_stream_interrupt(controller: Controller, stream: u8) {
    // safety: the pointer is the controller's register block, which lives for the whole program
    let regs = unsafe { &*controller.registers() };
    stream_interrupt(regs, controller.handlers(), &CortexMMask, stream);
}

fn stream_interrupt<M: InterruptMask>(
    regs: &dma2::RegisterBlock,
    handlers: &StreamHandlers,
    mask: &M,
    stream: u8,
) {
    let index = stream as usize;
    if index >= STREAM_COUNT {
        return;
    }

    let flag = 1 << TCIF_BITS[index % 4];
    // safety: flag clear registers are write one to clear, zero bits are ignored
    if index < 4 {
        regs.lifcr().write(|lifcr| unsafe { lifcr.bits(flag) });
    } else {
        regs.hifcr().write(|hifcr| unsafe { hifcr.bits(flag) });
    }

    if let Some(callback) = mask.free(|cs| handlers.get(cs, index)) {
        callback();
    }
}
