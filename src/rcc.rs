//! Reset and clock control.

use core::ops::Deref;

use stm32f4::stm32f401::{rcc, RCC};

use crate::log;
use crate::HalError;

/// System clock source, as encoded in CFGR.SW and CFGR.SWS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ClockSource {
    Hsi = 0,
    Hse = 1,
    Pll = 2,
}

/// Input of the main PLL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PllSource {
    Hsi = 0,
    Hse = 1,
}

/// AHB clock divider (CFGR.HPRE encoding).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AhbPrescaler {
    Div1 = 0b0000,
    Div2 = 0b1000,
    Div4 = 0b1001,
    Div8 = 0b1010,
    Div16 = 0b1011,
    Div64 = 0b1100,
    Div128 = 0b1101,
    Div256 = 0b1110,
    Div512 = 0b1111,
}

/// APB1 / APB2 clock divider (CFGR.PPRE1 / CFGR.PPRE2 encoding).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ApbPrescaler {
    Div1 = 0b000,
    Div2 = 0b100,
    Div4 = 0b101,
    Div8 = 0b110,
    Div16 = 0b111,
}

/// Which oscillators should be running after [`Rcc::init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OscillatorConfig {
    pub hse: bool,
    pub hsi: bool,
    pub plli2s: bool,
}

/// Main PLL factors. `f_vco = f_in * n / m`, `f_sysclk = f_vco / p`, `f_usb = f_vco / q`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PllConfig {
    pub source: PllSource,
    /// 2..=63
    pub m: u8,
    /// 192..=432
    pub n: u16,
    /// 2, 4, 6 or 8
    pub p: u8,
    /// 2..=15
    pub q: u8,
}

impl PllConfig {
    /// Checks every factor against the range the PLL accepts.
    pub fn validate(&self) -> Result<(), HalError> {
        let valid = (2..=63).contains(&self.m)
            && (192..=432).contains(&self.n)
            && matches!(self.p, 2 | 4 | 6 | 8)
            && (2..=15).contains(&self.q);

        if valid {
            Ok(())
        } else {
            Err(HalError::InvalidPllConfig)
        }
    }
}

/// Full clock tree setup applied by [`Rcc::init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RccConfig {
    pub oscillators: OscillatorConfig,
    pub clock_source: ClockSource,
    pub ahb_prescaler: AhbPrescaler,
    pub apb1_prescaler: ApbPrescaler,
    pub apb2_prescaler: ApbPrescaler,
    /// Only used when `clock_source` is [`ClockSource::Pll`].
    pub pll: PllConfig,
}

/// Peripherals gated through AHB1ENR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PeripheralClock {
    GpioA,
    GpioB,
    GpioC,
    GpioD,
    GpioE,
    GpioH,
    Dma1,
    Dma2,
}

/// Reset and clock control registers.
///
/// Used for configuring the clock tree and enabling the clocks of other peripherals.
pub struct Rcc<R = RCC> {
    regs: R,
}

impl<R: Deref<Target = rcc::RegisterBlock>> Rcc<R> {
    /// Creates a new Rcc instance from the reset and clock control registers.
    pub(crate) fn new(regs: R) -> Self {
        Rcc { regs }
    }

    /// Configures the oscillators, the PLL when it is selected, the system clock and
    /// the bus prescalers.
    ///
    /// A bad PLL configuration is rejected before any register is written.
    pub fn init(&mut self, config: &RccConfig) -> Result<(), HalError> {
        if config.clock_source == ClockSource::Pll {
            config.pll.validate().inspect_err(|_| {
                log::warning!("rcc: rejected pll configuration");
            })?;
        }

        self.configure_oscillators(&config.oscillators);

        if config.clock_source == ClockSource::Pll {
            self.configure_pll(&config.pll);
        }

        self.switch_system_clock(config.clock_source);
        self.configure_prescalers(config);

        Ok(())
    }

    fn configure_oscillators(&mut self, oscillators: &OscillatorConfig) {
        self.regs.cr().modify(|_, cr| cr.hseon().bit(oscillators.hse));
        if oscillators.hse {
            while self.regs.cr().read().hserdy().bit_is_clear() {}
        }

        self.regs.cr().modify(|_, cr| cr.hsion().bit(oscillators.hsi));
        if oscillators.hsi {
            while self.regs.cr().read().hsirdy().bit_is_clear() {}
        }

        // nothing in this crate waits on the i2s pll
        self.regs.cr().modify(|_, cr| cr.plli2son().bit(oscillators.plli2s));
    }

    fn configure_pll(&mut self, pll: &PllConfig) {
        // factors can only change while the pll is off
        self.regs.cr().modify(|_, cr| cr.pllon().clear_bit());

        // safety: validate checked every factor against its field range
        self.regs.pllcfgr().modify(|_, pllcfgr| unsafe {
            pllcfgr
                .pllm()
                .bits(pll.m)
                .plln()
                .bits(pll.n)
                .pllp()
                .bits(pll.p / 2 - 1)
                .pllsrc()
                .bit(pll.source == PllSource::Hse)
                .pllq()
                .bits(pll.q)
        });

        self.regs.cr().modify(|_, cr| cr.pllon().set_bit());

        // wait for the pll to lock
        while self.regs.cr().read().pllrdy().bit_is_clear() {}

        log::debug!(
            "rcc: pll locked, m {=u8} n {=u16} p {=u8} q {=u8}",
            pll.m,
            pll.n,
            pll.p,
            pll.q
        );
    }

    fn configure_prescalers(&mut self, config: &RccConfig) {
        // safety: every prescaler discriminant is a defined encoding of its field
        self.regs.cfgr().modify(|_, cfgr| unsafe {
            cfgr.hpre()
                .bits(config.ahb_prescaler as u8)
                .ppre1()
                .bits(config.apb1_prescaler as u8)
                .ppre2()
                .bits(config.apb2_prescaler as u8)
        });
    }

    /// Selects the system clock source.
    pub fn switch_system_clock(&mut self, source: ClockSource) {
        // safety: every clock source discriminant is a defined encoding of the field
        self.regs.cfgr().modify(|_, cfgr| unsafe { cfgr.sw().bits(source as u8) });

        log::debug!("rcc: system clock switched to {}", source);
    }

    /// Clock source the hardware reports as driving the system clock.
    ///
    /// `None` for the reserved encoding.
    pub fn system_clock(&self) -> Option<ClockSource> {
        match self.regs.cfgr().read().sws().bits() {
            0 => Some(ClockSource::Hsi),
            1 => Some(ClockSource::Hse),
            2 => Some(ClockSource::Pll),
            _ => None,
        }
    }

    pub fn set_clock_enabled(&mut self, peripheral: PeripheralClock, enabled: bool) {
        self.regs.ahb1enr().modify(|_, clock| match peripheral {
            PeripheralClock::GpioA => clock.gpioaen().bit(enabled),
            PeripheralClock::GpioB => clock.gpioben().bit(enabled),
            PeripheralClock::GpioC => clock.gpiocen().bit(enabled),
            PeripheralClock::GpioD => clock.gpioden().bit(enabled),
            PeripheralClock::GpioE => clock.gpioeen().bit(enabled),
            PeripheralClock::GpioH => clock.gpiohen().bit(enabled),
            PeripheralClock::Dma1 => clock.dma1en().bit(enabled),
            PeripheralClock::Dma2 => clock.dma2en().bit(enabled),
        });
    }

    pub fn is_clock_enabled(&self, peripheral: PeripheralClock) -> bool {
        let clock = self.regs.ahb1enr().read();

        match peripheral {
            PeripheralClock::GpioA => clock.gpioaen().bit_is_set(),
            PeripheralClock::GpioB => clock.gpioben().bit_is_set(),
            PeripheralClock::GpioC => clock.gpiocen().bit_is_set(),
            PeripheralClock::GpioD => clock.gpioden().bit_is_set(),
            PeripheralClock::GpioE => clock.gpioeen().bit_is_set(),
            PeripheralClock::GpioH => clock.gpiohen().bit_is_set(),
            PeripheralClock::Dma1 => clock.dma1en().bit_is_set(),
            PeripheralClock::Dma2 => clock.dma2en().bit_is_set(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{self, ram_block};

    // register offsets and bits, as the reference manual lists them
    const CR: usize = 0x00;
    const PLLCFGR: usize = 0x04;
    const CFGR: usize = 0x08;
    const AHB1ENR: usize = 0x30;

    const HSION: u32 = 1 << 0;
    const HSIRDY: u32 = 1 << 1;
    const HSEON: u32 = 1 << 16;
    const HSERDY: u32 = 1 << 17;
    const PLLON: u32 = 1 << 24;
    const PLLRDY: u32 = 1 << 25;
    const PLLI2SON: u32 = 1 << 26;
    const PLLSRC: u32 = 1 << 22;

    const PLLCFGR_RESET: u32 = 0x2400_3010;

    type Block = &'static rcc::RegisterBlock;

    fn ready_rcc() -> Block {
        let regs = ram_block::<rcc::RegisterBlock>();
        regs.cr().write(|cr| unsafe { cr.bits(HSIRDY | HSERDY | PLLRDY) });
        regs.pllcfgr().write(|pllcfgr| unsafe { pllcfgr.bits(PLLCFGR_RESET) });
        regs
    }

    fn word(regs: Block, offset: usize) -> u32 {
        sim::peek(regs, offset)
    }

    fn pll_config() -> RccConfig {
        RccConfig {
            oscillators: OscillatorConfig {
                hse: true,
                hsi: true,
                plli2s: false,
            },
            clock_source: ClockSource::Pll,
            ahb_prescaler: AhbPrescaler::Div1,
            apb1_prescaler: ApbPrescaler::Div2,
            apb2_prescaler: ApbPrescaler::Div1,
            pll: PllConfig {
                source: PllSource::Hse,
                m: 25,
                n: 336,
                p: 4,
                q: 7,
            },
        }
    }

    #[test]
    fn pll_limits() {
        let good = pll_config().pll;
        assert_eq!(good.validate(), Ok(()));

        let bad = [
            PllConfig { m: 1, ..good },
            PllConfig { m: 64, ..good },
            PllConfig { n: 191, ..good },
            PllConfig { n: 433, ..good },
            PllConfig { p: 3, ..good },
            PllConfig { p: 10, ..good },
            PllConfig { q: 1, ..good },
            PllConfig { q: 16, ..good },
        ];
        for pll in bad {
            assert_eq!(pll.validate(), Err(HalError::InvalidPllConfig), "{pll:?}");
        }

        for (m, n, q) in [(2, 192, 2), (63, 432, 15)] {
            assert_eq!(PllConfig { m, n, q, ..good }.validate(), Ok(()));
        }
    }

    #[test]
    fn bad_pll_touches_nothing() {
        let regs = ready_rcc();
        let before = sim::snapshot(regs);
        let mut rcc = Rcc::new(regs);

        let mut config = pll_config();
        config.pll.n = 100;

        assert_eq!(rcc.init(&config), Err(HalError::InvalidPllConfig));
        assert_eq!(sim::snapshot(regs), before);
    }

    #[test]
    fn bad_pll_is_ignored_without_pll_clock() {
        let regs = ready_rcc();
        let mut rcc = Rcc::new(regs);

        let mut config = pll_config();
        config.clock_source = ClockSource::Hse;
        config.pll.n = 100;

        assert_eq!(rcc.init(&config), Ok(()));
        assert_eq!(word(regs, PLLCFGR), PLLCFGR_RESET);
        assert_eq!(word(regs, CR) & PLLON, 0);
        assert_eq!(word(regs, CFGR) & 0x3, ClockSource::Hse as u32);
    }

    #[test]
    fn pll_factors_land_in_pllcfgr() {
        let regs = ready_rcc();
        let mut rcc = Rcc::new(regs);

        rcc.init(&pll_config()).unwrap();

        // reserved bit 29 survives
        let expected = 0x2000_0000 | 25 | 336 << 6 | 1 << 16 | PLLSRC | 7 << 24;
        assert_eq!(word(regs, PLLCFGR), expected);
        assert_ne!(word(regs, CR) & PLLON, 0);
        assert_eq!(word(regs, CFGR) & 0x3, 2);
    }

    #[test]
    fn oscillators_follow_config() {
        let regs = ready_rcc();
        regs.cr().modify(|r, cr| unsafe { cr.bits(r.bits() | HSION | PLLI2SON) });
        let mut rcc = Rcc::new(regs);

        let mut config = pll_config();
        config.clock_source = ClockSource::Hse;
        config.oscillators = OscillatorConfig {
            hse: true,
            hsi: false,
            plli2s: false,
        };
        rcc.init(&config).unwrap();

        let cr = word(regs, CR);
        assert_ne!(cr & HSEON, 0);
        assert_eq!(cr & HSION, 0);
        assert_eq!(cr & PLLI2SON, 0);
    }

    #[test]
    fn prescalers_replace_previous_fields() {
        let regs = ready_rcc();
        regs.cfgr().write(|cfgr| unsafe { cfgr.bits(0xf << 4 | 0x7 << 10 | 0x7 << 13) });
        let mut rcc = Rcc::new(regs);

        let mut config = pll_config();
        config.ahb_prescaler = AhbPrescaler::Div4;
        config.apb1_prescaler = ApbPrescaler::Div2;
        config.apb2_prescaler = ApbPrescaler::Div1;
        rcc.init(&config).unwrap();

        let cfgr = word(regs, CFGR);
        assert_eq!((cfgr >> 4) & 0xf, 0b1001);
        assert_eq!((cfgr >> 10) & 0x7, 0b100);
        assert_eq!((cfgr >> 13) & 0x7, 0);
    }

    #[test]
    fn system_clock_reads_status_field() {
        let regs = ram_block::<rcc::RegisterBlock>();
        let mut rcc = Rcc::new(regs);

        rcc.switch_system_clock(ClockSource::Pll);
        assert_eq!(word(regs, CFGR) & 0x3, 2);

        // switch status lags the request until hardware confirms it
        assert_eq!(rcc.system_clock(), Some(ClockSource::Hsi));
        regs.cfgr().modify(|r, cfgr| unsafe { cfgr.bits(r.bits() | 2 << 2) });
        assert_eq!(rcc.system_clock(), Some(ClockSource::Pll));

        regs.cfgr().write(|cfgr| unsafe { cfgr.bits(3 << 2) });
        assert_eq!(rcc.system_clock(), None);
    }

    #[test]
    fn clock_gates() {
        let regs = ram_block::<rcc::RegisterBlock>();
        let mut rcc = Rcc::new(regs);

        rcc.set_clock_enabled(PeripheralClock::GpioH, true);
        rcc.set_clock_enabled(PeripheralClock::Dma2, true);
        assert_eq!(word(regs, AHB1ENR), 1 << 7 | 1 << 22);
        assert!(rcc.is_clock_enabled(PeripheralClock::Dma2));
        assert!(!rcc.is_clock_enabled(PeripheralClock::Dma1));

        rcc.set_clock_enabled(PeripheralClock::GpioH, false);
        assert_eq!(word(regs, AHB1ENR), 1 << 22);
    }
}
