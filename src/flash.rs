use core::ops::Deref;
use core::ptr;

use stm32f4::stm32f401::{flash, FLASH};

use crate::log;
use crate::HalError;

/// Start of flash memory in address space.
pub const FLASH_BASE_ADDR: usize = 0x0800_0000;
/// Size of flash memory on the STM32F401RC.
pub const FLASH_SIZE: usize = 0x4_0000;

/// The required alignment of each program operation.
const ADDR_ALIGN: usize = 4;

/// Value of an erased flash word.
const ERASED_BYTE: u8 = 0xff;

// key sequences that unlock CR and OPTCR
const CR_KEY_1: u32 = 0x4567_0123;
const CR_KEY_2: u32 = 0xcdef_89ab;
const OPT_KEY_1: u32 = 0x0819_2a3b;
const OPT_KEY_2: u32 = 0x4c5d_6e7f;

// sr error flags: operr, wrperr, pgaerr, pgperr, pgserr, rderr
const SR_ERRORS: u32 = 1 << 1 | 0x1f << 4;

/// CR.PSIZE for 32 bit parallelism.
const PSIZE_X32: u8 = 0b10;

/// Position of the active low nWRP bits in OPTCR.
const OPTCR_NWRP_POS: u8 = 16;

/// Flash sectors of the STM32F401RC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Sector {
    /// 16 KiB at 0x0800_0000
    S0,
    /// 16 KiB at 0x0800_4000
    S1,
    /// 16 KiB at 0x0800_8000
    S2,
    /// 16 KiB at 0x0800_c000
    S3,
    /// 64 KiB at 0x0801_0000
    S4,
    /// 128 KiB at 0x0802_0000
    S5,
}

impl Sector {
    pub const ALL: [Sector; 6] = [
        Sector::S0,
        Sector::S1,
        Sector::S2,
        Sector::S3,
        Sector::S4,
        Sector::S5,
    ];

    /// Sector number as written to CR.SNB.
    pub const fn number(self) -> u8 {
        self as u8
    }

    /// First address of the sector.
    pub const fn start(self) -> usize {
        match self {
            Sector::S0 => 0x0800_0000,
            Sector::S1 => 0x0800_4000,
            Sector::S2 => 0x0800_8000,
            Sector::S3 => 0x0800_c000,
            Sector::S4 => 0x0801_0000,
            Sector::S5 => 0x0802_0000,
        }
    }

    /// Size of the sector in bytes.
    pub const fn size(self) -> usize {
        match self {
            Sector::S0 | Sector::S1 | Sector::S2 | Sector::S3 => 0x4000,
            Sector::S4 => 0x1_0000,
            Sector::S5 => 0x2_0000,
        }
    }

    /// Sector holding `address`, if it is a flash address.
    pub fn containing(address: usize) -> Option<Sector> {
        Sector::ALL
            .into_iter()
            .find(|sector| (sector.start()..sector.start() + sector.size()).contains(&address))
    }
}

/// Read protection level stored in the RDP option byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ReadProtection {
    /// No protection.
    Level0,
    /// Debug access to flash disabled. Going back to level 0 mass erases the chip.
    Level1,
    /// Debug disabled for good. This can never be undone.
    Level2,
}

impl ReadProtection {
    const fn rdp(self) -> u8 {
        match self {
            ReadProtection::Level0 => 0xaa,
            ReadProtection::Level1 => 0xbb,
            ReadProtection::Level2 => 0xcc,
        }
    }
}

/// Used to interact with the STM32F401 flash memory.
///
/// Erases sectors, programs words and changes the protection option bytes.
/// The controller is unlocked for the duration of each operation only.
pub struct Flash<R = FLASH> {
    regs: R,
    /// Address flash memory is read and programmed through.
    memory: usize,
}

impl<R: Deref<Target = flash::RegisterBlock>> Flash<R> {
    /// Creates a new Flash instance from the flash interface registers.
    pub(crate) fn new(regs: R) -> Self {
        Self::with_memory(regs, FLASH_BASE_ADDR)
    }

    /// Same as [`Flash::new`], programming through `memory` instead of the flash address space.
    pub(crate) fn with_memory(regs: R, memory: usize) -> Self {
        Flash { regs, memory }
    }

    /// Busy waits until the flash controller reports the pending operation has finished.
    fn await_not_busy(&self) {
        while self.regs.sr().read().bsy().bit_is_set() {}
    }

    fn unlock(&mut self) -> Result<(), HalError> {
        if self.regs.cr().read().lock().bit_is_clear() {
            return Ok(());
        }

        // safety: the key register accepts any value, wrong keys only lock it until reset
        self.regs.keyr().write(|keyr| unsafe { keyr.key().bits(CR_KEY_1) });
        self.regs.keyr().write(|keyr| unsafe { keyr.key().bits(CR_KEY_2) });

        if self.regs.cr().read().lock().bit_is_set() {
            log::warning!("flash: control register did not unlock");
            Err(HalError::FlashLocked)
        } else {
            Ok(())
        }
    }

    fn unlock_option_bytes(&mut self) -> Result<(), HalError> {
        if self.regs.optcr().read().optlock().bit_is_clear() {
            return Ok(());
        }

        // safety: as for the control register keys
        self.regs.optkeyr().write(|optkeyr| unsafe { optkeyr.optkeyr().bits(OPT_KEY_1) });
        self.regs.optkeyr().write(|optkeyr| unsafe { optkeyr.optkeyr().bits(OPT_KEY_2) });

        if self.regs.optcr().read().optlock().bit_is_set() {
            log::warning!("flash: option bytes did not unlock");
            Err(HalError::FlashLocked)
        } else {
            Ok(())
        }
    }

    /// Reports the error flags the last operation left in SR, and clears them.
    fn get_and_clear_error(&mut self) -> Result<(), HalError> {
        let errors = self.regs.sr().read().bits() & SR_ERRORS;
        if errors == 0 {
            return Ok(());
        }

        // safety: error flags are write one to clear, other bits ignore writes
        self.regs.sr().write(|sr| unsafe { sr.bits(errors) });
        log::warning!("flash: operation failed, sr {=u32:#x}", errors);
        Err(HalError::FlashOperation(errors))
    }

    /// Runs `operation` with the control register unlocked, then waits for it,
    /// collects its errors and locks the controller again.
    fn run(&mut self, operation: impl FnOnce(&mut Self)) -> Result<(), HalError> {
        self.await_not_busy();
        self.unlock()?;

        operation(self);
        self.await_not_busy();

        let result = self.get_and_clear_error();

        // safety: zero is a valid sector number and parallelism
        self.regs.cr().modify(|_, cr| unsafe {
            cr.pg()
                .clear_bit()
                .ser()
                .clear_bit()
                .mer()
                .clear_bit()
                .snb()
                .bits(0)
                .psize()
                .bits(0)
        });
        self.regs.cr().modify(|_, cr| cr.lock().set_bit());

        result
    }

    /// Same as [`Flash::run`] for the option control register.
    fn run_option_bytes<F>(&mut self, update: F) -> Result<(), HalError>
    where
        F: for<'w> FnOnce(&flash::optcr::R, &'w mut flash::optcr::W) -> &'w mut flash::optcr::W,
    {
        self.await_not_busy();
        self.unlock_option_bytes()?;

        self.regs.optcr().modify(update);
        self.regs.optcr().modify(|_, optcr| optcr.optstrt().set_bit());
        self.await_not_busy();

        let result = self.get_and_clear_error();

        self.regs.optcr().modify(|_, optcr| optcr.optlock().set_bit());

        result
    }

    /// Erases the given sector.
    ///
    /// # Safety
    ///
    /// Must not erase any sector with executable code, or any sector that a reference
    /// currently points to.
    pub unsafe fn erase_sector(&mut self, sector: Sector) -> Result<(), HalError> {
        log::debug!("flash: erasing sector {}", sector);

        self.run(|flash| {
            // safety: sector numbers and PSIZE_X32 are defined field encodings
            flash.regs.cr().modify(|_, cr| unsafe {
                cr.pg()
                    .clear_bit()
                    .mer()
                    .clear_bit()
                    .ser()
                    .set_bit()
                    .snb()
                    .bits(sector.number())
                    .psize()
                    .bits(PSIZE_X32)
            });
            flash.regs.cr().modify(|_, cr| cr.strt().set_bit());
        })
    }

    /// Erases every sector.
    ///
    /// # Safety
    ///
    /// Erases the running program as well; only code executing from RAM may call this.
    pub unsafe fn erase_mass(&mut self) -> Result<(), HalError> {
        log::debug!("flash: mass erase");

        self.run(|flash| {
            // safety: PSIZE_X32 is a defined field encoding
            flash.regs.cr().modify(|_, cr| unsafe {
                cr.pg()
                    .clear_bit()
                    .ser()
                    .clear_bit()
                    .mer()
                    .set_bit()
                    .psize()
                    .bits(PSIZE_X32)
            });
            flash.regs.cr().modify(|_, cr| cr.strt().set_bit());
        })
    }

    /// Programs one word at a 4 byte aligned flash address.
    ///
    /// # Safety
    ///
    /// Must not write to any bytes with executable code, or any bytes that a reference
    /// currently points to.
    pub unsafe fn program(&mut self, address: usize, data: u32) -> Result<(), HalError> {
        if address % ADDR_ALIGN != 0
            || !(FLASH_BASE_ADDR..FLASH_BASE_ADDR + FLASH_SIZE).contains(&address)
        {
            log::warning!("flash: cannot program {=usize:#x}", address);
            return Err(HalError::FlashAddress);
        }

        self.run(|flash| {
            // safety: PSIZE_X32 is a defined field encoding
            flash.regs.cr().modify(|_, cr| unsafe {
                cr.ser()
                    .clear_bit()
                    .mer()
                    .clear_bit()
                    .psize()
                    .bits(PSIZE_X32)
                    .pg()
                    .set_bit()
            });

            let target = flash.memory + (address - FLASH_BASE_ADDR);
            // safety: address was checked to be an aligned word of flash memory
            unsafe { ptr::write_volatile(target as *mut u32, data) };
        })
    }

    /// Writes the bytes to the given address, one word at a time.
    ///
    /// If the length is not a multiple of 4, the last word is padded with erased bytes.
    ///
    /// # Safety
    ///
    /// Same as [`Flash::program`] for every word written.
    pub unsafe fn write(&mut self, address: usize, data: &[u8]) -> Result<(), HalError> {
        let end = address
            .checked_add(crate::align_up(data.len(), ADDR_ALIGN))
            .ok_or(HalError::FlashAddress)?;
        if address % ADDR_ALIGN != 0 || end > FLASH_BASE_ADDR + FLASH_SIZE {
            return Err(HalError::FlashAddress);
        }

        let chunks = data.chunks_exact(ADDR_ALIGN);
        let remainder = chunks.remainder();

        for (i, chunk) in chunks.enumerate() {
            let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            // safety: forwarded from the caller
            unsafe { self.program(address + ADDR_ALIGN * i, word)? };
        }

        if remainder.is_empty() {
            return Ok(());
        }

        let mut buf = [ERASED_BYTE; ADDR_ALIGN];
        buf[..remainder.len()].copy_from_slice(remainder);

        let last_word_addr = crate::align_down(address + data.len(), ADDR_ALIGN);
        // safety: forwarded from the caller
        unsafe { self.program(last_word_addr, u32::from_le_bytes(buf)) }
    }

    /// Changes the read protection option byte.
    pub fn set_read_protection(&mut self, level: ReadProtection) -> Result<(), HalError> {
        log::debug!("flash: read protection {}", level);

        // safety: rdp accepts any byte, every level is one of the defined ones
        self.run_option_bytes(|_, optcr| unsafe { optcr.rdp().bits(level.rdp()) })
    }

    /// Write protects the given sector.
    pub fn set_write_protection(&mut self, sector: Sector) -> Result<(), HalError> {
        log::debug!("flash: write protecting sector {}", sector);

        // nWRP bits are active low
        let bit = 1 << (OPTCR_NWRP_POS + sector.number());
        // safety: only the sector's own nWRP bit changes
        self.run_option_bytes(|r, optcr| unsafe { optcr.bits(r.bits() & !bit) })
    }

    /// Returns true if the option bytes write protect `sector`.
    pub fn is_write_protected(&self, sector: Sector) -> bool {
        self.regs.optcr().read().bits() & 1 << (OPTCR_NWRP_POS + sector.number()) == 0
    }
}
