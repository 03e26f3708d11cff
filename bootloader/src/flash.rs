//! Internal flash of the STM32F411: memory-mapped reads and register-level
//! programming.

use core::ptr::{read_volatile, write_volatile};

use btl_core::verify::MemoryMap;
use embedded_storage::nor_flash::{
    check_erase, check_read, check_write, ErrorType, NorFlash, NorFlashError, NorFlashErrorKind,
    ReadNorFlash,
};

use crate::board::{FLASH_BASE, FLASH_SIZE};

const FLASH_KEYR: *mut u32 = 0x4002_3C04 as *mut u32;
const FLASH_SR: *mut u32 = 0x4002_3C0C as *mut u32;
const FLASH_CR: *mut u32 = 0x4002_3C10 as *mut u32;

const KEY1: u32 = 0x4567_0123;
const KEY2: u32 = 0xCDEF_89AB;

const SR_BSY: u32 = 1 << 16;
/// OPERR, WRPERR, PGAERR, PGPERR, PGSERR, RDERR.
const SR_ERRORS: u32 = 0x1F2;
const SR_EOP: u32 = 1 << 0;

const CR_PG: u32 = 1 << 0;
const CR_SER: u32 = 1 << 1;
const CR_SNB_SHIFT: u32 = 3;
const CR_PSIZE_X32: u32 = 0b10 << 8;
const CR_STRT: u32 = 1 << 16;
const CR_LOCK: u32 = 1 << 31;

/// Sector start offsets. Sectors 0-3 are 16K, 4 is 64K, 5-7 are 128K.
const SECTORS: [u32; 8] = [
    0x0_0000, 0x0_4000, 0x0_8000, 0x0_C000, 0x1_0000, 0x2_0000, 0x4_0000, 0x6_0000,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlashError {
    Range(NorFlashErrorKind),
    /// Error bits from FLASH_SR.
    Hardware(u32),
}

impl NorFlashError for FlashError {
    fn kind(&self) -> NorFlashErrorKind {
        match self {
            FlashError::Range(kind) => *kind,
            FlashError::Hardware(_) => NorFlashErrorKind::Other,
        }
    }
}

impl From<NorFlashErrorKind> for FlashError {
    fn from(kind: NorFlashErrorKind) -> Self {
        FlashError::Range(kind)
    }
}

fn read_mapped(offset: u32, bytes: &mut [u8]) {
    let src = (FLASH_BASE + offset) as *const u8;
    for (i, byte) in bytes.iter_mut().enumerate() {
        // SAFETY: callers bounds-check against FLASH_SIZE.
        *byte = unsafe { read_volatile(src.add(i)) };
    }
}

/// Read-only, memory-mapped view of the whole flash.
#[derive(Clone, Copy, Debug, Default)]
pub struct FlashMemory;

impl ErrorType for FlashMemory {
    type Error = FlashError;
}

impl ReadNorFlash for FlashMemory {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        check_read(self, offset, bytes.len())?;
        read_mapped(offset, bytes);
        Ok(())
    }

    fn capacity(&self) -> usize {
        FLASH_SIZE as usize
    }
}

impl MemoryMap for FlashMemory {
    fn read(&self, address: u32, len: usize) -> Option<&[u8]> {
        let offset = address.checked_sub(FLASH_BASE)?;
        let end = offset.checked_add(u32::try_from(len).ok()?)?;
        if end > FLASH_SIZE {
            return None;
        }
        // SAFETY: the range lies inside memory-mapped flash, which is
        // readable and never written while a borrow is alive.
        Some(unsafe { core::slice::from_raw_parts(address as *const u8, len) })
    }
}

/// Relocks the flash controller until the next unlock sequence.
pub fn lock() {
    // SAFETY: setting LOCK is always permitted.
    unsafe { write_volatile(FLASH_CR, read_volatile(FLASH_CR) | CR_LOCK) }
}

/// Programming access to the flash controller.
pub struct InternalFlash {
    _private: (),
}

impl InternalFlash {
    /// # Safety
    /// At most one handle may program flash at a time.
    pub unsafe fn new() -> Self {
        Self { _private: () }
    }

    fn unlock(&mut self) {
        // SAFETY: the documented key sequence; a second sequence while
        // unlocked would fault, hence the check.
        unsafe {
            if read_volatile(FLASH_CR) & CR_LOCK != 0 {
                write_volatile(FLASH_KEYR, KEY1);
                write_volatile(FLASH_KEYR, KEY2);
            }
        }
    }

    fn wait_ready(&mut self) -> Result<(), FlashError> {
        // SAFETY: status register access.
        unsafe {
            while read_volatile(FLASH_SR) & SR_BSY != 0 {}
            let sr = read_volatile(FLASH_SR);
            // Flags are write-one-to-clear.
            write_volatile(FLASH_SR, sr & (SR_ERRORS | SR_EOP));
            match sr & SR_ERRORS {
                0 => Ok(()),
                errors => Err(FlashError::Hardware(errors)),
            }
        }
    }

    fn erase_sector(&mut self, sector: u32) -> Result<(), FlashError> {
        // SAFETY: controller is unlocked and idle.
        unsafe {
            write_volatile(FLASH_CR, CR_SER | (sector << CR_SNB_SHIFT) | CR_PSIZE_X32);
            write_volatile(FLASH_CR, read_volatile(FLASH_CR) | CR_STRT);
        }
        let result = self.wait_ready();
        // SAFETY: clears SER.
        unsafe { write_volatile(FLASH_CR, read_volatile(FLASH_CR) & !CR_SER) };
        result
    }

    fn program(&mut self, offset: u32, bytes: &[u8]) -> Result<(), FlashError> {
        // SAFETY: controller is unlocked; PG stays set only for this loop.
        unsafe { write_volatile(FLASH_CR, CR_PG | CR_PSIZE_X32) };
        let mut result = Ok(());
        for (i, word) in bytes.chunks_exact(4).enumerate() {
            let address = FLASH_BASE + offset + (i as u32) * 4;
            let value = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
            // SAFETY: `check_write` kept the range inside flash and aligned.
            unsafe { write_volatile(address as *mut u32, value) };
            result = self.wait_ready();
            if result.is_err() {
                break;
            }
        }
        // SAFETY: clears PG.
        unsafe { write_volatile(FLASH_CR, read_volatile(FLASH_CR) & !CR_PG) };
        result
    }
}

impl ErrorType for InternalFlash {
    type Error = FlashError;
}

impl ReadNorFlash for InternalFlash {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        check_read(self, offset, bytes.len())?;
        read_mapped(offset, bytes);
        Ok(())
    }

    fn capacity(&self) -> usize {
        FLASH_SIZE as usize
    }
}

impl NorFlash for InternalFlash {
    const WRITE_SIZE: usize = 4;
    /// Smallest sector. Erasing `[from, to)` erases every sector that
    /// starts inside the range, so larger sectors are erased whole when
    /// their first 16K is.
    const ERASE_SIZE: usize = 0x4000;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        check_erase(self, from, to)?;
        self.unlock();
        let mut result = Ok(());
        for (sector, start) in SECTORS.iter().enumerate() {
            if (from..to).contains(start) {
                result = self.erase_sector(sector as u32);
                if result.is_err() {
                    break;
                }
            }
        }
        lock();
        result
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        check_write(self, offset, bytes.len())?;
        self.unlock();
        let result = self.program(offset, bytes);
        lock();
        result
    }
}
