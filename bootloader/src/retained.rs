//! Reset reason and counter cells at the top of RAM.
//!
//! The linker script keeps the last 8 bytes of RAM out of the runtime's
//! reach, so these words survive a warm reset. Applications write the reason
//! cell directly.

use core::ptr::{read_volatile, write_volatile};

use btl_core::{PersistentBootState, RetainedWord};

pub const REASON_ADDR: u32 = 0x2001_FFF8;
pub const COUNTER_ADDR: u32 = 0x2001_FFFC;

/// One retained RAM word, accessed with volatile loads and stores only.
pub struct RetainedCell(*mut u32);

impl RetainedWord for RetainedCell {
    fn load(&self) -> u32 {
        // SAFETY: points into the reserved RAM words, which are always mapped.
        unsafe { read_volatile(self.0) }
    }

    fn store(&mut self, value: u32) {
        // SAFETY: as above.
        unsafe { write_volatile(self.0, value) }
    }
}

/// Safe to call before `.data` and `.bss` are initialized.
pub fn boot_state() -> PersistentBootState<RetainedCell> {
    PersistentBootState::new(
        RetainedCell(REASON_ADDR as *mut u32),
        RetainedCell(COUNTER_ADDR as *mut u32),
    )
}
