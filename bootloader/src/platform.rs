//! Control transfer, reset and delays on Cortex-M4.

use core::ptr::write_volatile;

use btl_core::engine::Platform;
use btl_core::verify::AppEntry;
use btl_core::FlashRegion;
use embedded_hal::delay::DelayNs;

use crate::board::SYSCLK_HZ;
use crate::flash;

const SCB_VTOR: *mut u32 = 0xE000_ED08 as *mut u32;

pub struct Stm32Platform;

impl Platform for Stm32Platform {
    /// The F411 can only write-protect through option bytes, which persist
    /// across resets. Relocking the controller is what this part offers.
    fn lock_region(&mut self, _region: FlashRegion) {
        flash::lock();
    }

    fn transfer_control(&mut self, entry: AppEntry) -> ! {
        cortex_m::interrupt::disable();
        // SAFETY: `entry` comes from a verified vector table.
        unsafe {
            write_volatile(SCB_VTOR, entry.vector_table);
            cortex_m::asm::dsb();
            cortex_m::asm::isb();
            cortex_m::asm::bootload(entry.vector_table as *const u32)
        }
    }

    fn system_reset(&mut self) -> ! {
        cortex_m::asm::dsb();
        cortex_m::peripheral::SCB::sys_reset()
    }

    fn halt(&mut self) -> ! {
        loop {
            cortex_m::asm::nop();
        }
    }
}

/// Cycle-counted busy wait at the reset clock.
pub struct SpinDelay;

impl DelayNs for SpinDelay {
    fn delay_ns(&mut self, ns: u32) {
        let cycles = u64::from(ns) * u64::from(SYSCLK_HZ) / 1_000_000_000;
        cortex_m::asm::delay(cycles.max(1) as u32);
    }

    fn delay_ms(&mut self, ms: u32) {
        for _ in 0..ms {
            cortex_m::asm::delay(SYSCLK_HZ / 1000);
        }
    }
}
