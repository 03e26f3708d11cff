//! Black Pill (STM32F411CE) layout, policy and boot-time inputs.

use core::ptr::{read_volatile, write_volatile};

use btl_core::engine::ActivationSource;
use btl_core::{BootConfig, Capabilities, FlashRegion, ParserConfig, ResetCause, StorageSlot};

pub const FLASH_BASE: u32 = 0x0800_0000;
pub const FLASH_SIZE: u32 = 512 * 1024;

/// HSI, the clock the core runs on out of reset.
pub const SYSCLK_HZ: u32 = 16_000_000;

/// Sectors 6 and 7 of internal flash.
const STORAGE_SLOTS: &[StorageSlot] = &[StorageSlot {
    address: 0x0004_0000,
    size: 0x0004_0000,
}];

/// Development signing key. Its private scalar is 1; replace before shipping.
const PUBLIC_KEY: [u8; 64] = [
    0x6B, 0x17, 0xD1, 0xF2, 0xE1, 0x2C, 0x42, 0x47, 0xF8, 0xBC, 0xE6, 0xE5, 0x63, 0xA4, 0x40, 0xF2,
    0x77, 0x03, 0x7D, 0x81, 0x2D, 0xEB, 0x33, 0xA0, 0xF4, 0xA1, 0x39, 0x45, 0xD8, 0x98, 0xC2, 0x96,
    0x4F, 0xE3, 0x42, 0xE2, 0xFE, 0x1A, 0x7F, 0x9B, 0x8E, 0xE7, 0xEB, 0x4A, 0x7C, 0x0F, 0x9E, 0x16,
    0x2B, 0xCE, 0x33, 0x57, 0x6B, 0x31, 0x5E, 0xCE, 0xCB, 0xB6, 0x40, 0x68, 0x37, 0xBF, 0x51, 0xF5,
];

/// Upgrades must be signed and may not roll back.
const UPGRADE_POLICY: Capabilities = Capabilities::ENFORCE_UPGRADE_SIGNATURE
    .union(Capabilities::ROLLBACK_PROTECTION)
    .union(Capabilities::GBL)
    .union(Capabilities::GBL_SIGNATURE)
    .union(Capabilities::STORAGE);

/// Without the `secure-boot` feature the installed application is only
/// sanity checked before entry. This is a development policy for the
/// unsigned demo app; production builds enable `secure-boot`, which
/// requires a signed properties block in the application.
const CAPABILITIES: Capabilities = if cfg!(feature = "secure-boot") {
    UPGRADE_POLICY.union(Capabilities::ENFORCE_SECURE_BOOT)
} else {
    UPGRADE_POLICY
};

pub const CONFIG: BootConfig = BootConfig {
    version: 0x0001_0000,
    flash_base: FLASH_BASE,
    bootloader: FlashRegion::new(0x0800_0000, 0x0801_0000),
    application: FlashRegion::new(0x0801_0000, 0x0804_0000),
    bootloader_upgrade_location: None,
    storage_slots: STORAGE_SLOTS,
    public_key: PUBLIC_KEY,
    capabilities: CAPABILITIES,
    lock_bootloader_on_exit: true,
    lock_application_on_exit: false,
    reset_counter_limit: 2,
    recovery_delay_ms: 500,
};

pub static BOOT_CONFIG: BootConfig = CONFIG;

/// Parser settings for sessions started by applications through the table.
pub static TABLE_PARSER_CONFIG: ParserConfig = CONFIG.parser_config(None);

const RCC_AHB1ENR: *mut u32 = 0x4002_3830 as *mut u32;
const RCC_CSR: *mut u32 = 0x4002_3874 as *mut u32;

const CSR_RMVF: u32 = 1 << 24;
const CSR_BORRSTF: u32 = 1 << 25;
const CSR_PINRSTF: u32 = 1 << 26;
const CSR_PORRSTF: u32 = 1 << 27;
const CSR_SFTRSTF: u32 = 1 << 28;
const CSR_IWDGRSTF: u32 = 1 << 29;
const CSR_WWDGRSTF: u32 = 1 << 30;
const CSR_LPWRRSTF: u32 = 1 << 31;

/// Reads and clears the reset flags. Register access only.
pub fn take_reset_cause() -> ResetCause {
    // SAFETY: RCC_CSR is a valid, always-clocked register.
    let csr = unsafe { read_volatile(RCC_CSR) };
    unsafe { write_volatile(RCC_CSR, csr | CSR_RMVF) };

    let mut cause = ResetCause::empty();
    for (flag, bit) in [
        (CSR_PORRSTF, ResetCause::POWER_ON),
        (CSR_BORRSTF, ResetCause::BROWN_OUT),
        (CSR_PINRSTF, ResetCause::PIN),
        (CSR_SFTRSTF, ResetCause::SOFTWARE),
        (CSR_IWDGRSTF | CSR_WWDGRSTF, ResetCause::WATCHDOG),
        (CSR_LPWRRSTF, ResetCause::LOCKUP),
    ] {
        if csr & flag != 0 {
            cause |= bit;
        }
    }
    cause
}

const GPIOA: u32 = 0x4002_0000;
const GPIOA_PUPDR: *mut u32 = (GPIOA + 0x0C) as *mut u32;
const GPIOA_IDR: *const u32 = (GPIOA + 0x10) as *const u32;
const AHB1ENR_GPIOAEN: u32 = 1 << 0;

/// KEY button on PA0, active low with the internal pull-up.
pub struct ActivationButton {
    ahb1enr: u32,
    pupdr: u32,
}

impl ActivationButton {
    /// Clocks GPIOA and enables the pull-up. [`Drop`] restores both.
    pub fn new() -> Self {
        // SAFETY: register-level access, nothing else runs this early.
        unsafe {
            let ahb1enr = read_volatile(RCC_AHB1ENR);
            write_volatile(RCC_AHB1ENR, ahb1enr | AHB1ENR_GPIOAEN);
            let pupdr = read_volatile(GPIOA_PUPDR);
            write_volatile(GPIOA_PUPDR, (pupdr & !0b11) | 0b01);
            Self { ahb1enr, pupdr }
        }
    }
}

impl ActivationSource for ActivationButton {
    fn is_asserted(&mut self) -> bool {
        // Let the pull-up charge the line before sampling.
        cortex_m::asm::delay(SYSCLK_HZ / 1000);
        let mut pressed = 0;
        for _ in 0..8 {
            // SAFETY: read-only input data register.
            if unsafe { read_volatile(GPIOA_IDR) } & 1 == 0 {
                pressed += 1;
            }
            cortex_m::asm::delay(SYSCLK_HZ / 10_000);
        }
        pressed == 8
    }
}

impl Drop for ActivationButton {
    fn drop(&mut self) {
        // SAFETY: restores the values read in `new`.
        unsafe {
            write_volatile(GPIOA_PUPDR, self.pupdr);
            write_volatile(RCC_AHB1ENR, self.ahb1enr);
        }
    }
}
