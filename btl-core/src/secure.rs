//! Secure world setup on TrustZone parts.
//!
//! [`SecureWorldInitializer::prepare`] attributes peripherals, bus masters,
//! interrupts and memory, then locks the configuration and the bootloader
//! flash. The lock runs on every exit from `prepare`, including failures,
//! and the non-secure jump needs the [`Locked`] token that only `prepare`
//! hands out.

use crate::config::FlashRegion;
use crate::reset::{PersistentBootState, ResetReason, RetainedWord};

/// SAU regions are 32-byte granular.
const SAU_GRANULE: u32 = 32;
pub const MAX_SAU_REGIONS: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SauAttribute {
    Secure,
    NonSecureCallable,
    NonSecure,
}

/// Inclusive `[start, limit]` address range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SauRegion {
    pub start: u32,
    pub limit: u32,
    pub attribute: SauAttribute,
}

impl SauRegion {
    fn is_valid(&self) -> bool {
        self.start % SAU_GRANULE == 0
            && (self.limit.wrapping_add(1)) % SAU_GRANULE == 0
            && self.start < self.limit
    }
}

/// Partitioning applied before the non-secure image runs. Anything not
/// listed stays secure.
#[derive(Clone, Copy, Debug)]
pub struct SecureWorldConfig {
    pub sau_regions: &'static [SauRegion],
    pub non_secure_peripherals: &'static [u16],
    pub non_secure_bus_masters: &'static [u16],
    pub non_secure_interrupts: &'static [u16],
    pub non_secure_vector_table: u32,
    pub bootloader_flash: FlashRegion,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HardwareError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SecureInitError {
    Peripheral(u16),
    BusMaster(u16),
    Interrupt(u16),
    SauRegion(u8),
    TooManySauRegions,
    /// No plausible vector table at the non-secure entry.
    NoNonSecureImage,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NonSecureEntry {
    pub stack_pointer: u32,
    pub reset_handler: u32,
}

/// Proof that the security configuration has been locked.
#[derive(Debug)]
pub struct Locked(());

/// Register-level access to the security attribution hardware.
pub trait SecurityController {
    fn configure_peripheral(&mut self, peripheral: u16) -> Result<(), HardwareError>;
    fn configure_bus_master(&mut self, master: u16) -> Result<(), HardwareError>;
    fn route_interrupt_to_non_secure(&mut self, irq: u16) -> Result<(), HardwareError>;
    fn program_sau_region(&mut self, index: u8, region: &SauRegion) -> Result<(), HardwareError>;
    fn enable_sau(&mut self);
    /// Sets the SAU/SMU lock bits. Must not fail.
    fn lock(&mut self);
    fn lock_bootloader_flash(&mut self, region: FlashRegion);
    fn read_word(&self, address: u32) -> u32;
    /// Loads the non-secure stack pointer and branches to the non-secure
    /// reset handler. Returns only if that handler returns.
    fn jump_to_non_secure(&mut self, entry: NonSecureEntry, locked: &Locked);
    fn system_reset(&mut self) -> !;
}

pub struct SecureWorldInitializer<'a, C> {
    config: &'a SecureWorldConfig,
    controller: C,
}

impl<'a, C: SecurityController> SecureWorldInitializer<'a, C> {
    pub fn new(config: &'a SecureWorldConfig, controller: C) -> Self {
        Self { config, controller }
    }

    pub fn controller(&self) -> &C {
        &self.controller
    }

    /// Configures and locks the secure world. The lock is applied whether or
    /// not configuration succeeded.
    pub fn prepare(&mut self) -> Result<(NonSecureEntry, Locked), SecureInitError> {
        let configured = self.configure();
        self.controller.lock();
        self.controller.lock_bootloader_flash(self.config.bootloader_flash);
        let locked = Locked(());

        configured?;
        let entry = self.non_secure_entry()?;
        Ok((entry, locked))
    }

    /// Prepares, jumps, and resets with `Fatal` if either fails or the
    /// non-secure world comes back.
    pub fn run<W: RetainedWord>(mut self, state: &mut PersistentBootState<W>) -> ! {
        match self.prepare() {
            Ok((entry, locked)) => {
                info!("secure: entering non-secure world at {:#x}", entry.reset_handler);
                self.controller.jump_to_non_secure(entry, &locked);
                error!("secure: non-secure world returned");
            }
            Err(e) => error!("secure: setup failed: {}", e),
        }
        state.set_reason(ResetReason::Fatal);
        self.controller.system_reset()
    }

    fn configure(&mut self) -> Result<(), SecureInitError> {
        let config = self.config;
        for &peripheral in config.non_secure_peripherals {
            self.controller
                .configure_peripheral(peripheral)
                .map_err(|_| SecureInitError::Peripheral(peripheral))?;
        }
        for &master in config.non_secure_bus_masters {
            self.controller
                .configure_bus_master(master)
                .map_err(|_| SecureInitError::BusMaster(master))?;
        }
        for &irq in config.non_secure_interrupts {
            self.controller
                .route_interrupt_to_non_secure(irq)
                .map_err(|_| SecureInitError::Interrupt(irq))?;
        }

        if config.sau_regions.len() > MAX_SAU_REGIONS {
            return Err(SecureInitError::TooManySauRegions);
        }
        for (index, region) in config.sau_regions.iter().enumerate() {
            let index = index as u8;
            if !region.is_valid() {
                return Err(SecureInitError::SauRegion(index));
            }
            self.controller
                .program_sau_region(index, region)
                .map_err(|_| SecureInitError::SauRegion(index))?;
        }
        self.controller.enable_sau();
        Ok(())
    }

    fn non_secure_entry(&self) -> Result<NonSecureEntry, SecureInitError> {
        let table = self.config.non_secure_vector_table;
        let stack_pointer = self.controller.read_word(table);
        let reset_handler = self.controller.read_word(table + 4);
        if reset_handler == 0xFFFF_FFFF || reset_handler & 1 == 0 || stack_pointer == 0xFFFF_FFFF
        {
            return Err(SecureInitError::NoNonSecureImage);
        }
        Ok(NonSecureEntry {
            stack_pointer,
            reset_handler,
        })
    }
}
