//! Compile-time bootloader configuration supplied by the board crate.

use bitflags::bitflags;

use crate::parser::ParserConfig;

bitflags! {
    /// Capability and policy bits advertised in the bootloader table.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        const ENFORCE_UPGRADE_SIGNATURE = 1 << 0;
        const ENFORCE_UPGRADE_ENCRYPTION = 1 << 1;
        const ENFORCE_SECURE_BOOT = 1 << 2;
        const BOOTLOADER_UPGRADE = 1 << 4;
        const ENFORCE_CERTIFICATE_SECURE_BOOT = 1 << 5;
        const ROLLBACK_PROTECTION = 1 << 6;
        const PERIPHERAL_LIST = 1 << 7;
        const GBL = 1 << 16;
        const GBL_SIGNATURE = 1 << 17;
        const GBL_ENCRYPTION = 1 << 18;
        const COMMUNICATION = 1 << 20;
        const STORAGE = 1 << 24;
    }
}

/// Half-open address range `[start, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FlashRegion {
    pub start: u32,
    pub end: u32,
}

impl FlashRegion {
    pub const fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub const fn len(&self) -> u32 {
        self.end - self.start
    }

    pub const fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub const fn contains(&self, address: u32) -> bool {
        address >= self.start && address < self.end
    }

    /// True if `[address, address + len)` lies fully inside the region.
    pub fn contains_range(&self, address: u32, len: u32) -> bool {
        match address.checked_add(len) {
            Some(end) => address >= self.start && end <= self.end,
            None => false,
        }
    }
}

/// Upgrade slot on the storage device. `address` is a device offset.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StorageSlot {
    pub address: u32,
    pub size: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct BootConfig {
    /// Bootloader version reported in the table header.
    pub version: u32,
    /// Address of offset 0 of the application flash device.
    pub flash_base: u32,
    pub bootloader: FlashRegion,
    pub application: FlashRegion,
    /// Where a new bootloader image is staged, if bootloader upgrades are supported.
    pub bootloader_upgrade_location: Option<u32>,
    pub storage_slots: &'static [StorageSlot],
    /// Uncompressed P-256 public key, `X || Y`.
    pub public_key: [u8; 64],
    pub capabilities: Capabilities,
    pub lock_bootloader_on_exit: bool,
    pub lock_application_on_exit: bool,
    /// Automatic recovery halts once the reset counter reaches this value.
    pub reset_counter_limit: u16,
    pub recovery_delay_ms: u32,
}

impl BootConfig {
    /// Parser settings for an upgrade session. `installed_version` is the
    /// version of the application currently in flash, used as the rollback floor.
    pub const fn parser_config(&self, installed_version: Option<u32>) -> ParserConfig {
        let rollback = self.capabilities.contains(Capabilities::ROLLBACK_PROTECTION);
        ParserConfig {
            application_start: self.application.start,
            bootloader_base: self.bootloader.start,
            bootloader_upgrade_location: self.bootloader_upgrade_location,
            public_key: self.public_key,
            require_signature: self
                .capabilities
                .contains(Capabilities::ENFORCE_UPGRADE_SIGNATURE),
            require_encryption: self
                .capabilities
                .contains(Capabilities::ENFORCE_UPGRADE_ENCRYPTION),
            minimum_application_version: if rollback { installed_version } else { None },
        }
    }
}
