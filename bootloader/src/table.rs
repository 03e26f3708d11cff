//! The main bootloader table exported at 0x0800_0200.

use btl_core::security::{P256Verifier, SignatureVerifier};
use btl_core::table::{BootloaderServices, MainBootloaderTable, StorageFunctions};
use btl_core::verify::MemoryMap;
use btl_core::{BootConfig, ParserConfig};

use crate::board::{BOOT_CONFIG, CONFIG, TABLE_PARSER_CONFIG};
use crate::flash::FlashMemory;

pub struct Board;

impl BootloaderServices for Board {
    fn config() -> &'static BootConfig {
        &BOOT_CONFIG
    }

    fn parser_config() -> &'static ParserConfig {
        &TABLE_PARSER_CONFIG
    }

    fn signature_verifier() -> &'static dyn SignatureVerifier {
        &P256Verifier
    }

    fn application_memory() -> &'static dyn MemoryMap {
        &FlashMemory
    }
}

static STORAGE_FUNCTIONS: StorageFunctions = StorageFunctions::new::<Board>();

#[used]
#[link_section = ".btl_table"]
pub static MAIN_BOOTLOADER_TABLE: MainBootloaderTable =
    MainBootloaderTable::new::<Board>(&CONFIG, Some(&STORAGE_FUNCTIONS));
