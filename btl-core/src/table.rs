//! The main bootloader table: the fixed binary interface applications use to
//! call into the resident bootloader.
//!
//! The table is a `#[repr(C)]` struct of plain `extern "C"` function pointers
//! placed by the board at a known flash address. Field order and sizes are
//! part of the ABI and must not change within a layout version.
//!
//! Code reachable from these entries must not log: it executes in the
//! application's context.

use core::ffi::c_void;
use core::mem::MaybeUninit;
use core::slice;

use crate::config::{BootConfig, Capabilities, StorageSlot};
use crate::error::{InstallError, ParseError, BOOTLOADER_OK, STORAGE_INVALID_SLOT};
use crate::parser::{context_size, ParserCallbacks, ParserConfig, ParserContext};
use crate::props::ApplicationData;
use crate::security::SignatureVerifier;
use crate::verify::{ApplicationVerifier, MemoryMap};

/// Header `kind` of a main bootloader table.
pub const MAIN_BOOTLOADER_MAGIC: u32 = 0x5ECD_B007;
pub const MAIN_BOOTLOADER_LAYOUT: u32 = 0x0000_0002;
pub const STORAGE_FUNCTIONS_VERSION: u32 = 0x0001_0000;

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TableHeader {
    pub kind: u32,
    pub layout: u32,
    pub version: u32,
}

pub type StatusFn = extern "C" fn() -> i32;
pub type VerifyApplicationFn = unsafe extern "C" fn(start_address: u32) -> bool;
pub type InitParserFn = unsafe extern "C" fn(context: *mut c_void, size: usize) -> i32;
pub type ParseBufferFn = unsafe extern "C" fn(
    context: *mut c_void,
    callbacks: *const ParserCallbackTable,
    data: *const u8,
    len: usize,
) -> i32;
pub type ParseImageInfoFn = unsafe extern "C" fn(
    context: *mut c_void,
    data: *const u8,
    len: usize,
    application: *mut ApplicationData,
    bootloader_version: *mut u32,
) -> bool;
pub type WordFn = extern "C" fn() -> u32;
pub type PeripheralListFn = unsafe extern "C" fn(first: *mut u32, second: *mut u32);
pub type SlotInfoFn = unsafe extern "C" fn(slot: u32, info: *mut StorageSlot) -> i32;

/// Callback invoked with `(address_or_offset, data, len, context)`.
pub type DataCallbackFn =
    unsafe extern "C" fn(address: u32, data: *const u8, len: usize, context: *mut c_void);

#[repr(C)]
pub struct MainBootloaderTable {
    pub header: TableHeader,
    /// Size of the bootloader image in bytes.
    pub size: u32,
    pub start_of_app_space: u32,
    pub end_of_app_space: u32,
    pub capabilities: u32,
    pub init: StatusFn,
    pub deinit: StatusFn,
    pub verify_application: VerifyApplicationFn,
    pub init_parser: InitParserFn,
    pub parse_buffer: ParseBufferFn,
    pub storage: Option<&'static StorageFunctions>,
    pub parse_image_info: ParseImageInfoFn,
    pub parser_context_size: WordFn,
    pub remaining_application_upgrades: Option<WordFn>,
    pub get_peripheral_list: Option<PeripheralListFn>,
    pub get_upgrade_location: WordFn,
}

#[repr(C)]
pub struct StorageFunctions {
    pub version: u32,
    pub slot_count: WordFn,
    pub slot_info: SlotInfoFn,
}

/// What the board provides behind the table. Everything is `'static`
/// because applications call in at arbitrary times.
pub trait BootloaderServices: 'static {
    fn config() -> &'static BootConfig;
    /// Settings for parse sessions started through the table.
    fn parser_config() -> &'static ParserConfig;
    fn signature_verifier() -> &'static dyn SignatureVerifier;
    fn application_memory() -> &'static dyn MemoryMap;

    /// Whether the board tracks a remaining-upgrade budget.
    const TRACKS_UPGRADES: bool = false;

    fn init() -> i32 {
        BOOTLOADER_OK
    }

    fn deinit() -> i32 {
        BOOTLOADER_OK
    }

    fn remaining_application_upgrades() -> u32 {
        u32::MAX
    }

    /// Bitmasks of the peripherals the bootloader uses.
    fn peripheral_list() -> (u32, u32) {
        (0, 0)
    }
}

impl MainBootloaderTable {
    pub const fn new<B: BootloaderServices>(
        config: &BootConfig,
        storage: Option<&'static StorageFunctions>,
    ) -> Self {
        let remaining: Option<WordFn> = if B::TRACKS_UPGRADES {
            Some(remaining_application_upgrades::<B>)
        } else {
            None
        };
        let peripherals: Option<PeripheralListFn> =
            if config.capabilities.contains(Capabilities::PERIPHERAL_LIST) {
                Some(get_peripheral_list::<B>)
            } else {
                None
            };
        Self {
            header: TableHeader {
                kind: MAIN_BOOTLOADER_MAGIC,
                layout: MAIN_BOOTLOADER_LAYOUT,
                version: config.version,
            },
            size: config.bootloader.len(),
            start_of_app_space: config.application.start,
            end_of_app_space: config.application.end,
            capabilities: config.capabilities.bits(),
            init: init::<B>,
            deinit: deinit::<B>,
            verify_application: verify_application::<B>,
            init_parser: init_parser::<B>,
            parse_buffer: parse_buffer::<B>,
            storage,
            parse_image_info: parse_image_info::<B>,
            parser_context_size,
            remaining_application_upgrades: remaining,
            get_peripheral_list: peripherals,
            get_upgrade_location: get_upgrade_location::<B>,
        }
    }

    /// Whether `self` looks like a table written by this crate.
    pub fn is_valid(&self) -> bool {
        self.header.kind == MAIN_BOOTLOADER_MAGIC && self.header.layout == MAIN_BOOTLOADER_LAYOUT
    }
}

impl StorageFunctions {
    pub const fn new<B: BootloaderServices>() -> Self {
        Self {
            version: STORAGE_FUNCTIONS_VERSION,
            slot_count: slot_count::<B>,
            slot_info: slot_info::<B>,
        }
    }
}

/// Application-supplied callbacks for a parse session.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ParserCallbackTable {
    /// Passed back unchanged to every callback.
    pub context: *mut c_void,
    pub application: Option<DataCallbackFn>,
    pub metadata: Option<DataCallbackFn>,
    pub bootloader: Option<DataCallbackFn>,
}

impl ParserCallbackTable {
    pub const EMPTY: Self = Self {
        context: core::ptr::null_mut(),
        application: None,
        metadata: None,
        bootloader: None,
    };

    fn call(&self, callback: Option<DataCallbackFn>, address: u32, data: &[u8]) {
        if let Some(callback) = callback {
            // SAFETY: the application registered `callback` together with
            // `context` and guarantees they are valid for this session.
            unsafe { callback(address, data.as_ptr(), data.len(), self.context) }
        }
    }
}

impl ParserCallbacks for ParserCallbackTable {
    fn accepts_application(&self) -> bool {
        self.application.is_some()
    }

    fn application_data(&mut self, address: u32, data: &[u8]) -> Result<(), InstallError> {
        self.call(self.application, address, data);
        Ok(())
    }

    fn bootloader_data(&mut self, offset: u32, data: &[u8]) -> Result<(), InstallError> {
        self.call(self.bootloader, offset, data);
        Ok(())
    }

    fn metadata(&mut self, offset: u32, data: &[u8]) -> Result<(), InstallError> {
        self.call(self.metadata, offset, data);
        Ok(())
    }
}

unsafe fn input<'d>(data: *const u8, len: usize) -> &'d [u8] {
    if data.is_null() || len == 0 {
        &[]
    } else {
        slice::from_raw_parts(data, len)
    }
}

extern "C" fn init<B: BootloaderServices>() -> i32 {
    B::init()
}

extern "C" fn deinit<B: BootloaderServices>() -> i32 {
    B::deinit()
}

unsafe extern "C" fn verify_application<B: BootloaderServices>(start_address: u32) -> bool {
    ApplicationVerifier::new(B::config(), B::application_memory(), B::signature_verifier())
        .verify_application(start_address)
        .is_ok()
}

unsafe extern "C" fn init_parser<B: BootloaderServices>(context: *mut c_void, size: usize) -> i32 {
    if context.is_null() {
        return ParseError::Init.code();
    }
    let buffer = slice::from_raw_parts_mut(context.cast::<MaybeUninit<u8>>(), size);
    match ParserContext::init_in(buffer, B::parser_config(), B::signature_verifier()) {
        Ok(_) => BOOTLOADER_OK,
        Err(e) => e.code(),
    }
}

unsafe extern "C" fn parse_buffer<B: BootloaderServices>(
    context: *mut c_void,
    callbacks: *const ParserCallbackTable,
    data: *const u8,
    len: usize,
) -> i32 {
    if context.is_null() {
        return ParseError::Init.code();
    }
    let Some(ctx) = ParserContext::from_raw(context.cast()) else {
        return ParseError::Init.code();
    };
    let mut callbacks = callbacks.as_ref().copied().unwrap_or(ParserCallbackTable::EMPTY);
    ctx.parse_buffer(input(data, len), &mut callbacks).code()
}

unsafe extern "C" fn parse_image_info<B: BootloaderServices>(
    context: *mut c_void,
    data: *const u8,
    len: usize,
    application: *mut ApplicationData,
    bootloader_version: *mut u32,
) -> bool {
    if context.is_null() {
        return false;
    }
    let Some(ctx) = ParserContext::from_raw(context.cast()) else {
        return false;
    };
    let Ok(info) = ctx.parse_image_info(input(data, len)) else {
        return false;
    };
    if let Some(out) = application.as_mut() {
        *out = info.application;
    }
    if let Some(out) = bootloader_version.as_mut() {
        *out = info.bootloader_version;
    }
    true
}

extern "C" fn parser_context_size() -> u32 {
    context_size() as u32
}

extern "C" fn remaining_application_upgrades<B: BootloaderServices>() -> u32 {
    B::remaining_application_upgrades()
}

unsafe extern "C" fn get_peripheral_list<B: BootloaderServices>(first: *mut u32, second: *mut u32) {
    let (a, b) = B::peripheral_list();
    if let Some(out) = first.as_mut() {
        *out = a;
    }
    if let Some(out) = second.as_mut() {
        *out = b;
    }
}

extern "C" fn get_upgrade_location<B: BootloaderServices>() -> u32 {
    B::config().bootloader_upgrade_location.unwrap_or(0)
}

extern "C" fn slot_count<B: BootloaderServices>() -> u32 {
    B::config().storage_slots.len() as u32
}

unsafe extern "C" fn slot_info<B: BootloaderServices>(slot: u32, info: *mut StorageSlot) -> i32 {
    let Some(found) = B::config().storage_slots.get(slot as usize) else {
        return STORAGE_INVALID_SLOT;
    };
    match info.as_mut() {
        Some(out) => {
            *out = *found;
            BOOTLOADER_OK
        }
        None => STORAGE_INVALID_SLOT,
    }
}
