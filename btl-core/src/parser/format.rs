//! GBL container constants.
//!
//! A GBL file is a sequence of tags, each a little-endian `{id: u32, length: u32}`
//! header followed by `length` bytes of payload.

pub const TAG_HEADER_V3: u32 = 0x03A6_17EB;
pub const TAG_BOOTLOADER: u32 = 0xF509_09F5;
pub const TAG_APPLICATION: u32 = 0xF40A_0AF4;
pub const TAG_METADATA: u32 = 0xF608_08F6;
pub const TAG_PROG: u32 = 0xFE01_01FE;
pub const TAG_ERASEPROG: u32 = 0xFD03_03FD;
pub const TAG_END: u32 = 0xFC04_04FC;
pub const TAG_ENC_INIT: u32 = 0xFA06_06FA;
pub const TAG_ENC_GBL_DATA: u32 = 0xF907_07F9;
pub const TAG_SIGNATURE_ECDSA_P256: u32 = 0xF70A_0AF7;

pub const TAG_HEADER_SIZE: usize = 8;

/// Payload of the header tag: `{version: u32, type: u32}`.
pub const HEADER_PAYLOAD_SIZE: u32 = 8;
pub const VERSION_MAJOR_MASK: u32 = 0xFF00_0000;
pub const VERSION_MAJOR: u32 = 0x0300_0000;
pub const VERSION_CURRENT: u32 = 0x0300_0000;

pub const TYPE_ENCRYPTION_AESCCM: u32 = 1 << 0;
pub const TYPE_SIGNATURE_ECDSA: u32 = 1 << 8;

/// `{msg_len: u32, nonce: [u8; 12]}`.
pub const ENC_INIT_SIZE: u32 = 16;
/// `{version: u32, base_address: u32}` before the bootloader payload.
pub const BOOTLOADER_HEADER_SIZE: u32 = 8;
pub const PROG_ADDRESS_SIZE: u32 = 4;
pub const SIGNATURE_SIZE: u32 = 64;
pub const END_SIZE: u32 = 4;

/// Vector table bytes withheld from an application image until it is
/// verified: the reset vector and the five fault vectors after it.
pub const WITHHELD_APPLICATION_VECTORS: usize = 24;
