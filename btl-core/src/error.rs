//! Error types and their numeric codes at the bootloader table boundary.

use core::fmt;

/// Operation completed.
pub const BOOTLOADER_OK: i32 = 0;

const STORAGE_BASE: i32 = 0x0500;
const PARSER_BASE: i32 = 0x1000;
const PARSE_BASE: i32 = 0x1100;

/// Parse session ended without a verified image.
pub const PARSE_FAILED: i32 = PARSE_BASE + 0x01;
/// An installation callback could not store data.
pub const PARSE_STORAGE: i32 = PARSE_BASE + 0x02;
/// Feed the next chunk.
pub const PARSE_CONTINUE: i32 = PARSE_BASE + 0x03;
/// Image is complete and verified.
pub const PARSE_SUCCESS: i32 = PARSE_BASE + 0x04;

/// No storage slot with the requested index.
pub const STORAGE_INVALID_SLOT: i32 = STORAGE_BASE + 0x01;

/// Reasons a GBL parse session fails. Once returned the session is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParseError {
    /// Unsupported GBL major version.
    Version,
    /// End tag checksum mismatch.
    Crc,
    /// Tag id not known to this parser.
    UnknownTag,
    /// Signature missing, malformed or not matching the image hash.
    Signature,
    /// Image type incompatible with the configured security policy.
    FileType,
    /// Known tag in a position or with a length that is not allowed.
    Unexpected,
    /// Unknown tag inside an encrypted container: wrong key or corrupt data.
    KeyError,
    /// Parser used without being initialized.
    Init,
    /// Image refused by policy (rollback protection).
    Rejected,
    /// Carry-over buffer overflow.
    Buffer,
    /// An installation callback failed.
    Install,
    /// Nothing recognizable in the image.
    NoImage,
}

impl ParseError {
    pub const fn code(self) -> i32 {
        match self {
            ParseError::Version => PARSER_BASE + 0x01,
            ParseError::Crc => PARSER_BASE + 0x02,
            ParseError::UnknownTag => PARSER_BASE + 0x03,
            ParseError::Signature => PARSER_BASE + 0x04,
            ParseError::FileType => PARSER_BASE + 0x05,
            ParseError::Unexpected => PARSER_BASE + 0x06,
            ParseError::KeyError => PARSER_BASE + 0x08,
            ParseError::Init => PARSER_BASE + 0x09,
            ParseError::Rejected => PARSER_BASE + 0x0A,
            ParseError::Buffer => PARSER_BASE + 0x0B,
            ParseError::Install => PARSE_STORAGE,
            ParseError::NoImage => PARSE_FAILED,
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            ParseError::Version => "unsupported container version",
            ParseError::Crc => "checksum mismatch",
            ParseError::UnknownTag => "unknown tag",
            ParseError::Signature => "signature verification failed",
            ParseError::FileType => "image type not allowed",
            ParseError::Unexpected => "unexpected tag",
            ParseError::KeyError => "decryption produced garbage",
            ParseError::Init => "parser not initialized",
            ParseError::Rejected => "image rejected by rollback protection",
            ParseError::Buffer => "carry-over buffer overflow",
            ParseError::Install => "installation callback failed",
            ParseError::NoImage => "no image found",
        };
        f.write_str(msg)
    }
}

/// Returned by installation callbacks when data cannot be stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InstallError;

impl From<InstallError> for ParseError {
    fn from(_: InstallError) -> Self {
        ParseError::Install
    }
}

/// The buffer handed to the parser cannot hold a parser context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ContextTooSmall {
    pub required: usize,
    pub provided: usize,
}

impl ContextTooSmall {
    pub const fn code(self) -> i32 {
        PARSER_BASE + 0x09
    }
}

impl fmt::Display for ContextTooSmall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "parser context needs {} bytes, got {}",
            self.required, self.provided
        )
    }
}
