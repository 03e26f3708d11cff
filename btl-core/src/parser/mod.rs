//! Streaming GBL image parser.
//!
//! A [`ParserContext`] consumes an image in arbitrary chunks, hashing and
//! decrypting as it goes, and hands payload data to [`ParserCallbacks`].
//! Only a completed session whose signature and checksum both passed reports
//! [`ParseOutcome::Success`].
//!
//! The parser does not log. Applications run it through the bootloader
//! table in their own RAM, where the bootloader's logger state does not
//! exist. Callers log the returned outcome instead.

use bitflags::bitflags;

use crate::error::{InstallError, ParseError};
use crate::props::ApplicationData;

mod context;
pub mod format;


pub use context::{context_size, ParserContext};

/// Per-session parser settings, derived from [`crate::BootConfig`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParserConfig {
    pub application_start: u32,
    pub bootloader_base: u32,
    pub bootloader_upgrade_location: Option<u32>,
    pub public_key: [u8; 64],
    /// Images must carry a valid ECDSA signature.
    pub require_signature: bool,
    /// Images must be encrypted.
    pub require_encryption: bool,
    /// Rollback floor for the application tag version.
    pub minimum_application_version: Option<u32>,
}

bitflags! {
    /// What a parsed image contains.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ImageContents: u8 {
        const APPLICATION = 1 << 0;
        const BOOTLOADER = 1 << 1;
        const METADATA = 1 << 2;
    }
}

/// Facts collected during a parse session.
///
/// `image_verified` implies `image_completed`, and neither is ever cleared
/// within a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageProperties {
    pub contents: ImageContents,
    pub image_completed: bool,
    pub image_verified: bool,
    pub application: ApplicationData,
    pub bootloader_version: u32,
    pub bootloader_upgrade_size: u32,
}

impl Default for ImageProperties {
    fn default() -> Self {
        Self {
            contents: ImageContents::empty(),
            image_completed: false,
            image_verified: false,
            application: ApplicationData::default(),
            bootloader_version: 0,
            bootloader_upgrade_size: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParseOutcome {
    /// More data needed.
    Continue,
    /// Image complete and verified. Terminal.
    Success,
    /// Structural or verification failure. Terminal.
    Failed(ParseError),
}

impl ParseOutcome {
    pub const fn code(self) -> i32 {
        match self {
            ParseOutcome::Continue => crate::error::PARSE_CONTINUE,
            ParseOutcome::Success => crate::error::PARSE_SUCCESS,
            ParseOutcome::Failed(e) => e.code(),
        }
    }
}

/// Sinks for image payload. Every method defaults to discarding the data.
pub trait ParserCallbacks {
    /// Whether application data should be delivered at all.
    fn accepts_application(&self) -> bool {
        false
    }

    /// Application bytes destined for absolute flash `address`.
    fn application_data(&mut self, _address: u32, _data: &[u8]) -> Result<(), InstallError> {
        Ok(())
    }

    /// Bootloader upgrade bytes at `offset` into the bootloader image.
    fn bootloader_data(&mut self, _offset: u32, _data: &[u8]) -> Result<(), InstallError> {
        Ok(())
    }

    fn metadata(&mut self, _offset: u32, _data: &[u8]) -> Result<(), InstallError> {
        Ok(())
    }
}

/// Callbacks that discard everything, for inspection-only parses.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCallbacks;

impl ParserCallbacks for NoCallbacks {}

/// Result of [`ParserContext::parse_image_info`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ImageInfo {
    pub application: ApplicationData,
    pub bootloader_version: u32,
}
