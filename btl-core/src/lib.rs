//! Core of a GBL-based secure bootloader.
//!
//! Everything in here is hardware independent: the board crate supplies
//! retained RAM, flash, the activation pin and the final control transfer
//! through the traits defined in [`engine`], [`reset`], [`verify`] and
//! [`secure`].
#![cfg_attr(not(test), no_std)]

// This mod MUST go first, so that the others see its macros.
mod fmt;

pub mod config;
pub mod engine;
pub mod error;
pub mod parser;
pub mod props;
pub mod reset;
pub mod secure;
pub mod security;
pub mod table;
pub mod upgrade;
pub mod verify;

#[cfg(test)]
mod testutil;

pub use config::{BootConfig, Capabilities, FlashRegion, StorageSlot};
pub use engine::{BootAction, EarlyDecision, EntryDecisionEngine, Platform, RecoveryPolicy};
pub use error::{ContextTooSmall, ParseError};
pub use parser::{ImageProperties, ParseOutcome, ParserConfig, ParserContext};
pub use reset::{PersistentBootState, ResetCause, ResetReason, RetainedWord};
