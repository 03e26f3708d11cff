//! Reset reason and reset counter kept in memory that survives a warm reset.
//!
//! Both cells are plain words tagged with a 16-bit signature in the upper
//! half. A cell whose signature does not match is treated as empty, which is
//! what retained RAM looks like after power loss.

use bitflags::bitflags;

const REASON_VALID: u16 = 0xF00F;
const REASON_INVALID: u16 = 0xC33C;
const COUNTER_ENABLED: u16 = 0xB007;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u16)]
pub enum ResetReason {
    Unknown = 0x0200,
    /// Boot the application normally.
    Go = 0x0201,
    /// Application asked for bootloader mode.
    Bootload = 0x0202,
    /// Bootloader mode forced by the bootloader itself.
    Force = 0x0203,
    Fatal = 0x0204,
    /// Resident application failed verification.
    BadApp = 0x0205,
    /// Upgrade image failed verification.
    BadImage = 0x0206,
    TzFault = 0x020B,
    /// Application staged an upgrade in storage.
    Upgrade = 0x0210,
}

impl ResetReason {
    pub const fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            0x0200 => ResetReason::Unknown,
            0x0201 => ResetReason::Go,
            0x0202 => ResetReason::Bootload,
            0x0203 => ResetReason::Force,
            0x0204 => ResetReason::Fatal,
            0x0205 => ResetReason::BadApp,
            0x0206 => ResetReason::BadImage,
            0x020B => ResetReason::TzFault,
            0x0210 => ResetReason::Upgrade,
            _ => return None,
        })
    }

    pub const fn code(self) -> u16 {
        self as u16
    }

    /// Word to store in the retained reason cell. Applications use this to
    /// request bootloader entry before resetting.
    pub const fn to_retained_word(self) -> u32 {
        ((REASON_VALID as u32) << 16) | self as u32
    }

    /// Reasons that keep the device in the bootloader after a software reset.
    pub const fn forces_bootloader(self) -> bool {
        matches!(
            self,
            ResetReason::Bootload | ResetReason::Force | ResetReason::Upgrade | ResetReason::BadApp
        )
    }
}

bitflags! {
    /// Hardware reset cause, translated by the board from its reset status register.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ResetCause: u32 {
        const POWER_ON = 1 << 0;
        const BROWN_OUT = 1 << 1;
        const PIN = 1 << 2;
        const SOFTWARE = 1 << 3;
        const WATCHDOG = 1 << 4;
        const LOCKUP = 1 << 5;
    }
}

/// Decode a retained reason cell.
pub const fn decode_reason(cell: u32) -> Option<ResetReason> {
    if (cell >> 16) as u16 != REASON_VALID {
        return None;
    }
    ResetReason::from_code(cell as u16)
}

/// Classify the last reset from the retained cell and the hardware cause.
///
/// Power-on and brown-out resets ignore the cell since its contents did not
/// survive. This function has no side effects.
pub fn classify(cell: u32, cause: ResetCause) -> ResetReason {
    if cause.intersects(ResetCause::POWER_ON | ResetCause::BROWN_OUT) {
        return ResetReason::Unknown;
    }
    if let Some(reason) = decode_reason(cell) {
        return reason;
    }
    if cause.intersects(ResetCause::WATCHDOG | ResetCause::LOCKUP) {
        return ResetReason::Fatal;
    }
    ResetReason::Unknown
}

/// One word of reset-survivable storage.
///
/// Implementations must not rely on any static initialization: the early
/// boot phase calls these before `.data` and `.bss` are set up.
pub trait RetainedWord {
    fn load(&self) -> u32;
    fn store(&mut self, value: u32);
}

impl RetainedWord for u32 {
    fn load(&self) -> u32 {
        *self
    }

    fn store(&mut self, value: u32) {
        *self = value;
    }
}

/// Reset reason and reset counter cells.
pub struct PersistentBootState<W> {
    reason: W,
    counter: W,
}

impl<W: RetainedWord> PersistentBootState<W> {
    pub const fn new(reason: W, counter: W) -> Self {
        Self { reason, counter }
    }

    pub fn stored_reason(&self) -> Option<ResetReason> {
        decode_reason(self.reason.load())
    }

    pub fn classify_reset(&self, cause: ResetCause) -> ResetReason {
        classify(self.reason.load(), cause)
    }

    pub fn set_reason(&mut self, reason: ResetReason) {
        self.reason.store(reason.to_retained_word());
    }

    pub fn invalidate_reason(&mut self) {
        let code = self.reason.load() & 0xFFFF;
        self.reason.store(((REASON_INVALID as u32) << 16) | code);
    }

    pub fn reset_counter_enabled(&self) -> bool {
        (self.counter.load() >> 16) as u16 == COUNTER_ENABLED
    }

    /// Arms the counter at zero.
    pub fn enable_reset_counter(&mut self) {
        self.counter.store((COUNTER_ENABLED as u32) << 16);
    }

    pub fn disable_reset_counter(&mut self) {
        self.counter.store(0);
    }

    /// No-op while the counter is disabled.
    pub fn increment_reset_counter(&mut self) {
        if self.reset_counter_enabled() {
            let count = self.reset_counter().saturating_add(1);
            self.counter.store(((COUNTER_ENABLED as u32) << 16) | count as u32);
        }
    }

    /// Zero while disabled.
    pub fn reset_counter(&self) -> u16 {
        if self.reset_counter_enabled() {
            self.counter.load() as u16
        } else {
            0
        }
    }
}
