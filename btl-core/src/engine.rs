//! Boot entry decision.
//!
//! Boot runs in two phases. [`EntryDecisionEngine::decide_early`] runs before
//! the runtime has initialized statics and picks between entering the
//! application and staying in the bootloader. If it stays,
//! [`EntryDecisionEngine::run_bootload_mode`] tries to recover a working
//! application and yields the [`BootAction`] that ends this boot. Everything
//! ends in [`execute`], which never returns.
//!
//! Nothing reachable from `decide_early` may log.

use embedded_hal::delay::DelayNs;

use crate::config::{BootConfig, FlashRegion};
use crate::reset::{PersistentBootState, ResetCause, ResetReason, RetainedWord};
use crate::security::SignatureVerifier;
use crate::upgrade::{UpgradeError, UpgradeSource};
use crate::verify::{AppEntry, ApplicationVerifier, MemoryMap, VerifyError};

/// Final, non-returning operations of a boot.
pub trait Platform {
    /// Write-protect `region` until the next reset.
    fn lock_region(&mut self, region: FlashRegion);
    /// Switch to the application's vector table and stack and jump to its
    /// reset handler.
    fn transfer_control(&mut self, entry: AppEntry) -> !;
    fn system_reset(&mut self) -> !;
    /// Park the core. The device stays reachable by a debugger.
    fn halt(&mut self) -> !;
}

/// External request to stay in the bootloader, such as a held button.
pub trait ActivationSource {
    fn is_asserted(&mut self) -> bool;
}

impl ActivationSource for bool {
    fn is_asserted(&mut self) -> bool {
        *self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommunicationOutcome {
    Done,
    /// The host sent an image that failed to parse or verify.
    ImageError,
    Timeout,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LinkError;

/// Interactive upgrade protocol over some link.
pub trait Communication {
    fn init(&mut self);
    fn start(&mut self) -> Result<(), LinkError>;
    /// Serves the protocol until the host is done or gives up.
    fn run(&mut self) -> CommunicationOutcome;
    fn shutdown(&mut self);
}

/// Recovery paths available in bootload mode, chosen once per board.
pub enum RecoveryPolicy<'r> {
    StorageOnly {
        storage: &'r mut dyn UpgradeSource,
    },
    CommunicationOnly {
        link: &'r mut dyn Communication,
    },
    StorageThenCommunication {
        storage: &'r mut dyn UpgradeSource,
        link: &'r mut dyn Communication,
    },
}

/// Why the bootloader stayed resident.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BootloadCause {
    /// Software reset carrying a reason that asks for the bootloader.
    Requested(ResetReason),
    Activation,
    BadApplication(VerifyError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EarlyDecision {
    EnterApplication(AppEntry),
    Bootload(BootloadCause),
}

/// How a boot ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BootAction {
    EnterApplication(AppEntry),
    Reset(ResetReason),
    /// Reset-storm breaker.
    Halt,
}

/// Processor faults routed to [`fault_reset`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Fault {
    HardFault,
    MemManage,
    BusFault,
    UsageFault,
    SecureFault,
}

enum StorageAttempt {
    Installed,
    Failed(UpgradeError),
    Halt,
}

pub struct EntryDecisionEngine<'a, W> {
    config: &'a BootConfig,
    state: &'a mut PersistentBootState<W>,
}

impl<'a, W: RetainedWord> EntryDecisionEngine<'a, W> {
    pub fn new(config: &'a BootConfig, state: &'a mut PersistentBootState<W>) -> Self {
        Self { config, state }
    }

    pub fn state(&self) -> &PersistentBootState<W> {
        &*self.state
    }

    /// Whether this boot must stay in the bootloader before looking at the
    /// application. The activation source is only polled when the reset
    /// reason does not already decide.
    pub fn check_activation(
        &self,
        cause: ResetCause,
        activation: &mut dyn ActivationSource,
    ) -> Option<BootloadCause> {
        if cause.contains(ResetCause::SOFTWARE) {
            let reason = self.state.classify_reset(cause);
            if reason.forces_bootloader() {
                return Some(BootloadCause::Requested(reason));
            }
        }
        if activation.is_asserted() {
            return Some(BootloadCause::Activation);
        }
        None
    }

    /// Early-phase decision. Must not log.
    pub fn decide_early<M, V>(
        &mut self,
        cause: ResetCause,
        activation: &mut dyn ActivationSource,
        verifier: &ApplicationVerifier<'_, M, V>,
    ) -> EarlyDecision
    where
        M: MemoryMap + ?Sized,
        V: SignatureVerifier + ?Sized,
    {
        if let Some(cause) = self.check_activation(cause, activation) {
            return EarlyDecision::Bootload(cause);
        }

        let base = self.config.application.start;
        let verified = if verifier.pc_sane(base) {
            verifier.verify_application(base)
        } else {
            Err(VerifyError::Erased)
        };
        match verified {
            Ok(entry) => EarlyDecision::EnterApplication(entry),
            Err(e) => {
                self.state.set_reason(ResetReason::BadApp);
                EarlyDecision::Bootload(BootloadCause::BadApplication(e))
            }
        }
    }

    /// Attempts recovery under `policy` and returns how this boot ends.
    /// Never returns [`BootAction::EnterApplication`].
    pub fn run_bootload_mode(
        &mut self,
        policy: RecoveryPolicy<'_>,
        delay: &mut impl DelayNs,
    ) -> BootAction {
        if !self.state.reset_counter_enabled() {
            self.state.invalidate_reason();
        }

        match policy {
            RecoveryPolicy::StorageOnly { storage } => match self.try_storage(storage, delay) {
                StorageAttempt::Installed => BootAction::Reset(ResetReason::Go),
                StorageAttempt::Halt => BootAction::Halt,
                StorageAttempt::Failed(_) => BootAction::Reset(ResetReason::Fatal),
            },
            RecoveryPolicy::CommunicationOnly { link } => match try_communication(link) {
                CommunicationOutcome::Done => BootAction::Reset(ResetReason::Go),
                _ => BootAction::Reset(ResetReason::Fatal),
            },
            RecoveryPolicy::StorageThenCommunication { storage, link } => {
                let storage_error = match self.try_storage(storage, delay) {
                    StorageAttempt::Installed => return BootAction::Reset(ResetReason::Go),
                    StorageAttempt::Halt => return BootAction::Halt,
                    StorageAttempt::Failed(e) => e,
                };
                match try_communication(link) {
                    CommunicationOutcome::Done => BootAction::Reset(ResetReason::Go),
                    CommunicationOutcome::ImageError => BootAction::Reset(ResetReason::BadImage),
                    _ if matches!(storage_error, UpgradeError::Rejected(_)) => {
                        BootAction::Reset(ResetReason::BadImage)
                    }
                    _ => BootAction::Reset(ResetReason::Fatal),
                }
            }
        }
    }

    fn try_storage(
        &mut self,
        storage: &mut dyn UpgradeSource,
        delay: &mut impl DelayNs,
    ) -> StorageAttempt {
        match storage.apply_upgrade() {
            Ok(()) => {
                if self.state.reset_counter_enabled() {
                    self.state.disable_reset_counter();
                }
                StorageAttempt::Installed
            }
            Err(e) => {
                if !self.state.reset_counter_enabled() {
                    self.state.enable_reset_counter();
                }
                let count = self.state.reset_counter();
                if count >= self.config.reset_counter_limit {
                    error!("recovery failed {} times, halting", count);
                    return StorageAttempt::Halt;
                }
                self.state.increment_reset_counter();
                warn!(
                    "storage recovery failed ({}), attempt {}",
                    e,
                    self.state.reset_counter()
                );
                delay.delay_ms(self.config.recovery_delay_ms);
                StorageAttempt::Failed(e)
            }
        }
    }
}

fn try_communication(link: &mut dyn Communication) -> CommunicationOutcome {
    link.init();
    let outcome = match link.start() {
        Ok(()) => link.run(),
        Err(LinkError) => CommunicationOutcome::Failed,
    };
    link.shutdown();
    debug!("communication finished: {}", outcome);
    outcome
}

/// Carries out `action`.
pub fn execute<W, P>(
    action: BootAction,
    config: &BootConfig,
    state: &mut PersistentBootState<W>,
    platform: &mut P,
) -> !
where
    W: RetainedWord,
    P: Platform + ?Sized,
{
    match action {
        BootAction::EnterApplication(entry) => enter_application(entry, config, state, platform),
        BootAction::Reset(reason) => reset_with_reason(reason, state, platform),
        BootAction::Halt => {
            state.invalidate_reason();
            platform.halt()
        }
    }
}

/// Forgives any failure streak, applies the exit locks and jumps.
pub fn enter_application<W, P>(
    entry: AppEntry,
    config: &BootConfig,
    state: &mut PersistentBootState<W>,
    platform: &mut P,
) -> !
where
    W: RetainedWord,
    P: Platform + ?Sized,
{
    state.disable_reset_counter();
    if config.lock_bootloader_on_exit {
        platform.lock_region(config.bootloader);
    }
    if config.lock_application_on_exit {
        platform.lock_region(config.application);
    }
    platform.transfer_control(entry)
}

/// Records `reason` and resets. Nothing runs in between.
pub fn reset_with_reason<W, P>(
    reason: ResetReason,
    state: &mut PersistentBootState<W>,
    platform: &mut P,
) -> !
where
    W: RetainedWord,
    P: Platform + ?Sized,
{
    state.set_reason(reason);
    platform.system_reset()
}

/// Fault handler tail: record the fault class and reset.
pub fn fault_reset<W, P>(fault: Fault, state: &mut PersistentBootState<W>, platform: &mut P) -> !
where
    W: RetainedWord,
    P: Platform + ?Sized,
{
    let reason = match fault {
        Fault::SecureFault => ResetReason::TzFault,
        _ => ResetReason::Fatal,
    };
    reset_with_reason(reason, state, platform)
}
