#![no_std]
#![no_main]

// This mod MUST go first, so that the others see its macros.
mod fmt;

mod board;
mod flash;
mod platform;
mod retained;
mod table;

use core::panic::PanicInfo;

use btl_core::engine::{self, EarlyDecision, Fault};
use btl_core::security::P256Verifier;
use btl_core::upgrade::StorageUpgradeLocator;
use btl_core::verify::ApplicationVerifier;
use btl_core::{EntryDecisionEngine, RecoveryPolicy};
use cortex_m_rt::{entry, exception, pre_init, ExceptionFrame};
#[cfg(feature = "defmt")]
use defmt_rtt as _;
// Device interrupt vectors.
use stm32f4 as _;

use crate::board::{ActivationButton, BOOT_CONFIG};
use crate::flash::{FlashMemory, InternalFlash};
use crate::platform::{SpinDelay, Stm32Platform};

/// Runs before `.data` and `.bss` are initialized: stack locals and
/// registers only, no logging.
#[pre_init]
unsafe fn early_boot() {
    let mut state = retained::boot_state();
    let cause = board::take_reset_cause();
    let mut button = ActivationButton::new();
    let memory = FlashMemory;
    let verifier = ApplicationVerifier::new(&BOOT_CONFIG, &memory, &P256Verifier);

    let decision = EntryDecisionEngine::new(&BOOT_CONFIG, &mut state).decide_early(
        cause,
        &mut button,
        &verifier,
    );
    drop(button);

    if let EarlyDecision::EnterApplication(entry) = decision {
        engine::enter_application(entry, &BOOT_CONFIG, &mut state, &mut Stm32Platform);
    }
}

#[entry]
fn main() -> ! {
    info!("bootloader {=u32:#x}", BOOT_CONFIG.version);
    let mut state = retained::boot_state();
    if let Some(reason) = state.stored_reason() {
        info!("reset reason: {}", reason);
    }

    let installed = ApplicationVerifier::new(&BOOT_CONFIG, &FlashMemory, &P256Verifier)
        .installed_version(BOOT_CONFIG.application.start);
    let parser_config = BOOT_CONFIG.parser_config(installed);
    // SAFETY: the only programming handle in the bootloader.
    let flash = unsafe { InternalFlash::new() };
    let mut storage = StorageUpgradeLocator::new(
        &BOOT_CONFIG,
        &parser_config,
        &P256Verifier,
        FlashMemory,
        flash,
    );

    let action = EntryDecisionEngine::new(&BOOT_CONFIG, &mut state).run_bootload_mode(
        RecoveryPolicy::StorageOnly {
            storage: &mut storage,
        },
        &mut SpinDelay,
    );
    info!("bootload mode done: {}", action);
    engine::execute(action, &BOOT_CONFIG, &mut state, &mut Stm32Platform)
}

#[exception]
unsafe fn HardFault(_frame: &ExceptionFrame) -> ! {
    engine::fault_reset(Fault::HardFault, &mut retained::boot_state(), &mut Stm32Platform)
}

#[exception]
fn MemoryManagement() -> ! {
    engine::fault_reset(Fault::MemManage, &mut retained::boot_state(), &mut Stm32Platform)
}

#[exception]
fn BusFault() -> ! {
    engine::fault_reset(Fault::BusFault, &mut retained::boot_state(), &mut Stm32Platform)
}

#[exception]
fn UsageFault() -> ! {
    engine::fault_reset(Fault::UsageFault, &mut retained::boot_state(), &mut Stm32Platform)
}

#[panic_handler]
fn panic(_info: &PanicInfo) -> ! {
    warn!("panic");
    engine::fault_reset(Fault::HardFault, &mut retained::boot_state(), &mut Stm32Platform)
}
