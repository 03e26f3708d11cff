//#![deny(unsafe_code)]
#![deny(warnings)]
#![no_main]
#![no_std]

use btl_core::table::MainBootloaderTable;
use btl_core::ResetReason;
use panic_halt as _;

/// Where the bootloader places its table.
const BOOTLOADER_TABLE: u32 = 0x0800_0200;
/// Retained reset reason cell read by the bootloader on the next boot.
const RESET_REASON_ADDR: *mut u32 = 0x2001_FFF8 as *mut u32;
const APP_START: u32 = 0x0801_0000;

/// The resident bootloader's table, if one is present.
fn bootloader_table() -> Option<&'static MainBootloaderTable> {
    // SAFETY: flash at this address is always mapped and never written
    // while the application runs.
    let table = unsafe { &*(BOOTLOADER_TABLE as *const MainBootloaderTable) };
    table.is_valid().then_some(table)
}

/// Asks the bootloader to stay resident after the next reset.
///
/// # Safety
/// Resets the device.
pub unsafe fn request_bootload() -> ! {
    use core::ptr::write_volatile;

    write_volatile(RESET_REASON_ADDR, ResetReason::Bootload.to_retained_word());

    // Memory barrier
    cortex_m::asm::dsb();

    cortex_m::peripheral::SCB::sys_reset();
}

#[rtic::app(device = stm32f4xx_hal::pac, peripherals = true)]
mod app {

    use core::fmt::Write;
    use embedded_hal::delay::DelayNs;
    use stm32f4xx_hal::{
        gpio::{self, Edge, Input, Output, PushPull},
        pac::{TIM1, USART2},
        prelude::*,
        rcc::Config,
        serial::{config::Config as SerialConfig, Serial},
        timer,
    };

    use crate::{bootloader_table, request_bootload, APP_START};

    // Resources shared between tasks
    #[shared]
    struct Shared {
        delayval: u32,
    }

    // Local resources to specific tasks (cannot be shared)
    #[local]
    struct Local {
        button: gpio::PA0<Input>,
        led: gpio::PC13<Output<PushPull>>,
        delay: timer::DelayMs<TIM1>,
        uart: Serial<USART2>,
    }

    #[init]
    fn init(ctx: init::Context) -> (Shared, Local) {
        let mut dp = ctx.device;

        // Configure and obtain handle for delay abstraction
        let rcc = dp.RCC.constrain();
        let mut rcc = rcc.freeze(Config::hse(25.MHz()));
        let delay = dp.TIM1.delay_ms(&mut rcc);

        // On the Black Pill the LED is on PC13 and the KEY button on PA0
        let gpioc = dp.GPIOC.split(&mut rcc);
        let led = gpioc.pc13.into_push_pull_output();
        let gpioa: gpio::gpioa::Parts = dp.GPIOA.split(&mut rcc);
        let mut button = gpioa.pa0.into_pull_up_input();

        // Configure UART2 for logging (PA2=TX, PA3=RX)
        let tx_pin = gpioa.pa2.into_alternate();
        let rx_pin = gpioa.pa3.into_alternate();
        let mut uart = Serial::new(
            dp.USART2,
            (tx_pin, rx_pin),
            SerialConfig::default().baudrate(115200.bps()),
            &mut rcc,
        )
        .unwrap();
        writeln!(uart, "\r\n=== APP STARTING ===").ok();

        // Slow blink when running without a bootloader
        let mut delayval = 500_u32;
        match bootloader_table() {
            Some(table) => {
                writeln!(
                    uart,
                    "APP: bootloader {:#010x}, capabilities {:#010x}",
                    table.header.version, table.capabilities
                )
                .ok();
                writeln!(
                    uart,
                    "APP: application space {:#010x}..{:#010x}",
                    table.start_of_app_space, table.end_of_app_space
                )
                .ok();
                writeln!(
                    uart,
                    "APP: parser context {} bytes",
                    (table.parser_context_size)()
                )
                .ok();
                // SAFETY: plain value argument, the bootloader only reads flash.
                let verified = unsafe { (table.verify_application)(APP_START) };
                writeln!(uart, "APP: self check {}", if verified { "ok" } else { "FAILED" }).ok();
                delayval = 2000;
            }
            None => {
                writeln!(uart, "APP: no bootloader table").ok();
            }
        }

        // Make button an interrupt source on the rising edge
        let mut syscfg = dp.SYSCFG.constrain(&mut rcc);
        button.make_interrupt_source(&mut syscfg);
        button.trigger_on_edge(&mut dp.EXTI, Edge::Rising);
        button.enable_interrupt(&mut dp.EXTI);

        writeln!(uart, "APP: Press button to enter the bootloader").ok();

        (
            Shared { delayval },
            Local {
                button,
                led,
                delay,
                uart,
            },
        )
    }

    // Background task, runs whenever no other tasks are running
    #[idle(local = [led, delay], shared = [delayval])]
    fn idle(mut ctx: idle::Context) -> ! {
        let led = ctx.local.led;
        let delay = ctx.local.delay;
        loop {
            // First fast blink
            led.set_high();
            DelayNs::delay_ms(delay, 150);
            led.set_low();
            DelayNs::delay_ms(delay, 50);

            // Second fast blink
            led.set_high();
            DelayNs::delay_ms(delay, 150);
            led.set_low();
            DelayNs::delay_ms(delay, 50);

            // Long pause with LED ON
            led.set_high();
            DelayNs::delay_ms(delay, ctx.shared.delayval.lock(|del| *del));
            led.set_low();
        }
    }

    #[task(binds = EXTI0, local = [button, uart])]
    fn gpio_interrupt_handler(ctx: gpio_interrupt_handler::Context) {
        writeln!(ctx.local.uart, "APP: Button pressed! Rebooting into bootloader...").ok();
        ctx.local.button.clear_interrupt_pending_bit();

        unsafe {
            request_bootload();
        }
    }
}
