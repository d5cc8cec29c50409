// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The boot manager program.
//!
//! This contains the entry point and support code for the boot manager. It
//! relies on the lib crate for all of the decision making; the code here is
//! dedicated to the runtime requirements of the device: bring-up, the jump
//! into the chosen image, and fault handling.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(not(target_os = "none"))]
fn main() {
    eprintln!("dualbim only runs on the device; use `cargo xtask package`");
    std::process::exit(1);
}

#[cfg(target_os = "none")]
mod firmware {
    use core::sync::atomic::{compiler_fence, Ordering};

    use cortex_m_rt::{entry, exception, ExceptionFrame};
    use dualbim::auth::{P256Authenticator, DEFAULT_CERT};
    use dualbim::boot::{BootConfig, Selector};
    use dualbim::bsp::Bsp;
    use dualbim::romapi::RomFlash;
    use dualbim::Flash;

    // Select the appropriate BSP type as `Board`
    cfg_if::cfg_if! {
        if #[cfg(feature = "target-board-launchxl-cc26x2r1")] {
            use dualbim::bsp::launchxl_cc26x2r1::Board;
        } else if #[cfg(feature = "target-board-lp-cc1352p7")] {
            use dualbim::bsp::lp_cc1352p7::Board;
        }
    }

    /// Pages of internal flash: everything up to the counter page, the
    /// counter page, and our own page at the top.
    const FLASH_PAGES: u32 = Board::LAYOUT.bim_info_page + 2;

    /// Roughly half a second at the 48 MHz boot clock.
    const BLINK_CYCLES: u32 = 24_000_000;

    static AUTH: P256Authenticator = P256Authenticator::new(DEFAULT_CERT);

    /// Boot manager entry point. These are not the first instructions
    /// executed, since we rely on `cortex_m_rt::entry` to do the equivalent
    /// of crt0 before we get control.
    #[entry]
    fn main() -> ! {
        Board::configure();

        // Safety: this is the only `RomFlash`, and the layout describes this
        // part's flash.
        let mut flash = unsafe { RomFlash::new(Board::LAYOUT.page_size, FLASH_PAGES) };

        let decision = Selector::new(
            &mut flash,
            &AUTH,
            Board::LAYOUT,
            BootConfig::from_features(),
        )
        .run();

        let target = match decision {
            Ok(target) => target,
            Err(e) => {
                log::error!("not booting: {:?}", e);
                no_image()
            }
        };

        // The first two words of the vector table.
        let (sp, reset) = match (flash.read_u32(target.entry), flash.read_u32(target.entry + 4)) {
            (Ok(sp), Ok(reset)) => (sp, reset),
            _ => no_image(),
        };

        Board::indicate_boot_choice(target.slot);
        boot_into(target.entry, sp, reset)
    }

    /// Nothing we're willing to run. Stay here until someone reflashes us.
    fn no_image() -> ! {
        if cfg!(feature = "blink-led-no-valid-image") {
            loop {
                Board::indicate_fault();
                cortex_m::asm::delay(BLINK_CYCLES);
                Board::clear_fault();
                cortex_m::asm::delay(BLINK_CYCLES);
            }
        }
        loop {
            cortex_m::asm::wfi();
        }
    }

    #[panic_handler]
    fn panic_handler(_: &core::panic::PanicInfo) -> ! {
        // We use a BKPT instruction to wake any attached debugger. If no
        // debugger is attached, BKPT escalates into a HardFault, falling to
        // the handler below. This way we can reuse its fault indication code.
        loop {
            cortex_m::asm::bkpt();
        }
    }

    #[exception]
    unsafe fn HardFault(_ef: &ExceptionFrame) -> ! {
        Board::indicate_fault();

        // Spin -- don't use BKPT here because if no debugger is attached
        // it'll escalate to another HardFault and lock the processor.
        loop {
            compiler_fence(Ordering::SeqCst);
        }
    }

    fn boot_into(vector_table: u32, initial_sp: u32, reset_vector: u32) -> ! {
        // This block puts the processor state back to defaults and hands
        // control to the image's reset vector with its stack.
        unsafe {
            core::arch::asm!(
                "
                    @ From the perspective of this program, we're never
                    @ leaving this asm block. This means we can trash Rust
                    @ invariants.

                    @ r0 = target program reset vector
                    @ r1 = target program initial stack pointer
                    @ r2 = target program vector table address
                    @
                    @ All other registers are available as temporaries.

                    @ Write zeros over our RAM. Note that this destroys our
                    @ stack! We can't refer to any stack-allocated anything
                    @ from here on.
                    @
                    @ r3 = current address
                    @ r4 = end address
                    @ r5 = zero
                    movw r3, #:lower16:__start_of_ram
                    movt r3, #:upper16:__start_of_ram
                    movw r4, #:lower16:__end_of_ram
                    movt r4, #:upper16:__end_of_ram
                    movs r5, #0

                1:  str r5, [r3], #4
                    cmp r3, r4
                    bne 1b

                    @ Point VTOR at the image's vector table. Nothing may
                    @ fault from here on, other than the jump itself.
                    movw r3, #:lower16:0xE000ED08
                    movt r3, #:upper16:0xE000ED08

                    str r2, [r3]

                    @ Clear what the image doesn't already know about.
                    movs r3, #0
                    movs r4, #0
                    movs r5, #0
                    movs r6, #0
                    movs r7, #0

                    mov r8, r7
                    mov r9, r7
                    mov r10, r7
                    mov r11, r7
                    mov r12, r7
                    mov r14, r7   @ LR

                    mov SP, r1

                    bx r0
                ",

                // Because this asm block destroys RAM early on, every
                // parameter fed in here must be a *value* in a register.
                in("r0") reset_vector,
                in("r1") initial_sp,
                in("r2") vector_table,

                options(noreturn),
            )
        }
    }
}
