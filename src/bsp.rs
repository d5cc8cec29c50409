// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types and hooks for implementing Board Support Packages (BSPs).
//!
//! A board tells the boot manager two things: how its internal flash is
//! carved up, and how to show the outcome of a boot on whatever LEDs it has.
//!
//! To implement a BSP:
//!
//! 1. Create a module within `dualbim::bsp` named after your board.
//! 2. Define a type in the module called `Board`. It is never instantiated.
//! 3. Implement `dualbim::bsp::Bsp` for your `Board` type, and assert that
//!    its layout is consistent.
//! 4. Add a `target-board-*` feature to `Cargo.toml` and a linker memory map
//!    under `memory/`.
//! 5. Add a branch to the `cfg_if` in `src/bin/dualbim.rs` to select the
//!    right `Board` type.

// Every BSP is always compiled, which keeps them all building.
pub mod launchxl_cc26x2r1;
pub mod lp_cc1352p7;

use crate::flash::{FlashLayout, SlotId};

/// Requirements placed upon a BSP type.
pub trait Bsp {
    const LAYOUT: FlashLayout;

    /// Set up any I/Os needed for the board.
    fn configure() {}

    /// Indicate a boot failure. No information is provided as to _what_
    /// failure, because generally speaking we only have one bit of output.
    fn indicate_fault();

    /// Undo `indicate_fault`, so the fault indication can blink.
    fn clear_fault() {}

    /// Indicate that a particular slot has been chosen for boot.
    fn indicate_boot_choice(_slot: SlotId) {}
}

/// Just enough of the CC13x2/CC26x2 PRCM, IOC and GPIO blocks to drive LEDs.
pub mod dio {
    use tock_registers::interfaces::{Readable, Writeable};
    use tock_registers::registers::{ReadOnly, ReadWrite, WriteOnly};
    use tock_registers::{register_bitfields, register_structs};

    register_structs! {
        pub PrcmRegisters {
            (0x000 => _reserved0),
            (0x028 => clkloadctl: ReadWrite<u32, CLKLOADCTL::Register>),
            (0x02C => _reserved1),
            (0x048 => gpioclkgr: ReadWrite<u32, CLKGR::Register>),
            (0x04C => _reserved2),
            (0x138 => pdctl0periph: ReadWrite<u32, PDCTL::Register>),
            (0x13C => _reserved3),
            (0x144 => pdstat0periph: ReadOnly<u32, PDCTL::Register>),
            (0x148 => @END),
        }
    }

    register_structs! {
        pub IocRegisters {
            (0x000 => iocfg: [ReadWrite<u32, IOCFG::Register>; 32]),
            (0x080 => @END),
        }
    }

    register_structs! {
        pub GpioRegisters {
            (0x000 => _reserved0),
            (0x090 => dout_set: WriteOnly<u32>),
            (0x094 => _reserved1),
            (0x0A0 => dout_clr: WriteOnly<u32>),
            (0x0A4 => _reserved2),
            (0x0D0 => doe: ReadWrite<u32>),
            (0x0D4 => @END),
        }
    }

    register_bitfields![u32,
        CLKLOADCTL [
            LOAD OFFSET(0) NUMBITS(1) [],
            LOAD_DONE OFFSET(1) NUMBITS(1) []
        ],
        CLKGR [
            CLK_EN OFFSET(0) NUMBITS(1) []
        ],
        PDCTL [
            ON OFFSET(0) NUMBITS(1) []
        ],
        IOCFG [
            PULL_CTL OFFSET(13) NUMBITS(2) [
                Down = 1,
                Up = 2,
                NoPull = 3
            ],
            IE OFFSET(29) NUMBITS(1) []
        ]
    ];

    const PRCM_BASE: usize = 0x4008_2000;
    const IOC_BASE: usize = 0x4008_1000;
    const GPIO_BASE: usize = 0x4002_2000;

    pub struct Dio<'a> {
        prcm: &'a PrcmRegisters,
        ioc: &'a IocRegisters,
        gpio: &'a GpioRegisters,
    }

    impl Dio<'static> {
        /// The part's own register blocks.
        ///
        /// # Safety
        ///
        /// Only meaningful on the device, and nothing else may be driving the
        /// same DIOs.
        pub unsafe fn device() -> Self {
            Self {
                prcm: &*(PRCM_BASE as *const PrcmRegisters),
                ioc: &*(IOC_BASE as *const IocRegisters),
                gpio: &*(GPIO_BASE as *const GpioRegisters),
            }
        }
    }

    impl Dio<'_> {
        /// Powers the peripheral domain and clocks the GPIO block. Only meant
        /// to be called once, early.
        pub fn power_up(&self) {
            self.prcm.pdctl0periph.write(PDCTL::ON::SET);
            while !self.prcm.pdstat0periph.is_set(PDCTL::ON) {}
            self.prcm.gpioclkgr.write(CLKGR::CLK_EN::SET);
            self.prcm.clkloadctl.write(CLKLOADCTL::LOAD::SET);
            while !self.prcm.clkloadctl.is_set(CLKLOADCTL::LOAD_DONE) {}
        }

        /// Plain push-pull output, no pulls, no edge detection.
        pub fn make_output(&self, dio: u8) {
            self.ioc.iocfg[usize::from(dio)].write(IOCFG::PULL_CTL::NoPull);
            self.gpio.doe.set(self.gpio.doe.get() | 1 << dio);
        }

        pub fn set(&self, dio: u8) {
            self.gpio.dout_set.set(1 << dio);
        }

        pub fn clear(&self, dio: u8) {
            self.gpio.dout_clr.set(1 << dio);
        }
    }

}
