// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::bsp::{dio::Dio, Bsp};
use crate::flash::{FlashLayout, SlotId, SlotRange};
use static_assertions::const_assert;

pub struct Board;

// LEDs are active high.
const RED_LED: u8 = 6;
const GREEN_LED: u8 = 7;

fn leds() -> Dio<'static> {
    // Safety: the boot manager is the only thing running, and nothing but
    // this board module touches the LED DIOs.
    unsafe { Dio::device() }
}

impl Bsp for Board {
    /// 352 KiB in 44 pages of 8 KiB. Pages 21 and 22 belong to the
    /// application's NV storage, page 43 is us and the CCFG.
    const LAYOUT: FlashLayout = FlashLayout {
        page_size: 0x2000,
        slot_one: SlotRange { first_page: 0, last_page: 20 },
        slot_two: SlotRange { first_page: 23, last_page: 41 },
        bim_info_page: 42,
    };

    fn configure() {
        let dio = leds();
        dio.power_up();
        dio.make_output(RED_LED);
        dio.make_output(GREEN_LED);
    }

    fn indicate_fault() {
        leds().set(RED_LED)
    }

    fn clear_fault() {
        leds().clear(RED_LED)
    }

    fn indicate_boot_choice(_slot: SlotId) {
        leds().set(GREEN_LED)
    }
}

const_assert!(Board::LAYOUT.is_consistent());
