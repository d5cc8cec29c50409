// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::bsp::{dio::Dio, Bsp};
use crate::flash::{FlashLayout, SlotId, SlotRange};
use static_assertions::const_assert;

pub struct Board;

const RED_LED: u8 = 6;
const GREEN_LED: u8 = 7;

fn leds() -> Dio<'static> {
    // Safety: the boot manager is the only thing running, and nothing but
    // this board module touches the LED DIOs.
    unsafe { Dio::device() }
}

impl Bsp for Board {
    /// 704 KiB in 88 pages of 8 KiB, split down the middle around two pages
    /// of application NV storage.
    const LAYOUT: FlashLayout = FlashLayout {
        page_size: 0x2000,
        slot_one: SlotRange { first_page: 0, last_page: 41 },
        slot_two: SlotRange { first_page: 44, last_page: 85 },
        bim_info_page: 86,
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

    fn indicate_boot_choice(slot: SlotId) {
        // Green for slot one, both for slot two, so it's visible which one
        // won.
        let dio = leds();
        dio.set(GREEN_LED);
        if slot == SlotId::Two {
            dio.set(RED_LED);
        }
    }
}

const_assert!(Board::LAYOUT.is_consistent());
