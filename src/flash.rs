// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Flash access and on-chip flash geometry.
//!
//! Everything the boot manager does to flash goes through the [`Flash`]
//! trait. On the device this is the ROM flash driver (see `romapi`); in tests
//! it is an in-memory NOR model that can lose power in the middle of an
//! operation.
//!
//! Addresses are absolute byte addresses in the internal flash, which on the
//! SimpleLink parts starts at zero.

use core::ops::Range;

/// Which of the two image slots we're talking about.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SlotId {
    One,
    Two,
}

impl SlotId {
    /// The slot that isn't this one.
    pub fn other(self) -> Self {
        match self {
            SlotId::One => SlotId::Two,
            SlotId::Two => SlotId::One,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FlashError {
    /// The access falls outside the flash array.
    OutOfBounds,
    /// The page has been write-protected for this boot session.
    Locked,
    /// The flash controller reported a programming failure.
    Program,
    /// The flash controller reported an erase failure.
    Erase,
    /// Power went away part way through the operation. Only produced by the
    /// simulated flash, but real hardware behaves the same way, minus the
    /// courtesy of telling you.
    PowerLoss,
}

/// Access to a NOR flash array.
///
/// Implementations must uphold the usual NOR rules, because the counter log
/// and the image status bytes are designed around them:
///
/// - `write` can only clear bits. Writing a 1 over a 0 leaves the 0.
/// - `erase_page` sets every byte of the page to `0xFF`.
/// - An interrupted `write` or `erase_page` may leave any prefix of the
///   operation applied.
pub trait Flash {
    /// Size of an erase page in bytes.
    fn page_size(&self) -> u32;

    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError>;

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError>;

    fn erase_page(&mut self, page: u32) -> Result<(), FlashError>;

    /// Write and erase protects `page` until the next reset.
    fn lock_page(&mut self, page: u32) -> Result<(), FlashError>;

    /// Reads a single byte. Status bytes get read this way often enough to
    /// deserve a helper.
    fn read_u8(&self, addr: u32) -> Result<u8, FlashError> {
        let mut b = [0; 1];
        self.read(addr, &mut b)?;
        Ok(b[0])
    }

    fn read_u16(&self, addr: u32) -> Result<u16, FlashError> {
        let mut b = [0; 2];
        self.read(addr, &mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    fn read_u32(&self, addr: u32) -> Result<u32, FlashError> {
        let mut b = [0; 4];
        self.read(addr, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }
}

/// A slot as a range of whole flash pages. `last_page` is inclusive, which is
/// how the board layouts are usually written down.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SlotRange {
    pub first_page: u32,
    pub last_page: u32,
}

/// The boot manager's view of the internal flash.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FlashLayout {
    pub page_size: u32,
    pub slot_one: SlotRange,
    pub slot_two: SlotRange,
    /// Page holding the security counter log.
    pub bim_info_page: u32,
}

impl FlashLayout {
    pub const fn slot(&self, slot: SlotId) -> SlotRange {
        match slot {
            SlotId::One => self.slot_one,
            SlotId::Two => self.slot_two,
        }
    }

    /// Address of the image header of `slot`, i.e. the base of its first page.
    pub const fn slot_base(&self, slot: SlotId) -> u32 {
        self.slot(slot).first_page * self.page_size
    }

    /// Byte addresses covered by `slot`.
    pub const fn slot_span(&self, slot: SlotId) -> Range<u32> {
        let s = self.slot(slot);
        s.first_page * self.page_size..(s.last_page + 1) * self.page_size
    }

    pub const fn bim_info_base(&self) -> u32 {
        self.bim_info_page * self.page_size
    }

    /// Checks the relationships that the rest of the code takes for granted:
    /// slot one below slot two, neither slot overlapping the other or the
    /// info page. Boards assert this at compile time.
    pub const fn is_consistent(&self) -> bool {
        let one = self.slot_one;
        let two = self.slot_two;
        self.page_size != 0
            && one.first_page <= one.last_page
            && two.first_page <= two.last_page
            && one.last_page < two.first_page
            && (self.bim_info_page < one.first_page
                || self.bim_info_page > two.last_page
                || (self.bim_info_page > one.last_page
                    && self.bim_info_page < two.first_page))
    }
}
