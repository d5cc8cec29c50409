// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Security counter store.
//!
//! One flash page (the "BIM info page") holds an append-only log of
//! anti-rollback counters, one live value per image ID. The page looks like
//! this:
//!
//! ```text
//! +0   page head: u16 LE, 0x96FA once initialized, 0xFFFF when erased
//! +2   record 0  (10 bytes)
//! +12  record 1
//! ...  as many whole records as fit in the page
//! ```
//!
//! and each record is:
//!
//! ```text
//! +0   status           u16 LE  0xFFFF empty, 0xFCFC valid, 0xF0F0 invalid
//! +2   image_id         u16 LE
//! +4   security_counter u32 LE
//! +8   item_id          u16 LE  0x9373 on a completely written record
//! ```
//!
//! Records are never rewritten. Raising a counter tombstones the live record
//! (VALID -> INVALID is a bit-clear) and then appends a new one. That order is
//! what the whole thing rests on: if power goes away between the two steps we
//! are left with zero live records for the image, never two. An image in that
//! state still has its dead records, and the highest counter among them is
//! what `get` reports and what `update` refuses to go below.
//!
//! `item_id` sits at the end of the record so that a torn append, which
//! programs some prefix of the record, never looks like a complete one.
//!
//! There is no compaction. Once every slot has been used the page is full
//! and stays that way until something erases it.

use crate::flash::{Flash, FlashError, FlashLayout};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use static_assertions::const_assert_eq;

/// Page head value of an initialized page.
pub const SC_PAGE_VALID: u16 = 0x96FA;
/// Page head value of an erased page.
pub const SC_PAGE_ERASED: u16 = 0xFFFF;
/// Trailing marker of a completely written record.
pub const SC_ITEM_ID: u16 = 0x9373;

pub const PAGE_HEAD_SIZE: u32 = 2;
pub const ITEM_SIZE: u32 = 10;

/// Image ID whose counter the boot manager itself maintains.
pub const BOOT_IMAGE_ID: u32 = 0;

#[repr(u16)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
pub enum ScStatus {
    Empty = 0xFFFF,
    Valid = 0xFCFC,
    Invalid = 0xF0F0,
}

/// Status codes as the C side of the boot manager reports them.
#[repr(i32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
pub enum BimInfoStatus {
    Success = 0,
    Fail = 22,
    Full = 0xFF,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CounterError {
    Flash(FlashError),
    /// The page head isn't valid: `init` hasn't run since the page was last
    /// erased or scribbled on.
    Uninitialized,
    /// No live record for the requested image.
    NotFound,
    /// The request would lower a stored counter.
    Rollback,
    /// No empty record slot is left.
    Full,
    /// Image ID or counter value can't be represented in the log.
    InvalidArgument,
}

impl From<FlashError> for CounterError {
    fn from(e: FlashError) -> Self {
        Self::Flash(e)
    }
}

impl From<CounterError> for BimInfoStatus {
    fn from(e: CounterError) -> Self {
        match e {
            CounterError::Full => BimInfoStatus::Full,
            _ => BimInfoStatus::Fail,
        }
    }
}

/// One record of the log.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ScItem {
    pub status: u16,
    pub image_id: u16,
    pub security_counter: u32,
    pub item_id: u16,
}

const_assert_eq!(
    core::mem::size_of::<u16>() * 3 + core::mem::size_of::<u32>(),
    ITEM_SIZE as usize
);

impl ScItem {
    fn live(image_id: u16, security_counter: u32) -> Self {
        Self {
            status: ScStatus::Valid as u16,
            image_id,
            security_counter,
            item_id: SC_ITEM_ID,
        }
    }

    pub fn from_bytes(b: &[u8; ITEM_SIZE as usize]) -> Self {
        Self {
            status: u16::from_le_bytes([b[0], b[1]]),
            image_id: u16::from_le_bytes([b[2], b[3]]),
            security_counter: u32::from_le_bytes([b[4], b[5], b[6], b[7]]),
            item_id: u16::from_le_bytes([b[8], b[9]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; ITEM_SIZE as usize] {
        let mut b = [0; ITEM_SIZE as usize];
        b[0..2].copy_from_slice(&self.status.to_le_bytes());
        b[2..4].copy_from_slice(&self.image_id.to_le_bytes());
        b[4..8].copy_from_slice(&self.security_counter.to_le_bytes());
        b[8..10].copy_from_slice(&self.item_id.to_le_bytes());
        b
    }

    pub fn status(&self) -> Option<ScStatus> {
        ScStatus::from_u16(self.status)
    }

    /// A slot nobody has touched since the last erase.
    pub fn is_blank(&self) -> bool {
        self.status == ScStatus::Empty as u16
            && self.image_id == 0xFFFF
            && self.security_counter == 0xFFFF_FFFF
            && self.item_id == 0xFFFF
    }

    pub fn is_live_for(&self, image_id: u16) -> bool {
        self.status() == Some(ScStatus::Valid)
            && self.item_id == SC_ITEM_ID
            && self.image_id == image_id
    }

    /// A completely written record that is no longer live. That covers
    /// tombstones, and records whose tombstone was only partly programmed.
    pub fn is_dead_for(&self, image_id: u16) -> bool {
        self.item_id == SC_ITEM_ID
            && self.image_id == image_id
            && self.status != ScStatus::Empty as u16
            && self.status() != Some(ScStatus::Valid)
    }
}

/// What one pass over the log found out about a particular image.
struct Scan {
    /// Slot index and record of the live entry, if any.
    live: Option<(u32, ScItem)>,
    /// First blank slot.
    blank: Option<u32>,
    /// Highest counter among this image's dead records.
    buried: Option<u32>,
}

impl Scan {
    /// The value the log stands behind: the live record's, or failing that
    /// the highest one an interrupted update left behind.
    fn value(&self) -> Option<u32> {
        self.live.map(|(_, item)| item.security_counter).or(self.buried)
    }
}

/// Handle on the security counter log in a particular flash page.
///
/// This holds no state beyond the page location; every operation goes back to
/// flash, so it's fine to make as many of these as you like.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SecurityCounters {
    page: u32,
    base: u32,
    size: u32,
}

impl SecurityCounters {
    pub const fn new(page: u32, page_size: u32) -> Self {
        Self {
            page,
            base: page * page_size,
            size: page_size,
        }
    }

    pub const fn for_layout(layout: &FlashLayout) -> Self {
        Self::new(layout.bim_info_page, layout.page_size)
    }

    /// Number of record slots in the page. This is also the largest counter
    /// value the log will accept, since every increase costs a slot.
    pub const fn capacity(&self) -> u32 {
        (self.size - PAGE_HEAD_SIZE) / ITEM_SIZE
    }

    pub const fn page(&self) -> u32 {
        self.page
    }

    fn slot_addr(&self, index: u32) -> u32 {
        self.base + PAGE_HEAD_SIZE + index * ITEM_SIZE
    }

    fn read_item(&self, flash: &impl Flash, index: u32) -> Result<ScItem, FlashError> {
        let mut b = [0; ITEM_SIZE as usize];
        flash.read(self.slot_addr(index), &mut b)?;
        Ok(ScItem::from_bytes(&b))
    }

    fn read_head(&self, flash: &impl Flash) -> Result<u16, FlashError> {
        flash.read_u16(self.base)
    }

    /// Brings the page into a usable state. Safe to call on every boot.
    ///
    /// - Initialized page: nothing to do, except writing image 0's first
    ///   record if the previous initialization lost power after the head
    ///   went in. Whatever part of that record did make it is left alone and
    ///   the record goes in the next blank slot.
    /// - Erased page: write the head and a zero counter for image 0.
    /// - Anything else: erase, then as for an erased page. Whatever counter
    ///   history was there is lost; a page we can't parse is worth nothing.
    pub fn init(&self, flash: &mut impl Flash) -> Result<(), CounterError> {
        match self.read_head(&*flash)? {
            SC_PAGE_VALID => {
                let boot = BOOT_IMAGE_ID as u16;
                let scan = self.scan(&*flash, boot)?;
                if scan.value().is_none() {
                    log::warn!("counter page has no record for image 0, finishing init");
                    let blank = scan.blank.ok_or(CounterError::Full)?;
                    self.write_item(flash, blank, &ScItem::live(boot, 0))?;
                }
                Ok(())
            }
            SC_PAGE_ERASED if self.is_blank(&*flash)? => self.format(flash),
            head => {
                log::warn!("counter page head {:#06x} is corrupt, erasing", head);
                flash.erase_page(self.page)?;
                self.format(flash)
            }
        }
    }

    fn format(&self, flash: &mut impl Flash) -> Result<(), CounterError> {
        flash.write(self.base, &SC_PAGE_VALID.to_le_bytes())?;
        self.write_item(flash, 0, &ScItem::live(BOOT_IMAGE_ID as u16, 0))?;
        log::info!("counter page formatted, {} slots", self.capacity());
        Ok(())
    }

    /// An erase that was cut short can leave the head erased and garbage
    /// further in, so an erased head alone doesn't make a blank page.
    fn is_blank(&self, flash: &impl Flash) -> Result<bool, FlashError> {
        let mut chunk = [0u8; 64];
        let mut offset = 0;
        while offset < self.size {
            let n = chunk.len().min((self.size - offset) as usize);
            flash.read(self.base + offset, &mut chunk[..n])?;
            if chunk[..n].iter().any(|&b| b != 0xFF) {
                return Ok(false);
            }
            offset += n as u32;
        }
        Ok(true)
    }

    fn scan(&self, flash: &impl Flash, image_id: u16) -> Result<Scan, FlashError> {
        let mut scan = Scan {
            live: None,
            blank: None,
            buried: None,
        };
        for index in 0..self.capacity() {
            let item = self.read_item(flash, index)?;
            if item.is_live_for(image_id) {
                // First hit wins, same as the lookup has always worked.
                if scan.live.is_none() {
                    scan.live = Some((index, item));
                }
            } else if item.is_dead_for(image_id) {
                scan.buried = scan.buried.max(Some(item.security_counter));
            } else if item.is_blank() && scan.blank.is_none() {
                scan.blank = Some(index);
            }
        }
        Ok(scan)
    }

    fn write_item(
        &self,
        flash: &mut impl Flash,
        index: u32,
        item: &ScItem,
    ) -> Result<(), FlashError> {
        flash.write(self.slot_addr(index), &item.to_bytes())
    }

    fn image_key(image_id: u32) -> Result<u16, CounterError> {
        u16::try_from(image_id).map_err(|_| CounterError::InvalidArgument)
    }

    /// Returns the counter for `image_id`.
    ///
    /// That's the live record's value. After an update that lost power
    /// between tombstone and append there is no live record, and the value is
    /// the one that update was replacing.
    pub fn get(&self, flash: &impl Flash, image_id: u32) -> Result<u32, CounterError> {
        if self.read_head(flash)? != SC_PAGE_VALID {
            return Err(CounterError::Uninitialized);
        }
        let key = Self::image_key(image_id)?;
        self.scan(flash, key)?.value().ok_or(CounterError::NotFound)
    }

    /// Raises the counter for `image_id` to `value`.
    ///
    /// Asking for the current value is a no-op. Asking for a lower value
    /// fails without touching flash.
    pub fn update(
        &self,
        flash: &mut impl Flash,
        image_id: u32,
        value: u32,
    ) -> Result<(), CounterError> {
        if value > self.capacity() {
            return Err(CounterError::InvalidArgument);
        }
        if self.read_head(&*flash)? != SC_PAGE_VALID {
            return Err(CounterError::Uninitialized);
        }
        let key = Self::image_key(image_id)?;
        let scan = self.scan(&*flash, key)?;

        match scan.live {
            Some((_, current)) if current.security_counter == value => Ok(()),
            Some((_, current)) if current.security_counter > value => {
                log::warn!(
                    "refusing counter {} for image {}, stored {}",
                    value,
                    image_id,
                    current.security_counter
                );
                Err(CounterError::Rollback)
            }
            live => {
                // A torn update can leave an image with dead records and no
                // live one. The dead records still bound it from below.
                if live.is_none() && scan.buried.map_or(false, |b| b > value) {
                    return Err(CounterError::Rollback);
                }
                let blank = scan.blank.ok_or(CounterError::Full)?;
                if let Some((index, _)) = live {
                    flash.write(
                        self.slot_addr(index),
                        &(ScStatus::Invalid as u16).to_le_bytes(),
                    )?;
                }
                self.write_item(flash, blank, &ScItem::live(key, value))?;
                log::info!("image {} counter now {}", image_id, value);
                Ok(())
            }
        }
    }

    /// Write protects the page for the rest of this boot.
    pub fn lock(&self, flash: &mut impl Flash) -> Result<(), CounterError> {
        flash.lock_page(self.page)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimFlash;
    use proptest::prelude::*;

    // Two pages; the counter log lives in page 1.
    const PAGE_SIZE: u32 = 2048;

    fn store() -> (SimFlash, SecurityCounters) {
        (SimFlash::new(PAGE_SIZE, 2), SecurityCounters::new(1, PAGE_SIZE))
    }

    fn records(flash: &SimFlash, sc: &SecurityCounters) -> Vec<ScItem> {
        (0..sc.capacity())
            .map(|i| sc.read_item(flash, i).unwrap())
            .collect()
    }

    fn live_count(flash: &SimFlash, sc: &SecurityCounters, image_id: u16) -> usize {
        records(flash, sc)
            .iter()
            .filter(|r| r.is_live_for(image_id))
            .count()
    }

    #[test]
    fn record_layout() {
        let item = ScItem::live(0x0102, 0x0A0B0C0D);
        assert_eq!(
            item.to_bytes(),
            [0xFC, 0xFC, 0x02, 0x01, 0x0D, 0x0C, 0x0B, 0x0A, 0x73, 0x93]
        );
        assert_eq!(ScItem::from_bytes(&item.to_bytes()), item);
    }

    #[test]
    fn init_formats_a_blank_page() {
        let (mut flash, sc) = store();
        sc.init(&mut flash).unwrap();

        assert_eq!(flash.read_u16(PAGE_SIZE).unwrap(), SC_PAGE_VALID);
        assert_eq!(sc.get(&flash, 0).unwrap(), 0);
        assert_eq!(flash.erases, 0);
    }

    #[test]
    fn init_is_idempotent() {
        let (mut flash, sc) = store();
        sc.init(&mut flash).unwrap();
        sc.update(&mut flash, 0, 3).unwrap();
        sc.update(&mut flash, 7, 1).unwrap();
        let before = flash.bytes().to_vec();

        sc.init(&mut flash).unwrap();
        assert_eq!(flash.bytes(), &before[..]);
        assert_eq!(sc.get(&flash, 0).unwrap(), 3);
        assert_eq!(sc.get(&flash, 7).unwrap(), 1);
    }

    #[test]
    fn init_recovers_a_corrupt_page() {
        let (mut flash, sc) = store();
        flash.load(PAGE_SIZE, &[0x12, 0x34, 0xAA, 0xBB]);
        sc.init(&mut flash).unwrap();

        assert_eq!(flash.erases, 1);
        assert_eq!(sc.get(&flash, 0).unwrap(), 0);
        assert_eq!(records(&flash, &sc)[1..].iter().filter(|r| !r.is_blank()).count(), 0);
    }

    #[test]
    fn init_recovers_a_half_erased_page() {
        let (mut flash, sc) = store();
        // Head erased, junk further in.
        flash.load(PAGE_SIZE + 100, &[0x00; 8]);
        sc.init(&mut flash).unwrap();

        assert_eq!(flash.erases, 1);
        assert_eq!(sc.get(&flash, 0).unwrap(), 0);
    }

    #[test]
    fn init_finishes_after_losing_power_behind_the_head() {
        let (mut flash, sc) = store();
        // Enough for the head and nothing else.
        flash.cut_power_after(PAGE_HEAD_SIZE as usize);
        assert!(sc.init(&mut flash).is_err());
        flash.power_cycle();

        assert_eq!(sc.get(&flash, 0), Err(CounterError::NotFound));
        sc.init(&mut flash).unwrap();
        assert_eq!(sc.get(&flash, 0).unwrap(), 0);
    }

    #[test]
    fn init_survives_power_loss_anywhere() {
        for cut in 0..=(PAGE_HEAD_SIZE + ITEM_SIZE) as usize {
            let (mut flash, sc) = store();
            flash.cut_power_after(cut);
            let _ = sc.init(&mut flash);
            flash.power_cycle();

            sc.init(&mut flash).unwrap();
            assert_eq!(sc.get(&flash, 0).unwrap(), 0, "cut after {cut} bytes");
            assert_eq!(live_count(&flash, &sc, 0), 1, "cut after {cut} bytes");

            // And it stays put.
            let before = flash.bytes().to_vec();
            sc.init(&mut flash).unwrap();
            assert_eq!(flash.bytes(), &before[..], "cut after {cut} bytes");
        }
    }

    #[test]
    fn init_survives_power_loss_after_recovery_erase() {
        let erase = PAGE_SIZE as usize;
        for cut in erase..=erase + (PAGE_HEAD_SIZE + ITEM_SIZE) as usize {
            let (mut flash, sc) = store();
            flash.load(PAGE_SIZE, &[0x00, 0x11]);
            flash.cut_power_after(cut);
            let _ = sc.init(&mut flash);
            flash.power_cycle();

            sc.init(&mut flash).unwrap();
            assert_eq!(sc.get(&flash, 0).unwrap(), 0, "cut after {cut} bytes");
            assert_eq!(live_count(&flash, &sc, 0), 1, "cut after {cut} bytes");
        }
    }

    #[test]
    fn get_misses() {
        let (mut flash, sc) = store();
        assert_eq!(sc.get(&flash, 0), Err(CounterError::Uninitialized));
        flash.load(PAGE_SIZE, &[0x01, 0x02]);
        assert_eq!(sc.get(&flash, 0), Err(CounterError::Uninitialized));
        sc.init(&mut flash).unwrap();
        assert_eq!(sc.get(&flash, 5), Err(CounterError::NotFound));
        assert_eq!(sc.get(&flash, 0x1_0000), Err(CounterError::InvalidArgument));
    }

    #[test]
    fn image_ids_are_sixteen_bits() {
        let (mut flash, sc) = store();
        sc.init(&mut flash).unwrap();
        let before = flash.bytes().to_vec();

        assert_eq!(
            sc.update(&mut flash, 0x1_0000, 1),
            Err(CounterError::InvalidArgument)
        );
        assert_eq!(flash.bytes(), &before[..]);
        // No aliasing onto image 0 either.
        assert_eq!(sc.get(&flash, 0).unwrap(), 0);

        sc.update(&mut flash, 0xFFFF, 1).unwrap();
        assert_eq!(sc.get(&flash, 0xFFFF).unwrap(), 1);
    }

    #[test]
    fn update_appends_and_tombstones() {
        let (mut flash, sc) = store();
        sc.init(&mut flash).unwrap();
        sc.update(&mut flash, 0, 4).unwrap();

        let r = records(&flash, &sc);
        assert_eq!(r[0].status(), Some(ScStatus::Invalid));
        assert_eq!(r[0].security_counter, 0);
        assert!(r[1].is_live_for(0));
        assert_eq!(r[1].security_counter, 4);
        assert!(r[2].is_blank());
    }

    #[test]
    fn update_is_idempotent() {
        let (mut flash, sc) = store();
        sc.init(&mut flash).unwrap();
        sc.update(&mut flash, 2, 9).unwrap();
        let writes = flash.writes;
        sc.update(&mut flash, 2, 9).unwrap();

        assert_eq!(flash.writes, writes);
        assert_eq!(live_count(&flash, &sc, 2), 1);
        assert_eq!(sc.get(&flash, 2).unwrap(), 9);
    }

    #[test]
    fn update_refuses_to_go_backwards() {
        let (mut flash, sc) = store();
        sc.init(&mut flash).unwrap();
        sc.update(&mut flash, 0, 10).unwrap();
        let before = flash.bytes().to_vec();

        assert_eq!(sc.update(&mut flash, 0, 9), Err(CounterError::Rollback));
        assert_eq!(flash.bytes(), &before[..]);
        assert_eq!(sc.get(&flash, 0).unwrap(), 10);
    }

    #[test]
    fn update_bounds_value_by_capacity() {
        let (mut flash, sc) = store();
        sc.init(&mut flash).unwrap();
        assert_eq!(sc.capacity(), 204);
        assert_eq!(
            sc.update(&mut flash, 0, 205),
            Err(CounterError::InvalidArgument)
        );
        sc.update(&mut flash, 0, 204).unwrap();
    }

    #[test]
    fn update_needs_an_initialized_page() {
        let (mut flash, sc) = store();
        assert_eq!(sc.update(&mut flash, 0, 1), Err(CounterError::Uninitialized));
    }

    #[test]
    fn page_fills_up() {
        // 2048-byte page: (2048 - 2) / 10 = 204 slots, one of which init
        // spends on image 0.
        let (mut flash, sc) = store();
        sc.init(&mut flash).unwrap();
        for image in 1..204 {
            sc.update(&mut flash, image, 1).unwrap();
        }
        let before = flash.bytes().to_vec();

        assert_eq!(sc.update(&mut flash, 204, 1), Err(CounterError::Full));
        // Raising needs a fresh slot too, and must not tombstone the old one
        // when there's nowhere to put the new one.
        assert_eq!(sc.update(&mut flash, 0, 1), Err(CounterError::Full));
        assert_eq!(flash.bytes(), &before[..]);
        assert_eq!(sc.get(&flash, 0).unwrap(), 0);
        // Idempotent updates don't need space.
        assert_eq!(sc.update(&mut flash, 5, 1), Ok(()));
        assert_eq!(BimInfoStatus::from(CounterError::Full) as i32, 0xFF);
    }

    #[test]
    fn torn_update_fails_clean_and_retries() {
        let (mut flash, sc) = store();
        sc.init(&mut flash).unwrap();
        sc.update(&mut flash, 0, 3).unwrap();

        // The tombstone is two bytes; lose power right after it lands.
        flash.cut_power_after(2);
        assert_eq!(
            sc.update(&mut flash, 0, 5),
            Err(CounterError::Flash(FlashError::PowerLoss))
        );
        flash.power_cycle();

        // No live record, but the dead one still remembers 3.
        assert_eq!(live_count(&flash, &sc, 0), 0);
        assert_eq!(sc.get(&flash, 0), Ok(3));
        assert_eq!(sc.update(&mut flash, 0, 2), Err(CounterError::Rollback));
        sc.update(&mut flash, 0, 5).unwrap();
        assert_eq!(sc.get(&flash, 0).unwrap(), 5);
        assert_eq!(live_count(&flash, &sc, 0), 1);
    }

    #[test]
    fn half_written_tombstone_still_bounds_the_counter() {
        let (mut flash, sc) = store();
        sc.init(&mut flash).unwrap();
        sc.update(&mut flash, 0, 3).unwrap();

        flash.cut_power_after(1);
        assert!(sc.update(&mut flash, 0, 5).is_err());
        flash.power_cycle();

        let dead = records(&flash, &sc)[1];
        assert_eq!(dead.status, 0xFCF0);
        assert!(dead.is_dead_for(0));
        assert!(!dead.is_live_for(0));

        assert_eq!(sc.get(&flash, 0), Ok(3));
        assert_eq!(sc.update(&mut flash, 0, 2), Err(CounterError::Rollback));
        assert_eq!(sc.get(&flash, 0), Ok(3));

        // Re-raising to the same value brings back a live record.
        sc.update(&mut flash, 0, 3).unwrap();
        assert_eq!(live_count(&flash, &sc, 0), 1);
        sc.update(&mut flash, 0, 5).unwrap();
        assert_eq!(sc.get(&flash, 0), Ok(5));
    }

    #[test]
    fn torn_update_reads_back_the_old_value() {
        for cut in 0..(2 + ITEM_SIZE as usize) {
            let (mut flash, sc) = store();
            sc.init(&mut flash).unwrap();
            sc.update(&mut flash, 0, 3).unwrap();

            flash.cut_power_after(cut);
            assert!(sc.update(&mut flash, 0, 5).is_err());
            flash.power_cycle();

            assert_eq!(sc.get(&flash, 0), Ok(3), "cut after {cut}");
            assert_eq!(
                sc.update(&mut flash, 0, 2),
                Err(CounterError::Rollback),
                "cut after {cut}"
            );
            sc.update(&mut flash, 0, 5).unwrap();
            assert_eq!(sc.get(&flash, 0).unwrap(), 5);
            assert_eq!(live_count(&flash, &sc, 0), 1);
        }
    }

    #[test]
    fn lock_blocks_writes() {
        let (mut flash, sc) = store();
        sc.init(&mut flash).unwrap();
        sc.lock(&mut flash).unwrap();
        assert_eq!(
            sc.update(&mut flash, 0, 1),
            Err(CounterError::Flash(FlashError::Locked))
        );
        assert_eq!(sc.get(&flash, 0).unwrap(), 0);
    }

    proptest! {
        #[test]
        fn stored_values_never_decrease(
            ops in proptest::collection::vec((0u32..4, 0u32..40), 1..60)
        ) {
            let (mut flash, sc) = store();
            sc.init(&mut flash).unwrap();
            let mut seen = [None::<u32>; 4];

            for (image, value) in ops {
                let before = sc.get(&flash, image).ok();
                let result = sc.update(&mut flash, image, value);
                let after = sc.get(&flash, image).ok();

                match before {
                    Some(b) if value < b => {
                        prop_assert_eq!(result, Err(CounterError::Rollback));
                        prop_assert_eq!(after, Some(b));
                    }
                    _ => {
                        if result.is_ok() {
                            prop_assert_eq!(after, Some(value));
                        }
                    }
                }
                if let (Some(prev), Some(now)) = (seen[image as usize], after) {
                    prop_assert!(now >= prev);
                }
                if after.is_some() {
                    seen[image as usize] = after;
                }
                for id in 0..4u16 {
                    prop_assert!(live_count(&flash, &sc, id) <= 1);
                }
            }
        }

        #[test]
        fn power_loss_never_yields_two_live_records(
            raises in proptest::collection::vec(1u32..20, 1..10),
            cut in 0usize..200,
        ) {
            let (mut flash, sc) = store();
            sc.init(&mut flash).unwrap();
            flash.cut_power_after(cut);
            let mut floor = 0;
            for value in raises {
                if sc.update(&mut flash, 0, floor.max(value)).is_err() {
                    break;
                }
                floor = floor.max(value);
            }
            flash.power_cycle();

            prop_assert!(live_count(&flash, &sc, 0) <= 1);
            let stored = sc.get(&flash, 0);
            prop_assert!(matches!(stored, Ok(v) if v >= floor), "{:?} below {}", stored, floor);
            // Nothing lower gets past whatever was left behind.
            if floor > 0 {
                prop_assert_eq!(
                    sc.update(&mut flash, 0, floor - 1),
                    Err(CounterError::Rollback)
                );
            }
        }
    }
}
