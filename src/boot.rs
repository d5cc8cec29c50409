// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Dual-slot image selection.
//!
//! Each boot, both slots are classified on their own (is there an image, and
//! is it one we'd run?) and then compared against each other. Whatever is
//! decided gets written back into the images' status bytes so that the next
//! boot reaches the same decision without redoing the comparison from
//! scratch:
//!
//! - a freshly downloaded image has `verif_stat == Default` and is the
//!   *candidate*; the other valid image is the *incumbent*;
//! - the winner is marked `PassCurrent`;
//! - the loser is marked `Fail` (or erased), or, with restricted rollback,
//!   an accepted upgrade's predecessor is marked `PassNotCurrent` and kept
//!   around until the new image commits itself.
//!
//! Nothing here ever runs an image whose security version is lower than that
//! of another valid image, or lower than the stored anti-rollback floor.

use crate::auth::Authenticator;
use crate::counter::{CounterError, SecurityCounters, BOOT_IMAGE_ID};
use crate::flash::{Flash, FlashError, FlashLayout, SlotId};
use crate::image::{self, CommitFlag, CrcStat, VerifStat};
use num_traits::FromPrimitive;

/// Boot manager behavior, fixed at build time.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BootConfig {
    /// Erase rejected images instead of just marking them failed.
    pub erase_invalid_image: bool,
    /// Also compare software versions when deciding between two images.
    pub verify_software_version: bool,
    /// Keep the previous image bootable until the new one commits.
    pub restricted_rollback: bool,
    /// Refuse images without a signed security segment.
    pub require_signature: bool,
    /// Refuse images below the stored security counter, and raise it to
    /// whatever gets booted.
    pub enforce_counter_floor: bool,
    pub image_type: u8,
}

impl BootConfig {
    pub const fn new() -> Self {
        Self {
            erase_invalid_image: false,
            verify_software_version: false,
            restricted_rollback: false,
            require_signature: true,
            enforce_counter_floor: true,
            image_type: image::IMG_TYPE_APPSTACKLIB,
        }
    }

    pub const fn from_features() -> Self {
        Self {
            erase_invalid_image: cfg!(feature = "erase-invalid-image"),
            verify_software_version: cfg!(feature = "verify-version-image"),
            restricted_rollback: cfg!(feature = "restricted-rollback"),
            require_signature: !cfg!(feature = "allow-unsigned-images"),
            ..Self::new()
        }
    }
}

impl Default for BootConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Why an image was turned down.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Reject {
    ImageType,
    /// `img_vld` has an odd number of bits set.
    Parity,
    /// The application rejected itself.
    CommitRejected,
    Version,
    Crc,
    Bounds,
    /// No signed security segment.
    Unsigned,
    Signature,
    /// `verif_stat` holds something no legal transition produces.
    Status,
    Entry,
    /// Security version below the stored floor.
    Rollback,
}

/// What we know about an image that passed every check.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ValidImage {
    pub entry: u32,
    pub sec_ver: u8,
    pub soft_ver: u32,
    pub verif_stat: VerifStat,
    pub committed: bool,
    /// Offset of the security segment, which is where `verif_stat` lives.
    /// Images without one have nowhere to keep a status.
    pub sec_offset: Option<u32>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SlotStatus {
    NoImage,
    Invalid {
        reason: Reject,
        sec_offset: Option<u32>,
    },
    Valid(ValidImage),
}

impl SlotStatus {
    pub const IMG_PRESENT: u8 = 1 << 0;
    pub const IMG_VALID: u8 = 1 << 1;

    fn invalid(reason: Reject, sec_offset: Option<u32>) -> Self {
        SlotStatus::Invalid { reason, sec_offset }
    }

    /// Status as the present/valid bit pair.
    pub fn bits(&self) -> u8 {
        match self {
            SlotStatus::NoImage => 0,
            SlotStatus::Invalid { .. } => Self::IMG_PRESENT,
            SlotStatus::Valid(_) => Self::IMG_PRESENT | Self::IMG_VALID,
        }
    }

    pub fn is_present(&self) -> bool {
        !matches!(self, SlotStatus::NoImage)
    }

    pub fn valid(&self) -> Option<ValidImage> {
        match self {
            SlotStatus::Valid(v) => Some(*v),
            _ => None,
        }
    }

    fn sec_offset(&self) -> Option<u32> {
        match self {
            SlotStatus::NoImage => None,
            SlotStatus::Invalid { sec_offset, .. } => *sec_offset,
            SlotStatus::Valid(v) => v.sec_offset,
        }
    }
}

/// The image to jump to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BootTarget {
    pub slot: SlotId,
    /// Address of the image's vector table.
    pub entry: u32,
    pub sec_ver: u8,
    /// The other slot still holds an image we may fall back to.
    pub grace: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BootError {
    Flash(FlashError),
    Counter(CounterError),
    NoValidImage,
    /// Both images have been decided on before, but their statuses don't say
    /// which one is current.
    AmbiguousStatus,
}

impl From<FlashError> for BootError {
    fn from(e: FlashError) -> Self {
        Self::Flash(e)
    }
}

impl From<CounterError> for BootError {
    fn from(e: CounterError) -> Self {
        Self::Counter(e)
    }
}

fn slot_index(slot: SlotId) -> usize {
    match slot {
        SlotId::One => 0,
        SlotId::Two => 1,
    }
}

/// One boot's worth of decision making.
pub struct Selector<'a, F, A> {
    flash: &'a mut F,
    auth: &'a A,
    layout: FlashLayout,
    config: BootConfig,
    /// Lowest security version we'll run. Zero until `run` reads it.
    floor: u32,
    slots: [SlotStatus; 2],
}

impl<'a, F: Flash, A: Authenticator> Selector<'a, F, A> {
    pub fn new(flash: &'a mut F, auth: &'a A, layout: FlashLayout, config: BootConfig) -> Self {
        Self {
            flash,
            auth,
            layout,
            config,
            floor: 0,
            slots: [SlotStatus::NoImage; 2],
        }
    }

    pub fn status(&self, slot: SlotId) -> SlotStatus {
        self.slots[slot_index(slot)]
    }

    /// The whole boot flow, short of jumping: bring up the counter page,
    /// pick an image, raise the floor to it and lock the counter page.
    pub fn run(&mut self) -> Result<BootTarget, BootError> {
        let counters = SecurityCounters::for_layout(&self.layout);
        counters.init(&mut *self.flash)?;
        if self.config.enforce_counter_floor {
            self.floor = counters.get(&*self.flash, BOOT_IMAGE_ID)?;
            log::debug!("security counter floor {}", self.floor);
        }

        self.find_image(SlotId::One)?;
        self.find_image(SlotId::Two)?;
        let target = self.decide()?;

        if self.config.enforce_counter_floor && !target.grace {
            // The stored floor never goes down, so failing to raise it leaves
            // us no less safe than we were. Boot anyway.
            if let Err(e) =
                counters.update(&mut *self.flash, BOOT_IMAGE_ID, u32::from(target.sec_ver))
            {
                log::warn!("couldn't raise floor to {}: {:?}", target.sec_ver, e);
            }
        }
        counters.lock(&mut *self.flash)?;
        Ok(target)
    }

    /// Classifies the image in `slot` and remembers the result.
    pub fn find_image(&mut self, slot: SlotId) -> Result<SlotStatus, BootError> {
        let status = self.classify(slot)?;
        match status {
            SlotStatus::NoImage => log::info!("slot {:?}: empty", slot),
            SlotStatus::Invalid { reason, .. } => {
                log::warn!("slot {:?}: rejected, {:?}", slot, reason)
            }
            SlotStatus::Valid(v) => log::info!(
                "slot {:?}: valid, sec_ver {} soft_ver {:#x} {:?}",
                slot,
                v.sec_ver,
                v.soft_ver,
                v.verif_stat
            ),
        }
        self.slots[slot_index(slot)] = status;
        Ok(status)
    }

    fn classify(&mut self, slot: SlotId) -> Result<SlotStatus, FlashError> {
        let base = self.layout.slot_base(slot);
        let span = self.layout.slot_span(slot);
        let cfg = self.config;
        let hdr = image::read_header(&*self.flash, base)?;

        if !hdr.has_image_id() {
            return Ok(SlotStatus::NoImage);
        }
        if hdr.img_type != cfg.image_type {
            return Ok(SlotStatus::invalid(Reject::ImageType, None));
        }
        if !hdr.has_even_parity() {
            return Ok(SlotStatus::invalid(Reject::Parity, None));
        }
        if cfg.restricted_rollback && hdr.commit_flag == CommitFlag::Rejected as u8 {
            return Ok(SlotStatus::invalid(Reject::CommitRejected, None));
        }
        if hdr.bim_ver != image::BIM_VER || hdr.meta_ver != image::META_VER {
            return Ok(SlotStatus::invalid(Reject::Version, None));
        }
        let crc_stat = CrcStat::from_u8(hdr.crc_stat);
        if !matches!(crc_stat, Some(CrcStat::NotComputed | CrcStat::Valid)) {
            return Ok(SlotStatus::invalid(Reject::Crc, None));
        }

        // Everything past here reads the image body, so make sure the body
        // is inside the slot first.
        let len = hdr.len();
        let in_bounds = len >= image::OAD_IMG_HDR_LEN
            && base.checked_add(len).map_or(false, |end| end <= span.end);
        if !in_bounds {
            return Ok(SlotStatus::invalid(Reject::Bounds, None));
        }

        let sec_offset = image::find_security_segment(&*self.flash, base, len)?;

        if crc_stat == Some(CrcStat::NotComputed) {
            let crc = image::compute_crc(&*self.flash, base, len, sec_offset)?;
            let stat = if crc == hdr.crc32() {
                CrcStat::Valid
            } else {
                CrcStat::Invalid
            };
            self.flash.write(base + image::CRC_STAT_OFFSET, &[stat as u8])?;
            if stat == CrcStat::Invalid {
                return Ok(SlotStatus::invalid(Reject::Crc, sec_offset));
            }
        }

        let (sec_ver, verif_stat) = match sec_offset {
            Some(offset) => {
                let info = image::read_security_info(&*self.flash, base, offset)?;
                let stat = match VerifStat::from_u8(info.verif_stat) {
                    // Already failed once. No need to spend another ECDSA
                    // verification finding that out.
                    Some(VerifStat::Fail) => {
                        return Ok(SlotStatus::invalid(Reject::Signature, sec_offset))
                    }
                    None => return Ok(SlotStatus::invalid(Reject::Status, sec_offset)),
                    Some(stat) => stat,
                };
                let digest = image::signed_digest(&*self.flash, base, len, offset)?;
                if !self
                    .auth
                    .verify_image(&info.signer_info, &digest, &info.signature)
                {
                    self.write_verif_stat(base, offset, VerifStat::Fail)?;
                    return Ok(SlotStatus::invalid(Reject::Signature, sec_offset));
                }
                (info.sec_ver, stat)
            }
            None if cfg.require_signature => {
                return Ok(SlotStatus::invalid(Reject::Unsigned, None));
            }
            None => (0, VerifStat::Default),
        };

        let entry = hdr.prg_entry();
        if !(base..base + len).contains(&entry) {
            return Ok(SlotStatus::invalid(Reject::Entry, sec_offset));
        }
        if cfg.enforce_counter_floor && u32::from(sec_ver) < self.floor {
            return Ok(SlotStatus::invalid(Reject::Rollback, sec_offset));
        }

        Ok(SlotStatus::Valid(ValidImage {
            entry,
            sec_ver,
            soft_ver: hdr.soft_ver(),
            verif_stat,
            committed: hdr.commit_flag == CommitFlag::Accepted as u8,
            sec_offset,
        }))
    }

    /// Picks the image to boot from the classified slots, and records the
    /// decision in flash.
    pub fn decide(&mut self) -> Result<BootTarget, BootError> {
        let one = self.status(SlotId::One).valid();
        let two = self.status(SlotId::Two).valid();
        let target = match (one, two) {
            (None, None) => {
                log::error!("no valid image");
                return Err(BootError::NoValidImage);
            }
            (Some(img), None) => self.boot_only(SlotId::One, img)?,
            (None, Some(img)) => self.boot_only(SlotId::Two, img)?,
            (Some(a), Some(b)) => self.boot_either(a, b)?,
        };
        log::info!(
            "booting slot {:?} at {:#x}, sec_ver {}{}",
            target.slot,
            target.entry,
            target.sec_ver,
            if target.grace { ", other slot kept" } else { "" }
        );
        Ok(target)
    }

    fn boot_only(&mut self, slot: SlotId, img: ValidImage) -> Result<BootTarget, BootError> {
        if self.status(slot.other()).is_present() {
            self.invalidate(slot.other())?;
        }
        self.mark(slot, VerifStat::PassCurrent)?;
        Ok(Self::target(slot, &img, false))
    }

    fn boot_either(&mut self, a: ValidImage, b: ValidImage) -> Result<BootTarget, BootError> {
        use SlotId::{One, Two};
        use VerifStat::{Default, PassCurrent, PassNotCurrent};

        match (a.verif_stat, b.verif_stat) {
            // Two images nobody has decided on, e.g. straight out of
            // production programming. Treat the one with the higher security
            // version as the newcomer, and on a tie let slot one stand.
            (Default, Default) => {
                if a.sec_ver > b.sec_ver {
                    self.contest((One, a), (Two, b))
                } else {
                    self.contest((Two, b), (One, a))
                }
            }
            (Default, _) => self.contest((One, a), (Two, b)),
            (_, Default) => self.contest((Two, b), (One, a)),
            (PassCurrent, PassNotCurrent) => self.settled((One, a), (Two, b)),
            (PassNotCurrent, PassCurrent) => self.settled((Two, b), (One, a)),
            (x, y) => {
                log::error!("can't tell which image is current: {:?} {:?}", x, y);
                Err(BootError::AmbiguousStatus)
            }
        }
    }

    /// A new image against the one we've been running.
    fn contest(
        &mut self,
        (cand_slot, cand): (SlotId, ValidImage),
        (inc_slot, inc): (SlotId, ValidImage),
    ) -> Result<BootTarget, BootError> {
        let check_soft = self.config.verify_software_version;
        let accept = if cand.sec_ver != inc.sec_ver {
            cand.sec_ver > inc.sec_ver && (!check_soft || cand.soft_ver >= inc.soft_ver)
        } else {
            check_soft && cand.soft_ver > inc.soft_ver
        };

        if accept {
            log::info!("slot {:?} supersedes slot {:?}", cand_slot, inc_slot);
            let grace = self.config.restricted_rollback;
            if grace {
                self.mark(inc_slot, VerifStat::PassNotCurrent)?;
            } else {
                self.invalidate(inc_slot)?;
            }
            self.mark(cand_slot, VerifStat::PassCurrent)?;
            Ok(Self::target(cand_slot, &cand, grace))
        } else {
            log::warn!("slot {:?} doesn't supersede slot {:?}", cand_slot, inc_slot);
            self.invalidate(cand_slot)?;
            self.mark(inc_slot, VerifStat::PassCurrent)?;
            Ok(Self::target(inc_slot, &inc, false))
        }
    }

    /// Both images decided on in an earlier boot.
    fn settled(
        &mut self,
        (cur_slot, cur): (SlotId, ValidImage),
        (sib_slot, sib): (SlotId, ValidImage),
    ) -> Result<BootTarget, BootError> {
        if sib.sec_ver > cur.sec_ver {
            // Only reachable by somebody clearing status bits by hand. The
            // security version outranks the status.
            log::warn!("slot {:?} outranks the current slot", sib_slot);
            return Ok(Self::target(sib_slot, &sib, false));
        }
        if self.config.restricted_rollback && cur.committed {
            log::info!("slot {:?} committed, dropping slot {:?}", cur_slot, sib_slot);
            self.invalidate(sib_slot)?;
            return Ok(Self::target(cur_slot, &cur, false));
        }
        Ok(Self::target(cur_slot, &cur, true))
    }

    fn target(slot: SlotId, img: &ValidImage, grace: bool) -> BootTarget {
        BootTarget {
            slot,
            entry: img.entry,
            sec_ver: img.sec_ver,
            grace,
        }
    }

    fn write_verif_stat(
        &mut self,
        base: u32,
        sec_offset: u32,
        stat: VerifStat,
    ) -> Result<(), FlashError> {
        let addr = base + sec_offset + image::SEC_VERIF_STAT_OFFSET;
        if self.flash.read_u8(addr)? == stat as u8 {
            return Ok(());
        }
        self.flash.write(addr, &[stat as u8])
    }

    fn mark(&mut self, slot: SlotId, stat: VerifStat) -> Result<(), FlashError> {
        match self.status(slot).sec_offset() {
            Some(offset) => self.write_verif_stat(self.layout.slot_base(slot), offset, stat),
            None => {
                log::debug!("slot {:?} has no security segment to mark", slot);
                Ok(())
            }
        }
    }

    /// Makes sure the image in `slot` is never considered again.
    fn invalidate(&mut self, slot: SlotId) -> Result<(), FlashError> {
        if self.config.erase_invalid_image {
            log::info!("erasing slot {:?}", slot);
            let range = self.layout.slot(slot);
            for page in range.first_page..=range.last_page {
                self.flash.erase_page(page)?;
            }
            self.slots[slot_index(slot)] = SlotStatus::NoImage;
            Ok(())
        } else {
            self.mark(slot, VerifStat::Fail)
        }
    }
}
