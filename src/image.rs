//! OAD image layout.
//!
//! Every application image starts with a 44-byte fixed header, followed by a
//! chain of segments. The one we care about is the security segment, which
//! carries the image's security version and its ECDSA signature. All
//! multi-byte fields are little-endian, and everything here is described as
//! byte arrays plus accessors so that the layout doesn't depend on anybody's
//! idea of struct packing.
//!
//! A handful of header bytes are rewritten on the device after the image is
//! built (CRC status, copy status, commit flag and verification status). Each
//! of them starts out `0xFF` and only ever has bits cleared. The CRC and the
//! signed digest both treat those bytes as `0xFF`, so rewriting them doesn't
//! invalidate the image.

use crate::flash::{Flash, FlashError};
use num_derive::FromPrimitive;
use sha2::{Digest, Sha256};
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

/// Image identification magic for the CC26x2/CC13x2 family.
pub const OAD_IMG_ID: [u8; 8] = *b"CC26x2R1";
pub const BIM_VER: u8 = 0x03;
pub const META_VER: u8 = 0x01;

/// Combined application + stack image, the only kind the dual-slot boot
/// manager boots.
pub const IMG_TYPE_APPSTACKLIB: u8 = 7;

pub const OAD_IMG_HDR_LEN: u32 = 44;
pub const CRC_OFFSET: u32 = 8;
/// The CRC covers everything from here to the end of the image.
pub const CRC_START_OFFSET: u32 = 12;
pub const IMG_CP_STAT_OFFSET: u32 = 16;
pub const CRC_STAT_OFFSET: u32 = 17;
pub const COMMIT_FLAG_OFFSET: u32 = 42;

/// Every segment starts with type, wireless tech, a reserved byte and the
/// segment length, for 8 bytes.
pub const SEG_HDR_LEN: u32 = 8;
pub const SEG_LEN_OFFSET: u32 = 4;
pub const IMG_SECURITY_SEG_ID: u8 = 3;
pub const SEC_VERIF_STAT_OFFSET: u32 = 3;
pub const SEC_SIGNER_INFO_OFFSET: u32 = 13;
pub const SEC_SIGNATURE_OFFSET: u32 = 21;
pub const SIGNATURE_LEN: u32 = 64;
pub const SEC_SEG_LEN: u32 = SEC_SIGNATURE_OFFSET + SIGNATURE_LEN;

pub const HDR_LEN_WITH_SECURITY_INFO: u32 = OAD_IMG_HDR_LEN + SEC_SEG_LEN;

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
pub enum CrcStat {
    NotComputed = 0xFF,
    Valid = 0xFE,
    Invalid = 0xFC,
}

/// Boot manager's verdict on an image, persisted in its security segment.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
pub enum VerifStat {
    /// Never looked at: a freshly downloaded image.
    Default = 0xFF,
    PassCurrent = 0xFE,
    /// Valid, but the other slot is the one being booted.
    PassNotCurrent = 0xFC,
    Fail = 0xF0,
}

/// Application's verdict on itself, used by restricted rollback.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
pub enum CommitFlag {
    Pending = 0xFF,
    Accepted = 0xFE,
    Rejected = 0xFC,
}

/// The fixed image header. Fields the boot manager never interprets are left
/// as raw little-endian bytes.
#[derive(Copy, Clone, Debug, AsBytes, FromBytes)]
#[repr(C)]
pub struct ImageHeader {
    pub img_id: [u8; 8],
    crc32: [u8; 4],
    pub bim_ver: u8,
    pub meta_ver: u8,
    pub tech_type: [u8; 2],
    pub img_cp_stat: u8,
    pub crc_stat: u8,
    pub img_type: u8,
    pub img_no: u8,
    img_vld: [u8; 4],
    len: [u8; 4],
    prg_entry: [u8; 4],
    soft_ver: [u8; 4],
    pub img_end_addr: [u8; 4],
    pub hdr_len: [u8; 2],
    pub commit_flag: u8,
    pub rfu: u8,
}

const_assert_eq!(core::mem::size_of::<ImageHeader>(), OAD_IMG_HDR_LEN as usize);

impl ImageHeader {
    pub fn crc32(&self) -> u32 {
        u32::from_le_bytes(self.crc32)
    }

    pub fn set_crc32(&mut self, crc: u32) {
        self.crc32 = crc.to_le_bytes();
    }

    pub fn img_vld(&self) -> u32 {
        u32::from_le_bytes(self.img_vld)
    }

    /// Image length in bytes, counted from the start of this header.
    pub fn len(&self) -> u32 {
        u32::from_le_bytes(self.len)
    }

    pub fn set_len(&mut self, len: u32) {
        self.len = len.to_le_bytes();
    }

    /// Absolute address of the image's vector table.
    pub fn prg_entry(&self) -> u32 {
        u32::from_le_bytes(self.prg_entry)
    }

    pub fn soft_ver(&self) -> u32 {
        u32::from_le_bytes(self.soft_ver)
    }

    /// Validity mask must have an even number of set bits. A single flipped
    /// bit in flash breaks that.
    pub fn has_even_parity(&self) -> bool {
        self.img_vld().count_ones() % 2 == 0
    }

    pub fn has_image_id(&self) -> bool {
        self.img_id == OAD_IMG_ID
    }
}

/// The security segment.
#[derive(Copy, Clone, Debug, AsBytes, FromBytes)]
#[repr(C)]
pub struct SecurityInfo {
    pub seg_type: u8,
    pub wireless_tech: [u8; 2],
    pub verif_stat: u8,
    pub seg_len: [u8; 4],
    pub sec_ver: u8,
    pub time_stamp: [u8; 4],
    pub signer_info: [u8; 8],
    pub signature: [u8; 64],
}

const_assert_eq!(core::mem::size_of::<SecurityInfo>(), SEC_SEG_LEN as usize);
const_assert_eq!(SEC_SIGNER_INFO_OFFSET + 8, SEC_SIGNATURE_OFFSET);

/// Reads the fixed header of the image at `base`.
pub fn read_header(flash: &impl Flash, base: u32) -> Result<ImageHeader, FlashError> {
    let mut hdr = ImageHeader::new_zeroed();
    flash.read(base, hdr.as_bytes_mut())?;
    Ok(hdr)
}

/// Reads the security segment at `offset` into the image at `base`.
pub fn read_security_info(
    flash: &impl Flash,
    base: u32,
    offset: u32,
) -> Result<SecurityInfo, FlashError> {
    let mut info = SecurityInfo::new_zeroed();
    flash.read(base + offset, info.as_bytes_mut())?;
    Ok(info)
}

/// Walks the segment chain of the image at `base` for the first segment of
/// type `seg_type`, and returns its offset into the image.
///
/// `len` is the image length from the header, and has already been checked
/// against the slot; nothing past it is read.
pub fn find_segment(
    flash: &impl Flash,
    base: u32,
    len: u32,
    seg_type: u8,
) -> Result<Option<u32>, FlashError> {
    let mut offset = OAD_IMG_HDR_LEN;
    loop {
        if offset.saturating_add(SEG_HDR_LEN) > len {
            return Ok(None);
        }
        if flash.read_u8(base + offset)? == seg_type {
            return Ok(Some(offset));
        }
        let seg_len = flash.read_u32(base + offset + SEG_LEN_OFFSET)?;
        if seg_len < SEG_HDR_LEN {
            // Zero-length segments would have us here forever.
            return Ok(None);
        }
        offset = offset.saturating_add(seg_len);
    }
}

/// Finds the security segment, if it's complete and has been signed.
pub fn find_security_segment(
    flash: &impl Flash,
    base: u32,
    len: u32,
) -> Result<Option<u32>, FlashError> {
    let Some(offset) = find_segment(flash, base, len, IMG_SECURITY_SEG_ID)? else {
        return Ok(None);
    };
    if offset.saturating_add(SEC_SEG_LEN) > len {
        return Ok(None);
    }
    // Unsigned images carry the segment with a zeroed signature.
    let sig = flash.read_u32(base + offset + SEC_SIGNATURE_OFFSET)?;
    Ok(if sig != 0 { Some(offset) } else { None })
}

/// Offsets of the bytes that get rewritten in the field, for an image whose
/// security segment (if any) is at `sec_offset`.
fn field_bytes(sec_offset: Option<u32>) -> [Option<u32>; 4] {
    [
        Some(IMG_CP_STAT_OFFSET),
        Some(CRC_STAT_OFFSET),
        Some(COMMIT_FLAG_OFFSET),
        sec_offset.map(|o| o + SEC_VERIF_STAT_OFFSET),
    ]
}

/// Feeds `range` of the image at `base` to `sink` in chunks, with the field
/// bytes read as erased.
fn feed(
    flash: &impl Flash,
    base: u32,
    range: core::ops::Range<u32>,
    sec_offset: Option<u32>,
    mut sink: impl FnMut(&[u8]),
) -> Result<(), FlashError> {
    // Big enough to not be silly, small enough for the boot manager's stack.
    let mut buf = [0u8; 256];
    let mut offset = range.start;
    while offset < range.end {
        let n = buf.len().min((range.end - offset) as usize);
        let chunk = &mut buf[..n];
        flash.read(base + offset, chunk)?;
        for field in field_bytes(sec_offset).into_iter().flatten() {
            if (offset..offset + n as u32).contains(&field) {
                chunk[(field - offset) as usize] = 0xFF;
            }
        }
        sink(chunk);
        offset += n as u32;
    }
    Ok(())
}

/// CRC32 over `[CRC_START_OFFSET, len)` of the image at `base`.
pub fn compute_crc(
    flash: &impl Flash,
    base: u32,
    len: u32,
    sec_offset: Option<u32>,
) -> Result<u32, FlashError> {
    let mut crc = tinycrc::Crc32::oad();
    feed(flash, base, CRC_START_OFFSET..len, sec_offset, |c| crc.update(c))?;
    Ok(crc.finish())
}

/// SHA-256 digest that the image signature covers: the whole image, minus the
/// CRC (computed after signing) and the signature itself.
pub fn signed_digest(
    flash: &impl Flash,
    base: u32,
    len: u32,
    sec_offset: u32,
) -> Result<[u8; 32], FlashError> {
    let sig_start = sec_offset + SEC_SIGNATURE_OFFSET;
    let sig_end = sig_start + SIGNATURE_LEN;
    let mut sha = Sha256::new();
    let sec = Some(sec_offset);
    feed(flash, base, 0..CRC_OFFSET, sec, |c| sha.update(c))?;
    feed(flash, base, CRC_START_OFFSET..sig_start, sec, |c| sha.update(c))?;
    feed(flash, base, sig_end..len, sec, |c| sha.update(c))?;
    Ok(sha.finalize().into())
}

/// An image held in RAM, presented as read-only flash at address zero. Lets
/// host tooling run the same CRC and digest code the boot manager runs.
pub struct ImageBuffer<'a>(pub &'a [u8]);

impl Flash for ImageBuffer<'_> {
    fn page_size(&self) -> u32 {
        self.0.len() as u32
    }

    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let start = addr as usize;
        let data = self
            .0
            .get(start..start.saturating_add(buf.len()))
            .ok_or(FlashError::OutOfBounds)?;
        buf.copy_from_slice(data);
        Ok(())
    }

    fn write(&mut self, _addr: u32, _data: &[u8]) -> Result<(), FlashError> {
        Err(FlashError::Locked)
    }

    fn erase_page(&mut self, _page: u32) -> Result<(), FlashError> {
        Err(FlashError::Locked)
    }

    fn lock_page(&mut self, _page: u32) -> Result<(), FlashError> {
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testimg::*;
    use super::*;

    #[test]
    fn header_layout() {
        let hdr = header(&ImageParams::new(0));
        let bytes = hdr.as_bytes();
        assert_eq!(&bytes[0..8], b"CC26x2R1");
        assert_eq!(bytes[CRC_STAT_OFFSET as usize], 0xFF);
        assert_eq!(bytes[18], IMG_TYPE_APPSTACKLIB);
        assert_eq!(&bytes[24..28], &0x400u32.to_le_bytes());
        assert_eq!(bytes[COMMIT_FLAG_OFFSET as usize], 0xFF);

        let back = ImageHeader::read_from(bytes).unwrap();
        assert_eq!(back.len(), 0x400);
        assert_eq!(back.prg_entry(), 0x100);
        assert!(back.has_image_id());
    }

    #[test]
    fn parity() {
        let mut hdr = header(&ImageParams::new(0));
        assert!(hdr.has_even_parity());
        hdr.img_vld = 0xFFFF_FFFE_u32.to_le_bytes();
        assert!(!hdr.has_even_parity());
        hdr.img_vld = 0x0000_0000_u32.to_le_bytes();
        assert!(hdr.has_even_parity());
    }

    #[test]
    fn finds_security_segment() {
        let img = build(&ImageParams::new(0));
        let f = ImageBuffer(&img);
        assert_eq!(find_security_segment(&f, 0, img.len() as u32), Ok(Some(44)));

        let params = ImageParams {
            extra_segment: true,
            ..ImageParams::new(0)
        };
        let img = build(&params);
        let f = ImageBuffer(&img);
        assert_eq!(find_security_segment(&f, 0, img.len() as u32), Ok(Some(60)));
    }

    #[test]
    fn unsigned_security_segment_is_absent() {
        let (mut img, sec) = layout(&ImageParams::new(0));
        let at = (sec + SEC_SIGNATURE_OFFSET) as usize;
        img[at..at + 64].fill(0);
        let f = ImageBuffer(&img);
        let len = img.len() as u32;
        assert_eq!(find_security_segment(&f, 0, len), Ok(None));
        // Still there for the signing tool to fill in.
        assert_eq!(find_segment(&f, 0, len, IMG_SECURITY_SEG_ID), Ok(Some(sec)));
    }

    #[test]
    fn segment_walk_terminates() {
        let (mut img, _) = layout(&ImageParams::new(0));
        // Some other segment type with a zero length.
        img[44] = 0;
        img[48..52].copy_from_slice(&0u32.to_le_bytes());
        let f = ImageBuffer(&img);
        assert_eq!(find_security_segment(&f, 0, img.len() as u32), Ok(None));

        // Or with a length that runs off the end.
        img[48..52].copy_from_slice(&0x8000_0000u32.to_le_bytes());
        let f = ImageBuffer(&img);
        assert_eq!(find_security_segment(&f, 0, img.len() as u32), Ok(None));
    }

    #[test]
    fn crc_matches_reference() {
        let img = build(&ImageParams::new(0));
        let stored = ImageHeader::read_from_prefix(&img[..]).unwrap().crc32();

        let reference = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
        assert_eq!(stored, reference.checksum(&img[CRC_START_OFFSET as usize..]));
    }

    #[test]
    fn crc_and_digest_ignore_field_bytes() {
        let img = build(&ImageParams::new(0));
        let len = img.len() as u32;
        let crc = compute_crc(&ImageBuffer(&img), 0, len, Some(44)).unwrap();
        let digest = signed_digest(&ImageBuffer(&img), 0, len, 44).unwrap();

        let mut field = img.clone();
        field[CRC_STAT_OFFSET as usize] = CrcStat::Valid as u8;
        field[IMG_CP_STAT_OFFSET as usize] = 0;
        field[COMMIT_FLAG_OFFSET as usize] = CommitFlag::Accepted as u8;
        field[(44 + SEC_VERIF_STAT_OFFSET) as usize] = VerifStat::PassCurrent as u8;
        assert_eq!(compute_crc(&ImageBuffer(&field), 0, len, Some(44)).unwrap(), crc);
        assert_eq!(signed_digest(&ImageBuffer(&field), 0, len, 44).unwrap(), digest);

        let mut body = img.clone();
        body[0x300] ^= 1;
        assert_ne!(compute_crc(&ImageBuffer(&body), 0, len, Some(44)).unwrap(), crc);
        assert_ne!(signed_digest(&ImageBuffer(&body), 0, len, 44).unwrap(), digest);
    }

    #[test]
    fn image_buffer_is_read_only() {
        let img = [0u8; 16];
        let mut f = ImageBuffer(&img);
        assert_eq!(f.read_u32(14), Err(FlashError::OutOfBounds));
        assert_eq!(f.write(0, &[0]), Err(FlashError::Locked));
    }
}
