//! `tinycrc`: a tiny CRC32 implementation for the boot manager.
//!
//! The boot manager checks every application image it considers with a CRC32
//! before spending time on the signature. This implementation trades speed
//! for size: there are no lookup tables, and the state is a handful of words
//! that normally end up in registers.
//!
//! Algorithms are those defined in the `crc_catalog` crate, used by `crc` (a
//! crate that you should use instead if performance is important). OAD images
//! use [`crc_catalog::CRC_32_ISO_HDLC`], which is what [`Crc32::oad`] selects.

#![no_std]

use crc_catalog::Algorithm;

/// A CRC32 operation-in-progress using a particular algorithm.
#[derive(Clone, Debug)]
pub struct Crc32 {
    /// Algorithm polynomial.
    poly: u32,
    /// Should data be bit-reversed on the way in?
    reflect_in: bool,
    /// Should data be bit-reversed on the way out?
    reflect_out: bool,
    /// Value to XOR into the CRC at the end.
    xorout: u32,
    /// Current CRC value.
    value: u32,
}

impl Crc32 {
    /// Creates a new `Crc32` using `algorithm`'s settings.
    pub fn new(algorithm: &Algorithm<u32>) -> Self {
        let value = if algorithm.refin {
            algorithm.init.reverse_bits()
        } else {
            algorithm.init
        };
        Self {
            poly: if algorithm.refin {
                algorithm.poly.reverse_bits()
            } else {
                algorithm.poly
            },
            reflect_in: algorithm.refin,
            reflect_out: algorithm.refout,
            xorout: algorithm.xorout,
            value,
        }
    }

    /// Creates a `Crc32` for the algorithm used over OAD images.
    pub fn oad() -> Self {
        Self::new(&crc_catalog::CRC_32_ISO_HDLC)
    }

    /// Updates this CRC with the content of `data`.
    pub fn update(&mut self, data: &[u8]) {
        for &byte in data {
            self.update_byte(byte);
        }
    }

    #[inline]
    fn update_byte(&mut self, byte: u8) {
        self.value = if self.reflect_in {
            crc32_reflect(self.poly, self.value ^ u32::from(byte))
        } else {
            crc32(self.poly, self.value ^ (u32::from(byte) << 24))
        };
    }

    /// Performs any final computations required and returns the computed CRC32.
    pub fn finish(mut self) -> u32 {
        if self.reflect_in ^ self.reflect_out {
            self.value = self.value.reverse_bits();
        }
        self.value ^ self.xorout
    }
}

// `poly` here is already bit-reversed.
fn crc32_reflect(poly: u32, mut value: u32) -> u32 {
    for _ in 0..8 {
        value = (value >> 1) ^ ((value & 1) * poly);
    }
    value
}

fn crc32(poly: u32, mut value: u32) -> u32 {
    for _ in 0..8 {
        value = (value << 1) ^ (((value >> 31) & 1) * poly);
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(algorithm: &'static Algorithm<u32>, data: &[u8]) -> u32 {
        let good = crc::Crc::<u32>::new(algorithm);
        let mut good = good.digest();
        good.update(data);
        good.finalize()
    }

    #[test]
    fn check_value() {
        // Every catalog entry carries the CRC of "123456789".
        let mut mine = Crc32::oad();
        mine.update(b"123456789");
        assert_eq!(mine.finish(), crc_catalog::CRC_32_ISO_HDLC.check);
    }

    #[test]
    fn no_data() {
        assert_eq!(Crc32::oad().finish(), reference(&crc::CRC_32_ISO_HDLC, b""));
    }

    #[test]
    fn unreflected_algorithm() {
        let fixture = b"the quick brown fox jumps over the lazy dog";

        let mut mine = Crc32::new(&crc_catalog::CRC_32_MPEG_2);
        mine.update(fixture);

        assert_eq!(mine.finish(), reference(&crc::CRC_32_MPEG_2, fixture));
    }

    #[test]
    fn split_updates_match_one_shot() {
        let fixture = b"CC26x2R1 header bytes followed by an image body";

        let mut mine = Crc32::oad();
        let (left, right) = fixture.split_at(17);
        mine.update(left);
        mine.update(right);

        assert_eq!(mine.finish(), reference(&crc::CRC_32_ISO_HDLC, fixture));
    }
}
