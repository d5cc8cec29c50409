//! In-memory NOR flash for exercising the boot manager off-target.
//!
//! `SimFlash` follows the NOR rules from [`Flash`]: writes AND into the
//! existing contents, erases fill a page with `0xFF`. On top of that it can be
//! told to lose power after a given number of bytes have been programmed or
//! erased, which is how the crash-safety tests cut an update in half.

use crate::flash::{Flash, FlashError};
use std::vec;
use std::vec::Vec;

pub struct SimFlash {
    mem: Vec<u8>,
    page_size: u32,
    locked: Vec<bool>,
    /// Bytes that may still be programmed or erased before power is lost.
    /// `None` means the supply is reliable.
    budget: Option<usize>,
    powered: bool,
    /// Makes every write fail outright, leaving flash untouched.
    pub fail_writes: bool,
    pub writes: usize,
    pub erases: usize,
}

impl SimFlash {
    /// A fully erased array of `pages` pages.
    pub fn new(page_size: u32, pages: u32) -> Self {
        Self {
            mem: vec![0xFF; (page_size * pages) as usize],
            page_size,
            locked: vec![false; pages as usize],
            budget: None,
            powered: true,
            fail_writes: false,
            writes: 0,
            erases: 0,
        }
    }

    /// Lose power once `bytes` more bytes have been programmed or erased.
    pub fn cut_power_after(&mut self, bytes: usize) {
        self.budget = Some(bytes);
    }

    /// Restores power, as after a reset. Locks don't survive a reset either.
    pub fn power_cycle(&mut self) {
        self.budget = None;
        self.powered = true;
        self.locked.iter_mut().for_each(|l| *l = false);
    }

    pub fn is_powered(&self) -> bool {
        self.powered
    }

    pub fn bytes(&self) -> &[u8] {
        &self.mem
    }

    /// Copies raw bytes in, ignoring NOR rules. Used to lay out fixtures.
    pub fn load(&mut self, addr: u32, data: &[u8]) {
        let start = addr as usize;
        self.mem[start..start + data.len()].copy_from_slice(data);
    }

    /// How many bytes of an operation of `len` bytes go through before the
    /// lights go out.
    fn allowance(&mut self, len: usize) -> usize {
        match self.budget {
            None => len,
            Some(left) => {
                let done = left.min(len);
                self.budget = Some(left - done);
                if done < len {
                    self.powered = false;
                }
                done
            }
        }
    }

    fn check(&self, addr: u32, len: usize) -> Result<(usize, usize), FlashError> {
        let start = addr as usize;
        let end = start.checked_add(len).ok_or(FlashError::OutOfBounds)?;
        if end > self.mem.len() {
            return Err(FlashError::OutOfBounds);
        }
        Ok((start, end))
    }
}

impl Flash for SimFlash {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        if !self.powered {
            return Err(FlashError::PowerLoss);
        }
        let (start, end) = self.check(addr, buf.len())?;
        buf.copy_from_slice(&self.mem[start..end]);
        Ok(())
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        if !self.powered {
            return Err(FlashError::PowerLoss);
        }
        let (start, end) = self.check(addr, data.len())?;
        if data.is_empty() {
            return Ok(());
        }
        let first = start / self.page_size as usize;
        let last = (end - 1) / self.page_size as usize;
        if self.locked[first..=last].iter().any(|&l| l) {
            return Err(FlashError::Locked);
        }
        if self.fail_writes {
            return Err(FlashError::Program);
        }
        self.writes += 1;

        let done = self.allowance(data.len());
        for (cell, &b) in self.mem[start..start + done].iter_mut().zip(data) {
            *cell &= b;
        }
        if done < data.len() {
            return Err(FlashError::PowerLoss);
        }
        Ok(())
    }

    fn erase_page(&mut self, page: u32) -> Result<(), FlashError> {
        if !self.powered {
            return Err(FlashError::PowerLoss);
        }
        let (start, end) = self.check(page * self.page_size, self.page_size as usize)?;
        if self.locked[page as usize] {
            return Err(FlashError::Locked);
        }
        self.erases += 1;

        let done = self.allowance(end - start);
        self.mem[start..start + done].fill(0xFF);
        if done < end - start {
            return Err(FlashError::PowerLoss);
        }
        Ok(())
    }

    fn lock_page(&mut self, page: u32) -> Result<(), FlashError> {
        let lock = self
            .locked
            .get_mut(page as usize)
            .ok_or(FlashError::OutOfBounds)?;
        *lock = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_only_clear_bits() {
        let mut flash = SimFlash::new(256, 2);
        flash.write(10, &[0xF0]).unwrap();
        flash.write(10, &[0x0F]).unwrap();
        assert_eq!(flash.read_u8(10).unwrap(), 0x00);

        flash.erase_page(0).unwrap();
        assert_eq!(flash.read_u8(10).unwrap(), 0xFF);
    }

    #[test]
    fn power_loss_leaves_a_prefix() {
        let mut flash = SimFlash::new(256, 2);
        flash.cut_power_after(2);
        assert_eq!(flash.write(0, &[1, 2, 3, 4]), Err(FlashError::PowerLoss));
        assert!(!flash.is_powered());
        assert_eq!(flash.read_u8(0), Err(FlashError::PowerLoss));

        flash.power_cycle();
        let mut buf = [0; 4];
        flash.read(0, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 0xFF, 0xFF]);
    }

    #[test]
    fn locked_pages_refuse_changes_until_reset() {
        let mut flash = SimFlash::new(256, 2);
        flash.lock_page(1).unwrap();
        assert_eq!(flash.write(256, &[0]), Err(FlashError::Locked));
        assert_eq!(flash.erase_page(1), Err(FlashError::Locked));
        assert_eq!(flash.write(0, &[0]), Ok(()));

        flash.power_cycle();
        assert_eq!(flash.write(256, &[0]), Ok(()));
    }
}
