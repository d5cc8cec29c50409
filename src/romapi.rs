// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The SimpleLink ROM flash driver.
//!
//! CC13x2/CC26x2 parts carry a flash programming API in boot ROM, reached
//! through a table of tables at a fixed address. We only use the flash table,
//! and only the parts of it needed to program, erase and write-protect.

use crate::flash::{Flash, FlashError};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

/// Root of the ROM API: an array of pointers to per-peripheral tables.
const ROM_API_TABLE: usize = 0x1000_0180;
const ROM_API_FLASH_TABLE_INDEX: usize = 10;

/// `FlashProtectionSet` mode that blocks program and erase until reset.
const FLASH_WRITE_PROTECT: u32 = 1;

// Status codes from the flash API (FAPI) documentation.
#[repr(u32)]
#[derive(Debug, FromPrimitive, PartialEq)]
pub enum FapiStatus {
    Success = 0,
    FsmError = 1,
    IncorrectDatabufferLength = 2,
}

#[repr(C)]
pub struct FlashApi {
    pub power_mode_set: unsafe extern "C" fn(mode: u32, bank_grace: u32, pump_grace: u32),
    pub power_mode_get: unsafe extern "C" fn() -> u32,
    pub protection_set: unsafe extern "C" fn(sector_addr: u32, mode: u32),
    pub protection_get: unsafe extern "C" fn(sector_addr: u32) -> u32,
    pub protection_save: unsafe extern "C" fn(sector_addr: u32) -> u32,
    pub sector_erase: unsafe extern "C" fn(sector_addr: u32) -> u32,
    pub program: unsafe extern "C" fn(data: *const u8, addr: u32, count: u32) -> u32,
}

pub fn flash_api() -> &'static FlashApi {
    // Safety: the ROM table is at this address on every part we support, and
    // it's immutable.
    unsafe {
        let tables = ROM_API_TABLE as *const *const FlashApi;
        &**tables.add(ROM_API_FLASH_TABLE_INDEX)
    }
}

fn check(status: u32, err: FlashError) -> Result<(), FlashError> {
    match FapiStatus::from_u32(status) {
        Some(FapiStatus::Success) => Ok(()),
        other => {
            log::error!("flash API: {:?} ({:#x})", other, status);
            Err(err)
        }
    }
}

/// Internal flash, through the ROM driver.
pub struct RomFlash {
    page_size: u32,
    size: u32,
}

impl RomFlash {
    /// # Safety
    ///
    /// There must be only one of these, since the ROM driver isn't
    /// reentrant, and `pages` must not exceed the part's flash.
    pub unsafe fn new(page_size: u32, pages: u32) -> Self {
        Self {
            page_size,
            size: page_size * pages,
        }
    }

    fn bounds(&self, addr: u32, len: usize) -> Result<(), FlashError> {
        let end = addr
            .checked_add(len as u32)
            .ok_or(FlashError::OutOfBounds)?;
        if end > self.size {
            return Err(FlashError::OutOfBounds);
        }
        Ok(())
    }
}

/// Flash is mapped starting at address zero, which can't be dereferenced from
/// Rust. Load it by hand.
fn load_byte(addr: u32) -> u8 {
    let v: u32;
    // Safety: callers have checked `addr` against the flash size; flash reads
    // have no side effects.
    unsafe {
        core::arch::asm!(
            "ldrb {v}, [{a}]",
            a = in(reg) addr,
            v = out(reg) v,
            options(nostack, readonly, preserves_flags),
        );
    }
    v as u8
}

impl Flash for RomFlash {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        self.bounds(addr, buf.len())?;
        for (a, b) in (addr..).zip(buf.iter_mut()) {
            *b = load_byte(a);
        }
        Ok(())
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        self.bounds(addr, data.len())?;
        let api = flash_api();
        let status = cortex_m::interrupt::free(|_| unsafe {
            (api.program)(data.as_ptr(), addr, data.len() as u32)
        });
        check(status, FlashError::Program)
    }

    fn erase_page(&mut self, page: u32) -> Result<(), FlashError> {
        let addr = page * self.page_size;
        self.bounds(addr, self.page_size as usize)?;
        let api = flash_api();
        let status = cortex_m::interrupt::free(|_| unsafe { (api.sector_erase)(addr) });
        check(status, FlashError::Erase)
    }

    fn lock_page(&mut self, page: u32) -> Result<(), FlashError> {
        let addr = page * self.page_size;
        self.bounds(addr, self.page_size as usize)?;
        let api = flash_api();
        cortex_m::interrupt::free(|_| unsafe { (api.protection_set)(addr, FLASH_WRITE_PROTECT) });
        Ok(())
    }
}
