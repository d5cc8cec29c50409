//! Fault-injection-hardened entry points to the security counters.
//!
//! These are what application code (and the boot manager's exported C
//! symbols) call. Results are encoded so that a glitched branch or a register
//! forced to zero or all-ones doesn't read as success.

use crate::counter::{BimInfoStatus, CounterError, SecurityCounters};
use crate::flash::Flash;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

#[repr(u32)]
#[derive(Copy, Clone, Debug, FromPrimitive, Eq, PartialEq)]
pub enum FihInt {
    Success = 0x1aaa_aaaa,
    Failure = 0x1555_5555,
}

impl FihInt {
    /// Decodes a raw value. Anything that isn't exactly `Success` is a
    /// failure.
    pub fn from_raw(raw: u32) -> Self {
        FihInt::from_u32(raw).unwrap_or(FihInt::Failure)
    }

    pub fn is_success(self) -> bool {
        // Both halves of the comparison have to agree.
        self == FihInt::Success && (self as u32) ^ (FihInt::Success as u32) == 0
    }

    fn from_result<T>(r: &Result<T, CounterError>) -> Self {
        match r {
            Ok(_) => FihInt::Success,
            Err(_) => FihInt::Failure,
        }
    }
}

/// A counter value stored alongside its complement, so that corruption of
/// either copy is detectable.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FihU32 {
    val: u32,
    inv: u32,
}

impl FihU32 {
    pub const fn new(val: u32) -> Self {
        Self { val, inv: !val }
    }

    /// The value, or `None` if the two copies disagree.
    pub fn get(self) -> Option<u32> {
        if self.val == !self.inv {
            Some(self.val)
        } else {
            None
        }
    }
}

impl Default for FihU32 {
    fn default() -> Self {
        Self::new(0)
    }
}

pub fn nv_counter_init(flash: &mut impl Flash, counters: &SecurityCounters) -> FihInt {
    let r = counters.init(flash);
    if let Err(e) = r {
        log::error!("security counter init failed: {:?}", e);
    }
    FihInt::from_result(&r)
}

/// Reads the counter for `image_id` into `out`. `out` is left alone on
/// failure.
pub fn nv_counter_get(
    flash: &impl Flash,
    counters: &SecurityCounters,
    image_id: u32,
    out: &mut FihU32,
) -> FihInt {
    let r = counters.get(flash, image_id);
    if let Ok(v) = r {
        *out = FihU32::new(v);
    }
    FihInt::from_result(&r)
}

/// Raises the counter for `image_id`. Returns a [`BimInfoStatus`] code.
pub fn nv_counter_update(
    flash: &mut impl Flash,
    counters: &SecurityCounters,
    image_id: u32,
    value: u32,
) -> i32 {
    match counters.update(flash, image_id, value) {
        Ok(()) => BimInfoStatus::Success as i32,
        Err(e) => {
            log::warn!("security counter {} -> {}: {:?}", image_id, value, e);
            BimInfoStatus::from(e) as i32
        }
    }
}

/// Write-protects the counter page for the rest of this boot.
pub fn lock_bim_sector(flash: &mut impl Flash, counters: &SecurityCounters) -> FihInt {
    let r = counters.lock(flash);
    FihInt::from_result(&r)
}
