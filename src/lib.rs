// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Dual-image boot manager for SimpleLink CC13x2/CC26x2 parts.
//!
//! The boot manager owns two things in internal flash:
//!
//! - a page of anti-rollback security counters ([`counter`]), kept as an
//!   append-only log so that losing power mid-update never leaves a counter
//!   ambiguous, and
//! - the decision of which of two image slots to run ([`boot`]), based on
//!   each image's header, CRC, signature and security version.
//!
//! Everything touches flash through the [`flash::Flash`] trait, so all of it
//! runs on the host against a simulated NOR array as well as on the device.

#![cfg_attr(not(test), no_std)]

pub mod auth;
pub mod boot;
pub mod bsp;
pub mod counter;
pub mod fih;
pub mod flash;
pub mod image;
#[cfg(target_os = "none")]
pub mod romapi;

#[cfg(test)]
mod sim;

pub use flash::{Flash, FlashError, FlashLayout, SlotId};
