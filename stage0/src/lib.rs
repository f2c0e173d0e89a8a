// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Z1 bootloader core.
//!
//! Everything the bootloader partition does that is not raw register
//! twiddling lives here: application image validation and handoff, the
//! boot countdown, safe mode, node-ID persistence, and the OTA update
//! engine. A target binary wires these functions to its concrete `z1-hal`
//! bindings and loops; the logic is identical on every target and fully
//! exercised on the host by the test suite.
//!
//! On a worker, exactly one of the bootloader and the application owns the
//! bus peripheral at any instant; this crate is the bootloader's half of
//! that contract and never runs concurrently with application code.

#![cfg_attr(not(test), no_std)]

mod boot;
mod image;
mod nodeid;
pub mod update;

pub use boot::{
    boot, run_countdown, BootDecision, CountdownOutcome, SafeMode,
    BOOT_COUNTDOWN_MS, COUNTDOWN_TICK_US, SAFE_BLINK_HALF_PERIOD_MS,
};
pub use image::{entry_vectors, validate_application};
pub use nodeid::{initialize, persist_node_id, read_node_id, SAFE_BUS_CLOCK_HZ};
pub use update::UpdateSession;

/// Bootloader firmware version, reported in STATUS_RESPONSE.
pub const BOOT_VERSION_MAJOR: u16 = 1;
pub const BOOT_VERSION_MINOR: u16 = 2;
