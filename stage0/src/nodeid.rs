// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Node identity and early bring-up.
//!
//! A node's logical ID comes from backplane strapping pins, but those are
//! only trustworthy on a cold boot: once the application is running, the
//! backplane may be driving them. So the ID is handed across soft resets
//! (watchdog reboots, OTA exits) through a tagged persistent scratch
//! register, which is consumed -- cleared -- on read so a later cold boot
//! goes back to the pins.

use z1_abi::{scratch_decode, scratch_encode};
use z1_hal::{IdStrapping, PersistentScratch, PowerClock};

/// Conservative bus clock for the bootloader; the application renegotiates
/// upward once every node is known to be healthy.
pub const SAFE_BUS_CLOCK_HZ: u32 = 2_000_000;

/// Recovers the node ID: the tagged scratch value when a soft reset left
/// one behind, otherwise the strapping pins.
pub fn read_node_id<S, P>(scratch: &mut S, straps: &mut P) -> u8
where
    S: PersistentScratch,
    P: IdStrapping,
{
    if let Some(id) = scratch_decode(scratch.read()) {
        // Consume it; the tag must not outlive one boot.
        scratch.write(0);
        id
    } else {
        straps.read_id()
    }
}

/// Stashes the node ID for the bootloader to find after a soft reset.
pub fn persist_node_id<S: PersistentScratch>(scratch: &mut S, id: u8) {
    scratch.write(scratch_encode(id));
}

/// Reset-time bring-up: clocks and core voltage to the safe bus speed,
/// then node identity. Bus, broker and OTA construction follow in the
/// target binary once this returns.
pub fn initialize<PW, S, P>(power: &mut PW, scratch: &mut S, straps: &mut P) -> u8
where
    PW: PowerClock,
    S: PersistentScratch,
    P: IdStrapping,
{
    power.configure(SAFE_BUS_CLOCK_HZ);
    read_node_id(scratch, straps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use drv_z1_mock_backplane::{MockPower, MockScratch, MockStrapping};

    #[test]
    fn cold_boot_reads_straps() {
        let mut scratch = MockScratch::default();
        let mut straps = MockStrapping::new(0b1010);
        assert_eq!(read_node_id(&mut scratch, &mut straps), 10);
        assert_eq!(straps.reads(), 1);
    }

    #[test]
    fn soft_reset_uses_scratch_and_consumes_it() {
        let mut scratch = MockScratch::default();
        let mut straps = MockStrapping::new(3);

        persist_node_id(&mut scratch, 7);
        assert_eq!(read_node_id(&mut scratch, &mut straps), 7);
        assert_eq!(straps.reads(), 0, "pins untouched on soft reset");

        // Second read falls back to the pins: the tag was consumed.
        assert_eq!(read_node_id(&mut scratch, &mut straps), 3);
    }

    #[test]
    fn initialize_configures_safe_clock() {
        let mut power = MockPower::new();
        let mut scratch = MockScratch::default();
        let mut straps = MockStrapping::new(1);
        assert_eq!(
            initialize(&mut power, &mut scratch, &mut straps),
            1
        );
        assert_eq!(power.configured_hz(), SAFE_BUS_CLOCK_HZ);
    }
}
