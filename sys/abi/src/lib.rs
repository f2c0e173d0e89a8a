// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire ABI for the Z1 cluster backplane, shared between the bus layer, the
//! broker, the bootloader, and the controller-side tooling.
//!
//! Everything that crosses the 16-bit parallel bus or the flash partition
//! boundary is defined here: the frame header bit layout, the opcode
//! registry, the error codes that travel as raw integers, the application
//! image header, and the CRC algorithm selections. Keeping these in one
//! crate means the transmitter and receiver can never disagree about a
//! constant.

#![cfg_attr(not(test), no_std)]

use crc::{Crc, CRC_16_IBM_3740, CRC_32_ISO_HDLC};

mod error;
mod frame;
mod image;
pub mod opcode;
mod topology;

pub use error::{BusError, UpdateError};
pub use frame::{Frame, FrameType, Header};
pub use image::{
    AppHeader, APP_ENTRY_OFFSET, APP_HEADER_SIZE, APP_MAGIC,
    APP_PARTITION_BASE, APP_PARTITION_SIZE, MIN_APP_BINARY_SIZE,
};
pub use topology::{NodeStatus, TopologyView, TOPOLOGY_SLOTS};

/// Logical addresses. Workers are 0..=15; the controller is 16; 31 is the
/// broadcast destination. Five bits of header space allow for growth.
pub const MAX_NODES: usize = 16;
pub const CONTROLLER_ID: u8 = 16;
pub const BROADCAST_ADDR: u8 = 31;

/// Payload bounds. A frame carries at most 600 16-bit words (1200 bytes);
/// with header, length and CRC beats that is 603 beats on the wire.
pub const MAX_PAYLOAD_WORDS: usize = 600;
pub const MAX_PAYLOAD_BYTES: usize = 2 * MAX_PAYLOAD_WORDS;
pub const MAX_FRAME_BEATS: usize = MAX_PAYLOAD_WORDS + 3;

/// Frame integrity check: CRC16-CCITT, polynomial 0x1021, seeded 0xFFFF, no
/// reflection, no final XOR. Fed byte-wise, LSB then MSB of each beat.
pub const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Application image check: the IEEE 802.3 CRC32 (reflected 0xEDB88320,
/// initial 0xFFFFFFFF, final inversion).
pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Computes the CRC16 trailer beat for a frame, covering the header beat,
/// the length beat, and every payload beat, in wire order.
pub fn frame_crc(header: u16, length_bytes: u16, payload: &[u16]) -> u16 {
    let mut digest = CRC16.digest();
    digest.update(&header.to_le_bytes());
    digest.update(&length_bytes.to_le_bytes());
    for &word in payload {
        digest.update(&word.to_le_bytes());
    }
    digest.finalize()
}

/// Tag byte stored alongside the node ID in the persistent scratch register
/// so the bootloader can tell a deliberate handoff from reset garbage.
pub const SCRATCH_TAG: u32 = 0xB0;

/// Encodes a node ID for the persistent scratch register: `(tag << 8) | id`.
pub const fn scratch_encode(node_id: u8) -> u32 {
    (SCRATCH_TAG << 8) | node_id as u32
}

/// Decodes a scratch register value, returning the node ID only if the tag
/// matches. A cold boot leaves the register at some other value, which is
/// the signal to fall back to the strapping pins.
pub fn scratch_decode(value: u32) -> Option<u8> {
    if value >> 8 == SCRATCH_TAG {
        Some((value & 0xFF) as u8)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_known_vector() {
        // CRC_16_IBM_3740 check value for "123456789".
        assert_eq!(CRC16.checksum(b"123456789"), 0x29B1);
    }

    #[test]
    fn crc32_known_vector() {
        assert_eq!(CRC32.checksum(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn frame_crc_matches_bytewise_feed() {
        let header = 0xC123u16;
        let len = 6u16;
        let payload = [0x1111u16, 0x2222, 0x3333];
        let mut bytes = vec![];
        bytes.extend_from_slice(&header.to_le_bytes());
        bytes.extend_from_slice(&len.to_le_bytes());
        for w in payload {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        assert_eq!(frame_crc(header, len, &payload), CRC16.checksum(&bytes));
    }

    #[test]
    fn scratch_round_trip() {
        for id in 0..=16 {
            assert_eq!(scratch_decode(scratch_encode(id)), Some(id));
        }
        assert_eq!(scratch_decode(0), None);
        assert_eq!(scratch_decode(0xFFFF_FFFF), None);
        assert_eq!(scratch_decode(0x0000_B105), Some(5));
    }
}
