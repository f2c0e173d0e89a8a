// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Frame and header definitions.
//!
//! A frame on the wire is the beat sequence `header, length_bytes,
//! payload..., crc16`. The header is a single 16-bit word:
//!
//! ```text
//! bits  15 14 | 13 12 11 10 9 | 8 7 6 5 4 | 3 | 2 1 0
//!        type |      src      |    dest   |NAK| stream
//! ```

use crate::{BROADCAST_ADDR, MAX_PAYLOAD_BYTES, MAX_PAYLOAD_WORDS};

/// Frame types, two bits of header space.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum FrameType {
    /// Point-to-point data; auto-ACKed by the receiver unless `no_ack` is
    /// set.
    Unicast = 0,
    /// One-to-all data; never ACKed.
    Broadcast = 1,
    /// Reserved link-level acknowledgement type. In practice ACKs travel as
    /// `Ctrl` frames carrying [`crate::opcode::bus::ACK`], but the type code
    /// is part of the wire format.
    Ack = 2,
    /// Control/command frame; `payload[0]` is an opcode word.
    Ctrl = 3,
}

impl FrameType {
    fn from_bits(bits: u16) -> Self {
        match bits & 0b11 {
            0 => FrameType::Unicast,
            1 => FrameType::Broadcast,
            2 => FrameType::Ack,
            _ => FrameType::Ctrl,
        }
    }
}

/// Decoded form of the header beat.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Header {
    pub frame_type: FrameType,
    /// Sender's logical node ID, 0..=31.
    pub src: u8,
    /// Destination node ID; 31 addresses every node.
    pub dest: u8,
    /// Suppresses the receiver's automatic ACK.
    pub no_ack: bool,
    /// 3-bit logical channel used for priority routing and opcode
    /// namespacing.
    pub stream: u8,
}

const TYPE_SHIFT: u16 = 14;
const SRC_SHIFT: u16 = 9;
const SRC_MASK: u16 = 0x1F;
const DEST_SHIFT: u16 = 4;
const DEST_MASK: u16 = 0x1F;
const NO_ACK_BIT: u16 = 1 << 3;
const STREAM_MASK: u16 = 0x07;

impl Header {
    /// Packs the header into its wire beat. Out-of-range field values are
    /// masked to their field width.
    pub fn pack(&self) -> u16 {
        (self.frame_type as u16) << TYPE_SHIFT
            | (self.src as u16 & SRC_MASK) << SRC_SHIFT
            | (self.dest as u16 & DEST_MASK) << DEST_SHIFT
            | if self.no_ack { NO_ACK_BIT } else { 0 }
            | (self.stream as u16 & STREAM_MASK)
    }

    /// Decodes a header beat. Total: every 16-bit pattern is a valid header.
    pub fn unpack(word: u16) -> Self {
        Header {
            frame_type: FrameType::from_bits(word >> TYPE_SHIFT),
            src: ((word >> SRC_SHIFT) & SRC_MASK) as u8,
            dest: ((word >> DEST_SHIFT) & DEST_MASK) as u8,
            no_ack: word & NO_ACK_BIT != 0,
            stream: (word & STREAM_MASK) as u8,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.dest == BROADCAST_ADDR
    }
}

/// A reassembled (RX) or to-be-serialized (TX) frame.
///
/// Payload storage is inline so frames can sit in DMA-adjacent rings and
/// inter-core queues without pointer chasing. `crc_valid` is only meaningful
/// on the receive side; transmitters compute the trailer on the way out.
#[derive(Copy, Clone)]
pub struct Frame {
    pub header: Header,
    pub length_bytes: u16,
    pub crc_valid: bool,
    /// Ingress timestamp in microseconds; zero when not recorded.
    pub timestamp_us: u64,
    payload: [u16; MAX_PAYLOAD_WORDS],
}

impl Frame {
    /// An inert frame for initializing rings and arrays.
    pub const EMPTY: Frame = Frame {
        header: Header {
            frame_type: FrameType::Unicast,
            src: 0,
            dest: 0,
            no_ack: false,
            stream: 0,
        },
        length_bytes: 0,
        crc_valid: false,
        timestamp_us: 0,
        payload: [0; MAX_PAYLOAD_WORDS],
    };

    /// Builds a frame from whole payload words. Returns `None` when the
    /// payload exceeds [`MAX_PAYLOAD_WORDS`].
    pub fn new(header: Header, payload: &[u16]) -> Option<Frame> {
        if payload.len() > MAX_PAYLOAD_WORDS {
            return None;
        }
        let mut f = Frame {
            header,
            length_bytes: (payload.len() * 2) as u16,
            crc_valid: false,
            timestamp_us: 0,
            payload: [0; MAX_PAYLOAD_WORDS],
        };
        f.payload[..payload.len()].copy_from_slice(payload);
        Some(f)
    }

    /// Number of payload beats on the wire: `ceil(length_bytes / 2)`.
    pub fn payload_words(&self) -> usize {
        (self.length_bytes as usize + 1) / 2
    }

    pub fn payload(&self) -> &[u16] {
        &self.payload[..self.payload_words()]
    }

    /// Mutable access for in-place reassembly; exposes the full backing
    /// array, with `length_bytes` delimiting the valid prefix.
    pub fn payload_mut(&mut self) -> &mut [u16; MAX_PAYLOAD_WORDS] {
        &mut self.payload
    }

    /// Copies the payload out as bytes (little-endian beat order) into
    /// `dest`, returning the number of bytes written. A frame whose length
    /// is odd contributes only the low byte of its final beat.
    pub fn payload_bytes_into(&self, dest: &mut [u8]) -> usize {
        let n = (self.length_bytes as usize).min(MAX_PAYLOAD_BYTES).min(dest.len());
        for i in 0..n {
            let word = self.payload[i / 2];
            dest[i] = if i % 2 == 0 {
                (word & 0xFF) as u8
            } else {
                (word >> 8) as u8
            };
        }
        n
    }
}

impl core::fmt::Debug for Frame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Frame")
            .field("header", &self.header)
            .field("length_bytes", &self.length_bytes)
            .field("crc_valid", &self.crc_valid)
            .field("payload", &self.payload())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn header_layout() {
        // type=CTRL, src=19, dest=3, no_ack, stream=5
        let h = Header {
            frame_type: FrameType::Ctrl,
            src: 19,
            dest: 3,
            no_ack: true,
            stream: 5,
        };
        assert_eq!(h.pack(), 0b11_10011_00011_1_101);
    }

    proptest! {
        #[test]
        fn header_round_trip(
            ty in 0u8..4,
            src in 0u8..32,
            dest in 0u8..32,
            no_ack: bool,
            stream in 0u8..8,
        ) {
            let h = Header {
                frame_type: FrameType::from_bits(ty as u16),
                src,
                dest,
                no_ack,
                stream,
            };
            prop_assert_eq!(Header::unpack(h.pack()), h);
        }

        #[test]
        fn any_word_decodes_and_reencodes(word: u16) {
            prop_assert_eq!(Header::unpack(word).pack(), word);
        }
    }

    #[test]
    fn frame_rejects_oversize_payload() {
        let h = Header::unpack(0);
        let too_big = [0u16; MAX_PAYLOAD_WORDS + 1];
        assert!(Frame::new(h, &too_big).is_none());
        assert!(Frame::new(h, &too_big[..MAX_PAYLOAD_WORDS]).is_some());
    }

    #[test]
    fn payload_bytes_odd_length() {
        let h = Header::unpack(0);
        let mut f = Frame::new(h, &[0x2211, 0x4433]).unwrap();
        f.length_bytes = 3;
        let mut out = [0u8; 8];
        assert_eq!(f.payload_bytes_into(&mut out), 3);
        assert_eq!(&out[..3], &[0x11, 0x22, 0x33]);
    }
}
