// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Controller-side OTA sequencer.
//!
//! Drives one worker through the update protocol: enter update mode,
//! stream the image in chunks, verify the staged CRC, commit, exit. The
//! client is a pull-model state machine with no I/O of its own --
//! [`UpdateClient::pending_request`] says what to put on the wire for the
//! current phase (idempotently, so the caller's timeout policy can simply
//! re-send it), and [`UpdateClient::handle_reply`] consumes whatever came
//! back and advances the phase.
//!
//! The REST surface on the controller walks one of these per node being
//! updated; nothing here touches the bus directly.

#![cfg_attr(not(test), no_std)]

use z1_abi::opcode::{stream, update as op};
use z1_abi::{UpdateError, CRC32};

/// Bytes per `UPDATE_DATA_CHUNK`. Half the protocol maximum: two full
/// chunks still fit the bootloader's command queue with room for replies.
pub const CHUNK_BYTES: usize = 256;

const CHUNK_WORDS: usize = CHUNK_BYTES / 2;

/// Where the client is in the protocol.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Phase {
    /// Waiting for `UPDATE_READY`.
    Entering,
    /// Streaming chunks; waiting for the ACK of `next_chunk - 1`.
    Sending,
    /// Waiting for `UPDATE_VERIFY_RESP`.
    Verifying,
    /// Waiting for `UPDATE_COMMIT_RESP`.
    Committing,
    /// `UPDATE_MODE_EXIT` goes out, nothing comes back.
    Exiting,
    Done,
    Failed(UpdateError),
}

/// A request the caller should transmit: CTRL frame to `dest` on the
/// update stream.
#[derive(Copy, Clone)]
pub struct ClientRequest {
    pub dest: u8,
    pub stream: u8,
    words: [u16; 3 + CHUNK_WORDS],
    len: usize,
}

impl ClientRequest {
    pub fn payload(&self) -> &[u16] {
        &self.words[..self.len]
    }

    fn new(dest: u8, payload: &[u16]) -> ClientRequest {
        let mut r = ClientRequest {
            dest,
            stream: stream::UPDATE,
            words: [0; 3 + CHUNK_WORDS],
            len: payload.len(),
        };
        r.words[..payload.len()].copy_from_slice(payload);
        r
    }
}

pub struct UpdateClient<'i> {
    image: &'i [u8],
    target: u8,
    phase: Phase,
    /// Chunk awaiting acknowledgement (== chunks fully acknowledged).
    next_chunk: u16,
}

impl<'i> UpdateClient<'i> {
    pub fn new(target: u8, image: &'i [u8]) -> Self {
        UpdateClient {
            image,
            target,
            phase: Phase::Entering,
            next_chunk: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    pub fn failure(&self) -> Option<UpdateError> {
        match self.phase {
            Phase::Failed(e) => Some(e),
            _ => None,
        }
    }

    /// Bytes acknowledged so far, for progress reporting.
    pub fn bytes_acked(&self) -> usize {
        (usize::from(self.next_chunk) * CHUNK_BYTES).min(self.image.len())
    }

    fn total_chunks(&self) -> u16 {
        self.image.len().div_ceil(CHUNK_BYTES) as u16
    }

    /// The request for the current phase. Stable until a reply advances
    /// the phase, so re-sending after a timeout is just calling this
    /// again.
    pub fn pending_request(&self) -> Option<ClientRequest> {
        match self.phase {
            Phase::Entering => {
                Some(ClientRequest::new(self.target, &[op::MODE_ENTER]))
            }
            Phase::Sending => {
                let start = usize::from(self.next_chunk) * CHUNK_BYTES;
                let data =
                    &self.image[start..(start + CHUNK_BYTES).min(self.image.len())];
                let mut payload = [0u16; 3 + CHUNK_WORDS];
                payload[0] = op::DATA_CHUNK;
                payload[1] = self.next_chunk;
                payload[2] = data.len() as u16;
                for (i, pair) in data.chunks(2).enumerate() {
                    let lo = u16::from(pair[0]);
                    let hi =
                        pair.get(1).map(|&b| u16::from(b) << 8).unwrap_or(0);
                    payload[3 + i] = hi | lo;
                }
                let n = 3 + data.len().div_ceil(2);
                Some(ClientRequest::new(self.target, &payload[..n]))
            }
            Phase::Verifying => Some(ClientRequest::new(
                self.target,
                &[op::POLL, op::POLL_VERIFY],
            )),
            Phase::Committing => {
                Some(ClientRequest::new(self.target, &[op::COMMIT]))
            }
            Phase::Exiting => {
                Some(ClientRequest::new(self.target, &[op::MODE_EXIT]))
            }
            Phase::Done | Phase::Failed(_) => None,
        }
    }

    /// Consumes a reply payload from the target node. Replies that do not
    /// belong to the current phase (stale re-sends, duplicated ACKs) are
    /// ignored.
    pub fn handle_reply(&mut self, payload: &[u16]) {
        let Some(&op_word) = payload.first() else {
            return;
        };

        if op_word == op::ERROR {
            let code = payload.get(1).copied().unwrap_or(0);
            self.phase = Phase::Failed(
                num_from_error_code(code).unwrap_or(UpdateError::None),
            );
            return;
        }

        match self.phase {
            Phase::Entering if op_word == op::READY => {
                // The node reports its staging capacity in KiB; an image
                // that cannot fit will never verify, so fail fast.
                let kib = usize::from(payload.get(1).copied().unwrap_or(0));
                if self.image.len() > kib * 1024 {
                    self.phase = Phase::Failed(UpdateError::InvalidSize);
                } else {
                    self.phase = Phase::Sending;
                }
            }
            Phase::Sending if op_word == op::ACK_CHUNK => {
                if payload.get(1).copied() == Some(self.next_chunk) {
                    self.next_chunk += 1;
                    if self.next_chunk == self.total_chunks() {
                        self.phase = Phase::Verifying;
                    }
                }
            }
            Phase::Verifying if op_word == op::VERIFY_RESP => {
                let lo = u32::from(payload.get(1).copied().unwrap_or(0));
                let hi = u32::from(payload.get(2).copied().unwrap_or(0));
                if hi << 16 | lo == CRC32.checksum(self.image) {
                    self.phase = Phase::Committing;
                } else {
                    // The staging buffer does not hold what we sent;
                    // committing would brick the node's application slot.
                    self.phase = Phase::Failed(UpdateError::CrcMismatch);
                }
            }
            Phase::Committing if op_word == op::COMMIT_RESP => {
                self.phase = Phase::Exiting;
            }
            _ => {}
        }
    }

    /// `UPDATE_MODE_EXIT` has no response; the caller reports the send and
    /// the client settles.
    pub fn note_exit_sent(&mut self) {
        if self.phase == Phase::Exiting {
            self.phase = Phase::Done;
        }
    }
}

fn num_from_error_code(code: u16) -> Option<UpdateError> {
    use num_traits::FromPrimitive;
    UpdateError::from_u16(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_request_layout() {
        let image: Vec<u8> = (0..300u32).map(|i| i as u8).collect();
        let mut client = UpdateClient::new(3, &image);
        client.handle_reply(&[op::READY, 40]);

        let req = client.pending_request().unwrap();
        assert_eq!(req.dest, 3);
        let p = req.payload();
        assert_eq!(p[0], op::DATA_CHUNK);
        assert_eq!(p[1], 0);
        assert_eq!(p[2], 256);
        assert_eq!(p.len(), 3 + 128);
        assert_eq!(p[3], 0x0100); // bytes 0, 1 little-endian

        client.handle_reply(&[op::ACK_CHUNK, 0]);
        let p2 = client.pending_request().unwrap();
        assert_eq!(p2.payload()[1], 1);
        assert_eq!(p2.payload()[2], 44);
    }

    #[test]
    fn image_larger_than_staging_fails_fast() {
        let image = vec![0u8; 8 * 1024];
        let mut client = UpdateClient::new(3, &image);
        client.handle_reply(&[op::READY, 4]);
        assert_eq!(client.failure(), Some(UpdateError::InvalidSize));
        assert!(client.pending_request().is_none());
    }

    #[test]
    fn stale_acks_are_ignored() {
        let image = vec![0u8; 600];
        let mut client = UpdateClient::new(3, &image);
        client.handle_reply(&[op::READY, 40]);
        client.handle_reply(&[op::ACK_CHUNK, 7]); // not ours
        assert_eq!(client.pending_request().unwrap().payload()[1], 0);
        client.handle_reply(&[op::ACK_CHUNK, 0]);
        assert_eq!(client.pending_request().unwrap().payload()[1], 1);
    }

    #[test]
    fn error_reply_fails_the_client() {
        let image = vec![0u8; 600];
        let mut client = UpdateClient::new(3, &image);
        client.handle_reply(&[op::READY, 40]);
        client.handle_reply(&[op::ERROR, UpdateError::ChunkSequence as u16]);
        assert_eq!(client.failure(), Some(UpdateError::ChunkSequence));
    }
}
