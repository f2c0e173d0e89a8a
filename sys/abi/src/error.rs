// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use num_derive::FromPrimitive;

/// Errors surfaced by the bus layer.
///
/// Only `InvalidLength` and `TxTimeout` reach callers; `RxDesync` and
/// `DmaCorrupted` name conditions the layer recovers from locally (they
/// appear in trace rings and statistics, never in a `Result`).
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u32)]
pub enum BusError {
    /// Payload was empty or exceeded the 600-word maximum.
    InvalidLength = 1,
    /// A bounded wait (FIFO fill, DMA completion, drain, abort) expired
    /// mid-transmission. The bus was released cleanly.
    TxTimeout,
    /// RX length word exceeded 1200 bytes; the ring was flushed.
    RxDesync,
    /// DMA write pointer observed outside the RX ring; full reset applied.
    DmaCorrupted,
}

// These values are the on-wire payload of UPDATE_ERROR frames and are shared
// with the controller. DO NOT REORDER THEM.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u16)]
pub enum UpdateError {
    None = 0,
    /// Staged header magic was not `Z1AP`.
    InvalidMagic = 1,
    /// CRC32 over the staged binary disagreed with the header.
    CrcMismatch = 2,
    /// Image too small, too large for the partition, or truncated relative
    /// to the header's declared size; also a chunk that would overflow the
    /// staging buffer.
    InvalidSize = 3,
    /// Flash erase/program failed or read-back verification mismatched.
    FlashError = 4,
    /// A chunk arrived out of order; the session is dead until
    /// `UPDATE_MODE_EXIT`.
    ChunkSequence = 5,
}
