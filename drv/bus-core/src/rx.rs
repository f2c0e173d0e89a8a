// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Receive state machine states.
//!
//! ```text
//! WAIT_HEADER ─┬─(ours)──────► WAIT_LENGTH ──┬─(0 < len ≤ 1200)─► WAIT_PAYLOAD ─► WAIT_CRC ─► emit
//!              │                             ├─(len == 0)───────────────────────► WAIT_CRC
//!              │                             └─(len > 1200)──► flush ring, WAIT_HEADER
//!              └─(not ours)─► DISCARD_WAIT_LENGTH ──(len ≤ 1200)─► DISCARD_SKIP ─► WAIT_HEADER
//! ```

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum RxState {
    WaitHeader,
    WaitLength,
    WaitPayload,
    WaitCrc,
    DiscardWaitLength,
    DiscardSkip,
}

/// Outcome of feeding one beat.
pub(crate) enum Step {
    Continue,
    /// A completed frame is sitting in the reassembly buffer.
    Emit,
    /// The length word was impossible; the layer has lost beat alignment.
    Desync,
}
