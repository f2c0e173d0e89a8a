// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ring buffers for debugging the bus, broker and update engine.
//!
//! A trace ring records the last `N` events of some `Copy` payload type in a
//! static, where a debugger (or a test) can find them after the fact.
//! Consecutive identical entries are de-duplicated into a repeat count so a
//! polling loop does not immediately flush the interesting history.
//!
//! Declare a ring with [`ringbuf!`] and record into it with
//! [`ringbuf_entry!`]:
//!
//! ```
//! use ringbuf::{ringbuf, ringbuf_entry};
//!
//! #[derive(Copy, Clone, PartialEq)]
//! enum Trace {
//!     None,
//!     TxStart(u16),
//!     TxDone,
//! }
//!
//! ringbuf!(Trace, 16, Trace::None);
//!
//! fn send(len: u16) {
//!     ringbuf_entry!(Trace::TxStart(len));
//!     // ...
//!     ringbuf_entry!(Trace::TxDone);
//! }
//! ```
//!
//! If you use the variant of `ringbuf!` that leaves the name implicit, you
//! can only have one ring per module; name them to have more.

#![cfg_attr(not(test), no_std)]

use spin::Mutex;

#[derive(Copy, Clone, Debug)]
pub struct RingbufEntry<T> {
    pub payload: T,
    /// How many consecutive times this payload was recorded.
    pub count: u16,
}

struct Inner<T, const N: usize> {
    /// Index of the most recently written entry, `None` before the first
    /// record.
    last: Option<usize>,
    buffer: [RingbufEntry<T>; N],
}

pub struct Ringbuf<T, const N: usize> {
    inner: Mutex<Inner<T, N>>,
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, N> {
    pub const fn new(initial: T) -> Self {
        Ringbuf {
            inner: Mutex::new(Inner {
                last: None,
                buffer: [RingbufEntry {
                    payload: initial,
                    count: 0,
                }; N],
            }),
        }
    }

    pub fn record(&self, payload: T) {
        let mut inner = self.inner.lock();

        if let Some(last) = inner.last {
            let entry = &mut inner.buffer[last];
            if entry.payload == payload && entry.count < u16::MAX {
                entry.count += 1;
                return;
            }
        }

        let next = match inner.last {
            Some(last) if last + 1 < N => last + 1,
            Some(_) => 0,
            None => 0,
        };
        inner.buffer[next] = RingbufEntry { payload, count: 1 };
        inner.last = Some(next);
    }

    /// Copy of the most recent entry, if anything has been recorded.
    pub fn last_entry(&self) -> Option<RingbufEntry<T>> {
        let inner = self.inner.lock();
        inner.last.map(|i| inner.buffer[i])
    }

    /// Total recorded occurrences of `payload` still present in the ring.
    pub fn occurrences_of(&self, payload: T) -> u32 {
        let inner = self.inner.lock();
        inner
            .buffer
            .iter()
            .filter(|e| e.count > 0 && e.payload == payload)
            .map(|e| u32::from(e.count))
            .sum()
    }
}

/// Declares a static trace ring: `ringbuf!(NAME, Type, N, initial)`, or
/// `ringbuf!(Type, N, initial)` for the implicit name.
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        static $name: $crate::Ringbuf<$t, { $n }> =
            $crate::Ringbuf::new($init);
    };
    ($t:ty, $n:expr, $init:expr) => {
        $crate::ringbuf!(__RINGBUF, $t, $n, $init);
    };
}

/// Records an entry in a ring declared with [`ringbuf!`].
#[macro_export]
macro_rules! ringbuf_entry {
    ($name:ident, $payload:expr) => {
        $name.record($payload);
    };
    ($payload:expr) => {
        $crate::ringbuf_entry!(__RINGBUF, $payload);
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Copy, Clone, Debug, PartialEq)]
    enum Trace {
        None,
        A(u8),
        B,
    }

    #[test]
    fn records_and_dedups() {
        let rb: Ringbuf<Trace, 4> = Ringbuf::new(Trace::None);
        assert!(rb.last_entry().is_none());

        rb.record(Trace::A(1));
        rb.record(Trace::A(1));
        rb.record(Trace::A(1));
        let last = rb.last_entry().unwrap();
        assert_eq!(last.payload, Trace::A(1));
        assert_eq!(last.count, 3);

        rb.record(Trace::B);
        assert_eq!(rb.last_entry().unwrap().payload, Trace::B);
        assert_eq!(rb.occurrences_of(Trace::A(1)), 3);
    }

    #[test]
    fn wraps_around() {
        let rb: Ringbuf<Trace, 2> = Ringbuf::new(Trace::None);
        rb.record(Trace::A(1));
        rb.record(Trace::A(2));
        rb.record(Trace::A(3));
        // A(1) was overwritten by the wrap.
        assert_eq!(rb.occurrences_of(Trace::A(1)), 0);
        assert_eq!(rb.occurrences_of(Trace::A(2)), 1);
        assert_eq!(rb.occurrences_of(Trace::A(3)), 1);
    }

    #[test]
    fn macro_forms() {
        ringbuf!(NAMED, u32, 8, 0);
        ringbuf_entry!(NAMED, 7);
        ringbuf_entry!(NAMED, 7);
        assert_eq!(NAMED.occurrences_of(7), 2);
    }
}
