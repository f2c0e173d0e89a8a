// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory bindings of the `z1-hal` capability traits, plus a simulated
//! backplane wiring several nodes together.
//!
//! This is the only concrete binding in the workspace; the test suites use
//! it to drive the bus layer, broker and bootloader end to end. It is a
//! host-side crate and leans on `std` freely.
//!
//! The simulation is deliberately simple: a transmission deposits its beats
//! into every attached node's receive ring instantly (including the
//! sender's own, which is how the hardware behaves -- the RX taps see every
//! beat on the wire). Time is a shared counter that advances by one
//! microsecond per observation, so bounded polling loops terminate and
//! latency numbers accumulate deterministically.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use z1_hal::{CarrierSense, Monotonic, RxDma, TxEngine};

mod flash;
mod node;

pub use flash::{FlashControl, MockFlash};

/// Beats per simulated RX DMA ring. Matches the reference RX ring depth.
pub const RING_BEATS: usize = 2048;

const MAX_TAPS: usize = 18;

/// Observable bus events, in global order. Tests use these to check the
/// carrier release sequencing.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BusEvent {
    TxBegin(usize),
    TxStart(usize),
    TxAbort(usize),
    TxRelease(usize),
    CsRaise(usize),
    CsDischarge(usize),
    CsRelease(usize),
}

struct WireState {
    rings: Vec<Vec<u16>>,
    write_idx: Vec<usize>,
    /// Bitmask of taps currently driving the carrier line high.
    carrier_high: u32,
    events: Vec<BusEvent>,
}

pub struct Backplane {
    state: Mutex<WireState>,
    clock_us: AtomicU64,
}

impl Backplane {
    pub fn new() -> Arc<Backplane> {
        Arc::new(Backplane {
            state: Mutex::new(WireState {
                rings: Vec::new(),
                write_idx: Vec::new(),
                carrier_high: 0,
                events: Vec::new(),
            }),
            clock_us: AtomicU64::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, WireState> {
        self.state.lock().unwrap()
    }

    /// Attaches a node and returns its port set.
    pub fn attach(self: &Arc<Self>) -> NodeIo {
        let mut state = self.lock();
        let tap = state.rings.len();
        assert!(tap < MAX_TAPS, "too many taps on one backplane");
        state.rings.push(vec![0; RING_BEATS]);
        state.write_idx.push(0);
        drop(state);

        NodeIo {
            tap,
            tx: MockTx {
                bus: Arc::clone(self),
                tap,
                ctl: Arc::new(TxControl::default()),
            },
            rx: MockRx {
                bus: Arc::clone(self),
                tap,
                ctl: Arc::new(RxControl::default()),
            },
            carrier: MockCarrier {
                bus: Arc::clone(self),
                tap,
            },
        }
    }

    /// A handle on the shared microsecond clock.
    pub fn clock(self: &Arc<Self>) -> MockClock {
        MockClock {
            us: SharedClock::Backplane(Arc::clone(self)),
        }
    }

    pub fn advance_us(&self, us: u64) {
        self.clock_us.fetch_add(us, Ordering::Relaxed);
    }

    /// Deposits raw beats into a single node's RX ring, bypassing the
    /// wire. Used to simulate noise and desynchronization.
    pub fn inject(&self, tap: usize, beats: &[u16]) {
        let mut state = self.lock();
        deposit(&mut state, tap, beats);
    }

    /// Copy of the event log so far.
    pub fn events(&self) -> Vec<BusEvent> {
        self.lock().events.clone()
    }

    /// True while any tap drives the carrier line high. The controller's
    /// pull-down keeps the idle line low.
    pub fn carrier_high(&self) -> bool {
        self.lock().carrier_high != 0
    }
}

fn deposit(state: &mut WireState, tap: usize, beats: &[u16]) {
    for &beat in beats {
        let idx = state.write_idx[tap];
        state.rings[tap][idx] = beat;
        state.write_idx[tap] = (idx + 1) % RING_BEATS;
    }
}

/// Ports handed to one node by [`Backplane::attach`].
pub struct NodeIo {
    pub tap: usize,
    pub tx: MockTx,
    pub rx: MockRx,
    pub carrier: MockCarrier,
}

#[derive(Default)]
pub struct TxControl {
    /// When set, `start_dma` deposits nothing and the engine never reports
    /// completion: the wedged-peripheral case.
    pub stall_dma: AtomicBool,
    started: AtomicBool,
    aborted: AtomicBool,
}

pub struct MockTx {
    bus: Arc<Backplane>,
    tap: usize,
    ctl: Arc<TxControl>,
}

impl MockTx {
    pub fn control(&self) -> Arc<TxControl> {
        Arc::clone(&self.ctl)
    }
}

impl TxEngine for MockTx {
    fn begin(&mut self) {
        self.bus.lock().events.push(BusEvent::TxBegin(self.tap));
        self.ctl.started.store(false, Ordering::Relaxed);
        self.ctl.aborted.store(false, Ordering::Relaxed);
    }

    fn start_dma(&mut self, beats: &[u16]) {
        let mut state = self.bus.lock();
        state.events.push(BusEvent::TxStart(self.tap));
        self.ctl.started.store(true, Ordering::Relaxed);
        if self.ctl.stall_dma.load(Ordering::Relaxed) {
            return;
        }
        // Every tap on the wire sees every beat, the sender included.
        for tap in 0..state.rings.len() {
            deposit(&mut state, tap, beats);
        }
    }

    fn fifo_primed(&self) -> bool {
        self.ctl.started.load(Ordering::Relaxed)
            && !self.ctl.stall_dma.load(Ordering::Relaxed)
    }

    fn dma_done(&self) -> bool {
        self.fifo_primed()
    }

    fn fifo_empty(&self) -> bool {
        self.fifo_primed() || self.ctl.aborted.load(Ordering::Relaxed)
    }

    fn abort(&mut self) {
        self.bus.lock().events.push(BusEvent::TxAbort(self.tap));
        self.ctl.aborted.store(true, Ordering::Relaxed);
    }

    fn release(&mut self) {
        self.bus.lock().events.push(BusEvent::TxRelease(self.tap));
    }
}

#[derive(Default)]
pub struct RxControl {
    /// When set, `write_index` reports a value outside the ring, as a
    /// corrupted DMA controller would.
    pub corrupt_write_index: AtomicBool,
}

pub struct MockRx {
    bus: Arc<Backplane>,
    tap: usize,
    ctl: Arc<RxControl>,
}

impl MockRx {
    pub fn control(&self) -> Arc<RxControl> {
        Arc::clone(&self.ctl)
    }
}

impl RxDma for MockRx {
    fn ring_len(&self) -> usize {
        RING_BEATS
    }

    fn write_index(&self) -> usize {
        if self.ctl.corrupt_write_index.load(Ordering::Relaxed) {
            return RING_BEATS + 17;
        }
        self.bus.lock().write_idx[self.tap]
    }

    fn read(&self, index: usize) -> u16 {
        self.bus.lock().rings[self.tap][index % RING_BEATS]
    }

    fn disable(&mut self) {}

    fn fifo_drained(&self) -> bool {
        true
    }

    fn abort(&mut self) {}

    fn rearm(&mut self) {
        // Re-arming resets the channel; the fault injection is considered
        // repaired by it.
        self.ctl.corrupt_write_index.store(false, Ordering::Relaxed);
        let mut state = self.bus.lock();
        state.write_idx[self.tap] = 0;
    }
}

pub struct MockCarrier {
    bus: Arc<Backplane>,
    tap: usize,
}

impl CarrierSense for MockCarrier {
    fn sense(&self) -> bool {
        self.bus.lock().carrier_high != 0
    }

    fn raise(&mut self) {
        let mut state = self.bus.lock();
        state.carrier_high |= 1 << self.tap;
        state.events.push(BusEvent::CsRaise(self.tap));
    }

    fn discharge(&mut self) {
        let mut state = self.bus.lock();
        state.carrier_high &= !(1 << self.tap);
        state.events.push(BusEvent::CsDischarge(self.tap));
    }

    fn release(&mut self) {
        let mut state = self.bus.lock();
        state.carrier_high &= !(1 << self.tap);
        state.events.push(BusEvent::CsRelease(self.tap));
    }
}

enum SharedClock {
    Backplane(Arc<Backplane>),
    Standalone(Arc<AtomicU64>),
}

/// Shared microsecond clock. Every observation advances time by one
/// microsecond so polling loops make progress.
pub struct MockClock {
    us: SharedClock,
}

impl MockClock {
    /// A clock not tied to any backplane, for bootloader/update tests.
    pub fn standalone() -> MockClock {
        MockClock {
            us: SharedClock::Standalone(Arc::new(AtomicU64::new(0))),
        }
    }

    pub fn advance_us(&self, us: u64) {
        match &self.us {
            SharedClock::Backplane(bp) => bp.advance_us(us),
            SharedClock::Standalone(c) => {
                c.fetch_add(us, Ordering::Relaxed);
            }
        }
    }
}

impl Clone for MockClock {
    fn clone(&self) -> Self {
        MockClock {
            us: match &self.us {
                SharedClock::Backplane(bp) => {
                    SharedClock::Backplane(Arc::clone(bp))
                }
                SharedClock::Standalone(c) => {
                    SharedClock::Standalone(Arc::clone(c))
                }
            },
        }
    }
}

impl Monotonic for MockClock {
    fn now_us(&self) -> u64 {
        match &self.us {
            SharedClock::Backplane(bp) => {
                bp.clock_us.fetch_add(1, Ordering::Relaxed)
            }
            SharedClock::Standalone(c) => c.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn delay_us(&self, us: u32) {
        self.advance_us(u64::from(us));
    }
}

pub use node::{
    MockCpu, MockLed, MockPower, MockScratch, MockStrapping, MockWatchdog,
};
