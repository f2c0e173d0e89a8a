// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Frame-level driver for the Z1 source-synchronous backplane.
//!
//! This crate moves frames on and off the 16-bit parallel bus. It owns the
//! transmit serializer, the receive DMA ring, and the carrier-sense pin; no
//! other subsystem touches them. It does *not* decide when to transmit --
//! that is the broker's job -- but it does perform the link-level automatic
//! responses (ACK, PING reply, topology ingestion) so those stay within
//! their latency budget no matter what the application core is doing.
//!
//! The two entry points are [`BusContext::send_frame`], which blocks until
//! the wire transmission completes (every internal wait carries a hard
//! timeout), and [`BusContext::try_receive_frame`], which pumps the receive
//! state machine for at most [`RX_BEAT_BUDGET`] beats and never blocks.

#![cfg_attr(not(test), no_std)]

use ringbuf::{ringbuf, ringbuf_entry};
use static_assertions::const_assert;
use z1_abi::opcode::bus;
use z1_abi::{
    frame_crc, BusError, Frame, FrameType, Header, TopologyView,
    BROADCAST_ADDR, MAX_FRAME_BEATS, MAX_PAYLOAD_BYTES, MAX_PAYLOAD_WORDS,
};
use z1_hal::{CarrierSense, Monotonic, RxDma, TxEngine};

mod rx;
mod stats;

pub use stats::{BusStats, LatencyStats};

use rx::{RxState, Step};

/// Bounded waits inside `send_frame`, in microseconds. A stuck serializer
/// or DMA controller costs the caller at most the sum of these.
pub const TX_FIFO_TIMEOUT_US: u64 = 200;
pub const TX_DMA_TIMEOUT_US: u64 = 5_000;
pub const TX_DRAIN_TIMEOUT_US: u64 = 1_000;
pub const TX_ABORT_TIMEOUT_US: u64 = 100;

/// How long the carrier line is actively pulled low while releasing the
/// bus, so the next receiver never samples a decaying-high line.
pub const CS_DISCHARGE_US: u32 = 2;

/// Maximum beats consumed per `try_receive_frame` call.
pub const RX_BEAT_BUDGET: usize = 1000;

// A maximum-size frame must fit inside one pump, or a saturated bus could
// starve the consumer of completed frames.
const_assert!(RX_BEAT_BUDGET >= MAX_FRAME_BEATS);

/// Full RX recovery is allowed at most once per this interval.
pub const RX_RECOVERY_INTERVAL_US: u64 = 100_000;
pub const RX_DRAIN_TIMEOUT_US: u64 = 1_000;

#[derive(Copy, Clone, PartialEq)]
enum Trace {
    None,
    TxStart { dest: u8, beats: u16 },
    TxDone,
    TxTimeout,
    RxFrame { src: u8, length: u16 },
    RxCrcError,
    RxDesync { length: u16 },
    RxRecover,
    RxRecoverSuppressed,
    AckSent { dest: u8 },
    PingReply { dest: u8 },
}

ringbuf!(Trace, 64, Trace::None);

/// Long-lived state of the bus layer, owned by the bus core.
pub struct BusContext<TX, RX, CS, M> {
    node_id: u8,
    tx: TX,
    rx: RX,
    carrier: CS,
    timer: M,

    tx_buf: [u16; MAX_FRAME_BEATS],

    // Receive side.
    rx_tail: usize,
    rx_state: RxState,
    rx_header: Header,
    rx_header_word: u16,
    rx_length: u16,
    rx_payload_idx: usize,
    rx_skip: usize,
    rx_frame: Frame,
    last_recovery_us: Option<u64>,

    stats: BusStats,
    topology: TopologyView,
}

impl<TX, RX, CS, M> BusContext<TX, RX, CS, M>
where
    TX: TxEngine,
    RX: RxDma,
    CS: CarrierSense,
    M: Monotonic,
{
    pub fn new(node_id: u8, tx: TX, rx: RX, carrier: CS, timer: M) -> Self {
        debug_assert!(rx.ring_len().is_power_of_two());
        BusContext {
            node_id,
            tx,
            rx,
            carrier,
            timer,
            tx_buf: [0; MAX_FRAME_BEATS],
            rx_tail: 0,
            rx_state: RxState::WaitHeader,
            rx_header: Header::unpack(0),
            rx_header_word: 0,
            rx_length: 0,
            rx_payload_idx: 0,
            rx_skip: 0,
            rx_frame: Frame::EMPTY,
            last_recovery_us: None,
            stats: BusStats::default(),
            topology: TopologyView::new(),
        }
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    pub fn stats(&self) -> &BusStats {
        &self.stats
    }

    pub fn topology(&self) -> &TopologyView {
        &self.topology
    }

    pub fn topology_mut(&mut self) -> &mut TopologyView {
        &mut self.topology
    }

    pub fn timer(&self) -> &M {
        &self.timer
    }

    /// Samples the carrier-sense line; true while any participant is
    /// mid-transmission.
    pub fn carrier_busy(&self) -> bool {
        self.carrier.sense()
    }

    /// Serializes and transmits one frame, blocking until the last beat has
    /// left the serializer or a timeout fires.
    ///
    /// The carrier line is held high for the whole transmission and
    /// released in the order: clear data/clock, float data/clock, pull
    /// carrier low for [`CS_DISCHARGE_US`], float carrier. Both the success
    /// and the timeout path go through that sequence, so a wedged
    /// peripheral never leaves the bus claimed.
    pub fn send_frame(
        &mut self,
        frame_type: FrameType,
        dest: u8,
        stream: u8,
        no_ack: bool,
        payload: &[u16],
    ) -> Result<(), BusError> {
        if payload.is_empty() || payload.len() > MAX_PAYLOAD_WORDS {
            return Err(BusError::InvalidLength);
        }

        let header = Header {
            frame_type,
            src: self.node_id,
            dest,
            no_ack,
            stream,
        };
        let header_word = header.pack();
        let length_bytes = (payload.len() * 2) as u16;

        self.tx_buf[0] = header_word;
        self.tx_buf[1] = length_bytes;
        self.tx_buf[2..2 + payload.len()].copy_from_slice(payload);
        self.tx_buf[2 + payload.len()] =
            frame_crc(header_word, length_bytes, payload);
        let beats = payload.len() + 3;

        ringbuf_entry!(Trace::TxStart {
            dest,
            beats: beats as u16
        });
        let started = self.timer.now_us();

        self.carrier.raise();
        self.tx.begin();
        self.tx.start_dma(&self.tx_buf[..beats]);

        let ok = wait_until(&self.timer, TX_FIFO_TIMEOUT_US, || {
            self.tx.fifo_primed()
        }) && wait_until(&self.timer, TX_DMA_TIMEOUT_US, || {
            self.tx.dma_done()
        }) && wait_until(&self.timer, TX_DRAIN_TIMEOUT_US, || {
            self.tx.fifo_empty()
        });

        if !ok {
            self.tx.abort();
            // Give the abort a bounded window to drain whatever is stuck.
            wait_until(&self.timer, TX_ABORT_TIMEOUT_US, || {
                self.tx.fifo_empty()
            });
            self.release_bus();
            self.stats.tx_timeouts += 1;
            ringbuf_entry!(Trace::TxTimeout);
            return Err(BusError::TxTimeout);
        }

        self.release_bus();

        let elapsed = self.timer.now_us().saturating_sub(started);
        self.stats.tx_frames += 1;
        self.stats.tx_latency.record(elapsed as u32);
        ringbuf_entry!(Trace::TxDone);
        Ok(())
    }

    fn release_bus(&mut self) {
        // Order matters: a receiver must never see live data beats after
        // carrier drops, and must never sample a floating carrier that is
        // still decaying high.
        self.tx.release();
        self.carrier.discharge();
        self.timer.delay_us(CS_DISCHARGE_US);
        self.carrier.release();
    }

    /// Pumps the receive state machine, returning the next frame addressed
    /// to this node (or broadcast), if one completes within the beat
    /// budget.
    ///
    /// Frames are returned even when their CRC check failed -- `crc_valid`
    /// tells the consumer -- but the link-level automatic responses only
    /// fire for valid frames.
    pub fn try_receive_frame(&mut self) -> Option<Frame> {
        let ring_len = self.rx.ring_len();
        let mask = ring_len - 1;
        let mut budget = RX_BEAT_BUDGET;

        while budget > 0 {
            let wr = self.rx.write_index();
            if wr >= ring_len {
                self.recover();
                return None;
            }
            if self.rx_tail == wr {
                return None;
            }

            while self.rx_tail != wr && budget > 0 {
                let beat = self.rx.read(self.rx_tail);
                self.rx_tail = (self.rx_tail + 1) & mask;
                budget -= 1;

                match self.step(beat) {
                    Step::Continue => {}
                    Step::Desync => {
                        // A length beyond the maximum means we are not
                        // looking at a length word at all. Skipping beats
                        // would just re-desynchronize; drop everything the
                        // DMA has buffered and start clean.
                        ringbuf_entry!(Trace::RxDesync { length: beat });
                        self.stats.rx_desync_flushes += 1;
                        self.rx_tail = self.rx.write_index() & mask;
                        self.rx_state = RxState::WaitHeader;
                        break;
                    }
                    Step::Emit => {
                        let frame = self.rx_frame;
                        self.autorespond(&frame);
                        return Some(frame);
                    }
                }
            }
        }
        None
    }

    /// Feeds one beat to the state machine.
    fn step(&mut self, beat: u16) -> Step {
        match self.rx_state {
            RxState::WaitHeader => {
                let header = Header::unpack(beat);
                if self.accepts(&header) {
                    self.rx_header = header;
                    self.rx_header_word = beat;
                    self.rx_state = RxState::WaitLength;
                } else {
                    self.rx_state = RxState::DiscardWaitLength;
                }
                Step::Continue
            }
            RxState::WaitLength => {
                if beat as usize > MAX_PAYLOAD_BYTES {
                    return Step::Desync;
                }
                self.rx_length = beat;
                self.rx_payload_idx = 0;
                self.rx_state = if beat == 0 {
                    RxState::WaitCrc
                } else {
                    RxState::WaitPayload
                };
                Step::Continue
            }
            RxState::WaitPayload => {
                let words = (self.rx_length as usize + 1) / 2;
                self.rx_frame.payload_mut()[self.rx_payload_idx] = beat;
                self.rx_payload_idx += 1;
                if self.rx_payload_idx == words {
                    self.rx_state = RxState::WaitCrc;
                }
                Step::Continue
            }
            RxState::WaitCrc => {
                let words = (self.rx_length as usize + 1) / 2;
                let computed = frame_crc(
                    self.rx_header_word,
                    self.rx_length,
                    &self.rx_frame.payload_mut()[..words],
                );
                let crc_valid = computed == beat;
                if !crc_valid {
                    self.stats.rx_crc_errors += 1;
                    ringbuf_entry!(Trace::RxCrcError);
                }

                self.rx_frame.header = self.rx_header;
                self.rx_frame.length_bytes = self.rx_length;
                self.rx_frame.crc_valid = crc_valid;
                self.rx_frame.timestamp_us = self.timer.now_us();
                self.stats.rx_frames += 1;
                ringbuf_entry!(Trace::RxFrame {
                    src: self.rx_header.src,
                    length: self.rx_length
                });

                self.rx_state = RxState::WaitHeader;
                Step::Emit
            }
            RxState::DiscardWaitLength => {
                if beat as usize > MAX_PAYLOAD_BYTES {
                    return Step::Desync;
                }
                // Payload beats plus the CRC beat.
                self.rx_skip = (beat as usize + 1) / 2 + 1;
                self.rx_state = RxState::DiscardSkip;
                self.stats.rx_discarded += 1;
                Step::Continue
            }
            RxState::DiscardSkip => {
                self.rx_skip -= 1;
                if self.rx_skip == 0 {
                    self.rx_state = RxState::WaitHeader;
                }
                Step::Continue
            }
        }
    }

    /// Address filter, applied at the header beat.
    fn accepts(&self, header: &Header) -> bool {
        if header.dest == BROADCAST_ADDR {
            // Broadcasts are accepted even from ourselves; intra-node
            // broadcast is a legitimate delivery path.
            return true;
        }
        if header.dest != self.node_id {
            return false;
        }
        !(header.frame_type == FrameType::Unicast && header.src == self.node_id)
    }

    /// Link-level automatic responses, fired for CRC-valid frames only.
    fn autorespond(&mut self, frame: &Frame) {
        if !frame.crc_valid {
            return;
        }

        let now_ms = self.timer.now_ms();
        self.topology.mark_seen(frame.header.src, now_ms);

        match frame.header.frame_type {
            FrameType::Unicast if !frame.header.no_ack => {
                // ACK-of-ACK is prevented by setting no_ack on the reply.
                let dest = frame.header.src;
                let stream = frame.header.stream;
                let _ = self.send_frame(
                    FrameType::Ctrl,
                    dest,
                    stream,
                    true,
                    &[bus::ACK],
                );
                ringbuf_entry!(Trace::AckSent { dest });
            }
            FrameType::Ctrl => match frame.payload().first() {
                Some(&bus::PING)
                    if frame.payload().len() >= bus::PING_LEN_WORDS
                        && frame.header.src != self.node_id =>
                {
                    let p = frame.payload();
                    let reply = [
                        bus::PING_REPLY,
                        p[1],
                        p[2],
                        p[3],
                        p[4],
                        p[5],
                    ];
                    let dest = frame.header.src;
                    let _ = self.send_frame(
                        FrameType::Ctrl,
                        dest,
                        frame.header.stream,
                        true,
                        &reply,
                    );
                    ringbuf_entry!(Trace::PingReply { dest });
                }
                Some(&bus::TOPOLOGY) => {
                    if let Some(mask) =
                        TopologyView::decode_table(&frame.payload()[1..])
                    {
                        self.topology.apply_table(mask, now_ms);
                    }
                }
                _ => {}
            },
            _ => {}
        }
    }

    /// Full receive-path reset: disable, drain, abort, re-arm. Rate-limited
    /// to once per [`RX_RECOVERY_INTERVAL_US`] so a persistently confused
    /// DMA controller cannot monopolize the bus core.
    fn recover(&mut self) {
        let now = self.timer.now_us();
        if let Some(last) = self.last_recovery_us {
            if now.saturating_sub(last) < RX_RECOVERY_INTERVAL_US {
                ringbuf_entry!(Trace::RxRecoverSuppressed);
                return;
            }
        }
        self.last_recovery_us = Some(now);
        self.stats.rx_recoveries += 1;
        ringbuf_entry!(Trace::RxRecover);

        self.rx.disable();
        wait_until(&self.timer, RX_DRAIN_TIMEOUT_US, || {
            self.rx.fifo_drained()
        });
        self.rx.abort();
        self.rx.rearm();
        self.rx_tail = 0;
        self.rx_state = RxState::WaitHeader;
    }

    /// Observable receive state, for tests and debuggers.
    pub fn rx_is_idle(&self) -> bool {
        self.rx_state == RxState::WaitHeader
    }

    /// Originates a PING: sequence word plus four caller-chosen data
    /// words, all echoed back by the target. Controller health checks use
    /// this; workers only ever answer.
    pub fn send_ping(
        &mut self,
        dest: u8,
        seq: u16,
        data: &[u16; bus::PING_DATA_WORDS],
    ) -> Result<(), BusError> {
        let payload = [bus::PING, seq, data[0], data[1], data[2], data[3]];
        self.send_frame(FrameType::Ctrl, dest, 0, true, &payload)
    }

    /// Broadcasts this node's topology view as a TOPOLOGY table. The
    /// controller does this periodically after sweeping the cluster with
    /// pings.
    pub fn broadcast_topology(&mut self) -> Result<(), BusError> {
        let now_ms = self.timer.now_ms();
        self.topology.mark_seen(self.node_id, now_ms);
        let table = self.topology.encode_table();
        let payload = [bus::TOPOLOGY, table[0], table[1], table[2]];
        self.send_frame(FrameType::Ctrl, BROADCAST_ADDR, 0, true, &payload)
    }
}

/// Polls `cond` until it holds or `timeout_us` elapses.
fn wait_until<M: Monotonic>(
    timer: &M,
    timeout_us: u64,
    mut cond: impl FnMut() -> bool,
) -> bool {
    let deadline = timer.now_us() + timeout_us;
    loop {
        if cond() {
            return true;
        }
        if timer.now_us() >= deadline {
            return false;
        }
    }
}
