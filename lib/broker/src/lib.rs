// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Dual-queue priority CSMA broker.
//!
//! The broker multiplexes application send requests onto the bus. Spikes
//! (fire-and-forget, latency-sensitive) strictly dominate commands
//! (reliable, application-acknowledged) whenever the carrier is idle and no
//! backoff is pending. Arbitration against the other fifteen nodes is
//! carrier-sense with per-node priority backoff slots: lower node IDs wait
//! less and therefore win ties, and the controller -- node 16 -- always
//! yields.
//!
//! One `task()` invocation transmits at most one frame. The bus core calls
//! it in a tight loop interleaved with the RX pump and the inter-core
//! rings, and a multi-frame burst inside a single step would starve both.
//!
//! Queue depths are build-configured through const generics: the
//! application image runs [`AppBroker`] (64 spikes, 16 commands), the
//! bootloader runs [`BootBroker`] (no spike queue, 8 command slots for OTA
//! chunk replies).

#![cfg_attr(not(test), no_std)]

use heapless::Deque;
use ringbuf::{ringbuf, ringbuf_entry};

use drv_z1_bus_core::{BusContext, BusStats, LatencyStats};
use spsc::Spsc;
use z1_abi::{Frame, FrameType, BROADCAST_ADDR, MAX_PAYLOAD_WORDS};
use z1_hal::{CarrierSense, Monotonic, RxDma, TxEngine};

/// Ceiling on the carrier-sense busy-wait inside one transmit attempt.
pub const CS_WAIT_CEILING_US: u64 = 500;

/// Per-node priority backoff: `min(node_id, 16) * 30 us`.
pub const BACKOFF_SLOT_US: u32 = 30;

/// Burst fairness: after this many consecutive successful transmissions,
/// the broker refuses to transmit for [`BURST_LOCKOUT_US`].
pub const BURST_LIMIT: u32 = 10;
pub const BURST_LOCKOUT_US: u64 = 500;

/// Spikes older than this are dropped at dequeue. Commands do not age.
pub const SPIKE_MAX_AGE_US: u64 = 5_000_000;

/// A request is dropped after this many failed transmit attempts.
pub const MAX_RETRIES: u8 = 3;

/// Application-build queue depths.
pub const APP_SPIKE_DEPTH: usize = 64;
pub const APP_COMMAND_DEPTH: usize = 16;

/// Bootloader-build queue depths: OTA replies only.
pub const BOOT_SPIKE_DEPTH: usize = 0;
pub const BOOT_COMMAND_DEPTH: usize = 8;

#[derive(Copy, Clone, PartialEq)]
enum Trace {
    None,
    SpikeSent { dest: u8 },
    CommandSent { dest: u8 },
    QueueFull,
    SpikeAged,
    Collision,
    Dropped,
    BusBusy,
}

ringbuf!(Trace, 64, Trace::None);

/// A queued send request. Payload storage is inline: no pointer chasing on
/// the transmit path, and requests can be copied into the inter-core ring.
#[derive(Copy, Clone)]
pub struct TxRequest {
    frame_type: FrameType,
    dest: u8,
    stream: u8,
    no_ack: bool,
    len_words: u16,
    retries: u8,
    enqueued_at_us: u64,
    payload: [u16; MAX_PAYLOAD_WORDS],
}

impl TxRequest {
    const EMPTY: TxRequest = TxRequest {
        frame_type: FrameType::Unicast,
        dest: 0,
        stream: 0,
        no_ack: true,
        len_words: 0,
        retries: 0,
        enqueued_at_us: 0,
        payload: [0; MAX_PAYLOAD_WORDS],
    };

    /// A spike: broadcast when `dest` is 31, otherwise unicast with the
    /// auto-ACK suppressed. Fails on an empty or oversized payload.
    pub fn spike(payload: &[u16], dest: u8, stream: u8) -> Option<TxRequest> {
        let frame_type = if dest == BROADCAST_ADDR {
            FrameType::Broadcast
        } else {
            FrameType::Unicast
        };
        Self::build(frame_type, payload, dest, stream, true)
    }

    /// A command: CTRL framing; responses are the application layer's
    /// business, so the link-level ACK machinery stays out of the way.
    pub fn command(payload: &[u16], dest: u8, stream: u8) -> Option<TxRequest> {
        Self::build(FrameType::Ctrl, payload, dest, stream, dest == BROADCAST_ADDR)
    }

    fn build(
        frame_type: FrameType,
        payload: &[u16],
        dest: u8,
        stream: u8,
        no_ack: bool,
    ) -> Option<TxRequest> {
        if payload.is_empty() || payload.len() > MAX_PAYLOAD_WORDS {
            return None;
        }
        let mut r = TxRequest {
            frame_type,
            dest,
            stream,
            no_ack,
            len_words: payload.len() as u16,
            retries: 0,
            enqueued_at_us: 0,
            payload: [0; MAX_PAYLOAD_WORDS],
        };
        r.payload[..payload.len()].copy_from_slice(payload);
        Some(r)
    }

    pub fn is_spike(&self) -> bool {
        self.frame_type != FrameType::Ctrl
    }

    fn payload(&self) -> &[u16] {
        &self.payload[..usize::from(self.len_words)]
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct BrokerStats {
    pub spikes_sent: u32,
    pub commands_sent: u32,

    /// Every request that will never reach the wire, for any reason.
    pub total_dropped: u32,
    /// Enqueue rejections; exactly one increment per rejected `send_*`.
    pub queue_full_drops: u32,
    pub spikes_aged: u32,
    pub retry_exhausted: u32,

    /// Transmit attempts that lost the bus (claimed during backoff, or
    /// wire-level failure), plus one per retry-exhausted request.
    pub collisions: u32,
    /// Successful sends bucketed by how many retries they needed.
    pub retry_histogram: [u32; MAX_RETRIES as usize],

    /// Enqueue-to-wire latency of successful sends.
    pub latency: LatencyStats,

    /// Carrier-sense outcomes of transmit attempts.
    pub bus_busy_samples: u32,
    pub bus_idle_samples: u32,

    /// Frames lost because the application core let the RX ring fill up.
    pub rx_ring_overflow: u32,
}

/// Broker state, owned by the bus core alongside its `BusContext`.
pub struct Broker<TX, RX, CS, M, const S: usize, const C: usize> {
    bus: BusContext<TX, RX, CS, M>,
    spikes: Deque<TxRequest, S>,
    commands: Deque<TxRequest, C>,
    burst_count: u32,
    backoff_until_us: Option<u64>,
    stats: BrokerStats,
}

pub type AppBroker<TX, RX, CS, M> =
    Broker<TX, RX, CS, M, APP_SPIKE_DEPTH, APP_COMMAND_DEPTH>;
pub type BootBroker<TX, RX, CS, M> =
    Broker<TX, RX, CS, M, BOOT_SPIKE_DEPTH, BOOT_COMMAND_DEPTH>;

impl<TX, RX, CS, M, const S: usize, const C: usize> Broker<TX, RX, CS, M, S, C>
where
    TX: TxEngine,
    RX: RxDma,
    CS: CarrierSense,
    M: Monotonic,
{
    pub fn new(bus: BusContext<TX, RX, CS, M>) -> Self {
        Broker {
            bus,
            spikes: Deque::new(),
            commands: Deque::new(),
            burst_count: 0,
            backoff_until_us: None,
            stats: BrokerStats::default(),
        }
    }

    pub fn bus(&self) -> &BusContext<TX, RX, CS, M> {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut BusContext<TX, RX, CS, M> {
        &mut self.bus
    }

    pub fn stats(&self) -> &BrokerStats {
        &self.stats
    }

    pub fn bus_stats(&self) -> &BusStats {
        self.bus.stats()
    }

    pub fn spike_depth(&self) -> usize {
        self.spikes.len()
    }

    pub fn command_depth(&self) -> usize {
        self.commands.len()
    }

    /// Enqueues a fire-and-forget spike. Returns `false` (with one drop
    /// counted) when the spike queue is full.
    pub fn send_spike(&mut self, payload: &[u16], dest: u8, stream: u8) -> bool {
        let Some(req) = TxRequest::spike(payload, dest, stream) else {
            return false;
        };
        self.enqueue_spike(req)
    }

    /// Enqueues a reliable command. Returns `false` when the command queue
    /// is full.
    pub fn send_command(
        &mut self,
        payload: &[u16],
        dest: u8,
        stream: u8,
    ) -> bool {
        let Some(req) = TxRequest::command(payload, dest, stream) else {
            return false;
        };
        self.enqueue_command(req)
    }

    fn enqueue_spike(&mut self, mut req: TxRequest) -> bool {
        req.enqueued_at_us = self.bus.timer().now_us();
        if self.spikes.push_back(req).is_err() {
            // One increment per rejected enqueue, no matter the caller
            // path.
            self.stats.queue_full_drops += 1;
            self.stats.total_dropped += 1;
            ringbuf_entry!(Trace::QueueFull);
            return false;
        }
        true
    }

    fn enqueue_command(&mut self, mut req: TxRequest) -> bool {
        req.enqueued_at_us = self.bus.timer().now_us();
        if self.commands.push_back(req).is_err() {
            self.stats.queue_full_drops += 1;
            self.stats.total_dropped += 1;
            ringbuf_entry!(Trace::QueueFull);
            return false;
        }
        true
    }

    /// Delivers the next received frame, if any.
    pub fn try_receive(&mut self) -> Option<Frame> {
        self.bus.try_receive_frame()
    }

    /// One scheduling step: age the spike queue, pick the highest-priority
    /// pending request, and attempt to transmit it. Never transmits more
    /// than one frame.
    pub fn task(&mut self) {
        let now = self.bus.timer().now_us();

        if let Some(until) = self.backoff_until_us {
            if now < until {
                return;
            }
            self.backoff_until_us = None;
        }

        // Stale spikes are dropped at dequeue time; a spike that sat
        // queued for five seconds describes an event nobody cares about
        // anymore.
        while let Some(front) = self.spikes.front() {
            if now.saturating_sub(front.enqueued_at_us) > SPIKE_MAX_AGE_US {
                self.spikes.pop_front();
                self.stats.spikes_aged += 1;
                self.stats.total_dropped += 1;
                ringbuf_entry!(Trace::SpikeAged);
            } else {
                break;
            }
        }

        let from_spikes = if !self.spikes.is_empty() {
            true
        } else if !self.commands.is_empty() {
            false
        } else {
            return;
        };

        self.attempt(from_spikes);
    }

    /// A single transmit attempt against the head of one queue.
    fn attempt(&mut self, from_spikes: bool) {
        // 1. Wait, bounded, for the carrier to go idle.
        if !self.wait_carrier_idle() {
            self.stats.bus_busy_samples += 1;
            ringbuf_entry!(Trace::BusBusy);
            return;
        }
        self.stats.bus_idle_samples += 1;

        // 2. Priority backoff slot. Lower IDs re-check sooner and win the
        // bus; the controller waits longest.
        let slot_us =
            u32::from(self.bus.node_id().min(16)) * BACKOFF_SLOT_US;
        if slot_us > 0 {
            self.bus.timer().delay_us(slot_us);
        }

        // 3. Somebody may have claimed the bus while we backed off.
        if self.bus.carrier_busy() {
            self.stats.collisions += 1;
            ringbuf_entry!(Trace::Collision);
            self.fail_head(from_spikes);
            return;
        }

        // 4. Transmit.
        let result = {
            let req = if from_spikes {
                self.spikes.front()
            } else {
                self.commands.front()
            };
            // The queue was non-empty when our caller chose it and nothing
            // since has popped it.
            let Some(req) = req else { return };
            self.bus.send_frame(
                req.frame_type,
                req.dest,
                req.stream,
                req.no_ack,
                req.payload(),
            )
        };

        match result {
            Ok(()) => {
                let sent = if from_spikes {
                    self.spikes.pop_front()
                } else {
                    self.commands.pop_front()
                };
                if let Some(sent) = sent {
                    let now = self.bus.timer().now_us();
                    self.stats.latency.record(
                        now.saturating_sub(sent.enqueued_at_us) as u32,
                    );
                    self.stats.retry_histogram
                        [usize::from(sent.retries.min(MAX_RETRIES - 1))] += 1;
                    if from_spikes {
                        self.stats.spikes_sent += 1;
                        ringbuf_entry!(Trace::SpikeSent { dest: sent.dest });
                    } else {
                        self.stats.commands_sent += 1;
                        ringbuf_entry!(Trace::CommandSent { dest: sent.dest });
                    }
                }

                // 5. Burst fairness.
                self.burst_count += 1;
                if self.burst_count >= BURST_LIMIT {
                    self.burst_count = 0;
                    self.backoff_until_us =
                        Some(self.bus.timer().now_us() + BURST_LOCKOUT_US);
                }
            }
            Err(_) => {
                self.stats.collisions += 1;
                self.burst_count = 0;
                self.fail_head(from_spikes);
            }
        }
    }

    /// Charges a failed attempt to the head request, dropping it once the
    /// retry budget is spent. A dropped request is never retried; callers
    /// were told to check `send_*`'s return value, not to expect miracles.
    fn fail_head(&mut self, from_spikes: bool) {
        let head = if from_spikes {
            self.spikes.front_mut()
        } else {
            self.commands.front_mut()
        };
        let Some(head) = head else { return };
        head.retries += 1;
        if head.retries >= MAX_RETRIES {
            if from_spikes {
                self.spikes.pop_front();
            } else {
                self.commands.pop_front();
            }
            self.stats.retry_exhausted += 1;
            self.stats.total_dropped += 1;
            self.stats.collisions += 1;
            ringbuf_entry!(Trace::Dropped);
        }
    }

    fn wait_carrier_idle(&self) -> bool {
        let timer = self.bus.timer();
        let deadline = timer.now_us() + CS_WAIT_CEILING_US;
        loop {
            if !self.bus.carrier_busy() {
                return true;
            }
            if timer.now_us() >= deadline {
                return false;
            }
        }
    }

    /// One iteration of the bus core's main loop: pump RX toward the
    /// application ring, drain one transmit request from the application
    /// ring into the queues, then run the scheduler.
    pub fn service<const RN: usize, const TN: usize>(
        &mut self,
        to_app: &Spsc<Frame, RN>,
        from_app: &Spsc<TxRequest, TN>,
    ) {
        if let Some(frame) = self.bus.try_receive_frame() {
            if !to_app.push(frame) {
                self.stats.rx_ring_overflow += 1;
            }
        }

        if let Some(req) = from_app.pop() {
            if req.is_spike() {
                self.enqueue_spike(req);
            } else {
                self.enqueue_command(req);
            }
        }

        self.task();
    }
}

/// Inert initializer for the application-side TX ring.
pub const EMPTY_TX_REQUEST: TxRequest = TxRequest::EMPTY;
