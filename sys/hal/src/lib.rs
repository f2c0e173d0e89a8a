// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Capability traits abstracting the Z1 node silicon.
//!
//! The protocol core (bus layer, broker, bootloader, update engine) is
//! written entirely against these traits; a target binding supplies concrete
//! implementations over its programmable-IO blocks, DMA controller, flash
//! controller and GPIO. The only binding shipped in this workspace is the
//! mock backplane used by the test suites.
//!
//! The traits deliberately expose *mechanism*, not policy: sequencing,
//! timeouts, retry and recovery all live in the core crates so they are
//! identical on every target.

#![cfg_attr(not(test), no_std)]

/// Monotonic microsecond clock.
///
/// `now_us` must be non-decreasing. Granularity is target-defined; a
/// simulated clock may advance by as little as a tick per read, which the
/// core's bounded polling loops rely on to terminate.
pub trait Monotonic {
    fn now_us(&self) -> u64;

    /// Milliseconds, for the coarse timestamps in the topology table.
    fn now_ms(&self) -> u32 {
        (self.now_us() / 1000) as u32
    }

    /// Blocks (or simulates blocking) for at least `us` microseconds.
    fn delay_us(&self, us: u32);
}

/// The shared carrier-sense line (SELECT0).
///
/// High while any participant is mid-transmission; floated when idle; the
/// controller carries the only pull-down. Release after transmit must go
/// through [`CarrierSense::discharge`] first so a receiver never samples a
/// floating line that is still decaying high.
pub trait CarrierSense {
    /// Samples the line.
    fn sense(&self) -> bool;

    /// Drives the line high, claiming the bus.
    fn raise(&mut self);

    /// Actively pulls the line low.
    fn discharge(&mut self);

    /// Returns the pin to high-impedance.
    fn release(&mut self);
}

/// Transmit side of the bus: a serializer (programmable IO) fed by DMA,
/// plus ownership of the data and clock pins.
pub trait TxEngine {
    /// Claims the data/clock pins as outputs and enables the serializer.
    fn begin(&mut self);

    /// Arms the DMA transfer of `beats` into the serializer FIFO.
    fn start_dma(&mut self, beats: &[u16]);

    /// True once the FIFO holds data and beats are clocking out.
    fn fifo_primed(&self) -> bool;

    /// True once DMA has handed the last beat to the FIFO.
    fn dma_done(&self) -> bool;

    /// True once the serializer has drained its FIFO onto the wire.
    fn fifo_empty(&self) -> bool;

    /// Cancels an in-flight transfer (used on timeout).
    fn abort(&mut self);

    /// Clears the data/clock outputs and returns the pins to high-Z.
    fn release(&mut self);
}

/// Receive side: DMA continuously deposits beats into a power-of-two ring.
///
/// The core keeps its own consumer index and reads the producer position
/// from the DMA controller each pump. A corrupted controller may report a
/// position outside the ring, which is the core's cue for a full reset.
pub trait RxDma {
    /// Ring capacity in beats. Must be a power of two.
    fn ring_len(&self) -> usize;

    /// Index of the next beat the DMA will write. Values `>= ring_len()`
    /// indicate controller corruption.
    fn write_index(&self) -> usize;

    /// Reads the beat at `index` (caller masks to the ring).
    fn read(&self, index: usize) -> u16;

    /// Stops the receive state machine.
    fn disable(&mut self);

    /// True when the receive FIFO has drained after a disable.
    fn fifo_drained(&self) -> bool;

    /// Aborts the DMA channel.
    fn abort(&mut self);

    /// Resets the write pointer to zero and restarts reception.
    fn rearm(&mut self);
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FlashOpError {
    /// Offset/length outside the partition.
    Bounds,
    /// The controller reported an erase/program failure.
    Device,
}

/// The application partition of the flash device.
///
/// Offsets are relative to the partition base. Programming granularity is
/// one page; callers pad the final page. Reads go through the memory-mapped
/// window, which is what commit-time verification wants to exercise.
pub trait FlashDevice {
    fn page_size(&self) -> usize;
    fn partition_size(&self) -> usize;
    fn erase_partition(&mut self) -> Result<(), FlashOpError>;
    fn program_page(&mut self, offset: usize, data: &[u8])
        -> Result<(), FlashOpError>;
    fn read(&self, offset: usize, dest: &mut [u8]) -> Result<(), FlashOpError>;
}

/// Watchdog used to reboot out of update mode. The reset it triggers
/// preserves the persistent scratch register.
pub trait Watchdog {
    fn schedule_reboot(&mut self);
}

/// A small CPU-resident register that survives soft resets.
pub trait PersistentScratch {
    fn read(&self) -> u32;
    fn write(&mut self, value: u32);
}

/// The four node-ID strapping pins on the backplane connector.
pub trait IdStrapping {
    /// Resets the pad configuration, disables pulls, waits for the lines to
    /// settle, and reads the 4-bit ID the backplane imposes.
    fn read_id(&mut self) -> u8;
}

/// Status LED (the red one, in the bootloader's case).
pub trait Led {
    fn set(&mut self, on: bool);
}

/// Privileged CPU operations for the bootloader-to-application handoff.
pub trait CpuControl {
    fn disable_interrupts(&mut self);

    /// Points the vector table at `vector_base`, loads `sp` and branches to
    /// `pc`. On real silicon this never returns; the mock records the call
    /// so tests can observe it.
    fn jump_to_application(&mut self, vector_base: u32, sp: u32, pc: u32);
}

/// Clock and core-voltage bring-up to the speeds the bus requires.
pub trait PowerClock {
    fn configure(&mut self, bus_hz: u32);
}
