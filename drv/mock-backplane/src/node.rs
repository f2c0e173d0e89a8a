// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-node odds and ends: watchdog, scratch register, strapping pins,
//! LED, CPU handoff, power/clock bring-up. Each records enough for tests
//! to observe what the core asked of it.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use z1_hal::{
    CpuControl, IdStrapping, Led, PersistentScratch, PowerClock, Watchdog,
};

#[derive(Default)]
pub struct MockWatchdog {
    fired: Arc<AtomicBool>,
}

impl MockWatchdog {
    pub fn new() -> MockWatchdog {
        MockWatchdog::default()
    }

    pub fn fired_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.fired)
    }
}

impl Watchdog for MockWatchdog {
    fn schedule_reboot(&mut self) {
        self.fired.store(true, Ordering::Relaxed);
    }
}

#[derive(Default)]
pub struct MockScratch {
    value: Arc<AtomicU32>,
}

impl MockScratch {
    pub fn with_value(value: u32) -> MockScratch {
        let s = MockScratch::default();
        s.value.store(value, Ordering::Relaxed);
        s
    }

    pub fn handle(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.value)
    }
}

impl PersistentScratch for MockScratch {
    fn read(&self) -> u32 {
        self.value.load(Ordering::Relaxed)
    }

    fn write(&mut self, value: u32) {
        self.value.store(value, Ordering::Relaxed);
    }
}

pub struct MockStrapping {
    id: u8,
    reads: u32,
}

impl MockStrapping {
    pub fn new(id: u8) -> MockStrapping {
        MockStrapping { id, reads: 0 }
    }

    pub fn reads(&self) -> u32 {
        self.reads
    }
}

impl IdStrapping for MockStrapping {
    fn read_id(&mut self) -> u8 {
        self.reads += 1;
        self.id & 0xF
    }
}

#[derive(Default)]
pub struct MockLed {
    on: Arc<AtomicBool>,
    transitions: Arc<AtomicU32>,
}

impl MockLed {
    pub fn new() -> MockLed {
        MockLed::default()
    }

    pub fn is_on(&self) -> bool {
        self.on.load(Ordering::Relaxed)
    }

    pub fn transitions(&self) -> u32 {
        self.transitions.load(Ordering::Relaxed)
    }

    pub fn handles(&self) -> (Arc<AtomicBool>, Arc<AtomicU32>) {
        (Arc::clone(&self.on), Arc::clone(&self.transitions))
    }
}

impl Led for MockLed {
    fn set(&mut self, on: bool) {
        if self.on.swap(on, Ordering::Relaxed) != on {
            self.transitions.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[derive(Default)]
pub struct MockCpu {
    jumped: Arc<Mutex<Option<(u32, u32, u32)>>>,
    irq_disabled: Arc<AtomicBool>,
}

impl MockCpu {
    pub fn new() -> MockCpu {
        MockCpu::default()
    }

    pub fn jump_target(&self) -> Option<(u32, u32, u32)> {
        *self.jumped.lock().unwrap()
    }

    pub fn irq_disabled(&self) -> bool {
        self.irq_disabled.load(Ordering::Relaxed)
    }

    pub fn handle(&self) -> Arc<Mutex<Option<(u32, u32, u32)>>> {
        Arc::clone(&self.jumped)
    }
}

impl CpuControl for MockCpu {
    fn disable_interrupts(&mut self) {
        self.irq_disabled.store(true, Ordering::Relaxed);
    }

    fn jump_to_application(&mut self, vector_base: u32, sp: u32, pc: u32) {
        *self.jumped.lock().unwrap() = Some((vector_base, sp, pc));
    }
}

#[derive(Default)]
pub struct MockPower {
    bus_hz: Arc<AtomicU32>,
}

impl MockPower {
    pub fn new() -> MockPower {
        MockPower::default()
    }

    pub fn configured_hz(&self) -> u32 {
        self.bus_hz.load(Ordering::Relaxed)
    }

    pub fn handle(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.bus_hz)
    }
}

impl PowerClock for MockPower {
    fn configure(&mut self, bus_hz: u32) {
        self.bus_hz.store(bus_hz, Ordering::Relaxed);
    }
}
