// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Boot countdown, application handoff, and safe mode.
//!
//! After bring-up the bootloader validates the application image. A valid
//! image buys a five second countdown during which the node keeps
//! servicing the bus: a `BOOT_NOW` command short-circuits straight into
//! the application, while any OTA command parks the node in safe mode
//! instead. An invalid image skips the countdown and goes directly to
//! safe mode.
//!
//! Safe mode serves the management opcodes and the full OTA protocol,
//! blinks the red LED at 1 Hz, and otherwise waits to be updated or told
//! to reboot.

use z1_abi::opcode::{self, mgmt, stream};
use z1_abi::{Frame, FrameType, UpdateError};
use z1_broker::BootBroker;
use z1_hal::{
    CarrierSense, CpuControl, FlashDevice, Led, Monotonic, RxDma, TxEngine,
    Watchdog,
};

use crate::image::{entry_vectors, validate_application};
use crate::update::{handle_update_frame, SessionState, UpdateSession};
use crate::{BOOT_VERSION_MAJOR, BOOT_VERSION_MINOR};

pub const BOOT_COUNTDOWN_MS: u32 = 5_000;

/// Countdown service period. Well inside the 100 Hz bus-servicing floor.
pub const COUNTDOWN_TICK_US: u32 = 1_000;

/// 1 Hz blink: toggle every half period.
pub const SAFE_BLINK_HALF_PERIOD_MS: u32 = 500;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CountdownOutcome {
    /// Countdown expired or `BOOT_NOW` arrived; jump to the application.
    Boot,
    /// An OTA command arrived mid-countdown.
    EnterSafeMode,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BootDecision {
    /// The handoff was performed (on hardware, this never comes back).
    Jumped,
    /// The node is staying in the bootloader; run the safe-mode loop.
    SafeMode,
}

/// Services the bus for up to five seconds, watching for a reason to stop
/// waiting. The LED heartbeats at 2 Hz so a rack full of counting-down
/// nodes is visibly alive.
pub fn run_countdown<TX, RX, CS, M, L>(
    broker: &mut BootBroker<TX, RX, CS, M>,
    led: &mut L,
) -> CountdownOutcome
where
    TX: TxEngine,
    RX: RxDma,
    CS: CarrierSense,
    M: Monotonic,
    L: Led,
{
    let start_ms = broker.bus().timer().now_ms();
    let mut led_on = false;
    let mut last_toggle_ms = start_ms;

    loop {
        let now_ms = broker.bus().timer().now_ms();
        if now_ms.wrapping_sub(start_ms) >= BOOT_COUNTDOWN_MS {
            return CountdownOutcome::Boot;
        }
        if now_ms.wrapping_sub(last_toggle_ms) >= 250 {
            led_on = !led_on;
            led.set(led_on);
            last_toggle_ms = now_ms;
        }

        if let Some(frame) = broker.try_receive() {
            if let Some(outcome) = countdown_frame(&frame) {
                return outcome;
            }
        }
        broker.task();

        broker.bus().timer().delay_us(COUNTDOWN_TICK_US);
    }
}

fn countdown_frame(frame: &Frame) -> Option<CountdownOutcome> {
    if !frame.crc_valid || frame.header.frame_type != FrameType::Ctrl {
        return None;
    }
    let op = *frame.payload().first()?;
    if frame.header.stream == stream::MGMT && op == mgmt::BOOT_NOW {
        return Some(CountdownOutcome::Boot);
    }
    if frame.header.stream == stream::UPDATE && opcode::is_update_opcode(op) {
        return Some(CountdownOutcome::EnterSafeMode);
    }
    None
}

/// Validate-then-jump, the whole bootloader decision in one call.
pub fn boot<TX, RX, CS, M, L, F, CPU>(
    broker: &mut BootBroker<TX, RX, CS, M>,
    flash: &F,
    cpu: &mut CPU,
    led: &mut L,
) -> BootDecision
where
    TX: TxEngine,
    RX: RxDma,
    CS: CarrierSense,
    M: Monotonic,
    L: Led,
    F: FlashDevice,
    CPU: CpuControl,
{
    if validate_application(flash).is_err() {
        // Not an error: an unvalidated application is simply not bootable,
        // and the quiet OTA-ready state is how it gets fixed.
        return BootDecision::SafeMode;
    }

    match run_countdown(broker, led) {
        CountdownOutcome::EnterSafeMode => BootDecision::SafeMode,
        CountdownOutcome::Boot => match jump(flash, cpu) {
            Ok(()) => BootDecision::Jumped,
            Err(_) => BootDecision::SafeMode,
        },
    }
}

/// The handoff itself: interrupts off, vector table onto the application
/// image, initial SP/PC from its vector table, branch.
pub fn jump<F: FlashDevice, CPU: CpuControl>(
    flash: &F,
    cpu: &mut CPU,
) -> Result<(), UpdateError> {
    let (sp, pc) = entry_vectors(flash)?;
    cpu.disable_interrupts();
    cpu.jump_to_application(
        z1_abi::APP_PARTITION_BASE + z1_abi::APP_HEADER_SIZE as u32,
        sp,
        pc,
    );
    Ok(())
}

/// Safe-mode runtime state. The caller owns the loop and its pacing; each
/// [`SafeMode::step`] services one frame, the broker, and the blinker.
pub struct SafeMode<'b> {
    session: UpdateSession<'b>,
    led_on: bool,
    last_toggle_ms: u32,
}

impl<'b> SafeMode<'b> {
    pub fn new(staging: &'b mut [u8]) -> Self {
        SafeMode {
            session: UpdateSession::new(staging),
            led_on: false,
            last_toggle_ms: 0,
        }
    }

    pub fn session(&self) -> &UpdateSession<'b> {
        &self.session
    }

    /// True once an update has been committed and the node is waiting for
    /// the watchdog to take it down.
    pub fn update_complete(&self) -> bool {
        self.session.state() == SessionState::Complete
    }

    pub fn step<TX, RX, CS, M, L, F, W>(
        &mut self,
        broker: &mut BootBroker<TX, RX, CS, M>,
        flash: &mut F,
        watchdog: &mut W,
        led: &mut L,
    ) where
        TX: TxEngine,
        RX: RxDma,
        CS: CarrierSense,
        M: Monotonic,
        L: Led,
        F: FlashDevice,
        W: Watchdog,
    {
        let now_ms = broker.bus().timer().now_ms();
        if now_ms.wrapping_sub(self.last_toggle_ms)
            >= SAFE_BLINK_HALF_PERIOD_MS
        {
            self.led_on = !self.led_on;
            led.set(self.led_on);
            self.last_toggle_ms = now_ms;
        }

        if let Some(frame) = broker.try_receive() {
            self.handle(broker, flash, watchdog, led, &frame);
        }
        broker.task();
    }

    fn handle<TX, RX, CS, M, L, F, W>(
        &mut self,
        broker: &mut BootBroker<TX, RX, CS, M>,
        flash: &mut F,
        watchdog: &mut W,
        led: &mut L,
        frame: &Frame,
    ) where
        TX: TxEngine,
        RX: RxDma,
        CS: CarrierSense,
        M: Monotonic,
        L: Led,
        F: FlashDevice,
        W: Watchdog,
    {
        if !frame.crc_valid || frame.header.frame_type != FrameType::Ctrl {
            return;
        }
        let Some(&op) = frame.payload().first() else {
            return;
        };
        let src = frame.header.src;

        match frame.header.stream {
            stream::MGMT => match op {
                mgmt::PING => {
                    broker.send_command(&[mgmt::PONG], src, stream::MGMT);
                }
                mgmt::READ_STATUS => {
                    let reply = [
                        mgmt::STATUS_RESPONSE,
                        1, // bootloader / safe mode
                        self.session.state() as u16,
                        self.session.last_error() as u16,
                        BOOT_VERSION_MAJOR,
                        BOOT_VERSION_MINOR,
                    ];
                    broker.send_command(&reply, src, stream::MGMT);
                }
                mgmt::SET_LED => {
                    // Blink-identify override from the controller.
                    let on = frame.payload().get(1).copied().unwrap_or(0);
                    led.set(on != 0);
                }
                _ => {}
            },
            stream::UPDATE => {
                if let Some(reply) =
                    handle_update_frame(&mut self.session, flash, watchdog, frame)
                {
                    broker.send_command(reply.words(), src, stream::UPDATE);
                }
            }
            _ => {}
        }
    }
}
