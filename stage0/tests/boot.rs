// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bootloader flow: validation, countdown, handoff, and safe mode over a
//! live (simulated) backplane.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use drv_z1_bus_core::BusContext;
use drv_z1_mock_backplane::{
    Backplane, MockCarrier, MockClock, MockCpu, MockFlash, MockLed, MockRx,
    MockTx, MockWatchdog,
};
use z1_hal::Monotonic;
use z1_abi::opcode::{mgmt, stream, update as op};
use z1_abi::{
    AppHeader, FrameType, UpdateError, APP_ENTRY_OFFSET, APP_HEADER_SIZE,
    APP_MAGIC, APP_PARTITION_BASE, CONTROLLER_ID, CRC32,
};
use z1_broker::BootBroker;
use z1_stage0::{
    boot, validate_application, BootDecision, SafeMode, BOOT_VERSION_MAJOR,
    BOOT_VERSION_MINOR,
};

type Bus = BusContext<MockTx, MockRx, MockCarrier, MockClock>;
type Broker = BootBroker<MockTx, MockRx, MockCarrier, MockClock>;

fn bus(bp: &Arc<Backplane>, id: u8) -> Bus {
    let io = bp.attach();
    BusContext::new(id, io.tx, io.rx, io.carrier, bp.clock())
}

/// Image whose binary opens with a recognizable SP/PC pair.
fn make_image(binary_len: usize) -> Vec<u8> {
    assert!(binary_len >= 8);
    let mut binary: Vec<u8> =
        (0..binary_len).map(|i| (i * 13 + 5) as u8).collect();
    binary[..4].copy_from_slice(&0x2004_0000u32.to_le_bytes()); // SP
    binary[4..8].copy_from_slice(&0x0008_1234u32.to_le_bytes()); // PC

    let header = AppHeader {
        magic: APP_MAGIC,
        version_major: 2,
        version_minor: 1,
        version_patch: 0,
        flags: 0,
        binary_size: binary_len as u32,
        binary_crc32: CRC32.checksum(&binary),
        entry_offset: APP_ENTRY_OFFSET,
        name: [0; 32],
        description: [0; 64],
        reserved: [0; 64],
    };

    let mut image = header.to_bytes().to_vec();
    image.extend_from_slice(&binary);
    image
}

fn program(flash: &mut MockFlash, image: &[u8]) {
    use z1_hal::FlashDevice;
    for (i, page) in image.chunks(flash.page_size()).enumerate() {
        flash.program_page(i * 4096, page).unwrap();
    }
}

#[test]
fn validation_accepts_a_good_image() {
    let mut flash = MockFlash::new(64 * 1024, 4096);
    program(&mut flash, &make_image(4096));
    let header = validate_application(&flash).unwrap();
    assert_eq!(header.binary_size, 4096);
}

#[test]
fn validation_rejects_erased_flash() {
    let flash = MockFlash::new(64 * 1024, 4096);
    assert_eq!(
        validate_application(&flash),
        Err(UpdateError::InvalidMagic)
    );
}

#[test]
fn validation_rejects_corrupted_binary() {
    let mut flash = MockFlash::new(64 * 1024, 4096);
    let mut image = make_image(4096);
    image[APP_HEADER_SIZE + 9] ^= 0x40;
    program(&mut flash, &image);
    assert_eq!(
        validate_application(&flash),
        Err(UpdateError::CrcMismatch)
    );
}

#[test]
fn countdown_expires_into_the_application() {
    let bp = Backplane::new();
    let mut broker = Broker::new(bus(&bp, 3));
    let mut flash = MockFlash::new(64 * 1024, 4096);
    program(&mut flash, &make_image(4096));
    let mut cpu = MockCpu::new();
    let mut led = MockLed::new();

    let t0 = bp.clock().now_us();
    let decision = boot(&mut broker, &flash, &mut cpu, &mut led);
    assert_eq!(decision, BootDecision::Jumped);
    assert!(bp.clock().now_us() - t0 >= 5_000_000, "full countdown ran");

    assert!(cpu.irq_disabled());
    let (vector, sp, pc) = cpu.jump_target().expect("handoff happened");
    assert_eq!(vector, APP_PARTITION_BASE + APP_HEADER_SIZE as u32);
    assert_eq!(sp, 0x2004_0000);
    assert_eq!(pc, 0x0008_1234);
    assert!(led.transitions() > 10, "countdown heartbeat blinked");
}

#[test]
fn boot_now_short_circuits_the_countdown() {
    let bp = Backplane::new();
    let mut ctrl = bus(&bp, CONTROLLER_ID);
    let mut broker = Broker::new(bus(&bp, 3));
    let mut flash = MockFlash::new(64 * 1024, 4096);
    program(&mut flash, &make_image(4096));
    let mut cpu = MockCpu::new();
    let mut led = MockLed::new();

    ctrl.send_frame(FrameType::Ctrl, 3, stream::MGMT, true, &[mgmt::BOOT_NOW])
        .unwrap();

    let t0 = bp.clock().now_us();
    let decision = boot(&mut broker, &flash, &mut cpu, &mut led);
    assert_eq!(decision, BootDecision::Jumped);
    assert!(
        bp.clock().now_us() - t0 < 1_000_000,
        "BOOT_NOW should not wait out the countdown"
    );
}

#[test]
fn ota_command_during_countdown_enters_safe_mode() {
    let bp = Backplane::new();
    let mut ctrl = bus(&bp, CONTROLLER_ID);
    let mut broker = Broker::new(bus(&bp, 3));
    let mut flash = MockFlash::new(64 * 1024, 4096);
    program(&mut flash, &make_image(4096));
    let mut cpu = MockCpu::new();
    let mut led = MockLed::new();

    ctrl.send_frame(
        FrameType::Ctrl,
        3,
        stream::UPDATE,
        true,
        &[op::MODE_ENTER],
    )
    .unwrap();

    let decision = boot(&mut broker, &flash, &mut cpu, &mut led);
    assert_eq!(decision, BootDecision::SafeMode);
    assert!(cpu.jump_target().is_none());
}

#[test]
fn invalid_image_skips_straight_to_safe_mode() {
    let bp = Backplane::new();
    let mut broker = Broker::new(bus(&bp, 3));
    let flash = MockFlash::new(64 * 1024, 4096);
    let mut cpu = MockCpu::new();
    let mut led = MockLed::new();

    let t0 = bp.clock().now_us();
    let decision = boot(&mut broker, &flash, &mut cpu, &mut led);
    assert_eq!(decision, BootDecision::SafeMode);
    assert!(bp.clock().now_us() - t0 < 1_000_000, "no countdown");
}

// --- safe mode over the wire ---

struct SafeNode {
    broker: Broker,
    flash: MockFlash,
    watchdog: MockWatchdog,
    led: MockLed,
}

impl SafeNode {
    fn new(bp: &Arc<Backplane>, id: u8) -> SafeNode {
        SafeNode {
            broker: Broker::new(bus(bp, id)),
            flash: MockFlash::new(64 * 1024, 4096),
            watchdog: MockWatchdog::new(),
            led: MockLed::new(),
        }
    }

    fn step(&mut self, safe: &mut SafeMode<'_>) {
        safe.step(
            &mut self.broker,
            &mut self.flash,
            &mut self.watchdog,
            &mut self.led,
        );
    }
}

/// Sends one CTRL frame and runs the node until the expected reply opcode
/// comes back.
fn transact(
    ctrl: &mut Bus,
    node: &mut SafeNode,
    safe: &mut SafeMode<'_>,
    payload: &[u16],
    want_stream: u8,
    want_op: u16,
) -> Vec<u16> {
    ctrl.send_frame(FrameType::Ctrl, 3, want_stream, true, payload)
        .unwrap();
    for _ in 0..8 {
        node.step(safe);
        if let Some(f) = ctrl.try_receive_frame() {
            assert!(f.crc_valid);
            assert_eq!(f.header.src, 3);
            assert_eq!(f.payload()[0], want_op);
            return f.payload().to_vec();
        }
    }
    panic!("no {want_op:#x} reply arrived");
}

#[test]
fn safe_mode_answers_management_opcodes() {
    let bp = Backplane::new();
    let mut ctrl = bus(&bp, CONTROLLER_ID);
    let mut node = SafeNode::new(&bp, 3);
    let mut staging = vec![0u8; 40 * 1024];
    let mut safe = SafeMode::new(&mut staging);

    let pong = transact(
        &mut ctrl,
        &mut node,
        &mut safe,
        &[mgmt::PING],
        stream::MGMT,
        mgmt::PONG,
    );
    assert_eq!(pong, vec![mgmt::PONG]);

    let status = transact(
        &mut ctrl,
        &mut node,
        &mut safe,
        &[mgmt::READ_STATUS],
        stream::MGMT,
        mgmt::STATUS_RESPONSE,
    );
    // [STATUS_RESPONSE, mode, update_state, last_error, fw_major, fw_minor]
    assert_eq!(status.len(), 6);
    assert_eq!(status[1], 1, "safe-mode flag");
    assert_eq!(status[4], BOOT_VERSION_MAJOR);
    assert_eq!(status[5], BOOT_VERSION_MINOR);

    // SET_LED overrides the blinker.
    ctrl.send_frame(
        FrameType::Ctrl,
        3,
        stream::MGMT,
        true,
        &[mgmt::SET_LED, 1],
    )
    .unwrap();
    node.step(&mut safe);
    assert!(node.led.is_on());
}

#[test]
fn safe_mode_blinks_at_one_hertz() {
    let bp = Backplane::new();
    let mut node = SafeNode::new(&bp, 3);
    let mut staging = vec![0u8; 4096];
    let mut safe = SafeMode::new(&mut staging);

    // Three simulated seconds of stepping.
    for _ in 0..30 {
        node.step(&mut safe);
        bp.advance_us(100_000);
    }
    // 1 Hz blink toggles twice a second: roughly six transitions, counting
    // edge effects loosely.
    let t = node.led.transitions();
    assert!((4..=8).contains(&t), "blink transitions: {t}");
}

#[test]
fn full_ota_over_the_wire() {
    let bp = Backplane::new();
    let mut ctrl = bus(&bp, CONTROLLER_ID);
    let mut node = SafeNode::new(&bp, 3);
    let mut staging = vec![0u8; 40 * 1024];
    let mut safe = SafeMode::new(&mut staging);

    let image = make_image(30_720 - APP_HEADER_SIZE);
    let fired = node.watchdog.fired_handle();

    // Enter update mode.
    let ready = transact(
        &mut ctrl,
        &mut node,
        &mut safe,
        &[op::MODE_ENTER],
        stream::UPDATE,
        op::READY,
    );
    assert_eq!(ready, vec![op::READY, 40]);

    // Stream 120 chunks of 256 bytes, each ACKed with its number.
    for (i, data) in image.chunks(256).enumerate() {
        let mut payload = vec![op::DATA_CHUNK, i as u16, data.len() as u16];
        for pair in data.chunks(2) {
            let lo = pair[0] as u16;
            let hi = pair.get(1).map(|&b| (b as u16) << 8).unwrap_or(0);
            payload.push(hi | lo);
        }
        let ack = transact(
            &mut ctrl,
            &mut node,
            &mut safe,
            &payload,
            stream::UPDATE,
            op::ACK_CHUNK,
        );
        assert_eq!(ack, vec![op::ACK_CHUNK, i as u16]);
    }

    // Verify.
    let crc = CRC32.checksum(&image);
    let verify = transact(
        &mut ctrl,
        &mut node,
        &mut safe,
        &[op::POLL, op::POLL_VERIFY],
        stream::UPDATE,
        op::VERIFY_RESP,
    );
    assert_eq!(verify, vec![op::VERIFY_RESP, crc as u16, (crc >> 16) as u16]);

    // Commit: flash takes the image, the reboot is armed.
    let commit = transact(
        &mut ctrl,
        &mut node,
        &mut safe,
        &[op::COMMIT],
        stream::UPDATE,
        op::COMMIT_RESP,
    );
    assert_eq!(commit, vec![op::COMMIT_RESP]);
    assert_eq!(&node.flash.snapshot()[..image.len()], &image[..]);
    assert!(safe.update_complete());
    assert!(fired.load(Ordering::Relaxed));

    // And the new image validates the way the next boot will see it.
    assert!(validate_application(&node.flash).is_ok());
}

#[test]
fn wire_ota_crc_failure_reports_code_two() {
    let bp = Backplane::new();
    let mut ctrl = bus(&bp, CONTROLLER_ID);
    let mut node = SafeNode::new(&bp, 3);
    let mut staging = vec![0u8; 40 * 1024];
    let mut safe = SafeMode::new(&mut staging);

    let mut image = make_image(2048);
    image[APP_HEADER_SIZE + 33] ^= 0x10;

    transact(
        &mut ctrl,
        &mut node,
        &mut safe,
        &[op::MODE_ENTER],
        stream::UPDATE,
        op::READY,
    );
    for (i, data) in image.chunks(256).enumerate() {
        let mut payload = vec![op::DATA_CHUNK, i as u16, data.len() as u16];
        for pair in data.chunks(2) {
            let lo = pair[0] as u16;
            let hi = pair.get(1).map(|&b| (b as u16) << 8).unwrap_or(0);
            payload.push(hi | lo);
        }
        transact(
            &mut ctrl,
            &mut node,
            &mut safe,
            &payload,
            stream::UPDATE,
            op::ACK_CHUNK,
        );
    }

    let err = transact(
        &mut ctrl,
        &mut node,
        &mut safe,
        &[op::COMMIT],
        stream::UPDATE,
        op::ERROR,
    );
    assert_eq!(err, vec![op::ERROR, 2], "CRC_MISMATCH is code 2");
    assert!(node.flash.snapshot().iter().all(|&b| b == 0xFF));
}
