// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! OTA update engine.
//!
//! The controller streams a signed-off application image in bounded
//! chunks; the node assembles it in a staging buffer, proves the CRC on
//! demand, and only then erases and programs the application partition,
//! verifying every byte by read-back. The session is strictly sequential:
//! chunk N is only accepted immediately after chunk N-1, which keeps the
//! engine a straight line with no reassembly bookkeeping.
//!
//! Once a session errors it ignores further chunks; the controller must
//! leave update mode (or reboot the node) to start over. Errors travel to
//! the controller as `UPDATE_ERROR` frames carrying an
//! [`UpdateError`] code.

use ringbuf::{ringbuf, ringbuf_entry};
use z1_abi::opcode::update;
use z1_abi::{
    AppHeader, Frame, UpdateError, APP_HEADER_SIZE, CRC32, MIN_APP_BINARY_SIZE,
};
use z1_hal::{FlashDevice, Watchdog};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u16)]
pub enum SessionState {
    Idle = 0,
    Receiving = 1,
    Validating = 2,
    Programming = 3,
    Complete = 4,
    Error = 5,
}

#[derive(Copy, Clone, PartialEq)]
enum Trace {
    None,
    Enter,
    Start { total: u32 },
    Chunk { num: u16 },
    ChunkError(UpdateError),
    Verify(u32),
    CommitOk,
    CommitError(UpdateError),
    Exit { reboot: bool },
}

ringbuf!(Trace, 32, Trace::None);

/// Transient per-update state. Created at `UPDATE_MODE_ENTER`, destroyed at
/// `UPDATE_MODE_EXIT` or reboot. The staging buffer is borrowed from the
/// caller -- on hardware it is a dedicated RAM region, in tests a vector.
pub struct UpdateSession<'b> {
    staging: &'b mut [u8],
    bytes_received: usize,
    next_chunk: u16,
    state: SessionState,
    last_error: UpdateError,
}

impl<'b> UpdateSession<'b> {
    pub fn new(staging: &'b mut [u8]) -> Self {
        UpdateSession {
            staging,
            bytes_received: 0,
            next_chunk: 0,
            state: SessionState::Idle,
            last_error: UpdateError::None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn last_error(&self) -> UpdateError {
        self.last_error
    }

    pub fn bytes_received(&self) -> usize {
        self.bytes_received
    }

    /// Staging capacity in KiB, reported in `UPDATE_READY`.
    pub fn capacity_kib(&self) -> u16 {
        (self.staging.len() / 1024) as u16
    }

    /// `UPDATE_MODE_ENTER`: reset to a fresh receiving session.
    pub fn enter(&mut self) {
        self.bytes_received = 0;
        self.next_chunk = 0;
        self.state = SessionState::Receiving;
        self.last_error = UpdateError::None;
        ringbuf_entry!(Trace::Enter);
    }

    /// `UPDATE_START`: restart the transfer with a declared total size, so
    /// a controller can begin again without bouncing update mode.
    pub fn start(&mut self, total_size: u32) -> Result<(), UpdateError> {
        if total_size as usize > self.staging.len() {
            return self.fail(UpdateError::InvalidSize);
        }
        self.bytes_received = 0;
        self.next_chunk = 0;
        self.state = SessionState::Receiving;
        self.last_error = UpdateError::None;
        ringbuf_entry!(Trace::Start { total: total_size });
        Ok(())
    }

    /// `UPDATE_DATA_CHUNK`: append one chunk. Chunks are append-only and
    /// must arrive strictly in sequence.
    pub fn chunk(
        &mut self,
        chunk_num: u16,
        data: &[u8],
    ) -> Result<(), UpdateError> {
        match self.state {
            SessionState::Receiving => {}
            SessionState::Error => return Err(self.last_error),
            // A chunk outside update mode is a sequencing violation.
            _ => return self.fail(UpdateError::ChunkSequence),
        }
        if data.is_empty() || data.len() > update::MAX_CHUNK_BYTES {
            return self.fail(UpdateError::InvalidSize);
        }
        if chunk_num != self.next_chunk {
            return self.fail(UpdateError::ChunkSequence);
        }
        if self.bytes_received + data.len() > self.staging.len() {
            return self.fail(UpdateError::InvalidSize);
        }

        self.staging[self.bytes_received..self.bytes_received + data.len()]
            .copy_from_slice(data);
        self.bytes_received += data.len();
        self.next_chunk += 1;
        ringbuf_entry!(Trace::Chunk { num: chunk_num });
        Ok(())
    }

    /// CRC32 over everything staged so far; the `UPDATE_POLL(VERIFY)`
    /// answer. The controller compares this against its own checksum of
    /// the image file before daring to commit.
    pub fn verify_crc(&self) -> u32 {
        let crc = CRC32.checksum(&self.staging[..self.bytes_received]);
        ringbuf_entry!(Trace::Verify(crc));
        crc
    }

    /// `UPDATE_COMMIT`: validate the staged image, then erase, program and
    /// read-back-verify the application partition.
    ///
    /// Every validation failure happens *before* the erase, so a bad image
    /// never costs the node its working application. Committing the same
    /// staged image twice yields byte-identical flash.
    pub fn commit<F: FlashDevice>(
        &mut self,
        flash: &mut F,
    ) -> Result<(), UpdateError> {
        if self.state == SessionState::Error {
            return Err(self.last_error);
        }

        self.state = SessionState::Validating;

        if self.bytes_received
            < APP_HEADER_SIZE + MIN_APP_BINARY_SIZE as usize
        {
            return self.fail_commit(UpdateError::InvalidSize);
        }

        let header = match AppHeader::read_from_prefix(self.staging) {
            Some(h) => h,
            None => return self.fail_commit(UpdateError::InvalidSize),
        };
        if let Err(e) = header.validate() {
            return self.fail_commit(e);
        }

        let image_size = header.image_size() as usize;
        if image_size > flash.partition_size() {
            return self.fail_commit(UpdateError::InvalidSize);
        }
        if self.bytes_received < image_size {
            return self.fail_commit(UpdateError::InvalidSize);
        }

        let binary =
            &self.staging[APP_HEADER_SIZE..image_size];
        if CRC32.checksum(binary) != header.binary_crc32 {
            return self.fail_commit(UpdateError::CrcMismatch);
        }

        // The staged image is good. Point of no return for the old
        // application.
        self.state = SessionState::Programming;
        if flash.erase_partition().is_err() {
            return self.fail_commit(UpdateError::FlashError);
        }

        let page = flash.page_size();
        let mut offset = 0;
        while offset < image_size {
            let n = page.min(image_size - offset);
            if flash
                .program_page(offset, &self.staging[offset..offset + n])
                .is_err()
            {
                return self.fail_commit(UpdateError::FlashError);
            }
            offset += n;
        }

        // Verify by reading back through the mapped window.
        let mut buf = [0u8; 256];
        let mut offset = 0;
        while offset < image_size {
            let n = buf.len().min(image_size - offset);
            if flash.read(offset, &mut buf[..n]).is_err() {
                return self.fail_commit(UpdateError::FlashError);
            }
            if buf[..n] != self.staging[offset..offset + n] {
                return self.fail_commit(UpdateError::FlashError);
            }
            offset += n;
        }

        self.state = SessionState::Complete;
        ringbuf_entry!(Trace::CommitOk);
        Ok(())
    }

    /// `UPDATE_MODE_EXIT`: true when the caller should reboot into the
    /// freshly programmed application.
    pub fn exit(&mut self) -> bool {
        let reboot = self.state == SessionState::Complete;
        ringbuf_entry!(Trace::Exit { reboot });
        if !reboot {
            self.state = SessionState::Idle;
            self.bytes_received = 0;
            self.next_chunk = 0;
        }
        reboot
    }

    /// Kills the session with `e`; chunks are ignored until
    /// `UPDATE_MODE_EXIT`.
    pub fn abort(&mut self, e: UpdateError) {
        self.state = SessionState::Error;
        self.last_error = e;
    }

    fn fail(&mut self, e: UpdateError) -> Result<(), UpdateError> {
        self.state = SessionState::Error;
        self.last_error = e;
        ringbuf_entry!(Trace::ChunkError(e));
        Err(e)
    }

    fn fail_commit(&mut self, e: UpdateError) -> Result<(), UpdateError> {
        self.state = SessionState::Error;
        self.last_error = e;
        ringbuf_entry!(Trace::CommitError(e));
        Err(e)
    }
}

/// A reply frame payload, at most four words.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Reply {
    words: [u16; 4],
    len: usize,
}

impl Reply {
    fn one(a: u16) -> Reply {
        Reply {
            words: [a, 0, 0, 0],
            len: 1,
        }
    }

    fn two(a: u16, b: u16) -> Reply {
        Reply {
            words: [a, b, 0, 0],
            len: 2,
        }
    }

    fn three(a: u16, b: u16, c: u16) -> Reply {
        Reply {
            words: [a, b, c, 0],
            len: 3,
        }
    }

    pub fn words(&self) -> &[u16] {
        &self.words[..self.len]
    }
}

fn error_reply(e: UpdateError) -> Reply {
    Reply::two(update::ERROR, e as u16)
}

/// Dispatches one OTA CTRL frame against the session, returning the reply
/// to send back to the frame's source (on the update stream), if any.
///
/// `watchdog` is armed when a commit lands or a completed session exits;
/// the reset it triggers preserves the node-ID scratch.
pub fn handle_update_frame<F, W>(
    session: &mut UpdateSession<'_>,
    flash: &mut F,
    watchdog: &mut W,
    frame: &Frame,
) -> Option<Reply>
where
    F: FlashDevice,
    W: Watchdog,
{
    let payload = frame.payload();
    let op = *payload.first()?;

    match op {
        update::MODE_ENTER => {
            session.enter();
            Some(Reply::two(update::READY, session.capacity_kib()))
        }
        update::START => {
            let lo = u32::from(*payload.get(1)?);
            let hi = u32::from(*payload.get(2)?);
            match session.start(hi << 16 | lo) {
                Ok(()) => {
                    Some(Reply::two(update::READY, session.capacity_kib()))
                }
                Err(e) => Some(error_reply(e)),
            }
        }
        update::DATA_CHUNK => {
            // A dead session stays silent until MODE_EXIT; re-ACKing or
            // re-erroring every chunk of a large transfer would just fight
            // the controller's abort path for the bus.
            if session.state() == SessionState::Error {
                return None;
            }
            let chunk_num = *payload.get(1)?;
            let data_size = usize::from(*payload.get(2)?);
            let Some(words) = payload.get(3..3 + data_size.div_ceil(2))
            else {
                // The frame does not carry as much data as it claims.
                session.abort(UpdateError::InvalidSize);
                return Some(error_reply(UpdateError::InvalidSize));
            };

            let mut data = [0u8; 2 * z1_abi::MAX_PAYLOAD_WORDS];
            for (i, b) in data[..data_size].iter_mut().enumerate() {
                let w = words[i / 2];
                *b = if i % 2 == 0 { w as u8 } else { (w >> 8) as u8 };
            }

            match session.chunk(chunk_num, &data[..data_size]) {
                Ok(()) => Some(Reply::two(update::ACK_CHUNK, chunk_num)),
                Err(e) => Some(error_reply(e)),
            }
        }
        update::POLL => match *payload.get(1)? {
            update::POLL_VERIFY => {
                let crc = session.verify_crc();
                Some(Reply::three(
                    update::VERIFY_RESP,
                    crc as u16,
                    (crc >> 16) as u16,
                ))
            }
            update::POLL_STATUS => Some(Reply::three(
                update::VERIFY_RESP,
                session.state() as u16,
                session.last_error() as u16,
            )),
            _ => None,
        },
        update::COMMIT => match session.commit(flash) {
            Ok(()) => {
                watchdog.schedule_reboot();
                Some(Reply::one(update::COMMIT_RESP))
            }
            Err(e) => Some(error_reply(e)),
        },
        update::MODE_EXIT => {
            if session.exit() {
                watchdog.schedule_reboot();
            }
            None
        }
        _ => None,
    }
}
