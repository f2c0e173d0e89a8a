// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Application image validation.
//!
//! The bootloader refuses to jump into flash it cannot vouch for. The
//! checks run in cost order: header structure first, then a full CRC32
//! pass over the binary. Every access is bounds-checked against the
//! partition before it happens.

use z1_abi::{AppHeader, UpdateError, APP_HEADER_SIZE, CRC32};
use z1_hal::FlashDevice;

/// Reads and fully validates the application image: header magic, size
/// bounds, entry offset, and the CRC32 of the binary.
///
/// A failure here is not an error condition for the caller -- it is the
/// trigger for safe mode.
pub fn validate_application<F: FlashDevice>(
    flash: &F,
) -> Result<AppHeader, UpdateError> {
    let mut header_bytes = [0u8; APP_HEADER_SIZE];
    flash
        .read(0, &mut header_bytes)
        .map_err(|_| UpdateError::FlashError)?;

    let header = AppHeader::read_from_prefix(&header_bytes)
        .ok_or(UpdateError::InvalidSize)?;
    header.validate()?;

    let image_size = header.image_size() as usize;
    if image_size > flash.partition_size() {
        return Err(UpdateError::InvalidSize);
    }

    // CRC the binary in place, in small chunks; the bootloader has no
    // business buffering megabytes.
    let mut digest = CRC32.digest();
    let mut buf = [0u8; 256];
    let mut offset = APP_HEADER_SIZE;
    while offset < image_size {
        let n = buf.len().min(image_size - offset);
        flash
            .read(offset, &mut buf[..n])
            .map_err(|_| UpdateError::FlashError)?;
        digest.update(&buf[..n]);
        offset += n;
    }

    if digest.finalize() != header.binary_crc32 {
        return Err(UpdateError::CrcMismatch);
    }
    Ok(header)
}

/// Reads the application's initial stack pointer and reset vector from the
/// front of its vector table (the first two words of the binary).
pub fn entry_vectors<F: FlashDevice>(
    flash: &F,
) -> Result<(u32, u32), UpdateError> {
    let mut words = [0u8; 8];
    flash
        .read(APP_HEADER_SIZE, &mut words)
        .map_err(|_| UpdateError::FlashError)?;
    let sp = u32::from_le_bytes([words[0], words[1], words[2], words[3]]);
    let pc = u32::from_le_bytes([words[4], words[5], words[6], words[7]]);
    Ok((sp, pc))
}
