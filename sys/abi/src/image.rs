// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Application image (`.z1app`) header and flash partition layout.

use static_assertions::const_assert_eq;
use zerocopy::{FromBytes, IntoBytes};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::UpdateError;

/// `Z1AP` in ASCII, little-endian.
pub const APP_MAGIC: u32 = 0x5A31_4150;

/// The header occupies the first 192 bytes of the application partition;
/// the binary (starting with its vector table) follows at this offset.
pub const APP_HEADER_SIZE: usize = 192;
pub const APP_ENTRY_OFFSET: u32 = 0xC0;

/// Flash split: bootloader from 0, application partition above it.
pub const APP_PARTITION_BASE: u32 = 0x0008_0000;
pub const APP_PARTITION_SIZE: u32 = 7680 * 1024;

/// A commit below header + this many binary bytes is rejected outright.
pub const MIN_APP_BINARY_SIZE: u32 = 256;

const_assert_eq!(APP_ENTRY_OFFSET as usize, APP_HEADER_SIZE);

/// Fixed header at the start of every application image.
///
/// Read straight out of staging RAM and flash; every field is a plain
/// little-endian integer or byte array, so any 192 bytes parse (validation
/// is a separate step).
#[derive(Clone, Debug, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct AppHeader {
    /// Must equal [`APP_MAGIC`].
    pub magic: u32,
    pub version_major: u32,
    pub version_minor: u32,
    pub version_patch: u32,
    pub flags: u32,
    /// Size of the binary in bytes, excluding this header.
    pub binary_size: u32,
    /// CRC32 over the binary (not the header).
    pub binary_crc32: u32,
    /// Offset of the vector table from the start of the image. Required to
    /// equal [`APP_ENTRY_OFFSET`].
    pub entry_offset: u32,
    /// Null-terminated image name.
    pub name: [u8; 32],
    /// Null-terminated free-form description.
    pub description: [u8; 64],
    pub reserved: [u8; 64],
}

const_assert_eq!(core::mem::size_of::<AppHeader>(), APP_HEADER_SIZE);

impl AppHeader {
    /// Parses a header from the front of `bytes` (a staging buffer or a
    /// flash read). Fails only on short input.
    pub fn read_from_prefix(bytes: &[u8]) -> Option<AppHeader> {
        let (header, _rest) =
            <AppHeader as FromBytes>::read_from_prefix(bytes).ok()?;
        Some(header)
    }

    /// Structural validation: magic, declared size bounds, entry offset.
    /// Does not touch the binary itself; CRC verification is the caller's
    /// second step since it needs the binary bytes.
    pub fn validate(&self) -> Result<(), UpdateError> {
        if self.magic != APP_MAGIC {
            return Err(UpdateError::InvalidMagic);
        }
        if self.binary_size == 0
            || self.binary_size > APP_PARTITION_SIZE - APP_HEADER_SIZE as u32
        {
            return Err(UpdateError::InvalidSize);
        }
        if self.entry_offset != APP_ENTRY_OFFSET {
            return Err(UpdateError::InvalidMagic);
        }
        Ok(())
    }

    /// Total image footprint: header plus binary.
    pub fn image_size(&self) -> u32 {
        APP_HEADER_SIZE as u32 + self.binary_size
    }

    /// The header in its on-flash form. Image build tooling and tests use
    /// this; the node itself only ever reads headers.
    pub fn to_bytes(&self) -> [u8; APP_HEADER_SIZE] {
        let mut out = [0u8; APP_HEADER_SIZE];
        out.copy_from_slice(self.as_bytes());
        out
    }

    /// The name field up to its first NUL, when it is valid UTF-8.
    pub fn name_str(&self) -> Option<&str> {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        core::str::from_utf8(&self.name[..end]).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> AppHeader {
        let mut h = AppHeader {
            magic: APP_MAGIC,
            version_major: 1,
            version_minor: 2,
            version_patch: 3,
            flags: 0,
            binary_size: 1024,
            binary_crc32: 0,
            entry_offset: APP_ENTRY_OFFSET,
            name: [0; 32],
            description: [0; 64],
            reserved: [0; 64],
        };
        h.name[..4].copy_from_slice(b"core");
        h
    }

    #[test]
    fn round_trips_through_bytes() {
        let h = header();
        let bytes = h.as_bytes();
        assert_eq!(bytes.len(), APP_HEADER_SIZE);
        let back = AppHeader::read_from_prefix(bytes).unwrap();
        assert_eq!(back.magic, APP_MAGIC);
        assert_eq!(back.binary_size, 1024);
        assert_eq!(back.name_str(), Some("core"));
    }

    #[test]
    fn validation_checks() {
        assert!(header().validate().is_ok());

        let mut h = header();
        h.magic = 0x1234_5678;
        assert_eq!(h.validate(), Err(UpdateError::InvalidMagic));

        let mut h = header();
        h.binary_size = 0;
        assert_eq!(h.validate(), Err(UpdateError::InvalidSize));

        let mut h = header();
        h.binary_size = APP_PARTITION_SIZE;
        assert_eq!(h.validate(), Err(UpdateError::InvalidSize));

        let mut h = header();
        h.entry_offset = 0x100;
        assert_eq!(h.validate(), Err(UpdateError::InvalidMagic));
    }

    #[test]
    fn short_input_does_not_parse() {
        assert!(AppHeader::read_from_prefix(&[0u8; 191]).is_none());
    }
}
