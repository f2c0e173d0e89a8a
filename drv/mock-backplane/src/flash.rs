// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! RAM-backed application partition with page-granular programming.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use z1_hal::{FlashDevice, FlashOpError};

#[derive(Default)]
pub struct FlashControl {
    /// When set, the next `program_page` fails like a worn device.
    pub fail_program: AtomicBool,
    pub erase_count: AtomicU32,
    pub program_count: AtomicU32,
}

pub struct MockFlash {
    page_size: usize,
    mem: Mutex<Vec<u8>>,
    ctl: Arc<FlashControl>,
}

impl MockFlash {
    /// An erased partition of `partition_size` bytes with `page_size`-byte
    /// programming granularity.
    pub fn new(partition_size: usize, page_size: usize) -> MockFlash {
        assert!(partition_size % page_size == 0);
        MockFlash {
            page_size,
            mem: Mutex::new(vec![0xFF; partition_size]),
            ctl: Arc::new(FlashControl::default()),
        }
    }

    pub fn control(&self) -> Arc<FlashControl> {
        Arc::clone(&self.ctl)
    }

    /// Full image of the partition, for byte-for-byte test assertions.
    pub fn snapshot(&self) -> Vec<u8> {
        self.mem.lock().unwrap().clone()
    }
}

impl FlashDevice for MockFlash {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn partition_size(&self) -> usize {
        self.mem.lock().unwrap().len()
    }

    fn erase_partition(&mut self) -> Result<(), FlashOpError> {
        self.ctl.erase_count.fetch_add(1, Ordering::Relaxed);
        self.mem.lock().unwrap().fill(0xFF);
        Ok(())
    }

    fn program_page(
        &mut self,
        offset: usize,
        data: &[u8],
    ) -> Result<(), FlashOpError> {
        let mut mem = self.mem.lock().unwrap();
        if offset % self.page_size != 0
            || data.len() > self.page_size
            || offset + data.len() > mem.len()
        {
            return Err(FlashOpError::Bounds);
        }
        if self.ctl.fail_program.load(Ordering::Relaxed) {
            return Err(FlashOpError::Device);
        }
        self.ctl.program_count.fetch_add(1, Ordering::Relaxed);
        mem[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read(&self, offset: usize, dest: &mut [u8]) -> Result<(), FlashOpError> {
        let mem = self.mem.lock().unwrap();
        if offset + dest.len() > mem.len() {
            return Err(FlashOpError::Bounds);
        }
        dest.copy_from_slice(&mem[offset..offset + dest.len()]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_and_read_back() {
        let mut f = MockFlash::new(4096 * 4, 4096);
        f.program_page(4096, &[0xAB; 4096]).unwrap();
        let mut buf = [0u8; 8];
        f.read(4096, &mut buf).unwrap();
        assert_eq!(buf, [0xAB; 8]);
        f.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0xFF; 8]);
    }

    #[test]
    fn bounds_are_enforced() {
        let mut f = MockFlash::new(4096 * 2, 4096);
        assert_eq!(
            f.program_page(100, &[0; 16]),
            Err(FlashOpError::Bounds)
        );
        assert_eq!(
            f.program_page(4096, &[0; 4097]),
            Err(FlashOpError::Bounds)
        );
        let mut buf = [0u8; 16];
        assert_eq!(f.read(4096 * 2 - 8, &mut buf), Err(FlashOpError::Bounds));
    }

    #[test]
    fn injected_failure() {
        let mut f = MockFlash::new(4096, 4096);
        f.control().fail_program.store(true, Ordering::Relaxed);
        assert_eq!(
            f.program_page(0, &[0; 4096]),
            Err(FlashOpError::Device)
        );
    }
}
