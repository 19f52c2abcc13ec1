//! Sparse in-memory kernel image used by the unit tests.

use crate::error::{KernelError, Result};
use crate::memory::KernelMemory;
use memflow::prelude::v1::{Address, Error, ErrorKind, ErrorOrigin};

use std::collections::BTreeMap;

pub fn addr(v: u64) -> Address {
    Address::from(v)
}

pub fn init_log() {
    let _ = simplelog::SimpleLogger::init(log::LevelFilter::Trace, simplelog::Config::default());
}

#[derive(Default)]
pub struct FixtureMemory {
    regions: BTreeMap<u64, Vec<u8>>,
}

impl FixtureMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `bytes` at `base`. Regions must not overlap.
    pub fn write(&mut self, base: u64, bytes: &[u8]) {
        if let Some((start, region)) = self.region_mut(base, bytes.len()) {
            let off = (base - start) as usize;
            region[off..off + bytes.len()].copy_from_slice(bytes);
        } else {
            self.regions.insert(base, bytes.to_vec());
        }
    }

    pub fn write_u8(&mut self, base: u64, v: u8) {
        self.write(base, &[v]);
    }

    pub fn write_u16(&mut self, base: u64, v: u16) {
        self.write(base, &v.to_le_bytes());
    }

    pub fn write_u32(&mut self, base: u64, v: u32) {
        self.write(base, &v.to_le_bytes());
    }

    pub fn write_u64(&mut self, base: u64, v: u64) {
        self.write(base, &v.to_le_bytes());
    }

    /// Maps a zeroed region of `len` bytes.
    pub fn map(&mut self, base: u64, len: usize) {
        self.regions.insert(base, vec![0; len]);
    }

    fn region_mut(&mut self, base: u64, len: usize) -> Option<(u64, &mut Vec<u8>)> {
        let (start, region) = self.regions.range_mut(..=base).next_back()?;
        if base + len as u64 <= start + region.len() as u64 {
            Some((*start, region))
        } else {
            None
        }
    }
}

impl KernelMemory for FixtureMemory {
    fn read_bytes(&mut self, addr: Address, out: &mut [u8]) -> Result<()> {
        let base = addr.to_umem() as u64;
        let (start, region) = self
            .regions
            .range(..=base)
            .next_back()
            .ok_or_else(out_of_bounds)?;
        let off = (base - start) as usize;
        let bytes = region
            .get(off..off + out.len())
            .ok_or_else(out_of_bounds)?;
        out.copy_from_slice(bytes);
        Ok(())
    }
}

fn out_of_bounds() -> KernelError {
    KernelError::Memory(Error(ErrorOrigin::VirtualMemory, ErrorKind::OutOfBounds))
}
