//! Raw reads out of the inspected image.
//!
//! Everything in this crate reads memory through [`KernelMemory`]. It is implemented for every
//! memflow [`MemoryView`], so a kernel virtual address space coming out of a connector or an
//! OS layer can be passed in directly.

use crate::error::{KernelError, Result};
use memflow::prelude::v1::{Address, MemoryView, PartialResultExt};

use dataview::{Pod, PodMethods};

/// Kernel pointers are 8 bytes wide. 32-bit targets are not supported.
pub const POINTER_SIZE: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

pub trait KernelMemory {
    fn read_bytes(&mut self, addr: Address, out: &mut [u8]) -> Result<()>;

    /// Reads `count` unsigned values of `width` bytes each (1, 2, 4 or 8).
    fn read_values(
        &mut self,
        addr: Address,
        count: usize,
        width: usize,
        endian: Endian,
    ) -> Result<Vec<u64>> {
        if !matches!(width, 1 | 2 | 4 | 8) {
            return Err(KernelError::Corrupted(format!(
                "unsupported value width {}",
                width
            )));
        }

        let mut buf = vec![0; count * width];
        self.read_bytes(addr, &mut buf)?;

        Ok(buf
            .chunks_exact(width)
            .map(|chunk| decode_value(chunk, endian))
            .collect())
    }

    /// Reads a plain-old-data value in the host's byte order.
    fn read_pod<T: Pod>(&mut self, addr: Address) -> Result<T> {
        let mut value = T::zeroed();
        self.read_bytes(addr, value.as_bytes_mut())?;
        Ok(value)
    }

    fn read_addr(&mut self, addr: Address) -> Result<Address> {
        self.read_pod::<u64>(addr).map(Address::from)
    }

    /// Reads exactly `len` bytes of text.
    ///
    /// Bytes are mapped one to one onto characters. Kernel strings are UTF-8, so multi-byte
    /// sequences come out as their individual Latin-1 characters.
    fn read_text(&mut self, addr: Address, len: usize) -> Result<String> {
        let mut buf = vec![0; len];
        self.read_bytes(addr, &mut buf)?;
        Ok(bytes_to_text(&buf))
    }

    /// Reads a NUL terminated string of at most `max_len` bytes.
    fn read_c_string(&mut self, addr: Address, max_len: usize) -> Result<String> {
        let mut buf = vec![0; max_len];
        self.read_bytes(addr, &mut buf)?;
        Ok(bytes_to_text(until_nul(&buf)))
    }
}

/// Reads through a memflow view. A read that only partly succeeds is an error, the unread
/// bytes are never handed out as zeroes.
impl<T: MemoryView> KernelMemory for T {
    fn read_bytes(&mut self, addr: Address, out: &mut [u8]) -> Result<()> {
        MemoryView::read_raw_into(self, addr, out)
            .data()
            .map_err(KernelError::from)
    }

    fn read_pod<V: Pod>(&mut self, addr: Address) -> Result<V> {
        MemoryView::read::<V>(self, addr)
            .data()
            .map_err(KernelError::from)
    }

    fn read_addr(&mut self, addr: Address) -> Result<Address> {
        MemoryView::read_addr64(self, addr)
            .data()
            .map_err(KernelError::from)
    }

    /// Names near the end of a mapping are still read, memflow decodes them as lossy UTF-8.
    fn read_c_string(&mut self, addr: Address, max_len: usize) -> Result<String> {
        MemoryView::read_char_string_n(self, addr, max_len)
            .data()
            .map_err(KernelError::from)
    }
}

pub(crate) fn decode_value(bytes: &[u8], endian: Endian) -> u64 {
    let mut raw = [0u8; 8];
    match endian {
        Endian::Little => {
            raw[..bytes.len()].copy_from_slice(bytes);
            u64::from_le_bytes(raw)
        }
        Endian::Big => {
            raw[8 - bytes.len()..].copy_from_slice(bytes);
            u64::from_be_bytes(raw)
        }
    }
}

pub(crate) fn until_nul(buf: &[u8]) -> &[u8] {
    match buf.iter().position(|&b| b == 0) {
        Some(end) => &buf[..end],
        None => buf,
    }
}

pub(crate) fn bytes_to_text(buf: &[u8]) -> String {
    buf.iter().map(|&b| b as char).collect()
}

/// Address of the structure that embeds a link node at `offset`.
pub fn container_of(node: Address, offset: usize) -> Address {
    Address::from((node.to_umem() as u64).wrapping_sub(offset as u64))
}

pub(crate) fn offset_addr(base: Address, offset: u64) -> Address {
    Address::from((base.to_umem() as u64).wrapping_add(offset))
}
