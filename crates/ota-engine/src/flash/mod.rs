//! Flash access
//!
//! The engine talks to storage exclusively through the `embedded-storage`
//! NOR flash traits. [`MemFlash`] is a RAM-backed implementation with the
//! same erase/write rules as real NOR parts, used by the simulator and tests.

pub mod writer;

use embedded_storage::nor_flash::{
    check_erase, check_read, check_write, ErrorType, NorFlash, NorFlashError, NorFlashErrorKind,
    ReadNorFlash,
};
use thiserror::Error;

pub use writer::FlashWriter;

/// Byte range of a flash partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub offset: u32,
    pub size: u32,
}

impl Region {
    pub const fn new(offset: u32, size: u32) -> Self {
        Self { offset, size }
    }

    /// First byte past the region.
    pub fn end(&self) -> u64 {
        self.offset as u64 + self.size as u64
    }

    pub fn is_aligned(&self, granularity: u32) -> bool {
        granularity != 0 && self.offset % granularity == 0 && self.size % granularity == 0
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        (self.offset as u64) < other.end() && (other.offset as u64) < self.end()
    }

    /// True if `len` bytes at region-relative `offset` stay inside the region.
    pub fn contains(&self, offset: u32, len: usize) -> bool {
        offset as u64 + len as u64 <= self.size as u64
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:06X}..0x{:06X}", self.offset, self.end())
    }
}

/// Flash access failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FlashFault {
    #[error("{len} bytes at offset 0x{offset:X} exceed region of {region_size} bytes")]
    OutOfBounds {
        offset: u32,
        len: usize,
        region_size: u32,
    },

    #[error("{len} bytes at offset 0x{offset:X} not aligned to {granularity}")]
    Misaligned {
        offset: u32,
        len: usize,
        granularity: usize,
    },

    #[error("Flash medium error: {0}")]
    Medium(String),
}

impl FlashFault {
    /// Wrap a driver error.
    pub fn medium<E: NorFlashError>(err: E) -> Self {
        FlashFault::Medium(format!("{:?}", err.kind()))
    }
}

/// Read `buf.len()` bytes at absolute flash `offset`.
pub fn read_bytes<F: ReadNorFlash>(
    flash: &mut F,
    offset: u32,
    buf: &mut [u8],
) -> Result<(), FlashFault> {
    flash.read(offset, buf).map_err(FlashFault::medium)
}

// =============================================================================
// RAM-backed NOR flash
// =============================================================================

/// Simulated NOR flash.
///
/// Erased bytes read as `0xFF`; writing a byte that is not erased fails,
/// as it would on hardware.
#[derive(Clone)]
pub struct MemFlash<const WRITE: usize, const ERASE: usize> {
    data: Vec<u8>,
    writes: usize,
    erases: usize,
    fail_writes_after: Option<usize>,
    fail_erases: bool,
}

/// Geometry of the simulated device: 4-byte words, 4 KiB sectors.
pub type SimFlash = MemFlash<4, 4096>;

impl<const WRITE: usize, const ERASE: usize> MemFlash<WRITE, ERASE> {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0xFF; capacity],
            writes: 0,
            erases: 0,
            fail_writes_after: None,
            fail_erases: false,
        }
    }

    /// Flash holding a previously saved image.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            data,
            ..Self::new(0)
        }
    }

    /// Successful write operations so far.
    pub fn write_count(&self) -> usize {
        self.writes
    }

    pub fn erase_count(&self) -> usize {
        self.erases
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Every write after the next `n` successful ones fails.
    pub fn fail_writes_after(&mut self, n: usize) {
        self.fail_writes_after = Some(self.writes + n);
    }

    pub fn fail_erases(&mut self, fail: bool) {
        self.fail_erases = fail;
    }

    pub fn clear_faults(&mut self) {
        self.fail_writes_after = None;
        self.fail_erases = false;
    }
}

impl<const WRITE: usize, const ERASE: usize> std::fmt::Debug for MemFlash<WRITE, ERASE> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemFlash")
            .field("capacity", &self.data.len())
            .field("write_size", &WRITE)
            .field("erase_size", &ERASE)
            .field("writes", &self.writes)
            .field("erases", &self.erases)
            .finish()
    }
}

impl<const WRITE: usize, const ERASE: usize> ErrorType for MemFlash<WRITE, ERASE> {
    type Error = NorFlashErrorKind;
}

impl<const WRITE: usize, const ERASE: usize> ReadNorFlash for MemFlash<WRITE, ERASE> {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        check_read(self, offset, bytes.len())?;
        let start = offset as usize;
        bytes.copy_from_slice(&self.data[start..start + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl<const WRITE: usize, const ERASE: usize> NorFlash for MemFlash<WRITE, ERASE> {
    const WRITE_SIZE: usize = WRITE;
    const ERASE_SIZE: usize = ERASE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        check_erase(self, from, to)?;
        if self.fail_erases {
            return Err(NorFlashErrorKind::Other);
        }
        self.data[from as usize..to as usize].fill(0xFF);
        self.erases += 1;
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        check_write(self, offset, bytes.len())?;
        if matches!(self.fail_writes_after, Some(limit) if self.writes >= limit) {
            return Err(NorFlashErrorKind::Other);
        }
        let start = offset as usize;
        let target = &mut self.data[start..start + bytes.len()];
        if target.iter().any(|&b| b != 0xFF) {
            return Err(NorFlashErrorKind::Other);
        }
        target.copy_from_slice(bytes);
        self.writes += 1;
        Ok(())
    }
}
