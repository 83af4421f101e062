//! Sequential writer over the inactive image slot

use embedded_storage::nor_flash::NorFlash;
use tracing::debug;

use super::{FlashFault, Region};

/// Writes byte ranges into one flash region.
///
/// Offsets are relative to the region start. Every write must be aligned to
/// the medium's write granularity and stay inside the region; violations are
/// reported as [`FlashFault`] and nothing is written.
#[derive(Debug, Clone)]
pub struct FlashWriter {
    region: Region,
    cursor: u32,
}

impl FlashWriter {
    pub fn new(region: Region) -> Self {
        Self { region, cursor: 0 }
    }

    pub fn region(&self) -> Region {
        self.region
    }

    /// Region-relative offset just past the last successful write.
    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    pub fn write<F: NorFlash>(
        &mut self,
        flash: &mut F,
        offset: u32,
        bytes: &[u8],
    ) -> Result<(), FlashFault> {
        self.check(offset, bytes.len(), F::WRITE_SIZE)?;

        flash
            .write(self.region.offset + offset, bytes)
            .map_err(FlashFault::medium)?;

        self.cursor = offset + bytes.len() as u32;
        debug!(
            offset = offset,
            bytes = bytes.len(),
            region = %self.region,
            "Flash write"
        );
        Ok(())
    }

    /// Erase `len` bytes starting at region-relative `offset`.
    pub fn erase<F: NorFlash>(
        &mut self,
        flash: &mut F,
        offset: u32,
        len: u32,
    ) -> Result<(), FlashFault> {
        self.check(offset, len as usize, F::ERASE_SIZE)?;

        let from = self.region.offset + offset;
        flash.erase(from, from + len).map_err(FlashFault::medium)?;
        debug!(offset = offset, bytes = len, "Flash erase");
        Ok(())
    }

    fn check(&self, offset: u32, len: usize, granularity: usize) -> Result<(), FlashFault> {
        if offset as usize % granularity != 0 || len % granularity != 0 {
            return Err(FlashFault::Misaligned {
                offset,
                len,
                granularity,
            });
        }
        if !self.region.contains(offset, len) {
            return Err(FlashFault::OutOfBounds {
                offset,
                len,
                region_size: self.region.size,
            });
        }
        Ok(())
    }
}
