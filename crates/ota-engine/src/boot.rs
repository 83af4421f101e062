//! Commit/rollback controller
//!
//! The active slot is selected by a boot record kept in two erase sectors.
//! Each update of the record goes to the sector *not* holding the current
//! copy, with a higher sequence number, so a power loss at any point leaves
//! either the old or the new record intact. On load the valid copy with the
//! newest sequence wins.
//!
//! Record layout (big-endian, CRC-32/ISO-HDLC over everything before it):
//!
//! ```text
//! magic "OTAB" | version:u8 | sequence:u32 | active:u8 | phase:u8 | attempts:u8
//! | previous:u8 (0xFF = none) | 2 x (present:u8 size:u32 digest:[u8;32]) | crc:u32
//! ```
//!
//! After a commit the new slot runs in *trial* mode. The boot-health
//! collaborator either confirms it or reports failure; running out of trial
//! attempts also rolls back to the previous slot.

use crc::{Crc, CRC_32_ISO_HDLC};
use embedded_storage::nor_flash::NorFlash;
use ota_core::{ImageDigest, DIGEST_LEN};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::LayoutConfig;
use crate::error::OtaError;
use crate::flash::{read_bytes, FlashFault, Region};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

const MAGIC: &[u8; 4] = b"OTAB";
const VERSION: u8 = 1;
const NO_SLOT: u8 = 0xFF;
const IMAGE_INFO_LEN: usize = 1 + 4 + DIGEST_LEN;
const BODY_LEN: usize = 4 + 1 + 4 + 1 + 1 + 1 + 1 + 2 * IMAGE_INFO_LEN;
/// Encoded boot record size including the CRC
pub const RECORD_LEN: usize = BODY_LEN + 4;

/// Image slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Slot {
    A,
    B,
}

impl Slot {
    pub fn other(self) -> Slot {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }

    fn index(self) -> usize {
        match self {
            Slot::A => 0,
            Slot::B => 1,
        }
    }

    fn from_index(index: u8) -> Option<Slot> {
        match index {
            0 => Some(Slot::A),
            1 => Some(Slot::B),
            _ => None,
        }
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Slot::A => f.write_str("A"),
            Slot::B => f.write_str("B"),
        }
    }
}

/// What is installed in a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImageInfo {
    pub size: u32,
    pub digest: ImageDigest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum BootPhase {
    /// Image passed its boot-health check
    Confirmed,
    /// Freshly committed image; `attempts` trial boots so far
    Trial { attempts: u8 },
}

/// Persistent boot pointer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootRecord {
    pub sequence: u32,
    pub active: Slot,
    pub phase: BootPhase,
    /// Slot to fall back to while in trial
    pub previous: Option<Slot>,
    pub images: [Option<ImageInfo>; 2],
}

impl BootRecord {
    /// Record used when flash holds no valid copy.
    pub fn factory() -> Self {
        Self {
            sequence: 0,
            active: Slot::A,
            phase: BootPhase::Confirmed,
            previous: None,
            images: [None, None],
        }
    }

    pub fn image(&self, slot: Slot) -> Option<ImageInfo> {
        self.images[slot.index()]
    }

    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut buf = [0u8; RECORD_LEN];
        buf[..4].copy_from_slice(MAGIC);
        buf[4] = VERSION;
        buf[5..9].copy_from_slice(&self.sequence.to_be_bytes());
        buf[9] = self.active.index() as u8;
        let (phase, attempts) = match self.phase {
            BootPhase::Confirmed => (0, 0),
            BootPhase::Trial { attempts } => (1, attempts),
        };
        buf[10] = phase;
        buf[11] = attempts;
        buf[12] = self.previous.map_or(NO_SLOT, |s| s.index() as u8);

        let mut pos = 13;
        for image in &self.images {
            if let Some(info) = image {
                buf[pos] = 1;
                buf[pos + 1..pos + 5].copy_from_slice(&info.size.to_be_bytes());
                buf[pos + 5..pos + IMAGE_INFO_LEN].copy_from_slice(info.digest.as_bytes());
            }
            pos += IMAGE_INFO_LEN;
        }

        let crc = CRC32.checksum(&buf[..BODY_LEN]);
        buf[BODY_LEN..].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    /// Decode a stored copy. Returns `None` for erased, torn or corrupt data.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < RECORD_LEN || &buf[..4] != MAGIC || buf[4] != VERSION {
            return None;
        }
        let stored = u32::from_be_bytes([
            buf[BODY_LEN],
            buf[BODY_LEN + 1],
            buf[BODY_LEN + 2],
            buf[BODY_LEN + 3],
        ]);
        if CRC32.checksum(&buf[..BODY_LEN]) != stored {
            return None;
        }

        let sequence = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]);
        let active = Slot::from_index(buf[9])?;
        let phase = match buf[10] {
            0 => BootPhase::Confirmed,
            1 => BootPhase::Trial { attempts: buf[11] },
            _ => return None,
        };
        let previous = match buf[12] {
            NO_SLOT => None,
            i => Some(Slot::from_index(i)?),
        };

        let mut images = [None, None];
        let mut pos = 13;
        for image in images.iter_mut() {
            if buf[pos] == 1 {
                let size = u32::from_be_bytes([
                    buf[pos + 1],
                    buf[pos + 2],
                    buf[pos + 3],
                    buf[pos + 4],
                ]);
                let mut digest = [0u8; DIGEST_LEN];
                digest.copy_from_slice(&buf[pos + 5..pos + IMAGE_INFO_LEN]);
                *image = Some(ImageInfo {
                    size,
                    digest: ImageDigest(digest),
                });
            }
            pos += IMAGE_INFO_LEN;
        }

        Some(Self {
            sequence,
            active,
            phase,
            previous,
            images,
        })
    }
}

/// Wrapping sequence comparison
fn is_newer(candidate: u32, current: u32) -> bool {
    candidate != current && candidate.wrapping_sub(current) < 0x8000_0000
}

/// Outcome of [`BootControl::on_boot`] and [`BootControl::report_boot_failure`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum BootDecision {
    /// Running a confirmed image
    Confirmed { slot: Slot },
    /// Running a trial image; health check pending
    Trial { slot: Slot, attempt: u8 },
    /// Trial image failed, previous slot restored
    RolledBack { from: Slot, to: Slot },
}

// =============================================================================
// Boot Controller
// =============================================================================

/// Owner of the boot record
#[derive(Debug, Clone)]
pub struct BootControl {
    slots: [Region; 2],
    meta: Region,
    record: BootRecord,
    max_attempts: u8,
}

impl BootControl {
    /// Read the boot record from flash.
    pub fn load<F: NorFlash>(
        flash: &mut F,
        layout: &LayoutConfig,
        max_attempts: u8,
    ) -> Result<Self, FlashFault> {
        let meta = layout.meta(F::ERASE_SIZE);
        let stored_len = Self::stored_len::<F>();
        if stored_len > F::ERASE_SIZE {
            return Err(FlashFault::OutOfBounds {
                offset: meta.offset,
                len: stored_len,
                region_size: F::ERASE_SIZE as u32,
            });
        }

        let mut best: Option<BootRecord> = None;
        let mut buf = vec![0u8; stored_len];
        for copy in 0..2u32 {
            read_bytes(flash, meta.offset + copy * F::ERASE_SIZE as u32, &mut buf)?;
            match BootRecord::decode(&buf) {
                Some(record) => {
                    debug!(copy = copy, sequence = record.sequence, "Boot record copy valid");
                    if best
                        .as_ref()
                        .map_or(true, |b| is_newer(record.sequence, b.sequence))
                    {
                        best = Some(record);
                    }
                }
                None => debug!(copy = copy, "Boot record copy invalid or erased"),
            }
        }

        let record = best.unwrap_or_else(|| {
            info!("No valid boot record, using factory defaults");
            BootRecord::factory()
        });
        info!(
            active = %record.active,
            sequence = record.sequence,
            phase = ?record.phase,
            "Boot record loaded"
        );

        Ok(Self {
            slots: [layout.slot_a(), layout.slot_b()],
            meta,
            record,
            max_attempts,
        })
    }

    pub fn record(&self) -> &BootRecord {
        &self.record
    }

    pub fn active_slot(&self) -> Slot {
        self.record.active
    }

    pub fn inactive_slot(&self) -> Slot {
        self.record.active.other()
    }

    pub fn slot_region(&self, slot: Slot) -> Region {
        self.slots[slot.index()]
    }

    /// Image the device runs from.
    pub fn running_image(&self) -> Option<ImageInfo> {
        self.record.image(self.record.active)
    }

    pub fn in_trial(&self) -> bool {
        matches!(self.record.phase, BootPhase::Trial { .. })
    }

    /// Switch the boot pointer to `target`, which must be the inactive slot.
    ///
    /// Either the new record is fully written or the previous one stays in
    /// effect; on error the in-memory state is unchanged.
    pub fn commit<F: NorFlash>(
        &mut self,
        flash: &mut F,
        target: Slot,
        image: ImageInfo,
    ) -> Result<(), OtaError> {
        if target == self.record.active {
            return Err(OtaError::CommitFailed(format!(
                "slot {} is the active slot",
                target
            )));
        }

        let mut next = self.record.clone();
        next.active = target;
        next.previous = Some(self.record.active);
        next.phase = BootPhase::Trial { attempts: 0 };
        next.images[target.index()] = Some(image);

        self.persist(flash, next)
            .map_err(|e| OtaError::CommitFailed(e.to_string()))?;

        info!(
            slot = %target,
            size = image.size,
            digest = %image.digest,
            "Boot pointer switched, image pending boot-health check"
        );
        Ok(())
    }

    /// Account for one boot of the active image.
    pub fn on_boot<F: NorFlash>(&mut self, flash: &mut F) -> Result<BootDecision, OtaError> {
        let active = self.record.active;
        match self.record.phase {
            BootPhase::Confirmed => Ok(BootDecision::Confirmed { slot: active }),
            BootPhase::Trial { attempts } if attempts >= self.max_attempts => {
                warn!(
                    slot = %active,
                    attempts = attempts,
                    max_attempts = self.max_attempts,
                    "Trial boot budget exhausted"
                );
                self.rollback(flash)
            }
            BootPhase::Trial { attempts } => {
                let attempt = attempts + 1;
                let mut next = self.record.clone();
                next.phase = BootPhase::Trial { attempts: attempt };
                self.persist(flash, next)?;
                info!(slot = %active, attempt = attempt, "Trial boot");
                Ok(BootDecision::Trial {
                    slot: active,
                    attempt,
                })
            }
        }
    }

    /// Accept the running image permanently. Returns `false` if it already was.
    pub fn confirm_boot<F: NorFlash>(&mut self, flash: &mut F) -> Result<bool, OtaError> {
        if !self.in_trial() {
            return Ok(false);
        }
        let mut next = self.record.clone();
        next.phase = BootPhase::Confirmed;
        next.previous = None;
        self.persist(flash, next)?;
        info!(slot = %self.record.active, "Boot confirmed");
        Ok(true)
    }

    /// Boot-health check failed for the running image.
    pub fn report_boot_failure<F: NorFlash>(
        &mut self,
        flash: &mut F,
    ) -> Result<BootDecision, OtaError> {
        if !self.in_trial() {
            warn!(
                slot = %self.record.active,
                "Health check failed on a confirmed image, no rollback target"
            );
            return Ok(BootDecision::Confirmed {
                slot: self.record.active,
            });
        }
        self.rollback(flash)
    }

    fn rollback<F: NorFlash>(&mut self, flash: &mut F) -> Result<BootDecision, OtaError> {
        let from = self.record.active;
        let Some(to) = self.record.previous else {
            return Err(OtaError::CommitFailed(format!(
                "no previous slot to roll back to from {}",
                from
            )));
        };

        let mut next = self.record.clone();
        next.active = to;
        next.previous = None;
        next.phase = BootPhase::Confirmed;
        next.images[from.index()] = None;
        self.persist(flash, next)?;

        warn!(from = %from, to = %to, "Rolled back to previous image");
        Ok(BootDecision::RolledBack { from, to })
    }

    /// Write `next` (with a bumped sequence) into the copy not holding the
    /// current record, then adopt it.
    fn persist<F: NorFlash>(&mut self, flash: &mut F, mut next: BootRecord) -> Result<(), FlashFault> {
        next.sequence = self.record.sequence.wrapping_add(1);
        let copy = next.sequence % 2;
        let sector = F::ERASE_SIZE as u32;
        let offset = self.meta.offset + copy * sector;

        let mut stored = vec![0xFFu8; Self::stored_len::<F>()];
        stored[..RECORD_LEN].copy_from_slice(&next.encode());

        flash
            .erase(offset, offset + sector)
            .map_err(FlashFault::medium)?;
        flash.write(offset, &stored).map_err(FlashFault::medium)?;

        debug!(copy = copy, sequence = next.sequence, "Boot record written");
        self.record = next;
        Ok(())
    }

    fn stored_len<F: NorFlash>() -> usize {
        RECORD_LEN.div_ceil(F::WRITE_SIZE) * F::WRITE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::SimFlash;

    const MAX_ATTEMPTS: u8 = 3;

    fn setup() -> (SimFlash, BootControl, LayoutConfig) {
        let layout = LayoutConfig::default();
        let mut flash = SimFlash::new(0x100000);
        let boot = BootControl::load(&mut flash, &layout, MAX_ATTEMPTS).unwrap();
        (flash, boot, layout)
    }

    fn image(tag: &[u8]) -> ImageInfo {
        ImageInfo {
            size: tag.len() as u32,
            digest: ImageDigest::of(tag),
        }
    }

    #[test]
    fn test_record_encoding() {
        let mut record = BootRecord::factory();
        record.sequence = 7;
        record.active = Slot::B;
        record.previous = Some(Slot::A);
        record.phase = BootPhase::Trial { attempts: 2 };
        record.images[1] = Some(image(b"v2"));

        let bytes = record.encode();
        assert_eq!(&bytes[..4], b"OTAB");
        assert_eq!(BootRecord::decode(&bytes), Some(record));
    }

    #[test]
    fn test_corrupt_record_rejected() {
        let mut bytes = BootRecord::factory().encode();
        bytes[20] ^= 0x01;
        assert_eq!(BootRecord::decode(&bytes), None);
        assert_eq!(BootRecord::decode(&[0xFF; RECORD_LEN]), None);
    }

    #[test]
    fn test_blank_flash_uses_factory_record() {
        let (_, boot, _) = setup();
        assert_eq!(boot.active_slot(), Slot::A);
        assert_eq!(boot.inactive_slot(), Slot::B);
        assert!(!boot.in_trial());
        assert_eq!(boot.running_image(), None);
    }

    #[test]
    fn test_commit_survives_reload() {
        let (mut flash, mut boot, layout) = setup();
        boot.commit(&mut flash, Slot::B, image(b"v1")).unwrap();

        let reloaded = BootControl::load(&mut flash, &layout, MAX_ATTEMPTS).unwrap();
        assert_eq!(reloaded.active_slot(), Slot::B);
        assert_eq!(reloaded.running_image(), Some(image(b"v1")));
        assert_eq!(reloaded.record().phase, BootPhase::Trial { attempts: 0 });
        assert_eq!(reloaded.record().previous, Some(Slot::A));
    }

    #[test]
    fn test_commit_to_active_slot_rejected() {
        let (mut flash, mut boot, _) = setup();
        assert!(matches!(
            boot.commit(&mut flash, Slot::A, image(b"v1")),
            Err(OtaError::CommitFailed(_))
        ));
        assert_eq!(flash.write_count(), 0);
    }

    #[test]
    fn test_failed_commit_keeps_previous_pointer() {
        let (mut flash, mut boot, layout) = setup();
        flash.fail_writes_after(0);
        assert!(matches!(
            boot.commit(&mut flash, Slot::B, image(b"v1")),
            Err(OtaError::CommitFailed(_))
        ));
        assert_eq!(boot.active_slot(), Slot::A);

        flash.clear_faults();
        let reloaded = BootControl::load(&mut flash, &layout, MAX_ATTEMPTS).unwrap();
        assert_eq!(reloaded.active_slot(), Slot::A);
    }

    #[test]
    fn test_torn_newer_copy_falls_back_to_older() {
        let (mut flash, mut boot, layout) = setup();
        boot.commit(&mut flash, Slot::B, image(b"v1")).unwrap();
        boot.confirm_boot(&mut flash).unwrap();

        // Second record write: sector erased, then the write fails
        flash.fail_writes_after(0);
        assert!(boot.commit(&mut flash, Slot::A, image(b"v2")).is_err());
        flash.clear_faults();

        let reloaded = BootControl::load(&mut flash, &layout, MAX_ATTEMPTS).unwrap();
        assert_eq!(reloaded.active_slot(), Slot::B);
        assert_eq!(reloaded.record().phase, BootPhase::Confirmed);
        assert_eq!(reloaded.running_image(), Some(image(b"v1")));
    }

    #[test]
    fn test_trial_confirmed() {
        let (mut flash, mut boot, _) = setup();
        boot.commit(&mut flash, Slot::B, image(b"v1")).unwrap();

        assert_eq!(
            boot.on_boot(&mut flash).unwrap(),
            BootDecision::Trial {
                slot: Slot::B,
                attempt: 1
            }
        );
        assert!(boot.confirm_boot(&mut flash).unwrap());
        assert!(!boot.confirm_boot(&mut flash).unwrap());
        assert_eq!(
            boot.on_boot(&mut flash).unwrap(),
            BootDecision::Confirmed { slot: Slot::B }
        );
    }

    #[test]
    fn test_health_failure_rolls_back() {
        let (mut flash, mut boot, layout) = setup();
        boot.commit(&mut flash, Slot::B, image(b"v1")).unwrap();
        boot.on_boot(&mut flash).unwrap();
        boot.confirm_boot(&mut flash).unwrap();

        boot.commit(&mut flash, Slot::A, image(b"v2")).unwrap();
        boot.on_boot(&mut flash).unwrap();
        assert_eq!(
            boot.report_boot_failure(&mut flash).unwrap(),
            BootDecision::RolledBack {
                from: Slot::A,
                to: Slot::B
            }
        );

        let reloaded = BootControl::load(&mut flash, &layout, MAX_ATTEMPTS).unwrap();
        assert_eq!(reloaded.active_slot(), Slot::B);
        assert_eq!(reloaded.running_image(), Some(image(b"v1")));
        assert!(!reloaded.in_trial());
    }

    #[test]
    fn test_exhausted_trial_attempts_roll_back() {
        let (mut flash, mut boot, _) = setup();
        boot.commit(&mut flash, Slot::B, image(b"v1")).unwrap();

        for attempt in 1..=MAX_ATTEMPTS {
            assert_eq!(
                boot.on_boot(&mut flash).unwrap(),
                BootDecision::Trial {
                    slot: Slot::B,
                    attempt
                }
            );
        }
        assert_eq!(
            boot.on_boot(&mut flash).unwrap(),
            BootDecision::RolledBack {
                from: Slot::B,
                to: Slot::A
            }
        );
        assert_eq!(boot.active_slot(), Slot::A);
    }

    #[test]
    fn test_sequence_wraps() {
        assert!(is_newer(1, 0));
        assert!(is_newer(0, u32::MAX));
        assert!(!is_newer(5, 5));
        assert!(!is_newer(3, 4));
    }
}
