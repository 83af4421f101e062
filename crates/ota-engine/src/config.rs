//! Update engine configuration
//!
//! Every field has a default so a TOML file only needs to name what it
//! changes:
//!
//! ```toml
//! port = 3232
//! inactivity_timeout_ms = 30000
//!
//! [layout]
//! slot_size = 0x40000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::OtaError;
use crate::flash::Region;

/// Complete engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// TCP port the update endpoint listens on (must match the advertised one)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Largest chunk payload accepted from the sender
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,

    /// Maximum bytes read from the connection per poll
    #[serde(default = "default_poll_budget_bytes")]
    pub poll_budget_bytes: usize,

    /// Erase sectors prepared per poll while starting a session
    #[serde(default = "default_erase_sectors_per_poll")]
    pub erase_sectors_per_poll: u32,

    /// Abort a transfer after this long without data
    #[serde(default = "default_inactivity_timeout_ms")]
    pub inactivity_timeout_ms: u64,

    /// Trial boots allowed before a new image is rolled back
    #[serde(default = "default_max_boot_attempts")]
    pub max_boot_attempts: u8,

    /// Extra connections held open only to answer `Busy`
    #[serde(default = "default_max_pending_connections")]
    pub max_pending_connections: usize,

    /// Flash partition layout
    #[serde(default)]
    pub layout: LayoutConfig,
}

fn default_port() -> u16 {
    8266
}

fn default_max_chunk_size() -> usize {
    1024
}

fn default_poll_budget_bytes() -> usize {
    2048
}

fn default_erase_sectors_per_poll() -> u32 {
    1
}

fn default_inactivity_timeout_ms() -> u64 {
    15_000
}

fn default_max_boot_attempts() -> u8 {
    3
}

fn default_max_pending_connections() -> usize {
    4
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            max_chunk_size: default_max_chunk_size(),
            poll_budget_bytes: default_poll_budget_bytes(),
            erase_sectors_per_poll: default_erase_sectors_per_poll(),
            inactivity_timeout_ms: default_inactivity_timeout_ms(),
            max_boot_attempts: default_max_boot_attempts(),
            max_pending_connections: default_max_pending_connections(),
            layout: LayoutConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, OtaError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| OtaError::Config(format!("{}: {}", path.display(), e)))?;
        toml::from_str(&content).map_err(|e| OtaError::Config(e.to_string()))
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }

    /// Check the configuration against the flash geometry.
    pub fn validate(
        &self,
        write_size: usize,
        erase_size: usize,
        capacity: usize,
    ) -> Result<(), OtaError> {
        if self.max_chunk_size == 0 || self.max_chunk_size > u16::MAX as usize {
            return Err(OtaError::Config(format!(
                "max_chunk_size must be within 1..={}, got {}",
                u16::MAX,
                self.max_chunk_size
            )));
        }
        if self.poll_budget_bytes == 0 {
            return Err(OtaError::Config("poll_budget_bytes must be non-zero".into()));
        }
        if self.erase_sectors_per_poll == 0 {
            return Err(OtaError::Config(
                "erase_sectors_per_poll must be non-zero".into(),
            ));
        }
        if self.max_pending_connections == 0 {
            return Err(OtaError::Config(
                "max_pending_connections must be non-zero".into(),
            ));
        }
        self.layout.validate(write_size, erase_size, capacity)
    }
}

// =============================================================================
// Flash Layout
// =============================================================================

/// Flash partition layout: two image slots and the boot record area.
///
/// The boot record area spans two erase sectors starting at `meta_offset`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutConfig {
    /// Size of each image slot in bytes
    #[serde(default = "default_slot_size")]
    pub slot_size: u32,

    /// Offset of slot A
    #[serde(default = "default_slot_a_offset")]
    pub slot_a_offset: u32,

    /// Offset of slot B
    #[serde(default = "default_slot_b_offset")]
    pub slot_b_offset: u32,

    /// Offset of the boot record area
    #[serde(default)]
    pub meta_offset: u32,
}

fn default_slot_size() -> u32 {
    0x70000
}

fn default_slot_a_offset() -> u32 {
    0x10000
}

fn default_slot_b_offset() -> u32 {
    0x80000
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            slot_size: default_slot_size(),
            slot_a_offset: default_slot_a_offset(),
            slot_b_offset: default_slot_b_offset(),
            meta_offset: 0,
        }
    }
}

impl LayoutConfig {
    pub fn slot_a(&self) -> Region {
        Region::new(self.slot_a_offset, self.slot_size)
    }

    pub fn slot_b(&self) -> Region {
        Region::new(self.slot_b_offset, self.slot_size)
    }

    pub fn meta(&self, erase_size: usize) -> Region {
        Region::new(self.meta_offset, 2 * erase_size as u32)
    }

    /// Smallest flash size that holds every partition.
    pub fn required_capacity(&self, erase_size: usize) -> u64 {
        [self.slot_a(), self.slot_b(), self.meta(erase_size)]
            .iter()
            .map(|r| r.end())
            .max()
            .unwrap_or(0)
    }

    pub fn validate(
        &self,
        write_size: usize,
        erase_size: usize,
        capacity: usize,
    ) -> Result<(), OtaError> {
        if self.slot_size == 0 {
            return Err(OtaError::Config("slot_size must be non-zero".into()));
        }

        let regions = [
            ("slot_a", self.slot_a()),
            ("slot_b", self.slot_b()),
            ("meta", self.meta(erase_size)),
        ];

        for (name, region) in &regions {
            if !region.is_aligned(erase_size as u32) || !region.is_aligned(write_size as u32) {
                return Err(OtaError::Config(format!(
                    "{} partition {} is not aligned to erase size {}",
                    name, region, erase_size
                )));
            }
            if region.end() > capacity as u64 {
                return Err(OtaError::Config(format!(
                    "{} partition {} exceeds flash capacity 0x{:X}",
                    name, region, capacity
                )));
            }
        }

        for (i, (name_a, a)) in regions.iter().enumerate() {
            for (name_b, b) in regions.iter().skip(i + 1) {
                if a.overlaps(b) {
                    return Err(OtaError::Config(format!(
                        "{} partition {} overlaps {} partition {}",
                        name_a, a, name_b, b
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_layout_fits_one_megabyte() {
        let config = EngineConfig::default();
        assert!(config.validate(4, 4096, 0x100000).is_ok());
        assert_eq!(config.layout.required_capacity(4096), 0xF0000);
    }

    #[test]
    fn test_overlapping_slots_rejected() {
        let mut config = EngineConfig::default();
        config.layout.slot_b_offset = 0x20000;
        let err = config.validate(4, 4096, 0x100000).unwrap_err();
        assert!(err.to_string().contains("overlaps"), "{}", err);
    }

    #[test]
    fn test_misaligned_slot_rejected() {
        let mut config = EngineConfig::default();
        config.layout.slot_a_offset = 0x10100;
        assert!(matches!(
            config.validate(4, 4096, 0x100000),
            Err(OtaError::Config(_))
        ));
    }

    #[test]
    fn test_zero_pending_connections_rejected() {
        let config = EngineConfig {
            max_pending_connections: 0,
            ..EngineConfig::default()
        };
        let err = config.validate(4, 4096, 0x100000).unwrap_err();
        assert!(err.to_string().contains("max_pending_connections"), "{}", err);
    }

    #[test]
    fn test_layout_exceeding_capacity_rejected() {
        let config = EngineConfig::default();
        assert!(config.validate(4, 4096, 0x80000).is_err());
    }

    #[test]
    fn test_load_partial_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "port = 3232\ninactivity_timeout_ms = 500\n\n[layout]\nslot_size = 0x40000"
        )
        .unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.port, 3232);
        assert_eq!(config.inactivity_timeout(), Duration::from_millis(500));
        assert_eq!(config.layout.slot_size, 0x40000);
        assert_eq!(config.layout.slot_a_offset, 0x10000);
        assert_eq!(config.max_chunk_size, 1024);
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            EngineConfig::load("/nonexistent/ota.toml"),
            Err(OtaError::Config(_))
        ));
    }
}
