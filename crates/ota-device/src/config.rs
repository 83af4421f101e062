//! Simulated device configuration
//!
//! ```toml
//! name = "greenhouse-sensor"
//! password = "secret"
//! flash_size = 1048576
//! state_file = "flash.bin"
//!
//! [engine]
//! port = 8266
//!
//! [health]
//! policy = "fail"
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use ota_core::{Credential, DeviceIdentity};
use ota_engine::EngineConfig;
use serde::{Deserialize, Serialize};

/// Complete device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device name, also the advertised service instance
    #[serde(default = "default_name")]
    pub name: String,

    /// Update password in clear text
    #[serde(default)]
    pub password: Option<String>,

    /// SHA-256 of the update password (hex), instead of `password`
    #[serde(default)]
    pub password_hash: Option<String>,

    /// Simulated flash size in bytes
    #[serde(default = "default_flash_size")]
    pub flash_size: usize,

    /// Address the update listener binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// File the flash contents are persisted to across runs
    #[serde(default)]
    pub state_file: Option<PathBuf>,

    /// Update engine settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Post-reboot health check simulation
    #[serde(default)]
    pub health: HealthConfig,
}

fn default_name() -> String {
    "ota-device".to_string()
}

fn default_flash_size() -> usize {
    0x100000
}

fn default_bind_address() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            password: None,
            password_hash: None,
            flash_size: default_flash_size(),
            bind_address: default_bind_address(),
            state_file: None,
            engine: EngineConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl DeviceConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.engine.port)
    }

    /// Identity handed to the engine at startup.
    pub fn identity(&self) -> Result<DeviceIdentity> {
        let credential = match (&self.password, &self.password_hash) {
            (Some(_), Some(_)) => bail!("Set either password or password_hash, not both"),
            (Some(password), None) => Some(Credential::from_password(password)),
            (None, Some(hash)) => Some(
                Credential::from_hash_hex(hash)
                    .map_err(|e| anyhow::anyhow!("Invalid password_hash: {}", e))?,
            ),
            (None, None) => None,
        };
        Ok(DeviceIdentity {
            name: self.name.clone(),
            credential,
        })
    }
}

// =============================================================================
// Health Check
// =============================================================================

/// Outcome of the simulated boot-health check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthPolicy {
    /// New images always pass
    Pass,
    /// New images always fail and are rolled back
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_policy")]
    pub policy: HealthPolicy,

    /// Time after boot before the check runs
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
}

fn default_policy() -> HealthPolicy {
    HealthPolicy::Pass
}

fn default_delay_ms() -> u64 {
    2000
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            policy: default_policy(),
            delay_ms: default_delay_ms(),
        }
    }
}
