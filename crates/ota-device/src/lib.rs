//! ota-device - Simulated host for the OTA update engine
//!
//! # Modules
//!
//! - [`config`] - TOML device configuration
//! - [`device`] - Main loop, simulated reboot and boot-health check

pub mod config;
pub mod device;

pub use config::{DeviceConfig, HealthConfig, HealthPolicy};
pub use device::{Advertisement, SimulatedDevice};
