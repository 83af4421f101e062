//! Simulated device: host application around the OTA engine
//!
//! Plays every collaborator the engine expects from its host: the main loop
//! calling `poll`, the reboot after a successful update, and the boot-health
//! check that confirms or rejects a freshly installed image.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use ota_core::UpdateStatus;
use ota_engine::{
    BootDecision, Listener, OtaService, SimFlash, StatusReport, SystemClock, TcpTransport,
    UpdateEvent,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{DeviceConfig, HealthPolicy};

/// Service record a discovery responder would publish for this device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Advertisement {
    pub instance: String,
    pub service: &'static str,
    pub port: u16,
    pub auth_required: bool,
}

pub struct SimulatedDevice {
    config: DeviceConfig,
    /// `None` only while rebooting
    service: Option<OtaService<SimFlash>>,
    listen_addr: SocketAddr,
    boot: BootDecision,
    booted_at: Instant,
    health_checked: bool,
    boots: u32,
}

impl SimulatedDevice {
    /// Power on with the flash from `state_file`, or blank flash.
    pub fn start(config: DeviceConfig) -> Result<Self> {
        let flash = match &config.state_file {
            Some(path) if path.exists() => {
                let data = std::fs::read(path)
                    .with_context(|| format!("Failed to read flash state {}", path.display()))?;
                info!(path = %path.display(), bytes = data.len(), "Restored flash state");
                SimFlash::from_bytes(data)
            }
            _ => SimFlash::new(config.flash_size),
        };
        Self::start_with_flash(config, flash)
    }

    pub fn start_with_flash(config: DeviceConfig, flash: SimFlash) -> Result<Self> {
        let listen_addr = config.listen_addr();
        let mut device = Self {
            config,
            service: None,
            listen_addr,
            boot: BootDecision::Confirmed {
                slot: ota_engine::Slot::A,
            },
            booted_at: Instant::now(),
            health_checked: false,
            boots: 0,
        };
        device.power_on(flash)?;
        Ok(device)
    }

    fn power_on(&mut self, flash: SimFlash) -> Result<()> {
        let listener = TcpTransport::bind(self.listen_addr)
            .with_context(|| format!("Failed to listen on {}", self.listen_addr))?;
        // Keep the port stable across simulated reboots
        self.listen_addr.set_port(listener.local_port());

        let mut service =
            OtaService::new(self.config.engine.clone(), flash, listener, SystemClock)?;
        service.initialize(self.config.identity()?)?;
        service.set_observer(log_event);

        self.boot = service.on_boot()?;
        self.booted_at = Instant::now();
        self.health_checked = !matches!(self.boot, BootDecision::Trial { .. });
        self.boots += 1;

        info!(
            boot = self.boots,
            decision = ?self.boot,
            port = service.port(),
            "Device booted"
        );
        self.service = Some(service);
        Ok(())
    }

    /// One iteration of the device main loop.
    pub fn tick(&mut self) -> Result<UpdateStatus> {
        let service = self.service_mut()?;
        let status = service.poll();
        let reboot = service.take_reboot_request();

        if status.is_terminal() {
            if let Ok(report) = self.service()?.report() {
                info!(report = %serde_json::to_string(&report)?, "Update finished");
            }
        }

        if reboot {
            self.reboot()?;
        } else if !self.health_checked
            && self.booted_at.elapsed() >= Duration::from_millis(self.config.health.delay_ms)
        {
            self.run_health_check()?;
        }
        Ok(status)
    }

    fn run_health_check(&mut self) -> Result<()> {
        self.health_checked = true;
        let policy = self.config.health.policy;
        let service = self.service_mut()?;

        match policy {
            HealthPolicy::Pass => {
                service.confirm_boot()?;
                info!("Health check passed");
                Ok(())
            }
            HealthPolicy::Fail => {
                warn!("Health check failed");
                let decision = service.report_boot_failure()?;
                if let BootDecision::RolledBack { .. } = decision {
                    self.reboot()?;
                }
                Ok(())
            }
        }
    }

    /// Simulated reset: drop every connection, persist flash, boot again.
    pub fn reboot(&mut self) -> Result<()> {
        let service = self
            .service
            .take()
            .context("Reboot while already rebooting")?;
        let flash = service.into_flash();
        info!("Rebooting");

        self.save_flash(&flash)?;
        self.power_on(flash)
    }

    /// Persist flash contents to `state_file`, if configured.
    pub fn save_state(&self) -> Result<()> {
        self.save_flash(self.service()?.flash())
    }

    fn save_flash(&self, flash: &SimFlash) -> Result<()> {
        if let Some(path) = &self.config.state_file {
            std::fs::write(path, flash.as_bytes())
                .with_context(|| format!("Failed to save flash state {}", path.display()))?;
            debug!(path = %path.display(), "Flash state saved");
        }
        Ok(())
    }

    pub fn service(&self) -> Result<&OtaService<SimFlash>> {
        self.service.as_ref().context("Device is rebooting")
    }

    fn service_mut(&mut self) -> Result<&mut OtaService<SimFlash>> {
        self.service.as_mut().context("Device is rebooting")
    }

    pub fn report(&self) -> Result<StatusReport> {
        Ok(self.service()?.report()?)
    }

    pub fn port(&self) -> u16 {
        self.listen_addr.port()
    }

    /// Number of boots since power-on, including simulated reboots.
    pub fn boots(&self) -> u32 {
        self.boots
    }

    pub fn last_boot(&self) -> BootDecision {
        self.boot
    }

    /// Publish record for the discovery responder; the port is always the
    /// one the engine listens on.
    pub fn advertisement(&self) -> Advertisement {
        Advertisement {
            instance: self.config.name.clone(),
            service: "_ota._tcp",
            port: self.port(),
            auth_required: self.config.password.is_some() || self.config.password_hash.is_some(),
        }
    }
}

fn log_event(event: &UpdateEvent) {
    match event {
        UpdateEvent::Started {
            token,
            total_size,
            slot,
        } => info!(token = token, total_size = total_size, slot = %slot, "Update started"),
        UpdateEvent::Progress {
            percent,
            bytes_received,
        } => debug!(percent = percent, bytes = bytes_received, "Update progress"),
        UpdateEvent::Finished { slot, digest } => {
            info!(slot = %slot, digest = %digest, "Update installed")
        }
        UpdateEvent::Aborted { status, reason } => {
            warn!(status = %status, reason = %reason, "Update aborted")
        }
        UpdateEvent::Rejected { status, peer } => {
            warn!(status = %status, peer = %peer, "Update request rejected")
        }
        UpdateEvent::RolledBack { from, to } => {
            warn!(from = %from, to = %to, "Rolled back")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn config() -> DeviceConfig {
        let mut config = DeviceConfig {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..DeviceConfig::default()
        };
        config.engine.port = 0;
        config.health.delay_ms = 0;
        config
    }

    #[test]
    fn test_blank_device_boots_confirmed() {
        let device = SimulatedDevice::start(config()).unwrap();
        assert_eq!(device.boots(), 1);
        assert_eq!(
            device.last_boot(),
            BootDecision::Confirmed {
                slot: ota_engine::Slot::A
            }
        );
        assert_ne!(device.port(), 0);
        assert_eq!(device.advertisement().port, device.port());
    }

    #[test]
    fn test_reboot_keeps_port_and_flash() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config();
        config.state_file = Some(dir.path().join("flash.bin"));

        let mut device = SimulatedDevice::start(config).unwrap();
        let port = device.port();
        device.reboot().unwrap();

        assert_eq!(device.port(), port);
        assert_eq!(device.boots(), 2);
        assert!(dir.path().join("flash.bin").exists());
        assert_eq!(device.tick().unwrap(), UpdateStatus::Idle);
    }

    #[test]
    fn test_save_state_reports_unwritable_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config();
        config.state_file = Some(dir.path().join("missing").join("flash.bin"));

        let device = SimulatedDevice::start(config).unwrap();
        let err = device.save_state().unwrap_err();
        assert!(err.to_string().contains("Failed to save flash state"));
    }

    #[test]
    fn test_advertisement_flags_auth() {
        let mut config = config();
        config.password = Some("pw".into());
        let device = SimulatedDevice::start(config).unwrap();
        let ad = device.advertisement();
        assert!(ad.auth_required);
        assert_eq!(ad.service, "_ota._tcp");
    }
}
