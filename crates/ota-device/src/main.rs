//! OTA Device Simulator
//!
//! Runs the update engine behind a TCP listener, as a device would.
//!
//! # Usage
//!
//! ```bash
//! ./ota-device --port 8266 --password secret
//! ```
//!
//! With config file:
//! ```bash
//! ./ota-device --config config/device.toml
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use ota_core::UpdateStatus;
use ota_device::{DeviceConfig, HealthPolicy, SimulatedDevice};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Main loop sleep when no session is active
const IDLE_SLEEP: Duration = Duration::from_millis(10);

#[derive(Parser, Debug)]
#[command(name = "ota-device")]
#[command(about = "Simulated device accepting network firmware updates")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<String>,

    /// Device name
    #[arg(short, long)]
    name: Option<String>,

    /// Update port
    #[arg(short, long)]
    port: Option<u16>,

    /// Update password
    #[arg(long)]
    password: Option<String>,

    /// File to persist simulated flash contents
    #[arg(long)]
    state_file: Option<String>,

    /// Fail the boot-health check so new images are rolled back
    #[arg(long)]
    fail_health_check: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        "ota_device=debug,ota_engine=debug"
    } else {
        "ota_device=info,ota_engine=info"
    };
    if args.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let mut config = if let Some(config_path) = &args.config {
        info!("Loading config from: {}", config_path);
        DeviceConfig::load(config_path)?
    } else {
        DeviceConfig::default()
    };
    if let Some(name) = args.name {
        config.name = name;
    }
    if let Some(port) = args.port {
        config.engine.port = port;
    }
    if let Some(password) = args.password {
        config.password = Some(password);
        config.password_hash = None;
    }
    if let Some(state_file) = args.state_file {
        config.state_file = Some(state_file.into());
    }
    if args.fail_health_check {
        config.health.policy = HealthPolicy::Fail;
    }

    info!(
        name = %config.name,
        listen = %config.listen_addr(),
        flash_size = config.flash_size,
        "Starting OTA device simulator"
    );

    let mut device = SimulatedDevice::start(config)?;
    let ad = device.advertisement();
    info!(
        instance = %ad.instance,
        service = ad.service,
        port = ad.port,
        auth = ad.auth_required,
        "Advertising update endpoint"
    );
    info!("Press Ctrl+C to stop");

    let running = Arc::new(AtomicBool::new(true));
    let running_for_loop = running.clone();
    let main_handle: JoinHandle<Result<()>> = tokio::task::spawn_blocking(move || {
        while running_for_loop.load(Ordering::SeqCst) {
            match device.tick() {
                Ok(UpdateStatus::InProgress(_)) => {}
                Ok(_) => std::thread::sleep(IDLE_SLEEP),
                Err(e) => {
                    error!(error = %e, "Device loop error");
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }
        device.save_state()
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    running.store(false, Ordering::SeqCst);

    match tokio::time::timeout(Duration::from_secs(2), main_handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!(error = %e, "Failed to save flash state"),
        Ok(Err(e)) => error!(error = %e, "Device loop panicked"),
        Err(_) => error!("Device loop did not stop in time"),
    }
    info!("OTA device simulator stopped");
    Ok(())
}
