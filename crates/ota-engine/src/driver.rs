//! Polling driver: the entry point called from the host's main loop
//!
//! ```ignore
//! let mut service = OtaService::new(config, flash, listener, SystemClock)?;
//! service.initialize(DeviceIdentity::with_password("sensor-1", "secret"))?;
//! loop {
//!     service.poll();
//!     if service.take_reboot_request() {
//!         reboot();
//!     }
//!     // other device duties
//! }
//! ```

use std::time::{Duration, Instant};

use embedded_storage::nor_flash::NorFlash;
use ota_core::{DeviceIdentity, SenderFrame, SessionState, UpdateRequest, UpdateStatus};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::boot::{BootControl, BootDecision, BootPhase, ImageInfo, Slot};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{OtaError, OtaResult};
use crate::event::{Observer, UpdateEvent};
use crate::session::SessionManager;
use crate::transport::{Connection, Listener};

/// Read size while waiting for a request frame
const REQUEST_READ_LEN: usize = 512;

/// Connection that has not sent its request yet
struct PendingConnection {
    connection: Box<dyn Connection>,
    inbox: Vec<u8>,
    opened: Instant,
}

enum PendingPoll {
    Waiting,
    Request(UpdateRequest, Vec<u8>),
    Failed(String),
}

impl PendingConnection {
    fn poll_request(&mut self, max_chunk_size: usize) -> PendingPoll {
        let mut buf = [0u8; REQUEST_READ_LEN];
        match self.connection.recv(&mut buf) {
            Ok(n) => self.inbox.extend_from_slice(&buf[..n]),
            Err(e) => return PendingPoll::Failed(e.to_string()),
        }

        match SenderFrame::decode(&self.inbox, max_chunk_size) {
            Ok(Some((SenderFrame::Request(request), used))) => {
                PendingPoll::Request(request, self.inbox.split_off(used))
            }
            Ok(Some((frame, _))) => {
                PendingPoll::Failed(format!("expected update request, got {:?}", frame))
            }
            Ok(None) => PendingPoll::Waiting,
            Err(e) => PendingPoll::Failed(e.to_string()),
        }
    }
}

/// Snapshot for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub device: String,
    pub port: u16,
    pub state: SessionState,
    pub status: UpdateStatus,
    pub active_slot: Slot,
    pub boot_phase: BootPhase,
    pub running_image: Option<ImageInfo>,
    pub last_outcome: Option<UpdateStatus>,
}

/// OTA update service
///
/// Owns the flash device, the listener and the session manager. Nothing
/// happens between calls to [`poll`](Self::poll).
pub struct OtaService<F: NorFlash> {
    config: EngineConfig,
    flash: F,
    listener: Box<dyn Listener>,
    clock: Box<dyn Clock>,
    manager: Option<SessionManager>,
    pending: Vec<PendingConnection>,
    observer: Option<Observer>,
    last_outcome: Option<UpdateStatus>,
}

impl<F: NorFlash> OtaService<F> {
    /// Create the service. The configuration is checked against the flash
    /// geometry; nothing is read from flash until [`initialize`](Self::initialize).
    pub fn new(
        config: EngineConfig,
        flash: F,
        listener: impl Listener + 'static,
        clock: impl Clock + 'static,
    ) -> OtaResult<Self> {
        config.validate(F::WRITE_SIZE, F::ERASE_SIZE, flash.capacity())?;
        Ok(Self {
            config,
            flash,
            listener: Box::new(listener),
            clock: Box::new(clock),
            manager: None,
            pending: Vec::new(),
            observer: None,
            last_outcome: None,
        })
    }

    /// Load the boot record and bind the device identity.
    ///
    /// Calling it again has no further effect; the first identity stays.
    pub fn initialize(&mut self, identity: DeviceIdentity) -> OtaResult<()> {
        if let Some(manager) = &self.manager {
            if manager.identity().name != identity.name {
                warn!(
                    current = %manager.identity().name,
                    ignored = %identity.name,
                    "Already initialized, keeping original identity"
                );
            } else {
                debug!("Already initialized");
            }
            return Ok(());
        }

        let boot = BootControl::load(
            &mut self.flash,
            &self.config.layout,
            self.config.max_boot_attempts,
        )?;
        info!(
            device = %identity.name,
            port = self.listener.local_port(),
            active_slot = %boot.active_slot(),
            auth = identity.requires_auth(),
            "OTA service initialized"
        );
        self.manager = Some(SessionManager::new(self.config.clone(), identity, boot));
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.manager.is_some()
    }

    /// Advance the engine by one bounded step. Never blocks: closed
    /// connections with unsent output are flushed over later polls.
    pub fn poll(&mut self) -> UpdateStatus {
        if self.manager.is_none() {
            return UpdateStatus::Idle;
        }
        let now = self.clock.now();

        self.accept_connections(now);
        self.service_pending(now);

        let status = match self.manager.as_mut() {
            Some(manager) => manager.step(&mut self.flash, now),
            None => UpdateStatus::Idle,
        };
        if status.is_terminal() {
            self.last_outcome = Some(status);
        }

        self.dispatch_events();
        status
    }

    fn accept_connections(&mut self, now: Instant) {
        let limit = self.config.max_pending_connections;
        for _ in 0..=limit {
            let connection = match self.listener.accept() {
                Ok(Some(connection)) => connection,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    break;
                }
            };
            if self.pending.len() >= limit {
                warn!(
                    peer = %connection.peer(),
                    pending = self.pending.len(),
                    "Too many pending connections, dropping"
                );
                self.retire(connection);
                continue;
            }
            debug!(peer = %connection.peer(), "Connection pending request");
            self.pending.push(PendingConnection {
                connection,
                inbox: Vec::new(),
                opened: now,
            });
        }
    }

    fn service_pending(&mut self, now: Instant) {
        let timeout = self.config.inactivity_timeout();
        let max_chunk = self.config.max_chunk_size;

        let mut i = 0;
        while i < self.pending.len() {
            match self.pending[i].poll_request(max_chunk) {
                PendingPoll::Waiting => {
                    if now.saturating_duration_since(self.pending[i].opened) > timeout {
                        let pending = self.pending.remove(i);
                        warn!(
                            peer = %pending.connection.peer(),
                            "No update request received, closing"
                        );
                        self.retire(pending.connection);
                    } else {
                        i += 1;
                    }
                }
                PendingPoll::Request(request, leftover) => {
                    let pending = self.pending.remove(i);
                    if let Some(manager) = self.manager.as_mut() {
                        manager.open(request, pending.connection, &leftover, now);
                    }
                }
                PendingPoll::Failed(reason) => {
                    let pending = self.pending.remove(i);
                    warn!(
                        peer = %pending.connection.peer(),
                        reason = %reason,
                        "Dropping connection"
                    );
                    self.retire(pending.connection);
                }
            }
        }
    }

    fn retire(&mut self, mut connection: Box<dyn Connection>) {
        match self.manager.as_mut() {
            Some(manager) => manager.retire(connection),
            None => connection.close(),
        }
    }

    fn dispatch_events(&mut self) {
        let events = match self.manager.as_mut() {
            Some(manager) => manager.drain_events(),
            None => return,
        };
        for event in events {
            self.emit(event);
        }
    }

    fn emit(&mut self, event: UpdateEvent) {
        debug!(event = ?event, "Update event");
        if let Some(observer) = self.observer.as_mut() {
            observer(&event);
        }
    }

    /// Register a callback for [`UpdateEvent`]s, replacing any previous one.
    pub fn set_observer(&mut self, observer: impl FnMut(&UpdateEvent) + Send + 'static) {
        self.observer = Some(Box::new(observer));
    }

    /// True once after a successful update; the host should reboot.
    pub fn take_reboot_request(&mut self) -> bool {
        self.manager
            .as_mut()
            .map_or(false, SessionManager::take_reboot_request)
    }

    // =========================================================================
    // Boot-health lifecycle
    // =========================================================================

    /// Count a boot of the active image. Call once per startup, after
    /// [`initialize`](Self::initialize).
    pub fn on_boot(&mut self) -> OtaResult<BootDecision> {
        let manager = self.manager.as_mut().ok_or(OtaError::NotInitialized)?;
        let decision = manager.boot_mut().on_boot(&mut self.flash)?;
        if let BootDecision::RolledBack { from, to } = decision {
            self.emit(UpdateEvent::RolledBack { from, to });
        }
        Ok(decision)
    }

    /// The boot-health check passed.
    pub fn confirm_boot(&mut self) -> OtaResult<bool> {
        let manager = self.manager.as_mut().ok_or(OtaError::NotInitialized)?;
        manager.boot_mut().confirm_boot(&mut self.flash)
    }

    /// The boot-health check failed; roll back if the image is on trial.
    pub fn report_boot_failure(&mut self) -> OtaResult<BootDecision> {
        let manager = self.manager.as_mut().ok_or(OtaError::NotInitialized)?;
        let decision = manager.boot_mut().report_boot_failure(&mut self.flash)?;
        if let BootDecision::RolledBack { from, to } = decision {
            self.emit(UpdateEvent::RolledBack { from, to });
        }
        Ok(decision)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn status(&self) -> UpdateStatus {
        self.manager
            .as_ref()
            .map_or(UpdateStatus::Idle, SessionManager::status)
    }

    pub fn state(&self) -> SessionState {
        self.manager
            .as_ref()
            .map_or(SessionState::Idle, SessionManager::state)
    }

    pub fn last_outcome(&self) -> Option<UpdateStatus> {
        self.last_outcome
    }

    pub fn active_slot(&self) -> Option<Slot> {
        self.manager.as_ref().map(|m| m.boot().active_slot())
    }

    pub fn running_image(&self) -> Option<ImageInfo> {
        self.manager.as_ref().and_then(|m| m.boot().running_image())
    }

    pub fn port(&self) -> u16 {
        self.listener.local_port()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Connections waiting for their request frame.
    pub fn pending_connections(&self) -> usize {
        self.pending.len()
    }

    /// Closed connections still flushing their final frames.
    pub fn closing_connections(&self) -> usize {
        self.manager
            .as_ref()
            .map_or(0, SessionManager::closing_connections)
    }

    pub fn report(&self) -> OtaResult<StatusReport> {
        let manager = self.manager.as_ref().ok_or(OtaError::NotInitialized)?;
        let boot = manager.boot();
        Ok(StatusReport {
            device: manager.identity().name.clone(),
            port: self.port(),
            state: manager.state(),
            status: manager.status(),
            active_slot: boot.active_slot(),
            boot_phase: boot.record().phase,
            running_image: boot.running_image(),
            last_outcome: self.last_outcome,
        })
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    /// Tear the service down and hand back the flash, e.g. to simulate a
    /// reboot.
    pub fn into_flash(self) -> F {
        self.flash
    }

    /// Time since the active session last received data.
    pub fn idle_for(&self) -> Option<Duration> {
        let session = self.manager.as_ref()?.session()?;
        Some(self.clock.now().saturating_duration_since(session.last_activity))
    }
}
