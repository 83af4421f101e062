//! Session manager: the update protocol state machine
//!
//! The manager owns the single in-flight [`UpdateSession`]. Each call to
//! [`SessionManager::step`] runs exactly one state's unit of work:
//!
//! | State            | Work per step                                         |
//! |------------------|-------------------------------------------------------|
//! | `Authenticating` | compare the presented credential                      |
//! | `Starting`       | validate kind/size, erase up to N sectors             |
//! | `Receiving`      | one bounded transfer step, inactivity check           |
//! | `Verifying`      | finalize digest and compare                           |
//! | `Committing`     | switch the boot pointer                               |
//!
//! Terminal states are entered and finalized within the same step: the
//! result frame is sent, the connection closed (or left flushing) and the
//! session dropped.

use std::time::Instant;

use embedded_storage::nor_flash::NorFlash;
use ota_core::{
    DeviceFrame, DeviceIdentity, ImageDigest, ImageKind, ResponseStatus, SessionState,
    UpdateRequest, UpdateResponse, UpdateStatus,
};
use tracing::{debug, info, warn};

use crate::boot::{BootControl, ImageInfo, Slot};
use crate::config::EngineConfig;
use crate::error::OtaError;
use crate::event::UpdateEvent;
use crate::flash::FlashWriter;
use crate::transfer::{TransferEngine, TransferOutcome};
use crate::transport::Connection;
use crate::verify::IntegrityVerifier;

/// State of one firmware transfer
pub struct UpdateSession {
    /// Random identifier echoed to the sender, informational only
    pub token: u32,
    pub state: SessionState,
    pub kind: ImageKind,
    pub total_size: u32,
    pub bytes_received: u32,
    pub expected_digest: ImageDigest,
    pub verifier: IntegrityVerifier,
    pub last_activity: Instant,
    pub target_slot: Slot,
    pub writer: FlashWriter,
    pub(crate) connection: Box<dyn Connection>,
    /// Received bytes not yet decoded into frames
    pub(crate) inbox: Vec<u8>,
    /// Payload bytes waiting for a full write word
    pub(crate) staging: Vec<u8>,
    credential: Option<Vec<u8>>,
    erase_cursor: u32,
    erase_end: u32,
    accepted: bool,
    last_percent: u8,
}

impl UpdateSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        token: u32,
        kind: ImageKind,
        total_size: u32,
        expected_digest: ImageDigest,
        credential: Option<Vec<u8>>,
        connection: Box<dyn Connection>,
        target_slot: Slot,
        writer: FlashWriter,
        now: Instant,
    ) -> Self {
        Self {
            token,
            state: SessionState::Idle,
            kind,
            total_size,
            bytes_received: 0,
            expected_digest,
            verifier: IntegrityVerifier::new(),
            last_activity: now,
            target_slot,
            writer,
            connection,
            inbox: Vec::new(),
            staging: Vec::new(),
            credential,
            erase_cursor: 0,
            erase_end: 0,
            accepted: false,
            last_percent: 0,
        }
    }

    pub fn percent(&self) -> u8 {
        if self.total_size == 0 {
            return 0;
        }
        (self.bytes_received as u64 * 100 / self.total_size as u64) as u8
    }

    pub fn peer(&self) -> String {
        self.connection.peer()
    }

    fn transition(&mut self, next: SessionState) {
        info!(
            token = self.token,
            from = %self.state,
            to = %next,
            "Session state change"
        );
        self.state = next;
    }
}

// =============================================================================
// Session Manager
// =============================================================================

pub struct SessionManager {
    config: EngineConfig,
    identity: DeviceIdentity,
    boot: BootControl,
    transfer: TransferEngine,
    session: Option<UpdateSession>,
    /// Closed connections still flushing their last frames
    closing: Vec<Box<dyn Connection>>,
    events: Vec<UpdateEvent>,
    reboot_requested: bool,
}

impl SessionManager {
    pub fn new(config: EngineConfig, identity: DeviceIdentity, boot: BootControl) -> Self {
        let transfer = TransferEngine::new(&config);
        Self {
            config,
            identity,
            boot,
            transfer,
            session: None,
            closing: Vec::new(),
            events: Vec::new(),
            reboot_requested: false,
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn boot(&self) -> &BootControl {
        &self.boot
    }

    pub fn boot_mut(&mut self) -> &mut BootControl {
        &mut self.boot
    }

    pub fn session(&self) -> Option<&UpdateSession> {
        self.session.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn state(&self) -> SessionState {
        self.session
            .as_ref()
            .map_or(SessionState::Idle, |s| s.state)
    }

    /// Status of the in-flight session, `Idle` without one.
    pub fn status(&self) -> UpdateStatus {
        self.session
            .as_ref()
            .map_or(UpdateStatus::Idle, |s| UpdateStatus::InProgress(s.percent()))
    }

    pub fn drain_events(&mut self) -> Vec<UpdateEvent> {
        std::mem::take(&mut self.events)
    }

    /// Connections closed but not yet fully shut down.
    pub fn closing_connections(&self) -> usize {
        self.closing.len()
    }

    /// Close `connection`, keeping it until its output is flushed.
    pub(crate) fn retire(&mut self, mut connection: Box<dyn Connection>) {
        connection.close();
        if !connection.poll_close() {
            self.closing.push(connection);
        }
    }

    /// Consume a pending reboot request.
    pub fn take_reboot_request(&mut self) -> bool {
        std::mem::take(&mut self.reboot_requested)
    }

    /// Handle an update request. A request while a session exists is
    /// answered with `Busy` and leaves that session untouched.
    pub fn open(
        &mut self,
        request: UpdateRequest,
        mut connection: Box<dyn Connection>,
        leftover: &[u8],
        now: Instant,
    ) -> UpdateStatus {
        let peer = connection.peer();

        if let Some(active) = &self.session {
            warn!(
                peer = %peer,
                active_token = active.token,
                "Update request rejected, session in progress"
            );
            let busy = DeviceFrame::Response(UpdateResponse::rejected(ResponseStatus::Busy));
            if let Err(e) = connection.send(&busy.encode()) {
                debug!(peer = %peer, error = %e, "Could not deliver busy response");
            }
            self.retire(connection);
            self.events.push(UpdateEvent::Rejected {
                status: UpdateStatus::Busy,
                peer,
            });
            return UpdateStatus::Busy;
        }

        let target = self.boot.inactive_slot();
        let writer = FlashWriter::new(self.boot.slot_region(target));
        let mut session = UpdateSession::new(
            rand::random(),
            request.kind,
            request.total_size,
            request.digest,
            request.credential,
            connection,
            target,
            writer,
            now,
        );
        session.inbox.extend_from_slice(leftover);

        info!(
            token = session.token,
            peer = %peer,
            kind = request.kind.command(),
            total_size = request.total_size,
            slot = %target,
            "Update session opened"
        );

        let next = if self.identity.requires_auth() {
            SessionState::Authenticating
        } else {
            SessionState::Starting
        };
        session.transition(next);
        self.session = Some(session);
        UpdateStatus::InProgress(0)
    }

    /// Advance the session by one unit of work.
    pub fn step<F: NorFlash>(&mut self, flash: &mut F, now: Instant) -> UpdateStatus {
        self.closing.retain_mut(|connection| !connection.poll_close());

        let Some(mut session) = self.session.take() else {
            return UpdateStatus::Idle;
        };

        let result = match session.state {
            SessionState::Authenticating => self.authenticate(&mut session),
            SessionState::Starting => self.prepare(&mut session, flash, now),
            SessionState::Receiving => self.receive(&mut session, flash, now),
            SessionState::Verifying => self.verify(&mut session),
            SessionState::Committing => self.commit(&mut session, flash),
            state => Err(OtaError::ReceiveFailed(format!(
                "session stored in state {}",
                state
            ))),
        };

        match result {
            Ok(()) if session.state == SessionState::Rebooting => self.finish(session),
            Ok(()) => {
                let status = UpdateStatus::InProgress(session.percent());
                self.session = Some(session);
                status
            }
            Err(e) => self.abort(session, e),
        }
    }

    fn authenticate(&mut self, session: &mut UpdateSession) -> Result<(), OtaError> {
        let presented = session.credential.take().unwrap_or_default();
        if let Some(credential) = &self.identity.credential {
            if !credential.verify(&presented) {
                return Err(OtaError::AuthFailed(format!(
                    "credential from {} rejected",
                    session.peer()
                )));
            }
        }
        debug!(token = session.token, "Credential accepted");
        session.transition(SessionState::Starting);
        Ok(())
    }

    fn prepare<F: NorFlash>(
        &mut self,
        session: &mut UpdateSession,
        flash: &mut F,
        now: Instant,
    ) -> Result<(), OtaError> {
        if session.erase_end == 0 {
            self.check_request(session)?;
            let sector = F::ERASE_SIZE as u32;
            session.erase_end = session.total_size.div_ceil(sector) * sector;
        }

        let sector = F::ERASE_SIZE as u32;
        let remaining = (session.erase_end - session.erase_cursor) / sector;
        let sectors = remaining.min(self.config.erase_sectors_per_poll);
        if sectors > 0 {
            let offset = session.erase_cursor;
            session
                .writer
                .erase(flash, offset, sectors * sector)
                .map_err(|e| OtaError::BeginFailed(format!("erase failed: {}", e)))?;
            session.erase_cursor += sectors * sector;
            debug!(
                erased = session.erase_cursor,
                total = session.erase_end,
                "Preparing target slot"
            );
        }

        if session.erase_cursor < session.erase_end {
            return Ok(());
        }

        let response = DeviceFrame::Response(UpdateResponse::accepted(session.token));
        session
            .connection
            .send(&response.encode())
            .map_err(|e| OtaError::BeginFailed(format!("cannot answer request: {}", e)))?;
        session.accepted = true;
        session.last_activity = now;
        self.events.push(UpdateEvent::Started {
            token: session.token,
            total_size: session.total_size,
            slot: session.target_slot,
        });
        session.transition(SessionState::Receiving);
        Ok(())
    }

    fn check_request(&self, session: &UpdateSession) -> Result<(), OtaError> {
        if session.kind != ImageKind::Firmware {
            return Err(OtaError::BeginFailed(format!(
                "image kind 0x{:02X} not supported",
                session.kind.command()
            )));
        }
        if session.total_size == 0 {
            return Err(OtaError::BeginFailed("empty image".into()));
        }
        let region = session.writer.region();
        if session.total_size > region.size {
            return Err(OtaError::BeginFailed(format!(
                "image of {} bytes exceeds slot {} of {} bytes",
                session.total_size, session.target_slot, region.size
            )));
        }
        if self.boot.in_trial() {
            return Err(OtaError::BeginFailed(format!(
                "slot {} still awaiting boot confirmation",
                self.boot.active_slot()
            )));
        }
        Ok(())
    }

    fn receive<F: NorFlash>(
        &mut self,
        session: &mut UpdateSession,
        flash: &mut F,
        now: Instant,
    ) -> Result<(), OtaError> {
        match self.transfer.step(session, flash, now) {
            TransferOutcome::Progressed => {
                self.report_progress(session);
                Ok(())
            }
            TransferOutcome::Complete => {
                self.report_progress(session);
                info!(
                    token = session.token,
                    total_received = session.bytes_received,
                    "Image received"
                );
                session.transition(SessionState::Verifying);
                Ok(())
            }
            TransferOutcome::WouldBlock => {
                let timeout = self.config.inactivity_timeout();
                if now.saturating_duration_since(session.last_activity) > timeout {
                    return Err(OtaError::Timeout(timeout));
                }
                Ok(())
            }
            TransferOutcome::Failed(e) => Err(e),
        }
    }

    fn report_progress(&mut self, session: &mut UpdateSession) {
        let percent = session.percent();
        if percent != session.last_percent {
            session.last_percent = percent;
            self.events.push(UpdateEvent::Progress {
                percent,
                bytes_received: session.bytes_received,
            });
        }
    }

    fn verify(&mut self, session: &mut UpdateSession) -> Result<(), OtaError> {
        let actual = session.verifier.finalize()?;
        if actual != session.expected_digest {
            return Err(OtaError::VerifyFailed {
                expected: session.expected_digest,
                actual,
            });
        }
        info!(token = session.token, digest = %actual, "Image digest verified");
        session.transition(SessionState::Committing);
        Ok(())
    }

    fn commit<F: NorFlash>(
        &mut self,
        session: &mut UpdateSession,
        flash: &mut F,
    ) -> Result<(), OtaError> {
        let image = ImageInfo {
            size: session.total_size,
            digest: session.expected_digest,
        };
        self.boot.commit(flash, session.target_slot, image)?;

        let result = DeviceFrame::Result(UpdateStatus::Success);
        if let Err(e) = session.connection.send(&result.encode()) {
            warn!(token = session.token, error = %e, "Could not deliver success result");
        }
        session.transition(SessionState::Rebooting);
        Ok(())
    }

    fn finish(&mut self, session: UpdateSession) -> UpdateStatus {
        self.reboot_requested = true;
        self.events.push(UpdateEvent::Finished {
            slot: session.target_slot,
            digest: session.expected_digest,
        });
        info!(
            token = session.token,
            slot = %session.target_slot,
            "Update installed, reboot scheduled"
        );
        self.retire(session.connection);
        UpdateStatus::Success
    }

    fn abort(&mut self, mut session: UpdateSession, error: OtaError) -> UpdateStatus {
        let status = error.status();
        let reason = error.to_string();
        warn!(
            token = session.token,
            state = %session.state,
            status = %status,
            total_received = session.bytes_received,
            total_expected = session.total_size,
            reason = %reason,
            "Update session aborted"
        );
        if status == UpdateStatus::CommitFailed {
            warn!(slot = %self.boot.active_slot(), "Previous slot remains active");
        }

        let frame = if session.accepted {
            DeviceFrame::Result(status)
        } else {
            let rejected = match status {
                UpdateStatus::AuthFailed => ResponseStatus::AuthFailed,
                _ => ResponseStatus::BeginFailed,
            };
            DeviceFrame::Response(UpdateResponse::rejected(rejected))
        };
        if let Err(e) = session.connection.send(&frame.encode()) {
            debug!(token = session.token, error = %e, "Could not deliver abort status");
        }
        session.transition(SessionState::Aborted);
        self.retire(session.connection);

        self.events.push(UpdateEvent::Aborted { status, reason });
        status
    }
}
