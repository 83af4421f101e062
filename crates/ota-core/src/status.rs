//! Update status codes and session states

use serde::{Deserialize, Serialize};

/// Result code surfaced to the hosting application and to the sender.
///
/// `InProgress` carries the transfer completion percentage (0-100).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "percent", rename_all = "snake_case")]
pub enum UpdateStatus {
    /// No session exists
    Idle,
    /// A session is running
    InProgress(u8),
    /// Image verified and committed, reboot scheduled
    Success,
    /// Presented credential did not match the device identity
    AuthFailed,
    /// Declared size did not fit or the target region could not be prepared
    BeginFailed,
    /// Transport, framing or overflow failure during transfer
    ReceiveFailed,
    /// No bytes arrived within the inactivity threshold
    Timeout,
    /// Running digest did not match the declared digest
    VerifyFailed,
    /// Boot region switch failed
    CommitFailed,
    /// A request arrived while another session was active
    Busy,
}

impl UpdateStatus {
    /// Single-byte code used in `RESULT` frames.
    pub fn code(&self) -> u8 {
        match self {
            UpdateStatus::Idle => 0x00,
            UpdateStatus::InProgress(_) => 0x01,
            UpdateStatus::Success => 0x02,
            UpdateStatus::AuthFailed => 0x10,
            UpdateStatus::BeginFailed => 0x11,
            UpdateStatus::ReceiveFailed => 0x12,
            UpdateStatus::Timeout => 0x13,
            UpdateStatus::VerifyFailed => 0x14,
            UpdateStatus::CommitFailed => 0x15,
            UpdateStatus::Busy => 0x16,
        }
    }

    /// Decode a `RESULT` code. Progress percentage is not carried on the wire.
    pub fn from_code(code: u8) -> Option<Self> {
        let status = match code {
            0x00 => UpdateStatus::Idle,
            0x01 => UpdateStatus::InProgress(0),
            0x02 => UpdateStatus::Success,
            0x10 => UpdateStatus::AuthFailed,
            0x11 => UpdateStatus::BeginFailed,
            0x12 => UpdateStatus::ReceiveFailed,
            0x13 => UpdateStatus::Timeout,
            0x14 => UpdateStatus::VerifyFailed,
            0x15 => UpdateStatus::CommitFailed,
            0x16 => UpdateStatus::Busy,
            _ => return None,
        };
        Some(status)
    }

    /// True for outcomes that end a session.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, UpdateStatus::Idle | UpdateStatus::InProgress(_))
    }

    /// True for every terminal outcome other than `Success`.
    pub fn is_failure(&self) -> bool {
        self.is_terminal() && *self != UpdateStatus::Success
    }
}

impl std::fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateStatus::Idle => f.write_str("idle"),
            UpdateStatus::InProgress(percent) => write!(f, "in_progress({}%)", percent),
            UpdateStatus::Success => f.write_str("success"),
            UpdateStatus::AuthFailed => f.write_str("auth_failed"),
            UpdateStatus::BeginFailed => f.write_str("begin_failed"),
            UpdateStatus::ReceiveFailed => f.write_str("receive_failed"),
            UpdateStatus::Timeout => f.write_str("timeout"),
            UpdateStatus::VerifyFailed => f.write_str("verify_failed"),
            UpdateStatus::CommitFailed => f.write_str("commit_failed"),
            UpdateStatus::Busy => f.write_str("busy"),
        }
    }
}

/// Protocol state of the single update session.
///
/// # Lifecycle
///
/// ```text
/// Idle → Authenticating → Starting → Receiving → Verifying → Committing
///          (credential     │            │            │            │
///           configured)    │            │            │            ▼
///                          └────────────┴────────────┴──────▶ Aborted / Rebooting
/// ```
///
/// `Rebooting` and `Aborted` are terminal: the session is destroyed and the
/// engine returns to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Authenticating,
    Starting,
    Receiving,
    Verifying,
    Committing,
    Rebooting,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Rebooting | SessionState::Aborted)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Authenticating => "authenticating",
            SessionState::Starting => "starting",
            SessionState::Receiving => "receiving",
            SessionState::Verifying => "verifying",
            SessionState::Committing => "committing",
            SessionState::Rebooting => "rebooting",
            SessionState::Aborted => "aborted",
        };
        f.write_str(s)
    }
}
