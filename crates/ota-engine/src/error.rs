//! Update engine errors

use std::time::Duration;

use ota_core::{ImageDigest, UpdateStatus, WireError};
use thiserror::Error;

use crate::flash::FlashFault;
use crate::transport::TransportError;

/// Errors raised while running an update session
#[derive(Debug, Error)]
pub enum OtaError {
    /// Presented credential did not match
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Capacity check or region preparation failed
    #[error("Cannot begin update: {0}")]
    BeginFailed(String),

    /// Transport, framing or overflow failure
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// No data arrived within the inactivity threshold
    #[error("No data received for {0:?}")]
    Timeout(Duration),

    /// Running digest did not match the declared one
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    VerifyFailed {
        expected: ImageDigest,
        actual: ImageDigest,
    },

    /// Boot record could not be switched
    #[error("Commit failed: {0}")]
    CommitFailed(String),

    /// Bounds or alignment violation on the target region
    #[error("Flash fault: {0}")]
    FlashFault(#[from] FlashFault),

    /// Another session is active
    #[error("Update already in progress")]
    Busy,

    /// Digest requested twice within one session
    #[error("Digest already finalized for this session")]
    DigestConsumed,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Wire format error: {0}")]
    Wire(#[from] WireError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Engine not initialized")]
    NotInitialized,
}

impl OtaError {
    /// Status code reported upward for this error when it ends a session.
    pub fn status(&self) -> UpdateStatus {
        match self {
            OtaError::AuthFailed(_) => UpdateStatus::AuthFailed,
            OtaError::BeginFailed(_) | OtaError::Config(_) | OtaError::NotInitialized => {
                UpdateStatus::BeginFailed
            }
            OtaError::ReceiveFailed(_)
            | OtaError::FlashFault(_)
            | OtaError::Transport(_)
            | OtaError::Wire(_) => UpdateStatus::ReceiveFailed,
            OtaError::Timeout(_) => UpdateStatus::Timeout,
            OtaError::VerifyFailed { .. } | OtaError::DigestConsumed => UpdateStatus::VerifyFailed,
            OtaError::CommitFailed(_) => UpdateStatus::CommitFailed,
            OtaError::Busy => UpdateStatus::Busy,
        }
    }
}

pub type OtaResult<T> = Result<T, OtaError>;
