//! Progress notifications delivered to the host application

use ota_core::{ImageDigest, UpdateStatus};
use serde::Serialize;

use crate::boot::Slot;

/// Something the host may want to show or log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum UpdateEvent {
    /// Request accepted, target slot prepared
    Started {
        token: u32,
        total_size: u32,
        slot: Slot,
    },
    /// Completion percentage changed
    Progress { percent: u8, bytes_received: u32 },
    /// Image verified and committed; reboot requested
    Finished { slot: Slot, digest: ImageDigest },
    /// Session ended without installing anything
    Aborted { status: UpdateStatus, reason: String },
    /// Request refused without opening a session
    Rejected { status: UpdateStatus, peer: String },
    /// Trial image failed its health check
    RolledBack { from: Slot, to: Slot },
}

/// Callback registered with [`OtaService::set_observer`](crate::OtaService::set_observer)
pub type Observer = Box<dyn FnMut(&UpdateEvent) + Send>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json() {
        let json = serde_json::to_value(UpdateEvent::Progress {
            percent: 50,
            bytes_received: 512,
        })
        .unwrap();
        assert_eq!(json["event"], "progress");
        assert_eq!(json["percent"], 50);

        let json = serde_json::to_value(UpdateEvent::Aborted {
            status: UpdateStatus::Timeout,
            reason: "idle".into(),
        })
        .unwrap();
        assert_eq!(json["event"], "aborted");
        assert_eq!(json["status"]["status"], "timeout");
    }
}
