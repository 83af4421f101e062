//! ota-core - Core types and wire format for network firmware updates
//!
//! This crate holds everything the device-side engine and any sending tool
//! must agree on: status codes, session states, the image digest, the device
//! identity used for authentication, and the binary control-channel codec.

pub mod digest;
pub mod identity;
pub mod status;
pub mod wire;

pub use digest::{ImageDigest, DIGEST_LEN};
pub use identity::{Credential, DeviceIdentity};
pub use status::{SessionState, UpdateStatus};
pub use wire::{
    ChunkFrame, DeviceFrame, ImageKind, ResponseStatus, SenderFrame, UpdateRequest,
    UpdateResponse, WireError,
};
