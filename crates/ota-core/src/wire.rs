//! Control channel wire format
//!
//! All integers are big-endian. Every frame starts with a one-byte kind.
//!
//! ```text
//! Sender → device
//!   0x01 REQUEST  command:u8 total_size:u32 digest:[u8;32] cred_len:u8 credential
//!   0x02 CHUNK    offset:u32 length:u16 payload[length]
//!   0x03 END
//!   0x04 ABORT
//!
//! Device → sender
//!   0x81 RESPONSE status:u8 [token:u32 when status == OK]
//!   0x82 ACK      bytes_received:u32
//!   0x83 RESULT   status:u8   (UpdateStatus code)
//! ```
//!
//! Decoders are incremental: they return `Ok(None)` until a complete frame
//! is buffered, and report how many bytes the decoded frame consumed.

use thiserror::Error;

use crate::digest::{ImageDigest, DIGEST_LEN};
use crate::status::UpdateStatus;

/// Frame kind bytes
pub mod frame_kind {
    pub const REQUEST: u8 = 0x01;
    pub const CHUNK: u8 = 0x02;
    pub const END: u8 = 0x03;
    pub const ABORT: u8 = 0x04;
    pub const RESPONSE: u8 = 0x81;
    pub const ACK: u8 = 0x82;
    pub const RESULT: u8 = 0x83;
}

/// REQUEST bytes up to and including `cred_len`.
pub const REQUEST_HEADER_LEN: usize = 1 + 1 + 4 + DIGEST_LEN + 1;
/// CHUNK bytes before the payload.
pub const CHUNK_HEADER_LEN: usize = 1 + 4 + 2;
/// Longest credential a REQUEST can carry.
pub const MAX_CREDENTIAL_LEN: usize = u8::MAX as usize;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Unknown frame kind 0x{0:02X}")]
    UnknownFrame(u8),

    #[error("Chunk payload of {length} bytes exceeds maximum {max}")]
    PayloadTooLarge { length: usize, max: usize },

    #[error("Empty chunk payload")]
    EmptyChunk,

    #[error("Invalid status code 0x{0:02X}")]
    InvalidStatus(u8),

    #[error("Credential of {0} bytes exceeds 255")]
    CredentialTooLong(usize),
}

/// What kind of image a request carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Firmware,
    Filesystem,
    Other(u8),
}

impl ImageKind {
    pub fn command(&self) -> u8 {
        match self {
            ImageKind::Firmware => 0x00,
            ImageKind::Filesystem => 0x64,
            ImageKind::Other(c) => *c,
        }
    }

    pub fn from_command(command: u8) -> Self {
        match command {
            0x00 => ImageKind::Firmware,
            0x64 => ImageKind::Filesystem,
            c => ImageKind::Other(c),
        }
    }
}

/// Update request opening a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRequest {
    pub kind: ImageKind,
    pub total_size: u32,
    pub digest: ImageDigest,
    pub credential: Option<Vec<u8>>,
}

impl UpdateRequest {
    /// Firmware request for a complete in-memory image.
    pub fn for_image(image: &[u8]) -> Self {
        Self {
            kind: ImageKind::Firmware,
            total_size: image.len() as u32,
            digest: ImageDigest::of(image),
            credential: None,
        }
    }

    pub fn with_credential(mut self, credential: &[u8]) -> Self {
        self.credential = Some(credential.to_vec());
        self
    }
}

/// One slice of the image at a byte offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    pub offset: u32,
    pub payload: Vec<u8>,
}

/// Frames sent to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderFrame {
    Request(UpdateRequest),
    Chunk(ChunkFrame),
    End,
    Abort,
}

impl SenderFrame {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        match self {
            SenderFrame::Request(req) => {
                let credential = req.credential.as_deref().unwrap_or(&[]);
                if credential.len() > MAX_CREDENTIAL_LEN {
                    return Err(WireError::CredentialTooLong(credential.len()));
                }
                let mut buf = Vec::with_capacity(REQUEST_HEADER_LEN + credential.len());
                buf.push(frame_kind::REQUEST);
                buf.push(req.kind.command());
                buf.extend_from_slice(&req.total_size.to_be_bytes());
                buf.extend_from_slice(req.digest.as_bytes());
                buf.push(credential.len() as u8);
                buf.extend_from_slice(credential);
                Ok(buf)
            }
            SenderFrame::Chunk(chunk) => {
                let length = u16::try_from(chunk.payload.len()).map_err(|_| {
                    WireError::PayloadTooLarge {
                        length: chunk.payload.len(),
                        max: u16::MAX as usize,
                    }
                })?;
                let mut buf = Vec::with_capacity(CHUNK_HEADER_LEN + chunk.payload.len());
                buf.push(frame_kind::CHUNK);
                buf.extend_from_slice(&chunk.offset.to_be_bytes());
                buf.extend_from_slice(&length.to_be_bytes());
                buf.extend_from_slice(&chunk.payload);
                Ok(buf)
            }
            SenderFrame::End => Ok(vec![frame_kind::END]),
            SenderFrame::Abort => Ok(vec![frame_kind::ABORT]),
        }
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// A chunk header announcing more than `max_payload` bytes is rejected
    /// as soon as the header is complete, without waiting for the payload.
    pub fn decode(buf: &[u8], max_payload: usize) -> Result<Option<(Self, usize)>, WireError> {
        let Some(&kind) = buf.first() else {
            return Ok(None);
        };

        match kind {
            frame_kind::REQUEST => {
                if buf.len() < REQUEST_HEADER_LEN {
                    return Ok(None);
                }
                let cred_len = buf[REQUEST_HEADER_LEN - 1] as usize;
                let total = REQUEST_HEADER_LEN + cred_len;
                if buf.len() < total {
                    return Ok(None);
                }
                let total_size = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]);
                let mut digest = [0u8; DIGEST_LEN];
                digest.copy_from_slice(&buf[6..6 + DIGEST_LEN]);
                let credential = if cred_len == 0 {
                    None
                } else {
                    Some(buf[REQUEST_HEADER_LEN..total].to_vec())
                };
                let request = UpdateRequest {
                    kind: ImageKind::from_command(buf[1]),
                    total_size,
                    digest: ImageDigest(digest),
                    credential,
                };
                Ok(Some((SenderFrame::Request(request), total)))
            }
            frame_kind::CHUNK => {
                if buf.len() < CHUNK_HEADER_LEN {
                    return Ok(None);
                }
                let offset = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
                let length = u16::from_be_bytes([buf[5], buf[6]]) as usize;
                if length == 0 {
                    return Err(WireError::EmptyChunk);
                }
                if length > max_payload {
                    return Err(WireError::PayloadTooLarge {
                        length,
                        max: max_payload,
                    });
                }
                let total = CHUNK_HEADER_LEN + length;
                if buf.len() < total {
                    return Ok(None);
                }
                let chunk = ChunkFrame {
                    offset,
                    payload: buf[CHUNK_HEADER_LEN..total].to_vec(),
                };
                Ok(Some((SenderFrame::Chunk(chunk), total)))
            }
            frame_kind::END => Ok(Some((SenderFrame::End, 1))),
            frame_kind::ABORT => Ok(Some((SenderFrame::Abort, 1))),
            other => Err(WireError::UnknownFrame(other)),
        }
    }
}

/// Status carried in a RESPONSE frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Ok,
    AuthFailed,
    Busy,
    BeginFailed,
}

impl ResponseStatus {
    pub fn code(&self) -> u8 {
        match self {
            ResponseStatus::Ok => 0x00,
            ResponseStatus::AuthFailed => 0x01,
            ResponseStatus::Busy => 0x02,
            ResponseStatus::BeginFailed => 0x03,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(ResponseStatus::Ok),
            0x01 => Some(ResponseStatus::AuthFailed),
            0x02 => Some(ResponseStatus::Busy),
            0x03 => Some(ResponseStatus::BeginFailed),
            _ => None,
        }
    }
}

/// Answer to an update request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateResponse {
    pub status: ResponseStatus,
    /// Present only when `status` is `Ok`
    pub token: Option<u32>,
}

impl UpdateResponse {
    pub fn accepted(token: u32) -> Self {
        Self {
            status: ResponseStatus::Ok,
            token: Some(token),
        }
    }

    pub fn rejected(status: ResponseStatus) -> Self {
        Self {
            status,
            token: None,
        }
    }
}

/// Frames sent by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFrame {
    Response(UpdateResponse),
    Ack(u32),
    Result(UpdateStatus),
}

impl DeviceFrame {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            DeviceFrame::Response(resp) => {
                let mut buf = vec![frame_kind::RESPONSE, resp.status.code()];
                if resp.status == ResponseStatus::Ok {
                    buf.extend_from_slice(&resp.token.unwrap_or(0).to_be_bytes());
                }
                buf
            }
            DeviceFrame::Ack(received) => {
                let mut buf = vec![frame_kind::ACK];
                buf.extend_from_slice(&received.to_be_bytes());
                buf
            }
            DeviceFrame::Result(status) => vec![frame_kind::RESULT, status.code()],
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>, WireError> {
        let Some(&kind) = buf.first() else {
            return Ok(None);
        };

        match kind {
            frame_kind::RESPONSE => {
                if buf.len() < 2 {
                    return Ok(None);
                }
                let status =
                    ResponseStatus::from_code(buf[1]).ok_or(WireError::InvalidStatus(buf[1]))?;
                if status != ResponseStatus::Ok {
                    return Ok(Some((
                        DeviceFrame::Response(UpdateResponse::rejected(status)),
                        2,
                    )));
                }
                if buf.len() < 6 {
                    return Ok(None);
                }
                let token = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]);
                Ok(Some((
                    DeviceFrame::Response(UpdateResponse::accepted(token)),
                    6,
                )))
            }
            frame_kind::ACK => {
                if buf.len() < 5 {
                    return Ok(None);
                }
                let received = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
                Ok(Some((DeviceFrame::Ack(received), 5)))
            }
            frame_kind::RESULT => {
                if buf.len() < 2 {
                    return Ok(None);
                }
                let status =
                    UpdateStatus::from_code(buf[1]).ok_or(WireError::InvalidStatus(buf[1]))?;
                Ok(Some((DeviceFrame::Result(status), 2)))
            }
            other => Err(WireError::UnknownFrame(other)),
        }
    }

    /// Decode every complete frame in `buf`, ignoring a trailing partial one.
    pub fn decode_all(mut buf: &[u8]) -> Result<Vec<Self>, WireError> {
        let mut frames = Vec::new();
        while let Some((frame, used)) = Self::decode(buf)? {
            frames.push(frame);
            buf = &buf[used..];
        }
        Ok(frames)
    }
}
