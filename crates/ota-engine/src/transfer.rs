//! Transfer engine: moves image bytes from the connection into flash
//!
//! One call to [`TransferEngine::step`] reads at most `poll_budget_bytes`
//! from the connection, decodes every complete frame buffered so far and
//! applies the chunks in order. Chunk payloads are hashed as they arrive and
//! staged until a write-granularity aligned piece can go to flash; the tail
//! of the image is padded with the erased value once the last byte is in.

use std::time::Instant;

use embedded_storage::nor_flash::NorFlash;
use ota_core::{ChunkFrame, DeviceFrame, SenderFrame};
use tracing::{debug, trace};

use crate::config::EngineConfig;
use crate::error::OtaError;
use crate::session::UpdateSession;
use crate::transport::TransportError;

/// Result of one transfer step
#[derive(Debug)]
pub enum TransferOutcome {
    /// Bytes were consumed; more are expected
    Progressed,
    /// `bytes_received == total_size`, image fully written
    Complete,
    /// No data available yet
    WouldBlock,
    /// Connection, framing, overflow or flash failure
    Failed(OtaError),
}

#[derive(Debug)]
pub struct TransferEngine {
    max_chunk_size: usize,
    scratch: Vec<u8>,
}

impl TransferEngine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            max_chunk_size: config.max_chunk_size,
            scratch: vec![0u8; config.poll_budget_bytes],
        }
    }

    pub fn step<F: NorFlash>(
        &mut self,
        session: &mut UpdateSession,
        flash: &mut F,
        now: Instant,
    ) -> TransferOutcome {
        let mut peer_closed = false;
        let received_before = session.bytes_received;
        let read = match session.connection.recv(&mut self.scratch) {
            Ok(n) => n,
            Err(TransportError::ConnectionClosed) => {
                peer_closed = true;
                0
            }
            Err(e) => return TransferOutcome::Failed(e.into()),
        };

        if read > 0 {
            session.inbox.extend_from_slice(&self.scratch[..read]);
            session.last_activity = now;
            trace!(bytes = read, buffered = session.inbox.len(), "Read from connection");
        }

        match self.drain_inbox(session, flash) {
            Ok(true) => return TransferOutcome::Complete,
            Ok(false) => {}
            Err(e) => return TransferOutcome::Failed(e),
        }

        if peer_closed {
            return TransferOutcome::Failed(OtaError::ReceiveFailed(format!(
                "peer disconnected after {} of {} bytes",
                session.bytes_received, session.total_size
            )));
        }

        // Buffered frames can advance the image without a new read
        if read > 0 || session.bytes_received != received_before {
            TransferOutcome::Progressed
        } else {
            TransferOutcome::WouldBlock
        }
    }

    /// Apply every complete frame in the inbox. Returns `true` once the
    /// whole image has been received.
    fn drain_inbox<F: NorFlash>(
        &self,
        session: &mut UpdateSession,
        flash: &mut F,
    ) -> Result<bool, OtaError> {
        let mut consumed = 0;
        let mut complete = false;

        while let Some((frame, used)) =
            SenderFrame::decode(&session.inbox[consumed..], self.max_chunk_size)?
        {
            consumed += used;
            match frame {
                SenderFrame::Chunk(chunk) => {
                    apply_chunk(session, flash, &chunk)?;
                    if session.bytes_received == session.total_size {
                        finish_image(session, flash)?;
                        complete = true;
                        break;
                    }
                }
                SenderFrame::End => {
                    return Err(OtaError::ReceiveFailed(format!(
                        "end of transfer after {} of {} bytes",
                        session.bytes_received, session.total_size
                    )));
                }
                SenderFrame::Abort => {
                    return Err(OtaError::ReceiveFailed("aborted by sender".into()));
                }
                SenderFrame::Request(_) => {
                    return Err(OtaError::ReceiveFailed(
                        "unexpected request during transfer".into(),
                    ));
                }
            }
        }

        session.inbox.drain(..consumed);
        Ok(complete)
    }
}

fn apply_chunk<F: NorFlash>(
    session: &mut UpdateSession,
    flash: &mut F,
    chunk: &ChunkFrame,
) -> Result<(), OtaError> {
    if chunk.offset != session.bytes_received {
        return Err(OtaError::ReceiveFailed(format!(
            "chunk at offset {} but {} bytes received",
            chunk.offset, session.bytes_received
        )));
    }
    let len = chunk.payload.len() as u64;
    if session.bytes_received as u64 + len > session.total_size as u64 {
        return Err(OtaError::ReceiveFailed(format!(
            "chunk of {} bytes at offset {} overflows image of {} bytes",
            len, chunk.offset, session.total_size
        )));
    }

    session.verifier.update(&chunk.payload)?;
    session.staging.extend_from_slice(&chunk.payload);

    let aligned = session.staging.len() / F::WRITE_SIZE * F::WRITE_SIZE;
    if aligned > 0 {
        let offset = session.writer.cursor();
        session
            .writer
            .write(flash, offset, &session.staging[..aligned])?;
        session.staging.drain(..aligned);
    }

    session.bytes_received += chunk.payload.len() as u32;
    session
        .connection
        .send(&DeviceFrame::Ack(session.bytes_received).encode())?;

    debug!(
        offset = chunk.offset,
        bytes = chunk.payload.len(),
        total_received = session.bytes_received,
        total_expected = session.total_size,
        "Chunk applied"
    );
    Ok(())
}

/// Pad and write the last partial word.
fn finish_image<F: NorFlash>(session: &mut UpdateSession, flash: &mut F) -> Result<(), OtaError> {
    if session.staging.is_empty() {
        return Ok(());
    }
    let mut tail = std::mem::take(&mut session.staging);
    tail.resize(F::WRITE_SIZE, 0xFF);
    let offset = session.writer.cursor();
    session.writer.write(flash, offset, &tail)?;
    debug!(offset = offset, padded = tail.len(), "Image tail written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::Slot;
    use crate::flash::{FlashWriter, Region, SimFlash};
    use crate::transport::{Listener, MockListener, MockPeer};
    use ota_core::{ImageDigest, ImageKind, SessionState};

    const REGION: Region = Region::new(0x1000, 0x2000);

    fn new_session(total_size: u32) -> (UpdateSession, MockPeer) {
        let (mut listener, connector) = MockListener::new(8266);
        let peer = connector.connect();
        let conn = listener.accept().unwrap().unwrap();
        let mut session = UpdateSession::new(
            1,
            ImageKind::Firmware,
            total_size,
            ImageDigest::default(),
            None,
            conn,
            Slot::B,
            FlashWriter::new(REGION),
            Instant::now(),
        );
        session.state = SessionState::Receiving;
        (session, peer)
    }

    fn engine() -> TransferEngine {
        let config = EngineConfig {
            max_chunk_size: 64,
            poll_budget_bytes: 128,
            ..EngineConfig::default()
        };
        TransferEngine::new(&config)
    }

    fn chunk(offset: u32, payload: &[u8]) -> SenderFrame {
        SenderFrame::Chunk(ChunkFrame {
            offset,
            payload: payload.to_vec(),
        })
    }

    #[test]
    fn test_no_data_would_block() {
        let (mut session, _peer) = new_session(16);
        let mut flash = SimFlash::new(0x4000);
        assert!(matches!(
            engine().step(&mut session, &mut flash, Instant::now()),
            TransferOutcome::WouldBlock
        ));
    }

    #[test]
    fn test_unaligned_chunks_staged_and_padded() {
        let image: Vec<u8> = (1..=10).collect();
        let (mut session, peer) = new_session(10);
        let mut flash = SimFlash::new(0x4000);
        let mut engine = engine();

        peer.send_frame(&chunk(0, &image[..3]));
        assert!(matches!(
            engine.step(&mut session, &mut flash, Instant::now()),
            TransferOutcome::Progressed
        ));
        assert_eq!(flash.write_count(), 0);
        assert_eq!(session.bytes_received, 3);

        peer.send_frame(&chunk(3, &image[3..]));
        assert!(matches!(
            engine.step(&mut session, &mut flash, Instant::now()),
            TransferOutcome::Complete
        ));

        let written = &flash.as_bytes()[0x1000..0x100C];
        assert_eq!(&written[..10], &image[..]);
        assert_eq!(&written[10..], &[0xFF, 0xFF]);
        assert_eq!(
            peer.frames(),
            vec![DeviceFrame::Ack(3), DeviceFrame::Ack(10)]
        );
    }

    #[test]
    fn test_buffered_chunk_counts_as_progress() {
        let (mut session, peer) = new_session(64);
        let mut flash = SimFlash::new(0x4000);
        session
            .inbox
            .extend_from_slice(&chunk(0, &[3; 16]).encode().unwrap());

        assert!(matches!(
            engine().step(&mut session, &mut flash, Instant::now()),
            TransferOutcome::Progressed
        ));
        assert_eq!(session.bytes_received, 16);
        assert_eq!(peer.frames(), vec![DeviceFrame::Ack(16)]);

        assert!(matches!(
            engine().step(&mut session, &mut flash, Instant::now()),
            TransferOutcome::WouldBlock
        ));
    }

    #[test]
    fn test_budget_limits_bytes_per_step() {
        let image = vec![0x5A; 256];
        let (mut session, peer) = new_session(256);
        let mut flash = SimFlash::new(0x4000);
        let mut engine = engine();

        for (i, part) in image.chunks(64).enumerate() {
            peer.send_frame(&chunk(i as u32 * 64, part));
        }

        engine.step(&mut session, &mut flash, Instant::now());
        assert!(peer.unread() > 0);
        assert!(session.bytes_received < 256);

        let mut steps = 1;
        loop {
            steps += 1;
            if let TransferOutcome::Complete =
                engine.step(&mut session, &mut flash, Instant::now())
            {
                break;
            }
            assert!(steps < 10);
        }
        assert_eq!(session.bytes_received, 256);
    }

    #[test]
    fn test_overflow_rejected_without_write() {
        let (mut session, peer) = new_session(8);
        let mut flash = SimFlash::new(0x4000);

        peer.send_frame(&chunk(0, &[1; 12]));
        match engine().step(&mut session, &mut flash, Instant::now()) {
            TransferOutcome::Failed(e) => assert!(e.to_string().contains("overflows")),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(session.bytes_received, 0);
        assert_eq!(flash.write_count(), 0);
    }

    #[test]
    fn test_out_of_order_chunk_fails() {
        let (mut session, peer) = new_session(64);
        let mut flash = SimFlash::new(0x4000);

        peer.send_frame(&chunk(8, &[1; 8]));
        assert!(matches!(
            engine().step(&mut session, &mut flash, Instant::now()),
            TransferOutcome::Failed(OtaError::ReceiveFailed(_))
        ));
    }

    #[test]
    fn test_oversized_frame_fails() {
        let (mut session, peer) = new_session(1024);
        let mut flash = SimFlash::new(0x4000);

        peer.send_frame(&chunk(0, &[1; 100]));
        let outcome = engine().step(&mut session, &mut flash, Instant::now());
        match outcome {
            TransferOutcome::Failed(e) => {
                assert_eq!(e.status(), ota_core::UpdateStatus::ReceiveFailed)
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_abort_and_early_end() {
        let (mut session, peer) = new_session(64);
        let mut flash = SimFlash::new(0x4000);
        peer.send_frame(&SenderFrame::Abort);
        assert!(matches!(
            engine().step(&mut session, &mut flash, Instant::now()),
            TransferOutcome::Failed(OtaError::ReceiveFailed(_))
        ));

        let (mut session, peer) = new_session(64);
        peer.send_frame(&chunk(0, &[1; 8]));
        peer.send_frame(&SenderFrame::End);
        assert!(matches!(
            engine().step(&mut session, &mut flash, Instant::now()),
            TransferOutcome::Failed(OtaError::ReceiveFailed(_))
        ));
    }

    #[test]
    fn test_disconnect_fails_transfer() {
        let (mut session, peer) = new_session(64);
        let mut flash = SimFlash::new(0x4000);
        peer.disconnect();
        assert!(matches!(
            engine().step(&mut session, &mut flash, Instant::now()),
            TransferOutcome::Failed(OtaError::ReceiveFailed(_))
        ));
    }

    #[test]
    fn test_activity_time_updated_on_data() {
        let (mut session, peer) = new_session(64);
        let mut flash = SimFlash::new(0x4000);
        let start = session.last_activity;
        let later = start + std::time::Duration::from_secs(2);

        engine().step(&mut session, &mut flash, later);
        assert_eq!(session.last_activity, start);

        peer.send_frame(&chunk(0, &[1; 4]));
        engine().step(&mut session, &mut flash, later);
        assert_eq!(session.last_activity, later);
    }
}
