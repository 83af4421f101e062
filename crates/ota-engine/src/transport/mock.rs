//! In-memory transport for tests
//!
//! [`MockConnector::connect`] creates a connection pair: the device side is
//! handed out by [`MockListener::accept`], the test keeps the [`MockPeer`].

use std::collections::VecDeque;
use std::sync::Arc;

use ota_core::{DeviceFrame, SenderFrame};
use parking_lot::Mutex;

use super::{Connection, Listener, TransportError};

#[derive(Debug, Default)]
struct MockPipe {
    /// Bytes waiting to be read by the device
    inbound: VecDeque<u8>,
    /// Everything the device has sent
    outbound: Vec<u8>,
    /// Device output held back while the peer is not reading
    held: Vec<u8>,
    stalled: bool,
    peer_closed: bool,
    /// `close` called, output still held
    closing: bool,
    device_closed: bool,
}

type SharedPipe = Arc<Mutex<MockPipe>>;

/// Listener side of the mock transport
pub struct MockListener {
    pending: Arc<Mutex<VecDeque<SharedPipe>>>,
    counter: Arc<Mutex<u32>>,
    port: u16,
}

/// Handle used by tests to open connections to a [`MockListener`]
#[derive(Clone)]
pub struct MockConnector {
    pending: Arc<Mutex<VecDeque<SharedPipe>>>,
    counter: Arc<Mutex<u32>>,
}

impl MockListener {
    pub fn new(port: u16) -> (Self, MockConnector) {
        let pending = Arc::new(Mutex::new(VecDeque::new()));
        let counter = Arc::new(Mutex::new(0));
        let listener = Self {
            pending: pending.clone(),
            counter: counter.clone(),
            port,
        };
        (listener, MockConnector { pending, counter })
    }
}

impl Listener for MockListener {
    fn accept(&mut self) -> Result<Option<Box<dyn Connection>>, TransportError> {
        let Some(pipe) = self.pending.lock().pop_front() else {
            return Ok(None);
        };
        let id = {
            let mut counter = self.counter.lock();
            *counter += 1;
            *counter
        };
        Ok(Some(Box::new(MockConnection { pipe, id })))
    }

    fn local_port(&self) -> u16 {
        self.port
    }
}

impl MockConnector {
    /// Queue a new connection for the listener.
    pub fn connect(&self) -> MockPeer {
        let pipe: SharedPipe = Arc::default();
        self.pending.lock().push_back(pipe.clone());
        MockPeer { pipe }
    }

    /// Connections accepted so far.
    pub fn accepted(&self) -> u32 {
        *self.counter.lock()
    }
}

/// Device side of a mock connection
pub struct MockConnection {
    pipe: SharedPipe,
    id: u32,
}

impl Connection for MockConnection {
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut pipe = self.pipe.lock();
        if pipe.device_closed || pipe.closing {
            return Err(TransportError::ConnectionClosed);
        }
        if pipe.inbound.is_empty() {
            return if pipe.peer_closed {
                Err(TransportError::ConnectionClosed)
            } else {
                Ok(0)
            };
        }
        let n = buf.len().min(pipe.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(pipe.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let mut pipe = self.pipe.lock();
        if pipe.device_closed || pipe.closing || pipe.peer_closed {
            return Err(TransportError::ConnectionClosed);
        }
        if pipe.stalled {
            pipe.held.extend_from_slice(data);
        } else {
            pipe.outbound.extend_from_slice(data);
        }
        Ok(())
    }

    fn close(&mut self) {
        let mut pipe = self.pipe.lock();
        if !pipe.device_closed {
            pipe.closing = true;
        }
        drop(pipe);
        self.poll_close();
    }

    fn poll_close(&mut self) -> bool {
        let mut pipe = self.pipe.lock();
        if pipe.closing && (!pipe.stalled || pipe.peer_closed) {
            let held = std::mem::take(&mut pipe.held);
            if !pipe.peer_closed {
                pipe.outbound.extend_from_slice(&held);
            }
            pipe.closing = false;
            pipe.device_closed = true;
        }
        pipe.device_closed
    }

    fn peer(&self) -> String {
        format!("mock-{}", self.id)
    }
}

/// Test-side end of a mock connection
pub struct MockPeer {
    pipe: SharedPipe,
}

impl MockPeer {
    pub fn send_bytes(&self, bytes: &[u8]) {
        self.pipe.lock().inbound.extend(bytes.iter().copied());
    }

    /// Encode and queue a frame.
    pub fn send_frame(&self, frame: &SenderFrame) {
        let bytes = frame.encode().expect("encodable frame");
        self.send_bytes(&bytes);
    }

    /// Every complete frame the device has sent so far.
    pub fn frames(&self) -> Vec<DeviceFrame> {
        DeviceFrame::decode_all(&self.pipe.lock().outbound).expect("valid device frames")
    }

    /// Bytes queued but not yet read by the device.
    pub fn unread(&self) -> usize {
        self.pipe.lock().inbound.len()
    }

    /// Stop (or resume) reading device output; sends are held meanwhile.
    pub fn stall(&self, stalled: bool) {
        let mut pipe = self.pipe.lock();
        pipe.stalled = stalled;
        if !stalled {
            let held = std::mem::take(&mut pipe.held);
            pipe.outbound.extend_from_slice(&held);
        }
    }

    /// Simulate the sender hanging up.
    pub fn disconnect(&self) {
        self.pipe.lock().peer_closed = true;
    }

    /// True once the device closed its end.
    pub fn is_closed(&self) -> bool {
        self.pipe.lock().device_closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ota_core::UpdateStatus;

    #[test]
    fn test_connect_accept_exchange() {
        let (mut listener, connector) = MockListener::new(8266);
        assert!(listener.accept().unwrap().is_none());

        let peer = connector.connect();
        let mut conn = listener.accept().unwrap().unwrap();
        assert_eq!(connector.accepted(), 1);
        assert_eq!(conn.peer(), "mock-1");

        peer.send_bytes(&[1, 2, 3, 4, 5]);
        let mut buf = [0u8; 3];
        assert_eq!(conn.recv(&mut buf).unwrap(), 3);
        assert_eq!(buf, [1, 2, 3]);
        assert_eq!(peer.unread(), 2);

        conn.send(&DeviceFrame::Result(UpdateStatus::Success).encode())
            .unwrap();
        assert_eq!(peer.frames(), vec![DeviceFrame::Result(UpdateStatus::Success)]);
    }

    #[test]
    fn test_disconnect_after_draining() {
        let (mut listener, connector) = MockListener::new(8266);
        let peer = connector.connect();
        let mut conn = listener.accept().unwrap().unwrap();

        peer.send_bytes(&[7]);
        peer.disconnect();

        let mut buf = [0u8; 4];
        assert_eq!(conn.recv(&mut buf).unwrap(), 1);
        assert_eq!(conn.recv(&mut buf), Err(TransportError::ConnectionClosed));
    }

    #[test]
    fn test_close_waits_for_stalled_peer() {
        let (mut listener, connector) = MockListener::new(8266);
        let peer = connector.connect();
        let mut conn = listener.accept().unwrap().unwrap();

        peer.stall(true);
        conn.send(&DeviceFrame::Ack(4).encode()).unwrap();
        conn.close();
        assert!(!conn.poll_close());
        assert!(!peer.is_closed());
        assert!(peer.frames().is_empty());
        assert!(conn.send(&[0]).is_err());

        peer.stall(false);
        assert!(conn.poll_close());
        assert!(peer.is_closed());
        assert_eq!(peer.frames(), vec![DeviceFrame::Ack(4)]);
    }

    #[test]
    fn test_device_close_visible_to_peer() {
        let (mut listener, connector) = MockListener::new(8266);
        let peer = connector.connect();
        let mut conn = listener.accept().unwrap().unwrap();
        conn.close();
        assert!(peer.is_closed());
        assert!(conn.send(&[0]).is_err());
    }
}
