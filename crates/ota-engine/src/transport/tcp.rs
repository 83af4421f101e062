//! Non-blocking TCP transport

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{Connection, Listener, TransportError};

/// Time a closing connection may spend flushing its final frames.
const CLOSE_LINGER: Duration = Duration::from_secs(2);

/// Upper bound on reads spent discarding input on close.
const CLOSE_DRAIN_READS: usize = 16;

/// TCP listener bound to the update port
pub struct TcpTransport {
    listener: TcpListener,
    port: u16,
}

impl TcpTransport {
    /// Bind to `addr` (port 0 picks a free port).
    pub fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let listener =
            TcpListener::bind(addr).map_err(|e| TransportError::BindFailed(e.to_string()))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        let port = listener
            .local_addr()
            .map_err(|e| TransportError::BindFailed(e.to_string()))?
            .port();

        Ok(Self { listener, port })
    }
}

impl Listener for TcpTransport {
    fn accept(&mut self) -> Result<Option<Box<dyn Connection>>, TransportError> {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                stream
                    .set_nonblocking(true)
                    .map_err(|e| TransportError::AcceptFailed(e.to_string()))?;
                let _ = stream.set_nodelay(true);
                debug!(peer = %peer, "Accepted connection");
                Ok(Some(Box::new(TcpConnection::new(stream, peer))))
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(TransportError::AcceptFailed(e.to_string())),
        }
    }

    fn local_port(&self) -> u16 {
        self.port
    }
}

/// Accepted TCP stream with a pending-output buffer
pub struct TcpConnection {
    stream: TcpStream,
    peer: SocketAddr,
    outbox: Vec<u8>,
    /// Set by `close` while the outbox is still draining
    closing_since: Option<Instant>,
    closed: bool,
}

impl TcpConnection {
    fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            outbox: Vec::new(),
            closing_since: None,
            closed: false,
        }
    }

    fn is_open(&self) -> bool {
        !self.closed && self.closing_since.is_none()
    }

    fn flush_outbox(&mut self) -> Result<(), TransportError> {
        while !self.outbox.is_empty() {
            match self.stream.write(&self.outbox) {
                Ok(0) => return Err(TransportError::ConnectionClosed),
                Ok(n) => {
                    self.outbox.drain(..n);
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransportError::SendFailed(e.to_string())),
            }
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        if !self.outbox.is_empty() {
            warn!(
                peer = %self.peer,
                bytes = self.outbox.len(),
                "Dropped unsent bytes on close"
            );
            self.outbox.clear();
        }

        // Unread input turns the close into a reset that can discard the
        // frames just flushed
        let mut sink = [0u8; 512];
        for _ in 0..CLOSE_DRAIN_READS {
            match self.stream.read(&mut sink) {
                Ok(n) if n > 0 => continue,
                _ => break,
            }
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        self.closed = true;
        self.closing_since = None;
        debug!(peer = %self.peer, "Connection closed");
    }
}

impl Connection for TcpConnection {
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }
        self.flush_outbox()?;

        match self.stream.read(buf) {
            Ok(0) if !buf.is_empty() => Err(TransportError::ConnectionClosed),
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                Ok(0)
            }
            Err(e) => Err(TransportError::ReceiveFailed(e.to_string())),
        }
    }

    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }
        self.outbox.extend_from_slice(data);
        self.flush_outbox()
    }

    fn close(&mut self) {
        if !self.is_open() {
            return;
        }
        self.closing_since = Some(Instant::now());
        self.poll_close();
    }

    fn poll_close(&mut self) -> bool {
        if self.closed {
            return true;
        }
        let Some(since) = self.closing_since else {
            return false;
        };

        let flushed = self.flush_outbox();
        if flushed.is_err() || self.outbox.is_empty() || since.elapsed() >= CLOSE_LINGER {
            self.shutdown();
        }
        self.closed
    }

    fn peer(&self) -> String {
        self.peer.to_string()
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        if !self.closed {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn loopback() -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
    }

    fn accept_blocking(listener: &mut TcpTransport) -> Box<dyn Connection> {
        for _ in 0..500 {
            if let Some(conn) = listener.accept().unwrap() {
                return conn;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("no connection accepted");
    }

    #[test]
    fn test_accept_is_non_blocking() {
        let mut listener = TcpTransport::bind(loopback()).unwrap();
        assert_ne!(listener.local_port(), 0);
        assert!(listener.accept().unwrap().is_none());
    }

    #[test]
    fn test_exchange_and_close() {
        let mut listener = TcpTransport::bind(loopback()).unwrap();
        let mut client =
            TcpStream::connect(("127.0.0.1", listener.local_port())).unwrap();
        let mut conn = accept_blocking(&mut listener);

        let mut buf = [0u8; 16];
        assert_eq!(conn.recv(&mut buf).unwrap(), 0);

        client.write_all(&[1, 2, 3]).unwrap();
        let mut got = 0;
        for _ in 0..500 {
            got = conn.recv(&mut buf).unwrap();
            if got > 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(&buf[..got], &[1, 2, 3]);

        conn.send(&[9, 8]).unwrap();
        conn.close();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).unwrap();
        assert_eq!(reply, vec![9, 8]);
        assert_eq!(conn.recv(&mut buf), Err(TransportError::ConnectionClosed));
    }

    #[test]
    fn test_close_does_not_wait_for_slow_reader() {
        let mut listener = TcpTransport::bind(loopback()).unwrap();
        let mut client = TcpStream::connect(("127.0.0.1", listener.local_port())).unwrap();
        let mut conn = accept_blocking(&mut listener);

        // More than the socket buffers hold while nobody reads
        let payload: Vec<u8> = (0..32 * 1024 * 1024).map(|i| i as u8).collect();
        conn.send(&payload).unwrap();
        conn.close();
        assert!(!conn.poll_close());
        assert_eq!(conn.send(&[1]), Err(TransportError::ConnectionClosed));

        let reader = std::thread::spawn(move || {
            let mut received = Vec::new();
            client.read_to_end(&mut received).unwrap();
            received
        });

        let mut closed = false;
        for _ in 0..1000 {
            if conn.poll_close() {
                closed = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(closed);
        assert_eq!(reader.join().unwrap().len(), payload.len());
    }

    #[test]
    fn test_peer_disconnect_reported() {
        let mut listener = TcpTransport::bind(loopback()).unwrap();
        let client = TcpStream::connect(("127.0.0.1", listener.local_port())).unwrap();
        let mut conn = accept_blocking(&mut listener);
        drop(client);

        let mut buf = [0u8; 8];
        let mut result = Ok(0);
        for _ in 0..500 {
            result = conn.recv(&mut buf);
            if result != Ok(0) {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(result.is_err());
    }
}
