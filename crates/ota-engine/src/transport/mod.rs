//! Connection-oriented channel carrying the control protocol
//!
//! Both traits are non-blocking: `accept` and `recv` return immediately when
//! nothing is available so a single poll never waits on the network.
//! - TCP listener for real devices and the simulator
//! - In-memory mock for tests

pub mod error;
pub mod mock;
pub mod tcp;

pub use error::TransportError;
pub use mock::{MockConnector, MockListener, MockPeer};
pub use tcp::TcpTransport;

/// One accepted connection.
pub trait Connection: Send {
    /// Read available bytes into `buf`.
    ///
    /// `Ok(0)` means no data right now. An orderly close by the peer is
    /// reported as [`TransportError::ConnectionClosed`].
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Queue `data` for sending. Bytes the socket cannot take immediately
    /// are kept and flushed on later calls or while closing.
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Start closing the connection without waiting. Output the socket
    /// cannot take yet is finished by [`poll_close`](Self::poll_close);
    /// `recv` and `send` fail from here on.
    fn close(&mut self);

    /// Continue a close started by `close`. Returns `true` once the
    /// connection is fully shut down and can be dropped.
    fn poll_close(&mut self) -> bool {
        true
    }

    /// Printable peer address.
    fn peer(&self) -> String;
}

/// Source of new connections.
pub trait Listener: Send {
    /// Accept one pending connection, if any.
    fn accept(&mut self) -> Result<Option<Box<dyn Connection>>, TransportError>;

    /// Port the listener is bound to.
    fn local_port(&self) -> u16;
}
