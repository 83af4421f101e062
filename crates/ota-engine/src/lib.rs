//! ota-engine - Polling-driven firmware update engine
//!
//! Receives a firmware image over a connection-oriented channel, writes it
//! into the inactive flash slot, verifies its SHA-256 digest and switches the
//! boot pointer only after verification succeeds. A trial boot of the new
//! image must be confirmed by the host's boot-health check, otherwise the
//! previous slot is restored.
//!
//! The engine never blocks and spawns nothing: the host calls
//! [`OtaService::poll`] from its main loop and each call performs one bounded
//! unit of work.

pub mod boot;
pub mod clock;
pub mod config;
pub mod driver;
pub mod error;
pub mod event;
pub mod flash;
pub mod session;
pub mod transfer;
pub mod transport;
pub mod verify;

pub use boot::{BootControl, BootDecision, BootPhase, BootRecord, ImageInfo, Slot};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, LayoutConfig};
pub use driver::{OtaService, StatusReport};
pub use error::{OtaError, OtaResult};
pub use event::{Observer, UpdateEvent};
pub use flash::{FlashFault, FlashWriter, MemFlash, Region, SimFlash};
pub use session::{SessionManager, UpdateSession};
pub use transfer::{TransferEngine, TransferOutcome};
pub use transport::{
    Connection, Listener, MockConnector, MockListener, MockPeer, TcpTransport, TransportError,
};
pub use verify::IntegrityVerifier;
