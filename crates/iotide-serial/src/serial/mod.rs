//! Serial crate: sub-modules.

pub mod backend;
pub mod bridge;
pub mod device_store;
pub mod events;
pub mod monitor;
pub mod native;
pub mod port_scanner;
pub mod repl;
pub mod session;
pub mod transport;
pub mod types;

// Re-export top-level items for convenience.
pub use backend::{select_transport, BackendPreference};
pub use bridge::HostProcessTransport;
pub use device_store::LastDeviceStore;
pub use events::{EventKind, EventTable, ListenerId, SerialEvent};
pub use monitor::{ExportFormat, MonitorLog};
pub use native::InProcessTransport;
pub use port_scanner::PortDiscovery;
pub use repl::{ReplClient, ReplTimings};
pub use session::{SerialSessionManager, SessionState, SessionStats};
pub use transport::{Responder, SerialTransport, SimulatedTransport, TransportEvent, TransportSink};
pub use types::*;
