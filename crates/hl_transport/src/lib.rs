//! hl_transport: Hushline encrypted session transport
//!
//! `SessionTransport` owns the relay connection for one identity: it
//! establishes per-peer channels on demand, encrypts and queues outbound
//! messages, dispatches inbound events, and runs the delivery/read,
//! typing, reaction, edit and delete sub-protocols. `ClientContext` wires a
//! vault, a key manager and a transport together for one user.

pub mod config;
pub mod context;
pub mod error;
pub mod events;
mod inbound;
pub mod net;
pub mod outbox;
pub mod transport;

pub use config::{BackoffConfig, QueueLimits, TransportConfig};
pub use context::{ClientContext, ContextOptions};
pub use error::TransportError;
pub use events::TransportEvent;
pub use net::TcpConnector;
pub use transport::{EventStream, SessionTransport, SharedKeys, TransportBuilder};
