//! hl_relay: Hushline relay
//!
//! Routes opaque ciphertext between authenticated sessions. The [`Relay`]
//! implements [`hl_proto::Connector`] directly for in-process use, and
//! [`server::serve`] exposes it over TCP.

pub mod config;
pub mod error;
pub mod relay;
pub mod server;
pub mod sessions;

pub use config::RelayConfig;
pub use error::{AuthError, RelayError};
pub use relay::Relay;
pub use sessions::{SessionRecord, SessionRegistry};
