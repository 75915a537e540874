//! Connection capability between a client session and the relay.
//!
//! Both the in-process relay and the TCP client implement [`Connector`], so
//! the transport never depends on how bytes actually move.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::events::{ClientEvent, ServerEvent};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// Invalid or expired token. Not retried; the user must re-authenticate.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Network error: {0}")]
    Network(String),
}

impl ConnectError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

/// An authenticated, open connection. Dropping `outbound` closes it; the
/// inbound stream ends when the relay side goes away.
#[derive(Debug)]
pub struct Connection {
    pub user_id: String,
    pub outbound: mpsc::UnboundedSender<ClientEvent>,
    pub inbound: mpsc::UnboundedReceiver<ServerEvent>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, token: &str) -> Result<Connection, ConnectError>;
}
