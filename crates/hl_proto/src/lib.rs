//! hl_proto: Hushline relay protocol
//!
//! Shared by clients and the relay:
//! - `events`   : client/server events and the relayed message shape
//! - `envelope` : message status, reactions, edits, tombstones, queue records
//! - `codec`    : newline JSON framing, handshake, plaintext padding
//! - `link`     : the `Connector` capability used by the transport

pub mod codec;
pub mod envelope;
pub mod error;
pub mod events;
pub mod link;

pub use codec::{Hello, HelloReply, PaddingMode};
pub use envelope::{MessageEnvelope, MessageStatus, QueuedMessage, Reaction, Reactions};
pub use error::{AuthorizationError, CodecError};
pub use events::{ClientEvent, MessageType, RelayedMessage, ServerEvent};
pub use link::{ConnectError, Connection, Connector};
