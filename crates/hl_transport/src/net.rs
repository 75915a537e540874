//! Newline-delimited JSON client connection to a relay over TCP.

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use hl_proto::{
    codec::{self, Hello, HelloReply, LineReader},
    ClientEvent, ConnectError, Connection, Connector, ServerEvent,
};

#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

fn network(e: impl std::fmt::Display) -> ConnectError {
    ConnectError::Network(e.to_string())
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, token: &str) -> Result<Connection, ConnectError> {
        let stream = TcpStream::connect(&self.addr).await.map_err(network)?;
        let (read_half, mut writer) = stream.into_split();
        let mut reader = LineReader::new(read_half);

        let hello = codec::encode_line(&Hello::new(token)).map_err(network)?;
        writer.write_all(hello.as_bytes()).await.map_err(network)?;
        writer.flush().await.map_err(network)?;

        let Some(line) = reader.next_line().await.map_err(network)? else {
            return Err(ConnectError::Network("relay closed during handshake".into()));
        };
        let user_id = match codec::decode_line::<HelloReply>(&line).map_err(network)? {
            HelloReply::Accepted { user_id } => user_id,
            HelloReply::Rejected { reason } => return Err(ConnectError::Unauthorized(reason)),
        };
        tracing::debug!(addr = %self.addr, %user_id, "relay handshake complete");

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientEvent>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<ServerEvent>();

        tokio::spawn(async move {
            while let Some(event) = out_rx.recv().await {
                let line = match codec::encode_line(&event) {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::warn!(event = event.name(), error = %e, "dropping unencodable event");
                        continue;
                    }
                };
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    tracing::debug!(error = %e, "relay write failed");
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        tokio::spawn(async move {
            loop {
                match reader.next_line().await {
                    Ok(None) => break,
                    Ok(Some(line)) => match codec::decode_line::<ServerEvent>(&line) {
                        Ok(event) => {
                            if in_tx.send(event).is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "dropping malformed relay frame"),
                    },
                    Err(e) => {
                        tracing::debug!(error = %e, "relay read failed");
                        break;
                    }
                }
            }
        });

        Ok(Connection {
            user_id,
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
