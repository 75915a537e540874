//! TCP front end: newline-delimited JSON, one task per connection.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;

use hl_proto::codec::{self, Hello, HelloReply, LineReader, PROTOCOL_VERSION};
use hl_proto::ClientEvent;

use crate::error::RelayError;
use crate::relay::Relay;

/// Accept connections until the listener fails.
pub async fn serve(listener: TcpListener, relay: Relay) -> Result<(), RelayError> {
    loop {
        let (stream, addr) = listener.accept().await?;
        let relay = relay.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, relay).await {
                tracing::warn!(%addr, error = %e, "connection error");
            }
        });
    }
}

async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), RelayError>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    writer.write_all(codec::encode_line(value)?.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn handle_connection<S>(stream: S, relay: Relay) -> Result<(), RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, mut writer) = tokio::io::split(stream);
    // Oversized lines fail the read and close the connection.
    let mut lines = LineReader::new(read_half);

    let Some(line) = lines.next_line().await? else {
        return Err(RelayError::Handshake("empty hello".into()));
    };
    let hello: Hello = codec::decode_line(&line)?;
    if hello.version != PROTOCOL_VERSION {
        let reason = format!("protocol version {} not supported", hello.version);
        write_frame(&mut writer, &HelloReply::Rejected { reason: reason.clone() }).await?;
        return Err(RelayError::Handshake(reason));
    }
    let user_id = match relay.authenticate(&hello.token) {
        Ok(user_id) => user_id,
        Err(e) => {
            write_frame(&mut writer, &HelloReply::Rejected { reason: e.to_string() }).await?;
            return Err(RelayError::Handshake(e.to_string()));
        }
    };
    write_frame(&mut writer, &HelloReply::Accepted { user_id: user_id.clone() }).await?;

    let mut conn = relay.open_session(&user_id);
    loop {
        tokio::select! {
            read = lines.next_line() => {
                let Some(line) = read? else {
                    break;
                };
                match codec::decode_line::<ClientEvent>(&line) {
                    Ok(event) => {
                        if conn.outbound.send(event).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(user = %user_id, error = %e, "malformed frame");
                        let reply = hl_proto::ServerEvent::error(format!("malformed frame: {e}"));
                        write_frame(&mut writer, &reply).await?;
                    }
                }
            }
            event = conn.inbound.recv() => {
                match event {
                    Some(event) => write_frame(&mut writer, &event).await?,
                    // Relay dropped this session.
                    None => break,
                }
            }
        }
    }
    Ok(())
}
