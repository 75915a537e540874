//! Wire codec: line framing, connection handshake, and plaintext padding.
//!
//! # Framing
//! One JSON document per line. A connection opens with a [`Hello`] from the
//! client and a [`HelloReply`] from the relay, then carries
//! [`ClientEvent`](crate::ClientEvent)s up and
//! [`ServerEvent`](crate::ServerEvent)s down. [`LineReader`] enforces
//! [`MAX_LINE_LEN`] while reading, so a peer that never sends a newline
//! cannot grow the buffer past it.
//!
//! # Padding
//! Plaintext is padded INSIDE the ciphertext before encryption so the relay
//! sees uniform sizes. Bucket sizes (bytes): 256, 512, 1024, 4096, 16384,
//! 65536. Larger payloads are sent unpadded.

use rand::RngCore;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::error::CodecError;

pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on one framed line, newline excluded.
pub const MAX_LINE_LEN: usize = 256 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub version: u32,
    pub token: String,
}

impl Hello {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            token: token.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HelloReply {
    Accepted {
        #[serde(rename = "userId")]
        user_id: String,
    },
    Rejected {
        reason: String,
    },
}

/// Serialise one frame, newline included.
pub fn encode_line<T: Serialize>(value: &T) -> Result<String, CodecError> {
    let mut line = serde_json::to_string(value)?;
    if line.len() > MAX_LINE_LEN {
        return Err(CodecError::FrameTooLarge(line.len()));
    }
    line.push('\n');
    Ok(line)
}

/// Parse one frame. Surrounding whitespace (including the newline) is ignored.
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T, CodecError> {
    let trimmed = line.trim();
    if trimmed.len() > MAX_LINE_LEN {
        return Err(CodecError::FrameTooLarge(trimmed.len()));
    }
    Ok(serde_json::from_str(trimmed)?)
}

/// Padding mode for metadata minimisation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaddingMode {
    /// Length prefix only.
    None,
    /// Pad to the next bucket.
    #[default]
    Buckets,
    /// Pad everything to the largest bucket.
    Maximum,
}

const BUCKET_SIZES: &[usize] = &[256, 512, 1024, 4096, 16384, 65536];
const MAX_BUCKET: usize = 65536;

/// Format: [original_len: u32 LE] [plaintext] [random padding]
pub fn pad_to_bucket(plaintext: &[u8], mode: PaddingMode) -> Vec<u8> {
    let needed = 4 + plaintext.len();
    let target = match mode {
        PaddingMode::None => needed,
        PaddingMode::Buckets => BUCKET_SIZES
            .iter()
            .copied()
            .find(|&b| b >= needed)
            .unwrap_or(needed),
        PaddingMode::Maximum => MAX_BUCKET.max(needed),
    };

    let mut out = Vec::with_capacity(target);
    out.extend_from_slice(&(plaintext.len() as u32).to_le_bytes());
    out.extend_from_slice(plaintext);
    // Random, not zeros: zeros compress and leak the real length.
    let remaining = target - out.len();
    if remaining > 0 {
        let mut padding = vec![0u8; remaining];
        rand::rngs::OsRng.fill_bytes(&mut padding);
        out.extend_from_slice(&padding);
    }
    out
}

pub fn unpad(padded: &[u8]) -> Result<Vec<u8>, CodecError> {
    if padded.len() < 4 {
        return Err(CodecError::InvalidPadding("too short for length prefix".into()));
    }
    let len = u32::from_le_bytes([padded[0], padded[1], padded[2], padded[3]]) as usize;
    if 4 + len > padded.len() {
        return Err(CodecError::InvalidPadding(format!(
            "length prefix {len} exceeds padded data size {}",
            padded.len()
        )));
    }
    Ok(padded[4..4 + len].to_vec())
}

/// Bounded newline reader. `next_line` is cancel safe: a partially read
/// line is kept in `partial` until its newline arrives.
pub struct LineReader<R> {
    inner: BufReader<R>,
    partial: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            partial: Vec::new(),
        }
    }

    /// Next line without its terminator, `None` at end of stream. A line
    /// longer than [`MAX_LINE_LEN`] fails with `FrameTooLarge` as soon as
    /// the limit is crossed.
    pub async fn next_line(&mut self) -> Result<Option<String>, CodecError> {
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                // Unterminated tail at EOF is dropped.
                self.partial.clear();
                return Ok(None);
            }
            let (take, used, done) = match available.iter().position(|&b| b == b'\n') {
                Some(i) => (i, i + 1, true),
                None => (available.len(), available.len(), false),
            };
            let len = self.partial.len() + take;
            if len > MAX_LINE_LEN {
                self.partial.clear();
                return Err(CodecError::FrameTooLarge(len));
            }
            self.partial.extend_from_slice(&available[..take]);
            self.inner.consume(used);
            if done {
                let line = std::mem::take(&mut self.partial);
                return String::from_utf8(line)
                    .map(Some)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e).into());
            }
        }
    }
}
