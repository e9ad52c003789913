//! Framing rules for the two transports.
//!
//! Stream: `[4-byte big-endian length][length bytes of JSON]`, length in
//! `1..=MAX_FRAME_LEN`. A bad length means the reader has lost frame sync,
//! so callers must close the connection.
//!
//! Datagram: one JSON envelope per datagram, no prefix.

use crate::{Message, MAX_FRAME_LEN};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const HEADER_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid frame length: {0} bytes")]
    InvalidLength(u32),
    #[error("message too large: {0} bytes")]
    TooLarge(usize),
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl CodecError {
    /// True when the peer closed the stream, cleanly or mid-frame.
    pub fn is_eof(&self) -> bool {
        matches!(self, CodecError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }

    /// True for errors that mean the bytes themselves were bad.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            CodecError::InvalidLength(_) | CodecError::TooLarge(_) | CodecError::Malformed(_)
        )
    }
}

/// Encodes a message as a complete stream frame. Prefix and body share one
/// buffer so a single write puts the whole frame on the wire.
pub fn encode_frame(message: &Message) -> Result<Vec<u8>, CodecError> {
    let body = serde_json::to_vec(message)?;
    if body.is_empty() || body.len() > MAX_FRAME_LEN as usize {
        return Err(CodecError::TooLarge(body.len()));
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Validates a frame header and returns the body length.
pub fn frame_len(header: [u8; HEADER_LEN]) -> Result<usize, CodecError> {
    let len = u32::from_be_bytes(header);
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(CodecError::InvalidLength(len));
    }
    Ok(len as usize)
}

/// Decodes a frame body or datagram into a message.
pub fn decode_payload(bytes: &[u8]) -> Result<Message, CodecError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Reads one frame. Any error leaves the stream out of sync.
pub async fn read_frame<R>(reader: &mut R) -> Result<Message, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let len = frame_len(header)?;

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    decode_payload(&body)
}

/// Writes one frame with a single `write_all`.
pub async fn write_frame<W>(writer: &mut W, message: &Message) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Encodes a message as a datagram. Size is not enforced here; the sender
/// decides what to do about datagrams above `DATAGRAM_SOFT_LIMIT`.
pub fn encode_datagram(message: &Message) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(message)?)
}

pub fn decode_datagram(bytes: &[u8]) -> Result<Message, CodecError> {
    decode_payload(bytes)
}
