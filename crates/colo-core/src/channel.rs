//! Control-channel codec: `put`/`get_value`/`expect` over a pair of
//! blocking half-duplex handles.

use std::io::{Read, Write};

use tracing::error;

use crate::error::CoreError;
use crate::token::SyncToken;

/// The bidirectional control channel, modeled as two independently owned
/// half-file handles over one underlying socket — mirrors COLO's own
/// `to_dst`/`from_dst` (Primary) and `from_src`/`to_src` (Secondary) pair.
pub trait ControlChannel {
    type Reader: Read;
    type Writer: Write;

    fn reader(&mut self) -> &mut Self::Reader;
    fn writer(&mut self) -> &mut Self::Writer;

    /// Borrows both halves at once, for call sites (the checkpoint
    /// transaction) that need to read and write within the same step
    /// without the borrow checker treating two sequential `reader()`/
    /// `writer()` calls as overlapping mutable borrows of `self`.
    fn split_mut(&mut self) -> (&mut Self::Reader, &mut Self::Writer);
}

/// A concrete [`ControlChannel`] over any owned reader/writer pair, such as
/// a cloned `TcpStream` split into a read half and a write half.
pub struct DuplexChannel<R, W> {
    pub reader: R,
    pub writer: W,
}

impl<R, W> DuplexChannel<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }
}

impl<R: Read, W: Write> ControlChannel for DuplexChannel<R, W> {
    type Reader = R;
    type Writer = W;

    fn reader(&mut self) -> &mut Self::Reader {
        &mut self.reader
    }

    fn writer(&mut self) -> &mut Self::Writer {
        &mut self.writer
    }

    fn split_mut(&mut self) -> (&mut Self::Reader, &mut Self::Writer) {
        (&mut self.reader, &mut self.writer)
    }
}

/// Writes a 64-bit big-endian value to `writer` and flushes it.
///
/// Flushing every `put` keeps each token a distinct, immediately-visible
/// wire event rather than something that might sit in a buffer until a
/// later write coalesces it — the handshake steps depend on the peer
/// observing each token as soon as it's sent.
pub fn put<W: Write>(writer: &mut W, value: u64) -> Result<(), CoreError> {
    writer.write_all(&value.to_be_bytes())?;
    writer.flush()?;
    Ok(())
}

/// Reads one 64-bit big-endian value off `reader`.
pub fn get_value<R: Read>(reader: &mut R) -> Result<u64, CoreError> {
    let mut raw = [0u8; 8];
    reader.read_exact(&mut raw)?;
    Ok(u64::from_be_bytes(raw))
}

/// Reads one token and confirms it matches `expected`.
///
/// A mismatch or an unrecognized value is a fatal protocol error for the
/// transaction in progress — surfaced as [`CoreError::ProtocolViolation`]
/// rather than terminating the process, logged first via `tracing::error!`
/// so the expected/received pair is visible even though the error is
/// recoverable at the loop layer.
pub fn expect<R: Read>(reader: &mut R, expected: SyncToken) -> Result<(), CoreError> {
    let raw = get_value(reader)?;
    match SyncToken::try_from_u64(raw) {
        Ok(token) if token.as_u64() == expected.as_u64() => Ok(()),
        Ok(_) | Err(_) => {
            error!(expected = expected.as_u64(), received = raw, "protocol violation");
            Err(CoreError::ProtocolViolation {
                expected: Some(expected.as_u64()),
                received: raw,
            })
        }
    }
}

/// Writes a token.
pub fn put_token<W: Write>(writer: &mut W, token: SyncToken) -> Result<(), CoreError> {
    put(writer, token.as_u64())
}

/// Writes a length-prefixed payload: an 8-byte big-endian length followed by
/// the bytes themselves. Used to carry the VM state payload after
/// `CheckpointSend`.
pub fn put_payload<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), CoreError> {
    put(writer, payload.len() as u64)?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Reads a length-prefixed payload into `buffer`, growing it as needed, and
/// returns the number of bytes read.
pub fn get_payload<R: Read>(
    reader: &mut R,
    buffer: &mut crate::buffer::CheckpointBuffer,
) -> Result<usize, CoreError> {
    let len = get_value(reader)? as usize;
    let view = buffer.resize_for_incoming(len)?;
    reader.read_exact(view)?;
    Ok(len)
}
