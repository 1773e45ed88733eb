//! The reusable checkpoint payload buffer.

use crate::error::CoreError;

/// Base capacity reserved up front so a typical checkpoint round doesn't
/// force a reallocation on its first `CheckpointSend`.
pub const BASE_CAPACITY: usize = 4 * 1024 * 1024;

/// A reusable byte buffer for one round's VM state payload.
///
/// Reused across rounds rather than reallocated: `reset()` truncates to
/// length zero but keeps the underlying allocation, so steady-state
/// checkpointing does no allocation once the buffer has grown to its
/// working size.
#[derive(Debug, Default)]
pub struct CheckpointBuffer {
    bytes: Vec<u8>,
}

impl CheckpointBuffer {
    /// Creates a buffer pre-allocated to [`BASE_CAPACITY`].
    pub fn new() -> Self {
        Self {
            bytes: Vec::with_capacity(BASE_CAPACITY),
        }
    }

    /// Truncates the buffer to empty without releasing its capacity.
    pub fn reset(&mut self) {
        self.bytes.clear();
    }

    /// The current payload as a read-only slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// The current payload length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the buffer currently holds no payload.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Grows the buffer to exactly `len` bytes, zero-filled, and returns a
    /// mutable view for a reader to fill in place.
    ///
    /// Returns [`CoreError::Allocation`] if `len` can't be reserved. Used by
    /// the receiving side of `CheckpointSend` before reading the incoming
    /// payload off the wire.
    pub fn resize_for_incoming(&mut self, len: usize) -> Result<&mut [u8], CoreError> {
        self.bytes.clear();
        self.bytes
            .try_reserve(len)
            .map_err(|_| CoreError::Allocation { requested: len })?;
        self.bytes.resize(len, 0);
        Ok(&mut self.bytes)
    }

    /// Replaces the payload wholesale, e.g. from a serializer's output.
    pub fn set(&mut self, data: Vec<u8>) {
        self.bytes = data;
    }
}
