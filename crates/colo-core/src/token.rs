//! Sync token wire format for the COLO control channel.
//!
//! Every token crossing the control or data channel is an unsigned 64-bit
//! big-endian integer drawn from this enumeration. Both the Primary and the
//! Secondary link against the same table, so the numeric assignments are
//! fixed here rather than derived or negotiated.

use crate::error::CoreError;

/// One opcode exchanged on the control or data channel.
///
/// `Ready` is pinned to `0x46`; the rest are contiguous following it, in
/// declaration order, per the shared enumeration both sides link against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncToken {
    /// Secondary → Primary, once per session, before the checkpoint loop starts.
    Ready,
    /// Primary → Secondary: a new checkpoint round begins.
    CheckpointNew,
    /// Secondary → Primary: the Secondary's VM has stopped.
    CheckpointSuspended,
    /// Primary → Secondary: a length-prefixed VM state payload follows.
    CheckpointSend,
    /// Secondary → Primary: the payload has been fully received.
    CheckpointReceived,
    /// Secondary → Primary: the payload has been loaded into the VM.
    CheckpointLoaded,
    /// Primary → Secondary, at most once per transaction tail: the guest requested shutdown.
    GuestShutdown,
}

impl SyncToken {
    /// The fixed wire value of [`SyncToken::Ready`].
    pub const READY: u64 = 0x46;

    /// Encodes this token as its 64-bit wire value.
    pub const fn as_u64(self) -> u64 {
        match self {
            SyncToken::Ready => Self::READY,
            SyncToken::CheckpointNew => Self::READY + 1,
            SyncToken::CheckpointSuspended => Self::READY + 2,
            SyncToken::CheckpointSend => Self::READY + 3,
            SyncToken::CheckpointReceived => Self::READY + 4,
            SyncToken::CheckpointLoaded => Self::READY + 5,
            SyncToken::GuestShutdown => Self::READY + 6,
        }
    }

    /// Decodes a wire value into a token.
    ///
    /// An unrecognized value is a fatal protocol error: it terminates the
    /// checkpoint transaction that received it (spec §3: "An unrecognized or
    /// unexpected token on receipt is a fatal protocol error").
    pub fn try_from_u64(value: u64) -> Result<Self, CoreError> {
        let token = match value {
            v if v == SyncToken::Ready.as_u64() => SyncToken::Ready,
            v if v == SyncToken::CheckpointNew.as_u64() => SyncToken::CheckpointNew,
            v if v == SyncToken::CheckpointSuspended.as_u64() => SyncToken::CheckpointSuspended,
            v if v == SyncToken::CheckpointSend.as_u64() => SyncToken::CheckpointSend,
            v if v == SyncToken::CheckpointReceived.as_u64() => SyncToken::CheckpointReceived,
            v if v == SyncToken::CheckpointLoaded.as_u64() => SyncToken::CheckpointLoaded,
            v if v == SyncToken::GuestShutdown.as_u64() => SyncToken::GuestShutdown,
            other => {
                return Err(CoreError::ProtocolViolation {
                    expected: None,
                    received: other,
                })
            }
        };
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_is_pinned_to_0x46() {
        assert_eq!(SyncToken::Ready.as_u64(), 0x46);
    }

    #[test]
    fn tokens_are_contiguous_following_ready() {
        let expected = [
            SyncToken::Ready,
            SyncToken::CheckpointNew,
            SyncToken::CheckpointSuspended,
            SyncToken::CheckpointSend,
            SyncToken::CheckpointReceived,
            SyncToken::CheckpointLoaded,
            SyncToken::GuestShutdown,
        ];
        for (offset, token) in expected.iter().enumerate() {
            assert_eq!(token.as_u64(), SyncToken::READY + offset as u64);
        }
    }

    #[test]
    fn round_trips_through_try_from_u64() {
        for token in [
            SyncToken::Ready,
            SyncToken::CheckpointNew,
            SyncToken::CheckpointSuspended,
            SyncToken::CheckpointSend,
            SyncToken::CheckpointReceived,
            SyncToken::CheckpointLoaded,
            SyncToken::GuestShutdown,
        ] {
            assert_eq!(SyncToken::try_from_u64(token.as_u64()).unwrap(), token);
        }
    }

    #[test]
    fn unrecognized_value_is_a_protocol_violation() {
        let err = SyncToken::try_from_u64(0xDEAD_BEEF).unwrap_err();
        match err {
            CoreError::ProtocolViolation { expected, received } => {
                assert_eq!(expected, None);
                assert_eq!(received, 0xDEAD_BEEF);
            }
            other => panic!("expected ProtocolViolation, got {other:?}"),
        }
    }
}
