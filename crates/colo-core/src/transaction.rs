//! The checkpoint transaction: one round of the Primary/Secondary handshake.

use std::io::Read;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::arbiter::FailoverArbiter;
use crate::buffer::CheckpointBuffer;
use crate::channel::{expect, get_payload, put_payload, put_token};
use crate::collaborators::{
    IothreadLock, NetworkProxy, RamCache, StateLoader, StateSerializer, VmController,
    VmStateLoadingFlag,
};
use crate::collaborators::ShutdownLatch;
use crate::error::CoreError;
use crate::token::SyncToken;

/// What a completed Primary-side round turned up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    /// The round completed normally; the loop should pace out and run
    /// another one.
    Continue,
    /// The round completed normally and the guest had already requested
    /// shutdown, so `GuestShutdown` was appended to the outbound sequence
    /// right after this round's `CheckpointLoaded` ack. The loop should stop.
    Shutdown,
}

/// What the Secondary's command wait turned up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A new checkpoint round is starting.
    CheckpointNew,
    /// The guest requested shutdown; the Secondary's loop should stop
    /// cleanly rather than attempt another round.
    ShutdownRequested,
}

/// Reads the next command token from the Primary and classifies it.
///
/// Corresponds to spec's `wait_handle_cmd`. Unlike the spec's own framing
/// ("park indefinitely; the main thread will terminate the process"), this
/// returns [`WaitOutcome::ShutdownRequested`] instead of parking forever —
/// a library has no business blocking a thread uninterruptibly on behalf of
/// a process it doesn't own. The caller (`secondary_run`) is responsible for
/// breaking its loop and letting the binary decide how to exit.
pub fn wait_handle_cmd<R: Read>(reader: &mut R) -> Result<WaitOutcome, CoreError> {
    let raw = crate::channel::get_value(reader)?;
    match SyncToken::try_from_u64(raw) {
        Ok(SyncToken::CheckpointNew) => Ok(WaitOutcome::CheckpointNew),
        Ok(SyncToken::GuestShutdown) => Ok(WaitOutcome::ShutdownRequested),
        Ok(_) | Err(_) => Err(CoreError::ProtocolViolation {
            expected: None,
            received: raw,
        }),
    }
}

/// Runs one Primary-side checkpoint round.
///
/// Follows spec §4.C's 14-step sequence: signal a new round, wait for the
/// Secondary to suspend, stop the local VM under the iothread lock, let the
/// proxy mark the checkpoint boundary, serialize state, ship the payload,
/// wait for the Secondary's received/loaded acks, and only then resume the
/// VM — per §8 P3, the Primary's VM must stay stopped until `CheckpointLoaded`
/// is observed, so the Secondary's VM never runs ahead of a state the
/// Secondary hasn't actually finished loading. Checks `failover_requested`
/// both before the VM-stop critical section and after the round completes,
/// per spec's explicit two-check placement.
///
/// If the round completes and the guest has already requested shutdown, the
/// tail of this same round (spec §4.C step 12, not a bare stand-alone
/// message — see §8 P1's `(NEW, SEND, [GUEST_SHUTDOWN?])+` sequence) appends
/// `GuestShutdown` to the outbound wire and returns [`RoundOutcome::Shutdown`].
#[allow(clippy::too_many_arguments)]
pub fn perform_checkpoint<W: std::io::Write, R: Read>(
    writer: &mut W,
    reader: &mut R,
    buffer: &mut CheckpointBuffer,
    vm: &Arc<dyn VmController>,
    serializer: &dyn StateSerializer,
    proxy: &Arc<Mutex<dyn NetworkProxy>>,
    ram_cache: &dyn RamCache,
    iothread: &IothreadLock,
    arbiter: &Arc<FailoverArbiter>,
    shutdown: &ShutdownLatch,
) -> Result<RoundOutcome, CoreError> {
    if arbiter.is_requested() {
        return Err(CoreError::FailoverRequested);
    }

    debug!("starting checkpoint round");
    put_token(writer, SyncToken::CheckpointNew)?;
    expect(reader, SyncToken::CheckpointSuspended)?;

    iothread.with_lock(|| -> Result<(), CoreError> {
        vm.stop()?;
        proxy
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .checkpoint()?;
        serializer.serialize(buffer)?;
        Ok(())
    })?;

    put_token(writer, SyncToken::CheckpointSend)?;
    put_payload(writer, buffer.as_slice())?;
    expect(reader, SyncToken::CheckpointReceived)?;
    expect(reader, SyncToken::CheckpointLoaded)?;

    iothread.with_lock(|| -> Result<(), CoreError> { vm.resume() })?;

    ram_cache.account_round()?;

    if arbiter.is_requested() {
        return Err(CoreError::FailoverRequested);
    }

    if shutdown.is_requested() {
        put_token(writer, SyncToken::GuestShutdown)?;
        debug!("guest shutdown appended after round completion");
        return Ok(RoundOutcome::Shutdown);
    }

    debug!("checkpoint round complete");
    Ok(RoundOutcome::Continue)
}

/// Runs one Secondary-side checkpoint round, having already observed
/// [`WaitOutcome::CheckpointNew`] from [`wait_handle_cmd`].
///
/// Follows spec §4.C's 12-step sequence: stop the local VM under the
/// iothread lock, notify the network proxy of the checkpoint boundary, and
/// report suspended, receive the payload, ack receipt, load state while
/// `vmstate_loading` is held true (I3), ack loaded, and resume.
#[allow(clippy::too_many_arguments)]
pub fn secondary_round<W: std::io::Write, R: Read>(
    writer: &mut W,
    reader: &mut R,
    buffer: &mut CheckpointBuffer,
    vm: &Arc<dyn VmController>,
    loader: &dyn StateLoader,
    proxy: &Arc<Mutex<dyn NetworkProxy>>,
    iothread: &IothreadLock,
    vmstate_loading: &VmStateLoadingFlag,
) -> Result<(), CoreError> {
    iothread.with_lock(|| -> Result<(), CoreError> {
        vm.stop()?;
        proxy
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .checkpoint()?;
        Ok(())
    })?;
    put_token(writer, SyncToken::CheckpointSuspended)?;

    expect(reader, SyncToken::CheckpointSend)?;
    get_payload(reader, buffer)?;
    put_token(writer, SyncToken::CheckpointReceived)?;

    iothread.with_lock(|| -> Result<(), CoreError> {
        vmstate_loading.set(true);
        let result = loader.load(buffer);
        vmstate_loading.set(false);
        result
    })?;
    put_token(writer, SyncToken::CheckpointLoaded)?;

    iothread.with_lock(|| vm.resume())?;
    Ok(())
}
