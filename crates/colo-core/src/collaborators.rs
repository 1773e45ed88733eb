//! Shared state types and the external collaborator traits this crate calls
//! through but never implements: VM control, state serialization/loading,
//! the network proxy, the RAM cache, and deferred-task scheduling.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Condvar, Mutex};

use serde::Serialize;

use crate::error::CoreError;

/// Which side of a Primary/Secondary pair a checkpoint worker is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Primary,
    Secondary,
}

/// The migration's overall lifecycle state.
///
/// Transitions only ever run `Active -> Colo -> {Completed, Failed}`; there
/// is no path back to `Active` and no direct `Active -> {Completed, Failed}`
/// jump. Enforced by [`MigrationStatusCell::compare_and_set`] rather than by
/// exposing a blind setter. Derives `Serialize` so a management surface can
/// report it directly, the way the teacher's `ExecutionResult` reports its
/// own status enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    Active,
    Colo,
    Completed,
    Failed,
}

impl MigrationState {
    fn as_u8(self) -> u8 {
        match self {
            MigrationState::Active => 0,
            MigrationState::Colo => 1,
            MigrationState::Completed => 2,
            MigrationState::Failed => 3,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => MigrationState::Active,
            1 => MigrationState::Colo,
            2 => MigrationState::Completed,
            _ => MigrationState::Failed,
        }
    }

    fn legal_transition(from: MigrationState, to: MigrationState) -> bool {
        matches!(
            (from, to),
            (MigrationState::Active, MigrationState::Colo)
                | (MigrationState::Colo, MigrationState::Completed)
                | (MigrationState::Colo, MigrationState::Failed)
        )
    }
}

/// The process's migration status, guarded so only legal transitions land.
#[derive(Debug)]
pub struct MigrationStatusCell {
    state: AtomicU8,
}

impl MigrationStatusCell {
    pub fn new(initial: MigrationState) -> Self {
        Self {
            state: AtomicU8::new(initial.as_u8()),
        }
    }

    pub fn get(&self) -> MigrationState {
        MigrationState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Attempts `from -> to`. Returns `false` without mutating anything if
    /// the current state isn't `from`, or if `from -> to` isn't one of the
    /// three legal edges.
    pub fn compare_and_set(&self, from: MigrationState, to: MigrationState) -> bool {
        if !MigrationState::legal_transition(from, to) {
            return false;
        }
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

impl Default for MigrationStatusCell {
    fn default() -> Self {
        Self::new(MigrationState::Active)
    }
}

/// The global iothread lock (a BQL-style critical section).
///
/// Any code holding this lock must not perform blocking I/O or sleep — the
/// checkpoint transaction only ever takes it around VM-state snapshotting
/// and loading, never around channel reads/writes.
#[derive(Debug, Default)]
pub struct IothreadLock {
    inner: Mutex<()>,
}

impl IothreadLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` with the iothread lock held, logging acquire/release at
    /// trace level so critical-section duration is visible in diagnostics
    /// without instrumenting every call site.
    pub fn with_lock<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        tracing::trace!("iothread lock acquired");
        let result = f();
        tracing::trace!("iothread lock released");
        result
    }
}

/// Controls the guest VM: stopping it for a checkpoint, resuming it
/// afterward, and tearing it down on failover.
pub trait VmController: Send + Sync {
    /// Stops guest execution so a consistent snapshot can be taken.
    fn stop(&self) -> Result<(), CoreError>;
    /// Resumes guest execution after a checkpoint round completes.
    fn resume(&self) -> Result<(), CoreError>;
    /// Releases the VM (Primary's post-failover teardown, or Secondary's
    /// promotion path never calls this — see [`VmController::promote`]).
    fn release(&self) -> Result<(), CoreError>;
    /// Promotes a Secondary's VM to run standalone after failover.
    fn promote(&self) -> Result<(), CoreError>;
}

/// Serializes the current VM state into a buffer.
pub trait StateSerializer: Send + Sync {
    fn serialize(&self, into: &mut crate::buffer::CheckpointBuffer) -> Result<(), CoreError>;
}

/// Loads a previously serialized VM state payload back into the VM.
pub trait StateLoader: Send + Sync {
    fn load(&self, from: &crate::buffer::CheckpointBuffer) -> Result<(), CoreError>;
}

/// The packet-comparing network proxy that detects Primary/Secondary
/// execution divergence and buffers outbound Secondary packets.
pub trait NetworkProxy: Send + Sync {
    /// One-time setup before the checkpoint loop starts.
    fn init(&mut self) -> Result<(), CoreError>;
    /// Compares buffered Secondary output against the Primary's, returning
    /// `true` if execution has diverged (a checkpoint is needed).
    fn compare(&mut self) -> Result<bool, CoreError>;
    /// Signals the proxy that a checkpoint boundary has been reached and it
    /// may release buffered Secondary packets.
    fn checkpoint(&mut self) -> Result<(), CoreError>;
    /// Promotes the Secondary's mirrored network state to authoritative as
    /// part of failover.
    fn failover(&mut self) -> Result<(), CoreError>;
    /// Tears down the proxy's resources as part of failover.
    fn destroy(&mut self) -> Result<(), CoreError>;
}

/// Caches a reference copy of VM RAM for incremental (dirty-page-only)
/// checkpoint transfer. This crate never inspects page contents itself —
/// it only asks the cache to account for a completed round.
pub trait RamCache: Send + Sync {
    fn account_round(&self) -> Result<(), CoreError>;
}

/// Schedules a closure to run on the dedicated deferred-task thread, the
/// only thread from which it's safe to take the iothread lock from within a
/// failover action (see [`crate::arbiter::DeferredExecutor`]).
pub trait DeferredScheduler: Send + Sync {
    fn schedule(&self, task: Box<dyn FnOnce() + Send>);
}

/// A one-shot resume signal for the Secondary's checkpoint loop, standing in
/// for a cooperative-fiber runtime's "resume this continuation" call.
///
/// The Secondary's per-round body registers one of these before it waits for
/// the next checkpoint command; the failover action calls
/// [`MigrationResumeHandle::resume`] exactly once to unblock it.
pub trait MigrationResumeHandle: Send {
    fn resume(self: Box<Self>);
}

/// A simple condvar-backed implementation of [`MigrationResumeHandle`],
/// suitable as the production implementation (spec §9's own suggested
/// alternative to a real coroutine: "a condition variable with a one-shot
/// predicate").
#[derive(Debug, Default)]
pub struct CondvarResumeHandle {
    inner: std::sync::Arc<(Mutex<bool>, Condvar)>,
}

impl CondvarResumeHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle that can be handed to a [`DeferredScheduler`] task; calling
    /// [`MigrationResumeHandle::resume`] on it wakes
    /// [`CondvarResumeHandle::wait`].
    pub fn handle(&self) -> Box<dyn MigrationResumeHandle> {
        Box::new(CondvarResumeSignal {
            inner: self.inner.clone(),
        })
    }

    /// Blocks until [`MigrationResumeHandle::resume`] has been called on a
    /// handle derived from this instance.
    pub fn wait(&self) {
        let (lock, condvar) = &*self.inner;
        let mut resumed = lock.lock().unwrap_or_else(|p| p.into_inner());
        while !*resumed {
            resumed = condvar.wait(resumed).unwrap_or_else(|p| p.into_inner());
        }
    }
}

struct CondvarResumeSignal {
    inner: std::sync::Arc<(Mutex<bool>, Condvar)>,
}

impl MigrationResumeHandle for CondvarResumeSignal {
    fn resume(self: Box<Self>) {
        let (lock, condvar) = &*self.inner;
        let mut resumed = lock.lock().unwrap_or_else(|p| p.into_inner());
        *resumed = true;
        condvar.notify_all();
    }
}

/// The Secondary's `vmstate_loading` flag (invariant I3): must only be
/// flipped while the iothread lock is held, so a concurrent VM-execution
/// thread can never observe a half-loaded VM state.
#[derive(Debug, Default)]
pub struct VmStateLoadingFlag {
    loading: AtomicBool,
}

impl VmStateLoadingFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the flag. Caller must be holding the iothread lock (I3); this
    /// type has no way to enforce that beyond the doc contract, matching
    /// spec's own framing of I3 as a discipline, not a mechanism.
    pub fn set(&self, loading: bool) {
        self.loading.store(loading, Ordering::SeqCst);
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }
}

/// Process-wide shutdown latch, set when the guest requests shutdown via
/// [`crate::token::SyncToken::GuestShutdown`].
#[derive(Debug, Default)]
pub struct ShutdownLatch {
    requested: AtomicBool,
}

impl ShutdownLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}
