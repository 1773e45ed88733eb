//! The Secondary-side checkpoint loop.

use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::arbiter::FailoverArbiter;
use crate::buffer::CheckpointBuffer;
use crate::channel::ControlChannel;
use crate::collaborators::{
    DeferredScheduler, IothreadLock, MigrationResumeHandle, MigrationState, MigrationStatusCell,
    NetworkProxy, StateLoader, VmController, VmStateLoadingFlag,
};
use crate::error::CoreError;
use crate::token::SyncToken;
use crate::transaction::WaitOutcome;

/// Why [`secondary_run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecondaryOutcome {
    /// The Primary was presumed lost and this side was promoted to run
    /// standalone.
    FailoverCompleted,
    /// The guest requested shutdown and the Primary propagated it cleanly;
    /// no promotion happened.
    GuestShutdown,
}

/// Everything the Secondary-side loop needs. See [`crate::primary::PrimaryHandle`]
/// for the shared-ownership rationale.
pub struct SecondaryHandle<C> {
    pub channel: C,
    pub vm: Arc<dyn VmController>,
    pub loader: Box<dyn StateLoader>,
    pub proxy: Arc<Mutex<dyn NetworkProxy>>,
    pub migration_status: Arc<MigrationStatusCell>,
    pub arbiter: Arc<FailoverArbiter>,
    pub scheduler: Arc<dyn DeferredScheduler>,
    pub iothread: Arc<IothreadLock>,
    /// Resumed exactly once by the failover action once promotion finishes,
    /// standing in for resuming the loop's suspended continuation. Not
    /// consulted by `secondary_run` itself — `secondary_run` waits on
    /// `arbiter` directly — but available to an external observer (the demo
    /// CLI, or a test) that wants to know when promotion has actually
    /// finished rather than merely started.
    pub resume_handle: Arc<crate::collaborators::CondvarResumeHandle>,
    /// Shared with the failover action (run on the deferred-task thread) so
    /// it can block on I3 before promoting — a round in flight on the
    /// checkpoint worker thread must finish loading state before the VM is
    /// handed over standalone.
    pub vmstate_loading: Arc<VmStateLoadingFlag>,
}

/// Runs the Secondary's checkpoint loop to completion.
///
/// Sends `Ready` once, then repeatedly waits for a command from the
/// Primary. A `CheckpointNew` command runs one round; a `GuestShutdown`
/// command ends the loop cleanly with [`SecondaryOutcome::GuestShutdown`].
/// Any transaction-layer error — including the control channel simply
/// going away, which is how this side observes Primary loss — raises
/// failover (if not already raised) and waits for the scheduled promotion
/// action to finish before returning [`SecondaryOutcome::FailoverCompleted`].
pub fn secondary_run<C: ControlChannel>(
    mut handle: SecondaryHandle<C>,
) -> Result<SecondaryOutcome, CoreError> {
    crate::channel::put_token(handle.channel.writer(), SyncToken::Ready)?;
    info!("reported ready, waiting for commands");

    {
        let vm = Arc::clone(&handle.vm);
        let proxy = Arc::clone(&handle.proxy);
        let migration_status = Arc::clone(&handle.migration_status);
        let resume_handle = Arc::clone(&handle.resume_handle);
        let vmstate_loading = Arc::clone(&handle.vmstate_loading);
        handle.arbiter.set_action(move || {
            // I3: a round's state load, once started, must finish before the
            // VM this closure is about to promote reflects that state.
            while vmstate_loading.is_loading() {
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
            if let Err(err) = proxy.lock().unwrap_or_else(|p| p.into_inner()).failover() {
                warn!(error = %err, "proxy failover promotion failed");
            }
            if let Err(err) = vm.promote() {
                warn!(error = %err, "vm promotion during failover failed");
            }
            if !migration_status.compare_and_set(MigrationState::Colo, MigrationState::Completed) {
                warn!("migration status was not Colo when promotion completed");
            }
            resume_handle.handle().resume();
        });
    }

    let mut buffer = CheckpointBuffer::new();

    loop {
        if handle.arbiter.is_requested() {
            handle.arbiter.wait_for_completion();
            return Ok(SecondaryOutcome::FailoverCompleted);
        }

        let outcome = crate::transaction::wait_handle_cmd(handle.channel.reader());
        match outcome {
            Ok(WaitOutcome::ShutdownRequested) => {
                info!("guest shutdown propagated from primary");
                return Ok(SecondaryOutcome::GuestShutdown);
            }
            Ok(WaitOutcome::CheckpointNew) => {
                let (reader, writer) = handle.channel.split_mut();
                let round = crate::transaction::secondary_round(
                    writer,
                    reader,
                    &mut buffer,
                    &handle.vm,
                    handle.loader.as_ref(),
                    &handle.proxy,
                    &handle.iothread,
                    &handle.vmstate_loading,
                );
                if let Err(err) = round {
                    warn!(error = %err, "checkpoint round failed, raising failover");
                    handle.arbiter.request(handle.scheduler.as_ref());
                    handle.arbiter.wait_for_completion();
                    return Ok(SecondaryOutcome::FailoverCompleted);
                }
            }
            Err(err) => {
                warn!(error = %err, "control channel lost, presuming primary failure");
                handle.arbiter.request(handle.scheduler.as_ref());
                handle.arbiter.wait_for_completion();
                return Ok(SecondaryOutcome::FailoverCompleted);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::DeferredExecutor;
    use crate::collaborators::CondvarResumeHandle;
    use crate::config::CheckpointConfig;
    use crate::test_support::{MockNetworkProxy, MockStateLoader, MockVmController};
    use std::io::Cursor;

    #[test]
    fn secondary_run_promotes_when_channel_closes_immediately() {
        let _ = &CheckpointConfig::default();
        let channel = crate::channel::DuplexChannel::new(Cursor::new(Vec::<u8>::new()), Vec::<u8>::new());
        let handle = SecondaryHandle {
            channel,
            vm: Arc::new(MockVmController::default()),
            loader: Box::new(MockStateLoader::default()),
            proxy: Arc::new(Mutex::new(MockNetworkProxy::default())),
            migration_status: Arc::new(MigrationStatusCell::default()),
            arbiter: FailoverArbiter::new(),
            scheduler: Arc::new(DeferredExecutor::spawn()),
            iothread: Arc::new(IothreadLock::new()),
            resume_handle: Arc::new(CondvarResumeHandle::new()),
            vmstate_loading: Arc::new(VmStateLoadingFlag::new()),
        };
        let outcome = secondary_run(handle).unwrap();
        assert_eq!(outcome, SecondaryOutcome::FailoverCompleted);
    }

    #[test]
    fn secondary_run_reports_guest_shutdown() {
        let mut wire = Vec::new();
        crate::channel::put_token(&mut wire, SyncToken::GuestShutdown).unwrap();
        let channel = crate::channel::DuplexChannel::new(Cursor::new(wire), Vec::<u8>::new());
        let handle = SecondaryHandle {
            channel,
            vm: Arc::new(MockVmController::default()),
            loader: Box::new(MockStateLoader::default()),
            proxy: Arc::new(Mutex::new(MockNetworkProxy::default())),
            migration_status: Arc::new(MigrationStatusCell::default()),
            arbiter: FailoverArbiter::new(),
            scheduler: Arc::new(DeferredExecutor::spawn()),
            iothread: Arc::new(IothreadLock::new()),
            resume_handle: Arc::new(CondvarResumeHandle::new()),
            vmstate_loading: Arc::new(VmStateLoadingFlag::new()),
        };
        let outcome = secondary_run(handle).unwrap();
        assert_eq!(outcome, SecondaryOutcome::GuestShutdown);
    }
}
