//! The Primary-side checkpoint loop.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use crate::arbiter::FailoverArbiter;
use crate::buffer::CheckpointBuffer;
use crate::channel::ControlChannel;
use crate::collaborators::{
    DeferredScheduler, IothreadLock, MigrationState, MigrationStatusCell, NetworkProxy, RamCache,
    ShutdownLatch, StateSerializer, VmController,
};
use crate::config::{CheckpointConfig, MIN_PERIOD_MS};
use crate::error::CoreError;
use crate::token::SyncToken;
use crate::transaction::RoundOutcome;

/// Why [`primary_run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationCause {
    /// Failover ran to completion, whether triggered by a management
    /// request or by a transaction-layer error.
    FailoverCompleted,
    /// The guest requested shutdown; the Secondary was notified and no
    /// failover was necessary.
    GuestShutdown,
}

/// Everything the Primary-side loop needs, gathered so [`primary_run`]
/// doesn't take an unwieldy parameter list.
///
/// `proxy` and `vm` are `Arc`-shared because the failover action (run on
/// the dedicated deferred-task thread, not the checkpoint worker thread)
/// needs to reach them too; `serializer` and `ram_cache` never appear in a
/// failover action, so the loop keeps them exclusively.
pub struct PrimaryHandle<C> {
    pub channel: C,
    pub vm: Arc<dyn VmController>,
    pub serializer: Box<dyn StateSerializer>,
    pub proxy: Arc<Mutex<dyn NetworkProxy>>,
    pub ram_cache: Box<dyn RamCache>,
    pub migration_status: Arc<MigrationStatusCell>,
    pub arbiter: Arc<FailoverArbiter>,
    pub scheduler: Arc<dyn DeferredScheduler>,
    pub iothread: Arc<IothreadLock>,
    pub shutdown: Arc<ShutdownLatch>,
}

/// Runs the Primary's checkpoint loop to completion.
///
/// Handshakes once (`Ready`), transitions `Active -> Colo`, initializes the
/// proxy, then repeatedly paces out checkpoint rounds at
/// `CheckpointConfig::global().period_ms()`, polling the proxy for early
/// divergence so a round can start before the full period elapses. Any
/// transaction-layer error (other than an already-in-flight
/// `FailoverRequested`) raises failover itself; a raise from any source —
/// error or external management call — is waited out to completion before
/// this function returns.
pub fn primary_run<C: ControlChannel>(
    mut handle: PrimaryHandle<C>,
    config: &CheckpointConfig,
) -> Result<TerminationCause, CoreError> {
    crate::channel::expect(handle.channel.reader(), SyncToken::Ready)?;
    info!("secondary ready, entering COLO");

    let failed_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    {
        let vm = Arc::clone(&handle.vm);
        let proxy = Arc::clone(&handle.proxy);
        let migration_status = Arc::clone(&handle.migration_status);
        let failed_flag = Arc::clone(&failed_flag);
        handle.arbiter.set_action(move || {
            if let Err(err) = vm.release() {
                warn!(error = %err, "vm release during failover failed");
            }
            if let Err(err) = proxy.lock().unwrap_or_else(|p| p.into_inner()).destroy() {
                warn!(error = %err, "proxy teardown during failover failed");
            }
            let target = if failed_flag.load(Ordering::SeqCst) {
                MigrationState::Failed
            } else {
                MigrationState::Completed
            };
            if !migration_status.compare_and_set(MigrationState::Colo, target) {
                warn!("migration status was not Colo when failover completed");
            }
        });
    }

    if !handle
        .migration_status
        .compare_and_set(MigrationState::Active, MigrationState::Colo)
    {
        warn!("migration status was not Active at COLO entry");
    }

    handle
        .proxy
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .init()
        .map_err(|e| CoreError::ProxyInit(e.to_string()))?;

    let mut buffer = CheckpointBuffer::new();

    loop {
        match wait_for_trigger(&handle.proxy, &handle.arbiter, config) {
            TriggerOutcome::FailoverRequested => {
                handle.arbiter.request(handle.scheduler.as_ref());
                handle.arbiter.wait_for_completion();
                return Ok(TerminationCause::FailoverCompleted);
            }
            TriggerOutcome::ProxyError(err) => {
                warn!(error = %err, "proxy compare failed while pacing, raising failover");
                failed_flag.store(true, Ordering::SeqCst);
                handle.arbiter.request(handle.scheduler.as_ref());
                handle.arbiter.wait_for_completion();
                return Ok(TerminationCause::FailoverCompleted);
            }
            TriggerOutcome::RunRound => {}
        }

        let (reader, writer) = handle.channel.split_mut();
        let result = crate::transaction::perform_checkpoint(
            writer,
            reader,
            &mut buffer,
            &handle.vm,
            handle.serializer.as_ref(),
            &handle.proxy,
            handle.ram_cache.as_ref(),
            &handle.iothread,
            &handle.arbiter,
            &handle.shutdown,
        );

        match result {
            Ok(RoundOutcome::Continue) => continue,
            Ok(RoundOutcome::Shutdown) => {
                info!("guest shutdown signaled to secondary");
                return Ok(TerminationCause::GuestShutdown);
            }
            Err(CoreError::FailoverRequested) => {
                handle.arbiter.wait_for_completion();
                return Ok(TerminationCause::FailoverCompleted);
            }
            Err(err) => {
                warn!(error = %err, "checkpoint round failed, raising failover");
                failed_flag.store(true, Ordering::SeqCst);
                handle.arbiter.request(handle.scheduler.as_ref());
                handle.arbiter.wait_for_completion();
                return Ok(TerminationCause::FailoverCompleted);
            }
        }
    }
}

/// What a pacing wait turned up.
enum TriggerOutcome {
    /// Failover was already requested by someone else; the loop should
    /// raise it and wait for completion rather than run another round.
    FailoverRequested,
    /// The pacing period elapsed, or the proxy reported divergence early
    /// (after the `MIN_PERIOD_MS` floor was still observed) — run a round.
    RunRound,
    /// The proxy's `compare()` call itself failed; per spec step 8's
    /// "Error: break", this surfaces as a failover trigger rather than
    /// being silently treated as "no divergence".
    ProxyError(CoreError),
}

/// Blocks for up to one pacing period, or until the proxy reports
/// divergence, whichever comes first — but never returns [`TriggerOutcome::RunRound`]
/// sooner than [`MIN_PERIOD_MS`] after being called, even on early divergence
/// (spec step 8.b: the floor is enforced regardless of trigger source).
fn wait_for_trigger(
    proxy: &Arc<Mutex<dyn NetworkProxy>>,
    arbiter: &Arc<FailoverArbiter>,
    config: &CheckpointConfig,
) -> TriggerOutcome {
    const TICK_MS: u64 = 10;
    let period_ms = config.period_ms();
    let mut waited_ms = 0u64;
    loop {
        if arbiter.is_requested() {
            return TriggerOutcome::FailoverRequested;
        }
        if waited_ms >= period_ms {
            return TriggerOutcome::RunRound;
        }
        let compare_result = proxy.lock().unwrap_or_else(|p| p.into_inner()).compare();
        match compare_result {
            Ok(true) => {
                if waited_ms < MIN_PERIOD_MS {
                    std::thread::sleep(Duration::from_millis(MIN_PERIOD_MS - waited_ms));
                }
                return TriggerOutcome::RunRound;
            }
            Ok(false) => {}
            Err(err) => return TriggerOutcome::ProxyError(err),
        }
        let tick = TICK_MS.min(period_ms - waited_ms);
        std::thread::sleep(Duration::from_millis(tick));
        waited_ms += tick;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::DeferredExecutor;
    use crate::test_support::{MockNetworkProxy, MockRamCache, MockStateSerializer, MockVmController};
    use std::io::Cursor;

    #[test]
    fn primary_run_completes_failover_when_secondary_never_becomes_ready() {
        // An empty reader makes the initial `expect(Ready)` fail with a
        // channel I/O error, which should still be a clean `Err`, not a panic.
        let channel = crate::channel::DuplexChannel::new(Cursor::new(Vec::<u8>::new()), Vec::<u8>::new());
        let handle = PrimaryHandle {
            channel,
            vm: Arc::new(MockVmController::default()),
            serializer: Box::new(MockStateSerializer::default()),
            proxy: Arc::new(Mutex::new(MockNetworkProxy::default())),
            ram_cache: Box::new(MockRamCache::default()),
            migration_status: Arc::new(MigrationStatusCell::default()),
            arbiter: FailoverArbiter::new(),
            scheduler: Arc::new(DeferredExecutor::spawn()),
            iothread: Arc::new(IothreadLock::new()),
            shutdown: Arc::new(ShutdownLatch::new()),
        };
        let result = primary_run(handle, &CheckpointConfig::default());
        assert!(result.is_err());
    }

    #[test]
    fn primary_run_signals_shutdown_only_after_a_full_round_completes() {
        // A shutdown request alone can't short-circuit the loop (P1's
        // sequence grammar forbids a bare `GuestShutdown`), so the canned
        // reader must carry a complete round's worth of acks before the
        // loop will ever append it.
        let mut incoming = Vec::new();
        crate::channel::put_token(&mut incoming, SyncToken::Ready).unwrap();
        crate::channel::put_token(&mut incoming, SyncToken::CheckpointSuspended).unwrap();
        crate::channel::put_token(&mut incoming, SyncToken::CheckpointReceived).unwrap();
        crate::channel::put_token(&mut incoming, SyncToken::CheckpointLoaded).unwrap();
        let channel = crate::channel::DuplexChannel::new(Cursor::new(incoming), Vec::<u8>::new());
        let shutdown = Arc::new(ShutdownLatch::new());
        shutdown.request();
        let vm = Arc::new(MockVmController::default());
        let handle = PrimaryHandle {
            channel,
            vm: Arc::clone(&vm) as Arc<dyn VmController>,
            serializer: Box::new(MockStateSerializer::default()),
            proxy: Arc::new(Mutex::new(MockNetworkProxy::default())),
            ram_cache: Box::new(MockRamCache::default()),
            migration_status: Arc::new(MigrationStatusCell::default()),
            arbiter: FailoverArbiter::new(),
            scheduler: Arc::new(DeferredExecutor::spawn()),
            iothread: Arc::new(IothreadLock::new()),
            shutdown,
        };
        let config = CheckpointConfig::default();
        config.set_period_ms(0);
        let outcome = primary_run(handle, &config).unwrap();
        assert_eq!(outcome, TerminationCause::GuestShutdown);
        assert_eq!(vm.stop_count.load(Ordering::SeqCst), 1);
        assert_eq!(vm.resume_count.load(Ordering::SeqCst), 1);
    }
}
