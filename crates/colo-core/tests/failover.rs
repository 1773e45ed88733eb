//! S4: the Secondary promotes itself when the Primary disappears. P4: a
//! failover raised from two directions at once (an external management
//! request racing a transaction-layer error) still only runs the promotion
//! action once. P7: the migration status only ever reaches `Completed`
//! through the `Colo` state, never directly.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use colo_core::test_support::{
    tcp_channel_pair, MockNetworkProxy, MockRamCache, MockStateLoader, MockStateSerializer,
    MockVmController,
};
use colo_core::{
    CheckpointConfig, CondvarResumeHandle, ControlChannel, DeferredExecutor, DeferredScheduler,
    FailoverArbiter, IothreadLock, MigrationState, MigrationStatusCell, PrimaryHandle,
    SecondaryHandle, SecondaryOutcome, ShutdownLatch, TerminationCause, VmController,
};

#[test]
fn secondary_promotes_when_primary_connection_is_dropped() {
    let (primary_channel, secondary_channel) = tcp_channel_pair().unwrap();

    // Stand in for the Primary just long enough to send `Ready`'s reply,
    // then drop the connection outright to simulate it vanishing.
    drop(primary_channel);

    let secondary_vm = Arc::new(MockVmController::default());
    let migration_status = Arc::new(MigrationStatusCell::default());
    migration_status.compare_and_set(MigrationState::Active, MigrationState::Colo);

    let handle = SecondaryHandle {
        channel: secondary_channel,
        vm: Arc::clone(&secondary_vm) as Arc<dyn VmController>,
        loader: Box::new(MockStateLoader::default()),
        proxy: Arc::new(Mutex::new(MockNetworkProxy::default())),
        migration_status: Arc::clone(&migration_status),
        arbiter: FailoverArbiter::new(),
        scheduler: Arc::new(DeferredExecutor::spawn()),
        iothread: Arc::new(IothreadLock::new()),
        resume_handle: Arc::new(CondvarResumeHandle::new()),
        vmstate_loading: Arc::new(colo_core::VmStateLoadingFlag::new()),
    };

    let outcome = colo_core::secondary_run(handle).unwrap();
    assert_eq!(outcome, SecondaryOutcome::FailoverCompleted);
    assert_eq!(secondary_vm.promote_count.load(Ordering::SeqCst), 1);
    assert_eq!(migration_status.get(), MigrationState::Completed);
}

#[test]
fn concurrent_external_and_internal_failover_triggers_run_promotion_once() {
    let (primary_channel, mut secondary_channel) = tcp_channel_pair().unwrap();

    // Stand in for the Secondary just long enough to report `Ready`, then
    // vanish, so the Primary's first round fails mid-transaction.
    std::thread::spawn(move || {
        colo_core::channel::put_token(secondary_channel.writer(), colo_core::SyncToken::Ready)
            .unwrap();
        drop(secondary_channel);
    })
    .join()
    .unwrap();

    let config = Arc::new(CheckpointConfig::default());
    config.set_period_ms(5_000);

    let primary_vm = Arc::new(MockVmController::default());
    let migration_status = Arc::new(MigrationStatusCell::default());
    let arbiter = FailoverArbiter::new();
    let scheduler: Arc<dyn DeferredScheduler> = Arc::new(DeferredExecutor::spawn());
    let shutdown = Arc::new(ShutdownLatch::new());

    let handle = PrimaryHandle {
        channel: primary_channel,
        vm: Arc::clone(&primary_vm) as Arc<dyn VmController>,
        serializer: Box::new(MockStateSerializer::default()),
        proxy: Arc::new(Mutex::new(MockNetworkProxy::default())),
        ram_cache: Box::new(MockRamCache::default()),
        migration_status: Arc::clone(&migration_status),
        arbiter: Arc::clone(&arbiter),
        scheduler: Arc::clone(&scheduler),
        iothread: Arc::new(IothreadLock::new()),
        shutdown,
    };

    // Also fire an external management-style request at roughly the same
    // time as the transaction layer's own read-error-triggered raise. A
    // short delay lets `primary_run` finish registering its action first —
    // `set_action` happens once, right at session start, well before any
    // real management command could reach a running session.
    let external_arbiter = Arc::clone(&arbiter);
    let external_scheduler = Arc::clone(&scheduler);
    std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(20));
        external_arbiter.request(external_scheduler.as_ref());
    });

    let outcome = colo_core::primary_run(handle, &config).unwrap();
    assert_eq!(outcome, TerminationCause::FailoverCompleted);
    assert_eq!(
        primary_vm.release_count.load(Ordering::SeqCst),
        1,
        "release() must run exactly once even with two failover triggers racing"
    );
    assert_eq!(migration_status.get(), MigrationState::Failed);
}
