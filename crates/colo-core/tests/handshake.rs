//! S1: a full Primary/Secondary pair runs several clean checkpoint rounds
//! over a real loopback TCP connection and then shuts down cleanly.
//! Also covers P1 (sync token wire format) and P3 (step ordering) by virtue
//! of the codec being the only thing on the wire, and P6 (buffer reuse)
//! implicitly by running multiple rounds through one `CheckpointBuffer`.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use colo_core::test_support::{
    tcp_channel_pair, MockNetworkProxy, MockRamCache, MockStateLoader, MockStateSerializer,
    MockVmController,
};
use colo_core::{
    CheckpointConfig, CondvarResumeHandle, DeferredExecutor, FailoverArbiter, IothreadLock,
    MigrationStatusCell, PrimaryHandle, SecondaryHandle, SecondaryOutcome, ShutdownLatch,
    TerminationCause,
};

#[test]
fn clean_rounds_then_guest_shutdown() {
    let (primary_channel, secondary_channel) = tcp_channel_pair().unwrap();

    let config = CheckpointConfig::default();
    config.set_period_ms(20);
    let config = Arc::new(config);

    let primary_vm = Arc::new(MockVmController::default());
    let primary_serializer = MockStateSerializer {
        payload: b"snapshot-a".to_vec(),
    };
    let primary_proxy: Arc<Mutex<dyn colo_core::NetworkProxy>> =
        Arc::new(Mutex::new(MockNetworkProxy::default()));
    let primary_ram_cache = MockRamCache::default();
    let primary_migration_status = Arc::new(MigrationStatusCell::default());
    let primary_arbiter = FailoverArbiter::new();
    let primary_shutdown = Arc::new(ShutdownLatch::new());

    let secondary_vm = Arc::new(MockVmController::default());
    let secondary_loader = MockStateLoader::default();
    let secondary_proxy: Arc<Mutex<dyn colo_core::NetworkProxy>> =
        Arc::new(Mutex::new(MockNetworkProxy::default()));
    let secondary_migration_status = Arc::new(MigrationStatusCell::default());
    let secondary_arbiter = FailoverArbiter::new();

    let primary_vm_for_loop = Arc::clone(&primary_vm);
    let primary_shutdown_for_driver = Arc::clone(&primary_shutdown);
    let primary_config = Arc::clone(&config);

    let primary_thread = std::thread::Builder::new()
        .name("test-primary".into())
        .spawn(move || {
            let handle = PrimaryHandle {
                channel: primary_channel,
                vm: primary_vm_for_loop,
                serializer: Box::new(primary_serializer),
                proxy: primary_proxy,
                ram_cache: Box::new(primary_ram_cache),
                migration_status: primary_migration_status,
                arbiter: primary_arbiter,
                scheduler: Arc::new(DeferredExecutor::spawn()),
                iothread: Arc::new(IothreadLock::new()),
                shutdown: primary_shutdown_for_driver,
            };
            colo_core::primary_run(handle, &primary_config)
        })
        .unwrap();

    let secondary_vm_for_loop = Arc::clone(&secondary_vm);
    let secondary_thread = std::thread::Builder::new()
        .name("test-secondary".into())
        .spawn(move || {
            let handle = SecondaryHandle {
                channel: secondary_channel,
                vm: secondary_vm_for_loop,
                loader: Box::new(secondary_loader),
                proxy: secondary_proxy,
                migration_status: secondary_migration_status,
                arbiter: secondary_arbiter,
                scheduler: Arc::new(DeferredExecutor::spawn()),
                iothread: Arc::new(IothreadLock::new()),
                resume_handle: Arc::new(CondvarResumeHandle::new()),
                vmstate_loading: Arc::new(colo_core::VmStateLoadingFlag::new()),
            };
            colo_core::secondary_run(handle)
        })
        .unwrap();

    // Let a handful of rounds happen, then ask the primary to shut down.
    std::thread::sleep(std::time::Duration::from_millis(120));
    primary_shutdown.request();

    let primary_outcome = primary_thread.join().unwrap().unwrap();
    let secondary_outcome = secondary_thread.join().unwrap().unwrap();

    assert_eq!(primary_outcome, TerminationCause::GuestShutdown);
    assert_eq!(secondary_outcome, SecondaryOutcome::GuestShutdown);

    assert!(primary_vm.stop_count.load(Ordering::SeqCst) > 0);
    assert!(secondary_vm.stop_count.load(Ordering::SeqCst) > 0);
    assert_eq!(
        secondary_vm.stop_count.load(Ordering::SeqCst),
        secondary_vm.resume_count.load(Ordering::SeqCst)
    );
}
