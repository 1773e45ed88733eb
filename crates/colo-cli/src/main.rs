use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Parser, Subcommand};
use colo_core::test_support::{
    tcp_channel_pair, MockNetworkProxy, MockRamCache, MockStateLoader, MockStateSerializer,
    MockVmController,
};
use colo_core::{
    CheckpointConfig, CondvarResumeHandle, DeferredExecutor, DeferredScheduler, FailoverArbiter,
    IothreadLock, MigrationState, MigrationStatusCell, NetworkProxy, PrimaryHandle,
    SecondaryHandle, ShutdownLatch, VmController,
};

/// Runs a Primary/Secondary COLO pair over a loopback TCP channel, using the
/// mock collaborators from `colo-core`'s `test-support` feature in place of
/// a real hypervisor, proxy, and state codec.
#[derive(Parser, Debug)]
#[command(name = "colo-cli", about = "Demo harness for the colo-core checkpoint loop")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a demo Primary/Secondary pair for a fixed duration.
    Run {
        /// Checkpoint period in milliseconds.
        #[arg(long, default_value_t = 200)]
        period_ms: u64,
        /// How long to let the pair run before the guest "shuts down".
        #[arg(long, default_value_t = 1_000)]
        duration_ms: u64,
        /// Have the mock network proxy report divergence on every compare,
        /// forcing a checkpoint round well before the period elapses.
        #[arg(long)]
        diverge: bool,
        /// Instead of letting the run finish cleanly, raise failover this
        /// many milliseconds after the pair starts — the demo equivalent of
        /// a lost-heartbeat management command.
        #[arg(long)]
        fail_after_ms: Option<u64>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    match args.command {
        Command::Run {
            period_ms,
            duration_ms,
            diverge,
            fail_after_ms,
        } => run(period_ms, duration_ms, diverge, fail_after_ms),
    }
}

#[derive(Debug, serde::Serialize)]
struct RunSummary {
    primary_outcome: String,
    secondary_outcome: String,
    primary_rounds: usize,
    secondary_loads: usize,
    primary_migration_state: MigrationState,
    secondary_migration_state: MigrationState,
}

fn run(
    period_ms: u64,
    duration_ms: u64,
    diverge: bool,
    fail_after_ms: Option<u64>,
) -> anyhow::Result<()> {
    let (primary_channel, secondary_channel) =
        tcp_channel_pair().map_err(|e| anyhow::anyhow!("failed to open loopback channel: {e}"))?;

    let config = CheckpointConfig::default();
    config.set_period_ms(period_ms);

    let primary_vm = Arc::new(MockVmController::default());
    let primary_proxy = Arc::new(Mutex::new(MockNetworkProxy {
        report_diverged: diverge,
        ..Default::default()
    }));
    let ram_cache = Box::new(MockRamCache::default());
    let primary_migration = Arc::new(MigrationStatusCell::default());
    let primary_arbiter = FailoverArbiter::new();
    let primary_scheduler: Arc<dyn DeferredScheduler> = Arc::new(DeferredExecutor::spawn());
    let primary_shutdown = Arc::new(ShutdownLatch::new());

    let primary_handle = PrimaryHandle {
        channel: primary_channel,
        vm: Arc::clone(&primary_vm) as Arc<dyn VmController>,
        serializer: Box::new(MockStateSerializer::default()),
        proxy: Arc::clone(&primary_proxy) as Arc<Mutex<dyn NetworkProxy>>,
        ram_cache,
        migration_status: Arc::clone(&primary_migration),
        arbiter: Arc::clone(&primary_arbiter),
        scheduler: Arc::clone(&primary_scheduler),
        iothread: Arc::new(IothreadLock::new()),
        shutdown: Arc::clone(&primary_shutdown),
    };

    let secondary_vm = Arc::new(MockVmController::default());
    let loader = Box::new(MockStateLoader::default());
    let secondary_migration = Arc::new(MigrationStatusCell::default());
    let secondary_arbiter = FailoverArbiter::new();
    let secondary_scheduler: Arc<dyn DeferredScheduler> = Arc::new(DeferredExecutor::spawn());

    let secondary_handle = SecondaryHandle {
        channel: secondary_channel,
        vm: Arc::clone(&secondary_vm) as Arc<dyn VmController>,
        loader,
        proxy: Arc::new(Mutex::new(MockNetworkProxy::default())),
        migration_status: Arc::clone(&secondary_migration),
        arbiter: Arc::clone(&secondary_arbiter),
        scheduler: Arc::clone(&secondary_scheduler),
        iothread: Arc::new(IothreadLock::new()),
        resume_handle: Arc::new(CondvarResumeHandle::new()),
        vmstate_loading: Arc::new(colo_core::VmStateLoadingFlag::new()),
    };

    let primary_thread = std::thread::Builder::new()
        .name("colo-primary".into())
        .spawn(move || colo_core::primary_run(primary_handle, &config))
        .expect("failed to spawn colo-primary thread");

    let secondary_thread = std::thread::Builder::new()
        .name("colo-secondary".into())
        .spawn(move || colo_core::secondary_run(secondary_handle))
        .expect("failed to spawn colo-secondary thread");

    if let Some(delay_ms) = fail_after_ms {
        let arbiter = Arc::clone(&primary_arbiter);
        let scheduler = Arc::clone(&primary_scheduler);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(delay_ms));
            arbiter.request(scheduler.as_ref());
        });
    } else {
        std::thread::sleep(Duration::from_millis(duration_ms));
        primary_shutdown.request();
    }

    let primary_outcome = primary_thread.join().expect("primary thread panicked");
    let secondary_outcome = secondary_thread.join().expect("secondary thread panicked");

    let summary = RunSummary {
        primary_outcome: describe(&primary_outcome),
        secondary_outcome: describe_secondary(&secondary_outcome),
        primary_rounds: primary_vm.stop_count.load(Ordering::SeqCst),
        secondary_loads: secondary_vm.stop_count.load(Ordering::SeqCst),
        primary_migration_state: primary_migration.get(),
        secondary_migration_state: secondary_migration.get(),
    };
    println!(
        "{}",
        serde_json::to_string(&summary).expect("RunSummary is always serializable")
    );

    let failed = primary_outcome.is_err() || secondary_outcome.is_err();
    if failed {
        std::process::exit(1);
    }
    Ok(())
}

fn describe(outcome: &Result<colo_core::TerminationCause, colo_core::CoreError>) -> String {
    match outcome {
        Ok(colo_core::TerminationCause::FailoverCompleted) => "failover-completed".into(),
        Ok(colo_core::TerminationCause::GuestShutdown) => "guest-shutdown".into(),
        Err(e) => format!("error: {e}"),
    }
}

fn describe_secondary(outcome: &Result<colo_core::SecondaryOutcome, colo_core::CoreError>) -> String {
    match outcome {
        Ok(colo_core::SecondaryOutcome::FailoverCompleted) => "failover-completed".into(),
        Ok(colo_core::SecondaryOutcome::GuestShutdown) => "guest-shutdown".into(),
        Err(e) => format!("error: {e}"),
    }
}
