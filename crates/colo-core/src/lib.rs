//! Checkpoint transaction state machine, failover protocol, and checkpoint
//! loop for COLO-style Primary/Secondary VM lock-stepping.
//!
//! This crate implements the control-plane logic only. VM execution,
//! state (de)serialization, the packet-comparing network proxy, and RAM
//! caching are external collaborators defined here as traits
//! ([`collaborators`]) and supplied by the embedder.

pub mod arbiter;
pub mod buffer;
pub mod channel;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod primary;
pub mod secondary;
pub mod token;
pub mod transaction;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use arbiter::{DeferredExecutor, FailoverArbiter};
pub use buffer::CheckpointBuffer;
pub use channel::{ControlChannel, DuplexChannel};
pub use collaborators::{
    CondvarResumeHandle, DeferredScheduler, IothreadLock, MigrationResumeHandle, MigrationState,
    MigrationStatusCell, NetworkProxy, RamCache, Role, ShutdownLatch, StateLoader,
    StateSerializer, VmController, VmStateLoadingFlag,
};
pub use config::CheckpointConfig;
pub use error::CoreError;
pub use primary::{primary_run, PrimaryHandle, TerminationCause};
pub use secondary::{secondary_run, SecondaryHandle, SecondaryOutcome};
pub use token::SyncToken;
pub use transaction::{perform_checkpoint, secondary_round, wait_handle_cmd, RoundOutcome, WaitOutcome};
