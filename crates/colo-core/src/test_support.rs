//! Deterministic mock collaborators, shared by the inline unit tests, the
//! `tests/` integration suite, and the CLI's demo subcommand.

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::buffer::CheckpointBuffer;
use crate::channel::DuplexChannel;
use crate::collaborators::{NetworkProxy, RamCache, StateLoader, StateSerializer, VmController};
use crate::error::CoreError;

/// A `VmController` that records call counts and never fails.
#[derive(Debug, Default)]
pub struct MockVmController {
    pub stop_count: AtomicUsize,
    pub resume_count: AtomicUsize,
    pub release_count: AtomicUsize,
    pub promote_count: AtomicUsize,
}

impl VmController for MockVmController {
    fn stop(&self) -> Result<(), CoreError> {
        self.stop_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn resume(&self) -> Result<(), CoreError> {
        self.resume_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self) -> Result<(), CoreError> {
        self.release_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn promote(&self) -> Result<(), CoreError> {
        self.promote_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A `StateSerializer` that writes a fixed, recognizable payload.
#[derive(Debug, Default)]
pub struct MockStateSerializer {
    pub payload: Vec<u8>,
}

impl StateSerializer for MockStateSerializer {
    fn serialize(&self, into: &mut CheckpointBuffer) -> Result<(), CoreError> {
        let data = if self.payload.is_empty() {
            b"mock-vm-state".to_vec()
        } else {
            self.payload.clone()
        };
        into.set(data);
        Ok(())
    }
}

/// A `StateLoader` that records the payload it was handed.
#[derive(Debug, Default)]
pub struct MockStateLoader {
    pub last_loaded: Mutex<Vec<u8>>,
}

impl StateLoader for MockStateLoader {
    fn load(&self, from: &CheckpointBuffer) -> Result<(), CoreError> {
        *self.last_loaded.lock().unwrap_or_else(|p| p.into_inner()) = from.as_slice().to_vec();
        Ok(())
    }
}

/// A `NetworkProxy` that never reports divergence unless told to.
#[derive(Debug, Default)]
pub struct MockNetworkProxy {
    pub init_count: AtomicUsize,
    pub compare_count: AtomicUsize,
    pub checkpoint_count: AtomicUsize,
    pub failover_count: AtomicUsize,
    pub destroy_count: AtomicUsize,
    pub report_diverged: bool,
}

impl NetworkProxy for MockNetworkProxy {
    fn init(&mut self) -> Result<(), CoreError> {
        self.init_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn compare(&mut self) -> Result<bool, CoreError> {
        self.compare_count.fetch_add(1, Ordering::SeqCst);
        Ok(self.report_diverged)
    }

    fn checkpoint(&mut self) -> Result<(), CoreError> {
        self.checkpoint_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn failover(&mut self) -> Result<(), CoreError> {
        self.failover_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn destroy(&mut self) -> Result<(), CoreError> {
        self.destroy_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A `RamCache` that just counts accounted rounds.
#[derive(Debug, Default)]
pub struct MockRamCache {
    pub rounds: AtomicUsize,
}

impl RamCache for MockRamCache {
    fn account_round(&self) -> Result<(), CoreError> {
        self.rounds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Opens a loopback TCP connection and returns a [`DuplexChannel`] pair, one
/// per end, each built from its own cloned `TcpStream` (mirroring "two
/// half-file handles over the same underlying socket").
pub fn tcp_channel_pair() -> std::io::Result<(
    DuplexChannel<TcpStream, TcpStream>,
    DuplexChannel<TcpStream, TcpStream>,
)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let client = TcpStream::connect(addr)?;
    let (server, _) = listener.accept()?;

    let server_channel = DuplexChannel::new(server.try_clone()?, server);
    let client_channel = DuplexChannel::new(client.try_clone()?, client);
    Ok((server_channel, client_channel))
}
