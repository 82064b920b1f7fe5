//! Veil integration test harness.
//!
//! Each test builds a handful of full sessions over one in-process mesh
//! (see `infra.rs`) and drives them through the public session API. No
//! sockets, no proxy, no root; every node gets its own temp directory.

mod infra;

mod bootstrap;
mod communities;
mod peers;
mod settings;
mod transfers;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};

use veil_core::config::VeilConfig;
use veil_core::PeerId;
use veil_services::{ContentStore, MemoryBackend, Session};

pub use infra::{Mesh, MeshTransport};

static NODE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Short timeouts and retry budgets so failure paths finish quickly.
pub fn test_config() -> VeilConfig {
    let mut config = VeilConfig::default();
    config.transport.bootstrap_timeout_ms = 1_000;
    config.transport.bootstrap_retries = 2;
    config.transport.bootstrap_backoff_ms = 10;
    config.transfer.max_retries = 2;
    config.transfer.backoff_base_ms = 10;
    config.transfer.backoff_max_ms = 50;
    config.transfer.read_timeout_ms = 2_000;
    config.health.debounce_ms = 0;
    config.directory.page_size = 2;
    config
}

pub struct Node {
    pub id: PeerId,
    pub session: Arc<Session>,
    pub transport: Arc<MeshTransport>,
    pub backend: Arc<MemoryBackend>,
    pub dir: PathBuf,
}

impl Node {
    pub fn new(mesh: &Arc<Mesh>) -> Self {
        Self::build(mesh, Arc::new(MemoryBackend::new()), |_| {})
    }

    /// Node with a pre-seeded settings backend and a chance to set up the
    /// transport before the session starts.
    pub fn build(
        mesh: &Arc<Mesh>,
        backend: Arc<MemoryBackend>,
        setup: impl FnOnce(&MeshTransport),
    ) -> Self {
        let n = NODE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!("veil-it-{}-{}", std::process::id(), n));
        let store = ContentStore::new(dir.join("store")).unwrap();
        let transport = Arc::new(MeshTransport::new(mesh.clone(), store.clone()));
        setup(&transport);
        let session = Session::start(&test_config(), transport.clone(), backend.clone(), store);
        Self {
            id: transport.id,
            session,
            transport,
            backend,
            dir,
        }
    }

    /// Write a file under this node's directory.
    pub fn write_file(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.dir.join("files").join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, bytes).unwrap();
        path
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub async fn stop(&self) {
        self.session.stop().await;
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

/// Enable every node, in order.
pub async fn enable_all(nodes: &[&Node]) {
    for node in nodes {
        node.session.bootstrap.enable().await.unwrap();
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, what: &str, check: impl Fn() -> bool) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    if check() {
        return Ok(());
    }
    bail!("timed out waiting for {what}")
}

/// Payload that is not trivially compressible or repetitive.
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

pub fn read(path: &Path) -> Vec<u8> {
    std::fs::read(path).unwrap()
}
