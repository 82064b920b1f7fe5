//! Content transfer engine: publish and fetch by content hash.
//!
//! At most one operation runs per (hash, direction). The operation table is
//! a `DashMap`; `entry()` is the lookup-then-insert critical section, so two
//! concurrent `fetch(h)` calls can never both start a network fetch. Later
//! callers attach as observers and share the outcome.
//!
//! Each operation owns two `watch` channels: one carries progress snapshots
//! to observers, the other carries the cancel signal to the worker. Workers
//! check the cancel signal between reads and while waiting on the network.
//!
//! Fetched bytes go to `<dest>.part` and are hashed as they arrive. The file
//! is renamed to `dest` only when the hash matches; on any other outcome the
//! partial file is removed.

use std::collections::VecDeque;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::Instant;

use veil_core::config::TransferConfig;
use veil_core::{
    ConnectionError, ContentHash, ContentHasher, NetworkError, PeerId, TransferDirection,
    TransferError, TransferOperation, TransferState,
};

use crate::bootstrap::BootstrapController;
use crate::bus::{EventBus, SessionEvent};
use crate::registry::PeerRegistry;
use crate::retry::Backoff;
use crate::store::ContentStore;
use crate::transport::Transport;

#[derive(Debug, Clone)]
pub struct TransferPolicy {
    /// Retries after the first network attempt.
    pub max_retries: u32,
    pub backoff: Backoff,
    /// A read that stalls this long counts as a transient timeout.
    pub read_timeout: Duration,
    pub buffer_bytes: usize,
    pub history_capacity: usize,
}

impl TransferPolicy {
    pub fn from_config(config: &TransferConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: Backoff::new(config.backoff_base(), config.backoff_max()).with_jitter(),
            read_timeout: config.read_timeout(),
            buffer_bytes: config.read_buffer_bytes,
            history_capacity: config.history_capacity,
        }
    }
}

/// Outcome of one file in a folder seed.
#[derive(Debug, Clone)]
pub struct SeedResult {
    pub path: PathBuf,
    pub result: Result<ContentHash, TransferError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CancelReason {
    /// Explicit `cancel`; the operation ends Cancelled.
    User,
    /// Every observer stopped waiting, by deadline or by dropping its
    /// call; the operation ends Failed(TimedOut).
    Abandoned,
}

impl CancelReason {
    fn error(self) -> TransferError {
        match self {
            CancelReason::User => TransferError::Cancelled,
            CancelReason::Abandoned => TransferError::TimedOut,
        }
    }
}

type Key = (ContentHash, TransferDirection);

struct Operation {
    key: Key,
    snapshot: watch::Sender<TransferOperation>,
    cancel: watch::Sender<Option<CancelReason>>,
    observers: AtomicUsize,
    outcome: Mutex<Option<Result<(), TransferError>>>,
}

impl Operation {
    fn cancel_reason(&self) -> Option<CancelReason> {
        *self.cancel.borrow()
    }
}

/// One waiting caller. The last one to leave before the outcome is known
/// cancels the operation.
struct Observer<'a> {
    op: &'a Operation,
}

impl Drop for Observer<'_> {
    fn drop(&mut self) {
        let last = self.op.observers.fetch_sub(1, Ordering::SeqCst) == 1;
        if last && self.op.outcome.lock().is_none() {
            tracing::debug!(hash = %self.op.key.0.short(), "no one waiting, cancelling transfer");
            request_cancel(self.op, CancelReason::Abandoned);
        }
    }
}

/// One network attempt either fails in a way worth retrying or not.
enum AttemptError {
    Transient(NetworkError),
    Permanent(TransferError),
}

impl From<std::io::Error> for AttemptError {
    fn from(e: std::io::Error) -> Self {
        AttemptError::Permanent(e.into())
    }
}

struct EngineInner {
    transport: Arc<dyn Transport>,
    bootstrap: BootstrapController,
    registry: PeerRegistry,
    store: ContentStore,
    bus: EventBus<SessionEvent>,
    policy: TransferPolicy,
    ops: DashMap<Key, Arc<Operation>>,
    history: Mutex<VecDeque<TransferOperation>>,
    next_id: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

#[derive(Clone)]
pub struct TransferEngine {
    inner: Arc<EngineInner>,
}

impl TransferEngine {
    pub fn new(
        transport: Arc<dyn Transport>,
        bootstrap: BootstrapController,
        registry: PeerRegistry,
        store: ContentStore,
        bus: EventBus<SessionEvent>,
        policy: TransferPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                transport,
                bootstrap,
                registry,
                store,
                bus,
                policy,
                ops: DashMap::new(),
                history: Mutex::new(VecDeque::new()),
                next_id: AtomicU64::new(1),
                bytes_sent: AtomicU64::new(0),
                bytes_received: AtomicU64::new(0),
            }),
        }
    }

    pub fn store(&self) -> &ContentStore {
        &self.inner.store
    }

    // ── Publish ───────────────────────────────────────────────────────────

    /// Stream `path` into the content store, hashing incrementally, then
    /// announce it. Returns once the announcement has succeeded.
    pub async fn publish(&self, path: impl Into<PathBuf>) -> Result<ContentHash, TransferError> {
        self.publish_with_deadline(path, None).await
    }

    /// Like `publish`, with `deadline` bounding both the import and the
    /// wait for the announcement. An import cut short leaves nothing in
    /// the store.
    pub async fn publish_with_deadline(
        &self,
        path: impl Into<PathBuf>,
        deadline: Option<Duration>,
    ) -> Result<ContentHash, TransferError> {
        let path = path.into();
        self.require_transport()?;

        let started = Instant::now();
        let expired = || deadline.is_some_and(|d| started.elapsed() >= d);
        let imported = match self
            .inner
            .store
            .import_file(&path, self.inner.policy.buffer_bytes, |_| !expired())
            .await
        {
            Ok(imported) => imported,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted && expired() => {
                tracing::warn!(path = %path.display(), "publish timed out while importing");
                return Err(TransferError::TimedOut);
            }
            Err(e) => return Err(e.into()),
        };

        let engine = self.clone();
        let size = imported.size;
        let (op, _) = self.attach_or_start(
            imported.hash,
            TransferDirection::Publish,
            path,
            move |op| engine.run_publish(op, size),
        );
        let remaining = deadline.map(|d| d.saturating_sub(started.elapsed()));
        self.observe(&op, remaining).await.map(|()| imported.hash)
    }

    /// Publish every regular file directly inside `dir`, independently.
    /// One file failing never aborts the others.
    pub async fn seed_folder(&self, dir: impl AsRef<Path>) -> Result<Vec<SeedResult>, TransferError> {
        self.seed_folder_with_deadline(dir, None).await
    }

    /// Like `seed_folder`; files still publishing when `deadline` passes
    /// report `TimedOut`.
    pub async fn seed_folder_with_deadline(
        &self,
        dir: impl AsRef<Path>,
        deadline: Option<Duration>,
    ) -> Result<Vec<SeedResult>, TransferError> {
        self.require_transport()?;
        let started = Instant::now();
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(dir.as_ref()).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();

        let remaining = deadline.map(|d| d.saturating_sub(started.elapsed()));
        let publishes = files.into_iter().map(|path| async move {
            let result = self.publish_with_deadline(path.clone(), remaining).await;
            SeedResult { path, result }
        });
        let results = futures::future::join_all(publishes).await;

        let failed = results.iter().filter(|r| r.result.is_err()).count();
        tracing::info!(
            dir = %dir.as_ref().display(),
            files = results.len(),
            failed,
            "folder seeded"
        );
        Ok(results)
    }

    async fn run_publish(self, op: Arc<Operation>, size: u64) -> Result<(), TransferError> {
        let hash = op.key.0;
        self.mark_running(&op, None, 0);
        op.snapshot.send_modify(|s| {
            s.total_bytes = Some(size);
            s.bytes_transferred = size;
            s.first_byte_at = Some(SystemTime::now());
        });

        let mut cancel = op.cancel.subscribe();
        let mut attempt = 0;
        loop {
            let announced = tokio::select! {
                reason = cancelled(&mut cancel) => return Err(reason.error()),
                r = self.inner.transport.announce(hash, size) => r,
            };
            match announced {
                Ok(()) => {
                    self.inner.bytes_sent.fetch_add(size, Ordering::Relaxed);
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempt < self.inner.policy.max_retries => {
                    self.backoff(&op, &mut cancel, attempt, &e).await?;
                    attempt += 1;
                }
                Err(e) => return Err(exhausted(e)),
            }
        }
    }

    // ── Fetch ─────────────────────────────────────────────────────────────

    pub async fn fetch(&self, hash: ContentHash, dest: impl Into<PathBuf>) -> Result<(), TransferError> {
        self.fetch_with_deadline(hash, dest, None).await
    }

    /// Fetch and verify `hash` into `dest`. A `deadline` bounds this
    /// caller's wait; the operation itself is cancelled only when every
    /// observer has given up.
    pub async fn fetch_with_deadline(
        &self,
        hash: ContentHash,
        dest: impl Into<PathBuf>,
        deadline: Option<Duration>,
    ) -> Result<(), TransferError> {
        let dest = dest.into();
        self.require_transport()?;

        let engine = self.clone();
        let worker_dest = dest.clone();
        let (op, started) = self.attach_or_start(
            hash,
            TransferDirection::Fetch,
            dest.clone(),
            move |op| engine.run_fetch(op, worker_dest),
        );
        self.observe(&op, deadline).await?;

        if !started {
            let primary = op.snapshot.borrow().path.clone();
            if primary != dest {
                if let Some(parent) = dest.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                if self.inner.store.has(&hash) {
                    self.inner.store.copy_out(&hash, &dest).await?;
                } else {
                    tokio::fs::copy(&primary, &dest).await?;
                }
            }
        }
        Ok(())
    }

    async fn run_fetch(self, op: Arc<Operation>, dest: PathBuf) -> Result<(), TransferError> {
        let hash = op.key.0;
        if self.inner.store.has(&hash) {
            self.mark_running(&op, None, 0);
            let copied = self.inner.store.copy_out(&hash, &dest).await?;
            op.snapshot.send_modify(|s| {
                s.total_bytes = Some(copied);
                s.bytes_transferred = copied;
            });
            tracing::debug!(hash = %hash.short(), "fetch served from local store");
            return Ok(());
        }

        let result = self.fetch_from_network(&op, &dest).await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(part_path(&dest)).await;
        }
        result
    }

    async fn fetch_from_network(&self, op: &Arc<Operation>, dest: &Path) -> Result<(), TransferError> {
        let candidates = self.inner.registry.fetch_candidates();
        let mut cancel = op.cancel.subscribe();
        let mut attempt: u32 = 0;

        loop {
            if let Some(reason) = op.cancel_reason() {
                return Err(reason.error());
            }
            let peer = match candidates.len() {
                0 => None,
                n => Some(candidates[attempt as usize % n]),
            };
            self.mark_running(op, peer, attempt);

            let tried = tokio::select! {
                reason = cancelled(&mut cancel) => return Err(reason.error()),
                r = self.fetch_once(op, peer, dest) => r,
            };
            match tried {
                Ok(()) => return Ok(()),
                Err(AttemptError::Permanent(e)) => return Err(e),
                Err(AttemptError::Transient(e)) if attempt < self.inner.policy.max_retries => {
                    self.backoff(op, &mut cancel, attempt, &e).await?;
                    attempt += 1;
                }
                Err(AttemptError::Transient(e)) => return Err(exhausted(e)),
            }
        }
    }

    async fn fetch_once(
        &self,
        op: &Operation,
        peer: Option<PeerId>,
        dest: &Path,
    ) -> Result<(), AttemptError> {
        let hash = op.key.0;
        let mut stream = self
            .inner
            .transport
            .open_content(peer, hash)
            .await
            .map_err(|e| match e {
                NetworkError::NotFound => AttemptError::Permanent(TransferError::NotFound),
                NetworkError::Protocol(m) => AttemptError::Permanent(TransferError::IoFailure(m)),
                transient => AttemptError::Transient(transient),
            })?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let part = part_path(dest);
        let mut file = tokio::fs::File::create(&part).await?;
        op.snapshot.send_modify(|s| {
            s.peer = stream.peer.or(peer);
            s.total_bytes = stream.size_hint;
            s.bytes_transferred = 0;
        });

        let mut hasher = ContentHasher::new();
        let mut buf = vec![0u8; self.inner.policy.buffer_bytes.max(4096)];
        loop {
            let n = match tokio::time::timeout(self.inner.policy.read_timeout, stream.reader.read(&mut buf)).await {
                Err(_) => return Err(AttemptError::Transient(ConnectionError::Timeout.into())),
                Ok(Err(e)) => return Err(AttemptError::Transient(e.into())),
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => n,
            };
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n]).await?;
            self.inner.bytes_received.fetch_add(n as u64, Ordering::Relaxed);

            let received = hasher.bytes_hashed();
            op.snapshot.send_modify(|s| {
                s.bytes_transferred = received;
                s.first_byte_at.get_or_insert_with(SystemTime::now);
            });
            if let Some(reason) = op.cancel_reason() {
                return Err(AttemptError::Permanent(reason.error()));
            }
        }
        file.sync_all().await?;
        drop(file);

        let actual = hasher.finalize();
        if actual != hash {
            tracing::warn!(expected = %hash.short(), actual = %actual.short(), "fetched content failed verification");
            return Err(AttemptError::Permanent(TransferError::HashMismatch {
                expected: hash,
                actual,
            }));
        }

        tokio::fs::rename(&part, dest).await?;
        if let Err(e) = self.inner.store.insert_verified(&hash, dest).await {
            tracing::warn!(hash = %hash.short(), error = %e, "failed to keep fetched content in store");
        }
        Ok(())
    }

    // ── Inspection and cancellation ──────────────────────────────────────

    /// Non-terminal operations, oldest first.
    pub fn operations(&self) -> Vec<TransferOperation> {
        let mut ops: Vec<TransferOperation> = self
            .inner
            .ops
            .iter()
            .map(|e| e.value().snapshot.borrow().clone())
            .collect();
        ops.sort_by_key(|o| o.id);
        ops
    }

    /// Recently finished operations, oldest first.
    pub fn history(&self) -> Vec<TransferOperation> {
        self.inner.history.lock().iter().cloned().collect()
    }

    pub fn get(&self, id: u64) -> Option<TransferOperation> {
        self.operations()
            .into_iter()
            .find(|o| o.id == id)
            .or_else(|| self.inner.history.lock().iter().find(|o| o.id == id).cloned())
    }

    /// Cooperatively cancel the running operation for (hash, direction).
    pub fn cancel(&self, hash: &ContentHash, direction: TransferDirection) -> bool {
        match self.inner.ops.get(&(*hash, direction)) {
            Some(op) => {
                request_cancel(&op, CancelReason::User);
                true
            }
            None => false,
        }
    }

    pub fn cancel_id(&self, id: u64) -> bool {
        let op = self
            .inner
            .ops
            .iter()
            .find(|e| e.value().snapshot.borrow().id == id)
            .map(|e| e.value().clone());
        match op {
            Some(op) => {
                request_cancel(&op, CancelReason::User);
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let ops: Vec<Arc<Operation>> = self.inner.ops.iter().map(|e| e.value().clone()).collect();
        for op in &ops {
            request_cancel(op, CancelReason::User);
        }
        ops.len()
    }

    /// Bytes published or served to other peers.
    pub fn bytes_sent(&self) -> u64 {
        self.inner.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.inner.bytes_received.load(Ordering::Relaxed)
    }

    /// Account bytes a host served from the store on behalf of a peer.
    pub fn record_upload(&self, bytes: u64) {
        self.inner.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    // ── Internals ────────────────────────────────────────────────────────

    fn require_transport(&self) -> Result<(), TransferError> {
        if self.inner.bootstrap.is_enabled() {
            Ok(())
        } else {
            Err(TransferError::TransportUnavailable)
        }
    }

    /// Attach to the live operation for (hash, direction) or register a new
    /// one. The worker is spawned only after the table lock is released.
    fn attach_or_start<F, Fut>(
        &self,
        hash: ContentHash,
        direction: TransferDirection,
        path: PathBuf,
        worker: F,
    ) -> (Arc<Operation>, bool)
    where
        F: FnOnce(Arc<Operation>) -> Fut,
        Fut: Future<Output = Result<(), TransferError>> + Send + 'static,
    {
        let (op, started) = match self.inner.ops.entry((hash, direction)) {
            Entry::Occupied(slot) => {
                let op = slot.get().clone();
                op.observers.fetch_add(1, Ordering::SeqCst);
                (op, false)
            }
            Entry::Vacant(slot) => {
                let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                let op = Arc::new(Operation {
                    key: (hash, direction),
                    snapshot: watch::channel(TransferOperation::new(id, hash, direction, path)).0,
                    cancel: watch::channel(None).0,
                    observers: AtomicUsize::new(1),
                    outcome: Mutex::new(None),
                });
                slot.insert(op.clone());
                (op, true)
            }
        };

        if started {
            let snapshot = op.snapshot.borrow().clone();
            tracing::debug!(id = snapshot.id, hash = %hash.short(), ?direction, "transfer queued");
            self.announce(&snapshot);

            let engine = self.clone();
            let task = worker(op.clone());
            let op = op.clone();
            tokio::spawn(async move {
                let result = task.await;
                engine.finish(&op, result);
            });
        } else {
            tracing::debug!(hash = %hash.short(), ?direction, "attached to running transfer");
        }
        (op, started)
    }

    /// Wait for the operation's outcome. A missed deadline or a dropped
    /// call detaches this observer; the last observer to leave cancels the
    /// operation.
    async fn observe(&self, op: &Operation, deadline: Option<Duration>) -> Result<(), TransferError> {
        let _observer = Observer { op };
        let mut rx = op.snapshot.subscribe();
        let wait = async move { rx.wait_for(|s| s.state.is_terminal()).await.map(|_| ()) };
        let finished = match deadline {
            None => wait.await,
            Some(d) => match tokio::time::timeout(d, wait).await {
                Ok(r) => r,
                Err(_) => return Err(TransferError::TimedOut),
            },
        };
        if finished.is_err() {
            return Err(TransferError::IoFailure("transfer abandoned".into()));
        }
        let outcome = op.outcome.lock().clone();
        outcome.unwrap_or_else(|| Err(TransferError::IoFailure("transfer abandoned".into())))
    }

    fn mark_running(&self, op: &Operation, peer: Option<PeerId>, attempt: u32) {
        let mut became_running = false;
        op.snapshot.send_modify(|s| {
            became_running = s.state == TransferState::Queued;
            s.state = TransferState::Running;
            s.retry_count = attempt;
            if peer.is_some() {
                s.peer = peer;
            }
        });
        if became_running {
            let snapshot = op.snapshot.borrow().clone();
            self.announce(&snapshot);
        }
    }

    async fn backoff(
        &self,
        op: &Operation,
        cancel: &mut watch::Receiver<Option<CancelReason>>,
        attempt: u32,
        error: &NetworkError,
    ) -> Result<(), TransferError> {
        let delay = self.inner.policy.backoff.delay(attempt);
        tracing::warn!(
            hash = %op.key.0.short(),
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "transfer attempt failed, retrying"
        );
        tokio::select! {
            reason = cancelled(cancel) => Err(reason.error()),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    fn finish(&self, op: &Arc<Operation>, result: Result<(), TransferError>) {
        self.inner
            .ops
            .remove_if(&op.key, |_, live| Arc::ptr_eq(live, op));

        let state = match &result {
            Ok(()) => TransferState::Completed,
            Err(TransferError::Cancelled) => TransferState::Cancelled,
            Err(_) => TransferState::Failed,
        };
        let mut snapshot = op.snapshot.borrow().clone();
        snapshot.state = state;
        snapshot.finished_at = Some(SystemTime::now());
        snapshot.error = result.as_ref().err().map(|e| e.to_string());

        match &result {
            Ok(()) => tracing::info!(
                id = snapshot.id,
                hash = %snapshot.hash.short(),
                direction = ?snapshot.direction,
                bytes = snapshot.bytes_transferred,
                retries = snapshot.retry_count,
                "transfer completed"
            ),
            Err(e) => tracing::warn!(
                id = snapshot.id,
                hash = %snapshot.hash.short(),
                direction = ?snapshot.direction,
                state = ?state,
                error = %e,
                "transfer did not complete"
            ),
        }

        // History first, so an observer woken below already sees it.
        {
            let mut history = self.inner.history.lock();
            history.push_back(snapshot.clone());
            while history.len() > self.inner.policy.history_capacity.max(1) {
                history.pop_front();
            }
        }
        *op.outcome.lock() = Some(result);
        op.snapshot.send_replace(snapshot.clone());
        self.announce(&snapshot);
    }

    fn announce(&self, snapshot: &TransferOperation) {
        self.inner.bus.publish(&SessionEvent::Transfer {
            id: snapshot.id,
            hash: snapshot.hash,
            direction: snapshot.direction,
            state: snapshot.state,
            path: snapshot.path.clone(),
        });
    }
}

fn request_cancel(op: &Operation, reason: CancelReason) {
    op.cancel.send_if_modified(|current| {
        if current.is_none() {
            *current = Some(reason);
            true
        } else {
            false
        }
    });
}

/// Resolves when a cancel reason is set.
async fn cancelled(rx: &mut watch::Receiver<Option<CancelReason>>) -> CancelReason {
    let reason = match rx.wait_for(Option::is_some).await {
        Ok(r) => *r,
        Err(_) => None,
    };
    match reason {
        Some(reason) => reason,
        None => std::future::pending().await,
    }
}

/// Map a transient error whose retry budget ran out.
fn exhausted(e: NetworkError) -> TransferError {
    match e {
        NetworkError::Connection(ConnectionError::Timeout) => TransferError::TimedOut,
        NetworkError::NotFound => TransferError::NotFound,
        other => TransferError::IoFailure(other.to_string()),
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}
