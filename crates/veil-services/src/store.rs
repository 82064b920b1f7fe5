//! Content-addressed store of locally available content.
//!
//! Objects are stored by content hash in a two-level directory structure:
//!   {root}/{hash[0..2]}/{full_hash}
//!
//! This is the same layout Git uses for objects. Objects are immutable:
//! if the hash exists, the content is correct. Writes land in a temp file
//! and are renamed into place only after the hash is known.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use veil_core::{ContentHash, ContentHasher};

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Result of streaming a file into the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Imported {
    pub hash: ContentHash,
    pub size: u64,
}

#[derive(Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    /// Create a store rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create content store: {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn has(&self, hash: &ContentHash) -> bool {
        self.path_of(hash).exists()
    }

    /// Filesystem path for an object, whether or not it exists.
    pub fn path_of(&self, hash: &ContentHash) -> PathBuf {
        let hex = hash.to_hex();
        self.root.join(&hex[0..2]).join(&hex)
    }

    /// Open an object for streaming. Returns the file and its length.
    pub async fn open(&self, hash: &ContentHash) -> io::Result<Option<(tokio::fs::File, u64)>> {
        let path = self.path_of(hash);
        match tokio::fs::File::open(&path).await {
            Ok(file) => {
                let len = file.metadata().await?.len();
                Ok(Some((file, len)))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Stream `src` into the store, hashing as it goes. The file is never
    /// held in memory. `progress` sees the running byte count after every
    /// read; returning `false` aborts with `ErrorKind::Interrupted`.
    pub async fn import_file(
        &self,
        src: &Path,
        buffer_bytes: usize,
        mut progress: impl FnMut(u64) -> bool,
    ) -> io::Result<Imported> {
        let mut input = tokio::fs::File::open(src).await?;
        let tmp = self.tmp_path();
        let mut output = tokio::fs::File::create(&tmp).await?;
        let mut hasher = ContentHasher::new();
        let mut buf = vec![0u8; buffer_bytes.max(4096)];

        let copied: io::Result<()> = async {
            loop {
                let n = input.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                output.write_all(&buf[..n]).await?;
                if !progress(hasher.bytes_hashed()) {
                    return Err(io::Error::new(io::ErrorKind::Interrupted, "import aborted"));
                }
            }
            output.sync_all().await
        }
        .await;

        if let Err(e) = copied {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }

        let imported = Imported {
            hash: hasher.finalize(),
            size: hasher.bytes_hashed(),
        };
        self.commit(&tmp, &imported.hash).await?;
        tracing::debug!(
            hash = %imported.hash.short(),
            bytes = imported.size,
            src = %src.display(),
            "content imported"
        );
        Ok(imported)
    }

    /// Copy an already verified file into the store under `hash`.
    pub async fn insert_verified(&self, hash: &ContentHash, src: &Path) -> io::Result<()> {
        if self.has(hash) {
            return Ok(());
        }
        let tmp = self.tmp_path();
        if let Err(e) = tokio::fs::copy(src, &tmp).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }
        self.commit(&tmp, hash).await
    }

    /// Copy an object out of the store to `dest`.
    pub async fn copy_out(&self, hash: &ContentHash, dest: &Path) -> io::Result<u64> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(self.path_of(hash), dest).await
    }

    /// All stored hashes.
    pub fn list(&self) -> Vec<ContentHash> {
        let mut out = Vec::new();
        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                if let Ok(subdir) = fs::read_dir(entry.path()) {
                    for object in subdir.flatten() {
                        if let Some(hash) = object
                            .file_name()
                            .to_str()
                            .and_then(|n| ContentHash::from_hex(n).ok())
                        {
                            out.push(hash);
                        }
                    }
                }
            }
        }
        out.sort();
        out
    }

    /// Count stored objects (for stats/debugging).
    pub fn count(&self) -> usize {
        self.list().len()
    }

    /// Total bytes stored (for stats/debugging).
    pub fn size(&self) -> u64 {
        self.list()
            .iter()
            .filter_map(|h| fs::metadata(self.path_of(h)).ok())
            .map(|m| m.len())
            .sum()
    }

    fn tmp_path(&self) -> PathBuf {
        let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.root
            .join(format!(".incoming-{}-{}.tmp", std::process::id(), n))
    }

    /// Atomic publish: rename temp → final. Idempotent if already present.
    async fn commit(&self, tmp: &Path, hash: &ContentHash) -> io::Result<()> {
        let path = self.path_of(hash);
        if path.exists() {
            let _ = tokio::fs::remove_file(tmp).await;
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(tmp, &path).await?;
        tracing::trace!(hash = %hash.short(), "object stored");
        Ok(())
    }
}
