//! Filesystem-backed artifact store.
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/blobs/<hex digest>   committed artifacts, never modified
//! <root>/tmp/                 in-progress writes, cleared on open
//! ```
//!
//! Writes land in `tmp/` and are renamed into `blobs/` only after their
//! digest has been computed (and checked, when the caller supplied one), so a
//! reader never observes a partial or corrupt artifact.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use hopper_core::artifact::{ArtifactMetadata, ArtifactStore, CHUNK_SIZE, PruneStats, RetentionPolicy};
use hopper_core::clock::{Clock, SystemClock};
use hopper_core::digest::DigestBuilder;
use hopper_core::Digest;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::index::StoreIndex;

const BLOBS_DIR: &str = "blobs";
const TMP_DIR: &str = "tmp";

/// Content-addressed store on local disk.
pub struct FsArtifactStore {
    root: PathBuf,
    policy: RetentionPolicy,
    index: Arc<Mutex<StoreIndex>>,
    clock: Arc<dyn Clock>,
    next_tmp: AtomicU64,
}

impl FsArtifactStore {
    /// Open (or create) a store at `root`, indexing whatever is already there.
    pub async fn open(root: impl Into<PathBuf>, policy: RetentionPolicy) -> StoreResult<Self> {
        Self::open_with_clock(root, policy, Arc::new(SystemClock)).await
    }

    pub async fn open_with_clock(
        root: impl Into<PathBuf>,
        policy: RetentionPolicy,
        clock: Arc<dyn Clock>,
    ) -> StoreResult<Self> {
        let root = root.into();
        let blobs = root.join(BLOBS_DIR);
        let tmp = root.join(TMP_DIR);

        tokio::fs::create_dir_all(&blobs).await?;
        if tokio::fs::try_exists(&tmp).await? {
            tokio::fs::remove_dir_all(&tmp).await?;
        }
        tokio::fs::create_dir_all(&tmp).await?;

        let now = clock.now();
        let mut index = StoreIndex::new();
        let mut entries = tokio::fs::read_dir(&blobs).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(digest) = name.to_str().and_then(|n| n.parse::<Digest>().ok()) else {
                warn!(file = ?entry.path(), "Ignoring unrecognised file in store");
                continue;
            };
            let size = entry.metadata().await?.len();
            index.insert(digest, size, now);
        }

        info!(
            root = %root.display(),
            artifacts = index.len(),
            bytes = index.total_bytes(),
            "Opened artifact store"
        );

        Ok(Self {
            root,
            policy,
            index: Arc::new(Mutex::new(index)),
            clock,
            next_tmp: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    fn index(&self) -> MutexGuard<'_, StoreIndex> {
        self.index.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root.join(BLOBS_DIR).join(digest.to_hex())
    }

    fn tmp_path(&self) -> PathBuf {
        let n = self.next_tmp.fetch_add(1, Ordering::Relaxed);
        self.root
            .join(TMP_DIR)
            .join(format!("{}-{n}.partial", std::process::id()))
    }

    /// Local path of a stored artifact. Callers that keep using the path
    /// should hold a pin (see [`ArtifactStore::retain`]) so it is not evicted.
    pub fn path_of(&self, digest: &Digest) -> Option<PathBuf> {
        let now = self.clock.now();
        if self.index().touch(digest, now) {
            Some(self.blob_path(digest))
        } else {
            None
        }
    }

    /// Every stored digest.
    pub fn digests(&self) -> Vec<Digest> {
        self.index().digests().copied().collect()
    }

    /// Start a streaming write.
    pub async fn begin_write(&self) -> StoreResult<PendingArtifact> {
        let path = self.tmp_path();
        let file = tokio::fs::File::create(&path).await?;
        Ok(PendingArtifact {
            file,
            path: Some(path),
            hasher: DigestBuilder::new(),
            size: 0,
        })
    }

    /// Finish a streaming write. With `expected`, the artifact is only
    /// committed if its contents hash to that digest.
    pub async fn commit(
        &self,
        mut pending: PendingArtifact,
        expected: Option<Digest>,
    ) -> StoreResult<Digest> {
        pending.file.flush().await?;
        pending.file.sync_all().await?;

        let Some(tmp) = pending.path.take() else {
            return Err(StoreError::Io(std::io::Error::other("write already committed")));
        };
        let size = pending.size;
        let actual = std::mem::take(&mut pending.hasher).finish();

        if let Some(expected) = expected {
            if expected != actual {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(StoreError::DigestMismatch { expected, actual });
            }
        }

        let now = self.clock.now();
        if self.index().touch(&actual, now) {
            let _ = tokio::fs::remove_file(&tmp).await;
            debug!(digest = %actual.short(), "Artifact already stored");
            return Ok(actual);
        }

        tokio::fs::rename(&tmp, self.blob_path(&actual)).await?;
        self.index().insert(actual, size, now);
        debug!(digest = %actual.short(), size, "Stored artifact");
        Ok(actual)
    }

    async fn write_all(&self, data: &[u8], expected: Option<Digest>) -> StoreResult<Digest> {
        let mut pending = self.begin_write().await?;
        for chunk in data.chunks(CHUNK_SIZE) {
            pending.write_chunk(chunk).await?;
        }
        self.commit(pending, expected).await
    }

    /// Evict unpinned artifacts, least recently used first, until the store
    /// fits its byte ceiling. Returns what was removed.
    pub async fn evict(&self) -> StoreResult<Vec<ArtifactMetadata>> {
        let index = self.index.clone();
        let policy = self.policy;
        let now = self.clock.now();
        let blobs = self.root.join(BLOBS_DIR);

        // Index and disk are updated under one lock.
        tokio::task::spawn_blocking(move || {
            let mut index = index.lock().unwrap_or_else(|e| e.into_inner());
            let mut evicted = Vec::new();
            for (digest, size) in index.eviction_candidates(&policy, now) {
                match std::fs::remove_file(blobs.join(digest.to_hex())) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(StoreError::Io(e)),
                }
                index.remove(&digest);
                evicted.push(ArtifactMetadata { digest, size });
            }
            Ok(evicted)
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
    }
}

/// An artifact being written chunk by chunk. Dropping it without committing
/// discards the partial file.
pub struct PendingArtifact {
    file: tokio::fs::File,
    path: Option<PathBuf>,
    hasher: DigestBuilder,
    size: u64,
}

impl PendingArtifact {
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> StoreResult<()> {
        self.hasher.update(chunk);
        self.file.write_all(chunk).await?;
        self.size += chunk.len() as u64;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.size
    }
}

impl Drop for PendingArtifact {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, data: Bytes) -> hopper_core::Result<Digest> {
        let digest = Digest::of(&data);
        if self.index().touch(&digest, self.clock.now()) {
            return Ok(digest);
        }
        Ok(self.write_all(&data, Some(digest)).await?)
    }

    async fn put_verified(&self, expected: Digest, data: Bytes) -> hopper_core::Result<()> {
        self.write_all(&data, Some(expected)).await?;
        Ok(())
    }

    async fn get(&self, digest: &Digest) -> hopper_core::Result<Bytes> {
        let path = self
            .path_of(digest)
            .ok_or(StoreError::NotFound(*digest))?;
        let data = tokio::fs::read(path).await.map_err(StoreError::from)?;
        Ok(Bytes::from(data))
    }

    async fn stream(
        &self,
        digest: &Digest,
    ) -> hopper_core::Result<BoxStream<'static, std::io::Result<Bytes>>> {
        let path = self
            .path_of(digest)
            .ok_or(StoreError::NotFound(*digest))?;
        let file = tokio::fs::File::open(path).await.map_err(StoreError::from)?;
        Ok(ReaderStream::with_capacity(file, CHUNK_SIZE).boxed())
    }

    fn metadata(&self, digest: &Digest) -> Option<ArtifactMetadata> {
        self.index().size_of(digest).map(|size| ArtifactMetadata {
            digest: *digest,
            size,
        })
    }

    fn retain(&self, digest: &Digest) -> hopper_core::Result<()> {
        let now = self.clock.now();
        if self.index().retain(digest, now) {
            Ok(())
        } else {
            Err(StoreError::NotFound(*digest).into())
        }
    }

    fn release(&self, digest: &Digest) {
        let now = self.clock.now();
        if !self.index().release(digest, now) {
            warn!(digest = %digest.short(), "Released an artifact that was not pinned");
        }
    }

    fn total_bytes(&self) -> u64 {
        self.index().total_bytes()
    }

    async fn prune(&self) -> hopper_core::Result<PruneStats> {
        let evicted = self.evict().await?;
        let stats = PruneStats {
            artifacts_deleted: evicted.len() as u64,
            bytes_freed: evicted.iter().map(|m| m.size).sum(),
        };
        if stats.artifacts_deleted > 0 {
            info!(
                deleted = stats.artifacts_deleted,
                freed = stats.bytes_freed,
                "Pruned artifact store"
            );
        }
        Ok(stats)
    }
}
