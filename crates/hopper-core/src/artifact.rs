//! Content-addressed artifact storage.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{Digest, Result};

/// Size of the chunks artifacts are streamed in.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Metadata about a stored artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    /// Digest of the contents.
    pub digest: Digest,
    /// Size in bytes.
    pub size: u64,
}

/// When unreferenced artifacts may be evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Total bytes the store tries to stay under. Unreferenced artifacts are
    /// evicted least-recently-used first until the store fits.
    pub max_size_bytes: u64,
    /// Artifacts used more recently than this are never evicted.
    pub min_age: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_size_bytes: 10 * 1024 * 1024 * 1024,
            min_age: Duration::from_secs(300),
        }
    }
}

/// What one eviction sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneStats {
    pub artifacts_deleted: u64,
    pub bytes_freed: u64,
}

/// Trait for content-addressed artifact stores.
///
/// Artifacts are immutable: once a digest is in the store its bytes never
/// change. Storing the same bytes twice is a no-op.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store an artifact, returning its digest.
    async fn put(&self, data: Bytes) -> Result<Digest>;

    /// Store an artifact whose digest the caller already claims to know. The
    /// content is verified before it becomes visible.
    async fn put_verified(&self, expected: Digest, data: Bytes) -> Result<()>;

    /// Retrieve an artifact.
    async fn get(&self, digest: &Digest) -> Result<Bytes>;

    /// Stream an artifact in chunks of at most [`CHUNK_SIZE`] bytes.
    async fn stream(
        &self,
        digest: &Digest,
    ) -> Result<BoxStream<'static, std::result::Result<Bytes, std::io::Error>>>;

    /// Metadata for an artifact, if present.
    fn metadata(&self, digest: &Digest) -> Option<ArtifactMetadata>;

    fn contains(&self, digest: &Digest) -> bool {
        self.metadata(digest).is_some()
    }

    /// Pin an artifact so it cannot be evicted.
    fn retain(&self, digest: &Digest) -> Result<()>;

    /// Drop one pin taken by [`ArtifactStore::retain`].
    fn release(&self, digest: &Digest);

    /// Total bytes currently stored.
    fn total_bytes(&self) -> u64;

    /// Evict unreferenced artifacts according to the store's policy.
    async fn prune(&self) -> Result<PruneStats>;
}
