//! Artifact fetching into the worker's local cache.
//!
//! Layers already in the cache are used as they are. Missing ones are
//! fetched from the first source that has them, verified and committed.
//! Concurrent requests for the same digest share one fetch.

use futures::future::{BoxFuture, FutureExt, Shared, try_join_all};
use hopper_core::artifact::ArtifactStore;
use hopper_core::executor::ResolvedLayer;
use hopper_core::{Digest, FailureReason};
use hopper_store::FsArtifactStore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::SourceError;
use crate::source::ArtifactSource;

type FetchFuture = Shared<BoxFuture<'static, Result<(), String>>>;

#[derive(Clone)]
pub struct Fetcher {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<FsArtifactStore>,
    sources: Vec<Arc<dyn ArtifactSource>>,
    retries: u32,
    retry_delay: Duration,
    inflight: Mutex<HashMap<Digest, FetchFuture>>,
    /// Source fetch attempts made.
    attempts: AtomicU64,
    /// Digests committed since the last [`Fetcher::take_fetched`].
    fetched: Mutex<Vec<Digest>>,
}

impl Fetcher {
    /// `retries` is how many extra attempts a source gets after a transient
    /// error, `retry_delay` the pause before the first of them.
    pub fn new(
        store: Arc<FsArtifactStore>,
        sources: Vec<Arc<dyn ArtifactSource>>,
        retries: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                sources,
                retries,
                retry_delay,
                inflight: Mutex::new(HashMap::new()),
                attempts: AtomicU64::new(0),
                fetched: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn store(&self) -> &Arc<FsArtifactStore> {
        &self.inner.store
    }

    /// Number of times a source has been asked for an artifact.
    pub fn attempts(&self) -> u64 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Digests fetched since the last call.
    pub fn take_fetched(&self) -> Vec<Digest> {
        std::mem::take(&mut *lock(&self.inner.fetched))
    }

    /// Make sure every layer is cached and pin them for the duration of one
    /// execution.
    pub async fn resolve(&self, layers: &[Digest]) -> Result<PinnedLayers, FailureReason> {
        try_join_all(layers.iter().map(|d| self.ensure(*d)))
            .await
            .map_err(|message| FailureReason::ArtifactFetch { message })?;

        let mut pinned = PinnedLayers {
            store: self.inner.store.clone(),
            layers: Vec::with_capacity(layers.len()),
        };
        for digest in layers {
            // Evicted between fetch and pin: fetch it again.
            if self.inner.store.retain(digest).is_err() {
                self.ensure(*digest)
                    .await
                    .map_err(|message| FailureReason::ArtifactFetch { message })?;
                self.inner
                    .store
                    .retain(digest)
                    .map_err(|e| FailureReason::ArtifactFetch {
                        message: format!("{}: {e}", digest.short()),
                    })?;
            }
            let Some(path) = self.inner.store.path_of(digest) else {
                self.inner.store.release(digest);
                return Err(FailureReason::ArtifactFetch {
                    message: format!("{} vanished from the cache", digest.short()),
                });
            };
            pinned.layers.push(ResolvedLayer {
                digest: *digest,
                path,
            });
        }
        Ok(pinned)
    }

    /// Fetch `digest` unless it is cached, joining a fetch already running.
    pub async fn ensure(&self, digest: Digest) -> Result<(), String> {
        if self.inner.store.contains(&digest) {
            return Ok(());
        }
        let fetch = {
            let mut inflight = lock(&self.inner.inflight);
            if self.inner.store.contains(&digest) {
                return Ok(());
            }
            inflight
                .entry(digest)
                .or_insert_with(|| {
                    let this = self.clone();
                    async move {
                        let result = this.fetch(digest).await;
                        lock(&this.inner.inflight).remove(&digest);
                        result
                    }
                    .boxed()
                    .shared()
                })
                .clone()
        };
        fetch.await
    }

    async fn fetch(&self, digest: Digest) -> Result<(), String> {
        let mut failures = Vec::new();
        for source in &self.inner.sources {
            let mut attempt = 0;
            loop {
                self.inner.attempts.fetch_add(1, Ordering::SeqCst);
                match self.fetch_from(source.as_ref(), digest).await {
                    Ok(()) => {
                        info!(digest = %digest.short(), source = source.name(), "Fetched artifact");
                        lock(&self.inner.fetched).push(digest);
                        return Ok(());
                    }
                    Err(SourceError::Transient(message)) if attempt < self.inner.retries => {
                        attempt += 1;
                        debug!(digest = %digest.short(), source = source.name(), attempt, %message, "Retrying fetch");
                        tokio::time::sleep(self.inner.retry_delay * attempt).await;
                    }
                    Err(e) => {
                        warn!(digest = %digest.short(), source = source.name(), error = %e, "Fetch failed");
                        failures.push(format!("{}: {e}", source.name()));
                        break;
                    }
                }
            }
        }
        if failures.is_empty() {
            failures.push("no artifact sources configured".to_string());
        }
        Err(format!("{}: {}", digest.short(), failures.join("; ")))
    }

    async fn fetch_from(&self, source: &dyn ArtifactSource, digest: Digest) -> Result<(), SourceError> {
        let mut pending = self.inner.store.begin_write().await?;
        source.fetch(&digest, &mut pending).await?;
        self.inner.store.commit(pending, Some(digest)).await?;
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Layers pinned in the cache for one execution. Dropping releases the pins.
pub struct PinnedLayers {
    store: Arc<FsArtifactStore>,
    layers: Vec<ResolvedLayer>,
}

impl PinnedLayers {
    pub fn layers(&self) -> &[ResolvedLayer] {
        &self.layers
    }
}

impl std::fmt::Debug for PinnedLayers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedLayers")
            .field("layers", &self.layers)
            .finish_non_exhaustive()
    }
}

impl Drop for PinnedLayers {
    fn drop(&mut self) {
        for layer in &self.layers {
            self.store.release(&layer.digest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hopper_core::artifact::RetentionPolicy;
    use std::sync::atomic::AtomicU32;

    use crate::testing::MemorySource;

    async fn store(dir: &std::path::Path) -> Arc<FsArtifactStore> {
        Arc::new(
            FsArtifactStore::open(dir, RetentionPolicy::default())
                .await
                .unwrap(),
        )
    }

    fn fetcher(store: Arc<FsArtifactStore>, sources: Vec<Arc<dyn ArtifactSource>>) -> Fetcher {
        Fetcher::new(store, sources, 2, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_cached_layers_need_no_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(MemorySource::with(&[b"one", b"two", b"three"]));
        let fetcher = fetcher(store(dir.path()).await, vec![source.clone()]);
        let layers: Vec<Digest> = [b"one" as &[u8], b"two", b"three"]
            .iter()
            .map(|d| Digest::of(d))
            .collect();

        let first = fetcher.resolve(&layers).await.unwrap();
        assert_eq!(fetcher.attempts(), 3);
        assert_eq!(first.layers().len(), 3);
        drop(first);

        let second = fetcher.resolve(&layers).await.unwrap();
        assert_eq!(fetcher.attempts(), 3);
        assert_eq!(source.requests.load(Ordering::SeqCst), 3);
        assert_eq!(std::fs::read(&second.layers()[1].path).unwrap(), b"two");
        assert_eq!(fetcher.take_fetched().len(), 3);
        assert!(fetcher.take_fetched().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(MemorySource {
            delay: Duration::from_millis(50),
            ..MemorySource::with(&[b"shared"])
        });
        let fetcher = fetcher(store(dir.path()).await, vec![source.clone()]);
        let digest = Digest::of(b"shared");

        let (a, b, c) = tokio::join!(
            fetcher.ensure(digest),
            fetcher.ensure(digest),
            fetcher.ensure(digest)
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(source.requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(MemorySource {
            transient_failures: AtomicU32::new(2),
            ..MemorySource::with(&[b"flaky"])
        });
        let fetcher = fetcher(store(dir.path()).await, vec![source.clone()]);
        fetcher.ensure(Digest::of(b"flaky")).await.unwrap();
        assert_eq!(source.requests.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_corrupt_source_falls_through_to_next() {
        let dir = tempfile::tempdir().unwrap();
        let bad = Arc::new(MemorySource {
            corrupt: true,
            ..MemorySource::with(&[b"payload"])
        });
        let good = Arc::new(MemorySource::with(&[b"payload"]));
        let store = store(dir.path()).await;
        let fetcher = fetcher(store.clone(), vec![bad.clone(), good.clone()]);

        fetcher.ensure(Digest::of(b"payload")).await.unwrap();
        assert_eq!(bad.requests.load(Ordering::SeqCst), 1);
        assert_eq!(good.requests.load(Ordering::SeqCst), 1);
        assert!(store.contains(&Digest::of(b"payload")));
    }

    #[tokio::test]
    async fn test_no_source_has_it() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(MemorySource {
            transient_failures: AtomicU32::new(10),
            ..MemorySource::with(&[])
        });
        let fetcher = fetcher(store(dir.path()).await, vec![source.clone()]);
        let err = fetcher.resolve(&[Digest::of(b"missing")]).await.unwrap_err();
        assert!(matches!(err, FailureReason::ArtifactFetch { .. }));
        // One try plus two retries.
        assert_eq!(source.requests.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_pins_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let policy = RetentionPolicy {
            max_size_bytes: 0,
            min_age: Duration::ZERO,
        };
        let store = Arc::new(FsArtifactStore::open(dir.path(), policy).await.unwrap());
        let fetcher = fetcher(store.clone(), vec![Arc::new(MemorySource::with(&[b"pinned"]))]);
        let digest = Digest::of(b"pinned");

        let pinned = fetcher.resolve(&[digest]).await.unwrap();
        assert!(store.evict().await.unwrap().is_empty());
        assert!(store.contains(&digest));

        drop(pinned);
        assert_eq!(store.evict().await.unwrap().len(), 1);
        assert!(!store.contains(&digest));
    }
}
