//! Test doubles shared by the worker's tests.

use async_trait::async_trait;
use bytes::Bytes;
use hopper_core::Digest;
use hopper_store::PendingArtifact;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use crate::error::SourceError;
use crate::source::ArtifactSource;

/// A source serving from memory, optionally failing first.
#[derive(Default)]
pub struct MemorySource {
    pub artifacts: HashMap<Digest, Bytes>,
    pub transient_failures: AtomicU32,
    pub corrupt: bool,
    pub requests: AtomicU64,
    pub delay: Duration,
}

impl MemorySource {
    pub fn with(data: &[&'static [u8]]) -> Self {
        Self {
            artifacts: data
                .iter()
                .map(|d| (Digest::of(d), Bytes::from_static(d)))
                .collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ArtifactSource for MemorySource {
    fn name(&self) -> &str {
        "memory"
    }

    async fn fetch(&self, digest: &Digest, out: &mut PendingArtifact) -> Result<(), SourceError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.transient_failures.load(Ordering::SeqCst) > 0 {
            self.transient_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(SourceError::Transient("connection reset".into()));
        }
        let data = self
            .artifacts
            .get(digest)
            .ok_or_else(|| SourceError::NotFound(digest.short()))?;
        if self.corrupt {
            out.write_chunk(b"garbage").await?;
        } else {
            out.write_chunk(data).await?;
        }
        Ok(())
    }
}
