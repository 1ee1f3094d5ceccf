//! Where artifacts come from.
//!
//! The fetcher walks an ordered list of [`ArtifactSource`]s: the broker
//! first, then any configured mirrors.

use async_trait::async_trait;
use hopper_core::Digest;
use hopper_store::PendingArtifact;
use hopper_transport::messages::{ArtifactFetchRequest, ArtifactFetchResponse, Peer};
use hopper_transport::connect;
use tracing::debug;

use crate::error::SourceError;

#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Stream the artifact's bytes into `out`. Verification happens when
    /// the caller commits `out`.
    async fn fetch(&self, digest: &Digest, out: &mut PendingArtifact) -> Result<(), SourceError>;
}

/// A broker or mirror speaking the artifact fetch protocol.
#[derive(Debug, Clone)]
pub struct RemoteSource {
    addr: String,
}

impl RemoteSource {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl ArtifactSource for RemoteSource {
    fn name(&self) -> &str {
        &self.addr
    }

    async fn fetch(&self, digest: &Digest, out: &mut PendingArtifact) -> Result<(), SourceError> {
        let (mut conn, _) = connect(self.addr.as_str(), Peer::ArtifactFetcher).await?;
        conn.send(&ArtifactFetchRequest { digest: *digest }).await?;

        let size = match conn.expect::<ArtifactFetchResponse>().await? {
            ArtifactFetchResponse::Found { size } => size,
            ArtifactFetchResponse::NotFound { message } => {
                return Err(SourceError::NotFound(message));
            }
        };
        debug!(digest = %digest.short(), size, source = %self.addr, "Fetching artifact");

        let mut remaining = size;
        while let Some(chunk) = conn.reader().recv_body_chunk(&mut remaining).await? {
            out.write_chunk(&chunk).await?;
        }
        Ok(())
    }
}
