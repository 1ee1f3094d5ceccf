//! Artifact transfer connections.
//!
//! A fetch connection asks for one digest and receives its bytes. A push
//! connection sends one artifact, which is only stored if it hashes to the
//! digest the pusher claimed.

use hopper_core::artifact::ArtifactStore;
use hopper_store::FsArtifactStore;
use hopper_transport::messages::{
    ArtifactFetchRequest, ArtifactFetchResponse, ArtifactPushRequest, ArtifactPushResponse,
};
use hopper_transport::{Connection, TransportResult};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

pub async fn serve_fetch<S>(conn: &mut Connection<S>, store: &FsArtifactStore) -> TransportResult<()>
where
    S: AsyncRead + AsyncWrite,
{
    let ArtifactFetchRequest { digest } = conn.expect().await?;

    // Pinned while streaming so a prune cannot remove it mid-transfer.
    if store.retain(&digest).is_err() {
        debug!(digest = %digest.short(), "Fetch for unknown artifact");
        let message = format!("{} is not in the broker's store", digest.short());
        return conn.send(&ArtifactFetchResponse::NotFound { message }).await;
    }

    let result = async {
        let size = store.metadata(&digest).map_or(0, |m| m.size);
        let body = match store.stream(&digest).await {
            Ok(body) => body,
            Err(e) => {
                warn!(digest = %digest.short(), error = %e, "Failed to open artifact");
                let message = e.to_string();
                return conn.send(&ArtifactFetchResponse::NotFound { message }).await;
            }
        };
        conn.send(&ArtifactFetchResponse::Found { size }).await?;
        let sent = conn.writer().send_body(body).await?;
        conn.writer().close().await?;
        debug!(digest = %digest.short(), sent, "Served artifact");
        Ok(())
    }
    .await;

    store.release(&digest);
    result
}

pub async fn serve_push<S>(conn: &mut Connection<S>, store: &FsArtifactStore) -> TransportResult<()>
where
    S: AsyncRead + AsyncWrite,
{
    let ArtifactPushRequest { digest, size } = conn.expect().await?;

    let mut failure = None;
    let mut pending = match store.begin_write().await {
        Ok(pending) => Some(pending),
        Err(e) => {
            failure = Some(e.to_string());
            None
        }
    };

    // The body is always read in full so the pusher gets an answer.
    let mut remaining = size;
    while let Some(chunk) = conn.reader().recv_body_chunk(&mut remaining).await? {
        if let Some(writer) = pending.as_mut() {
            if let Err(e) = writer.write_chunk(&chunk).await {
                failure = Some(e.to_string());
                pending = None;
            }
        }
    }

    let response = match pending {
        Some(pending) => match store.commit(pending, Some(digest)).await {
            Ok(_) => {
                info!(digest = %digest.short(), size, "Artifact pushed");
                ArtifactPushResponse::Stored
            }
            Err(e) => {
                warn!(digest = %digest.short(), error = %e, "Rejected pushed artifact");
                ArtifactPushResponse::Rejected {
                    message: e.to_string(),
                }
            }
        },
        None => {
            let message = failure.unwrap_or_else(|| "write failed".to_string());
            warn!(digest = %digest.short(), %message, "Failed to store pushed artifact");
            ArtifactPushResponse::Rejected { message }
        }
    };
    conn.send(&response).await
}
