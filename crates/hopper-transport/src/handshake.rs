//! Connection handshake.

use hopper_core::ResourceId;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::{TransportError, TransportResult};
use crate::messages::{Hello, HelloReply, PROTOCOL_VERSION, Peer};

/// Connect to the broker as `peer`. Returns the connection and the id the
/// broker assigned.
pub async fn connect(
    addr: impl ToSocketAddrs,
    peer: Peer,
) -> TransportResult<(Connection<TcpStream>, ResourceId)> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    let mut conn = Connection::new(stream);
    let id = client_handshake(&mut conn, peer).await?;
    Ok((conn, id))
}

/// Send a [`Hello`] and wait for the broker's answer.
pub async fn client_handshake<S>(conn: &mut Connection<S>, peer: Peer) -> TransportResult<ResourceId>
where
    S: AsyncRead + AsyncWrite,
{
    conn.send(&Hello::new(peer)).await?;
    match conn.expect::<HelloReply>().await? {
        HelloReply::Welcome { id } => Ok(id),
        HelloReply::HelloRejected {
            supported_version,
            message,
        } => Err(TransportError::Rejected(format!(
            "{message} (broker speaks protocol {supported_version})"
        ))),
    }
}

/// Read the peer's [`Hello`]. A version mismatch is answered with
/// `HelloRejected` and returned as an error; otherwise the peer is welcomed
/// with `id`.
pub async fn accept_hello<S>(conn: &mut Connection<S>, id: ResourceId) -> TransportResult<Peer>
where
    S: AsyncRead + AsyncWrite,
{
    let hello: Hello = conn.expect().await?;
    if hello.protocol_version != PROTOCOL_VERSION {
        warn!(
            theirs = hello.protocol_version,
            ours = PROTOCOL_VERSION,
            "Rejecting peer with unsupported protocol version"
        );
        let reply = HelloReply::HelloRejected {
            supported_version: PROTOCOL_VERSION,
            message: format!("unsupported protocol version {}", hello.protocol_version),
        };
        // The peer may already be gone; the error below is what matters.
        let _ = conn.send(&reply).await;
        return Err(TransportError::VersionMismatch {
            ours: PROTOCOL_VERSION,
            theirs: hello.protocol_version,
        });
    }

    conn.send(&HelloReply::Welcome { id }).await?;
    debug!(peer = hello.peer.name(), %id, "Handshake complete");
    Ok(hello.peer)
}
