//! Framed connections.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::trace;

use crate::error::{TransportError, TransportResult};

/// Largest frame either side accepts.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// Receiving half of a connection.
pub struct MessageReader<R> {
    inner: FramedRead<R, LengthDelimitedCodec>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: FramedRead::new(reader, codec()),
        }
    }

    /// Next raw frame, or `None` when the peer closed the connection.
    pub async fn recv_frame(&mut self) -> TransportResult<Option<Bytes>> {
        match self.inner.next().await {
            Some(frame) => Ok(Some(frame?.freeze())),
            None => Ok(None),
        }
    }

    /// Next message, or `None` when the peer closed the connection.
    pub async fn recv<M: DeserializeOwned>(&mut self) -> TransportResult<Option<M>> {
        match self.recv_frame().await? {
            Some(frame) => Ok(Some(serde_json::from_slice(&frame)?)),
            None => Ok(None),
        }
    }

    /// Next message; a closed connection is an error.
    pub async fn expect<M: DeserializeOwned>(&mut self) -> TransportResult<M> {
        self.recv().await?.ok_or(TransportError::Closed)
    }

    /// Read the next chunk of an artifact body with `remaining` bytes still
    /// to come. Returns `None` once the body is complete.
    pub async fn recv_body_chunk(&mut self, remaining: &mut u64) -> TransportResult<Option<Bytes>> {
        if *remaining == 0 {
            return Ok(None);
        }
        let chunk = self.recv_frame().await?.ok_or(TransportError::Closed)?;
        let len = chunk.len() as u64;
        if len == 0 || len > *remaining {
            return Err(TransportError::Protocol(format!(
                "body chunk of {len} bytes with {remaining} remaining"
            )));
        }
        *remaining -= len;
        Ok(Some(chunk))
    }
}

/// Sending half of a connection.
pub struct MessageWriter<W> {
    inner: FramedWrite<W, LengthDelimitedCodec>,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: FramedWrite::new(writer, codec()),
        }
    }

    pub async fn send_frame(&mut self, frame: Bytes) -> TransportResult<()> {
        self.inner.send(frame).await?;
        Ok(())
    }

    pub async fn send<M: Serialize>(&mut self, msg: &M) -> TransportResult<()> {
        let body = serde_json::to_vec(msg)?;
        self.send_frame(Bytes::from(body)).await
    }

    /// Send an artifact body. Empty chunks are skipped since the receiver
    /// treats them as a protocol error.
    pub async fn send_body<S>(&mut self, mut body: S) -> TransportResult<u64>
    where
        S: futures::Stream<Item = std::io::Result<Bytes>> + Unpin,
    {
        let mut sent = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            if chunk.is_empty() {
                continue;
            }
            sent += chunk.len() as u64;
            self.send_frame(chunk).await?;
        }
        Ok(sent)
    }

    pub async fn close(&mut self) -> TransportResult<()> {
        SinkExt::<Bytes>::close(&mut self.inner).await?;
        Ok(())
    }
}

/// Both halves of a connection over one stream.
pub struct Connection<S> {
    reader: MessageReader<ReadHalf<S>>,
    writer: MessageWriter<WriteHalf<S>>,
}

impl<S: AsyncRead + AsyncWrite> Connection<S> {
    pub fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: MessageReader::new(reader),
            writer: MessageWriter::new(writer),
        }
    }

    pub fn reader(&mut self) -> &mut MessageReader<ReadHalf<S>> {
        &mut self.reader
    }

    pub fn writer(&mut self) -> &mut MessageWriter<WriteHalf<S>> {
        &mut self.writer
    }

    pub async fn send<M: Serialize>(&mut self, msg: &M) -> TransportResult<()> {
        self.writer.send(msg).await
    }

    pub async fn recv<M: DeserializeOwned>(&mut self) -> TransportResult<Option<M>> {
        self.reader.recv().await
    }

    pub async fn expect<M: DeserializeOwned>(&mut self) -> TransportResult<M> {
        self.reader.expect().await
    }

    pub fn into_split(self) -> (MessageReader<ReadHalf<S>>, MessageWriter<WriteHalf<S>>) {
        (self.reader, self.writer)
    }
}

/// Forward every message read from `reader` into `sender`, mapped through
/// `transform`. Returns when the peer closes the connection or the channel's
/// receiver is dropped.
pub async fn reader_loop<R, M, T>(
    mut reader: MessageReader<R>,
    sender: UnboundedSender<T>,
    mut transform: impl FnMut(M) -> T,
) -> TransportResult<()>
where
    R: AsyncRead + Unpin,
    M: DeserializeOwned,
{
    while let Some(msg) = reader.recv::<M>().await? {
        if sender.send(transform(msg)).is_err() {
            break;
        }
    }
    trace!("Reader loop finished");
    Ok(())
}

/// Write every message received on `receiver` to `writer`. Returns when all
/// senders are dropped.
pub async fn writer_loop<W, M>(
    mut receiver: UnboundedReceiver<M>,
    mut writer: MessageWriter<W>,
) -> TransportResult<()>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    while let Some(msg) = receiver.recv().await {
        writer.send(&msg).await?;
    }
    writer.close().await?;
    trace!("Writer loop finished");
    Ok(())
}
