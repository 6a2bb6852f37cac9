//! Framed exchanges on a single bi-stream, client and server side.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::NetError;
use crate::framing::{read_frame, write_frame};
use crate::message::{Ack, MigrationMessage, ObjectChunk};
use crate::{RpcHandler, TransferStream};

/// Client end of a `ReceiveData` stream over any byte-stream pair.
pub struct FramedStream<W, R> {
    send: W,
    recv: R,
    finished: bool,
}

impl<W, R> FramedStream<W, R>
where
    W: AsyncWrite + Unpin + Send,
    R: AsyncRead + Unpin + Send,
{
    /// Announce a `ReceiveData` exchange on a freshly opened stream.
    pub async fn open(mut send: W, recv: R) -> Result<Self, NetError> {
        write_frame(&mut send, &MigrationMessage::ReceiveData).await?;
        Ok(Self {
            send,
            recv,
            finished: false,
        })
    }

    async fn read_ack(&mut self) -> Result<Option<Ack>, NetError> {
        match read_frame(&mut self.recv).await? {
            Some(MigrationMessage::Ack(ack)) => Ok(Some(ack)),
            Some(other) => Err(NetError::Unexpected(format!("expected Ack, got {other:?}"))),
            None => Ok(None),
        }
    }
}

#[async_trait::async_trait]
impl<W, R> TransferStream for FramedStream<W, R>
where
    W: AsyncWrite + Unpin + Send,
    R: AsyncRead + Unpin + Send,
{
    async fn send_chunk(&mut self, chunk: ObjectChunk) -> Result<Ack, NetError> {
        if self.finished {
            return Err(NetError::StreamClosed);
        }
        write_frame(&mut self.send, &MigrationMessage::Chunk(chunk)).await?;
        self.read_ack().await?.ok_or(NetError::StreamClosed)
    }

    async fn finish(&mut self) -> Result<Ack, NetError> {
        if self.finished {
            return Ok(Ack::ok());
        }
        self.finished = true;
        self.send.shutdown().await?;
        // A receiver that closes without a verdict had nothing to object to.
        Ok(self.read_ack().await?.unwrap_or_else(Ack::ok))
    }
}

/// Issue a single-shot request on a fresh stream and wait for its [`Ack`].
pub async fn call<W, R>(mut send: W, mut recv: R, request: &MigrationMessage) -> Result<Ack, NetError>
where
    W: AsyncWrite + Unpin + Send,
    R: AsyncRead + Unpin + Send,
{
    write_frame(&mut send, request).await?;
    send.shutdown().await?;
    match read_frame(&mut recv).await? {
        Some(MigrationMessage::Ack(ack)) => Ok(ack),
        Some(other) => Err(NetError::Unexpected(format!("expected Ack, got {other:?}"))),
        None => Err(NetError::StreamClosed),
    }
}

/// Serve one inbound stream: read the request frame and dispatch it.
///
/// Runs until the exchange completes or the stream breaks; the send side
/// is half-closed on return.
pub async fn serve_stream<W, R>(
    handler: &dyn RpcHandler,
    mut send: W,
    mut recv: R,
) -> Result<(), NetError>
where
    W: AsyncWrite + Unpin + Send,
    R: AsyncRead + Unpin + Send,
{
    let Some(request) = read_frame(&mut recv).await? else {
        return Ok(());
    };

    let ack = match request {
        MigrationMessage::ReceiveData => {
            return serve_receive(handler, send, recv).await;
        }
        MigrationMessage::FinishReceive(object) => handler.finish_receive(object).await,
        MigrationMessage::RequireSend {
            required_bytes,
            target,
        } => handler.require_send(required_bytes, target).await,
        MigrationMessage::JoinCommand => handler.join().await,
        MigrationMessage::LeaveCommand => handler.leave().await,
        other => {
            warn!("unexpected request frame: {other:?}");
            Ack::fail("unexpected request")
        }
    };

    write_frame(&mut send, &MigrationMessage::Ack(ack)).await?;
    send.shutdown().await?;
    Ok(())
}

async fn serve_receive<W, R>(handler: &dyn RpcHandler, mut send: W, mut recv: R) -> Result<(), NetError>
where
    W: AsyncWrite + Unpin + Send,
    R: AsyncRead + Unpin + Send,
{
    let mut session = handler.receive_session().await;
    loop {
        match read_frame(&mut recv).await {
            Ok(Some(MigrationMessage::Chunk(chunk))) => {
                let ack = session.chunk(chunk).await;
                if let Err(e) = write_frame(&mut send, &MigrationMessage::Ack(ack)).await {
                    session.abort(e.to_string()).await;
                    return Err(e);
                }
            }
            Ok(Some(other)) => {
                let reason = format!("unexpected frame on receive stream: {other:?}");
                warn!("{reason}");
                session.abort(reason.clone()).await;
                write_frame(&mut send, &MigrationMessage::Ack(Ack::fail(reason))).await?;
                send.shutdown().await?;
                return Ok(());
            }
            Ok(None) => {
                let ack = session.end().await;
                debug!(success = ack.success, "receive stream ended");
                write_frame(&mut send, &MigrationMessage::Ack(ack)).await?;
                send.shutdown().await?;
                return Ok(());
            }
            Err(e) => {
                session.abort(e.to_string()).await;
                return Err(e);
            }
        }
    }
}
