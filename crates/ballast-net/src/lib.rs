//! Transfer RPC between ballast nodes, on iroh QUIC.
//!
//! This crate implements the node-to-node surface used by migration:
//!
//! - [`MigrationMessage`]: the wire protocol (postcard, length-prefixed).
//! - [`TransferStream`] / [`MigrationTransport`]: the client seams the
//!   migration engine is written against, so tests can substitute an
//!   in-process transport.
//! - [`IrohTransport`]: the production transport with connection pooling.
//! - [`serve_stream`]: the server loop that dispatches one inbound stream to
//!   an [`RpcHandler`].

mod error;
mod framing;
mod message;
mod stream;
mod transport;

pub use error::NetError;
pub use framing::{MAX_MESSAGE_SIZE, read_frame, write_frame};
pub use message::{Ack, MigrationMessage, ObjectChunk, ObjectDescriptor};
pub use stream::{FramedStream, call, serve_stream};
pub use transport::{IrohTransport, parse_transfer_addr};

/// One outbound transfer stream to a single peer.
///
/// A stream has exactly one writer: callers must not share it between
/// tasks. Each chunk is acknowledged before the next one is sent.
#[async_trait::async_trait]
pub trait TransferStream: Send {
    /// Send one chunk and wait for the receiver's acknowledgement.
    async fn send_chunk(&mut self, chunk: ObjectChunk) -> Result<Ack, NetError>;

    /// Half-close the send side and collect the receiver's final verdict.
    async fn finish(&mut self) -> Result<Ack, NetError>;
}

/// Opens transfer streams and issues single-shot RPCs by transfer address.
///
/// Addresses have the form `<endpointId>@<host>:<port>`.
#[async_trait::async_trait]
pub trait MigrationTransport: Send + Sync {
    /// Dial `addr` and open a `ReceiveData` stream.
    async fn open_stream(&self, addr: &str) -> Result<Box<dyn TransferStream>, NetError>;

    /// Send a single request and wait for its [`Ack`].
    async fn call(&self, addr: &str, request: MigrationMessage) -> Result<Ack, NetError>;
}

/// Server side of one `ReceiveData` stream.
#[async_trait::async_trait]
pub trait ChunkSink: Send {
    /// Handle one chunk; the returned ack is written back immediately.
    async fn chunk(&mut self, chunk: ObjectChunk) -> Ack;

    /// The sender half-closed the stream.
    async fn end(self: Box<Self>) -> Ack;

    /// The stream broke; drop any partial state.
    async fn abort(self: Box<Self>, reason: String);
}

/// Handles inbound transfer RPCs.
#[async_trait::async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    /// Start a session for a `ReceiveData` stream.
    async fn receive_session(&self) -> Box<dyn ChunkSink>;

    /// `FinishReceive(objectDescriptor)`.
    async fn finish_receive(&self, object: ObjectDescriptor) -> Ack;

    /// `RequireSend(requiredBytes, targetAddress)`.
    async fn require_send(&self, required_bytes: u64, target: String) -> Ack;

    /// `JoinCommand()`.
    async fn join(&self) -> Ack;

    /// `LeaveCommand()`.
    async fn leave(&self) -> Ack;
}

/// Derive a cluster-specific ALPN from a shared secret.
///
/// The ALPN is `ballast/0/<first 16 hex chars of blake3(secret)>`, so nodes
/// of different clusters fail the QUIC handshake instead of exchanging
/// objects.
pub fn cluster_alpn(secret: &[u8]) -> Vec<u8> {
    let hash = blake3::hash(secret);
    let hex = hash.to_hex();
    format!("ballast/0/{}", &hex[..16]).into_bytes()
}
