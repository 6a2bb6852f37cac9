//! Protocol messages for ballast transfer RPC.
//!
//! All messages are serialized with postcard over QUIC bi-streams.

use serde::{Deserialize, Serialize};

/// A slice of one object moving between nodes.
///
/// An object larger than the sender's chunk size arrives as several
/// consecutive chunks with the same `file_name` and `size`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectChunk {
    /// Object name, `<hash>.<shardIndex>`.
    pub file_name: String,
    /// Payload bytes of this chunk.
    pub data: Vec<u8>,
    /// Declared total size of the object.
    pub size: u64,
    /// Data-plane address of the sending node.
    pub origin: String,
}

/// Identifies a fully transferred object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectDescriptor {
    /// Object name, `<hash>.<shardIndex>`.
    pub file_name: String,
    /// Total size in bytes.
    pub size: u64,
    /// Data-plane address of the node the object came from.
    pub origin: String,
}

/// Outcome of any transfer RPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Whether the request succeeded.
    pub success: bool,
    /// Error text on failure; informational otherwise.
    pub message: String,
}

impl Ack {
    /// A successful acknowledgement.
    pub fn ok() -> Self {
        Self {
            success: true,
            message: String::new(),
        }
    }

    /// A failed acknowledgement carrying `message`.
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }

    /// Render a `Result` at the RPC boundary.
    pub fn from_result<E: std::fmt::Display>(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Self::ok(),
            Err(e) => Self::fail(e.to_string()),
        }
    }
}

/// Protocol messages exchanged between ballast nodes.
///
/// Every exchange runs on its own bi-stream. The first frame names the
/// request; `ReceiveData` is followed by any number of [`Chunk`] frames,
/// each answered by an [`Ack`], and a final `Ack` after the sender
/// half-closes. Every other request is answered by exactly one `Ack`.
///
/// [`Chunk`]: MigrationMessage::Chunk
/// [`Ack`]: MigrationMessage::Ack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationMessage {
    /// Open a client-streaming object transfer.
    ReceiveData,

    /// One chunk on a `ReceiveData` stream.
    Chunk(ObjectChunk),

    /// Response to any request or chunk.
    Ack(Ack),

    /// Mark an object as fully received.
    FinishReceive(ObjectDescriptor),

    /// Ask the peer to push `required_bytes` of its objects to `target`.
    RequireSend {
        /// Bytes the peer should move.
        required_bytes: u64,
        /// Transfer address of the receiving node.
        target: String,
    },

    /// The peer should rebalance as a newly joined node.
    JoinCommand,

    /// The peer should drain itself and leave.
    LeaveCommand,
}
