//! Shared types for ballast storage nodes.
//!
//! This crate defines the identifiers and small records every other crate
//! agrees on:
//!
//! - [`NodeId`] and [`PeerInfo`]: node identity and its advertised addresses.
//! - [`ObjectName`]: the `<hash>.<shardIndex>` name of a stored blob.
//! - [`LocateRequest`] / [`LocateResponse`]: the string payloads of the
//!   broadcast locate protocol.
//! - [`Version`]: a metadata-service version record with per-shard locations.
//! - [`CapacitySnapshot`]: node id → locally held bytes.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Errors produced while parsing shared wire strings.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TypeError {
    /// A blob name did not have the `<hash>.<shardIndex>` shape.
    #[error("invalid object name: {0:?}")]
    InvalidObjectName(String),

    /// A locate request or response had the wrong number of `#` delimiters.
    #[error("malformed locate message: {0:?}")]
    MalformedLocate(String),
}

// ---------------------------------------------------------------------------
// Node identity
// ---------------------------------------------------------------------------

/// Identity of a storage node inside its group.
///
/// This is the key under which the node publishes its capacity and peer
/// record; it is *not* a network address.
#[derive(Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Create a node id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

/// Peer record published by every node under `peers/<group>/<nodeId>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Node identity.
    pub node_id: NodeId,
    /// Advertised host name or IP.
    pub location: String,
    /// Data-plane HTTP port; `location:http_port` is what metadata records point at.
    pub http_port: u16,
    /// Port of the transfer RPC endpoint.
    pub rpc_port: u16,
    /// Public key of the node's transfer endpoint.
    pub endpoint_id: String,
}

impl PeerInfo {
    /// Address stored in metadata location arrays and returned by locate.
    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.location, self.http_port)
    }

    /// Address dialled by the migration sender: `<endpointId>@<location>:<rpcPort>`.
    pub fn transfer_addr(&self) -> String {
        format!("{}@{}:{}", self.endpoint_id, self.location, self.rpc_port)
    }
}

// ---------------------------------------------------------------------------
// Object names
// ---------------------------------------------------------------------------

/// Name of a stored blob: a content hash plus the shard's index in its
/// object's location array, rendered as `<hash>.<shardIndex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ObjectName {
    /// Content hash of the whole object.
    pub hash: String,
    /// Position of this blob in the object's location array.
    pub shard: usize,
}

impl ObjectName {
    /// Create a name from its parts.
    pub fn new(hash: impl Into<String>, shard: usize) -> Self {
        Self {
            hash: hash.into(),
            shard,
        }
    }
}

impl FromStr for ObjectName {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.');
        let (Some(hash), Some(shard), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(TypeError::InvalidObjectName(s.to_string()));
        };
        if hash.is_empty() || !is_canonical_index(shard) {
            return Err(TypeError::InvalidObjectName(s.to_string()));
        }
        let shard = shard
            .parse::<usize>()
            .map_err(|_| TypeError::InvalidObjectName(s.to_string()))?;
        Ok(Self::new(hash, shard))
    }
}

/// Plain decimal digits without a leading zero, so that parsing and
/// displaying a name yields the same string.
fn is_canonical_index(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) && (s == "0" || !s.starts_with('0'))
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.hash, self.shard)
    }
}

// ---------------------------------------------------------------------------
// Locate protocol payloads
// ---------------------------------------------------------------------------

/// Broadcast payload: `"<hash>.<shardIndex>#<replyKey>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocateRequest {
    /// The blob being looked for.
    pub object: ObjectName,
    /// One-shot key the holder writes its answer to.
    pub reply_key: String,
}

impl LocateRequest {
    /// Encode as the value written to the broadcast key.
    pub fn encode(&self) -> String {
        format!("{}#{}", self.object, self.reply_key)
    }

    /// Parse a broadcast value.
    pub fn parse(raw: &str) -> Result<Self, TypeError> {
        let (object, reply_key) =
            split_pair(raw).ok_or_else(|| TypeError::MalformedLocate(raw.to_string()))?;
        let object = object
            .parse::<ObjectName>()
            .map_err(|_| TypeError::MalformedLocate(raw.to_string()))?;
        Ok(Self {
            object,
            reply_key: reply_key.to_string(),
        })
    }
}

/// Reply payload: `"<responderAddress>#<shardIndex>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocateResponse {
    /// Data-plane address of the node holding the blob.
    pub address: String,
    /// Shard index echoed back from the request.
    pub shard: usize,
}

impl LocateResponse {
    /// Encode as the value written to a reply key.
    pub fn encode(&self) -> String {
        format!("{}#{}", self.address, self.shard)
    }

    /// Parse a reply value.
    pub fn parse(raw: &str) -> Result<Self, TypeError> {
        let (address, shard) =
            split_pair(raw).ok_or_else(|| TypeError::MalformedLocate(raw.to_string()))?;
        let shard = shard
            .parse::<usize>()
            .map_err(|_| TypeError::MalformedLocate(raw.to_string()))?;
        Ok(Self {
            address: address.to_string(),
            shard,
        })
    }
}

/// Split on `#`, requiring exactly one delimiter and two non-empty halves.
fn split_pair(raw: &str) -> Option<(&str, &str)> {
    let mut parts = raw.split('#');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(a), Some(b), None) if !a.is_empty() && !b.is_empty() => Some((a, b)),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Metadata records
// ---------------------------------------------------------------------------

/// A version record as returned by a metadata-service replica.
///
/// `locations[i]` is the data-plane address holding shard `i`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    /// Object name the version belongs to.
    pub name: String,
    /// Version sequence number.
    pub sequence: u64,
    /// Content hash shared by all of the version's shards.
    #[serde(default)]
    pub hash: String,
    /// Per-shard data-plane addresses.
    pub locations: Vec<String>,
}

// ---------------------------------------------------------------------------
// Capacity
// ---------------------------------------------------------------------------

/// Node id → locally held bytes, read from the coordination store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapacitySnapshot(BTreeMap<NodeId, u64>);

impl CapacitySnapshot {
    /// Create an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or overwrite) a node's byte count.
    pub fn insert(&mut self, node: NodeId, bytes: u64) {
        self.0.insert(node, bytes);
    }

    /// Byte count of one node.
    pub fn get(&self, node: &NodeId) -> Option<u64> {
        self.0.get(node).copied()
    }

    /// Number of nodes in the snapshot.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the snapshot is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Sum of all byte counts.
    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    /// Iterate over `(node, bytes)` pairs in node-id order.
    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, u64)> {
        self.0.iter().map(|(k, v)| (k, *v))
    }
}

impl FromIterator<(NodeId, u64)> for CapacitySnapshot {
    fn from_iter<I: IntoIterator<Item = (NodeId, u64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
