//! Key layout in the coordination store.
//!
//! All keys are scoped by the cluster group so several clusters can share
//! one etcd.

use ballast_types::NodeId;

/// `capacity/<group>/<nodeId>` → decimal byte count.
pub fn capacity_key(group: &str, node: &NodeId) -> String {
    format!("{}{node}", capacity_prefix(group))
}

/// Prefix of every capacity key in a group.
pub fn capacity_prefix(group: &str) -> String {
    format!("capacity/{group}/")
}

/// `peers/<group>/<nodeId>` → JSON [`PeerInfo`](ballast_types::PeerInfo).
pub fn peer_key(group: &str, node: &NodeId) -> String {
    format!("{}{node}", peer_prefix(group))
}

/// Prefix of every peer record in a group.
pub fn peer_prefix(group: &str) -> String {
    format!("peers/{group}/")
}

/// The single shared key every node watches for locate requests.
pub fn locate_broadcast_key(group: &str) -> String {
    format!("locate-broadcast/{group}")
}

/// A one-shot reply key for a locate request; `token` must be unique.
pub fn locate_reply_key(group: &str, token: &str) -> String {
    format!("locate-reply/{group}/{token}")
}

/// Prefix under which instances of `service` announce their address.
pub fn service_prefix(service: &str) -> String {
    format!("services/{service}/")
}
