//! Transfer transport built on iroh QUIC.
//!
//! [`IrohTransport`] wraps an iroh [`Endpoint`] and provides:
//! - Connection pooling (reuse connections to the same peer).
//! - `ReceiveData` streams and single-shot RPCs over fresh bi-streams.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use iroh::endpoint::{Connection, RecvStream, SendStream};
use iroh::{Endpoint, EndpointAddr, EndpointId};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::NetError;
use crate::message::{Ack, MigrationMessage};
use crate::stream::{FramedStream, call};
use crate::{MigrationTransport, TransferStream};

/// Parse a transfer address `<endpointId>@<host>:<port>`.
///
/// The host may be a name; it is resolved and the first address used.
pub async fn parse_transfer_addr(addr: &str) -> Result<EndpointAddr, NetError> {
    let invalid = |reason: &str| NetError::InvalidAddress {
        addr: addr.to_string(),
        reason: reason.to_string(),
    };

    let (id_str, host_port) = addr
        .split_once('@')
        .ok_or_else(|| invalid("expected <endpointId>@<host>:<port>"))?;
    let endpoint_id: EndpointId = id_str
        .parse()
        .map_err(|_| invalid("invalid endpoint id (expected hex-encoded public key)"))?;

    let socket_addr: SocketAddr = match host_port.parse() {
        Ok(sock) => sock,
        Err(_) => tokio::net::lookup_host(host_port)
            .await
            .map_err(|e| invalid(&e.to_string()))?
            .next()
            .ok_or_else(|| invalid("host did not resolve"))?,
    };

    Ok(EndpointAddr::new(endpoint_id).with_ip_addr(socket_addr))
}

/// Migration transport over iroh QUIC.
///
/// Outgoing connections are cached per remote endpoint id; each transfer
/// stream or RPC opens its own bi-stream on the pooled connection.
pub struct IrohTransport {
    endpoint: Endpoint,
    /// Held for the whole lookup-or-connect so concurrent callers to the
    /// same peer share one connection.
    connections: Arc<Mutex<HashMap<EndpointId, Connection>>>,
    alpn: Vec<u8>,
}

impl IrohTransport {
    /// Wrap an endpoint that is shared with an iroh
    /// [`Router`](iroh::protocol::Router); this transport only dials out.
    pub fn from_endpoint_with_alpn(endpoint: Endpoint, alpn: Vec<u8>) -> Self {
        Self {
            endpoint,
            connections: Arc::new(Mutex::new(HashMap::new())),
            alpn,
        }
    }

    // -------------------------------------------------------------------
    // Connection management
    // -------------------------------------------------------------------

    async fn get_connection(&self, addr: EndpointAddr) -> Result<Connection, NetError> {
        let remote_id = addr.id;
        let mut cache = self.connections.lock().await;

        if let Some(conn) = cache.get(&remote_id)
            && conn.close_reason().is_none()
        {
            return Ok(conn.clone());
        }

        debug!(remote = %remote_id.fmt_short(), "connecting to peer");
        let conn = self
            .endpoint
            .connect(addr, &self.alpn)
            .await
            .map_err(|e| NetError::Connect(e.to_string()))?;

        cache.insert(remote_id, conn.clone());
        Ok(conn)
    }

    /// Open a bi-stream to `addr`, evicting the pooled connection if the
    /// stream cannot be opened on it.
    async fn open_bi(&self, addr: &str) -> Result<(SendStream, RecvStream), NetError> {
        let endpoint_addr = parse_transfer_addr(addr).await?;
        let remote_id = endpoint_addr.id;
        let conn = self.get_connection(endpoint_addr).await?;
        match conn.open_bi().await {
            Ok(streams) => Ok(streams),
            Err(e) => {
                self.connections.lock().await.remove(&remote_id);
                Err(NetError::StreamOpen(e.to_string()))
            }
        }
    }

    /// Gracefully close the transport.
    pub async fn close(&self) {
        self.endpoint.close().await;
    }
}

#[async_trait::async_trait]
impl MigrationTransport for IrohTransport {
    async fn open_stream(&self, addr: &str) -> Result<Box<dyn TransferStream>, NetError> {
        let (send, recv) = self.open_bi(addr).await?;
        let stream = FramedStream::open(send, recv).await?;
        debug!(%addr, "opened transfer stream");
        Ok(Box::new(stream))
    }

    async fn call(&self, addr: &str, request: MigrationMessage) -> Result<Ack, NetError> {
        let (send, recv) = self.open_bi(addr).await?;
        call(send, recv, &request).await
    }
}
