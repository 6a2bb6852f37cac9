//! Service discovery over the coordination store.

use std::sync::Arc;

use crate::error::CoordError;
use crate::keys;
use crate::traits::Coordinator;

/// Looks up instances announced under `services/<service>/<instance>`.
#[derive(Clone)]
pub struct ServiceDiscovery {
    coord: Arc<dyn Coordinator>,
}

impl ServiceDiscovery {
    /// Create a discovery view.
    pub fn new(coord: Arc<dyn Coordinator>) -> Self {
        Self { coord }
    }

    /// Announce an instance's address.
    pub async fn announce(
        &self,
        service: &str,
        instance: &str,
        address: &str,
    ) -> Result<(), CoordError> {
        let key = format!("{}{instance}", keys::service_prefix(service));
        self.coord.put(&key, address).await
    }

    /// Addresses of every announced instance, in key order.
    pub async fn addresses(&self, service: &str) -> Result<Vec<String>, CoordError> {
        Ok(self
            .coord
            .get_prefix(&keys::service_prefix(service))
            .await?
            .into_iter()
            .map(|(_, addr)| addr)
            .filter(|addr| !addr.is_empty())
            .collect())
    }
}
