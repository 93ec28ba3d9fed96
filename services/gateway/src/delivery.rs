//! Thin façade the HTTP layer talks to.

use crate::bridge::{SubmitError, SubmitHandle};
use crate::registry::{Admission, RegistryError, RegistryHandle};

/// Entry points for the two operations the outside world performs:
/// admitting a connection and submitting a notification.
#[derive(Clone)]
pub struct Gateway {
    registry: RegistryHandle,
    submit: SubmitHandle,
}

impl Gateway {
    pub fn new(registry: RegistryHandle, submit: SubmitHandle) -> Self {
        Self { registry, submit }
    }

    /// Admit a new connection for `client_id`. On error the caller
    /// closes the transport; nothing was registered.
    pub async fn admit_connection(&self, client_id: &str) -> Result<Admission, RegistryError> {
        self.registry.admit(client_id).await
    }

    /// Submit a notification for `client_id`. Blocks under publish
    /// backpressure. The returned flag says whether at least one
    /// connection for the client id is live on this instance; it is a
    /// hint, not a delivery confirmation, and says nothing about other
    /// instances.
    pub async fn submit_notification(
        &self,
        client_id: &str,
        message: &str,
    ) -> Result<bool, SubmitError> {
        let delivered_locally = self
            .registry
            .lookup(client_id)
            .await
            .iter()
            .any(|c| c.is_active());
        self.submit.submit(client_id, message).await?;
        Ok(delivered_locally)
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::Bridge;
    use ng_bus::MemoryBus;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    async fn gateway_over(bus: &MemoryBus) -> (Gateway, tokio::task::JoinHandle<()>) {
        let registry = RegistryHandle::spawn();
        let submit = SubmitHandle::new();
        let bridge = tokio::spawn(
            Bridge::new(Arc::new(bus.clone()), registry.clone(), submit.clone(), 4).run(),
        );
        let gateway = Gateway::new(registry, submit);
        // First epoch is up once submission succeeds.
        timeout(Duration::from_secs(5), async {
            while gateway.submit.submit("warmup", "x").await.is_err() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("bus never connected");
        (gateway, bridge)
    }

    #[tokio::test]
    async fn submission_without_local_connection_still_publishes() {
        let bus = MemoryBus::new();
        let (gateway, bridge) = gateway_over(&bus).await;

        let delivered = gateway.submit_notification("alice", "hi").await.unwrap();
        assert!(!delivered);

        timeout(Duration::from_secs(5), async {
            while !bus
                .published()
                .contains(&("alice".to_owned(), "hi".to_owned()))
            {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("notification never published");
        bridge.abort();
    }

    #[tokio::test]
    async fn submission_reports_local_listener() {
        let bus = MemoryBus::new();
        let (gateway, bridge) = gateway_over(&bus).await;

        let _admission = gateway.admit_connection("alice").await.unwrap();
        let delivered = gateway.submit_notification("alice", "hi").await.unwrap();
        assert!(delivered);
        bridge.abort();
    }
}
