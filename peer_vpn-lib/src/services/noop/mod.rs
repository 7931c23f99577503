use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::identity::Identity;
use crate::market::{Location, PaymentMethod, ServiceDefinition, ServiceProposal};
use crate::money::{CURRENCY_PEER, Money};
use crate::service::{self, Service};
use crate::session::{DestroyCallback, ServiceConfiguration};

pub const SERVICE_TYPE: &str = "noop";
pub const PAYMENT_METHOD: &str = "NOOP";

pub fn proposal(country: impl Into<String>) -> ServiceProposal {
    let location = Location::from_country(country);
    ServiceProposal {
        service_type: SERVICE_TYPE.to_string(),
        service_definition: ServiceDefinition {
            location: location.clone(),
            location_originate: location,
            session_bandwidth: None,
            protocol: None,
        },
        payment_method_type: PAYMENT_METHOD.to_string(),
        payment_method: PaymentMethod {
            price: Money::zero(CURRENCY_PEER),
            duration: None,
        },
        provider_id: String::new(),
        provider_contact: None,
    }
}

/// Degenerate backend without a tunnel. Useful for wiring tests and as the
/// smallest template for new service types.
pub struct Manager {
    stop_signal: CancellationToken,
}

impl Manager {
    pub fn new() -> Self {
        Manager {
            stop_signal: CancellationToken::new(),
        }
    }
}

impl Default for Manager {
    fn default() -> Self {
        Manager::new()
    }
}

#[async_trait]
impl Service for Manager {
    async fn serve(&self, provider_id: &Identity) -> Result<(), service::Error> {
        tracing::info!(provider = %provider_id, "noop service started");
        self.stop_signal.cancelled().await;
        Ok(())
    }

    async fn stop(&self) -> Result<(), service::Error> {
        self.stop_signal.cancel();
        tracing::info!("noop service stopped");
        Ok(())
    }

    fn provide_config(
        &self,
        _consumer_config: Option<&serde_json::Value>,
    ) -> Result<(Option<ServiceConfiguration>, Option<DestroyCallback>), service::Error> {
        Ok((None, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn proposal_is_free_and_unmetered() {
        let proposal = proposal("LT");
        assert_eq!(proposal.service_type, "noop");
        assert_eq!(proposal.service_definition.location.country, "LT");
        assert_eq!(proposal.payment_method_type, "NOOP");
        assert_eq!(proposal.payment_method.price, Money::zero(CURRENCY_PEER));
    }

    #[test]
    fn provide_config_negotiates_nothing() -> anyhow::Result<()> {
        let manager = Manager::new();
        let (config, destroy) = manager.provide_config(None)?;
        assert!(config.is_none());
        assert!(destroy.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn serve_blocks_until_stopped() -> anyhow::Result<()> {
        let manager = Arc::new(Manager::new());
        let serving = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .serve(&Identity::from_address("provider-id"))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!serving.is_finished());

        manager.stop().await?;
        serving.await??;
        Ok(())
    }

    #[tokio::test]
    async fn stop_is_idempotent() -> anyhow::Result<()> {
        let manager = Manager::new();
        manager.stop().await?;
        manager.stop().await?;
        manager.serve(&Identity::from_address("provider-id")).await?;
        Ok(())
    }
}
