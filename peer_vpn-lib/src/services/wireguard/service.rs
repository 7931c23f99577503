use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use std::sync::Arc;

use super::endpoint::{ConnectionEndpoint, WgClient};
use super::{ConsumerConfig, Error, Options};
use crate::identity::Identity;
use crate::location::ServiceLocationInfo;
use crate::nat::{NatService, PortMapper, RuleForwarding};
use crate::resources::Allocator;
use crate::service::{self, Service};
use crate::session::{DestroyCallback, ServiceConfiguration};

/// WireGuard-flavoured tunnel backend. Every consumer session gets its own
/// device, port and /30 subnet; the long-lived part of `serve` is only the
/// stop signal.
pub struct Manager {
    allocator: Arc<Allocator>,
    wg: Arc<dyn WgClient>,
    nat: Arc<NatService>,
    port_mapper: Arc<dyn PortMapper>,
    location: ServiceLocationInfo,
    options: Options,
    stop_signal: CancellationToken,
}

impl Manager {
    pub fn new(
        allocator: Arc<Allocator>,
        wg: Arc<dyn WgClient>,
        nat: Arc<NatService>,
        port_mapper: Arc<dyn PortMapper>,
        location: ServiceLocationInfo,
        options: Options,
    ) -> Self {
        Manager {
            allocator,
            wg,
            nat,
            port_mapper,
            location,
            options,
            stop_signal: CancellationToken::new(),
        }
    }

    fn negotiate(
        &self,
        consumer_config: Option<&serde_json::Value>,
    ) -> Result<(ServiceConfiguration, DestroyCallback), Error> {
        let consumer: ConsumerConfig = match consumer_config {
            Some(value) if !value.is_null() => serde_json::from_value(value.clone())?,
            _ => return Err(Error::ConsumerKeyMissing),
        };

        let mut endpoint = ConnectionEndpoint::new(
            self.allocator.clone(),
            self.wg.clone(),
            self.port_mapper.clone(),
            self.location.clone(),
            self.options.connect_delay,
        );
        endpoint.start()?;

        if let Err(e) = endpoint.add_peer(&consumer.public_key) {
            endpoint.stop();
            return Err(e);
        }

        let config = match endpoint.config() {
            Ok(config) => config,
            Err(e) => {
                endpoint.stop();
                return Err(e);
            }
        };

        let rule = RuleForwarding {
            source_address: config.consumer.ip_address.clone(),
            target_ip: self.location.out_ip.to_string(),
        };
        if let Err(e) = self.nat.add(rule.clone()) {
            let _ = endpoint.remove_peer(&consumer.public_key);
            endpoint.stop();
            return Err(e.into());
        }

        let nat = self.nat.clone();
        let peer_key = consumer.public_key.clone();
        let destroy: DestroyCallback = Box::new(move || {
            let mut endpoint = endpoint;
            if let Err(e) = endpoint.remove_peer(&peer_key) {
                tracing::warn!(error = %e, "failed to remove session peer");
            }
            endpoint.stop();
            if let Err(e) = nat.del(&rule) {
                tracing::error!(error = %e, "failed to delete NAT forwarding rule");
            }
        });

        let configuration = serde_json::to_value(&config)?;
        Ok((configuration, destroy))
    }
}

#[async_trait]
impl Service for Manager {
    async fn serve(&self, provider_id: &Identity) -> Result<(), service::Error> {
        tracing::info!(provider = %provider_id, "wireguard service started");
        self.stop_signal.cancelled().await;
        Ok(())
    }

    async fn stop(&self) -> Result<(), service::Error> {
        self.stop_signal.cancel();
        tracing::info!("wireguard service stopped");
        Ok(())
    }

    fn provide_config(
        &self,
        consumer_config: Option<&serde_json::Value>,
    ) -> Result<(Option<ServiceConfiguration>, Option<DestroyCallback>), service::Error> {
        let (configuration, destroy) = self.negotiate(consumer_config)?;
        Ok((Some(configuration), Some(destroy)))
    }
}
