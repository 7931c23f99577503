use async_trait::async_trait;

use std::sync::{Arc, Mutex};

use super::process::{ServerFactory, TunnelProcess};
use super::tls::{self, Primitives};
use super::{ConsumerConfig, Error, Options};
use crate::firewall::Firewall;
use crate::identity::Identity;
use crate::location::ServiceLocationInfo;
use crate::nat::traversal::Pinger;
use crate::nat::{NatService, PortMapper, RuleForwarding};
use crate::service::{self, Service};
use crate::session::{DestroyCallback, ServiceConfiguration};

/// Tunnel subnet the daemon hands addresses out of.
const TUNNEL_SUBNET: &str = "10.8.0.0/24";

/// Everything the external daemon needs to come up.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub protocol: String,
    pub port: u16,
    pub subnet: String,
    pub ca_subject: String,
    pub server_subject: String,
}

/// Builds per-consumer session configs around the server's TLS primitives
/// and the outbound/public IP pair.
struct SessionConfigNegotiator {
    primitives: Primitives,
    location: ServiceLocationInfo,
    options: Options,
}

impl SessionConfigNegotiator {
    fn provide_config(&self, consumer: &ConsumerConfig) -> ServiceConfiguration {
        serde_json::json!({
            "protocol": self.options.protocol,
            "remote": self.location.pub_ip.to_string(),
            "remoteOutbound": self.location.out_ip.to_string(),
            "port": consumer.port.unwrap_or(self.options.port),
            "caSubject": self.primitives.ca_subject,
            "serverSubject": self.primitives.server_subject,
            "presharedKey": self.primitives.preshared_key,
        })
    }
}

/// OpenVPN-flavoured tunnel backend: one long-lived daemon, sessions share
/// the tunnel subnet.
pub struct Manager {
    nat: Arc<NatService>,
    firewall: Arc<Firewall>,
    pinger: Arc<Pinger>,
    port_mapper: Arc<dyn PortMapper>,
    server_factory: ServerFactory,
    location: ServiceLocationInfo,
    options: Options,

    negotiator: Mutex<Option<Arc<SessionConfigNegotiator>>>,
    server: Mutex<Option<Arc<dyn TunnelProcess>>>,
    nat_rule: Mutex<Option<RuleForwarding>>,
    release_port_mapping: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Manager {
    pub fn new(
        nat: Arc<NatService>,
        firewall: Arc<Firewall>,
        pinger: Arc<Pinger>,
        port_mapper: Arc<dyn PortMapper>,
        server_factory: ServerFactory,
        location: ServiceLocationInfo,
        options: Options,
    ) -> Self {
        Manager {
            nat,
            firewall,
            pinger,
            port_mapper,
            server_factory,
            location,
            options,
            negotiator: Mutex::new(None),
            server: Mutex::new(None),
            nat_rule: Mutex::new(None),
            release_port_mapping: Mutex::new(None),
        }
    }

    async fn serve_tunnel(&self, provider_id: &Identity) -> Result<(), Error> {
        let rule = RuleForwarding {
            source_address: TUNNEL_SUBNET.to_string(),
            target_ip: self.location.out_ip.to_string(),
        };
        self.nat.add(rule.clone())?;
        *self.nat_rule.lock().expect("nat rule lock") = Some(rule);

        let release = self.port_mapper.map_port(self.options.port);
        *self
            .release_port_mapping
            .lock()
            .expect("port mapping lock") = Some(release);

        let primitives = tls::primitives(&self.location.country, provider_id);
        *self.negotiator.lock().expect("negotiator lock") = Some(Arc::new(SessionConfigNegotiator {
            primitives: primitives.clone(),
            location: self.location.clone(),
            options: self.options.clone(),
        }));

        let server_config = ServerConfig {
            protocol: self.options.protocol.clone(),
            port: self.options.port,
            subnet: TUNNEL_SUBNET.to_string(),
            ca_subject: primitives.ca_subject,
            server_subject: primitives.server_subject,
        };
        let server = (self.server_factory)(&server_config);
        *self.server.lock().expect("server lock") = Some(server.clone());

        // wait for the NAT hole before the daemon accepts external traffic
        self.pinger.bind_port(self.options.port);
        if self.location.behind_nat() {
            self.pinger.wait_for_hole().await?;
        }

        self.firewall
            .add_inbound_rule(&self.options.protocol, self.options.port)?;

        tracing::info!("starting tunnel daemon");
        server.start().await?;
        server.wait().await
    }

    fn teardown(&self) {
        if let Some(release) = self
            .release_port_mapping
            .lock()
            .expect("port mapping lock")
            .take()
        {
            release();
        }

        if let Err(e) = self
            .firewall
            .remove_inbound_rule(&self.options.protocol, self.options.port)
        {
            tracing::debug!(error = %e, "no firewall rule to remove");
        }

        if let Some(rule) = self.nat_rule.lock().expect("nat rule lock").take() {
            if let Err(e) = self.nat.del(&rule) {
                tracing::error!(error = %e, "failed to delete NAT forwarding rule");
            }
        }
    }
}

#[async_trait]
impl Service for Manager {
    async fn serve(&self, provider_id: &Identity) -> Result<(), service::Error> {
        let result = self.serve_tunnel(provider_id).await;
        if result.is_ok() {
            tracing::info!("tunnel daemon exited");
        }
        result.map_err(service::Error::from)
    }

    async fn stop(&self) -> Result<(), service::Error> {
        self.teardown();
        let server = self.server.lock().expect("server lock").take();
        if let Some(server) = server {
            server.stop().await;
        }
        tracing::info!("openvpn service stopped");
        Ok(())
    }

    fn provide_config(
        &self,
        consumer_config: Option<&serde_json::Value>,
    ) -> Result<(Option<ServiceConfiguration>, Option<DestroyCallback>), service::Error> {
        let negotiator = self
            .negotiator
            .lock()
            .expect("negotiator lock")
            .clone()
            .ok_or(Error::ConfigProviderNotInitialized)?;

        // older clients send no config at all
        let consumer = match consumer_config {
            Some(value) if !value.is_null() => {
                serde_json::from_value(value.clone()).map_err(Error::ConsumerConfig)?
            }
            _ => ConsumerConfig::default(),
        };

        Ok((Some(negotiator.provide_config(&consumer)), None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::{self, FirewallOps};
    use crate::nat::testing::RecordingNatOps;
    use crate::nat::traversal::{DEFAULT_HOLE_PUNCH_TIMEOUT, NatStatus};
    use crate::nat::NoopPortMapper;
    use tokio::sync::watch;

    struct AllowAllFirewall;

    impl FirewallOps for AllowAllFirewall {
        fn allow_inbound(&self, _protocol: &str, _port: u16) -> Result<(), firewall::Error> {
            Ok(())
        }

        fn revoke_inbound(&self, _protocol: &str, _port: u16) -> Result<(), firewall::Error> {
            Ok(())
        }
    }

    struct InstantExit;

    #[async_trait]
    impl TunnelProcess for InstantExit {
        async fn start(&self) -> Result<(), Error> {
            Ok(())
        }

        async fn wait(&self) -> Result<(), Error> {
            Ok(())
        }

        async fn stop(&self) {}
    }

    fn location() -> ServiceLocationInfo {
        ServiceLocationInfo {
            out_ip: "192.0.2.10".parse().unwrap(),
            pub_ip: "192.0.2.10".parse().unwrap(),
            country: "LT".to_string(),
        }
    }

    fn manager(ops: Arc<RecordingNatOps>) -> Manager {
        let (_status_tx, status_rx) = watch::channel(NatStatus::Open);
        std::mem::forget(_status_tx);
        Manager::new(
            Arc::new(NatService::new(Box::new(ops))),
            Arc::new(Firewall::new(Box::new(AllowAllFirewall))),
            Arc::new(Pinger::new(status_rx, DEFAULT_HOLE_PUNCH_TIMEOUT)),
            Arc::new(NoopPortMapper),
            Box::new(|_config| Arc::new(InstantExit) as Arc<dyn TunnelProcess>),
            location(),
            Options::default(),
        )
    }

    #[tokio::test]
    async fn provide_config_before_serve_is_rejected() {
        let manager = manager(Arc::new(RecordingNatOps::default()));
        let result = manager.provide_config(None);
        assert!(matches!(
            result,
            Err(service::Error::Openvpn(Error::ConfigProviderNotInitialized))
        ));
    }

    #[tokio::test]
    async fn serve_installs_and_stop_removes_the_nat_rule() -> anyhow::Result<()> {
        let ops = Arc::new(RecordingNatOps::default());
        let manager = manager(ops.clone());

        manager.serve(&Identity::from_address("0xbeef")).await?;
        assert_eq!(ops.applied.lock().unwrap().len(), 1);

        manager.stop().await?;
        assert!(ops.applied.lock().unwrap().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn config_embeds_primitives_and_ip_pair() -> anyhow::Result<()> {
        let manager = manager(Arc::new(RecordingNatOps::default()));
        manager.serve(&Identity::from_address("0xbeef")).await?;

        let (config, destroy) = manager.provide_config(Some(&serde_json::json!({})))?;
        let config = config.expect("session config");
        assert_eq!(config["remote"], "192.0.2.10");
        assert_eq!(config["protocol"], "udp");
        assert_eq!(config["port"], 1194);
        assert!(config["presharedKey"].as_str().unwrap().len() == 64);
        assert!(destroy.is_none());

        manager.stop().await?;
        Ok(())
    }
}
