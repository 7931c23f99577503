use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::time::Duration;

use crate::firewall;
use crate::market::{Location, PaymentMethod, ServiceDefinition, ServiceProposal};
use crate::money::{CURRENCY_PEER, Money};
use crate::nat;

pub mod process;
pub mod service;
pub mod tls;

pub use service::Manager;

pub const SERVICE_TYPE: &str = "openvpn";
pub const PAYMENT_METHOD: &str = "PER_TIME";

/// Advertised throughput per session, in bits per second.
const SESSION_BANDWIDTH: u64 = 83_886_080;

#[derive(Debug, Error)]
pub enum Error {
    #[error("config provider not initialized")]
    ConfigProviderNotInitialized,
    #[error("parsing consumer config failed: {0}")]
    ConsumerConfig(#[from] serde_json::Error),
    #[error("tunnel process failed: {0}")]
    Tunnel(String),
    #[error(transparent)]
    Nat(#[from] nat::Error),
    #[error(transparent)]
    Traversal(#[from] nat::traversal::Error),
    #[error(transparent)]
    Firewall(#[from] firewall::Error),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
}

/// Start options, parseable from CLI flags and from JSON requests alike.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Options {
    pub protocol: String,
    pub port: u16,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            protocol: "udp".to_string(),
            port: 1194,
        }
    }
}

/// Session request blob sent by the consumer. Older clients send nothing;
/// both absence and an empty object are tolerated.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerConfig {
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

pub fn proposal(location: Location, protocol: &str) -> ServiceProposal {
    ServiceProposal {
        service_type: SERVICE_TYPE.to_string(),
        service_definition: ServiceDefinition {
            location: location.clone(),
            location_originate: location,
            session_bandwidth: Some(SESSION_BANDWIDTH),
            protocol: Some(protocol.to_string()),
        },
        payment_method_type: PAYMENT_METHOD.to_string(),
        payment_method: PaymentMethod {
            price: Money::new(0.125, CURRENCY_PEER),
            duration: Some(Duration::from_secs(60 * 60)),
        },
        provider_id: String::new(),
        provider_contact: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proposal_advertises_protocol_and_bandwidth() {
        let location = Location {
            country: "LT".to_string(),
            city: Some("Vilnius".to_string()),
            asn: Some("AS8764".to_string()),
        };
        let proposal = proposal(location.clone(), "tcp");

        assert_eq!(proposal.service_type, "openvpn");
        assert_eq!(proposal.service_definition.location, location);
        assert_eq!(proposal.service_definition.location_originate, location);
        assert_eq!(proposal.service_definition.session_bandwidth, Some(83_886_080));
        assert_eq!(proposal.service_definition.protocol.as_deref(), Some("tcp"));
        assert_eq!(proposal.payment_method_type, "PER_TIME");
        assert_eq!(proposal.payment_method.price.amount, 12_500_000);
        assert_eq!(
            proposal.payment_method.duration,
            Some(Duration::from_secs(3600))
        );
    }

    #[test]
    fn options_default_to_udp_1194() -> anyhow::Result<()> {
        let options: Options = serde_json::from_str("{}")?;
        assert_eq!(options, Options::default());
        assert_eq!(options.protocol, "udp");
        assert_eq!(options.port, 1194);
        Ok(())
    }

    #[test]
    fn options_parse_from_json() -> anyhow::Result<()> {
        let options: Options = serde_json::from_str(r#"{"protocol":"tcp","port":8443}"#)?;
        assert_eq!(
            options,
            Options {
                protocol: "tcp".to_string(),
                port: 8443,
            }
        );
        Ok(())
    }
}
