use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::net::IpAddr;
use std::time::Duration;

use crate::market::{Location, PaymentMethod, ServiceDefinition, ServiceProposal};
use crate::money::{CURRENCY_PEER, Money};
use crate::nat;
use crate::resources;

pub mod endpoint;
pub mod key;
pub mod options;
pub mod service;

pub use options::Options;
pub use service::Manager;

pub const SERVICE_TYPE: &str = "wireguard";
pub const PAYMENT_METHOD: &str = "PER_TIME";

#[derive(Debug, Error)]
pub enum Error {
    #[error("consumer public key missing from session request")]
    ConsumerKeyMissing,
    #[error("parsing consumer config failed: {0}")]
    ConsumerConfig(#[from] serde_json::Error),
    #[error("device configuration failed: {0}")]
    Device(String),
    #[error(transparent)]
    Resources(#[from] resources::Error),
    #[error(transparent)]
    Nat(#[from] nat::Error),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
}

/// Session request blob sent by the consumer.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerConfig {
    pub public_key: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub public_key: String,
    pub endpoint: Endpoint,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerAssignment {
    /// CIDR notation; the consumer host inside the session subnet.
    pub ip_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    /// Milliseconds to wait before connecting. Present only when the
    /// provider's outbound and public addresses differ.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_delay: Option<u32>,
}

/// Stable session config payload returned to the consumer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub provider: ProviderConfig,
    pub consumer: ConsumerAssignment,
}

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
            duration: Some(Duration::from_secs(60 * 60)),
        },
        provider_id: String::new(),
        provider_contact: None,
    }
}
