use serde::{Deserialize, Serialize};

use std::fmt::{self, Display};
use std::time::Duration;

use crate::identity::Identity;
use crate::money::Money;

/// Geographic placement of a service as shown on the marketplace.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    #[serde(default)]
    pub country: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asn: Option<String>,
}

impl Location {
    pub fn from_country(country: impl Into<String>) -> Self {
        Location {
            country: country.into(),
            city: None,
            asn: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDefinition {
    pub location: Location,
    pub location_originate: Location,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_bandwidth: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PaymentMethod {
    #[serde(default)]
    pub price: Money,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "humantime_serde"
    )]
    pub duration: Option<Duration>,
}

/// How a consumer reaches the provider to negotiate a session.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactDescriptor {
    #[serde(rename = "type")]
    pub contact_type: String,
    pub address: String,
}

impl Display for ContactDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.contact_type, self.address)
    }
}

/// Marketplace advertisement for one running service instance.
///
/// Created by the backend, stamped once with the provider contact after the
/// dialog waiter is listening, immutable afterwards.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceProposal {
    pub service_type: String,
    pub service_definition: ServiceDefinition,
    pub payment_method_type: String,
    pub payment_method: PaymentMethod,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub provider_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_contact: Option<ContactDescriptor>,
}

impl ServiceProposal {
    pub fn set_provider_contact(&mut self, provider_id: &Identity, contact: ContactDescriptor) {
        self.provider_id = provider_id.address().to_string();
        self.provider_contact = Some(contact);
    }
}
