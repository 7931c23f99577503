use rand::Rng;

use crate::identity::Identity;

/// Transport security material for one tunnel server. The data-plane crypto
/// itself lives in the tunnel daemon; the runtime only mints and routes the
/// material.
#[derive(Clone, Debug)]
pub struct Primitives {
    pub ca_subject: String,
    pub server_subject: String,
    pub preshared_key: String,
}

/// Primitives are keyed by the service location and the provider identity so
/// a relocated or re-keyed provider never reuses old material.
pub fn primitives(country: &str, provider_id: &Identity) -> Primitives {
    let mut secret = [0u8; 32];
    rand::rng().fill(&mut secret);

    Primitives {
        ca_subject: format!("CA / {country} / {}", provider_id.address()),
        server_subject: format!("Server / {country} / {}", provider_id.address()),
        preshared_key: hex::encode(secret),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_embed_location_and_identity() {
        let primitives = primitives("LT", &Identity::from_address("0xbeef"));
        assert!(primitives.ca_subject.contains("LT"));
        assert!(primitives.server_subject.contains("0xbeef"));
        assert_eq!(primitives.preshared_key.len(), 64);
    }

    #[test]
    fn each_server_gets_fresh_material() {
        let provider = Identity::from_address("0xbeef");
        let first = primitives("LT", &provider);
        let second = primitives("LT", &provider);
        assert_ne!(first.preshared_key, second.preshared_key);
    }
}
