use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::Rng;
use x25519_dalek::{PublicKey, StaticSecret};

/// Curve25519 key pair in the standard base64 rendering.
#[derive(Clone, Debug)]
pub struct KeyPair {
    pub private: String,
    pub public: String,
}

pub fn generate_key_pair() -> KeyPair {
    let mut seed = [0u8; 32];
    rand::rng().fill(&mut seed);
    let secret = StaticSecret::from(seed);
    let public = PublicKey::from(&secret);

    KeyPair {
        private: STANDARD.encode(secret.to_bytes()),
        public: STANDARD.encode(public.as_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_base64_of_32_bytes() -> anyhow::Result<()> {
        let pair = generate_key_pair();
        assert_eq!(STANDARD.decode(&pair.private)?.len(), 32);
        assert_eq!(STANDARD.decode(&pair.public)?.len(), 32);
        Ok(())
    }

    #[test]
    fn pairs_are_unique_per_session() {
        assert_ne!(generate_key_pair().private, generate_key_pair().private);
    }
}
