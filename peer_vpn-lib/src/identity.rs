use ed25519_dalek::{Signer as _, SigningKey};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::fmt::{self, Display};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Error)]
pub enum Error {
    #[error("identity {0} not found in keystore")]
    NotFound(String),
    #[error("keystore entry for {0} is corrupt")]
    CorruptEntry(String),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Provider-side address. Opaque to the runtime, created by the keystore.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity(String);

impl Identity {
    pub fn from_address(address: impl Into<String>) -> Self {
        Identity(address.into())
    }

    pub fn address(&self) -> &str {
        &self.0
    }
}

impl Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Signs outgoing marketplace writes and dialog handshakes on behalf of one
/// identity. Implementations live with the keystore.
pub trait Signer: Send + Sync + fmt::Debug {
    fn sign(&self, payload: &[u8]) -> Result<Signature, Error>;
}

pub type SignerFactory = Arc<dyn Fn(&Identity) -> Arc<dyn Signer> + Send + Sync>;

/// Detached signature, rendered base64 on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(pub String);

#[derive(Debug)]
struct KeystoreSigner {
    key: SigningKey,
}

impl Signer for KeystoreSigner {
    fn sign(&self, payload: &[u8]) -> Result<Signature, Error> {
        use base64::Engine;
        let signature = self.key.sign(payload);
        Ok(Signature(
            base64::engine::general_purpose::STANDARD.encode(signature.to_bytes()),
        ))
    }
}

#[derive(Serialize, Deserialize)]
struct KeystoreEntry {
    address: String,
    seed: String,
}

/// File-backed identity store. One JSON entry per identity, keyed by address.
///
/// TODO: encrypt the stored seed with the supplied passphrase.
pub struct Keystore {
    directory: PathBuf,
}

impl Keystore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Keystore {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn create(&self, _passphrase: &str) -> Result<Identity, Error> {
        let mut seed = [0u8; 32];
        rand::rng().fill(&mut seed);
        let key = SigningKey::from_bytes(&seed);
        let address = format!("0x{}", hex::encode(&key.verifying_key().as_bytes()[..20]));

        let entry = KeystoreEntry {
            address: address.clone(),
            seed: hex::encode(seed),
        };
        fs::create_dir_all(&self.directory)?;
        let path = self.entry_path(&address);
        fs::write(&path, serde_json::to_vec_pretty(&entry)?)?;
        restrict_permissions(&path)?;

        Ok(Identity(address))
    }

    pub fn unlock(&self, address: &str, _passphrase: &str) -> Result<Arc<dyn Signer>, Error> {
        let path = self.entry_path(address);
        let raw = fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(address.to_string())
            } else {
                Error::IO(e)
            }
        })?;
        let entry: KeystoreEntry = serde_json::from_slice(&raw)?;
        let seed: [u8; 32] = hex::decode(&entry.seed)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| Error::CorruptEntry(address.to_string()))?;

        Ok(Arc::new(KeystoreSigner {
            key: SigningKey::from_bytes(&seed),
        }))
    }

    fn entry_path(&self, address: &str) -> PathBuf {
        self.directory.join(format!("{address}.json"))
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<(), Error> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<(), Error> {
    Ok(())
}

const CACHE_FILE: &str = "remember.json";

#[derive(Default, Serialize, Deserialize)]
struct CachedIdentity {
    address: String,
}

/// Remembers the last used identity so restarts do not mint a new one.
pub struct IdentityCache {
    path: PathBuf,
}

impl IdentityCache {
    pub fn new(keystore_dir: &Path) -> Self {
        IdentityCache {
            path: keystore_dir.join(CACHE_FILE),
        }
    }

    pub fn get(&self) -> Option<Identity> {
        let raw = fs::read(&self.path).ok()?;
        let cached: CachedIdentity = serde_json::from_slice(&raw).ok()?;
        if cached.address.is_empty() {
            None
        } else {
            Some(Identity(cached.address))
        }
    }

    pub fn store(&self, identity: &Identity) -> Result<(), Error> {
        let cached = CachedIdentity {
            address: identity.address().to_string(),
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_vec_pretty(&cached)?)?;
        Ok(())
    }
}

/// Resolves the identity to provide with: explicit address, remembered one,
/// or a freshly created entry, in that order.
pub fn load_identity(
    keystore: &Keystore,
    requested: Option<&str>,
    passphrase: &str,
) -> Result<(Identity, Arc<dyn Signer>), Error> {
    let cache = IdentityCache::new(keystore.directory());

    let identity = match requested {
        Some(address) if !address.is_empty() => Identity::from_address(address),
        _ => match cache.get() {
            Some(identity) => identity,
            None => keystore.create(passphrase)?,
        },
    };

    let signer = keystore.unlock(identity.address(), passphrase)?;
    cache.store(&identity)?;
    Ok((identity, signer))
}
