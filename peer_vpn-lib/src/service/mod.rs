use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use std::fmt::{self, Display};
use std::sync::{Arc, Mutex};

use crate::dialog::{self, DialogWaiter};
use crate::discovery::Discovery;
use crate::identity::Identity;
use crate::market::ServiceProposal;
use crate::services;
use crate::session::{DestroyCallback, ServiceConfiguration};

pub mod manager;
pub mod pool;
pub mod registry;

pub use manager::Manager;
pub use pool::Pool;
pub use registry::Registry;

/// Event bus topic announcing that a service instance was stopped.
pub const STOP_TOPIC: &str = "Service stop";

#[derive(Debug, Error)]
pub enum Error {
    #[error("unsupported service type: {0:?}")]
    UnsupportedType(String),
    #[error("service instance not found")]
    NotFound,
    #[error("tunnel failed: {0}")]
    Tunnel(String),
    #[error(transparent)]
    Dialog(#[from] dialog::Error),
    #[error(transparent)]
    Openvpn(#[from] services::openvpn::Error),
    #[error(transparent)]
    Wireguard(#[from] services::wireguard::Error),
}

/// A pluggable tunnel backend, one implementation per service type.
#[async_trait]
pub trait Service: Send + Sync {
    /// Blocks until the tunnel terminates. `Ok` on a clean stop, `Err` when
    /// the tunnel failed to start or died abnormally.
    async fn serve(&self, provider_id: &Identity) -> Result<(), Error>;

    /// Idempotent; promptly unblocks a concurrent `serve`.
    async fn stop(&self) -> Result<(), Error>;

    /// Negotiates one consumer session. The returned destroy callback frees
    /// everything allocated for that session and fires exactly once.
    fn provide_config(
        &self,
        consumer_config: Option<&serde_json::Value>,
    ) -> Result<(Option<ServiceConfiguration>, Option<DestroyCallback>), Error>;
}

/// Per-service-type start options, keyed identically in the registry.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Options {
    #[default]
    None,
    Openvpn(services::openvpn::Options),
    Wireguard(services::wireguard::Options),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Id(String);

impl Id {
    pub fn new_random() -> Self {
        Id(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Id {
    fn from(value: &str) -> Self {
        Id(value.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Starting,
    Running,
    NotRunning,
}

impl Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            State::Starting => write!(f, "Starting"),
            State::Running => write!(f, "Running"),
            State::NotRunning => write!(f, "NotRunning"),
        }
    }
}

/// One running service type on this provider, tracked in the pool.
pub struct Instance {
    id: Id,
    state: Mutex<State>,
    options: Options,
    service: Arc<dyn Service>,
    proposal: ServiceProposal,
    dialog_waiter: Arc<dyn DialogWaiter>,
    discovery: Arc<Discovery>,
}

impl Instance {
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Best-effort observable; never a precondition for other operations.
    pub fn state(&self) -> State {
        *self.state.lock().expect("instance state lock")
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn service(&self) -> &Arc<dyn Service> {
        &self.service
    }

    pub fn proposal(&self) -> &ServiceProposal {
        &self.proposal
    }

    fn set_state(&self, state: State) {
        *self.state.lock().expect("instance state lock") = state;
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("service_type", &self.proposal.service_type)
            .finish()
    }
}

/// Event bus seam the pool announces stopped instances on.
pub trait Publisher: Send + Sync {
    fn publish(&self, topic: &'static str, instance: Arc<Instance>);
}
