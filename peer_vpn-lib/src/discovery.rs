use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time;
use tokio_util::sync::CancellationToken;

use std::sync::Arc;
use std::time::Duration;

use crate::identity::Identity;
use crate::market::ServiceProposal;

pub const DEFAULT_REPUBLISH_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum Error {
    #[error("proposal publication failed: {0}")]
    Publish(String),
}

/// Narrow seam to the marketplace. The actual API client lives outside the
/// runtime; registrations are authenticated by the provider signer there.
#[async_trait]
pub trait ProposalRegistry: Send + Sync {
    async fn register_proposal(&self, proposal: &ServiceProposal) -> Result<(), Error>;
}

pub type DiscoveryFactory = Arc<dyn Fn() -> Discovery + Send + Sync>;

/// Keeps one proposal visible on the marketplace by republishing it on an
/// interval. The entry expires on its own once the loop stops.
pub struct Discovery {
    registry: Arc<dyn ProposalRegistry>,
    interval: Duration,
    cancel: CancellationToken,
    done_rx: watch::Receiver<bool>,
    done_tx: Arc<watch::Sender<bool>>,
}

impl Discovery {
    pub fn new(registry: Arc<dyn ProposalRegistry>, interval: Duration) -> Self {
        let (done_tx, done_rx) = watch::channel(false);
        Discovery {
            registry,
            interval,
            cancel: CancellationToken::new(),
            done_rx,
            done_tx: Arc::new(done_tx),
        }
    }

    /// Spawns the republish loop. Failures are logged and retried on the next
    /// tick, never terminating the loop.
    pub fn start(&self, provider_id: Identity, proposal: ServiceProposal) {
        let registry = self.registry.clone();
        let interval = self.interval;
        let cancel = self.cancel.clone();
        let done = self.done_tx.clone();

        tokio::spawn(async move {
            loop {
                match registry.register_proposal(&proposal).await {
                    Ok(()) => {
                        tracing::debug!(
                            provider = %provider_id,
                            service_type = %proposal.service_type,
                            "proposal published"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            provider = %provider_id,
                            service_type = %proposal.service_type,
                            "proposal publication failed, retrying on next tick"
                        );
                    }
                }

                tokio::select! {
                    _ = time::sleep(interval) => {}
                    _ = cancel.cancelled() => break,
                }
            }
            let _ = done.send(true);
        });
    }

    /// Cancels the republish loop. `wait` observes its termination.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Blocks until the republish loop has exited.
    pub async fn wait(&self) {
        let mut done = self.done_rx.clone();
        let _ = done.wait_for(|finished| *finished).await;
    }
}
