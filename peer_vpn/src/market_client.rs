use async_trait::async_trait;
use backoff::ExponentialBackoff;
use backoff::future::retry;
use url::Url;

use std::sync::Arc;
use std::time::Duration;

use peer_vpn_lib::discovery::{Error, ProposalRegistry};
use peer_vpn_lib::identity::Signer;
use peer_vpn_lib::market::ServiceProposal;

/// Thin marketplace client: one signed registration call. The discovery
/// loop owns scheduling and treats every error as transient.
pub struct HttpProposalRegistry {
    client: reqwest::Client,
    endpoint: Url,
    signer: Arc<dyn Signer>,
}

impl HttpProposalRegistry {
    pub fn new(endpoint: Url, signer: Arc<dyn Signer>) -> Self {
        HttpProposalRegistry {
            client: reqwest::Client::new(),
            endpoint,
            signer,
        }
    }

    fn backoff() -> ExponentialBackoff {
        ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(20)),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ProposalRegistry for HttpProposalRegistry {
    async fn register_proposal(&self, proposal: &ServiceProposal) -> Result<(), Error> {
        let url = self
            .endpoint
            .join("proposals")
            .map_err(|e| Error::Publish(e.to_string()))?;

        let payload = serde_json::to_vec(proposal).map_err(|e| Error::Publish(e.to_string()))?;
        let signature = self
            .signer
            .sign(&payload)
            .map_err(|e| Error::Publish(e.to_string()))?;

        retry(Self::backoff(), || async {
            let response = self
                .client
                .post(url.clone())
                .header("content-type", "application/json")
                .header("x-proposal-signature", &signature.0)
                .body(payload.clone())
                .send()
                .await
                .map_err(|e| backoff::Error::transient(Error::Publish(e.to_string())))?;

            if response.status().is_success() {
                Ok(())
            } else {
                Err(backoff::Error::transient(Error::Publish(format!(
                    "marketplace answered {}",
                    response.status()
                ))))
            }
        })
        .await
    }
}
