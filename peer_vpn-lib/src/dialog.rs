use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::identity::{Identity, Signature, Signer};
use crate::market::{ContactDescriptor, ServiceProposal};
use crate::service::Service;
use crate::session::{Session, SessionId};

pub const CONTACT_TYPE: &str = "tcp-json/v1";

/// A dialog that stays silent longer than this is considered dead and its
/// session is garbage collected.
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, Error)]
pub enum Error {
    #[error("dialog setup failed: {0}")]
    Setup(String),
    #[error("dialog waiter was not started")]
    NotStarted,
    #[error("malformed dialog message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("session negotiation failed: {0}")]
    Negotiation(String),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
}

/// First message of a dialog: who is asking, and the backend-specific
/// consumer configuration (e.g. a WireGuard public key).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequest {
    pub consumer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

/// Signed session configuration returned to the consumer.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReply {
    pub session_id: SessionId,
    pub config: serde_json::Value,
    pub signature: Signature,
}

/// Negotiates one session. The returned session carries the destroy callback
/// the caller fires when the dialog ends.
#[async_trait]
pub trait DialogHandler: Send + Sync {
    async fn handle(&self, request: SessionRequest) -> Result<(SessionReply, Session), Error>;
}

#[async_trait]
pub trait DialogWaiter: Send + Sync {
    /// Starts listening; the returned descriptor goes into the proposal.
    async fn start(&self) -> Result<ContactDescriptor, Error>;
    /// Registers the handler and spawns the accept loop.
    async fn serve_dialogs(&self, handler: Arc<dyn DialogHandler>) -> Result<(), Error>;
    /// Stops accepting, tears down open dialogs, waits for them to finish.
    async fn stop(&self);
}

pub type DialogWaiterFactory =
    Arc<dyn Fn(&Identity, &str) -> Result<Arc<dyn DialogWaiter>, Error> + Send + Sync>;

pub type DialogHandlerFactory =
    Arc<dyn Fn(ServiceProposal, Arc<dyn Service>, &str) -> Arc<dyn DialogHandler> + Send + Sync>;

/// Default handler: asks the backend for a session config, signs it with the
/// provider identity and wraps it in a fresh session.
pub struct SessionDialogHandler {
    proposal: ServiceProposal,
    negotiator: Arc<dyn Service>,
    instance_id: String,
    signer: Arc<dyn Signer>,
}

impl SessionDialogHandler {
    pub fn new(
        proposal: ServiceProposal,
        negotiator: Arc<dyn Service>,
        instance_id: impl Into<String>,
        signer: Arc<dyn Signer>,
    ) -> Self {
        SessionDialogHandler {
            proposal,
            negotiator,
            instance_id: instance_id.into(),
            signer,
        }
    }
}

#[async_trait]
impl DialogHandler for SessionDialogHandler {
    async fn handle(&self, request: SessionRequest) -> Result<(SessionReply, Session), Error> {
        let (configuration, destroy) = self
            .negotiator
            .provide_config(request.config.as_ref())
            .map_err(|e| Error::Negotiation(e.to_string()))?;

        let configuration = configuration.unwrap_or(serde_json::Value::Null);
        let payload = serde_json::to_vec(&configuration)?;
        let signature = self
            .signer
            .sign(&payload)
            .map_err(|e| Error::Negotiation(e.to_string()))?;

        let session = Session::new(request.consumer_id.clone(), configuration.clone(), destroy);
        tracing::info!(
            instance = %self.instance_id,
            service_type = %self.proposal.service_type,
            session = %session.id,
            consumer = %request.consumer_id,
            "session negotiated"
        );

        let reply = SessionReply {
            session_id: session.id.clone(),
            config: configuration,
            signature,
        };
        Ok((reply, session))
    }
}

/// Accepts dialogs over TCP, one line-delimited JSON message per request.
/// Consumers keep the connection open and ping periodically; silence beyond
/// the keepalive window destroys the session.
pub struct TcpDialogWaiter {
    advertised_ip: IpAddr,
    listener: Mutex<Option<TcpListener>>,
    contact: Mutex<Option<ContactDescriptor>>,
    cancel: CancellationToken,
    dialogs: TaskTracker,
    keepalive: Duration,
}

impl TcpDialogWaiter {
    pub fn new(advertised_ip: IpAddr) -> Self {
        TcpDialogWaiter {
            advertised_ip,
            listener: Mutex::new(None),
            contact: Mutex::new(None),
            cancel: CancellationToken::new(),
            dialogs: TaskTracker::new(),
            keepalive: KEEPALIVE_TIMEOUT,
        }
    }

    #[cfg(test)]
    fn with_keepalive(advertised_ip: IpAddr, keepalive: Duration) -> Self {
        let mut waiter = Self::new(advertised_ip);
        waiter.keepalive = keepalive;
        waiter
    }

    pub fn contact(&self) -> Option<ContactDescriptor> {
        self.contact.lock().expect("contact lock").clone()
    }

    async fn run_dialog(
        stream: TcpStream,
        handler: Arc<dyn DialogHandler>,
        cancel: CancellationToken,
        keepalive: Duration,
    ) {
        let peer = stream.peer_addr().ok();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let request = tokio::select! {
            line = time::timeout(keepalive, lines.next_line()) => match line {
                Ok(Ok(Some(line))) => line,
                _ => return,
            },
            _ = cancel.cancelled() => return,
        };

        let request: SessionRequest = match serde_json::from_str(&request) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, ?peer, "rejecting malformed session request");
                return;
            }
        };

        let (reply, mut session) = match handler.handle(request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(error = %e, ?peer, "session negotiation failed");
                return;
            }
        };

        let mut reply_line = match serde_json::to_string(&reply) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode session reply");
                return;
            }
        };
        reply_line.push('\n');
        if let Err(e) = write_half.write_all(reply_line.as_bytes()).await {
            tracing::warn!(error = %e, ?peer, "failed to send session reply");
            return;
        }

        // keepalive loop: any inbound line counts as a ping
        loop {
            tokio::select! {
                line = time::timeout(keepalive, lines.next_line()) => match line {
                    Ok(Ok(Some(_ping))) => continue,
                    // EOF, read error or keepalive expiry all end the session
                    _ => break,
                },
                _ = cancel.cancelled() => break,
            }
        }

        tracing::info!(session = %session.id, ?peer, "dialog ended, destroying session");
        session.destroy();
    }
}

#[async_trait]
impl DialogWaiter for TcpDialogWaiter {
    async fn start(&self) -> Result<ContactDescriptor, Error> {
        let listener = TcpListener::bind(("0.0.0.0", 0))
            .await
            .map_err(|e| Error::Setup(format!("failed to bind dialog listener: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| Error::Setup(e.to_string()))?
            .port();

        let contact = ContactDescriptor {
            contact_type: CONTACT_TYPE.to_string(),
            address: format!("{}:{}", self.advertised_ip, port),
        };
        *self.listener.lock().expect("listener lock") = Some(listener);
        *self.contact.lock().expect("contact lock") = Some(contact.clone());
        tracing::info!(%contact, "dialog waiter listening");
        Ok(contact)
    }

    async fn serve_dialogs(&self, handler: Arc<dyn DialogHandler>) -> Result<(), Error> {
        let listener = self
            .listener
            .lock()
            .expect("listener lock")
            .take()
            .ok_or(Error::NotStarted)?;

        let cancel = self.cancel.clone();
        let dialogs = self.dialogs.clone();
        let keepalive = self.keepalive;
        self.dialogs.spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            dialogs.spawn(Self::run_dialog(
                                stream,
                                handler.clone(),
                                cancel.clone(),
                                keepalive,
                            ));
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to accept dialog");
                        }
                    },
                    _ = cancel.cancelled() => break,
                }
            }
        });
        Ok(())
    }

    async fn stop(&self) {
        self.cancel.cancel();
        self.dialogs.close();
        self.dialogs.wait().await;
    }
}
