use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::nat::traversal::{Event, EventKind};

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to resolve public IP: {0}")]
    IpResolution(String),
    #[error("failed to deliver NAT event: {0}")]
    Delivery(String),
}

/// Metrics endpoint seam. The reporting backend lives outside the runtime.
pub trait MetricsSender: Send + Sync {
    fn send_nat_mapping_success(&self) -> Result<(), Error>;
    fn send_nat_mapping_failure(&self, error: &str) -> Result<(), Error>;
}

pub trait PublicIpResolver: Send + Sync {
    fn public_ip(&self) -> Result<String, Error>;
}

/// Forwards NAT traversal events to the metrics endpoint, suppressing
/// duplicates. An event goes out only when the event kind or the resolved
/// public IP changed since the last send.
pub struct EventsSender<M, R> {
    metrics: M,
    resolver: R,
    last_ip: String,
    last_kind: Option<EventKind>,
}

impl<M: MetricsSender + 'static, R: PublicIpResolver + 'static> EventsSender<M, R> {
    pub fn new(metrics: M, resolver: R) -> Self {
        EventsSender {
            metrics,
            resolver,
            last_ip: String::new(),
            last_kind: None,
        }
    }

    /// Drains the event stream until the pinger goes away. Errors are logged
    /// and dropped; the loop itself never dies.
    pub fn run(mut self, mut events: broadcast::Receiver<Event>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => self.consume(event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "NAT event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn consume(&mut self, event: Event) {
        let public_ip = match self.resolver.public_ip() {
            Ok(ip) => ip,
            Err(e) => {
                tracing::warn!(error = %e, "resolving public IP failed");
                return;
            }
        };

        if public_ip == self.last_ip && Some(event.kind) == self.last_kind {
            return;
        }

        let sent = match event.kind {
            EventKind::Success => self.metrics.send_nat_mapping_success(),
            EventKind::Failure => self
                .metrics
                .send_nat_mapping_failure(event.error.as_deref().unwrap_or("unknown")),
        };
        if let Err(e) = sent {
            tracing::warn!(error = %e, "sending NAT event failed");
        }

        self.last_ip = public_ip;
        self.last_kind = Some(event.kind);
    }
}
