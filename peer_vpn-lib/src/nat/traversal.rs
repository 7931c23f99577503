use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, watch};
use tokio::time;

use std::fmt::{self, Display};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Error)]
pub enum Error {
    #[error("hole punch timed out after {0:?}")]
    HolePunchTimeout(Duration),
    #[error("no port bound before waiting for a hole")]
    PortNotBound,
    #[error("failed to listen on hole-punch port {0}: {1}")]
    Bind(u16, #[source] std::io::Error),
}

/// What an external detector learned about the local NAT situation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NatStatus {
    Unknown,
    BehindNat,
    Open,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Success,
    Failure,
}

/// Outcome of one hole-punch attempt, broadcast to subscribers.
#[derive(Clone, Debug)]
pub struct Event {
    pub kind: EventKind,
    pub error: Option<String>,
}

impl Event {
    fn success() -> Self {
        Event {
            kind: EventKind::Success,
            error: None,
        }
    }

    fn failure(error: impl Display) -> Self {
        Event {
            kind: EventKind::Failure,
            error: Some(error.to_string()),
        }
    }
}

pub const DEFAULT_HOLE_PUNCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Waits for the NAT to open towards the next consumer.
///
/// A backend registers the port it expects traffic on, then blocks in
/// [`Pinger::wait_for_hole`] until an inbound probe arrives, the detector
/// reports an open NAT, or the timeout elapses.
pub struct Pinger {
    bound_port: Mutex<Option<u16>>,
    nat_status: watch::Receiver<NatStatus>,
    events: broadcast::Sender<Event>,
    timeout: Duration,
}

impl Pinger {
    pub fn new(nat_status: watch::Receiver<NatStatus>, timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(16);
        Pinger {
            bound_port: Mutex::new(None),
            nat_status,
            events,
            timeout,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Port the next incoming consumer is expected on.
    pub fn bind_port(&self, port: u16) {
        *self.bound_port.lock().expect("pinger port lock") = Some(port);
    }

    pub async fn wait_for_hole(&self) -> Result<(), Error> {
        let mut status = self.nat_status.clone();
        if *status.borrow() == NatStatus::Open {
            self.emit(Event::success());
            return Ok(());
        }

        let port = self
            .bound_port
            .lock()
            .expect("pinger port lock")
            .ok_or(Error::PortNotBound)?;
        let socket = UdpSocket::bind(("0.0.0.0", port))
            .await
            .map_err(|e| Error::Bind(port, e))?;
        let mut probe = [0u8; 64];

        let detector_open = async {
            // a dropped detector never resolves this arm
            if status.wait_for(|s| *s == NatStatus::Open).await.is_err() {
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            received = socket.recv_from(&mut probe) => {
                match received {
                    Ok((_, peer)) => {
                        tracing::info!(port, %peer, "inbound probe observed, hole is open");
                        self.emit(Event::success());
                        Ok(())
                    }
                    Err(e) => {
                        let err = Error::Bind(port, e);
                        self.emit(Event::failure(&err));
                        Err(err)
                    }
                }
            }
            _ = detector_open => {
                tracing::info!(port, "detector reports open NAT, skipping hole punch");
                self.emit(Event::success());
                Ok(())
            }
            _ = time::sleep(self.timeout) => {
                let err = Error::HolePunchTimeout(self.timeout);
                self.emit(Event::failure(&err));
                Err(err)
            }
        }
    }

    fn emit(&self, event: Event) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }
}

impl Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EventKind::Success => write!(f, "success"),
            EventKind::Failure => write!(f, "failure"),
        }
    }
}
