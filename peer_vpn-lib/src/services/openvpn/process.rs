use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use std::path::PathBuf;
use std::sync::Arc;

use super::Error;
use super::service::ServerConfig;

/// Lifecycle of the external tunnel daemon.
#[async_trait]
pub trait TunnelProcess: Send + Sync {
    async fn start(&self) -> Result<(), Error>;
    /// Blocks until the daemon exits. `Ok` when it was stopped deliberately.
    async fn wait(&self) -> Result<(), Error>;
    async fn stop(&self);
}

pub type ServerFactory = Box<dyn Fn(&ServerConfig) -> Arc<dyn TunnelProcess> + Send + Sync>;

/// Drives a real `openvpn` child process.
pub struct OpenvpnProcess {
    binary: PathBuf,
    config: ServerConfig,
    child: Mutex<Option<Child>>,
    stop_signal: CancellationToken,
}

impl OpenvpnProcess {
    pub fn new(binary: impl Into<PathBuf>, config: ServerConfig) -> Self {
        OpenvpnProcess {
            binary: binary.into(),
            config,
            child: Mutex::new(None),
            stop_signal: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl TunnelProcess for OpenvpnProcess {
    async fn start(&self) -> Result<(), Error> {
        let child = Command::new(&self.binary)
            .arg("--proto")
            .arg(&self.config.protocol)
            .arg("--port")
            .arg(self.config.port.to_string())
            .arg("--server")
            .arg(&self.config.subnet)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Tunnel(format!("failed to spawn tunnel daemon: {e}")))?;
        *self.child.lock().await = Some(child);
        tracing::info!(port = self.config.port, protocol = %self.config.protocol, "tunnel daemon spawned");
        Ok(())
    }

    async fn wait(&self) -> Result<(), Error> {
        let Some(mut child) = self.child.lock().await.take() else {
            // a stop that raced ahead already reaped the child
            if self.stop_signal.is_cancelled() {
                return Ok(());
            }
            return Err(Error::Tunnel("tunnel daemon was not started".to_string()));
        };

        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|e| Error::Tunnel(e.to_string()))?;
                if status.success() {
                    Ok(())
                } else {
                    Err(Error::Tunnel(format!("tunnel daemon exited with {status}")))
                }
            }
            _ = self.stop_signal.cancelled() => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "failed to kill tunnel daemon");
                }
                Ok(())
            }
        }
    }

    async fn stop(&self) {
        self.stop_signal.cancel();
        // covers a stop before wait was ever entered
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "failed to kill tunnel daemon");
            }
        }
    }
}
