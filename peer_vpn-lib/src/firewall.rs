use thiserror::Error;

use std::collections::HashSet;
use std::process::Command;
use std::sync::Mutex;

#[derive(Debug, Error)]
pub enum Error {
    #[error("firewall rule for {protocol}/{port} failed: {reason}")]
    RuleFailed {
        protocol: String,
        port: u16,
        reason: String,
    },
    #[error("inbound rule for {0}/{1} is not installed")]
    NotInstalled(String, u16),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
}

/// Kernel-facing half of the firewall. Production shells out to iptables,
/// tests record calls.
pub trait FirewallOps: Send + Sync {
    fn allow_inbound(&self, protocol: &str, port: u16) -> Result<(), Error>;
    fn revoke_inbound(&self, protocol: &str, port: u16) -> Result<(), Error>;
}

pub struct IptablesFirewallOps;

impl IptablesFirewallOps {
    fn run(&self, action: &str, protocol: &str, port: u16) -> Result<(), Error> {
        let output = Command::new("iptables")
            .args([
                action,
                "INPUT",
                "-p",
                protocol,
                "--dport",
                &port.to_string(),
                "-j",
                "ACCEPT",
            ])
            .output()?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::RuleFailed {
                protocol: protocol.to_string(),
                port,
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

impl FirewallOps for IptablesFirewallOps {
    fn allow_inbound(&self, protocol: &str, port: u16) -> Result<(), Error> {
        self.run("-I", protocol, port)
    }

    fn revoke_inbound(&self, protocol: &str, port: u16) -> Result<(), Error> {
        self.run("-D", protocol, port)
    }
}

/// Tracks installed inbound rules so they stay mirrored 1:1 with listening
/// ports and can all be reverted on teardown.
pub struct Firewall {
    ops: Box<dyn FirewallOps>,
    tracked: Mutex<HashSet<(String, u16)>>,
}

impl Firewall {
    pub fn new(ops: Box<dyn FirewallOps>) -> Self {
        Firewall {
            ops,
            tracked: Mutex::new(HashSet::new()),
        }
    }

    pub fn add_inbound_rule(&self, protocol: &str, port: u16) -> Result<(), Error> {
        let mut tracked = self.tracked.lock().expect("firewall lock");
        let key = (protocol.to_string(), port);
        if tracked.contains(&key) {
            return Ok(());
        }
        self.ops.allow_inbound(protocol, port)?;
        tracked.insert(key);
        tracing::info!(protocol, port, "firewall inbound rule installed");
        Ok(())
    }

    pub fn remove_inbound_rule(&self, protocol: &str, port: u16) -> Result<(), Error> {
        let mut tracked = self.tracked.lock().expect("firewall lock");
        if !tracked.remove(&(protocol.to_string(), port)) {
            return Err(Error::NotInstalled(protocol.to_string(), port));
        }
        self.ops.revoke_inbound(protocol, port)?;
        tracing::info!(protocol, port, "firewall inbound rule removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Default)]
    struct RecordingOps {
        active: Mutex<Vec<(String, u16)>>,
    }

    impl FirewallOps for Arc<RecordingOps> {
        fn allow_inbound(&self, protocol: &str, port: u16) -> Result<(), Error> {
            self.active
                .lock()
                .unwrap()
                .push((protocol.to_string(), port));
            Ok(())
        }

        fn revoke_inbound(&self, protocol: &str, port: u16) -> Result<(), Error> {
            let mut active = self.active.lock().unwrap();
            let position = active
                .iter()
                .position(|entry| entry == &(protocol.to_string(), port))
                .ok_or(Error::NotInstalled(protocol.to_string(), port))?;
            active.remove(position);
            Ok(())
        }
    }

    #[test]
    fn rules_mirror_listening_ports() -> anyhow::Result<()> {
        let ops = Arc::new(RecordingOps::default());
        let firewall = Firewall::new(Box::new(ops.clone()));

        firewall.add_inbound_rule("udp", 1194)?;
        firewall.add_inbound_rule("udp", 1194)?;
        assert_eq!(ops.active.lock().unwrap().len(), 1);

        firewall.remove_inbound_rule("udp", 1194)?;
        assert!(ops.active.lock().unwrap().is_empty());
        Ok(())
    }

    #[test]
    fn removing_an_unknown_rule_is_an_error() {
        let ops = Arc::new(RecordingOps::default());
        let firewall = Firewall::new(Box::new(ops));
        assert!(matches!(
            firewall.remove_inbound_rule("tcp", 443),
            Err(Error::NotInstalled(_, 443))
        ));
    }
}
