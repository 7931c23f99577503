use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::process::Command;
use std::sync::Mutex;

pub mod events_sender;
pub mod traversal;

#[derive(Debug, Error)]
pub enum Error {
    #[error("NAT rule {rule} failed: {reason}")]
    RuleFailed { rule: RuleForwarding, reason: String },
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
}

/// Source-NAT forwarding rule. Keyed by exact pair equality for ref-counting.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleForwarding {
    pub source_address: String,
    #[serde(rename = "targetIP")]
    pub target_ip: String,
}

impl Display for RuleForwarding {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} -> {}", self.source_address, self.target_ip)
    }
}

/// Kernel-facing half of the rule service. Production shells out to
/// iptables, tests record calls.
pub trait NatOps: Send + Sync {
    fn apply(&self, rule: &RuleForwarding) -> Result<(), Error>;
    fn revert(&self, rule: &RuleForwarding) -> Result<(), Error>;
}

pub struct IptablesNatOps;

impl IptablesNatOps {
    fn run(&self, action: &str, rule: &RuleForwarding) -> Result<(), Error> {
        let output = Command::new("iptables")
            .args([
                "-t",
                "nat",
                action,
                "POSTROUTING",
                "-s",
                &rule.source_address,
                "!",
                "-d",
                &rule.source_address,
                "-j",
                "SNAT",
                "--to-source",
                &rule.target_ip,
            ])
            .output()?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::RuleFailed {
                rule: rule.clone(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

impl NatOps for IptablesNatOps {
    fn apply(&self, rule: &RuleForwarding) -> Result<(), Error> {
        self.run("-A", rule)
    }

    fn revert(&self, rule: &RuleForwarding) -> Result<(), Error> {
        self.run("-D", rule)
    }
}

/// Port-mapping protocol seam (NAT-PMP / UPnP). Asks the NAT device to map
/// a public port and returns the release handle.
pub trait PortMapper: Send + Sync {
    fn map_port(&self, port: u16) -> Box<dyn FnOnce() + Send>;
}

/// For nodes that are not behind a NAT device, or whose NAT does not speak a
/// mapping protocol. The hole-punch pinger covers the rest.
pub struct NoopPortMapper;

impl PortMapper for NoopPortMapper {
    fn map_port(&self, port: u16) -> Box<dyn FnOnce() + Send> {
        tracing::debug!(port, "port mapping skipped");
        Box::new(|| {})
    }
}

/// Ref-counted forwarding rule service. Kernel calls are serialized behind
/// the table lock; a rule leaves the kernel when its last reference does.
pub struct NatService {
    ops: Box<dyn NatOps>,
    refs: Mutex<HashMap<RuleForwarding, usize>>,
}

impl NatService {
    pub fn new(ops: Box<dyn NatOps>) -> Self {
        NatService {
            ops,
            refs: Mutex::new(HashMap::new()),
        }
    }

    pub fn add(&self, rule: RuleForwarding) -> Result<(), Error> {
        let mut refs = self.refs.lock().expect("nat refs lock");
        let count = refs.entry(rule.clone()).or_insert(0);
        if *count == 0 {
            self.ops.apply(&rule)?;
            tracing::info!(%rule, "NAT forwarding rule installed");
        }
        *count += 1;
        Ok(())
    }

    /// Drops one reference; a no-op once the last reference is gone.
    pub fn del(&self, rule: &RuleForwarding) -> Result<(), Error> {
        let mut refs = self.refs.lock().expect("nat refs lock");
        let Some(count) = refs.get_mut(rule) else {
            return Ok(());
        };
        *count -= 1;
        if *count == 0 {
            refs.remove(rule);
            self.ops.revert(rule)?;
            tracing::info!(%rule, "NAT forwarding rule removed");
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Arc;

    #[derive(Default)]
    pub struct RecordingNatOps {
        pub applied: Mutex<Vec<RuleForwarding>>,
    }

    impl NatOps for Arc<RecordingNatOps> {
        fn apply(&self, rule: &RuleForwarding) -> Result<(), Error> {
            self.applied.lock().unwrap().push(rule.clone());
            Ok(())
        }

        fn revert(&self, rule: &RuleForwarding) -> Result<(), Error> {
            let mut applied = self.applied.lock().unwrap();
            let position = applied.iter().position(|r| r == rule).ok_or_else(|| {
                Error::RuleFailed {
                    rule: rule.clone(),
                    reason: "not installed".to_string(),
                }
            })?;
            applied.remove(position);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingNatOps;
    use super::*;
    use std::sync::Arc;

    fn rule() -> RuleForwarding {
        RuleForwarding {
            source_address: "10.182.0.0/30".to_string(),
            target_ip: "192.0.2.10".to_string(),
        }
    }

    #[test]
    fn rule_serializes_with_wire_field_names() -> anyhow::Result<()> {
        let json = serde_json::to_value(rule())?;
        assert_eq!(
            json,
            serde_json::json!({"sourceAddress": "10.182.0.0/30", "targetIP": "192.0.2.10"})
        );
        Ok(())
    }

    #[test]
    fn identical_rules_share_one_kernel_entry() -> anyhow::Result<()> {
        let ops = Arc::new(RecordingNatOps::default());
        let service = NatService::new(Box::new(ops.clone()));

        service.add(rule())?;
        service.add(rule())?;
        assert_eq!(ops.applied.lock().unwrap().len(), 1);

        service.del(&rule())?;
        assert_eq!(ops.applied.lock().unwrap().len(), 1);
        service.del(&rule())?;
        assert!(ops.applied.lock().unwrap().is_empty());
        Ok(())
    }

    #[test]
    fn del_after_last_reference_is_a_noop() -> anyhow::Result<()> {
        let ops = Arc::new(RecordingNatOps::default());
        let service = NatService::new(Box::new(ops));
        service.add(rule())?;
        service.del(&rule())?;
        service.del(&rule())?;
        Ok(())
    }
}
