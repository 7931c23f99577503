use cidr::Ipv4Cidr;

use std::io::Write;
use std::net::Ipv4Addr;
use std::process::{Command, Stdio};
use std::sync::Arc;

use super::key::{self, KeyPair};
use super::{ConsumerAssignment, Endpoint, Error, ProviderConfig, ServiceConfig};
use crate::location::ServiceLocationInfo;
use crate::nat::PortMapper;
use crate::resources::Allocator;

/// Kernel-facing half of the tunnel device. Production shells out to
/// `ip`/`wg`, tests record calls.
pub trait WgClient: Send + Sync {
    fn configure_device(
        &self,
        iface: &str,
        private_key: &str,
        listen_port: u16,
        address: Ipv4Addr,
        prefix_len: u8,
    ) -> Result<(), Error>;
    fn add_peer(&self, iface: &str, public_key: &str, allowed_ip: &str) -> Result<(), Error>;
    fn remove_peer(&self, iface: &str, public_key: &str) -> Result<(), Error>;
    fn destroy_device(&self, iface: &str) -> Result<(), Error>;
}

pub struct CommandWgClient;

impl CommandWgClient {
    fn run(&self, program: &str, args: &[&str]) -> Result<(), Error> {
        let output = Command::new(program).args(args).output()?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::Device(format!(
                "{program} {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    fn set_private_key(&self, iface: &str, private_key: &str) -> Result<(), Error> {
        let mut child = Command::new("wg")
            .args(["set", iface, "private-key", "/dev/stdin"])
            .stdin(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(stdin) = child.stdin.as_mut() {
            stdin.write_all(private_key.as_bytes())?;
        }
        let output = child.wait_with_output()?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::Device(format!(
                "wg set private-key failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

impl WgClient for CommandWgClient {
    fn configure_device(
        &self,
        iface: &str,
        private_key: &str,
        listen_port: u16,
        address: Ipv4Addr,
        prefix_len: u8,
    ) -> Result<(), Error> {
        self.run("ip", &["link", "add", iface, "type", "wireguard"])?;
        self.set_private_key(iface, private_key)?;
        self.run("wg", &["set", iface, "listen-port", &listen_port.to_string()])?;
        self.run(
            "ip",
            &["addr", "add", &format!("{address}/{prefix_len}"), "dev", iface],
        )?;
        self.run("ip", &["link", "set", "up", "dev", iface])
    }

    fn add_peer(&self, iface: &str, public_key: &str, allowed_ip: &str) -> Result<(), Error> {
        self.run(
            "wg",
            &["set", iface, "peer", public_key, "allowed-ips", allowed_ip],
        )
    }

    fn remove_peer(&self, iface: &str, public_key: &str) -> Result<(), Error> {
        self.run("wg", &["set", iface, "peer", public_key, "remove"])
    }

    fn destroy_device(&self, iface: &str) -> Result<(), Error> {
        self.run("ip", &["link", "del", iface])
    }
}

/// First usable host of the session subnet; the provider side of the pair.
fn provider_ip(subnet: &Ipv4Cidr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(subnet.first_address()) + 1)
}

/// Second usable host; handed to the consumer.
fn consumer_ip(subnet: &Ipv4Cidr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(subnet.first_address()) + 2)
}

/// One per-session tunnel device with its allocated interface, port and
/// subnet. Everything acquired in `start` is returned in `stop`.
pub struct ConnectionEndpoint {
    allocator: Arc<Allocator>,
    wg: Arc<dyn WgClient>,
    port_mapper: Arc<dyn PortMapper>,
    location: ServiceLocationInfo,
    connect_delay: u32,

    iface: Option<String>,
    port: Option<u16>,
    subnet: Option<Ipv4Cidr>,
    key_pair: Option<KeyPair>,
    release_port_mapping: Option<Box<dyn FnOnce() + Send>>,
}

impl ConnectionEndpoint {
    pub fn new(
        allocator: Arc<Allocator>,
        wg: Arc<dyn WgClient>,
        port_mapper: Arc<dyn PortMapper>,
        location: ServiceLocationInfo,
        connect_delay: u32,
    ) -> Self {
        ConnectionEndpoint {
            allocator,
            wg,
            port_mapper,
            location,
            connect_delay,
            iface: None,
            port: None,
            subnet: None,
            key_pair: None,
            release_port_mapping: None,
        }
    }

    /// Destroys kernel interfaces left over by a crashed predecessor.
    fn clean_abandoned_interfaces(&self) -> Result<(), Error> {
        for iface in self.allocator.abandoned_interfaces()? {
            match self.wg.destroy_device(&iface) {
                Ok(()) => tracing::info!(iface, "abandoned interface destroyed"),
                Err(e) => tracing::warn!(iface, error = %e, "failed to destroy abandoned interface"),
            }
        }
        Ok(())
    }

    /// Allocates and configures the device. All-or-nothing: a failure rolls
    /// back every resource acquired so far.
    pub fn start(&mut self) -> Result<(), Error> {
        self.clean_abandoned_interfaces()?;

        let iface = self.allocator.allocate_interface()?;
        let port = match self.allocator.allocate_port() {
            Ok(port) => port,
            Err(e) => {
                let _ = self.allocator.release_interface(&iface);
                return Err(e.into());
            }
        };
        let subnet = match self.allocator.allocate_ip_net() {
            Ok(subnet) => subnet,
            Err(e) => {
                let _ = self.allocator.release_port(port);
                let _ = self.allocator.release_interface(&iface);
                return Err(e.into());
            }
        };

        let key_pair = key::generate_key_pair();
        let release_mapping = self.port_mapper.map_port(port);

        if let Err(e) = self.wg.configure_device(
            &iface,
            &key_pair.private,
            port,
            provider_ip(&subnet),
            subnet.network_length(),
        ) {
            release_mapping();
            let _ = self.allocator.release_ip_net(&subnet);
            let _ = self.allocator.release_port(port);
            let _ = self.allocator.release_interface(&iface);
            return Err(e);
        }

        self.iface = Some(iface);
        self.port = Some(port);
        self.subnet = Some(subnet);
        self.key_pair = Some(key_pair);
        self.release_port_mapping = Some(release_mapping);
        Ok(())
    }

    fn started(&self) -> Result<(&str, u16, &Ipv4Cidr, &KeyPair), Error> {
        match (&self.iface, self.port, &self.subnet, &self.key_pair) {
            (Some(iface), Some(port), Some(subnet), Some(key_pair)) => {
                Ok((iface.as_str(), port, subnet, key_pair))
            }
            _ => Err(Error::Device("connection endpoint not started".to_string())),
        }
    }

    pub fn add_peer(&self, public_key: &str) -> Result<(), Error> {
        let (iface, _, subnet, _) = self.started()?;
        let allowed_ip = format!("{}/32", consumer_ip(subnet));
        self.wg.add_peer(iface, public_key, &allowed_ip)
    }

    pub fn remove_peer(&self, public_key: &str) -> Result<(), Error> {
        let (iface, _, _, _) = self.started()?;
        self.wg.remove_peer(iface, public_key)
    }

    pub fn config(&self) -> Result<ServiceConfig, Error> {
        let (_, port, subnet, key_pair) = self.started()?;
        let connect_delay = self.location.behind_nat().then_some(self.connect_delay);

        Ok(ServiceConfig {
            provider: ProviderConfig {
                public_key: key_pair.public.clone(),
                endpoint: Endpoint {
                    ip: self.location.pub_ip,
                    port,
                },
            },
            consumer: ConsumerAssignment {
                ip_address: format!("{}/{}", consumer_ip(subnet), subnet.network_length()),
                private_key: None,
                connect_delay,
            },
        })
    }

    /// Destroys the device and returns every resource to the allocator.
    pub fn stop(&mut self) {
        if let Some(release) = self.release_port_mapping.take() {
            release();
        }
        if let Some(iface) = self.iface.take() {
            if let Err(e) = self.wg.destroy_device(&iface) {
                tracing::warn!(iface, error = %e, "failed to destroy tunnel device");
            }
            if let Err(e) = self.allocator.release_interface(&iface) {
                tracing::error!(iface, error = %e, "failed to release interface");
            }
        }
        if let Some(port) = self.port.take() {
            if let Err(e) = self.allocator.release_port(port) {
                tracing::error!(port, error = %e, "failed to release port");
            }
        }
        if let Some(subnet) = self.subnet.take() {
            if let Err(e) = self.allocator.release_ip_net(&subnet) {
                tracing::error!(%subnet, error = %e, "failed to release subnet");
            }
        }
        self.key_pair = None;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingWgClient {
        pub devices: Mutex<Vec<String>>,
        pub peers: Mutex<Vec<(String, String)>>,
        pub fail_configure: bool,
    }

    impl WgClient for Arc<RecordingWgClient> {
        fn configure_device(
            &self,
            iface: &str,
            _private_key: &str,
            _listen_port: u16,
            _address: Ipv4Addr,
            _prefix_len: u8,
        ) -> Result<(), Error> {
            if self.fail_configure {
                return Err(Error::Device("configure failed".to_string()));
            }
            self.devices.lock().unwrap().push(iface.to_string());
            Ok(())
        }

        fn add_peer(&self, iface: &str, public_key: &str, _allowed_ip: &str) -> Result<(), Error> {
            self.peers
                .lock()
                .unwrap()
                .push((iface.to_string(), public_key.to_string()));
            Ok(())
        }

        fn remove_peer(&self, iface: &str, public_key: &str) -> Result<(), Error> {
            let mut peers = self.peers.lock().unwrap();
            let position = peers
                .iter()
                .position(|entry| entry == &(iface.to_string(), public_key.to_string()))
                .ok_or_else(|| Error::Device("peer not found".to_string()))?;
            peers.remove(position);
            Ok(())
        }

        fn destroy_device(&self, iface: &str) -> Result<(), Error> {
            self.devices.lock().unwrap().retain(|d| d != iface);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingWgClient;
    use super::*;
    use crate::nat::NoopPortMapper;
    use crate::resources::testing::FixedInterfaces;

    fn location(behind_nat: bool) -> ServiceLocationInfo {
        ServiceLocationInfo {
            out_ip: "10.0.0.5".parse().unwrap(),
            pub_ip: if behind_nat {
                "203.0.113.4".parse().unwrap()
            } else {
                "10.0.0.5".parse().unwrap()
            },
            country: "LT".to_string(),
        }
    }

    fn make_endpoint(wg: Arc<RecordingWgClient>, behind_nat: bool) -> ConnectionEndpoint {
        let allocator = Arc::new(Allocator::new(
            Arc::new(FixedInterfaces(vec![])),
            52820,
            52821,
            "10.182.0.0/24".parse().unwrap(),
        ));
        ConnectionEndpoint::new(
            allocator,
            Arc::new(wg),
            Arc::new(NoopPortMapper),
            location(behind_nat),
            2000,
        )
    }

    #[test]
    fn host_addresses_bracket_the_subnet() {
        let subnet: Ipv4Cidr = "10.182.0.4/30".parse().unwrap();
        assert_eq!(provider_ip(&subnet), "10.182.0.5".parse::<Ipv4Addr>().unwrap());
        assert_eq!(consumer_ip(&subnet), "10.182.0.6".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn config_carries_connect_delay_only_behind_nat() -> anyhow::Result<()> {
        let wg = Arc::new(RecordingWgClient::default());
        let mut endpoint = make_endpoint(wg.clone(), true);
        endpoint.start()?;
        let config = endpoint.config()?;
        assert_eq!(config.consumer.connect_delay, Some(2000));
        assert_eq!(config.provider.endpoint.port, 52820);
        assert_eq!(config.consumer.ip_address, "10.182.0.2/30");
        endpoint.stop();

        let wg = Arc::new(RecordingWgClient::default());
        let mut endpoint = make_endpoint(wg, false);
        endpoint.start()?;
        assert_eq!(endpoint.config()?.consumer.connect_delay, None);
        endpoint.stop();
        Ok(())
    }

    #[test]
    fn failed_configure_rolls_back_all_resources() -> anyhow::Result<()> {
        let wg = Arc::new(RecordingWgClient {
            fail_configure: true,
            ..Default::default()
        });
        let mut endpoint = make_endpoint(wg, true);
        assert!(endpoint.start().is_err());

        // everything went back: the next start from the same allocator gets
        // the first port and subnet again
        endpoint.wg = Arc::new(Arc::new(RecordingWgClient::default()));
        endpoint.start()?;
        assert_eq!(endpoint.config()?.provider.endpoint.port, 52820);
        assert_eq!(endpoint.config()?.consumer.ip_address, "10.182.0.2/30");
        endpoint.stop();
        Ok(())
    }

    #[test]
    fn stop_returns_resources_and_destroys_the_device() -> anyhow::Result<()> {
        let wg = Arc::new(RecordingWgClient::default());
        let mut endpoint = make_endpoint(wg.clone(), true);
        endpoint.start()?;
        assert_eq!(wg.devices.lock().unwrap().len(), 1);

        endpoint.stop();
        assert!(wg.devices.lock().unwrap().is_empty());
        Ok(())
    }
}
