use clap::{Args, Parser, Subcommand};
use url::Url;

use peer_vpn_lib::service::Options;
use peer_vpn_lib::services::{noop, openvpn, wireguard};

/// Peer-to-peer VPN provider node
#[derive(Clone, Debug, Parser)]
#[command(name = "peer_vpn", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// Starts and publishes services on the marketplace
    Service(ServiceArgs),
    /// Prints the terms and conditions
    License,
}

#[derive(Clone, Debug, Args)]
pub struct ServiceArgs {
    /// Comma separated list of services to start
    #[arg(value_name = "SERVICES", default_value = "openvpn,wireguard,noop")]
    pub services: String,

    /// Agree with terms & conditions
    #[arg(long = "agreed-terms-and-conditions")]
    pub agreed_terms_and_conditions: bool,

    /// Keystore identity used to provide the service. Created automatically
    /// when not given
    #[arg(long = "identity", default_value = "")]
    pub identity: String,

    /// Used to unlock the keystore identity
    #[arg(long = "identity.passphrase", default_value = "")]
    pub identity_passphrase: String,

    /// Marketplace discovery endpoint
    #[arg(
        long = "discovery.address",
        env = "PEERVPN_DISCOVERY_ADDRESS",
        default_value = "https://discovery.peervpn.network/api/v1/"
    )]
    pub discovery_address: Url,

    /// Country advertised in service proposals
    #[arg(long = "location.country", default_value = "ZZ")]
    pub location_country: String,

    /// Public IP consumers reach this node on. Defaults to the outbound IP,
    /// meaning the node is not behind NAT
    #[arg(long = "location.public-ip")]
    pub location_public_ip: Option<std::net::IpAddr>,

    /// Openvpn tunnel protocol
    #[arg(long = "openvpn.protocol", default_value = "udp")]
    pub openvpn_protocol: String,

    /// Openvpn tunnel port
    #[arg(long = "openvpn.port", default_value_t = 1194)]
    pub openvpn_port: u16,

    /// Smallest UDP port handed to wireguard sessions
    #[arg(long = "wireguard.listen.port.min", default_value_t = 52820)]
    pub wireguard_port_min: u16,

    /// Largest UDP port handed to wireguard sessions
    #[arg(long = "wireguard.listen.port.max", default_value_t = 53075)]
    pub wireguard_port_max: u16,

    /// Parent subnet wireguard session subnets are carved from
    #[arg(long = "wireguard.allowed.ip.subnet", default_value = "10.182.0.0/16")]
    pub wireguard_subnet: cidr::Ipv4Cidr,

    /// Milliseconds consumers wait before connecting through NAT
    #[arg(long = "wireguard.connect.delay", default_value_t = 2000)]
    pub wireguard_connect_delay: u32,
}

impl ServiceArgs {
    pub fn service_types(&self) -> Vec<String> {
        self.services
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Start options for one service type, filled from the flags that
    /// backend registered.
    pub fn options_for(&self, service_type: &str) -> Option<Options> {
        match service_type {
            noop::SERVICE_TYPE => Some(Options::None),
            openvpn::SERVICE_TYPE => Some(Options::Openvpn(openvpn::Options {
                protocol: self.openvpn_protocol.clone(),
                port: self.openvpn_port,
            })),
            wireguard::SERVICE_TYPE => Some(Options::Wireguard(wireguard::Options {
                connect_delay: self.wireguard_connect_delay,
                port_min: self.wireguard_port_min,
                port_max: self.wireguard_port_max,
                subnet: self.wireguard_subnet,
            })),
            _ => None,
        }
    }
}

pub fn parse() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service_args(extra: &[&str]) -> ServiceArgs {
        let mut argv = vec!["peer_vpn", "service"];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).expect("arguments parse").command {
            Command::Service(args) => args,
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn defaults_start_all_built_in_services() {
        let args = service_args(&[]);
        assert!(!args.agreed_terms_and_conditions);
        assert_eq!(args.service_types(), vec!["openvpn", "wireguard", "noop"]);
    }

    #[test]
    fn positional_argument_narrows_the_service_list() {
        let args = service_args(&["wireguard,noop", "--agreed-terms-and-conditions"]);
        assert!(args.agreed_terms_and_conditions);
        assert_eq!(args.service_types(), vec!["wireguard", "noop"]);
    }

    #[test]
    fn backend_flags_flow_into_options() {
        let args = service_args(&[
            "wireguard",
            "--wireguard.listen.port.min",
            "123",
            "--wireguard.listen.port.max",
            "1234",
            "--wireguard.allowed.ip.subnet",
            "10.10.0.0/16",
            "--wireguard.connect.delay",
            "3000",
        ]);

        let Some(Options::Wireguard(options)) = args.options_for("wireguard") else {
            panic!("expected wireguard options");
        };
        assert_eq!(options.connect_delay, 3000);
        assert_eq!(options.port_min, 123);
        assert_eq!(options.port_max, 1234);
        assert_eq!(options.subnet, "10.10.0.0/16".parse().unwrap());
    }

    #[test]
    fn openvpn_flags_flow_into_options() {
        let args = service_args(&["openvpn", "--openvpn.protocol", "tcp", "--openvpn.port", "8443"]);
        let Some(Options::Openvpn(options)) = args.options_for("openvpn") else {
            panic!("expected openvpn options");
        };
        assert_eq!(options.protocol, "tcp");
        assert_eq!(options.port, 8443);
    }

    #[test]
    fn unknown_service_type_has_no_options() {
        let args = service_args(&[]);
        assert!(args.options_for("bogus").is_none());
    }
}
