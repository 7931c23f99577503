use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use peer_vpn_lib::dialog::{
    DialogHandler, DialogWaiter, SessionDialogHandler, TcpDialogWaiter,
};
use peer_vpn_lib::discovery::{DEFAULT_REPUBLISH_INTERVAL, Discovery};
use peer_vpn_lib::firewall::{Firewall, IptablesFirewallOps};
use peer_vpn_lib::identity::{self, Identity, Keystore};
use peer_vpn_lib::location::{self, ServiceLocationInfo};
use peer_vpn_lib::market::ServiceProposal;
use peer_vpn_lib::nat::events_sender::{self, EventsSender, MetricsSender, PublicIpResolver};
use peer_vpn_lib::nat::traversal::{DEFAULT_HOLE_PUNCH_TIMEOUT, NatStatus, Pinger};
use peer_vpn_lib::nat::{IptablesNatOps, NatService, NoopPortMapper, PortMapper};
use peer_vpn_lib::resources::{Allocator, SysfsInterfaceQuery};
use peer_vpn_lib::service::{Instance, Manager, Options, Publisher, Registry, Service};
use peer_vpn_lib::services::openvpn::process::{OpenvpnProcess, TunnelProcess};
use peer_vpn_lib::services::{noop, openvpn, wireguard};

mod cli;
mod market_client;

use cli::{Cli, Command, ServiceArgs};
use market_client::HttpProposalRegistry;

/// Announces pool events to the log stream. A metrics backend can subscribe
/// here instead once one is wired up.
struct LogPublisher;

impl Publisher for LogPublisher {
    fn publish(&self, topic: &'static str, instance: Arc<Instance>) {
        tracing::info!(topic, instance = %instance.id(), "event published");
    }
}

struct LogMetricsSender;

impl MetricsSender for LogMetricsSender {
    fn send_nat_mapping_success(&self) -> Result<(), events_sender::Error> {
        tracing::info!("NAT mapping succeeded");
        Ok(())
    }

    fn send_nat_mapping_failure(&self, error: &str) -> Result<(), events_sender::Error> {
        tracing::info!(error, "NAT mapping failed");
        Ok(())
    }
}

struct ConfiguredIpResolver(ServiceLocationInfo);

impl PublicIpResolver for ConfiguredIpResolver {
    fn public_ip(&self) -> Result<String, events_sender::Error> {
        Ok(self.0.pub_ip.to_string())
    }
}

fn print_term_warning() {
    println!("peer_vpn provider node");
    println!("To read the terms and conditions, run the program with the 'license' subcommand.");
    println!();
    println!(
        "If you agree with these Terms & Conditions, run the program again with the '--agreed-terms-and-conditions' flag"
    );
}

fn print_license() {
    println!("peer_vpn is distributed under the terms of the GNU General Public License v3.");
    println!("There is NO WARRANTY, to the extent permitted by law.");
}

fn keystore_directory() -> PathBuf {
    if let Ok(dir) = std::env::var("PEERVPN_KEYSTORE_DIR") {
        return PathBuf::from(dir);
    }
    directories::ProjectDirs::from("network", "peervpn", "peer_vpn")
        .map(|dirs| dirs.data_local_dir().join("keystore"))
        .unwrap_or_else(|| PathBuf::from(".peer_vpn/keystore"))
}

fn detect_location(args: &ServiceArgs) -> Result<ServiceLocationInfo, location::Error> {
    let out_ip = location::detect_outbound_ip()?;
    let pub_ip = args.location_public_ip.unwrap_or(out_ip);
    Ok(ServiceLocationInfo {
        out_ip,
        pub_ip,
        country: args.location_country.clone(),
    })
}

fn build_registry(
    args: &ServiceArgs,
    location: &ServiceLocationInfo,
    nat: &Arc<NatService>,
    firewall: &Arc<Firewall>,
    pinger: &Arc<Pinger>,
    port_mapper: &Arc<dyn PortMapper>,
) -> Registry {
    let mut registry = Registry::new();

    {
        let country = args.location_country.clone();
        registry.register(
            noop::SERVICE_TYPE,
            Box::new(move |_options| {
                Ok((
                    Arc::new(noop::Manager::new()) as Arc<dyn Service>,
                    noop::proposal(country.clone()),
                ))
            }),
        );
    }

    {
        let nat = nat.clone();
        let firewall = firewall.clone();
        let pinger = pinger.clone();
        let port_mapper = port_mapper.clone();
        let location = location.clone();
        registry.register(
            openvpn::SERVICE_TYPE,
            Box::new(move |options| {
                let options = match options {
                    Options::Openvpn(options) => options.clone(),
                    _ => openvpn::Options::default(),
                };
                let proposal = openvpn::proposal(
                    peer_vpn_lib::market::Location::from_country(&location.country),
                    &options.protocol,
                );
                let service = openvpn::Manager::new(
                    nat.clone(),
                    firewall.clone(),
                    pinger.clone(),
                    port_mapper.clone(),
                    Box::new(|config| {
                        Arc::new(OpenvpnProcess::new("openvpn", config.clone()))
                            as Arc<dyn TunnelProcess>
                    }),
                    location.clone(),
                    options,
                );
                Ok((Arc::new(service) as Arc<dyn Service>, proposal))
            }),
        );
    }

    {
        let nat = nat.clone();
        let port_mapper = port_mapper.clone();
        let location = location.clone();
        registry.register(
            wireguard::SERVICE_TYPE,
            Box::new(move |options| {
                let options = match options {
                    Options::Wireguard(options) => options.clone(),
                    _ => wireguard::Options::default(),
                };
                let allocator = Arc::new(Allocator::new(
                    Arc::new(SysfsInterfaceQuery),
                    options.port_min,
                    options.port_max,
                    options.subnet,
                ));
                let service = wireguard::Manager::new(
                    allocator,
                    Arc::new(wireguard::endpoint::CommandWgClient),
                    nat.clone(),
                    port_mapper.clone(),
                    location.clone(),
                    options,
                );
                Ok((
                    Arc::new(service) as Arc<dyn Service>,
                    wireguard::proposal(&location.country),
                ))
            }),
        );
    }

    registry
}

async fn run_service(args: ServiceArgs) -> exitcode::ExitCode {
    let keystore = Keystore::new(keystore_directory());
    let requested = (!args.identity.is_empty()).then_some(args.identity.as_str());
    let (provider_id, signer) =
        match identity::load_identity(&keystore, requested, &args.identity_passphrase) {
            Ok(loaded) => loaded,
            Err(e) => {
                tracing::error!(error = %e, "failed to unlock identity");
                return exitcode::NOPERM;
            }
        };
    tracing::info!(provider = %provider_id, "identity unlocked");

    let location = match detect_location(&args) {
        Ok(location) => location,
        Err(e) => {
            tracing::error!(error = %e, "failed to detect service location");
            return exitcode::UNAVAILABLE;
        }
    };
    tracing::info!(out_ip = %location.out_ip, pub_ip = %location.pub_ip, "service location detected");

    // process-wide singletons: wired up before Manager::start, torn down
    // after kill
    let nat = Arc::new(NatService::new(Box::new(IptablesNatOps)));
    let firewall = Arc::new(Firewall::new(Box::new(IptablesFirewallOps)));
    let nat_status = if location.behind_nat() {
        NatStatus::BehindNat
    } else {
        NatStatus::Open
    };
    let (_nat_status_tx, nat_status_rx) = watch::channel(nat_status);
    let pinger = Arc::new(Pinger::new(nat_status_rx, DEFAULT_HOLE_PUNCH_TIMEOUT));
    let port_mapper: Arc<dyn PortMapper> = Arc::new(NoopPortMapper);

    let events_task = EventsSender::new(LogMetricsSender, ConfiguredIpResolver(location.clone()))
        .run(pinger.subscribe());

    let registry = build_registry(&args, &location, &nat, &firewall, &pinger, &port_mapper);

    let advertised_ip = location.pub_ip;
    let handler_signer = signer.clone();
    let discovery_registry = Arc::new(HttpProposalRegistry::new(
        args.discovery_address.clone(),
        signer.clone(),
    ));

    let manager = Arc::new(Manager::new(
        registry,
        Arc::new(move |_provider_id: &Identity, _service_type: &str| {
            Ok(Arc::new(TcpDialogWaiter::new(advertised_ip)) as Arc<dyn DialogWaiter>)
        }),
        Arc::new(move |proposal: ServiceProposal, service: Arc<dyn Service>, id: &str| {
            Arc::new(SessionDialogHandler::new(
                proposal,
                service,
                id,
                handler_signer.clone(),
            )) as Arc<dyn DialogHandler>
        }),
        {
            let discovery_registry = discovery_registry.clone();
            Arc::new(move || {
                Discovery::new(discovery_registry.clone(), DEFAULT_REPUBLISH_INTERVAL)
            })
        },
        Arc::new(LogPublisher),
    ));

    // first error terminates the process; later ones are logged and dropped
    let (error_tx, mut error_rx) = mpsc::channel::<String>(1);
    for service_type in args.service_types() {
        let Some(options) = args.options_for(&service_type) else {
            tracing::error!(service_type, "unknown service type");
            return exitcode::USAGE;
        };
        let manager = manager.clone();
        let provider_id = provider_id.clone();
        let error_tx = error_tx.clone();
        tokio::spawn(async move {
            match manager.start(&provider_id, &service_type, options).await {
                Ok(id) => {
                    tracing::info!(service_type, %id, "service start succeeded");
                }
                Err(e) => {
                    tracing::error!(service_type, error = %e, "service start failed");
                    if error_tx.try_send(e.to_string()).is_err() {
                        tracing::debug!(service_type, "error channel already carries a failure");
                    }
                }
            }
        });
    }

    let exit = tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
            exitcode::OK
        }
        failure = error_rx.recv() => {
            if let Some(failure) = failure {
                tracing::error!(error = %failure, "terminating on service failure");
            }
            exitcode::SOFTWARE
        }
    };

    if let Err(e) = manager.kill().await {
        tracing::error!(error = %e, "failed to stop all services");
    }
    events_task.abort();
    exit
}

async fn shutdown_signal() {
    let interrupt = signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut terminate = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                let _ = interrupt.await;
                return;
            }
        };
        tokio::select! {
            _ = interrupt => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = interrupt.await;
    }
}

#[tokio::main]
async fn main() {
    let cli = cli::parse();

    let exit = match cli.command {
        Command::License => {
            print_license();
            exitcode::OK
        }
        Command::Service(args) => {
            if !args.agreed_terms_and_conditions {
                print_term_warning();
                process::exit(2);
            }

            // install global collector configured based on RUST_LOG env var
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
                )
                .init();
            tracing::info!(
                version = env!("CARGO_PKG_VERSION"),
                "starting {}",
                env!("CARGO_PKG_NAME")
            );

            run_service(args).await
        }
    };

    if exit != exitcode::OK {
        tracing::warn!("abnormal exit");
    }
    process::exit(exit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn terms_gate_defaults_to_not_agreed() {
        let cli = Cli::try_parse_from(["peer_vpn", "service", "noop"]).unwrap();
        match cli.command {
            Command::Service(args) => assert!(!args.agreed_terms_and_conditions),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn keystore_directory_honors_the_env_override() {
        let dir = tempfile::tempdir().unwrap();
        unsafe {
            std::env::set_var("PEERVPN_KEYSTORE_DIR", dir.path());
        }
        assert_eq!(keystore_directory(), dir.path());
        unsafe {
            std::env::remove_var("PEERVPN_KEYSTORE_DIR");
        }
    }
}
