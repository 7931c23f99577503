use thiserror::Error;

use std::net::{IpAddr, UdpSocket};

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to detect outbound IP: {0}")]
    OutboundDetection(#[source] std::io::Error),
}

/// Where this provider egresses traffic, as needed by the backends.
///
/// `out_ip` is the local egress address, `pub_ip` the address consumers see;
/// they differ when the node sits behind NAT.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceLocationInfo {
    pub out_ip: IpAddr,
    pub pub_ip: IpAddr,
    pub country: String,
}

impl ServiceLocationInfo {
    pub fn behind_nat(&self) -> bool {
        self.out_ip != self.pub_ip
    }
}

pub trait LocationResolver: Send + Sync {
    fn detect_location(&self) -> Result<ServiceLocationInfo, Error>;
}

/// Resolver with a fixed answer, fed from configuration.
pub struct StaticResolver {
    location: ServiceLocationInfo,
}

impl StaticResolver {
    pub fn new(location: ServiceLocationInfo) -> Self {
        StaticResolver { location }
    }
}

impl LocationResolver for StaticResolver {
    fn detect_location(&self) -> Result<ServiceLocationInfo, Error> {
        Ok(self.location.clone())
    }
}

/// Local address the kernel picks for outbound traffic. No packets are sent;
/// connecting a UDP socket only selects a route.
pub fn detect_outbound_ip() -> Result<IpAddr, Error> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).map_err(Error::OutboundDetection)?;
    socket
        .connect(("8.8.8.8", 53))
        .map_err(Error::OutboundDetection)?;
    let addr = socket.local_addr().map_err(Error::OutboundDetection)?;
    Ok(addr.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nat_detection_compares_the_ip_pair() {
        let behind = ServiceLocationInfo {
            out_ip: "10.0.0.5".parse().unwrap(),
            pub_ip: "203.0.113.4".parse().unwrap(),
            country: "LT".to_string(),
        };
        assert!(behind.behind_nat());

        let open = ServiceLocationInfo {
            pub_ip: behind.out_ip,
            ..behind.clone()
        };
        assert!(!open.behind_nat());
    }
}
