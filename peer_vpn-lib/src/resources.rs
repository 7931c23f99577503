use cidr::Ipv4Cidr;
use thiserror::Error;

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

#[derive(Debug, Error)]
pub enum Error {
    #[error("no free tunnel interface in pool")]
    NoInterface,
    #[error("no free UDP port in pool")]
    NoPort,
    #[error("no free subnet left in {0}")]
    NoSubnet(Ipv4Cidr),
    #[error("resource {0} was not allocated")]
    NotAllocated(String),
    #[error("failed to query kernel interfaces: {0}")]
    InterfaceQuery(#[source] std::io::Error),
}

/// Names of interfaces the kernel currently knows about. The production
/// implementation reads /sys/class/net; tests substitute a fixed list.
pub trait InterfaceQuery: Send + Sync {
    fn existing_interfaces(&self) -> Result<Vec<String>, Error>;
}

pub struct SysfsInterfaceQuery;

impl InterfaceQuery for SysfsInterfaceQuery {
    fn existing_interfaces(&self) -> Result<Vec<String>, Error> {
        let entries = std::fs::read_dir("/sys/class/net").map_err(Error::InterfaceQuery)?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(Error::InterfaceQuery)?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }
}

struct InterfacePool {
    prefix: String,
    in_use: HashSet<usize>,
}

struct PortPool {
    min: u16,
    max: u16,
    cursor: u16,
    in_use: HashSet<u16>,
}

struct SubnetPool {
    parent: Ipv4Cidr,
    slot_bits: u8,
    in_use: HashSet<u32>,
}

/// Hands out interface names, UDP ports and consumer subnets from bounded
/// pools. Each pool is locked independently.
pub struct Allocator {
    kernel: Arc<dyn InterfaceQuery>,
    interfaces: Mutex<InterfacePool>,
    ports: Mutex<PortPool>,
    subnets: Mutex<SubnetPool>,
}

pub const INTERFACE_PREFIX: &str = "wg";

/// Consumer subnets are carved as /30 slices of the configured parent.
const SUBNET_PREFIX_LEN: u8 = 30;

impl Allocator {
    pub fn new(kernel: Arc<dyn InterfaceQuery>, port_min: u16, port_max: u16, subnet: Ipv4Cidr) -> Self {
        Allocator {
            kernel,
            interfaces: Mutex::new(InterfacePool {
                prefix: INTERFACE_PREFIX.to_string(),
                in_use: HashSet::new(),
            }),
            ports: Mutex::new(PortPool {
                min: port_min,
                max: port_max,
                cursor: port_min,
                in_use: HashSet::new(),
            }),
            subnets: Mutex::new(SubnetPool {
                parent: subnet,
                slot_bits: 32 - SUBNET_PREFIX_LEN,
                in_use: HashSet::new(),
            }),
        }
    }

    /// Next free interface name. An index is reused only once the kernel no
    /// longer reports an interface under that name.
    pub fn allocate_interface(&self) -> Result<String, Error> {
        let existing = self.kernel.existing_interfaces()?;
        let mut pool = self.interfaces.lock().expect("interface pool lock");
        // an index beyond every tracked and kernel-known name is always free
        for index in 0..=pool.in_use.len() + existing.len() {
            let name = format!("{}{}", pool.prefix, index);
            if pool.in_use.contains(&index) || existing.contains(&name) {
                continue;
            }
            pool.in_use.insert(index);
            return Ok(name);
        }
        Err(Error::NoInterface)
    }

    pub fn release_interface(&self, name: &str) -> Result<(), Error> {
        let mut pool = self.interfaces.lock().expect("interface pool lock");
        let index = name
            .strip_prefix(&pool.prefix)
            .and_then(|suffix| suffix.parse::<usize>().ok())
            .ok_or_else(|| Error::NotAllocated(name.to_string()))?;
        if !pool.in_use.remove(&index) {
            return Err(Error::NotAllocated(name.to_string()));
        }
        Ok(())
    }

    /// Kernel interfaces that match the allocator naming scheme but are not
    /// tracked. Leftovers from a crashed predecessor process.
    pub fn abandoned_interfaces(&self) -> Result<Vec<String>, Error> {
        let existing = self.kernel.existing_interfaces()?;
        let pool = self.interfaces.lock().expect("interface pool lock");
        let abandoned = existing
            .into_iter()
            .filter(|name| {
                name.strip_prefix(&pool.prefix)
                    .and_then(|suffix| suffix.parse::<usize>().ok())
                    .is_some_and(|index| !pool.in_use.contains(&index))
            })
            .collect();
        Ok(abandoned)
    }

    /// Ports are drawn round-robin over `[min, max]`.
    pub fn allocate_port(&self) -> Result<u16, Error> {
        let mut pool = self.ports.lock().expect("port pool lock");
        let span = (pool.max - pool.min) as u32 + 1;
        for step in 0..span {
            let offset = (pool.cursor - pool.min) as u32 + step;
            let port = pool.min + (offset % span) as u16;
            if pool.in_use.contains(&port) {
                continue;
            }
            pool.in_use.insert(port);
            pool.cursor = if port == pool.max { pool.min } else { port + 1 };
            return Ok(port);
        }
        Err(Error::NoPort)
    }

    pub fn release_port(&self, port: u16) -> Result<(), Error> {
        let mut pool = self.ports.lock().expect("port pool lock");
        if !pool.in_use.remove(&port) {
            return Err(Error::NotAllocated(format!("port {port}")));
        }
        Ok(())
    }

    /// Next unused /30 carved from the parent subnet, provider host first.
    pub fn allocate_ip_net(&self) -> Result<Ipv4Cidr, Error> {
        let mut pool = self.subnets.lock().expect("subnet pool lock");
        if pool.parent.network_length() > SUBNET_PREFIX_LEN {
            return Err(Error::NoSubnet(pool.parent));
        }
        let slots = 1u32 << (SUBNET_PREFIX_LEN - pool.parent.network_length());
        let base = u32::from(pool.parent.first_address());
        for slot in 0..slots {
            if pool.in_use.contains(&slot) {
                continue;
            }
            let addr = Ipv4Addr::from(base + (slot << pool.slot_bits));
            let subnet = Ipv4Cidr::new(addr, SUBNET_PREFIX_LEN)
                .map_err(|_| Error::NoSubnet(pool.parent))?;
            pool.in_use.insert(slot);
            return Ok(subnet);
        }
        Err(Error::NoSubnet(pool.parent))
    }

    pub fn release_ip_net(&self, subnet: &Ipv4Cidr) -> Result<(), Error> {
        let mut pool = self.subnets.lock().expect("subnet pool lock");
        let base = u32::from(pool.parent.first_address());
        let offset = u32::from(subnet.first_address()).wrapping_sub(base);
        let slot = offset >> pool.slot_bits;
        if offset % (1 << pool.slot_bits) != 0 || !pool.in_use.remove(&slot) {
            return Err(Error::NotAllocated(subnet.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub struct FixedInterfaces(pub Vec<String>);

    impl InterfaceQuery for FixedInterfaces {
        fn existing_interfaces(&self) -> Result<Vec<String>, Error> {
            Ok(self.0.clone())
        }
    }

    pub fn allocator() -> Allocator {
        Allocator::new(
            Arc::new(FixedInterfaces(vec![])),
            52820,
            52822,
            "10.182.0.0/24".parse().unwrap(),
        )
    }
}
