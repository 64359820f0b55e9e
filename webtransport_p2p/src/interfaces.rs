//! Local network interface enumeration.
//!
//! A listener bound to a wildcard address advertises one address per local
//! interface of the same IP family. Enumeration is injected so it can be
//! replaced in tests.

use std::{
    io,
    net::{IpAddr, SocketAddr},
};

/// Source of locally reachable IP addresses.
pub trait NetworkInterfaces: Send + Sync + 'static {
    /// Every address assigned to a local interface.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform query fails.
    fn addresses(&self) -> io::Result<Vec<IpAddr>>;
}

/// Queries the operating system via [`if_addrs`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemInterfaces;

impl NetworkInterfaces for SystemInterfaces {
    fn addresses(&self) -> io::Result<Vec<IpAddr>> {
        Ok(if_addrs::get_if_addrs()?
            .into_iter()
            .map(|iface| iface.ip())
            .collect())
    }
}

/// A fixed address list.
#[derive(Debug, Clone, Default)]
pub struct StaticInterfaces(pub Vec<IpAddr>);

impl NetworkInterfaces for StaticInterfaces {
    fn addresses(&self) -> io::Result<Vec<IpAddr>> {
        Ok(self.0.clone())
    }
}

/// The concrete socket addresses a bound address is reachable at.
///
/// Specific binds map to themselves. Wildcard binds map to every interface
/// address of the same family; if enumeration fails or finds nothing, the
/// wildcard address itself is returned.
pub fn expand_bound_addr(bound: SocketAddr, interfaces: &dyn NetworkInterfaces) -> Vec<SocketAddr> {
    if !bound.ip().is_unspecified() {
        return vec![bound];
    }

    let addresses = match interfaces.addresses() {
        Ok(addresses) => addresses,
        Err(e) => {
            tracing::warn!("failed to enumerate network interfaces: {e}");
            return vec![bound];
        }
    };

    let expanded: Vec<SocketAddr> = addresses
        .into_iter()
        .filter(|ip| ip.is_ipv4() == bound.is_ipv4())
        .map(|ip| SocketAddr::new(ip, bound.port()))
        .collect();

    if expanded.is_empty() {
        vec![bound]
    } else {
        expanded
    }
}
