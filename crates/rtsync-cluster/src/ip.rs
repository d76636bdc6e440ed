//! Selection of the address a node binds to and announces in its ID card.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::config::{IpFamily, IpPolicy};
use crate::error::{ClusterError, Result};

const IPV6_ROUTE_TARGET: &str = "[fd00::1]:1";

/// Pick the local address according to `policy`.
///
/// An explicit address wins. Otherwise the outward-facing interface is found
/// by connecting a UDP socket to the route target, which sends nothing.
pub async fn select_address(policy: &IpPolicy) -> Result<IpAddr> {
    let address = match policy.address {
        Some(address) => address,
        None => discover(policy).await?,
    };

    if !matches_family(&address, policy.family) {
        return Err(ClusterError::Config {
            msg: format!("address {} is not an {:?} address", address, policy.family),
        });
    }
    if address.is_unspecified() || (address.is_loopback() && policy.address.is_none()) {
        return Err(ClusterError::Config {
            msg: format!("no usable {:?} address found (got {})", policy.family, address),
        });
    }
    if is_private(&address) != policy.private {
        warn!(
            %address,
            private = policy.private,
            "[CLUSTER] selected address does not match the private/public preference"
        );
    }

    debug!(%address, "[CLUSTER] local address selected");
    Ok(address)
}

async fn discover(policy: &IpPolicy) -> Result<IpAddr> {
    let mut target: SocketAddr = policy.route_target.parse().map_err(|_| ClusterError::Config {
        msg: format!("invalid route target {}", policy.route_target),
    })?;
    if policy.family == IpFamily::Ipv6 && target.is_ipv4() {
        target = IPV6_ROUTE_TARGET.parse().map_err(|_| ClusterError::Config {
            msg: format!("invalid route target {}", IPV6_ROUTE_TARGET),
        })?;
    }

    let bind: SocketAddr = match policy.family {
        IpFamily::Ipv4 => (Ipv4Addr::UNSPECIFIED, 0).into(),
        IpFamily::Ipv6 => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let unusable = |e: std::io::Error| ClusterError::Config {
        msg: format!("no usable {:?} address found: {}", policy.family, e),
    };
    let socket = UdpSocket::bind(bind).await.map_err(unusable)?;
    socket.connect(target).await.map_err(unusable)?;
    Ok(socket.local_addr().map_err(unusable)?.ip())
}

fn matches_family(address: &IpAddr, family: IpFamily) -> bool {
    match family {
        IpFamily::Ipv4 => address.is_ipv4(),
        IpFamily::Ipv6 => address.is_ipv6(),
    }
}

/// `ip:port`, with brackets around IPv6 addresses.
pub fn endpoint(ip: &str, port: u16) -> String {
    if ip.contains(':') {
        format!("[{}]:{}", ip, port)
    } else {
        format!("{}:{}", ip, port)
    }
}

/// RFC 1918 for IPv4, unique local (fc00::/7) for IPv6.
pub fn is_private(address: &IpAddr) -> bool {
    match address {
        IpAddr::V4(v4) => v4.is_private(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}
