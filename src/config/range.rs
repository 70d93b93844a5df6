//! Address range parsing and bounds
//!
//! A range is a CIDR plus optional start/end bounds, a gateway and a list of
//! excluded subnets. The CIDR is always stored normalized to its network
//! address; the original host bits of a `"start-end/NN"` string survive only
//! as the bounds.

use crate::error::{Error, Result};
use ipnet::IpNet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Allocatable address universe for one pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRange {
    /// Network CIDR, normalized to the network address
    pub cidr: IpNet,
    /// First candidate address (inclusive)
    pub start: IpAddr,
    /// Last candidate address (inclusive)
    pub end: IpAddr,
    /// Gateway, never handed out
    pub gateway: Option<IpAddr>,
    /// Subnets that are never handed out
    pub exclude: Vec<IpNet>,
}

impl AddressRange {
    /// Build a range, defaulting the bounds to the first and last host of the CIDR
    pub fn new(
        cidr: IpNet,
        start: Option<IpAddr>,
        end: Option<IpAddr>,
        gateway: Option<IpAddr>,
        exclude: Vec<IpNet>,
    ) -> Result<Self> {
        let cidr = cidr.trunc();
        let start = start.unwrap_or_else(|| first_host(&cidr));
        let end = end.unwrap_or_else(|| last_host(&cidr));

        for bound in [start, end] {
            if !cidr.contains(&bound) {
                return Err(Error::InvalidRange(format!(
                    "bound {} is outside of {}",
                    bound, cidr
                )));
            }
        }
        if to_u128(start) > to_u128(end) {
            return Err(Error::InvalidRange(format!(
                "range start {} is after range end {}",
                start, end
            )));
        }

        Ok(Self {
            cidr,
            start,
            end,
            gateway,
            exclude,
        })
    }

    /// Parse a range string, either `a.b.c.d/NN` or `a.b.c.d-e.f.g.h/NN`
    ///
    /// Explicit `start`/`end` values override what the string implies.
    pub fn parse(
        range: &str,
        start: Option<IpAddr>,
        end: Option<IpAddr>,
        gateway: Option<IpAddr>,
        exclude: Vec<IpNet>,
    ) -> Result<Self> {
        let (cidr, implied_start, implied_end) = split_range(range)?;
        Self::new(
            cidr,
            start.or(implied_start),
            end.or(implied_end),
            gateway,
            exclude,
        )
    }

    /// Gateway or explicitly excluded
    pub fn is_excluded(&self, ip: IpAddr) -> bool {
        self.gateway == Some(ip) || self.exclude.iter().any(|net| net.contains(&ip))
    }

    /// Address with the range's prefix length attached
    pub fn with_prefix(&self, ip: IpAddr) -> IpNet {
        IpNet::new(ip, self.cidr.prefix_len()).unwrap_or_else(|_| host_net(ip))
    }
}

/// Split a range string into its normalized CIDR and implied bounds
fn split_range(range: &str) -> Result<(IpNet, Option<IpAddr>, Option<IpAddr>)> {
    let range = range.trim();
    match range.split_once('-') {
        Some((start, rest)) => {
            let start: IpAddr = start
                .trim()
                .parse()
                .map_err(|e| Error::InvalidRange(format!("{}: {}", range, e)))?;
            let end_net: IpNet = rest
                .trim()
                .parse()
                .map_err(|e| Error::InvalidRange(format!("{}: {}", range, e)))?;
            if start.is_ipv4() != end_net.addr().is_ipv4() {
                return Err(Error::InvalidRange(format!(
                    "{}: start and end belong to different address families",
                    range
                )));
            }
            let cidr = IpNet::new(start, end_net.prefix_len())
                .map_err(|e| Error::InvalidRange(format!("{}: {}", range, e)))?
                .trunc();
            Ok((cidr, Some(start), Some(end_net.addr())))
        }
        None => {
            let cidr: IpNet = range
                .parse()
                .map_err(|e| Error::InvalidRange(format!("{}: {}", range, e)))?;
            Ok((cidr.trunc(), None, None))
        }
    }
}

/// First host address: skips the network address unless the CIDR is a point-to-point or host route
pub fn first_host(cidr: &IpNet) -> IpAddr {
    let network = cidr.network();
    if cidr.max_prefix_len() - cidr.prefix_len() < 2 {
        return network;
    }
    from_u128(to_u128(network) + 1, network.is_ipv4())
}

/// Last host address: IPv4 skips broadcast, IPv6 has none
pub fn last_host(cidr: &IpNet) -> IpAddr {
    let broadcast = cidr.broadcast();
    match cidr {
        IpNet::V4(net) if net.prefix_len() < 31 => from_u128(to_u128(broadcast) - 1, true),
        _ => broadcast,
    }
}

/// Single-address network for `ip`
pub fn host_net(ip: IpAddr) -> IpNet {
    match ip {
        IpAddr::V4(v4) => IpNet::V4(v4.into()),
        IpAddr::V6(v6) => IpNet::V6(v6.into()),
    }
}

/// Address as an integer, for ordering and offset arithmetic
pub fn to_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u32::from(v4) as u128,
        IpAddr::V6(v6) => u128::from(v6),
    }
}

/// Inverse of [`to_u128`]; IPv4 values are truncated to 32 bits
pub fn from_u128(value: u128, ipv4: bool) -> IpAddr {
    if ipv4 {
        IpAddr::V4(Ipv4Addr::from(value as u32))
    } else {
        IpAddr::V6(Ipv6Addr::from(value))
    }
}
