//! Allocation and deallocation over a reservation snapshot
//!
//! Both operations are pure: they take the reservations read from a backend
//! in the current attempt and return the list that attempt should commit.
//! Nothing here locks or talks to a backend; safety against concurrent
//! writers comes entirely from the conditional update that follows.

use crate::config::{from_u128, to_u128, AddressRange, IpamConfig};
use crate::error::{Error, Result};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;
use tracing::debug;

/// One committed `(address, container, pod)` triple
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IpReservation {
    pub ip: IpAddr,
    #[serde(rename = "id")]
    pub container_id: String,
    #[serde(rename = "podref", default)]
    pub pod_ref: String,
}

impl IpReservation {
    pub fn new(ip: IpAddr, container_id: impl Into<String>, pod_ref: impl Into<String>) -> Self {
        Self {
            ip,
            container_id: container_id.into(),
            pod_ref: pod_ref.into(),
        }
    }
}

/// Assign the lowest free address in the range to `container_id`
///
/// Returns the address (with the range's prefix length) and the input list
/// with one entry appended. Existing entries are never modified.
pub fn assign(
    config: &IpamConfig,
    reservations: &[IpReservation],
    container_id: &str,
    pod_ref: &str,
) -> Result<(IpNet, Vec<IpReservation>)> {
    let range = &config.range;
    let ip = next_free(range, reservations).ok_or(Error::RangeExhausted { range: range.cidr })?;

    debug!(ip = %ip, container_id, range = %range.cidr, "Selected free address");

    let mut updated = Vec::with_capacity(reservations.len() + 1);
    updated.extend_from_slice(reservations);
    updated.push(IpReservation::new(ip, container_id, pod_ref));

    Ok((range.with_prefix(ip), updated))
}

/// Drop every reservation held by `container_id`
///
/// Zero matches is `NotFound`; one or more matches are all removed.
pub fn release(
    range: IpNet,
    reservations: &[IpReservation],
    container_id: &str,
) -> Result<Vec<IpReservation>> {
    let updated: Vec<IpReservation> = reservations
        .iter()
        .filter(|r| r.container_id != container_id)
        .cloned()
        .collect();

    let removed = reservations.len() - updated.len();
    if removed == 0 {
        return Err(Error::NotFound {
            container_id: container_id.to_string(),
            range,
        });
    }
    if removed > 1 {
        debug!(container_id, removed, range = %range, "Released multiple reservations");
    }

    Ok(updated)
}

/// Ascending scan from the range start
fn next_free(range: &AddressRange, reservations: &[IpReservation]) -> Option<IpAddr> {
    let ipv4 = range.cidr.addr().is_ipv4();
    let reserved: BTreeSet<u128> = reservations.iter().map(|r| to_u128(r.ip)).collect();

    let start = to_u128(range.start);
    let end = to_u128(range.end);

    let mut candidate = start;
    loop {
        let ip = from_u128(candidate, ipv4);
        if !reserved.contains(&candidate) && !range.is_excluded(ip) {
            return Some(ip);
        }
        // Skip a whole excluded subnet at once
        candidate = match range.exclude.iter().find(|net| net.contains(&ip)) {
            Some(net) => to_u128(net.broadcast()).checked_add(1)?,
            None => candidate.checked_add(1)?,
        };
        if candidate > end {
            return None;
        }
    }
}

/// Offset of `ip` from the network address of `cidr`
pub fn ip_to_offset(cidr: &IpNet, ip: IpAddr) -> Result<u128> {
    if !cidr.contains(&ip) {
        return Err(Error::InvalidReservation(format!(
            "{} is outside of {}",
            ip, cidr
        )));
    }
    Ok(to_u128(ip) - to_u128(cidr.network()))
}

/// Address at `offset` from the network address of `cidr`
pub fn offset_to_ip(cidr: &IpNet, offset: u128) -> Result<IpAddr> {
    let network = to_u128(cidr.network());
    let ip = network
        .checked_add(offset)
        .map(|value| from_u128(value, cidr.addr().is_ipv4()))
        .filter(|ip| cidr.contains(ip))
        .ok_or_else(|| {
            Error::InvalidReservation(format!("offset {} is outside of {}", offset, cidr))
        })?;
    Ok(ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(range: &str) -> IpamConfig {
        IpamConfig::for_range(AddressRange::parse(range, None, None, None, vec![]).unwrap())
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_assign_first_address_in_bounds() {
        let config = config("192.168.1.5-192.168.1.25/24");
        let (address, updated) = assign(&config, &[], "c1", "default/pod-1").unwrap();

        assert_eq!(address.to_string(), "192.168.1.5/24");
        assert_eq!(updated, vec![IpReservation::new(ip("192.168.1.5"), "c1", "default/pod-1")]);
    }

    #[test]
    fn test_assign_skips_reserved_and_gateway() {
        let mut config = config("10.0.0.0/29");
        config.range.gateway = Some(ip("10.0.0.1"));
        let existing = vec![IpReservation::new(ip("10.0.0.2"), "a", "ns/a")];

        let (address, updated) = assign(&config, &existing, "b", "ns/b").unwrap();
        assert_eq!(address.addr(), ip("10.0.0.3"));
        assert_eq!(updated.len(), 2);
        assert_eq!(updated[0], existing[0]);
    }

    #[test]
    fn test_assign_skips_excluded_subnet() {
        let mut config = config("10.0.0.0/24");
        config.range.exclude = vec!["10.0.0.0/28".parse().unwrap()];

        let (address, _) = assign(&config, &[], "c1", "").unwrap();
        assert_eq!(address.addr(), ip("10.0.0.16"));
    }

    #[test]
    fn test_assign_exhausted_range() {
        let config = config("192.168.1.5-192.168.1.7/24");
        let full: Vec<_> = (5..=7)
            .map(|n| IpReservation::new(ip(&format!("192.168.1.{}", n)), format!("c{}", n), ""))
            .collect();

        let err = assign(&config, &full, "late", "").unwrap_err();
        assert!(matches!(err, Error::RangeExhausted { .. }));
    }

    #[test]
    fn test_assign_exhausted_by_exclusion_at_end() {
        let mut config = config("10.0.0.0/30");
        config.range.exclude = vec!["10.0.0.0/30".parse().unwrap()];
        assert!(matches!(
            assign(&config, &[], "c1", ""),
            Err(Error::RangeExhausted { .. })
        ));
    }

    #[test]
    fn test_assign_ipv6() {
        let config = config("2001:db8::/64");
        let existing = vec![IpReservation::new(ip("2001:db8::1"), "a", "")];
        let (address, _) = assign(&config, &existing, "b", "").unwrap();
        assert_eq!(address.to_string(), "2001:db8::2/64");
    }

    #[test]
    fn test_release_removes_only_matching() {
        let cidr: IpNet = "10.0.0.0/24".parse().unwrap();
        let existing = vec![
            IpReservation::new(ip("10.0.0.1"), "a", "ns/a"),
            IpReservation::new(ip("10.0.0.2"), "b", "ns/b"),
            IpReservation::new(ip("10.0.0.3"), "a", "ns/a"),
        ];

        let updated = release(cidr, &existing, "a").unwrap();
        assert_eq!(updated, vec![IpReservation::new(ip("10.0.0.2"), "b", "ns/b")]);
    }

    #[test]
    fn test_release_not_found() {
        let cidr: IpNet = "10.0.0.0/24".parse().unwrap();
        let existing = vec![IpReservation::new(ip("10.0.0.1"), "a", "")];
        assert!(matches!(
            release(cidr, &existing, "zzz"),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_released_address_is_assignable_again() {
        let config = config("192.168.1.5-192.168.1.25/24");
        let (first, reservations) = assign(&config, &[], "a", "").unwrap();
        let (_, reservations) = assign(&config, &reservations, "b", "").unwrap();

        let reservations = release(config.cidr(), &reservations, "a").unwrap();
        let (again, _) = assign(&config, &reservations, "c", "").unwrap();
        assert_eq!(again, first);
    }

    #[test]
    fn test_offsets() {
        let cidr: IpNet = "10.0.1.0/24".parse().unwrap();
        assert_eq!(ip_to_offset(&cidr, ip("10.0.1.9")).unwrap(), 9);
        assert_eq!(offset_to_ip(&cidr, 9).unwrap(), ip("10.0.1.9"));
        assert!(ip_to_offset(&cidr, ip("10.0.2.1")).is_err());
        assert!(offset_to_ip(&cidr, 256).is_err());
    }

    #[test]
    fn test_reservation_wire_format() {
        let reservation = IpReservation::new(ip("10.0.0.4"), "abc", "ns/pod");
        let json = serde_json::to_value(&reservation).unwrap();
        assert_eq!(json["id"], "abc");
        assert_eq!(json["podref"], "ns/pod");
        assert_eq!(json["ip"], "10.0.0.4");
    }
}
