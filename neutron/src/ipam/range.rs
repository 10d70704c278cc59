//! IP ranges and range sets.
//!
//! A range is a contiguous span of addresses inside one subnet; a range set
//! is an ordered list of ranges of the same family. Ranges arrive from the
//! service configuration with most fields optional and must be canonicalized
//! before anything else looks at them.

use std::net::IpAddr;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Range {
    /// First allocatable address, inclusive. Defaults to the first usable
    /// host of the subnet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_start: Option<IpAddr>,

    /// Last allocatable address, inclusive. Defaults to the last usable
    /// host of the subnet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_end: Option<IpAddr>,

    pub subnet: IpNetwork,

    /// Defaults to the first host of the subnet. Never allocated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,

    /// Addresses reserved for sandbox-staged pods. Production pods never
    /// draw from this list, sandbox pods draw only from it.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sandbox: Vec<IpAddr>,
}

/// An ordered sequence of ranges within one IPAM configuration entry.
pub type RangeSet = Vec<Range>;

impl Range {
    /// Fill the optional fields from the subnet and validate the invariants:
    /// start <= end, start/end/gateway inside the subnet, one address family
    /// throughout, sandbox addresses inside [start, end].
    pub fn canonicalize(&mut self) -> Result<()> {
        if !subnet_is_canonical(&self.subnet) {
            return Err(Error::Config(format!(
                "subnet {} is not a network address",
                self.subnet
            )));
        }
        if usable_span(&self.subnet) < 2 {
            return Err(Error::Config(format!(
                "subnet {} is too small to allocate from",
                self.subnet
            )));
        }

        let start = self.start();
        let end = self.end();
        let gateway = self.gw();
        self.range_start = Some(start);
        self.range_end = Some(end);
        self.gateway = Some(gateway);

        for (field, ip) in [("rangeStart", start), ("rangeEnd", end), ("gateway", gateway)] {
            if ip.is_ipv4() != self.subnet.is_ipv4() {
                return Err(Error::Config(format!(
                    "{} {} does not match the family of subnet {}",
                    field, ip, self.subnet
                )));
            }
            if !self.subnet.contains(ip) {
                return Err(Error::Config(format!(
                    "{} {} is outside subnet {}",
                    field, ip, self.subnet
                )));
            }
        }
        if ip_ord(start) > ip_ord(end) {
            return Err(Error::Config(format!(
                "rangeStart {} is after rangeEnd {}",
                start, end
            )));
        }
        for ip in &self.sandbox {
            if ip.is_ipv4() != self.subnet.is_ipv4()
                || ip_ord(*ip) < ip_ord(start)
                || ip_ord(*ip) > ip_ord(end)
            {
                return Err(Error::Config(format!(
                    "sandbox address {} is outside range {}-{}",
                    ip, start, end
                )));
            }
        }
        Ok(())
    }

    /// First allocatable address; computed from the subnet until
    /// canonicalization pins it.
    pub fn start(&self) -> IpAddr {
        self.range_start.unwrap_or_else(|| first_usable(&self.subnet))
    }

    /// Last allocatable address.
    pub fn end(&self) -> IpAddr {
        self.range_end.unwrap_or_else(|| last_usable(&self.subnet))
    }

    /// The gateway, which iteration always skips.
    pub fn gw(&self) -> IpAddr {
        self.gateway.unwrap_or_else(|| first_usable(&self.subnet))
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        ip.is_ipv4() == self.subnet.is_ipv4()
            && self.subnet.contains(ip)
            && ip_ord(ip) >= ip_ord(self.start())
            && ip_ord(ip) <= ip_ord(self.end())
    }

    pub fn overlaps(&self, other: &Range) -> bool {
        self.subnet.is_ipv4() == other.subnet.is_ipv4()
            && ip_ord(self.start()) <= ip_ord(other.end())
            && ip_ord(other.start()) <= ip_ord(self.end())
    }
}

pub trait RangeSetExt {
    /// Canonicalize every member and reject overlap within the set.
    fn canonicalize_set(&mut self) -> Result<()>;

    fn contains_ip(&self, ip: IpAddr) -> bool;

    /// The member range containing `ip`, or an out-of-range error.
    fn range_for(&self, ip: IpAddr) -> Result<&Range>;

    /// True iff some address belongs to both sets.
    fn overlaps(&self, other: &[Range]) -> bool;
}

impl RangeSetExt for [Range] {
    fn canonicalize_set(&mut self) -> Result<()> {
        if self.is_empty() {
            return Err(Error::Config("empty range set".into()));
        }
        for range in self.iter_mut() {
            range.canonicalize()?;
        }
        let family = self[0].subnet.is_ipv4();
        if self.iter().any(|r| r.subnet.is_ipv4() != family) {
            return Err(Error::Config(
                "mixed address families within one range set".into(),
            ));
        }
        for i in 0..self.len() {
            for j in i + 1..self.len() {
                if self[i].overlaps(&self[j]) {
                    return Err(Error::Config(format!(
                        "ranges {}-{} and {}-{} overlap",
                        self[i].start(),
                        self[i].end(),
                        self[j].start(),
                        self[j].end()
                    )));
                }
            }
        }
        Ok(())
    }

    fn contains_ip(&self, ip: IpAddr) -> bool {
        self.iter().any(|r| r.contains(ip))
    }

    fn range_for(&self, ip: IpAddr) -> Result<&Range> {
        self.iter()
            .find(|r| r.contains(ip))
            .ok_or(Error::OutOfRange { ip })
    }

    fn overlaps(&self, other: &[Range]) -> bool {
        self.iter()
            .any(|r| other.iter().any(|o| r.overlaps(o)))
    }
}

/// Normalize an IPv4-mapped IPv6 address to plain IPv4 so that comparisons
/// and KV literals are stable regardless of how the address was written.
pub fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => ip,
        },
        v4 => v4,
    }
}

/// The successor address within the family, wrapping at the top.
pub fn next_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(v4) => IpAddr::V4(u32::from(v4).wrapping_add(1).into()),
        IpAddr::V6(v6) => IpAddr::V6(u128::from(v6).wrapping_add(1).into()),
    }
}

/// Numeric form for ordering within a family.
fn ip_ord(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u32::from(v4) as u128,
        IpAddr::V6(v6) => u128::from(v6),
    }
}

fn subnet_is_canonical(subnet: &IpNetwork) -> bool {
    subnet.ip() == subnet.network()
}

/// Number of host addresses the subnet can hold, saturating for huge v6 nets.
fn usable_span(subnet: &IpNetwork) -> u128 {
    match subnet {
        IpNetwork::V4(net) => 1u128 << (32 - net.prefix() as u32).min(32),
        IpNetwork::V6(net) => 1u128
            .checked_shl((128 - net.prefix() as u32).min(127))
            .unwrap_or(u128::MAX),
    }
}

/// First allocatable host: network address + 1 for v4 (the network address
/// itself is not usable), first interface address for v6.
fn first_usable(subnet: &IpNetwork) -> IpAddr {
    next_ip(subnet.network())
}

/// Last allocatable host: broadcast - 1 for v4, last address for v6.
fn last_usable(subnet: &IpNetwork) -> IpAddr {
    match subnet {
        IpNetwork::V4(net) => {
            let top = u32::from(net.network()) | !u32::from(net.mask());
            IpAddr::V4(top.wrapping_sub(1).into())
        }
        IpNetwork::V6(net) => {
            let top = u128::from(net.network()) | !u128::from(net.mask());
            IpAddr::V6(top.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().expect("ip literal")
    }

    fn range(json: serde_json::Value) -> Range {
        serde_json::from_value(json).expect("range json")
    }

    #[test]
    fn test_canonicalize_fills_defaults() {
        let mut r = range(serde_json::json!({ "subnet": "172.16.28.0/24" }));
        r.canonicalize().expect("canonicalize");
        assert_eq!(r.start(), ip("172.16.28.1"));
        assert_eq!(r.end(), ip("172.16.28.254"));
        assert_eq!(r.gw(), ip("172.16.28.1"));
    }

    #[test]
    fn test_canonicalize_keeps_explicit_bounds() {
        let mut r = range(serde_json::json!({
            "subnet": "172.16.28.0/24",
            "rangeStart": "172.16.28.150",
            "rangeEnd": "172.16.28.160",
            "gateway": "172.16.28.1",
            "sandbox": ["172.16.28.150", "172.16.28.151"],
        }));
        r.canonicalize().expect("canonicalize");
        assert_eq!(r.start(), ip("172.16.28.150"));
        assert_eq!(r.end(), ip("172.16.28.160"));
        assert_eq!(r.gw(), ip("172.16.28.1"));
    }

    #[test]
    fn test_canonicalize_rejects_escapes() {
        let mut r = range(serde_json::json!({
            "subnet": "172.16.28.0/24",
            "rangeStart": "172.16.29.1",
        }));
        assert!(r.canonicalize().is_err());

        let mut r = range(serde_json::json!({
            "subnet": "172.16.28.0/24",
            "gateway": "10.0.0.1",
        }));
        assert!(r.canonicalize().is_err());

        let mut r = range(serde_json::json!({
            "subnet": "172.16.28.0/24",
            "rangeStart": "172.16.28.160",
            "rangeEnd": "172.16.28.150",
        }));
        assert!(r.canonicalize().is_err());
    }

    #[test]
    fn test_canonicalize_rejects_sandbox_outside_bounds() {
        let mut r = range(serde_json::json!({
            "subnet": "172.16.28.0/24",
            "rangeStart": "172.16.28.150",
            "rangeEnd": "172.16.28.160",
            "sandbox": ["172.16.28.10"],
        }));
        assert!(r.canonicalize().is_err());
    }

    #[test]
    fn test_contains_respects_bounds() {
        let mut r = range(serde_json::json!({
            "subnet": "172.16.28.0/24",
            "rangeStart": "172.16.28.150",
            "rangeEnd": "172.16.28.160",
        }));
        r.canonicalize().expect("canonicalize");
        assert!(r.contains(ip("172.16.28.150")));
        assert!(r.contains(ip("172.16.28.160")));
        assert!(!r.contains(ip("172.16.28.149")));
        assert!(!r.contains(ip("172.16.28.161")));
        assert!(!r.contains(ip("10.0.0.1")));
    }

    #[test]
    fn test_overlap_detection() {
        let a = range(serde_json::json!({
            "subnet": "172.16.28.0/24",
            "rangeStart": "172.16.28.10",
            "rangeEnd": "172.16.28.20",
        }));
        let b = range(serde_json::json!({
            "subnet": "172.16.28.0/24",
            "rangeStart": "172.16.28.20",
            "rangeEnd": "172.16.28.30",
        }));
        let c = range(serde_json::json!({
            "subnet": "172.16.28.0/24",
            "rangeStart": "172.16.28.21",
            "rangeEnd": "172.16.28.30",
        }));
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));

        let set_a = vec![a];
        let set_c = vec![c];
        assert!(!set_a.overlaps(&set_c));
    }

    #[test]
    fn test_range_for() {
        let mut set: RangeSet = vec![
            range(serde_json::json!({
                "subnet": "172.16.28.0/24",
                "rangeStart": "172.16.28.10",
                "rangeEnd": "172.16.28.20",
            })),
            range(serde_json::json!({
                "subnet": "172.16.29.0/24",
            })),
        ];
        set.canonicalize_set().expect("canonicalize");
        assert_eq!(
            set.range_for(ip("172.16.29.7")).expect("range").subnet,
            "172.16.29.0/24".parse::<IpNetwork>().unwrap()
        );
        assert!(matches!(
            set.range_for(ip("172.16.28.30")),
            Err(Error::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_canonicalize_set_rejects_overlap() {
        let mut set: RangeSet = vec![
            range(serde_json::json!({ "subnet": "172.16.28.0/24" })),
            range(serde_json::json!({
                "subnet": "172.16.28.0/24",
                "rangeStart": "172.16.28.100",
            })),
        ];
        assert!(set.canonicalize_set().is_err());
    }

    #[test]
    fn test_next_ip_and_canonical_ip() {
        assert_eq!(next_ip(ip("172.16.28.255")), ip("172.16.29.0"));
        assert_eq!(canonical_ip(ip("::ffff:172.16.28.1")), ip("172.16.28.1"));
        assert_eq!(canonical_ip(ip("2001:db8::1")), ip("2001:db8::1"));
    }

    #[test]
    fn test_small_subnet_rejected() {
        let mut r = range(serde_json::json!({ "subnet": "172.16.28.4/31" }));
        assert!(r.canonicalize().is_err());
    }
}
