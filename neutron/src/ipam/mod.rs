//! Per-range allocation orchestration for the ADD / CHECK / DEL commands.

use std::net::IpAddr;

use cni_plugin::config::Dns;
use cni_plugin::reply::Ip as IpReply;
use tracing::{info, warn};

use crate::config::{IpamConf, NetConf};
use crate::error::{Error, Result};
use crate::etcd::store::Store;
use crate::ipam::allocator::IpAllocator;
use crate::ipam::range::RangeSetExt;
use crate::util;

pub mod allocator;
pub mod range;

/// Validate the IPAM block of a service configuration: canonicalize every
/// range, reject overlap between any two range sets, and collect statically
/// requested addresses from `CNI_ARGS`.
pub fn load_ipam_config(conf: &NetConf, env_args: &str) -> Result<(IpamConf, Vec<IpAddr>)> {
    let mut ipam = conf.ipam.clone().ok_or(Error::MissingField("ipam"))?;
    if ipam.ranges.is_empty() {
        return Err(Error::Config("no IP ranges specified".into()));
    }

    for set in ipam.ranges.iter_mut() {
        set.canonicalize_set()?;
    }
    for i in 0..ipam.ranges.len() {
        for j in i + 1..ipam.ranges.len() {
            if ipam.ranges[i].overlaps(&ipam.ranges[j]) {
                return Err(Error::Config(format!(
                    "range set {} overlaps with range set {}",
                    i, j
                )));
            }
        }
    }

    Ok((ipam, util::requested_ips(env_args)))
}

/// Allocate one address per configured range set. If any set fails, every
/// address handed out by the earlier sets is released before returning.
pub async fn exec_add<S: Store>(
    store: &mut S,
    conf: &NetConf,
    container_id: &str,
    ifname: &str,
    env_args: &str,
) -> Result<(Vec<IpReply>, IpamConf)> {
    let (ipam, mut requested) = load_ipam_config(conf, env_args)?;

    let mut allocated: Vec<IpAllocator> = Vec::new();
    let mut ips = Vec::new();

    for (idx, rangeset) in ipam.ranges.iter().enumerate() {
        let alloc = IpAllocator::new(rangeset, idx);

        // Hand any statically requested address to the set that contains it.
        let request = requested
            .iter()
            .position(|ip| rangeset.contains_ip(*ip))
            .map(|pos| requested.swap_remove(pos));

        match alloc.get(store, container_id, ifname, env_args, request).await {
            Ok(reply) => {
                ips.push(reply);
                allocated.push(alloc);
            }
            Err(error) => {
                warn!(range_set = idx, %error, "allocation failed, rolling back");
                release_all(store, &allocated, container_id, ifname).await;
                return Err(error);
            }
        }
    }

    // A requested address no range set claimed is a hard failure.
    if let Some(ip) = requested.first().copied() {
        release_all(store, &allocated, container_id, ifname).await;
        return Err(Error::OutOfRange { ip });
    }

    info!(
        container = container_id,
        count = ips.len(),
        "allocated addresses for container"
    );
    Ok((ips, ipam))
}

/// CHECK: the container must hold at least one reservation for this
/// service, whatever the address is.
pub async fn exec_check<S: Store>(store: &mut S, container_id: &str, ifname: &str) -> Result<()> {
    if store.find_by_id(container_id, ifname).await? {
        Ok(())
    } else {
        Err(Error::NotFound(format!(
            "no address reserved for container {}",
            container_id
        )))
    }
}

/// DEL: release across every range set, attempting all of them even when
/// one fails. Idempotent; a container without reservations is a no-op.
pub async fn exec_del<S: Store>(
    store: &mut S,
    conf: &NetConf,
    container_id: &str,
    ifname: &str,
    env_args: &str,
) -> Result<()> {
    let (ipam, _) = load_ipam_config(conf, env_args)?;

    let mut first_error = None;
    for (idx, rangeset) in ipam.ranges.iter().enumerate() {
        let alloc = IpAllocator::new(rangeset, idx);
        if let Err(error) = alloc.release(store, container_id, ifname).await {
            warn!(range_set = idx, %error, "release failed");
            first_error.get_or_insert(error);
        }
    }

    match first_error {
        None => {
            info!(container = container_id, "released container addresses");
            Ok(())
        }
        Some(error) => Err(error),
    }
}

async fn release_all<S: Store>(
    store: &mut S,
    allocated: &[IpAllocator<'_>],
    container_id: &str,
    ifname: &str,
) {
    for alloc in allocated {
        if let Err(error) = alloc.release(store, container_id, ifname).await {
            warn!(%error, "rollback release failed");
        }
    }
}

/// Build the DNS section from a resolver configuration file, the same way
/// the reference IPAM plugins read `/etc/resolv.conf`.
pub fn parse_resolv_conf(path: &str) -> Result<Dns> {
    let contents = std::fs::read_to_string(path).map_err(|error| Error::Io {
        context: format!("could not read resolver configuration {}", path),
        error,
    })?;
    Ok(parse_resolv_conf_str(&contents))
}

fn parse_resolv_conf_str(contents: &str) -> Dns {
    let mut dns = Dns::default();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let mut words = line.split_whitespace();
        match words.next() {
            Some("nameserver") => {
                if let Some(ip) = words.next().and_then(|w| w.parse().ok()) {
                    dns.nameservers.push(ip);
                }
            }
            Some("domain") => {
                dns.domain = words.next().map(str::to_string);
            }
            Some("search") => {
                dns.search = words.map(str::to_string).collect();
            }
            Some("options") => {
                dns.options.extend(words.map(str::to_string));
            }
            _ => {}
        }
    }
    dns
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use super::*;
    use crate::etcd::store::testing::MemStore;

    const ONLINE_ARGS: &str = "K8S_POD_NAME=pay-10-online-xyz";

    fn ip(s: &str) -> IpAddr {
        s.parse().expect("ip literal")
    }

    fn conf(ipam: serde_json::Value) -> NetConf {
        serde_json::from_value(serde_json::json!({
            "cniVersion": "0.3.1",
            "name": "neutron",
            "type": "neutron",
            "master": "bond0.444",
            "ipam": ipam,
        }))
        .expect("netconf json")
    }

    fn pay_conf() -> NetConf {
        conf(serde_json::json!({
            "type": "ipam",
            "ranges": [[{
                "subnet": "172.16.28.0/24",
                "rangeStart": "172.16.28.150",
                "rangeEnd": "172.16.28.160",
                "gateway": "172.16.28.1",
                "sandbox": ["172.16.28.150"],
            }]],
            "routes": [{"dst": "0.0.0.0/0"}],
        }))
    }

    #[test]
    fn test_overlapping_range_sets_rejected() {
        let conf = conf(serde_json::json!({
            "type": "ipam",
            "ranges": [
                [{"subnet": "172.16.28.0/24"}],
                [{
                    "subnet": "172.16.28.0/24",
                    "rangeStart": "172.16.28.100",
                }],
            ],
        }));
        assert!(matches!(
            load_ipam_config(&conf, ""),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_missing_ranges_rejected() {
        let conf = conf(serde_json::json!({ "type": "ipam", "ranges": [] }));
        assert!(load_ipam_config(&conf, "").is_err());
    }

    #[tokio::test]
    async fn test_add_allocates_per_range_set() {
        let mut store = MemStore::new();
        let (ips, ipam) = exec_add(&mut store, &pay_conf(), "c1", "eth0", ONLINE_ARGS)
            .await
            .expect("exec add");
        assert_eq!(ips.len(), 1);
        assert_eq!(ips[0].address.ip(), ip("172.16.28.151"));
        assert_eq!(ipam.routes.len(), 1);
    }

    #[tokio::test]
    async fn test_unfulfilled_requested_ip_rolls_back() {
        let mut store = MemStore::new();
        let args = format!("{};IP=10.9.9.9", ONLINE_ARGS);
        let result = exec_add(&mut store, &pay_conf(), "c1", "eth0", &args).await;
        assert!(matches!(result, Err(Error::OutOfRange { .. })));
        assert!(store.endpoints.is_empty(), "rollback left reservations");
    }

    #[tokio::test]
    async fn test_del_is_idempotent() {
        let mut store = MemStore::new();
        exec_add(&mut store, &pay_conf(), "c1", "eth0", ONLINE_ARGS)
            .await
            .expect("exec add");

        exec_del(&mut store, &pay_conf(), "c1", "eth0", ONLINE_ARGS)
            .await
            .expect("first del");
        assert!(store.endpoints.is_empty());

        exec_del(&mut store, &pay_conf(), "c1", "eth0", ONLINE_ARGS)
            .await
            .expect("second del is a no-op");
    }

    #[tokio::test]
    async fn test_check_requires_reservation() {
        let mut store = MemStore::new();
        assert!(matches!(
            exec_check(&mut store, "c1", "eth0").await,
            Err(Error::NotFound(_))
        ));

        exec_add(&mut store, &pay_conf(), "c1", "eth0", ONLINE_ARGS)
            .await
            .expect("exec add");
        exec_check(&mut store, "c1", "eth0").await.expect("check");
    }

    #[test]
    fn test_parse_resolv_conf() {
        let dns = parse_resolv_conf_str(
            "# comment\nnameserver 10.0.0.2\nnameserver 10.0.0.3\ndomain corp.example\nsearch a.example b.example\noptions ndots:2\n",
        );
        assert_eq!(dns.nameservers.len(), 2);
        assert_eq!(dns.domain.as_deref(), Some("corp.example"));
        assert_eq!(dns.search, vec!["a.example", "b.example"]);
        assert_eq!(dns.options, vec!["ndots:2"]);
    }
}
