//! Link management on both sides of the namespace boundary.
//!
//! The parent (master) link lives in the host namespace and may itself need
//! to be created when it is a `NAME.VID` VLAN sub-interface. The macvlan is
//! created in the host namespace but materializes directly inside the
//! target namespace via the netns file descriptor attribute.

use std::net::IpAddr;

use futures::TryStreamExt;
use lazy_static::lazy_static;
use netlink_packet_route::link::{
    InfoData, InfoKind, InfoMacVlan, LinkAttribute, LinkInfo, LinkMessage, MacVlanMode, State,
};
use netlink_packet_route::route::{RouteAttribute, RouteMessage};
use regex::Regex;
use rtnetlink::{Handle, LinkMacVlan, LinkUnspec, LinkVlan, RouteMessageBuilder};
use tracing::{info, warn};

use cni_plugin::reply::Route;
use cni_plugin::reply::{Interface as InterfaceReply, Ip as IpReply};

use crate::config::NetConf;
use crate::error::{Error, Result};
use crate::network::namespace::NetNs;
use crate::util;

lazy_static! {
    /// `bond0.444` means "VLAN 444 on bond0, create it if absent".
    static ref VLAN_FORM: Regex = Regex::new(r"^([a-z0-9]+)\.(\d+)$").unwrap();
}

/// Look a link up by name. `Ok(None)` when the kernel does not know it.
pub async fn get_link(handle: &Handle, name: &str) -> Result<Option<LinkMessage>> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();
    match links.try_next().await {
        Ok(link) => Ok(link),
        Err(rtnetlink::Error::NetlinkError(ref e)) if e.raw_code() == -nix::libc::ENODEV => {
            Ok(None)
        }
        Err(error) => Err(Error::Netlink {
            context: format!("could not look up link {}", name),
            error,
        }),
    }
}

/// The name of the interface carrying the default route, consulted when the
/// service configuration leaves `master` empty.
pub async fn default_route_interface(handle: &Handle) -> Result<String> {
    for route_msg in [
        RouteMessageBuilder::<std::net::Ipv4Addr>::new().build(),
        RouteMessageBuilder::<std::net::Ipv6Addr>::new().build(),
    ] {
        let mut routes = handle.route().get(route_msg).execute();
        while let Some(route) = routes.try_next().await.map_err(|error| Error::Netlink {
            context: "could not list routes".into(),
            error,
        })? {
            if route.header.destination_prefix_length != 0 || route_destination(&route).is_some() {
                continue;
            }
            let Some(oif) = route.attributes.iter().find_map(|attr| match attr {
                RouteAttribute::Oif(index) => Some(*index),
                _ => None,
            }) else {
                continue;
            };

            let mut links = handle.link().get().match_index(oif).execute();
            if let Some(link) = links.try_next().await.map_err(|error| Error::Netlink {
                context: format!("could not look up link index {}", oif),
                error,
            })? {
                if let Some(name) = link_name(&link) {
                    info!(master = %name, "defaulted master to the default-route interface");
                    return Ok(name);
                }
            }
        }
    }
    Err(Error::Link("no default route interface found".into()))
}

/// Resolve the master link, creating it when it names an absent VLAN
/// sub-interface of an up parent.
pub async fn ensure_master(handle: &Handle, master: &str) -> Result<LinkMessage> {
    if let Some(link) = get_link(handle, master).await? {
        return Ok(link);
    }

    let caps = VLAN_FORM.captures(master).ok_or_else(|| {
        Error::Link(format!("master {} not found", master))
    })?;
    let parent_name = &caps[1];
    let vid: u16 = caps[2]
        .parse()
        .map_err(|_| Error::Link(format!("invalid vlan id in {}", master)))?;

    let parent = get_link(handle, parent_name)
        .await?
        .ok_or_else(|| Error::Link(format!("vlan parent device {} not found", parent_name)))?;
    if !link_is_up(&parent) {
        return Err(Error::Link(format!(
            "vlan parent device {} is not up",
            parent_name
        )));
    }

    handle
        .link()
        .add(LinkVlan::new(master, parent.header.index, vid).build())
        .execute()
        .await
        .map_err(|error| Error::Netlink {
            context: format!("could not create vlan link {}", master),
            error,
        })?;

    handle
        .link()
        .set(LinkUnspec::new_with_name(master).up().build())
        .execute()
        .await
        .map_err(|error| Error::Netlink {
            context: format!("could not bring up vlan link {}", master),
            error,
        })?;
    info!(vlan = master, vid, "created vlan sub-interface");

    // Re-read after the state change.
    get_link(handle, master)
        .await?
        .ok_or_else(|| Error::Link(format!("vlan link {} vanished after creation", master)))
}

/// Create the container's macvlan. The link is born in the host namespace
/// under a random temporary name (a name collision with the host would fail
/// the create) and moves into the target namespace in the same request;
/// renaming to the requested name happens inside the namespace.
pub async fn create_mvlink(
    handle: &Handle,
    conf: &NetConf,
    ifname: &str,
    netns: &NetNs,
) -> Result<InterfaceReply> {
    let master = ensure_master(handle, &conf.master).await?;
    let tmp_name = util::random_ifname();

    let mut builder = LinkMacVlan::new(&tmp_name, master.header.index, MacVlanMode::Bridge);
    if let Some(mtu) = conf.mtu {
        builder = builder.mtu(mtu);
    }
    handle
        .link()
        .add(builder.setns_by_fd(netns.fd()).build())
        .execute()
        .await
        .map_err(|error| Error::Netlink {
            context: format!("could not create macvlan on parent {}", conf.master),
            error,
        })?;
    info!(parent = %conf.master, tmp = %tmp_name, "created macvlan");

    let sandbox = netns.path().display().to_string();
    netns
        .run(|| async {
            let (conn, ns_handle, _) = rtnetlink::new_connection().map_err(|error| Error::Io {
                context: "could not open a netlink socket in the container namespace".into(),
                error,
            })?;
            tokio::spawn(conn);

            // Proxy-ARP first: the interface answers for addresses routed
            // through it. The link is freshly ours, so failures tear it
            // down before returning.
            if let Err(error) = enable_proxy_arp(&tmp_name) {
                let _ = del_link_by_name(&ns_handle, &tmp_name).await;
                return Err(error);
            }

            let link = get_link(&ns_handle, &tmp_name).await?.ok_or_else(|| {
                Error::Link(format!("macvlan {} not found after creation", tmp_name))
            })?;

            if let Err(error) = ns_handle
                .link()
                .set(
                    LinkUnspec::new_with_index(link.header.index)
                        .name(ifname.to_string())
                        .build(),
                )
                .execute()
                .await
            {
                let _ = del_link_by_name(&ns_handle, &tmp_name).await;
                return Err(Error::Netlink {
                    context: format!("could not rename macvlan to {}", ifname),
                    error,
                });
            }

            // Re-fetch to pick up the final hardware address.
            let link = get_link(&ns_handle, ifname).await?.ok_or_else(|| {
                Error::Link(format!("macvlan {} not found after rename", ifname))
            })?;

            Ok(InterfaceReply {
                name: ifname.to_string(),
                mac: link_mac(&link).unwrap_or_default(),
                sandbox,
            })
        })
        .await
}

/// Apply allocated addresses and configured routes to the interface and
/// bring it up. Returns the link index and MAC for the ARP announcements.
pub async fn configure_iface(
    handle: &Handle,
    ifname: &str,
    ips: &[IpReply],
    routes: &[Route],
) -> Result<(u32, [u8; 6])> {
    let link = get_link(handle, ifname)
        .await?
        .ok_or_else(|| Error::Link(format!("failed to look up {}", ifname)))?;
    let index = link.header.index;

    handle
        .link()
        .set(LinkUnspec::new_with_index(index).up().build())
        .execute()
        .await
        .map_err(|error| Error::Netlink {
            context: format!("could not set {} up", ifname),
            error,
        })?;

    for ip in ips {
        handle
            .address()
            .add(index, ip.address.ip(), ip.address.prefix())
            .execute()
            .await
            .map_err(|error| Error::Netlink {
                context: format!("could not add address {} to {}", ip.address, ifname),
                error,
            })?;
    }

    for route in routes {
        // A route without an explicit gateway uses the allocation's gateway
        // of the same family.
        let gw = route.gw.or_else(|| {
            ips.iter().find_map(|ip| {
                ip.gateway
                    .filter(|gw| gw.is_ipv4() == route.dst.is_ipv4())
            })
        });

        let mut builder = RouteMessageBuilder::<IpAddr>::new()
            .destination_prefix(route.dst.ip(), route.dst.prefix())
            .map_err(|_| Error::Config(format!("invalid route destination {}", route.dst)))?
            .output_interface(index);
        if let Some(gw) = gw {
            builder = builder
                .gateway(gw)
                .map_err(|_| Error::Config(format!("invalid route gateway {}", gw)))?;
        }

        match handle.route().add(builder.build()).execute().await {
            Ok(()) => {}
            // Another network may already own this route (commonly the
            // default route); the CNI spec says to skip it.
            Err(rtnetlink::Error::NetlinkError(ref e))
                if e.raw_code() == -nix::libc::EEXIST =>
            {
                warn!(dst = %route.dst, "route already present, skipping");
            }
            Err(error) => {
                return Err(Error::Netlink {
                    context: format!("could not add route to {}", route.dst),
                    error,
                })
            }
        }
    }

    let mac = link_mac_bytes(&link).ok_or_else(|| {
        Error::Link(format!("interface {} has no hardware address", ifname))
    })?;
    Ok((index, mac))
}

pub async fn set_link_up(handle: &Handle, ifname: &str) -> Result<()> {
    let link = get_link(handle, ifname)
        .await?
        .ok_or_else(|| Error::Link(format!("failed to find interface name {}", ifname)))?;
    handle
        .link()
        .set(LinkUnspec::new_with_index(link.header.index).up().build())
        .execute()
        .await
        .map_err(|error| Error::Netlink {
            context: format!("could not set {} up", ifname),
            error,
        })
}

/// Delete a link by name. An already-absent link is not an error, so DEL
/// stays idempotent.
pub async fn del_link_by_name(handle: &Handle, ifname: &str) -> Result<()> {
    let Some(link) = get_link(handle, ifname).await? else {
        return Ok(());
    };
    handle
        .link()
        .del(link.header.index)
        .execute()
        .await
        .map_err(|error| Error::Netlink {
            context: format!("could not delete link {}", ifname),
            error,
        })
}

/// CHECK: the container interface must exist, be a bridge-mode macvlan, and
/// carry the MAC recorded in the previous result.
pub async fn validate_mvlink(handle: &Handle, ifname: &str, expected_mac: &str) -> Result<()> {
    let link = get_link(handle, ifname)
        .await?
        .ok_or_else(|| Error::NotFound(format!("container interface {} not found", ifname)))?;

    let mut kind_ok = false;
    let mut mode_ok = false;
    for attr in &link.attributes {
        if let LinkAttribute::LinkInfo(infos) = attr {
            for info in infos {
                match info {
                    LinkInfo::Kind(InfoKind::MacVlan) => kind_ok = true,
                    LinkInfo::Data(InfoData::MacVlan(data)) => {
                        for d in data {
                            if let InfoMacVlan::Mode(mode) = d {
                                mode_ok = *mode == MacVlanMode::Bridge;
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
    }
    if !kind_ok {
        return Err(Error::NotFound(format!(
            "container interface {} is not a macvlan",
            ifname
        )));
    }
    if !mode_ok {
        return Err(Error::NotFound(format!(
            "container macvlan {} is not in bridge mode",
            ifname
        )));
    }

    if !expected_mac.is_empty() {
        let actual = link_mac(&link).unwrap_or_default();
        if actual != expected_mac {
            return Err(Error::NotFound(format!(
                "interface {} MAC {} does not match expected {}",
                ifname, actual, expected_mac
            )));
        }
    }
    Ok(())
}

/// CHECK: every expected address is present on the interface.
pub async fn validate_addresses(handle: &Handle, ifname: &str, ips: &[IpReply]) -> Result<()> {
    let link = get_link(handle, ifname)
        .await?
        .ok_or_else(|| Error::NotFound(format!("container interface {} not found", ifname)))?;

    let mut present = Vec::new();
    let mut addrs = handle
        .address()
        .get()
        .set_link_index_filter(link.header.index)
        .execute();
    while let Some(msg) = addrs.try_next().await.map_err(|error| Error::Netlink {
        context: format!("could not list addresses on {}", ifname),
        error,
    })? {
        for attr in &msg.attributes {
            if let netlink_packet_route::address::AddressAttribute::Address(ip) = attr {
                present.push(*ip);
            }
        }
    }

    for expected in ips {
        if !present.contains(&expected.address.ip()) {
            return Err(Error::NotFound(format!(
                "expected address {} missing from {}",
                expected.address, ifname
            )));
        }
    }
    Ok(())
}

/// CHECK: every expected route exists in the kernel table.
pub async fn validate_routes(handle: &Handle, expected: &[Route]) -> Result<()> {
    for route in expected {
        let route_msg = if route.dst.is_ipv4() {
            RouteMessageBuilder::<std::net::Ipv4Addr>::new().build()
        } else {
            RouteMessageBuilder::<std::net::Ipv6Addr>::new().build()
        };

        let mut found = false;
        let mut routes = handle.route().get(route_msg).execute();
        while let Some(msg) = routes.try_next().await.map_err(|error| Error::Netlink {
            context: "could not list routes".into(),
            error,
        })? {
            if msg.header.destination_prefix_length != route.dst.prefix() {
                continue;
            }
            if route.dst.prefix() != 0 && route_destination(&msg) != Some(route.dst.ip()) {
                continue;
            }
            if let Some(gw) = route.gw {
                if route_gateway(&msg) != Some(gw) {
                    continue;
                }
            }
            found = true;
            break;
        }
        if !found {
            return Err(Error::NotFound(format!(
                "expected route to {} missing",
                route.dst
            )));
        }
    }
    Ok(())
}

/// Write the per-interface proxy_arp sysctl so the mvlink answers ARP for
/// addresses routed through it.
fn enable_proxy_arp(ifname: &str) -> Result<()> {
    let path = format!("/proc/sys/net/ipv4/conf/{}/proxy_arp", ifname);
    std::fs::write(&path, "1").map_err(|error| Error::Io {
        context: format!("could not set proxy_arp on {}", ifname),
        error,
    })
}

pub fn link_name(link: &LinkMessage) -> Option<String> {
    link.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::IfName(name) => Some(name.clone()),
        _ => None,
    })
}

pub fn link_mac_bytes(link: &LinkMessage) -> Option<[u8; 6]> {
    link.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::Address(bytes) => bytes.as_slice().try_into().ok(),
        _ => None,
    })
}

pub fn link_mac(link: &LinkMessage) -> Option<String> {
    link_mac_bytes(link).map(|mac| format_mac(&mac))
}

pub fn format_mac(bytes: &[u8; 6]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

fn link_is_up(link: &LinkMessage) -> bool {
    link.attributes
        .iter()
        .any(|attr| matches!(attr, LinkAttribute::OperState(State::Up)))
}

fn route_destination(route: &RouteMessage) -> Option<IpAddr> {
    route.attributes.iter().find_map(|attr| match attr {
        RouteAttribute::Destination(addr) => route_address_ip(addr),
        _ => None,
    })
}

fn route_gateway(route: &RouteMessage) -> Option<IpAddr> {
    route.attributes.iter().find_map(|attr| match attr {
        RouteAttribute::Gateway(addr) => route_address_ip(addr),
        _ => None,
    })
}

fn route_address_ip(addr: &netlink_packet_route::route::RouteAddress) -> Option<IpAddr> {
    match addr {
        netlink_packet_route::route::RouteAddress::Inet(ip) => Some(IpAddr::V4(*ip)),
        netlink_packet_route::route::RouteAddress::Inet6(ip) => Some(IpAddr::V6(*ip)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vlan_form() {
        let caps = VLAN_FORM.captures("bond0.444").expect("vlan form");
        assert_eq!(&caps[1], "bond0");
        assert_eq!(&caps[2], "444");

        assert!(VLAN_FORM.captures("bond0").is_none());
        assert!(VLAN_FORM.captures("bond0.444.5").is_none());
        assert!(VLAN_FORM.captures("Bond0.444").is_none());
    }

    #[test]
    fn test_format_mac() {
        assert_eq!(
            format_mac(&[0x02, 0x42, 0xac, 0x10, 0x1c, 0x96]),
            "02:42:ac:10:1c:96"
        );
    }
}
