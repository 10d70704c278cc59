//! A CNI plugin that attaches pods to the physical network through macvlan
//! sub-interfaces, with cluster-wide IP allocation coordinated through etcd.

use cni_plugin::reply::{reply, SuccessReply};
use cni_plugin::{Cni, Command, Inputs};
use etcd_client::Client;
use tracing::{error, info};

mod config;
mod error;
mod etcd;
mod ipam;
mod logging;
mod network;
mod util;

use config::NetConf;
use error::{Error, Result};
use etcd::store::EtcdStore;
use network::namespace::NetNs;

fn main() {
    logging::init();

    // UNWRAP: None on Version, but Version is handled by load()
    let inputs = Cni::load().into_inputs().unwrap();
    let cni_version = inputs.config.cni_version.clone();
    info!(command = ?inputs.command, container = %inputs.container_id, "plugin invoked");

    // Entering a network namespace is a per-thread operation. A
    // current-thread runtime keeps the whole command future on this thread,
    // so it can never be polled under the wrong namespace membership.
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            let err = Error::Io {
                context: "could not build the tokio runtime".into(),
                error: err,
            };
            error!(%err, "startup failed");
            reply(err.into_reply(cni_version));
        }
    };

    match inputs.command {
        Command::Add => match runtime.block_on(cmd_add(inputs)) {
            Ok(result) => reply(result),
            Err(err) => {
                error!(%err, "ADD failed");
                reply(err.into_reply(cni_version));
            }
        },
        Command::Del => match runtime.block_on(cmd_del(inputs)) {
            Ok(result) => reply(result),
            Err(err) => {
                error!(%err, "DEL failed");
                reply(err.into_reply(cni_version));
            }
        },
        Command::Check => match runtime.block_on(cmd_check(inputs)) {
            // CHECK prints nothing on success.
            Ok(()) => {}
            Err(err) => {
                error!(%err, "CHECK failed");
                reply(err.into_reply(cni_version));
            }
        },
        Command::Version => unreachable!(),
    }
}

/// Open the etcd client and load the service configuration named by the
/// pod in `CNI_ARGS`.
async fn load_conf(
    inputs: &Inputs,
    env_args: &str,
) -> Result<(Client, NetConf, String, String)> {
    let (service, pod_name) = util::service_and_pod(env_args).ok_or_else(|| {
        Error::Config(format!(
            "could not derive a service name from CNI args {:?}",
            env_args
        ))
    })?;

    let mut client = config::etcd_config(&inputs.config)?.connect().await?;
    let raw = etcd::fetch_service_conf(&mut client, &service).await?;
    let conf = config::read_service_conf(&raw)?;
    Ok((client, conf, service, pod_name))
}

async fn cmd_add(inputs: Inputs) -> Result<SuccessReply> {
    let env_args = std::env::var("CNI_ARGS").unwrap_or_default();
    let (client, mut conf, service, pod_name) = load_conf(&inputs, &env_args).await?;

    let netns_path = inputs.netns.as_deref().ok_or(Error::MissingField("netns"))?;
    let netns = NetNs::open(netns_path)?;

    let (conn, handle, _) = rtnetlink::new_connection().map_err(|error| Error::Io {
        context: "could not open a netlink socket".into(),
        error,
    })?;
    tokio::spawn(conn);

    if conf.master.is_empty() {
        conf.master = network::link::default_route_interface(&handle).await?;
    }

    let interface = network::link::create_mvlink(&handle, &conf, &inputs.ifname, &netns).await?;

    let mut result = SuccessReply {
        cni_version: conf.cni_version.clone(),
        interfaces: vec![interface],
        ips: Vec::new(),
        routes: Vec::new(),
        dns: Default::default(),
        specific: Default::default(),
    };

    // Everything after the link exists unwinds it on failure so a failed
    // ADD leaves nothing behind in the namespace.
    if let Err(error) = add_finalize(&client, &conf, &inputs, &netns, &env_args, &service, &pod_name, &mut result).await {
        let _ = netns
            .run(|| async {
                let (conn, ns_handle, _) =
                    rtnetlink::new_connection().map_err(|error| Error::Io {
                        context: "could not open a netlink socket in the container namespace"
                            .into(),
                        error,
                    })?;
                tokio::spawn(conn);
                network::link::del_link_by_name(&ns_handle, &inputs.ifname).await
            })
            .await;
        return Err(error);
    }

    Ok(result)
}

/// The layer-3 (or plain layer-2) half of ADD: allocate, apply, announce.
/// On any failure after allocation, the reserved addresses are released
/// before the caller deletes the link.
#[allow(clippy::too_many_arguments)]
async fn add_finalize(
    client: &Client,
    conf: &NetConf,
    inputs: &Inputs,
    netns: &NetNs,
    env_args: &str,
    service: &str,
    pod_name: &str,
    result: &mut SuccessReply,
) -> Result<()> {
    if conf.ipam.is_none() {
        // Layer 2 only: just bring the interface up.
        return netns
            .run(|| async {
                let (conn, ns_handle, _) =
                    rtnetlink::new_connection().map_err(|error| Error::Io {
                        context: "could not open a netlink socket in the container namespace"
                            .into(),
                        error,
                    })?;
                tokio::spawn(conn);
                network::link::set_link_up(&ns_handle, &inputs.ifname).await
            })
            .await;
    }

    let mut store = EtcdStore::new(client.clone(), service, pod_name).await?;
    let (ips, ipam) = ipam::exec_add(
        &mut store,
        conf,
        &inputs.container_id,
        &inputs.ifname,
        env_args,
    )
    .await?;
    if ips.is_empty() {
        return Err(Error::NoAddresses);
    }

    result.ips = ips;
    result.routes = ipam.routes.clone();
    result.dns = match &ipam.resolv_conf {
        Some(path) => ipam::parse_resolv_conf(path)?,
        None => conf.dns.clone().unwrap_or_default(),
    };

    let applied = netns
        .run(|| async {
            let (conn, ns_handle, _) = rtnetlink::new_connection().map_err(|error| Error::Io {
                context: "could not open a netlink socket in the container namespace".into(),
                error,
            })?;
            tokio::spawn(conn);

            let (index, mac) = network::link::configure_iface(
                &ns_handle,
                &inputs.ifname,
                &result.ips,
                &result.routes,
            )
            .await?;

            // Announce each v4 address; a lost announcement only delays
            // neighbour cache convergence.
            for ip in &result.ips {
                if let std::net::IpAddr::V4(v4) = ip.address.ip() {
                    if let Err(error) = network::arp::gratuitous_arp(index, &mac, v4) {
                        tracing::warn!(%error, address = %v4, "gratuitous ARP failed");
                    }
                }
            }
            Ok(())
        })
        .await;

    if let Err(error) = applied {
        let _ = ipam::exec_del(
            &mut store,
            conf,
            &inputs.container_id,
            &inputs.ifname,
            env_args,
        )
        .await;
        return Err(error);
    }
    Ok(())
}

async fn cmd_del(inputs: Inputs) -> Result<SuccessReply> {
    let env_args = std::env::var("CNI_ARGS").unwrap_or_default();
    let (client, conf, service, pod_name) = load_conf(&inputs, &env_args).await?;

    // Release the addresses first; the link disappears with the namespace
    // even if we never reach it.
    if conf.ipam.is_some() {
        let mut store = EtcdStore::new(client.clone(), &service, &pod_name).await?;
        ipam::exec_del(
            &mut store,
            &conf,
            &inputs.container_id,
            &inputs.ifname,
            &env_args,
        )
        .await?;
    }

    if let Some(netns_path) = inputs.netns.as_deref() {
        let netns = NetNs::open(netns_path)?;
        netns
            .run(|| async {
                let (conn, ns_handle, _) =
                    rtnetlink::new_connection().map_err(|error| Error::Io {
                        context: "could not open a netlink socket in the container namespace"
                            .into(),
                        error,
                    })?;
                tokio::spawn(conn);
                network::link::del_link_by_name(&ns_handle, &inputs.ifname).await
            })
            .await?;
    }

    Ok(SuccessReply {
        cni_version: conf.cni_version,
        interfaces: Vec::new(),
        ips: Vec::new(),
        routes: Vec::new(),
        dns: Default::default(),
        specific: Default::default(),
    })
}

async fn cmd_check(inputs: Inputs) -> Result<()> {
    let env_args = std::env::var("CNI_ARGS").unwrap_or_default();
    let (client, mut conf, service, pod_name) = load_conf(&inputs, &env_args).await?;

    if conf.ipam.is_some() {
        let mut store = EtcdStore::new(client.clone(), &service, &pod_name).await?;
        ipam::exec_check(&mut store, &inputs.container_id, &inputs.ifname).await?;
    }

    let netns_path = inputs.netns.as_deref().ok_or(Error::MissingField("netns"))?;
    let netns = NetNs::open(netns_path)?;

    let prev: SuccessReply = inputs
        .config
        .prev_result
        .clone()
        .ok_or(Error::MissingField("prevResult"))
        .and_then(|value| {
            serde_json::from_value(value)
                .map_err(|error| Error::Config(format!("malformed prevResult: {}", error)))
        })?;

    // The recorded interface must match both the name and the namespace we
    // were asked to check.
    let netns_str = netns_path.display().to_string();
    let recorded = prev
        .interfaces
        .iter()
        .find(|intf| intf.name == inputs.ifname && intf.sandbox == netns_str)
        .ok_or_else(|| {
            Error::NotFound(format!(
                "prevResult has no interface {} in sandbox {}",
                inputs.ifname, netns_str
            ))
        })?;

    let (conn, handle, _) = rtnetlink::new_connection().map_err(|error| Error::Io {
        context: "could not open a netlink socket".into(),
        error,
    })?;
    tokio::spawn(conn);

    if conf.master.is_empty() {
        conf.master = network::link::default_route_interface(&handle).await?;
    }
    if network::link::get_link(&handle, &conf.master).await?.is_none() {
        return Err(Error::Link(format!("master {} not found", conf.master)));
    }

    let expected_mac = recorded.mac.clone();
    netns
        .run(|| async {
            let (conn, ns_handle, _) = rtnetlink::new_connection().map_err(|error| Error::Io {
                context: "could not open a netlink socket in the container namespace".into(),
                error,
            })?;
            tokio::spawn(conn);

            network::link::validate_mvlink(&ns_handle, &inputs.ifname, &expected_mac).await?;
            network::link::validate_addresses(&ns_handle, &inputs.ifname, &prev.ips).await?;
            network::link::validate_routes(&ns_handle, &prev.routes).await?;
            Ok(())
        })
        .await
}
