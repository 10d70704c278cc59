//! Configuration schemas.
//!
//! The plugin sees two layers of configuration. The host-side file the
//! runtime pipes to stdin is the standard CNI `NetworkConfig` carrying only
//! the etcd connection details; the real per-service configuration (parent
//! link, MTU, IPAM ranges, routes) lives in etcd and is fetched by service
//! name on every invocation.

use cni_plugin::config::{Dns, NetworkConfig};
use cni_plugin::reply::Route;
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::etcd::EtcdConfig;
use crate::ipam::range::RangeSet;

/// The service configuration stored under `/neutron/service/<service>`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetConf {
    pub cni_version: Version,

    pub name: String,

    #[serde(rename = "type")]
    pub plugin: String,

    /// Parent link, either an existing interface or the `NAME.VID` form of
    /// a VLAN sub-interface to create. Empty means "use the default-route
    /// interface".
    #[serde(default)]
    pub master: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipam: Option<IpamConf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<Dns>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpamConf {
    #[serde(rename = "type")]
    pub plugin: String,

    /// Outer list: one address per entry. Inner list: the ranges that
    /// entry may draw from.
    #[serde(default)]
    pub ranges: Vec<RangeSet>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,

    /// Optional resolver configuration file to turn into the DNS section
    /// of the result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolv_conf: Option<String>,
}

/// Parse the JSON blob fetched from etcd.
pub fn read_service_conf(bytes: &[u8]) -> Result<NetConf> {
    serde_json::from_slice(bytes)
        .map_err(|error| Error::Config(format!("malformed service configuration: {}", error)))
}

/// Pull the etcd connection details out of the host-side configuration.
pub fn etcd_config(config: &NetworkConfig) -> Result<EtcdConfig> {
    let value = config
        .specific
        .get("etcd")
        .ok_or(Error::MissingField("etcd"))?;
    serde_json::from_value(value.clone())
        .map_err(|error| Error::Config(format!("malformed etcd configuration: {}", error)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_conf_roundtrip() {
        let json = serde_json::json!({
            "cniVersion": "0.3.1",
            "name": "neutron",
            "type": "neutron",
            "master": "bond0.444",
            "ipam": {
                "type": "ipam",
                "ranges": [[{
                    "rangeStart": "172.16.28.150",
                    "rangeEnd": "172.16.28.160",
                    "subnet": "172.16.28.0/24",
                    "gateway": "172.16.28.1",
                    "sandbox": ["172.16.28.150"],
                }]],
                "routes": [{"dst": "0.0.0.0/0"}],
            },
        });

        let conf = read_service_conf(json.to_string().as_bytes()).expect("service conf");
        assert_eq!(conf.master, "bond0.444");
        assert_eq!(conf.cni_version, Version::new(0, 3, 1));

        let ipam = conf.ipam.as_ref().expect("ipam block");
        assert_eq!(ipam.ranges.len(), 1);
        assert_eq!(ipam.ranges[0][0].sandbox.len(), 1);
        assert_eq!(ipam.routes.len(), 1);

        // Unset optional fields must not serialize back out.
        let out = serde_json::to_value(&conf).expect("serialize");
        assert!(out.get("mtu").is_none());
        assert!(out["ipam"].get("resolvConf").is_none());
    }

    #[test]
    fn test_master_defaults_to_empty() {
        let conf = read_service_conf(
            serde_json::json!({
                "cniVersion": "0.3.1",
                "name": "neutron",
                "type": "neutron",
            })
            .to_string()
            .as_bytes(),
        )
        .expect("service conf");
        assert!(conf.master.is_empty());
        assert!(conf.ipam.is_none());
    }

    #[test]
    fn test_malformed_conf_is_config_error() {
        assert!(matches!(
            read_service_conf(b"{not json"),
            Err(Error::Config(_))
        ));
    }
}
