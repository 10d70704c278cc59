//! etcd key layout and client construction.
//!
//! Everything the plugin shares across hosts lives under a fixed prefix:
//!
//! - `/neutron/service/<service>`            - service NetConf (JSON)
//! - `/neutron/endpoints/<service>/<ip>`     - `host:containerID:podName`
//! - `/neutron/lastreserved/<service>/<idx>` - round-robin cursor (IP literal)
//! - `/neutron/lock/<service>`               - lease id of the advisory lock

use std::time::Duration;

use etcd_client::{Certificate, Client, ConnectOptions, Identity, TlsOptions};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};

pub mod store;

pub const PREFIX: &str = "/neutron";

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

pub fn service_key(service: &str) -> String {
    format!("{}/service/{}", PREFIX, service)
}

pub fn endpoints_key(service: &str) -> String {
    format!("{}/endpoints/{}", PREFIX, service)
}

pub fn last_reserved_key(service: &str) -> String {
    format!("{}/lastreserved/{}", PREFIX, service)
}

pub fn lock_key(service: &str) -> String {
    format!("{}/lock/{}", PREFIX, service)
}

/// The etcd block of the host-side plugin configuration. The cluster speaks
/// TLS only, so all four fields are required.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EtcdConfig {
    pub urls: String,
    pub cafile: String,
    pub keyfile: String,
    pub certfile: String,
}

impl EtcdConfig {
    pub async fn connect(&self) -> Result<Client> {
        let ca = read_pem(&self.cafile)?;
        let cert = read_pem(&self.certfile)?;
        let key = read_pem(&self.keyfile)?;

        let tls = TlsOptions::new()
            .ca_certificate(Certificate::from_pem(ca))
            .identity(Identity::from_pem(cert, key));

        let options = ConnectOptions::new()
            .with_tls(tls)
            .with_connect_timeout(DIAL_TIMEOUT);

        Client::connect([self.urls.as_str()], Some(options))
            .await
            .map_err(|error| Error::Kv {
                context: format!("could not connect to etcd at {}", self.urls),
                error,
            })
    }
}

/// Fetch the full (macvlan + IPAM) configuration stored for a service.
pub async fn fetch_service_conf(client: &mut Client, service: &str) -> Result<Vec<u8>> {
    let key = service_key(service);
    let resp = client.get(key.as_str(), None).await.map_err(|error| Error::Kv {
        context: format!("could not read {}", key),
        error,
    })?;

    match resp.kvs().first() {
        Some(kv) => {
            info!(key = %key, "loaded service configuration");
            Ok(kv.value().to_vec())
        }
        None => Err(Error::NotFound(format!(
            "no configuration stored for service {}",
            service
        ))),
    }
}

fn read_pem(path: &str) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|error| Error::Io {
        context: format!("could not read TLS material from {}", path),
        error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(service_key("pay"), "/neutron/service/pay");
        assert_eq!(endpoints_key("pay"), "/neutron/endpoints/pay");
        assert_eq!(last_reserved_key("pay"), "/neutron/lastreserved/pay");
        assert_eq!(lock_key("pay"), "/neutron/lock/pay");
    }

    #[test]
    fn test_etcd_config_schema() {
        let conf: EtcdConfig = serde_json::from_value(serde_json::json!({
            "urls": "https://127.0.0.1:2379",
            "cafile": "/etc/etcd/ssl/etcd-ca.pem",
            "keyfile": "/etc/etcd/ssl/etcd-key.pem",
            "certfile": "/etc/etcd/ssl/etcd.pem",
        }))
        .expect("etcd config");
        assert_eq!(conf.urls, "https://127.0.0.1:2379");
    }
}
