//! Cluster-wide allocation state.
//!
//! Every service's reservations are individual etcd keys; a coarse advisory
//! lock per service serializes allocators across hosts. The lock is
//! lease-backed: a holder that dies without unlocking is expired by etcd
//! after the lease TTL.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, Compare, CompareOp, GetOptions, PutOptions, Txn, TxnOp};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::etcd::{endpoints_key, last_reserved_key, lock_key};

const LOCK_TTL_SECONDS: i64 = 60;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(100);

/// The operations the allocator needs from the coordination service.
#[async_trait]
pub trait Store {
    /// Take the service-wide advisory lock, waiting until it is free.
    async fn lock(&mut self) -> Result<()>;

    /// Drop the advisory lock. Missing lock entry is not an error.
    async fn unlock(&mut self) -> Result<()>;

    /// Claim `ip` for a container. `Ok(false)` means the address is already
    /// taken (the caller should move on); transport failures are `Err`.
    async fn reserve(&mut self, id: &str, ifname: &str, ip: IpAddr, range_id: &str)
        -> Result<bool>;

    /// The most recently reserved IP in the given range, if any. A hint
    /// only: Reserve's two writes are not atomic.
    async fn last_reserved_ip(&mut self, range_id: &str) -> Result<Option<IpAddr>>;

    /// Forget a reservation by address. Missing key is not an error.
    async fn release(&mut self, ip: IpAddr) -> Result<()>;

    /// Forget every reservation held by a container.
    async fn release_by_id(&mut self, id: &str, ifname: &str) -> Result<()>;

    /// All addresses currently held by a container.
    async fn get_by_id(&mut self, id: &str, ifname: &str) -> Result<Vec<IpAddr>>;

    async fn find_by_id(&mut self, id: &str, ifname: &str) -> Result<bool>;

    /// Membership in the endpoint snapshot taken at construction.
    fn is_ip_reserved(&self, ip: IpAddr) -> bool;
}

/// etcd-backed [`Store`]. One instance per plugin invocation; it owns its
/// client handle and a read-only snapshot of the service's endpoints.
pub struct EtcdStore {
    client: Client,
    endpoints: Vec<IpAddr>,
    hostname: String,
    service: String,
    pod_name: String,
}

impl EtcdStore {
    pub async fn new(client: Client, service: &str, pod_name: &str) -> Result<Self> {
        let hostname = nix::unistd::gethostname()
            .map_err(|error| Error::System {
                context: "could not read the local hostname".into(),
                error,
            })?
            .to_string_lossy()
            .into_owned();

        let mut store = EtcdStore {
            client,
            endpoints: Vec::new(),
            hostname,
            service: service.to_string(),
            pod_name: pod_name.to_string(),
        };
        store.endpoints = store.get_all_endpoints().await?;
        Ok(store)
    }

    /// Every address currently reserved for the service, parsed from the
    /// trailing path segment of each endpoint key.
    async fn get_all_endpoints(&mut self) -> Result<Vec<IpAddr>> {
        let prefix = endpoints_key(&self.service);
        let resp = self
            .client
            .get(prefix.as_str(), Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|error| Error::Kv {
                context: format!("could not list endpoints under {}", prefix),
                error,
            })?;

        let mut endpoints = Vec::new();
        for kv in resp.kvs() {
            let key = kv.key_str().map_err(|error| Error::Kv {
                context: format!("malformed endpoint key under {}", prefix),
                error,
            })?;
            match key.rsplit('/').next().and_then(|ip| ip.parse().ok()) {
                Some(ip) => endpoints.push(ip),
                None => warn!(key = %key, "skipping endpoint key without an IP literal"),
            }
        }
        Ok(endpoints)
    }

    fn endpoint_key(&self, ip: IpAddr) -> String {
        format!("{}/{}", endpoints_key(&self.service), ip)
    }

    fn cursor_key(&self, range_id: &str) -> String {
        format!("{}/{}", last_reserved_key(&self.service), range_id)
    }
}

#[async_trait]
impl Store for EtcdStore {
    async fn lock(&mut self) -> Result<()> {
        let key = lock_key(&self.service);
        loop {
            let lease = self
                .client
                .lease_grant(LOCK_TTL_SECONDS, None)
                .await
                .map_err(|error| Error::Kv {
                    context: "could not grant a lock lease".into(),
                    error,
                })?;

            // Classic lease-backed mutex: the put only happens if the lock
            // key has never been created (or has expired since).
            let txn = Txn::new()
                .when(vec![Compare::create_revision(
                    key.as_str(),
                    CompareOp::Equal,
                    0,
                )])
                .and_then(vec![TxnOp::put(
                    key.as_str(),
                    lease.id().to_string(),
                    Some(PutOptions::new().with_lease(lease.id())),
                )])
                .or_else(vec![TxnOp::get(key.as_str(), None)]);

            let resp = self.client.txn(txn).await.map_err(|error| Error::Kv {
                context: format!("lock transaction on {} failed", key),
                error,
            })?;
            if resp.succeeded() {
                debug!(key = %key, lease = lease.id(), "acquired service lock");
                return Ok(());
            }

            tokio::time::sleep(LOCK_RETRY_DELAY).await;
        }
    }

    async fn unlock(&mut self) -> Result<()> {
        let key = lock_key(&self.service);
        let resp = self.client.get(key.as_str(), None).await.map_err(|error| {
            Error::Kv {
                context: format!("could not read lock entry {}", key),
                error,
            }
        })?;

        let Some(kv) = resp.kvs().first() else {
            return Ok(());
        };
        let lease_id: i64 = kv
            .value_str()
            .ok()
            .and_then(|value| value.parse().ok())
            .ok_or_else(|| {
                Error::Config(format!("lock entry {} holds a malformed lease id", key))
            })?;

        // Best effort: if the revoke is lost, the lease TTL releases the
        // lock anyway.
        if let Err(error) = self.client.lease_revoke(lease_id).await {
            warn!(key = %key, lease = lease_id, %error, "lock lease revoke failed");
        }
        Ok(())
    }

    async fn reserve(
        &mut self,
        id: &str,
        _ifname: &str,
        ip: IpAddr,
        range_id: &str,
    ) -> Result<bool> {
        let key = self.endpoint_key(ip);
        let resp = self.client.get(key.as_str(), None).await.map_err(|error| {
            Error::Kv {
                context: format!("could not read endpoint {}", key),
                error,
            }
        })?;
        if !resp.kvs().is_empty() {
            return Ok(false);
        }

        let value = format!("{}:{}:{}", self.hostname, id, self.pod_name);
        self.client
            .put(key.as_str(), value, None)
            .await
            .map_err(|error| Error::Kv {
                context: format!("could not write endpoint {}", key),
                error,
            })?;

        // The cursor is a round-robin hint, never proof of ownership; it is
        // written outside any transaction and may lag the endpoint key.
        let cursor = self.cursor_key(range_id);
        self.client
            .put(cursor.as_str(), ip.to_string(), None)
            .await
            .map_err(|error| Error::Kv {
                context: format!("could not update cursor {}", cursor),
                error,
            })?;

        Ok(true)
    }

    async fn last_reserved_ip(&mut self, range_id: &str) -> Result<Option<IpAddr>> {
        let key = self.cursor_key(range_id);
        let resp = self.client.get(key.as_str(), None).await.map_err(|error| {
            Error::Kv {
                context: format!("could not read cursor {}", key),
                error,
            }
        })?;

        match resp.kvs().first() {
            None => Ok(None),
            Some(kv) => {
                let value = kv.value_str().map_err(|error| Error::Kv {
                    context: format!("cursor {} is not valid UTF-8", key),
                    error,
                })?;
                value.parse().map(Some).map_err(|_| {
                    Error::Config(format!("cursor {} holds a malformed IP {:?}", key, value))
                })
            }
        }
    }

    async fn release(&mut self, ip: IpAddr) -> Result<()> {
        let key = self.endpoint_key(ip);
        self.client
            .delete(key.as_str(), None)
            .await
            .map_err(|error| Error::Kv {
                context: format!("could not delete endpoint {}", key),
                error,
            })?;
        Ok(())
    }

    async fn release_by_id(&mut self, id: &str, _ifname: &str) -> Result<()> {
        let prefix = endpoints_key(&self.service);
        let resp = self
            .client
            .get(prefix.as_str(), Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|error| Error::Kv {
                context: format!("could not list endpoints under {}", prefix),
                error,
            })?;

        for kv in resp.kvs() {
            let Ok(value) = kv.value_str() else { continue };
            let fields: Vec<&str> = value.split(':').collect();
            if fields.len() == 3 && fields[1] == id {
                let key = kv.key_str().map_err(|error| Error::Kv {
                    context: format!("malformed endpoint key under {}", prefix),
                    error,
                })?;
                let key = key.to_string();
                self.client
                    .delete(key.as_str(), None)
                    .await
                    .map_err(|error| Error::Kv {
                        context: format!("could not delete endpoint {}", key),
                        error,
                    })?;
                debug!(key = %key, container = id, "released endpoint");
            }
        }
        Ok(())
    }

    async fn get_by_id(&mut self, id: &str, _ifname: &str) -> Result<Vec<IpAddr>> {
        let prefix = endpoints_key(&self.service);
        let resp = self
            .client
            .get(prefix.as_str(), Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|error| Error::Kv {
                context: format!("could not list endpoints under {}", prefix),
                error,
            })?;

        let mut result = Vec::new();
        for kv in resp.kvs() {
            let Ok(value) = kv.value_str() else { continue };
            let fields: Vec<&str> = value.split(':').collect();
            if fields.len() == 3 && fields[1] == id {
                let ip = kv
                    .key_str()
                    .ok()
                    .and_then(|key| key.rsplit('/').next())
                    .and_then(|ip| ip.parse().ok());
                if let Some(ip) = ip {
                    result.push(ip);
                    break;
                }
            }
        }
        Ok(result)
    }

    async fn find_by_id(&mut self, id: &str, ifname: &str) -> Result<bool> {
        Ok(!self.get_by_id(id, ifname).await?.is_empty())
    }

    fn is_ip_reserved(&self, ip: IpAddr) -> bool {
        self.endpoints.contains(&ip)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory stand-in enforcing the same single-key semantics etcd
    //! provides, for allocator tests.

    use std::collections::HashMap;
    use std::collections::HashSet;

    use super::*;

    #[derive(Default)]
    pub(crate) struct MemStore {
        pub endpoints: HashMap<IpAddr, String>,
        pub cursors: HashMap<String, IpAddr>,
        pub snapshot: HashSet<IpAddr>,
        pub locked: bool,
        pub lock_cycles: usize,
    }

    impl MemStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// A store whose construction-time snapshot already contains `ips`.
        pub fn with_snapshot(ips: &[IpAddr]) -> Self {
            MemStore {
                snapshot: ips.iter().copied().collect(),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl Store for MemStore {
        async fn lock(&mut self) -> Result<()> {
            assert!(!self.locked, "advisory lock taken twice");
            self.locked = true;
            self.lock_cycles += 1;
            Ok(())
        }

        async fn unlock(&mut self) -> Result<()> {
            assert!(self.locked, "unlock without lock");
            self.locked = false;
            Ok(())
        }

        async fn reserve(
            &mut self,
            id: &str,
            _ifname: &str,
            ip: IpAddr,
            range_id: &str,
        ) -> Result<bool> {
            assert!(self.locked, "reserve outside the lock");
            if self.endpoints.contains_key(&ip) {
                return Ok(false);
            }
            self.endpoints.insert(ip, format!("host:{}:pod", id));
            self.cursors.insert(range_id.to_string(), ip);
            Ok(true)
        }

        async fn last_reserved_ip(&mut self, range_id: &str) -> Result<Option<IpAddr>> {
            Ok(self.cursors.get(range_id).copied())
        }

        async fn release(&mut self, ip: IpAddr) -> Result<()> {
            self.endpoints.remove(&ip);
            Ok(())
        }

        async fn release_by_id(&mut self, id: &str, _ifname: &str) -> Result<()> {
            let marker = format!(":{}:", id);
            self.endpoints.retain(|_, value| !value.contains(&marker));
            Ok(())
        }

        async fn get_by_id(&mut self, id: &str, _ifname: &str) -> Result<Vec<IpAddr>> {
            let marker = format!(":{}:", id);
            Ok(self
                .endpoints
                .iter()
                .filter(|(_, value)| value.contains(&marker))
                .map(|(ip, _)| *ip)
                .take(1)
                .collect())
        }

        async fn find_by_id(&mut self, id: &str, ifname: &str) -> Result<bool> {
            Ok(!self.get_by_id(id, ifname).await?.is_empty())
        }

        fn is_ip_reserved(&self, ip: IpAddr) -> bool {
            self.snapshot.contains(&ip)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Exercises lock mutual exclusion against a real etcd. Run manually:
    /// `NEUTRON_TEST_ETCD=http://127.0.0.1:2379 cargo test -- --ignored`.
    #[tokio::test]
    #[ignore]
    async fn test_lock_mutual_exclusion() {
        let Ok(url) = std::env::var("NEUTRON_TEST_ETCD") else {
            panic!("NEUTRON_TEST_ETCD must point at an etcd endpoint");
        };
        let client = Client::connect([url.as_str()], None)
            .await
            .expect("etcd connect");

        let mut a = EtcdStore::new(client.clone(), "locktest", "locktest-1-sandbox-a")
            .await
            .expect("store a");
        let mut b = EtcdStore::new(client, "locktest", "locktest-1-sandbox-b")
            .await
            .expect("store b");

        a.lock().await.expect("first lock");

        // The second lock must not complete while the first is held.
        let contended = tokio::time::timeout(Duration::from_millis(500), b.lock()).await;
        assert!(contended.is_err(), "second lock acquired concurrently");

        a.unlock().await.expect("unlock");
        tokio::time::timeout(Duration::from_secs(5), b.lock())
            .await
            .expect("lock after release")
            .expect("lock result");
        b.unlock().await.expect("unlock b");
    }
}
