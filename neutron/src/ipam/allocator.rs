//! The distributed IP allocator.
//!
//! One allocator per range set. `get` and `release` hold the service-wide
//! advisory lock for their full duration, so any two reservations for the
//! same service are serialized; the endpoint-key pre-check inside
//! [`Store::reserve`] is the authoritative admission test.

use std::net::IpAddr;

use cni_plugin::reply::Ip as IpReply;
use ipnetwork::IpNetwork;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::etcd::store::Store;
use crate::ipam::range::{canonical_ip, next_ip, Range, RangeSetExt};
use crate::util;

pub struct IpAllocator<'a> {
    rangeset: &'a [Range],
    /// Position of this range set within the IPAM configuration; keys the
    /// last-reserved cursor.
    range_id: String,
}

impl<'a> IpAllocator<'a> {
    pub fn new(rangeset: &'a [Range], id: usize) -> Self {
        IpAllocator {
            rangeset,
            range_id: id.to_string(),
        }
    }

    /// Allocate an address for a container, either the requested one or the
    /// next free address in round-robin order that matches the pod's
    /// release stage.
    pub async fn get<S: Store>(
        &self,
        store: &mut S,
        id: &str,
        ifname: &str,
        env_args: &str,
        requested: Option<IpAddr>,
    ) -> Result<IpReply> {
        store.lock().await?;
        let result = self.get_locked(store, id, ifname, env_args, requested).await;
        if let Err(error) = store.unlock().await {
            // The lease TTL will reap the lock; the allocation outcome wins.
            warn!(%error, "could not release the service lock");
        }
        result
    }

    async fn get_locked<S: Store>(
        &self,
        store: &mut S,
        id: &str,
        ifname: &str,
        env_args: &str,
        requested: Option<IpAddr>,
    ) -> Result<IpReply> {
        let stage = util::deploy_stage(env_args).ok_or_else(|| Error::StageMissing {
            args: env_args.to_string(),
        })?;

        if let Some(ip) = requested {
            let ip = canonical_ip(ip);
            let range = self.rangeset.range_for(ip)?;
            if ip == range.gw() {
                return Err(Error::AddressUnavailable {
                    ip,
                    reason: "it is the range gateway",
                });
            }
            if !store.reserve(id, ifname, ip, &self.range_id).await? {
                return Err(Error::AddressUnavailable {
                    ip,
                    reason: "it is already reserved",
                });
            }
            info!(container = id, %ip, "reserved requested address");
            return ip_reply(ip, range);
        }

        // The CNI spec forbids handing a container a second address from
        // the same range set.
        for allocated in store.get_by_id(id, ifname).await? {
            if self.rangeset.range_for(allocated).is_ok() {
                return Err(Error::DuplicateAllocation {
                    ip: allocated,
                    container: id.to_string(),
                });
            }
        }

        let cursor = store.last_reserved_ip(&self.range_id).await?;
        let mut iter = RangeIter::new(self.rangeset, cursor);

        loop {
            let Some(ip) = iter.next_ip() else {
                return Err(Error::NoAddresses);
            };
            let range = iter.current_range();

            if !stage_allows(&stage, ip, &range.sandbox) {
                continue;
            }
            if store.is_ip_reserved(ip) {
                continue;
            }
            if store.reserve(id, ifname, ip, &self.range_id).await? {
                info!(container = id, %ip, stage = %stage, "reserved address");
                return ip_reply(ip, range);
            }
            // Reserved by another host since the snapshot; keep walking.
        }
    }

    /// Clear every address held by the container, under the lock.
    pub async fn release<S: Store>(&self, store: &mut S, id: &str, ifname: &str) -> Result<()> {
        store.lock().await?;
        let result = store.release_by_id(id, ifname).await;
        if let Err(error) = store.unlock().await {
            warn!(%error, "could not release the service lock");
        }
        result
    }
}

/// Stage policy: sandbox pods allocate only from the range's sandbox list,
/// every other stage only from its complement.
fn stage_allows(stage: &str, ip: IpAddr, sandbox: &[IpAddr]) -> bool {
    let in_sandbox = sandbox.contains(&ip);
    if stage == "sandbox" {
        in_sandbox
    } else {
        !in_sandbox
    }
}

fn ip_reply(ip: IpAddr, range: &Range) -> Result<IpReply> {
    let address = IpNetwork::new(ip, range.subnet.prefix())
        .map_err(|_| Error::OutOfRange { ip })?;
    Ok(IpReply {
        address,
        gateway: Some(range.gw()),
        interface: Some(0),
    })
}

/// Round-robin cursor over a range set. An address is not handed out again
/// until the whole set has been traversed, so a crash-looping container
/// walks the entire pool instead of hammering one address.
pub struct RangeIter<'a> {
    rangeset: &'a [Range],
    range_idx: usize,
    cur: Option<IpAddr>,
    /// Where iteration began; seeing it again means the set is exhausted.
    start_ip: Option<IpAddr>,
    start_range: usize,
}

impl<'a> RangeIter<'a> {
    /// Start from the position after `last` when the cursor still points
    /// into the set, from the first range otherwise. A stale cursor only
    /// costs round-robin fairness for one allocation.
    pub fn new(rangeset: &'a [Range], last: Option<IpAddr>) -> Self {
        let mut iter = RangeIter {
            rangeset,
            range_idx: 0,
            cur: None,
            start_ip: None,
            start_range: 0,
        };
        if let Some(last) = last {
            if let Some(idx) = rangeset.iter().position(|r| r.contains(last)) {
                iter.range_idx = idx;
                iter.start_range = idx;
                // Advanced before first yield, so the first address
                // returned is the successor of the cursor.
                iter.cur = Some(last);
            }
        }
        iter
    }

    /// The next allocatable address, or `None` once the set has wrapped.
    /// Never yields a gateway.
    pub fn next_ip(&mut self) -> Option<IpAddr> {
        loop {
            let range = &self.rangeset[self.range_idx];
            let cur = match self.cur {
                None => {
                    let first = range.start();
                    self.cur = Some(first);
                    self.start_ip = Some(first);
                    if first == range.gw() {
                        continue;
                    }
                    return Some(first);
                }
                Some(cur) => cur,
            };

            let next = if cur == range.end() {
                self.range_idx = (self.range_idx + 1) % self.rangeset.len();
                self.rangeset[self.range_idx].start()
            } else {
                next_ip(cur)
            };
            self.cur = Some(next);

            match self.start_ip {
                None => self.start_ip = Some(next),
                Some(start) => {
                    if self.range_idx == self.start_range && next == start {
                        return None;
                    }
                }
            }

            if next == self.rangeset[self.range_idx].gw() {
                continue;
            }
            return Some(next);
        }
    }

    /// The range that produced the address most recently returned by
    /// [`next_ip`].
    pub fn current_range(&self) -> &'a Range {
        &self.rangeset[self.range_idx]
    }
}
