use std::net::IpAddr;

use cni_plugin::reply::ErrorReply;
use semver::Version;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("missing required configuration field: {0}")]
    MissingField(&'static str),

    #[error("etcd request failed: {context}")]
    Kv {
        context: String,
        #[source]
        error: etcd_client::Error,
    },

    #[error("could not determine release stage from CNI args {args:?}")]
    StageMissing { args: String },

    #[error("{ip} is not in any configured range")]
    OutOfRange { ip: IpAddr },

    #[error("{ip} has already been allocated to container {container}, duplicate allocation is not allowed")]
    DuplicateAllocation { ip: IpAddr, container: String },

    #[error("requested IP {ip} is not available: {reason}")]
    AddressUnavailable { ip: IpAddr, reason: &'static str },

    #[error("no IP addresses available in range set")]
    NoAddresses,

    #[error("link error: {0}")]
    Link(String),

    #[error("netlink request failed: {context}")]
    Netlink {
        context: String,
        #[source]
        error: rtnetlink::Error,
    },

    #[error("i/o error: {context}")]
    Io {
        context: String,
        #[source]
        error: std::io::Error,
    },

    #[error("system error: {context}")]
    System {
        context: String,
        #[source]
        error: nix::Error,
    },

    #[error("namespace error: {context}")]
    Namespace {
        context: String,
        #[source]
        error: std::io::Error,
    },

    #[error("{0}")]
    NotFound(String),
}

impl Error {
    /// Map this error onto the CNI error reply the runtime expects.
    /// Codes below 100 are reserved by the CNI spec; config problems use the
    /// well-known "invalid network config" code, everything else is custom.
    pub fn into_reply(self, cni_version: Version) -> ErrorReply<'static> {
        let (code, msg) = match &self {
            Error::Config(_) | Error::MissingField(_) => (7, "invalid network config"),
            Error::Kv { .. } => (100, "etcd unavailable"),
            Error::StageMissing { .. } => (101, "release stage missing"),
            Error::OutOfRange { .. } => (102, "address out of range"),
            Error::DuplicateAllocation { .. } => (103, "duplicate allocation"),
            Error::AddressUnavailable { .. } => (104, "address unavailable"),
            Error::NoAddresses => (105, "no addresses available"),
            Error::Link(_) | Error::Netlink { .. } => (106, "netlink failure"),
            Error::Namespace { .. } => (107, "namespace failure"),
            Error::Io { .. } | Error::System { .. } => (108, "system failure"),
            Error::NotFound(_) => (109, "not found"),
        };

        ErrorReply {
            cni_version,
            code,
            msg,
            details: self.to_string(),
        }
    }
}
