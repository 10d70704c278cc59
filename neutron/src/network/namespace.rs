//! Utilities for dealing with Linux network namespaces
//!
//! The runtime hands us the path of an existing namespace (a bind-mounted
//! file under /var/run/netns or a /proc/<pid>/ns/net entry); we never create
//! one. Entering uses the same save/setns/restore approach as
//! https://git.kernel.org/pub/scm/network/iproute2/iproute2.git/tree/ip/ipnetns.c.
//!
//! Namespace membership is a per-thread property. The plugin runs its whole
//! command on a current-thread tokio runtime, so every await inside
//! [`NetNs::run`] is polled by the thread that called `setns` and the
//! closure can never observe the wrong namespace.

use std::fs::{File, OpenOptions};
use std::future::Future;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsFd, AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use nix::sched::{setns, CloneFlags};

use crate::error::{Error, Result};

/// An open handle on a target network namespace.
pub struct NetNs {
    file: File,
    path: PathBuf,
}

/// RAII guard for restoring a network namespace. When this is dropped, it
/// switches back using [`setns`]. If this fails, the implementation panics
/// because we cannot meaningfully recover from being in the wrong network
/// namespace.
struct NamespaceGuard(File);

impl NetNs {
    pub fn open(path: &Path) -> Result<NetNs> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(nix::libc::O_CLOEXEC)
            .open(path)
            .map_err(|error| Error::Namespace {
                context: format!("could not open network namespace {}", path.display()),
                error,
            })?;
        Ok(NetNs {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File descriptor for netlink requests that take a target namespace.
    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Run a future inside the namespace, restoring the previous namespace
    /// afterwards. Sockets created by `f` belong to the target namespace;
    /// sockets created before entry are unaffected.
    pub async fn run<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _guard = NamespaceGuard::enter(self)?;
        f().await
    }
}

impl NamespaceGuard {
    /// Save the current network namespace and switch to `target`.
    fn enter(target: &NetNs) -> Result<NamespaceGuard> {
        let saved = OpenOptions::new()
            .read(true)
            .custom_flags(nix::libc::O_CLOEXEC)
            .open("/proc/self/ns/net")
            .map_err(|error| Error::Namespace {
                context: "could not open current network namespace".into(),
                error,
            })?;

        setns(target.file.as_fd(), CloneFlags::CLONE_NEWNET).map_err(|error| Error::System {
            context: format!(
                "could not enter network namespace {}",
                target.path.display()
            ),
            error,
        })?;

        Ok(NamespaceGuard(saved))
    }
}

impl Drop for NamespaceGuard {
    fn drop(&mut self) {
        setns(self.0.as_fd(), CloneFlags::CLONE_NEWNET)
            .expect("could not restore network namespace!")
    }
}
