//! Name resolution into an ordered candidate list with failover.
//!
//! Resolution is blocking and happens at admission time (and again after a
//! redirect); a job that cannot resolve fails before it ever holds a slot,
//! so the pause never stalls an in-flight connection for long.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

use crate::error::FetchError;

/// Ordered connect candidates, consumed front to back.
#[derive(Debug, Clone)]
pub struct AddrList {
    addrs: Vec<SocketAddr>,
    next: usize,
}

impl AddrList {
    pub fn from_addrs(addrs: Vec<SocketAddr>) -> Self {
        Self { addrs, next: 0 }
    }

    /// Next untried candidate, or `None` when the list is exhausted.
    pub fn next(&mut self) -> Option<SocketAddr> {
        let addr = self.addrs.get(self.next).copied();
        if addr.is_some() {
            self.next += 1;
        }
        addr
    }
}

/// Resolve `host:port` to connect candidates. Zero results is an error even
/// when the lookup itself nominally succeeded.
pub fn resolve(host: &str, port: u16) -> Result<AddrList, FetchError> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|source| FetchError::Resolve {
            host: host.to_string(),
            source,
        })?
        .collect();
    if addrs.is_empty() {
        return Err(FetchError::Resolve {
            host: host.to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "no addresses returned"),
        });
    }
    tracing::debug!(host, count = addrs.len(), "resolved");
    Ok(AddrList::from_addrs(addrs))
}
