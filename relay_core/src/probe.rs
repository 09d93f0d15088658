//! Bounded-time reachability check.

use relay_traits::Probe;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

/// TCP connect to a fixed endpoint. Any failure, including name resolution,
/// reads as unreachable.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    target: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(target: impl Into<String>, timeout: Duration) -> Self {
        Self {
            target: target.into(),
            timeout,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

impl Probe for TcpProbe {
    fn reachable(&self) -> bool {
        let addr = match self.target.to_socket_addrs().map(|mut a| a.next()) {
            Ok(Some(a)) => a,
            Ok(None) => return false,
            Err(e) => {
                tracing::trace!(target = %self.target, error = %e, "probe resolution failed");
                return false;
            }
        };
        match TcpStream::connect_timeout(&addr, self.timeout) {
            Ok(_) => true,
            Err(e) => {
                tracing::trace!(%addr, error = %e, "probe connect failed");
                false
            }
        }
    }
}
