//! Network reachability checks

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use log::debug;

/// Synchronous, side-effect free connectivity check.
pub trait Reachability: Send + Sync {
    fn is_reachable(&self) -> bool;
}

impl<F> Reachability for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_reachable(&self) -> bool {
        self()
    }
}

pub const DEFAULT_PROBE: &str = "1.1.1.1:443";
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(1500);

/// Considers the network reachable when a TCP connection to `target` succeeds.
#[derive(Clone, Debug)]
pub struct TcpProbe {
    target: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn addresses(&self) -> Vec<SocketAddr> {
        match self.target.to_socket_addrs() {
            Ok(addrs) => addrs.collect(),
            Err(e) => {
                debug!("Cannot resolve reachability probe {}: {e}", self.target);
                Vec::new()
            }
        }
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE)
    }
}

impl Reachability for TcpProbe {
    fn is_reachable(&self) -> bool {
        self.addresses()
            .iter()
            .any(|addr| TcpStream::connect_timeout(addr, self.timeout).is_ok())
    }
}
