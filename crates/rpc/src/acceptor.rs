//! Acceptor pools: blocking-accept threads feeding the messenger.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::TransportError;
use crate::messenger::Messenger;

/// Ports below this bound usually require elevated privileges to bind.
const PRIVILEGED_PORT_BOUND: u16 = 1024;

/// Whether binding `port` usually requires elevated privileges. Port 0 is
/// an ephemeral-port request, not a privileged bind.
pub fn is_privileged_port(port: u16) -> bool {
    port != 0 && port < PRIVILEGED_PORT_BOUND
}

/// One or more threads blocking on accept for a single bound address, each
/// handing new connections to the messenger for reactor assignment.
pub struct AcceptorPool {
    listener: TcpListener,
    bound_address: SocketAddr,
    threads: Mutex<Vec<JoinHandle<()>>>,
    shutting_down: Arc<AtomicBool>,
}

impl AcceptorPool {
    /// Bind a listening socket for `addr`.
    ///
    /// Binding a privileged port is permitted but logged as a warning; the
    /// operator may have elevated privileges via other means.
    pub(crate) fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        if is_privileged_port(addr.port()) {
            warn!("may be unable to bind to privileged port for address {addr}");
        }
        let listener = TcpListener::bind(addr).map_err(|source| TransportError::Bind {
            addr,
            source,
        })?;
        let bound_address = listener.local_addr()?;
        info!("accepting connections on {bound_address}");
        Ok(Self {
            listener,
            bound_address,
            threads: Mutex::new(Vec::new()),
            shutting_down: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The concrete address the listener ended up bound to, with any
    /// wildcard port resolved.
    pub fn bound_address(&self) -> SocketAddr {
        self.bound_address
    }

    /// Start `num_threads` acceptor threads feeding `messenger`.
    pub(crate) fn start(
        &self,
        num_threads: usize,
        messenger: &Arc<Messenger>,
    ) -> Result<(), TransportError> {
        assert!(num_threads > 0, "acceptor thread count must be positive");
        let mut threads = self.threads.lock();
        for i in 0..num_threads {
            let listener = self.listener.try_clone()?;
            let messenger = Arc::downgrade(messenger);
            let shutting_down = Arc::clone(&self.shutting_down);
            let handle = thread::Builder::new()
                .name(format!("acceptor-{}-{i}", self.bound_address))
                .spawn(move || {
                    accept_loop(&listener, &messenger, &shutting_down);
                })?;
            threads.push(handle);
        }
        Ok(())
    }

    /// Stop accepting and join the acceptor threads. Idempotent.
    pub(crate) fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let threads = std::mem::take(&mut *self.threads.lock());
        // Each thread is parked in a blocking accept; a loopback connection
        // per thread unblocks them.
        let wake = wake_address(self.bound_address);
        for _ in &threads {
            let _ = TcpStream::connect_timeout(&wake, Duration::from_millis(100));
        }
        let current = thread::current().id();
        for handle in threads {
            // Shutdown can run from whichever thread drops the last
            // messenger reference; never join that thread onto itself.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("acceptor thread for {} panicked", self.bound_address);
            }
        }
        debug!("acceptor pool for {} stopped", self.bound_address);
    }
}

fn accept_loop(
    listener: &TcpListener,
    messenger: &std::sync::Weak<Messenger>,
    shutting_down: &AtomicBool,
) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                if shutting_down.load(Ordering::SeqCst) {
                    return;
                }
                let Some(messenger) = messenger.upgrade() else {
                    return;
                };
                debug!(%peer, "accepted connection");
                if let Err(e) = stream.set_nonblocking(true) {
                    warn!(%peer, "failed to set accepted socket non-blocking: {e}");
                    continue;
                }
                messenger.assign_inbound(stream, peer);
            }
            Err(e) => {
                if shutting_down.load(Ordering::SeqCst) {
                    return;
                }
                warn!("accept failed: {e}");
                thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

/// An address a wake connection can actually reach: wildcard binds map to
/// the loopback of the same family.
fn wake_address(bound: SocketAddr) -> SocketAddr {
    let ip = match bound.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    SocketAddr::new(ip, bound.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_privileged_port_bound() {
        assert!(is_privileged_port(80));
        assert!(is_privileged_port(1023));
        assert!(!is_privileged_port(1024));
        assert!(!is_privileged_port(7150));
        assert!(!is_privileged_port(0));
    }

    #[test]
    fn test_wake_address_maps_wildcard_to_loopback() {
        let wake = wake_address("0.0.0.0:7150".parse().unwrap());
        assert_eq!(wake, "127.0.0.1:7150".parse().unwrap());

        let wake = wake_address("127.0.0.1:7150".parse().unwrap());
        assert_eq!(wake, "127.0.0.1:7150".parse().unwrap());
    }
}
