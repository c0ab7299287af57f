//! Remote stop endpoint of a worker process
//!
//! The control server listens on an OS-assigned port and treats every
//! accepted connection as one stop request: the payload is never read and
//! nothing is written back. There is no authentication; the port is only
//! announced over the worker's own event stream and lives as long as the
//! worker process.

use crate::cancel::StopSignal;
use crate::error::Result;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Handle to a running control server.
///
/// Dropping the handle leaves the server running until process exit; call
/// [`ControlServer::shutdown`] to stop it explicitly.
pub struct ControlServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl ControlServer {
    /// Bind an ephemeral port on all IPv4 interfaces and start serving
    pub fn spawn(signal: Arc<dyn StopSignal>) -> Result<Self> {
        Self::spawn_on(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)), signal)
    }

    /// Bind an ephemeral port on all interfaces of `peer`'s address family.
    ///
    /// The IDE reaches the control server at the address the event
    /// connection came from, so both must share a family.
    pub fn spawn_for(peer: IpAddr, signal: Arc<dyn StopSignal>) -> Result<Self> {
        let any = match peer {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        Self::spawn_on(SocketAddr::new(any, 0), signal)
    }

    /// Bind `addr` and start serving.
    ///
    /// The socket is bound and listening before this returns, so the port
    /// can be announced right away.
    pub fn spawn_on(addr: SocketAddr, signal: Arc<dyn StopSignal>) -> Result<Self> {
        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();

        let thread = std::thread::Builder::new()
            .name("relay-control".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    match TcpListener::from_std(listener) {
                        Ok(listener) => accept_loop(listener, signal, token).await,
                        Err(e) => warn!("Control server could not register listener: {}", e),
                    }
                });
            })?;

        info!("Control server listening on {}", local_addr);

        Ok(Self {
            local_addr,
            shutdown,
            thread: Some(thread),
        })
    }

    /// Port assigned by the OS
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and wait for the server thread to exit
    pub fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Control server thread panicked");
            }
        }
        debug!("Control server on {} stopped", self.local_addr);
    }
}

impl std::fmt::Debug for ControlServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlServer")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

async fn accept_loop(
    listener: TcpListener,
    signal: Arc<dyn StopSignal>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    drop(stream);
                    info!("Stop requested by {}", peer);
                    raise(signal.as_ref());
                }
                Err(e) => {
                    warn!("Failed to accept control connection: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }
}

/// Raise the signal, swallowing refusals
fn raise(signal: &dyn StopSignal) {
    if let Err(e) = signal.raise() {
        debug!("Stop request ignored: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationFlag;
    use crate::error::RelayError;
    use std::net::TcpStream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    fn loopback(server: &ControlServer) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, server.port()))
    }

    #[test]
    fn test_connection_raises_signal() {
        let flag = CancellationFlag::new();
        let server = ControlServer::spawn(Arc::new(flag.clone())).unwrap();
        assert_ne!(server.port(), 0);

        drop(TcpStream::connect(loopback(&server)).unwrap());

        assert!(wait_until(|| flag.is_cancelled()));
        assert_eq!(flag.raise_attempts(), 1);
        server.shutdown();
    }

    #[test]
    fn test_payload_is_ignored() {
        use std::io::Write;

        let flag = CancellationFlag::new();
        let server = ControlServer::spawn(Arc::new(flag.clone())).unwrap();

        let mut stream = TcpStream::connect(loopback(&server)).unwrap();
        let _ = stream.write_all(b"please keep running");
        drop(stream);

        assert!(wait_until(|| flag.raise_attempts() == 1));
        assert!(flag.is_cancelled());
        server.shutdown();
    }

    #[test]
    fn test_failing_signal_does_not_stop_server() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let signal = move || -> crate::error::Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(RelayError::NotCancellable("no run in progress".to_string()))
        };
        let server = ControlServer::spawn(Arc::new(signal)).unwrap();

        drop(TcpStream::connect(loopback(&server)).unwrap());
        assert!(wait_until(|| calls.load(Ordering::SeqCst) == 1));

        drop(TcpStream::connect(loopback(&server)).unwrap());
        assert!(wait_until(|| calls.load(Ordering::SeqCst) == 2));

        server.shutdown();
    }

    #[test]
    fn test_spawn_for_matches_address_family() {
        let flag = CancellationFlag::new();

        let v4 = ControlServer::spawn_for(Ipv4Addr::LOCALHOST.into(), Arc::new(flag.clone()))
            .unwrap();
        assert!(v4.local_addr().is_ipv4());
        v4.shutdown();

        // Hosts without IPv6 cannot bind `[::]`
        let Ok(v6) = ControlServer::spawn_for(Ipv6Addr::LOCALHOST.into(), Arc::new(flag.clone()))
        else {
            return;
        };
        assert!(v6.local_addr().is_ipv6());

        let addr = SocketAddr::from((Ipv6Addr::LOCALHOST, v6.port()));
        drop(TcpStream::connect(addr).unwrap());
        assert!(wait_until(|| flag.is_cancelled()));
        v6.shutdown();
    }

    #[test]
    fn test_shutdown_releases_port() {
        let flag = CancellationFlag::new();
        let server = ControlServer::spawn(Arc::new(flag.clone())).unwrap();
        let addr = loopback(&server);
        server.shutdown();

        assert!(TcpStream::connect(addr).is_err());
        assert_eq!(flag.raise_attempts(), 0);
    }
}
