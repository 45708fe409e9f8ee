//! UDP socket abstraction.
//!
//! Protocol code talks to [`Network`] and [`Socket`] so the same STUN/TURN/ICE
//! logic runs over real sockets ([`SystemNetwork`]) or the scripted
//! in-memory network in [`memory`].

pub mod memory;

use std::io::{self, ErrorKind};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Type};

/// A bound UDP endpoint.
pub trait Socket: Send {
    fn local_addr(&self) -> io::Result<SocketAddr>;

    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;

    /// Non-blocking receive. `Ok(None)` when nothing is queued.
    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;

    /// Blocking receive bounded by `timeout`. `Ok(None)` on timeout.
    fn recv_timeout(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> io::Result<Option<(usize, SocketAddr)>>;
}

/// Factory for sockets plus the two host lookups gathering needs.
pub trait Network: Send + Sync {
    /// Bind a UDP socket. Port 0 asks for an ephemeral port.
    fn bind(&self, addr: SocketAddr) -> io::Result<Box<dyn Socket>>;

    /// Resolve a `host:port` string.
    fn resolve(&self, host_port: &str) -> io::Result<SocketAddr>;

    /// Address of the interface that carries the default route.
    fn primary_ip(&self) -> io::Result<IpAddr>;
}

// ---------------------------------------------------------------------------
// OS sockets
// ---------------------------------------------------------------------------

/// Real UDP sockets: non-blocking, `SO_REUSEADDR`, ICMP errors suppressed.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemNetwork;

/// A socket created by [`SystemNetwork`].
#[derive(Debug)]
pub struct SystemSocket {
    inner: UdpSocket,
}

/// Errors an unconnected UDP socket surfaces after an ICMP port-unreachable.
/// They say nothing about this socket's health.
fn is_icmp_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionReset | ErrorKind::ConnectionRefused
    )
}

impl Network for SystemNetwork {
    fn bind(&self, addr: SocketAddr) -> io::Result<Box<dyn Socket>> {
        let socket = socket2::Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.set_nonblocking(true)?;

        let inner: UdpSocket = socket.into();
        tracing::debug!("Bound UDP socket on {:?}", inner.local_addr());
        Ok(Box::new(SystemSocket { inner }))
    }

    fn resolve(&self, host_port: &str) -> io::Result<SocketAddr> {
        let addrs: Vec<SocketAddr> = host_port.to_socket_addrs()?.collect();
        addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| io::Error::new(ErrorKind::NotFound, format!("no address for {}", host_port)))
    }

    fn primary_ip(&self) -> io::Result<IpAddr> {
        // "Connect" a UDP socket to a public address; no packet is sent, but
        // the kernel picks the outbound interface.
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        Ok(socket.local_addr()?.ip())
    }
}

impl Socket for SystemSocket {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        match self.inner.send_to(buf, target) {
            // Non-blocking send buffer full: the datagram is lost like any other.
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
            other => other,
        }
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        loop {
            match self.inner.recv_from(buf) {
                Ok(received) => return Ok(Some(received)),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(e) if is_icmp_error(&e) => {
                    tracing::debug!("Ignoring ICMP-induced recv error: {}", e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn recv_timeout(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> io::Result<Option<(usize, SocketAddr)>> {
        let deadline = Instant::now() + timeout;
        self.inner.set_nonblocking(false)?;

        let result = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break Ok(None);
            }
            if let Err(e) = self.inner.set_read_timeout(Some(remaining)) {
                break Err(e);
            }
            match self.inner.recv_from(buf) {
                Ok(received) => break Ok(Some(received)),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    break Ok(None)
                }
                Err(e) if is_icmp_error(&e) => {
                    tracing::debug!("Ignoring ICMP-induced recv error: {}", e);
                }
                Err(e) => break Err(e),
            }
        };

        self.inner.set_nonblocking(true)?;
        result
    }
}
