//! In-memory UDP network.
//!
//! Every socket bound on a [`MemoryNetwork`] gets a receive queue. Datagrams
//! sent to a bound address are queued there; datagrams sent to an address with
//! a registered handler are answered synchronously, which is how tests script
//! STUN and TURN servers. Anything else is dropped, like real UDP.

use std::collections::{HashMap, VecDeque};
use std::io::{self, ErrorKind};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{Network, Socket};

/// Scripted endpoint: receives `(datagram, from)` and returns the replies to
/// send back to `from`.
pub type Handler = Box<dyn FnMut(&[u8], SocketAddr) -> Vec<Vec<u8>> + Send>;

const FIRST_EPHEMERAL_PORT: u16 = 40000;

struct Inner {
    primary_ip: IpAddr,
    next_port: u16,
    queues: HashMap<SocketAddr, VecDeque<(SocketAddr, Vec<u8>)>>,
    handlers: HashMap<SocketAddr, Option<Handler>>,
    names: HashMap<String, SocketAddr>,
    sent: Vec<(SocketAddr, SocketAddr)>,
    fail_binds: bool,
}

/// Shared handle to one simulated network.
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<Inner>>,
}

/// A socket on a [`MemoryNetwork`]; unbinds on drop.
pub struct MemorySocket {
    network: MemoryNetwork,
    addr: SocketAddr,
}

impl MemoryNetwork {
    /// Create a network whose wildcard binds resolve to `primary_ip`.
    pub fn new(primary_ip: IpAddr) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                primary_ip,
                next_port: FIRST_EPHEMERAL_PORT,
                queues: HashMap::new(),
                handlers: HashMap::new(),
                names: HashMap::new(),
                sent: Vec::new(),
                fail_binds: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Answer every datagram sent to `addr` with `handler`.
    pub fn serve(
        &self,
        addr: SocketAddr,
        handler: impl FnMut(&[u8], SocketAddr) -> Vec<Vec<u8>> + Send + 'static,
    ) {
        self.lock().handlers.insert(addr, Some(Box::new(handler)));
    }

    /// Make `name` resolve to `addr`.
    pub fn add_host(&self, name: &str, addr: SocketAddr) {
        self.lock().names.insert(name.to_string(), addr);
    }

    /// When set, every subsequent bind fails with `AddrNotAvailable`.
    pub fn set_bind_failure(&self, fail: bool) {
        self.lock().fail_binds = fail;
    }

    /// Number of datagrams sent on this network so far.
    pub fn packets_sent(&self) -> usize {
        self.lock().sent.len()
    }

    /// Number of datagrams sent to `addr` so far.
    pub fn packets_sent_to(&self, addr: SocketAddr) -> usize {
        self.lock().sent.iter().filter(|(_, to)| *to == addr).count()
    }

    fn deliver(&self, from: SocketAddr, to: SocketAddr, data: &[u8]) {
        let handler = {
            let mut inner = self.lock();
            inner.sent.push((from, to));
            if !inner.handlers.contains_key(&to) {
                match inner.queues.get_mut(&to) {
                    Some(queue) => queue.push_back((from, data.to_vec())),
                    None => tracing::debug!("memory network: dropping datagram to {}", to),
                }
                return;
            }
            inner.handlers.get_mut(&to).and_then(Option::take)
        };

        // Re-entrant send from inside a handler is not supported; the slot
        // stays empty while the handler runs.
        let Some(mut handler) = handler else {
            return;
        };
        let replies = handler(data, from);

        let mut inner = self.lock();
        if let Some(slot) = inner.handlers.get_mut(&to) {
            *slot = Some(handler);
        }
        for reply in replies {
            inner.sent.push((to, from));
            if let Some(queue) = inner.queues.get_mut(&from) {
                queue.push_back((to, reply));
            }
        }
    }
}

impl Network for MemoryNetwork {
    fn bind(&self, addr: SocketAddr) -> io::Result<Box<dyn Socket>> {
        let mut inner = self.lock();
        if inner.fail_binds {
            return Err(io::Error::new(ErrorKind::AddrNotAvailable, "bind disabled"));
        }

        let ip = if addr.ip().is_unspecified() {
            inner.primary_ip
        } else {
            addr.ip()
        };
        let port = if addr.port() == 0 {
            let port = inner.next_port;
            inner.next_port = inner.next_port.wrapping_add(1).max(FIRST_EPHEMERAL_PORT);
            port
        } else {
            addr.port()
        };
        let bound = SocketAddr::new(ip, port);

        if inner.queues.contains_key(&bound) || inner.handlers.contains_key(&bound) {
            return Err(io::Error::new(ErrorKind::AddrInUse, bound.to_string()));
        }
        inner.queues.insert(bound, VecDeque::new());

        Ok(Box::new(MemorySocket {
            network: self.clone(),
            addr: bound,
        }))
    }

    fn resolve(&self, host_port: &str) -> io::Result<SocketAddr> {
        if let Some(addr) = self.lock().names.get(host_port) {
            return Ok(*addr);
        }
        host_port
            .parse()
            .map_err(|_| io::Error::new(ErrorKind::NotFound, format!("unknown host {}", host_port)))
    }

    fn primary_ip(&self) -> io::Result<IpAddr> {
        Ok(self.lock().primary_ip)
    }
}

impl Socket for MemorySocket {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }

    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.network.deliver(self.addr, target, buf);
        Ok(buf.len())
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let mut inner = self.network.lock();
        let Some((from, data)) = inner.queues.get_mut(&self.addr).and_then(|q| q.pop_front())
        else {
            return Ok(None);
        };
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok(Some((len, from)))
    }

    /// Replies from handlers are queued before `send_to` returns, so there is
    /// nothing to wait for: an empty queue is an immediate timeout.
    fn recv_timeout(
        &self,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> io::Result<Option<(usize, SocketAddr)>> {
        self.try_recv_from(buf)
    }
}

impl Drop for MemorySocket {
    fn drop(&mut self) {
        self.network.lock().queues.remove(&self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net() -> MemoryNetwork {
        MemoryNetwork::new("10.0.0.2".parse().unwrap())
    }

    #[test]
    fn test_wildcard_bind_uses_primary_ip_and_ephemeral_port() {
        let net = net();
        let s = net.bind("0.0.0.0:0".parse().unwrap()).unwrap();
        let addr = s.local_addr().unwrap();
        assert_eq!(addr.ip(), "10.0.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(addr.port(), FIRST_EPHEMERAL_PORT);
    }

    #[test]
    fn test_datagram_delivery_and_drop() {
        let net = net();
        let a = net.bind("10.0.0.2:5000".parse().unwrap()).unwrap();
        let b = net.bind("10.0.0.3:5001".parse().unwrap()).unwrap();

        a.send_to(b"hello", "10.0.0.3:5001".parse().unwrap()).unwrap();
        a.send_to(b"void", "10.0.0.9:1".parse().unwrap()).unwrap();

        let mut buf = [0u8; 32];
        let (len, from) = b.try_recv_from(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..len], b"hello");
        assert_eq!(from, "10.0.0.2:5000".parse().unwrap());
        assert!(b.try_recv_from(&mut buf).unwrap().is_none());
        assert_eq!(net.packets_sent(), 2);
    }

    #[test]
    fn test_double_bind_rejected_until_drop() {
        let net = net();
        let addr: SocketAddr = "10.0.0.2:5000".parse().unwrap();
        let first = net.bind(addr).unwrap();
        assert_eq!(net.bind(addr).err().map(|e| e.kind()), Some(ErrorKind::AddrInUse));
        drop(first);
        assert!(net.bind(addr).is_ok());
    }

    #[test]
    fn test_handler_replies_to_sender() {
        let net = net();
        let server: SocketAddr = "198.51.100.1:3478".parse().unwrap();
        net.serve(server, |data, _from| vec![data.iter().rev().copied().collect()]);
        net.add_host("stun.example.org:3478", server);

        let s = net.bind("0.0.0.0:0".parse().unwrap()).unwrap();
        let target = net.resolve("stun.example.org:3478").unwrap();
        s.send_to(&[1, 2, 3], target).unwrap();

        let mut buf = [0u8; 8];
        let (len, from) = s
            .recv_timeout(&mut buf, Duration::from_secs(1))
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], &[3, 2, 1]);
        assert_eq!(from, server);
        assert_eq!(net.packets_sent_to(server), 1);
    }

    #[test]
    fn test_bind_failure_switch() {
        let net = net();
        net.set_bind_failure(true);
        assert!(net.bind("0.0.0.0:0".parse().unwrap()).is_err());
    }
}
