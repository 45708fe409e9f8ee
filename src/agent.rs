//! ICE agent: gathers candidates, picks a pair, proves the path with the HELLO
//! handshake and then carries application datagrams over it.
//!
//! Gathering (and the TURN allocation it may perform) blocks for bounded
//! periods. Everything after `start_connectivity_checks()` is driven by
//! `tick()` and never blocks.
//!
//! Pair selection: the best direct pair
//! (host/server-reflexive) is tried up to `MAX_DIRECT_ATTEMPTS` times, then
//! the best relayed pair, within an overall budget of `MAX_TOTAL_ATTEMPTS`.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::candidate::{select_best, Candidate, CandidateType};
use crate::config::IceConfig;
use crate::gather::Gatherer;
use crate::handshake::{Handshake, HandshakeStatus, HelloKind, HelloPacket};
use crate::state::{ConnectionState, StateHandle};
use crate::transport::{Network, Socket, SystemNetwork};
use crate::turn::{RequestKind, TurnClient, TurnEvent, CHANNEL_MIN};

/// Attempts on the direct pair before falling back to the relay.
pub const MAX_DIRECT_ATTEMPTS: u32 = 3;

/// Attempts across both pair kinds before giving up.
pub const MAX_TOTAL_ATTEMPTS: u32 = 5;

/// Channel bound to the remote relayed address.
const RELAY_CHANNEL: u16 = CHANNEL_MIN;

const RECV_BUFFER_SIZE: usize = 2048;

type CandidatesCallback = Box<dyn FnMut(&[Candidate]) + Send>;
type RemoteCandidateCallback = Box<dyn FnMut(&Candidate) + Send>;

/// How datagrams reach the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    /// Straight from our own socket.
    Direct,
    /// ChannelData through our TURN allocation.
    Relay,
}

/// The candidate pair currently being tried or in use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedPath {
    pub kind: PathKind,
    pub local: Candidate,
    pub remote: Candidate,
    pub remote_addr: SocketAddr,
}

pub struct IceAgent {
    config: IceConfig,
    network: Arc<dyn Network>,
    state: StateHandle,

    local_candidates: Vec<Candidate>,
    remote_candidates: Vec<Candidate>,

    turn: Option<TurnClient>,
    /// Socket of the current direct attempt.
    socket: Option<Box<dyn Socket>>,
    path: Option<SelectedPath>,
    handshake: Option<Handshake>,

    direct_attempts: u32,
    total_attempts: u32,

    inbound: VecDeque<Vec<u8>>,
    started: Instant,

    on_local_candidates_ready: Option<CandidatesCallback>,
    on_remote_candidate: Option<RemoteCandidateCallback>,
}

impl IceAgent {
    pub fn new(config: IceConfig, network: Arc<dyn Network>) -> Self {
        Self {
            config,
            network,
            state: StateHandle::new(),
            local_candidates: Vec::new(),
            remote_candidates: Vec::new(),
            turn: None,
            socket: None,
            path: None,
            handshake: None,
            direct_attempts: 0,
            total_attempts: 0,
            inbound: VecDeque::new(),
            started: Instant::now(),
            on_local_candidates_ready: None,
            on_remote_candidate: None,
        }
    }

    /// Agent on the host's real UDP stack.
    pub fn with_system_network(config: IceConfig) -> Self {
        Self::new(config, Arc::new(SystemNetwork))
    }

    // ---- Observers ----

    pub fn on_state_changed(&self, f: impl Fn(ConnectionState) + Send + Sync + 'static) {
        self.state.subscribe(f);
    }

    /// Called once per successful `gather_candidates()`; forward these to the
    /// peer over your signaling channel.
    pub fn on_local_candidates_ready(&mut self, f: impl FnMut(&[Candidate]) + Send + 'static) {
        self.on_local_candidates_ready = Some(Box::new(f));
    }

    pub fn on_remote_candidate(&mut self, f: impl FnMut(&Candidate) + Send + 'static) {
        self.on_remote_candidate = Some(Box::new(f));
    }

    // ---- Accessors ----

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// A handle other threads can read the state through.
    pub fn state_handle(&self) -> StateHandle {
        self.state.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.get() == ConnectionState::Connected
    }

    pub fn local_candidates(&self) -> &[Candidate] {
        &self.local_candidates
    }

    pub fn remote_candidates(&self) -> &[Candidate] {
        &self.remote_candidates
    }

    pub fn selected_path(&self) -> Option<&SelectedPath> {
        self.path.as_ref()
    }

    // ---- Gathering ----

    /// Gather host, server-reflexive and relayed candidates. Blocks for at
    /// most one STUN/TURN timeout per configured server.
    ///
    /// Drops the current path, if any; checks must be started again.
    /// Returns false (and moves to `Failed`) if nothing at all was gathered.
    pub fn gather_candidates(&mut self) -> bool {
        if let Some(mut previous) = self.turn.take() {
            previous.deallocate();
        }
        // Any pair in use was built from the candidates about to be replaced.
        self.socket = None;
        self.path = None;
        self.handshake = None;
        self.inbound.clear();
        self.direct_attempts = 0;
        self.total_attempts = 0;
        self.state.set(ConnectionState::Gathering);

        let gathered = Gatherer::new(self.network.as_ref(), &self.config).gather();
        self.local_candidates = gathered.candidates;
        self.turn = gathered.turn;

        if self.local_candidates.is_empty() {
            tracing::warn!("Candidate gathering produced nothing");
            self.state.set(ConnectionState::Failed);
            return false;
        }
        if let Some(callback) = self.on_local_candidates_ready.as_mut() {
            callback(&self.local_candidates);
        }
        true
    }

    /// Record a candidate received from the peer. Zero-value (unparseable)
    /// candidates are ignored.
    pub fn add_remote_candidate(&mut self, candidate: Candidate) {
        if !candidate.is_valid() {
            tracing::debug!("Ignoring invalid remote candidate");
            return;
        }
        tracing::debug!("Remote candidate: {}", candidate);
        if let Some(callback) = self.on_remote_candidate.as_mut() {
            callback(&candidate);
        }
        self.remote_candidates.push(candidate);
    }

    // ---- Connectivity ----

    /// Start (or keep) checking connectivity. A no-op returning true while
    /// checks are running or once connected.
    pub fn start_connectivity_checks(&mut self) -> bool {
        match self.state.get() {
            ConnectionState::Connected => {
                tracing::debug!("Already connected");
                return true;
            }
            ConnectionState::ConnectingDirect
            | ConnectionState::ConnectingRelay
            | ConnectionState::PerformingHandshake => return true,
            _ => {}
        }
        self.direct_attempts = 0;
        self.total_attempts = 0;
        self.begin_attempt()
    }

    /// Advance timers and process everything that arrived since the last call.
    pub fn tick(&mut self, dt: Duration) {
        self.poll_turn(dt);
        self.poll_direct();

        if self.state.get() != ConnectionState::PerformingHandshake {
            return;
        }
        let Some(status) = self.handshake.as_mut().map(|hs| hs.tick(dt)) else {
            return;
        };
        match status {
            HandshakeStatus::Pending => {}
            HandshakeStatus::SendRequest => self.send_hello_request(),
            HandshakeStatus::Complete => {
                self.handshake = None;
                if let Some(path) = &self.path {
                    tracing::info!(
                        "ICE connected via {:?} path to {}",
                        path.kind,
                        path.remote_addr
                    );
                }
                self.state.set(ConnectionState::Connected);
            }
            HandshakeStatus::TimedOut => {
                tracing::warn!("Handshake timed out (attempt {})", self.total_attempts);
                self.attempt_failed();
            }
        }
    }

    /// Send one datagram to the peer. False unless connected and the send
    /// went out.
    pub fn send(&mut self, data: &[u8]) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.send_on_path(data)
    }

    /// Next application datagram from the peer, truncated to `buf`.
    pub fn receive(&mut self, buf: &mut [u8]) -> Option<usize> {
        self.poll_turn(Duration::ZERO);
        self.poll_direct();
        let data = self.inbound.pop_front()?;
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Some(len)
    }

    /// Tear everything down and return to `New`.
    pub fn close(&mut self) {
        if let Some(mut turn) = self.turn.take() {
            turn.deallocate();
        }
        self.socket = None;
        self.path = None;
        self.handshake = None;
        self.inbound.clear();
        self.local_candidates.clear();
        self.remote_candidates.clear();
        self.direct_attempts = 0;
        self.total_attempts = 0;
        self.state.set(ConnectionState::New);
        tracing::debug!("ICE agent closed");
    }

    // ---- Attempts ----

    fn begin_attempt(&mut self) -> bool {
        self.socket = None;
        self.handshake = None;
        self.path = None;

        if self.total_attempts >= MAX_TOTAL_ATTEMPTS {
            return self.fail("connectivity attempt budget exhausted");
        }

        if self.direct_attempts < MAX_DIRECT_ATTEMPTS {
            if let Some((local, remote)) = self.select_pair(CandidateType::is_direct) {
                self.direct_attempts += 1;
                self.total_attempts += 1;
                self.state.set(ConnectionState::ConnectingDirect);
                return self.open_direct(local, remote);
            }
        }

        if let Some((local, remote)) = self.select_pair(|t| t == CandidateType::Relayed) {
            self.total_attempts += 1;
            self.state.set(ConnectionState::ConnectingRelay);
            return self.open_relay(local, remote);
        }

        if self.direct_attempts > 0 {
            self.fail("direct attempts exhausted and no relayed pair")
        } else {
            self.fail("no eligible candidate pair")
        }
    }

    fn attempt_failed(&mut self) {
        self.begin_attempt();
    }

    fn fail(&mut self, reason: &str) -> bool {
        tracing::warn!("ICE failed: {}", reason);
        self.socket = None;
        self.handshake = None;
        self.state.set(ConnectionState::Failed);
        false
    }

    fn select_pair(&self, eligible: fn(CandidateType) -> bool) -> Option<(Candidate, Candidate)> {
        let local = select_best(&self.local_candidates, eligible)?;
        let remote = select_best(&self.remote_candidates, eligible)?;
        Some((local.clone(), remote.clone()))
    }

    fn remote_addr(&self, remote: &Candidate) -> Option<SocketAddr> {
        remote.socket_addr().or_else(|| {
            self.network
                .resolve(&format!("{}:{}", remote.address, remote.port))
                .ok()
        })
    }

    fn open_direct(&mut self, local: Candidate, remote: Candidate) -> bool {
        let Some(remote_addr) = self.remote_addr(&remote) else {
            return self.fail("remote candidate address does not resolve");
        };

        let bind_addr = match local.candidate_type {
            CandidateType::Host => match local.socket_addr() {
                Some(addr) => addr,
                None => return self.fail("host candidate address is not an IP"),
            },
            _ => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        };
        let socket = match self.network.bind(bind_addr) {
            Ok(socket) => socket,
            Err(e) => {
                tracing::warn!("Bind {} failed: {}", bind_addr, e);
                return self.fail("socket bind failed");
            }
        };

        let mut local = local;
        if local.port == 0 {
            if let Ok(bound) = socket.local_addr() {
                local.port = bound.port();
                if let Some(c) = self
                    .local_candidates
                    .iter_mut()
                    .find(|c| c.candidate_type == local.candidate_type && c.port == 0)
                {
                    c.port = bound.port();
                }
            }
        }

        tracing::debug!(
            "Direct attempt {}: {}:{} -> {}",
            self.direct_attempts,
            local.address,
            local.port,
            remote_addr
        );
        self.socket = Some(socket);
        self.path = Some(SelectedPath {
            kind: PathKind::Direct,
            local,
            remote,
            remote_addr,
        });
        self.start_handshake();
        true
    }

    fn open_relay(&mut self, local: Candidate, remote: Candidate) -> bool {
        let Some(remote_addr) = self.remote_addr(&remote) else {
            return self.fail("remote relayed address does not resolve");
        };
        let Some(turn) = self.turn.as_mut().filter(|t| t.is_active()) else {
            return self.fail("no active TURN allocation");
        };

        let bound = turn.channel_for(remote_addr).is_some();
        if !bound {
            let requested = turn
                .request_permission(remote_addr)
                .and_then(|_| turn.request_channel_bind(remote_addr, RELAY_CHANNEL));
            if let Err(e) = requested {
                tracing::warn!("Relay setup failed: {:#}", e);
                turn.cancel_requests(remote_addr);
                self.attempt_failed();
                return self.state.get() != ConnectionState::Failed;
            }
        }

        tracing::debug!("Relay attempt via {} -> {}", local.address, remote_addr);
        self.path = Some(SelectedPath {
            kind: PathKind::Relay,
            local,
            remote,
            remote_addr,
        });
        if bound {
            self.start_handshake();
        }
        true
    }

    fn start_handshake(&mut self) {
        self.handshake = Some(Handshake::new());
        self.state.set(ConnectionState::PerformingHandshake);
        self.send_hello_request();
    }

    fn send_hello_request(&mut self) {
        let packet = HelloPacket::request(self.now_ms()).encode();
        let sent = self.send_on_path(&packet);
        if let Some(hs) = self.handshake.as_mut() {
            if sent {
                hs.mark_sent();
            } else {
                tracing::debug!("HELLO request could not be sent");
                hs.mark_send_failed();
            }
        }
    }

    fn send_on_path(&mut self, data: &[u8]) -> bool {
        let Some(path) = &self.path else {
            return false;
        };
        let result = match path.kind {
            PathKind::Direct => match &self.socket {
                Some(socket) => socket
                    .send_to(data, path.remote_addr)
                    .map(|_| ())
                    .map_err(anyhow::Error::from),
                None => return false,
            },
            PathKind::Relay => match &self.turn {
                Some(turn) => turn.send_channel_data(data),
                None => return false,
            },
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Send to {} failed: {:#}", path.remote_addr, e);
                false
            }
        }
    }

    fn now_ms(&self) -> u32 {
        self.started.elapsed().as_millis() as u32
    }

    // ---- Inbound ----

    fn poll_turn(&mut self, dt: Duration) {
        let Some(turn) = self.turn.as_mut() else {
            return;
        };
        turn.tick(dt);
        let mut payloads = Vec::new();
        while let Some(received) = turn.recv() {
            payloads.push(received);
        }
        let events = turn.take_events();

        // Events in this batch were produced before any attempt started here.
        let attempt = self.total_attempts;
        for event in events {
            if self.total_attempts != attempt && is_relay_setup_event(&event) {
                tracing::debug!("Ignoring TURN event from an earlier attempt: {:?}", event);
                continue;
            }
            self.handle_turn_event(event);
        }
        for (peer, payload) in payloads {
            let on_path = self
                .path
                .as_ref()
                .is_some_and(|p| p.kind == PathKind::Relay && p.remote_addr == peer);
            if on_path {
                self.handle_packet(&payload);
            } else {
                tracing::debug!("Dropping relayed datagram from {}", peer);
            }
        }
    }

    fn poll_direct(&mut self) {
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        loop {
            let Some(socket) = &self.socket else {
                return;
            };
            let (len, from) = match socket.try_recv_from(&mut buf) {
                Ok(Some(received)) => received,
                Ok(None) => return,
                Err(e) => {
                    tracing::debug!("Direct recv error: {}", e);
                    return;
                }
            };
            if self.path.as_ref().map(|p| p.remote_addr) != Some(from) {
                tracing::debug!("Dropping datagram from unexpected {}", from);
                continue;
            }
            self.handle_packet(&buf[..len]);
        }
    }

    fn handle_packet(&mut self, data: &[u8]) {
        if let Some(hello) = HelloPacket::decode(data) {
            let now = self.now_ms();
            let reply = match self.handshake.as_mut() {
                Some(hs) => hs.on_packet(hello, now),
                // Late request after we finished: the peer still needs a reply.
                None if hello.kind == HelloKind::Request => Some(HelloPacket::response(now)),
                None => None,
            };
            tracing::debug!("HELLO {:?} (peer ts {})", hello.kind, hello.timestamp);
            if let Some(reply) = reply {
                self.send_on_path(&reply.encode());
            }
            return;
        }

        if self.is_connected() {
            self.inbound.push_back(data.to_vec());
        } else {
            tracing::debug!("Dropping {}-byte datagram before connection", data.len());
        }
    }

    fn awaiting_relay(&self, peer: SocketAddr) -> bool {
        self.state.get() == ConnectionState::ConnectingRelay
            && self
                .path
                .as_ref()
                .is_some_and(|p| p.kind == PathKind::Relay && p.remote_addr == peer)
    }

    fn handle_turn_event(&mut self, event: TurnEvent) {
        match event {
            TurnEvent::ChannelBound { peer, .. } if self.awaiting_relay(peer) => {
                self.start_handshake();
            }
            TurnEvent::RequestFailed {
                kind: RequestKind::Permission(peer) | RequestKind::ChannelBind { peer, .. },
                reason,
            } if self.awaiting_relay(peer) => {
                tracing::warn!("Relay setup to {} failed: {}", peer, reason);
                // The other request of the pair belongs to the failed attempt.
                if let Some(turn) = self.turn.as_mut() {
                    turn.cancel_requests(peer);
                }
                self.attempt_failed();
            }
            TurnEvent::Deactivated
                if self
                    .path
                    .as_ref()
                    .is_some_and(|p| p.kind == PathKind::Relay) =>
            {
                if self.is_connected() {
                    self.fail("TURN allocation lost");
                } else {
                    self.attempt_failed();
                }
            }
            other => tracing::debug!("TURN event: {:?}", other),
        }
    }
}

fn is_relay_setup_event(event: &TurnEvent) -> bool {
    matches!(
        event,
        TurnEvent::PermissionCreated(_)
            | TurnEvent::ChannelBound { .. }
            | TurnEvent::RequestFailed {
                kind: RequestKind::Permission(_) | RequestKind::ChannelBind { .. },
                ..
            }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Mutex;

    use crate::transport::memory::MemoryNetwork;
    use crate::turn::mock::{self, MockTurn, RequestLog};
    use crate::turn::{CHANNEL_BIND_REQUEST, CREATE_PERMISSION_REQUEST};

    const STEP: Duration = Duration::from_millis(100);
    const TURN_ADDR: &str = "198.51.100.20:3478";
    const REMOTE_RELAY: &str = "candidate:3 1 UDP 16777215 203.0.113.99 50000 typ relay";

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    /// One host on a shared network, with its own interface address.
    struct Host {
        net: MemoryNetwork,
        ip: IpAddr,
    }

    impl Network for Host {
        fn bind(&self, addr: SocketAddr) -> io::Result<Box<dyn Socket>> {
            let addr = if addr.ip().is_unspecified() {
                SocketAddr::new(self.ip, addr.port())
            } else {
                addr
            };
            self.net.bind(addr)
        }

        fn resolve(&self, host_port: &str) -> io::Result<SocketAddr> {
            self.net.resolve(host_port)
        }

        fn primary_ip(&self) -> io::Result<IpAddr> {
            Ok(self.ip)
        }
    }

    /// The host's real UDP stack, with loopback as the interface address.
    struct Loopback;

    impl Network for Loopback {
        fn bind(&self, addr: SocketAddr) -> io::Result<Box<dyn Socket>> {
            SystemNetwork.bind(addr)
        }

        fn resolve(&self, host_port: &str) -> io::Result<SocketAddr> {
            SystemNetwork.resolve(host_port)
        }

        fn primary_ip(&self) -> io::Result<IpAddr> {
            Ok(IpAddr::V4(Ipv4Addr::LOCALHOST))
        }
    }

    fn free_loopback_port() -> u16 {
        std::net::UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn record_states(agent: &IceAgent) -> Arc<Mutex<Vec<ConnectionState>>> {
        let states = Arc::new(Mutex::new(Vec::new()));
        let sink = states.clone();
        agent.on_state_changed(move |s| sink.lock().unwrap().push(s));
        states
    }

    fn relay_config() -> IceConfig {
        IceConfig {
            stun_servers: Vec::new(),
            turn_servers: vec![format!("turn:{}", TURN_ADDR)],
            turn_username: Some("alice".into()),
            turn_credential: Some("secret".into()),
            host_port: 0,
        }
    }

    fn relay_agent(cfg: MockTurn) -> (MemoryNetwork, IceAgent, RequestLog) {
        let net = MemoryNetwork::new("10.0.0.2".parse().unwrap());
        let log = mock::serve(&net, TURN_ADDR.parse().unwrap(), cfg);
        let agent = IceAgent::new(relay_config(), Arc::new(net.clone()));
        (net, agent, log)
    }

    fn count(log: &RequestLog, msg_type: u16) -> usize {
        log.lock().unwrap().iter().filter(|(t, _)| *t == msg_type).count()
    }

    fn tick_until(agent: &mut IceAgent, step: Duration, max_ticks: usize, done: ConnectionState) {
        for _ in 0..max_ticks {
            if agent.state() == done {
                return;
            }
            agent.tick(step);
        }
    }

    #[test]
    fn test_no_candidates_fails_without_traffic() {
        init_tracing();
        let net = MemoryNetwork::new("10.0.0.2".parse().unwrap());
        let mut agent = IceAgent::new(IceConfig::default(), Arc::new(net.clone()));

        assert!(!agent.start_connectivity_checks());
        assert_eq!(agent.state(), ConnectionState::Failed);
        assert_eq!(net.packets_sent(), 0);
    }

    #[test]
    fn test_relay_only_pair_skips_direct_state() {
        init_tracing();
        let (_net, mut agent, log) = relay_agent(MockTurn {
            echo_hello: true,
            ..MockTurn::default()
        });
        let states = record_states(&agent);

        let ready = Arc::new(Mutex::new(0));
        let sink = ready.clone();
        agent.on_local_candidates_ready(move |c| *sink.lock().unwrap() = c.len());

        assert!(agent.gather_candidates());
        assert_eq!(*ready.lock().unwrap(), 2);
        agent.add_remote_candidate(Candidate::from_string(REMOTE_RELAY));

        assert!(agent.start_connectivity_checks());
        assert_eq!(agent.state(), ConnectionState::ConnectingRelay);
        tick_until(&mut agent, STEP, 50, ConnectionState::Connected);

        assert!(agent.is_connected());
        assert_eq!(
            *states.lock().unwrap(),
            vec![
                ConnectionState::Gathering,
                ConnectionState::ConnectingRelay,
                ConnectionState::PerformingHandshake,
                ConnectionState::Connected,
            ]
        );
        let path = agent.selected_path().unwrap();
        assert_eq!(path.kind, PathKind::Relay);
        assert_eq!(path.remote_addr, "203.0.113.99:50000".parse().unwrap());
        assert_eq!(count(&log, CREATE_PERMISSION_REQUEST), 1);
        assert_eq!(count(&log, CHANNEL_BIND_REQUEST), 1);
        assert!(agent.send(b"over the relay"));
    }

    #[test]
    fn test_direct_falls_back_to_relay() {
        init_tracing();
        let (net, mut agent, _log) = relay_agent(MockTurn {
            echo_hello: true,
            ..MockTurn::default()
        });
        let states = record_states(&agent);
        let silent_peer: SocketAddr = "192.168.77.5:6000".parse().unwrap();

        assert!(agent.gather_candidates());
        agent.add_remote_candidate(Candidate::from_string(
            "candidate:1 1 UDP 2130706431 192.168.77.5 6000 typ host",
        ));
        agent.add_remote_candidate(Candidate::from_string(REMOTE_RELAY));

        assert!(agent.start_connectivity_checks());
        assert_eq!(agent.state(), ConnectionState::PerformingHandshake);
        tick_until(&mut agent, Duration::from_secs(1), 40, ConnectionState::Connected);

        assert!(agent.is_connected());
        assert_eq!(agent.selected_path().unwrap().kind, PathKind::Relay);
        // Five HELLO requests per direct attempt, three attempts.
        assert_eq!(net.packets_sent_to(silent_peer), 15);

        let states = states.lock().unwrap();
        let direct = states
            .iter()
            .filter(|s| **s == ConnectionState::ConnectingDirect)
            .count();
        assert_eq!(direct, MAX_DIRECT_ATTEMPTS as usize);
        assert_eq!(states.last(), Some(&ConnectionState::Connected));
    }

    #[test]
    fn test_attempt_budget_exhausted() {
        init_tracing();
        let (_net, mut agent, log) = relay_agent(MockTurn::default());
        assert!(agent.gather_candidates());
        agent.add_remote_candidate(Candidate::from_string(REMOTE_RELAY));

        let states = record_states(&agent);
        assert!(agent.start_connectivity_checks());
        tick_until(&mut agent, Duration::from_secs(1), 60, ConnectionState::Failed);

        assert_eq!(agent.state(), ConnectionState::Failed);
        let relay_attempts = states
            .lock()
            .unwrap()
            .iter()
            .filter(|s| **s == ConnectionState::ConnectingRelay)
            .count();
        assert_eq!(relay_attempts, MAX_TOTAL_ATTEMPTS as usize);
        // The channel binding is reused across attempts.
        assert_eq!(count(&log, CHANNEL_BIND_REQUEST), 1);
    }

    #[test]
    fn test_rejected_relay_setup_costs_one_attempt() {
        init_tracing();
        let (_net, mut agent, log) = relay_agent(MockTurn {
            reject_relay_setup: true,
            ..MockTurn::default()
        });
        assert!(agent.gather_candidates());
        agent.add_remote_candidate(Candidate::from_string(REMOTE_RELAY));

        assert!(agent.start_connectivity_checks());
        assert_eq!(agent.total_attempts, 1);
        assert_eq!(count(&log, CREATE_PERMISSION_REQUEST), 1);

        // Both requests of a round are rejected together; each round is
        // evaluated on its own answers and starts exactly one new attempt.
        for round in 2..=MAX_TOTAL_ATTEMPTS {
            agent.tick(STEP);
            assert_eq!(agent.state(), ConnectionState::ConnectingRelay);
            assert_eq!(agent.total_attempts, round);
            assert_eq!(count(&log, CREATE_PERMISSION_REQUEST), round as usize);
            assert_eq!(count(&log, CHANNEL_BIND_REQUEST), round as usize);
        }

        agent.tick(STEP);
        assert_eq!(agent.state(), ConnectionState::Failed);
        assert_eq!(count(&log, CREATE_PERMISSION_REQUEST), MAX_TOTAL_ATTEMPTS as usize);

        // Nothing left over from earlier rounds.
        agent.tick(Duration::from_secs(10));
        assert_eq!(agent.state(), ConnectionState::Failed);
    }

    #[test]
    fn test_regather_drops_connected_path() {
        init_tracing();
        let (_net, mut agent, log) = relay_agent(MockTurn {
            echo_hello: true,
            ..MockTurn::default()
        });
        assert!(agent.gather_candidates());
        agent.add_remote_candidate(Candidate::from_string(REMOTE_RELAY));
        assert!(agent.start_connectivity_checks());
        tick_until(&mut agent, STEP, 50, ConnectionState::Connected);
        assert!(agent.is_connected());

        assert!(agent.gather_candidates());
        assert_eq!(agent.state(), ConnectionState::Gathering);
        assert!(agent.selected_path().is_none());
        assert!(!agent.send(b"stale path"));
        assert_eq!(agent.remote_candidates().len(), 1);

        assert!(agent.start_connectivity_checks());
        tick_until(&mut agent, STEP, 50, ConnectionState::Connected);
        assert!(agent.is_connected());
        // The new allocation needs its own channel.
        assert_eq!(count(&log, CHANNEL_BIND_REQUEST), 2);
    }

    #[test]
    fn test_bind_failure_fails() {
        init_tracing();
        let net = MemoryNetwork::new("10.0.0.2".parse().unwrap());
        let config = IceConfig {
            stun_servers: Vec::new(),
            ..IceConfig::default()
        };
        let mut agent = IceAgent::new(config, Arc::new(net.clone()));
        assert!(agent.gather_candidates());
        agent.add_remote_candidate(Candidate::from_string(
            "candidate:1 1 UDP 2130706431 10.0.0.3 6000 typ host",
        ));

        net.set_bind_failure(true);
        assert!(!agent.start_connectivity_checks());
        assert_eq!(agent.state(), ConnectionState::Failed);
        assert!(agent.selected_path().is_none());
    }

    #[test]
    fn test_direct_session_with_scripted_peer() {
        init_tracing();
        let net = MemoryNetwork::new("10.0.0.2".parse().unwrap());
        let peer_addr: SocketAddr = "10.0.0.3:6000".parse().unwrap();
        let peer = net.bind(peer_addr).unwrap();

        let config = IceConfig {
            stun_servers: Vec::new(),
            ..IceConfig::default()
        };
        let mut agent = IceAgent::new(config, Arc::new(net.clone()));
        assert!(agent.gather_candidates());
        assert_eq!(agent.local_candidates()[0].port, 0);
        agent.add_remote_candidate(Candidate::from_string(
            "candidate:1 1 UDP 2130706431 10.0.0.3 6000 typ host",
        ));
        assert!(agent.start_connectivity_checks());

        // Ephemeral port backfilled into the host candidate.
        let local = agent.local_candidates()[0].socket_addr().unwrap();
        assert_ne!(local.port(), 0);
        assert_eq!(agent.selected_path().unwrap().local.port, local.port());

        let mut buf = [0u8; 64];
        let (len, from) = peer.try_recv_from(&mut buf).unwrap().unwrap();
        assert_eq!(from, local);
        assert_eq!(HelloPacket::decode(&buf[..len]).unwrap().kind, HelloKind::Request);

        peer.send_to(&HelloPacket::response(1).encode(), local).unwrap();
        agent.tick(STEP);
        assert!(agent.is_connected());
        assert!(agent.start_connectivity_checks());
        assert!(agent.is_connected());

        // A late request is still answered.
        peer.send_to(&HelloPacket::request(2).encode(), local).unwrap();
        agent.tick(STEP);
        let (len, _) = peer.try_recv_from(&mut buf).unwrap().unwrap();
        assert_eq!(HelloPacket::decode(&buf[..len]).unwrap().kind, HelloKind::Response);

        peer.send_to(b"from peer", local).unwrap();
        let n = agent.receive(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"from peer");
        assert!(agent.receive(&mut buf).is_none());

        assert!(agent.send(b"to peer"));
        let (len, _) = peer.try_recv_from(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..len], b"to peer");
    }

    #[test]
    fn test_two_agents_connect_over_host_candidates() {
        init_tracing();
        let net = MemoryNetwork::new("192.168.1.10".parse().unwrap());
        let config_a = IceConfig {
            stun_servers: Vec::new(),
            host_port: 5000,
            ..IceConfig::default()
        };
        let config_b = IceConfig {
            host_port: 5001,
            ..config_a.clone()
        };
        let mut a = IceAgent::new(
            config_a,
            Arc::new(Host {
                net: net.clone(),
                ip: "192.168.1.10".parse().unwrap(),
            }),
        );
        let mut b = IceAgent::new(
            config_b,
            Arc::new(Host {
                net: net.clone(),
                ip: "192.168.1.11".parse().unwrap(),
            }),
        );

        assert!(a.gather_candidates());
        assert!(b.gather_candidates());
        assert_eq!(
            a.local_candidates()[0].to_string(),
            "candidate:1 1 UDP 2130706431 192.168.1.10 5000 typ host"
        );
        assert_eq!(
            b.local_candidates()[0].to_string(),
            "candidate:1 1 UDP 2130706431 192.168.1.11 5001 typ host"
        );

        // Signaling: candidate strings cross over as text.
        let a_line = a.local_candidates()[0].to_string();
        let b_line = b.local_candidates()[0].to_string();
        a.add_remote_candidate(Candidate::from_string(&b_line));
        b.add_remote_candidate(Candidate::from_string(&a_line));

        assert!(a.start_connectivity_checks());
        assert!(b.start_connectivity_checks());
        for _ in 0..30 {
            if a.is_connected() && b.is_connected() {
                break;
            }
            a.tick(STEP);
            b.tick(STEP);
        }
        assert!(a.is_connected());
        assert!(b.is_connected());

        assert!(a.send(b"hello b"));
        let mut buf = [0u8; 32];
        let n = b.receive(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello b");
    }

    #[test]
    fn test_two_agents_connect_over_loopback_sockets() {
        init_tracing();
        let config = IceConfig {
            stun_servers: Vec::new(),
            ..IceConfig::default()
        };
        let mut a = IceAgent::new(
            IceConfig {
                host_port: free_loopback_port(),
                ..config.clone()
            },
            Arc::new(Loopback),
        );
        let mut b = IceAgent::new(
            IceConfig {
                host_port: free_loopback_port(),
                ..config
            },
            Arc::new(Loopback),
        );

        assert!(a.gather_candidates());
        assert!(b.gather_candidates());
        assert_eq!(a.local_candidates()[0].address, "127.0.0.1");

        let a_line = a.local_candidates()[0].to_string();
        let b_line = b.local_candidates()[0].to_string();
        a.add_remote_candidate(Candidate::from_string(&b_line));
        b.add_remote_candidate(Candidate::from_string(&a_line));

        assert!(a.start_connectivity_checks());
        assert!(b.start_connectivity_checks());
        for _ in 0..200 {
            if a.is_connected() && b.is_connected() {
                break;
            }
            a.tick(Duration::from_millis(10));
            b.tick(Duration::from_millis(10));
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(a.is_connected());
        assert!(b.is_connected());
        assert_eq!(a.selected_path().unwrap().kind, PathKind::Direct);

        assert!(b.send(b"over loopback"));
        let mut buf = [0u8; 32];
        let mut received = None;
        for _ in 0..100 {
            received = a.receive(&mut buf);
            if received.is_some() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(&buf[..received.unwrap()], b"over loopback");
    }

    #[test]
    fn test_close_resets_everything() {
        init_tracing();
        let (_net, mut agent, log) = relay_agent(MockTurn {
            echo_hello: true,
            ..MockTurn::default()
        });
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        agent.on_remote_candidate(move |c| sink.lock().unwrap().push(c.to_string()));

        assert!(agent.gather_candidates());
        agent.add_remote_candidate(Candidate::from_string(REMOTE_RELAY));
        agent.add_remote_candidate(Candidate::from_string("garbage"));
        assert_eq!(*seen.lock().unwrap(), vec![REMOTE_RELAY.to_string()]);
        assert_eq!(agent.remote_candidates().len(), 1);

        assert!(agent.start_connectivity_checks());
        tick_until(&mut agent, STEP, 50, ConnectionState::Connected);
        assert!(agent.is_connected());

        let handle = agent.state_handle();
        agent.close();
        assert_eq!(handle.get(), ConnectionState::New);
        assert!(agent.local_candidates().is_empty());
        assert!(agent.remote_candidates().is_empty());
        assert!(agent.selected_path().is_none());
        assert!(!agent.send(b"x"));
        // Released with a zero-lifetime Refresh.
        assert_eq!(log.lock().unwrap().last(), Some(&(crate::turn::REFRESH_REQUEST, Some(0))));
    }
}
