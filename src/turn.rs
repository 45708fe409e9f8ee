//! TURN relay client (RFC 5766).
//!
//! This module provides:
//! 1. `TurnClient::allocate()`: blocking Allocate with one long-term-credential
//!    retry after a 401
//! 2. CreatePermission / ChannelBind, both as blocking calls and as
//!    fire-and-forget requests whose responses are matched during `recv()`
//! 3. Automatic Refresh driven by `tick()`
//! 4. ChannelData egress and ChannelData / Data-indication ingress
//!
//! The allocation socket is created once and lives as long as the relay.

use std::collections::VecDeque;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};

use crate::auth;
use crate::stun::{
    self, generate_transaction_id, StunMessage, TransactionId, ATTR_NONCE, ATTR_REALM,
    ATTR_USERNAME, ATTR_XOR_MAPPED_ADDRESS,
};
use crate::transport::{Network, Socket};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// TURN message types (RFC 5766).
pub const ALLOCATE_REQUEST: u16 = 0x0003;
pub const ALLOCATE_RESPONSE: u16 = 0x0103;
pub const ALLOCATE_ERROR_RESPONSE: u16 = 0x0113;
pub const REFRESH_REQUEST: u16 = 0x0004;
pub const CREATE_PERMISSION_REQUEST: u16 = 0x0008;
pub const CHANNEL_BIND_REQUEST: u16 = 0x0009;
pub const DATA_INDICATION: u16 = 0x0017;

/// TURN attribute types.
pub const ATTR_CHANNEL_NUMBER: u16 = 0x000C;
pub const ATTR_LIFETIME: u16 = 0x000D;
pub const ATTR_XOR_PEER_ADDRESS: u16 = 0x0012;
pub const ATTR_DATA: u16 = 0x0013;
pub const ATTR_XOR_RELAYED_ADDRESS: u16 = 0x0016;
pub const ATTR_REQUESTED_TRANSPORT: u16 = 0x0019;

/// Transport protocol number for UDP.
const TRANSPORT_UDP: u8 = 17;

/// Class bits of a response; masking them off leaves the method.
const CLASS_MASK: u16 = 0x0110;

/// Lifetime assumed when a success response carries no LIFETIME.
pub const DEFAULT_LIFETIME: u32 = 600;

/// Timeout for every TURN transaction.
pub const TURN_TIMEOUT: Duration = Duration::from_secs(5);

/// Refresh once this share (in percent) of the lifetime has elapsed.
const REFRESH_PERCENT: u32 = 80;

/// After a failed refresh, try again this long before the normal deadline
/// would come round again.
const REFRESH_RETRY_MARGIN: Duration = Duration::from_secs(30);

/// Valid channel numbers.
pub const CHANNEL_MIN: u16 = 0x4000;
pub const CHANNEL_MAX: u16 = 0x7FFF;

const CHANNEL_DATA_HEADER_SIZE: usize = 4;

/// Default TURN port.
const DEFAULT_TURN_PORT: u16 = 3478;

// ---------------------------------------------------------------------------
// Server addressing
// ---------------------------------------------------------------------------

/// A single TURN server entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnServer {
    pub host: String,
    pub port: u16,
    pub transport: TurnTransport,
}

impl TurnServer {
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Transport for a TURN server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnTransport {
    Udp,
    Tcp,
    Tls,
}

/// Parse `turn:host:port?transport=udp`, `turns:host:port` or a bare
/// `host:port`.
pub fn parse_turn_url(url: &str) -> Option<TurnServer> {
    let url = url.trim();
    let (scheme, rest) = if let Some(rest) = url.strip_prefix("turns:") {
        (TurnTransport::Tls, rest)
    } else if let Some(rest) = url.strip_prefix("turn:") {
        (TurnTransport::Udp, rest)
    } else if !url.is_empty() && !url.contains("://") {
        (TurnTransport::Udp, url)
    } else {
        return None;
    };

    let (host_port, query) = rest.split_once('?').unwrap_or((rest, ""));
    let transport = if query.contains("transport=tcp") {
        TurnTransport::Tcp
    } else if query.contains("transport=tls") {
        TurnTransport::Tls
    } else {
        scheme
    };

    let (host, port) = match host_port.rsplit_once(':') {
        Some((h, p)) => (h.to_string(), p.parse().ok()?),
        None => (host_port.to_string(), DEFAULT_TURN_PORT),
    };
    if host.is_empty() {
        return None;
    }

    Some(TurnServer {
        host,
        port,
        transport,
    })
}

// ---------------------------------------------------------------------------
// Allocation state and events
// ---------------------------------------------------------------------------

/// A granted relay allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnAllocation {
    pub server_addr: SocketAddr,
    pub relay_addr: SocketAddr,
    /// Our address as the TURN server sees it, if reported.
    pub mapped_addr: Option<SocketAddr>,
    pub lifetime_seconds: u32,
    pub channel_number: Option<u16>,
    pub active: bool,
}

/// Kind of in-flight request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Permission(SocketAddr),
    ChannelBind { peer: SocketAddr, channel: u16 },
    Refresh { lifetime: u32 },
}

impl RequestKind {
    fn method(&self) -> u16 {
        match self {
            RequestKind::Permission(_) => CREATE_PERMISSION_REQUEST,
            RequestKind::ChannelBind { .. } => CHANNEL_BIND_REQUEST,
            RequestKind::Refresh { .. } => REFRESH_REQUEST,
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKind::Permission(peer) => write!(f, "CreatePermission({})", peer),
            RequestKind::ChannelBind { peer, channel } => {
                write!(f, "ChannelBind(0x{:04x} -> {})", channel, peer)
            }
            RequestKind::Refresh { lifetime } => write!(f, "Refresh({}s)", lifetime),
        }
    }
}

/// Outcome of a non-blocking request, surfaced by `take_events()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEvent {
    PermissionCreated(SocketAddr),
    ChannelBound { peer: SocketAddr, channel: u16 },
    Refreshed { lifetime: u32 },
    /// The allocation is gone (LIFETIME=0 or an error response to Refresh).
    Deactivated,
    RequestFailed { kind: RequestKind, reason: String },
}

struct PendingRequest {
    txn: TransactionId,
    kind: RequestKind,
    elapsed: Duration,
}

// ---------------------------------------------------------------------------
// TURN client
// ---------------------------------------------------------------------------

/// TURN client that communicates with a TURN server over UDP.
pub struct TurnClient {
    socket: Box<dyn Socket>,
    server_addr: SocketAddr,
    username: String,
    credential: String,
    /// Realm, nonce and derived key (populated after the 401 challenge).
    realm: Option<String>,
    nonce: Option<String>,
    key: Option<[u8; 16]>,
    allocation: Option<TurnAllocation>,
    channel_peer: Option<SocketAddr>,
    permissions: Vec<SocketAddr>,
    pending: Vec<PendingRequest>,
    events: VecDeque<TurnEvent>,
    since_refresh: Duration,
    timeout: Duration,
}

impl TurnClient {
    /// Wrap an already bound socket.
    pub fn new(
        socket: Box<dyn Socket>,
        server_addr: SocketAddr,
        username: &str,
        credential: &str,
    ) -> Self {
        TurnClient {
            socket,
            server_addr,
            username: username.to_string(),
            credential: credential.to_string(),
            realm: None,
            nonce: None,
            key: None,
            allocation: None,
            channel_peer: None,
            permissions: Vec::new(),
            pending: Vec::new(),
            events: VecDeque::new(),
            since_refresh: Duration::ZERO,
            timeout: TURN_TIMEOUT,
        }
    }

    /// Resolve `server` and bind the allocation socket on the wildcard address.
    pub fn connect(
        network: &dyn Network,
        server: &TurnServer,
        username: &str,
        credential: &str,
    ) -> Result<Self> {
        if server.transport != TurnTransport::Udp {
            bail!("TURN over {:?} is not supported", server.transport);
        }
        let server_addr = network
            .resolve(&server.host_port())
            .context("Failed to resolve TURN server")?;
        let socket = network
            .bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
            .context("Failed to bind TURN client socket")?;
        Ok(Self::new(socket, server_addr, username, credential))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The local address of the allocation socket.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().context("local_addr")
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn allocation(&self) -> Option<&TurnAllocation> {
        self.allocation.as_ref()
    }

    /// The allocated relay address, if any.
    pub fn relay_addr(&self) -> Option<SocketAddr> {
        self.allocation.as_ref().map(|a| a.relay_addr)
    }

    pub fn is_active(&self) -> bool {
        self.allocation.as_ref().is_some_and(|a| a.active)
    }

    pub fn has_permission(&self, peer: SocketAddr) -> bool {
        self.permissions.iter().any(|p| p.ip() == peer.ip())
    }

    /// Channel number bound to `peer`, if any.
    pub fn channel_for(&self, peer: SocketAddr) -> Option<u16> {
        if self.channel_peer != Some(peer) {
            return None;
        }
        self.allocation.as_ref().and_then(|a| a.channel_number)
    }

    /// Drain the outcomes of non-blocking requests.
    pub fn take_events(&mut self) -> Vec<TurnEvent> {
        self.events.drain(..).collect()
    }

    // -----------------------------------------------------------------------
    // Allocate
    // -----------------------------------------------------------------------

    /// Perform TURN Allocate (RFC 5766 section 6).
    ///
    /// The first request carries USERNAME only. A 401 carrying REALM and NONCE
    /// earns exactly one authenticated retry; anything else, including a
    /// second 401, is final.
    pub fn allocate(&mut self) -> Result<SocketAddr> {
        let txn1 = generate_transaction_id();
        let req1 = build_allocate_request(&txn1, &self.username, None);
        tracing::debug!("TURN Allocate -> {}", self.server_addr);

        let (realm, nonce) = match self
            .transact(&req1, &txn1)
            .context("TURN allocate failed (no response)")?
        {
            TurnResponse::AllocateSuccess {
                relay_addr,
                mapped_addr,
                lifetime,
            } => {
                tracing::info!("TURN allocated (no auth): {}", relay_addr);
                self.install_allocation(relay_addr, mapped_addr, lifetime);
                return Ok(relay_addr);
            }
            TurnResponse::Error {
                code: 401,
                realm: Some(realm),
                nonce: Some(nonce),
                ..
            } => (realm, nonce),
            TurnResponse::Error { code, reason, .. } => {
                bail!("TURN allocate rejected: {} {}", code, reason);
            }
            TurnResponse::Success { .. } => {
                bail!("Unexpected TURN response to initial allocate");
            }
        };
        tracing::debug!("TURN 401 received, realm={}", realm);

        let key = auth::derive_key(&self.username, &realm, &self.credential);
        let txn2 = generate_transaction_id();
        let mut req2 = build_allocate_request(
            &txn2,
            &self.username,
            Some((realm.as_str(), nonce.as_str())),
        );
        auth::sign(&mut req2, &key);
        self.realm = Some(realm);
        self.nonce = Some(nonce);
        self.key = Some(key);

        match self
            .transact(&req2, &txn2)
            .context("TURN allocate failed (auth, no response)")?
        {
            TurnResponse::AllocateSuccess {
                relay_addr,
                mapped_addr,
                lifetime,
            } => {
                tracing::info!(
                    "TURN allocated: relay={}, lifetime={}s",
                    relay_addr,
                    lifetime
                );
                self.install_allocation(relay_addr, mapped_addr, lifetime);
                Ok(relay_addr)
            }
            TurnResponse::Error { code, reason, .. } => {
                bail!("TURN allocate failed: {} {}", code, reason);
            }
            TurnResponse::Success { .. } => {
                bail!("Unexpected TURN allocate response");
            }
        }
    }

    fn install_allocation(
        &mut self,
        relay_addr: SocketAddr,
        mapped_addr: Option<SocketAddr>,
        lifetime: u32,
    ) {
        self.allocation = Some(TurnAllocation {
            server_addr: self.server_addr,
            relay_addr,
            mapped_addr,
            lifetime_seconds: lifetime,
            channel_number: None,
            active: true,
        });
        self.since_refresh = Duration::ZERO;
    }

    // -----------------------------------------------------------------------
    // Permission / ChannelBind / Refresh
    // -----------------------------------------------------------------------

    /// Create a permission for `peer` and wait for the answer.
    pub fn create_permission(&mut self, peer: SocketAddr) -> Result<()> {
        let txn = generate_transaction_id();
        let req = self.build_permission_request(&txn, peer);
        match self.transact(&req, &txn)? {
            TurnResponse::Success { .. } => {
                tracing::debug!("TURN permission created for {}", peer);
                self.add_permission(peer);
                Ok(())
            }
            TurnResponse::Error { code, reason, .. } => {
                bail!("TURN CreatePermission failed: {} {}", code, reason);
            }
            TurnResponse::AllocateSuccess { .. } => bail!("Unexpected CreatePermission response"),
        }
    }

    /// Bind `channel` to `peer` and wait for the answer.
    pub fn channel_bind(&mut self, peer: SocketAddr, channel: u16) -> Result<()> {
        let txn = generate_transaction_id();
        let req = self.build_channel_bind_request(&txn, peer, channel)?;
        match self.transact(&req, &txn)? {
            TurnResponse::Success { .. } => {
                tracing::debug!("TURN channel 0x{:04x} bound to {}", channel, peer);
                self.install_channel(peer, channel);
                Ok(())
            }
            TurnResponse::Error { code, reason, .. } => {
                bail!("TURN ChannelBind failed: {} {}", code, reason);
            }
            TurnResponse::AllocateSuccess { .. } => bail!("Unexpected ChannelBind response"),
        }
    }

    /// Send CreatePermission without waiting; the outcome arrives as an event.
    pub fn request_permission(&mut self, peer: SocketAddr) -> Result<()> {
        let txn = generate_transaction_id();
        let req = self.build_permission_request(&txn, peer);
        self.send_request(req, txn, RequestKind::Permission(peer))
    }

    /// Send ChannelBind without waiting; the outcome arrives as an event.
    pub fn request_channel_bind(&mut self, peer: SocketAddr, channel: u16) -> Result<()> {
        let txn = generate_transaction_id();
        let req = self.build_channel_bind_request(&txn, peer, channel)?;
        self.send_request(req, txn, RequestKind::ChannelBind { peer, channel })
    }

    /// Forget in-flight CreatePermission/ChannelBind requests for `peer`.
    /// Late answers to them are dropped without an event.
    pub fn cancel_requests(&mut self, peer: SocketAddr) {
        self.pending.retain(|p| match p.kind {
            RequestKind::Permission(addr) | RequestKind::ChannelBind { peer: addr, .. } => {
                addr != peer
            }
            RequestKind::Refresh { .. } => true,
        });
    }

    /// Send Refresh asking for `lifetime` seconds.
    pub fn refresh(&mut self, lifetime: u32) -> Result<()> {
        if self.allocation.is_none() {
            bail!("No allocation to refresh");
        }
        let txn = generate_transaction_id();
        let req = self.build_refresh_request(&txn, lifetime);
        self.send_request(req, txn, RequestKind::Refresh { lifetime })
    }

    /// Release the allocation: a best-effort Refresh with LIFETIME=0.
    pub fn deallocate(&mut self) {
        if !self.is_active() {
            return;
        }
        let txn = generate_transaction_id();
        let req = self.build_refresh_request(&txn, 0);
        if let Err(e) = self.socket.send_to(&req, self.server_addr) {
            tracing::debug!("TURN deallocate send failed: {}", e);
        }
        self.deactivate();
        self.pending.clear();
        tracing::info!("TURN allocation on {} released", self.server_addr);
    }

    fn deactivate(&mut self) {
        if let Some(allocation) = self.allocation.as_mut() {
            allocation.active = false;
        }
    }

    fn add_permission(&mut self, peer: SocketAddr) {
        if !self.has_permission(peer) {
            self.permissions.push(peer);
        }
    }

    fn install_channel(&mut self, peer: SocketAddr, channel: u16) {
        self.add_permission(peer);
        self.channel_peer = Some(peer);
        if let Some(allocation) = self.allocation.as_mut() {
            allocation.channel_number = Some(channel);
        }
    }

    fn refresh_threshold(&self) -> Duration {
        let lifetime = self
            .allocation
            .as_ref()
            .map_or(DEFAULT_LIFETIME, |a| a.lifetime_seconds);
        Duration::from_secs(u64::from(lifetime)) * REFRESH_PERCENT / 100
    }

    fn refresh_pending(&self) -> bool {
        self.pending
            .iter()
            .any(|p| matches!(p.kind, RequestKind::Refresh { .. }))
    }

    fn schedule_early_refresh(&mut self) {
        self.since_refresh = self
            .refresh_threshold()
            .saturating_sub(REFRESH_RETRY_MARGIN);
    }

    /// Advance timers: expire unanswered requests and refresh the allocation
    /// when 80% of its lifetime has gone by.
    pub fn tick(&mut self, dt: Duration) {
        self.since_refresh += dt;

        let timeout = self.timeout;
        let mut expired = Vec::new();
        self.pending.retain_mut(|p| {
            p.elapsed += dt;
            if p.elapsed >= timeout {
                expired.push(p.kind);
                false
            } else {
                true
            }
        });
        for kind in expired {
            tracing::warn!("TURN {} timed out", kind);
            if matches!(kind, RequestKind::Refresh { .. }) {
                self.schedule_early_refresh();
            }
            self.events.push_back(TurnEvent::RequestFailed {
                kind,
                reason: "timeout".into(),
            });
        }

        if self.is_active()
            && !self.refresh_pending()
            && self.since_refresh >= self.refresh_threshold()
        {
            let lifetime = self
                .allocation
                .as_ref()
                .map_or(DEFAULT_LIFETIME, |a| a.lifetime_seconds);
            tracing::debug!("Refreshing TURN allocation ({}s)", lifetime);
            if let Err(e) = self.refresh(lifetime) {
                tracing::warn!("TURN refresh send failed: {:#}", e);
                self.schedule_early_refresh();
            }
        }
    }

    // -----------------------------------------------------------------------
    // Relay data
    // -----------------------------------------------------------------------

    /// Send `payload` to the channel peer as ChannelData via the TURN server.
    ///
    /// Fails when no channel is bound; Send indications are not used.
    pub fn send_channel_data(&self, payload: &[u8]) -> Result<()> {
        let channel = self
            .allocation
            .as_ref()
            .and_then(|a| a.channel_number)
            .context("No TURN channel bound")?;
        let frame = build_channel_data(channel, payload)?;
        self.socket
            .send_to(&frame, self.server_addr)
            .context("TURN ChannelData send")?;
        Ok(())
    }

    /// Drain the socket without blocking. STUN responses are matched against
    /// pending requests; the first relayed payload is returned with its peer.
    pub fn recv(&mut self) -> Option<(SocketAddr, Vec<u8>)> {
        let mut buf = [0u8; 2048];
        loop {
            let (len, from) = match self.socket.try_recv_from(&mut buf) {
                Ok(Some(received)) => received,
                Ok(None) => return None,
                Err(e) => {
                    tracing::debug!("TURN recv error: {}", e);
                    return None;
                }
            };
            if from != self.server_addr {
                tracing::debug!("Ignoring datagram from {} on TURN socket", from);
                continue;
            }

            let data = &buf[..len];
            match classify_frame(data) {
                RelayFrame::ChannelData { channel, payload } => {
                    match (self.channel_peer, self.allocation.as_ref().and_then(|a| a.channel_number)) {
                        (Some(peer), Some(bound)) if bound == channel => {
                            return Some((peer, payload.to_vec()));
                        }
                        _ => tracing::debug!("ChannelData on unbound channel 0x{:04x}", channel),
                    }
                }
                RelayFrame::DataIndication {
                    peer: Some(peer),
                    payload,
                } => return Some((peer, payload.to_vec())),
                RelayFrame::DataIndication { peer: None, .. } => {
                    tracing::debug!("Data indication without XOR-PEER-ADDRESS");
                }
                RelayFrame::Stun(msg) => self.handle_response(&msg),
                RelayFrame::Unknown => {
                    tracing::debug!("Unrecognised {}-byte datagram from TURN server", len);
                }
            }
        }
    }

    fn handle_response(&mut self, msg: &StunMessage<'_>) {
        let Some(idx) = self
            .pending
            .iter()
            .position(|p| p.txn == msg.transaction_id)
        else {
            tracing::debug!("TURN response 0x{:04x} matches no request", msg.msg_type);
            return;
        };
        if !is_response_to(msg.msg_type, self.pending[idx].kind.method()) {
            tracing::debug!("TURN response 0x{:04x} has the wrong method", msg.msg_type);
            return;
        }
        let request = self.pending.remove(idx);

        let response = match parse_turn_response(msg) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Bad response to TURN {}: {:#}", request.kind, e);
                self.events.push_back(TurnEvent::RequestFailed {
                    kind: request.kind,
                    reason: e.to_string(),
                });
                return;
            }
        };

        match (request.kind, response) {
            (RequestKind::Permission(peer), TurnResponse::Success { .. }) => {
                tracing::debug!("TURN permission created for {}", peer);
                self.add_permission(peer);
                self.events.push_back(TurnEvent::PermissionCreated(peer));
            }
            (RequestKind::ChannelBind { peer, channel }, TurnResponse::Success { .. }) => {
                tracing::debug!("TURN channel 0x{:04x} bound to {}", channel, peer);
                self.install_channel(peer, channel);
                self.events
                    .push_back(TurnEvent::ChannelBound { peer, channel });
            }
            (RequestKind::Refresh { lifetime }, TurnResponse::Success { lifetime: granted }) => {
                let granted = granted.unwrap_or(lifetime);
                if granted == 0 {
                    tracing::info!("TURN server granted lifetime 0; allocation closed");
                    self.deactivate();
                    self.events.push_back(TurnEvent::Deactivated);
                } else {
                    tracing::debug!("TURN allocation refreshed for {}s", granted);
                    if let Some(allocation) = self.allocation.as_mut() {
                        allocation.lifetime_seconds = granted;
                    }
                    self.since_refresh = Duration::ZERO;
                    self.events
                        .push_back(TurnEvent::Refreshed { lifetime: granted });
                }
            }
            (RequestKind::Refresh { .. }, TurnResponse::Error { code, reason, .. }) => {
                tracing::warn!("TURN refresh rejected: {} {}", code, reason);
                self.deactivate();
                self.events.push_back(TurnEvent::Deactivated);
            }
            (kind, TurnResponse::Error { code, reason, .. }) => {
                tracing::warn!("TURN {} failed: {} {}", kind, code, reason);
                self.events.push_back(TurnEvent::RequestFailed {
                    kind,
                    reason: format!("{} {}", code, reason),
                });
            }
            (kind, TurnResponse::AllocateSuccess { .. }) => {
                self.events.push_back(TurnEvent::RequestFailed {
                    kind,
                    reason: "unexpected Allocate response".into(),
                });
            }
        }
    }

    // -----------------------------------------------------------------------
    // Plumbing
    // -----------------------------------------------------------------------

    fn send_request(&mut self, req: Vec<u8>, txn: TransactionId, kind: RequestKind) -> Result<()> {
        self.socket
            .send_to(&req, self.server_addr)
            .with_context(|| format!("TURN {} send", kind))?;
        tracing::debug!("TURN {} -> {}", kind, self.server_addr);
        self.pending.push(PendingRequest {
            txn,
            kind,
            elapsed: Duration::ZERO,
        });
        Ok(())
    }

    /// Send `request` and block until the response with `txn` arrives.
    fn transact(&self, request: &[u8], txn: &TransactionId) -> Result<TurnResponse> {
        self.socket
            .send_to(request, self.server_addr)
            .context("TURN send")?;

        let mut buf = [0u8; 2048];
        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                bail!("TURN response timeout");
            }
            let Some((len, from)) = self
                .socket
                .recv_timeout(&mut buf, remaining)
                .context("TURN recv error")?
            else {
                bail!("TURN response timeout");
            };
            if from != self.server_addr {
                continue;
            }
            let Ok(msg) = StunMessage::parse(&buf[..len]) else {
                continue;
            };
            if &msg.transaction_id != txn {
                continue;
            }
            return parse_turn_response(&msg);
        }
    }

    /// Append USERNAME/REALM/NONCE and sign, once the server has challenged
    /// us; before that the request goes out unauthenticated.
    fn finish_request(&self, mut buf: Vec<u8>) -> Vec<u8> {
        match (&self.realm, &self.nonce, &self.key) {
            (Some(realm), Some(nonce), Some(key)) => {
                append_auth_attrs(
                    &mut buf,
                    &self.username,
                    Some((realm.as_str(), nonce.as_str())),
                );
                auth::sign(&mut buf, key);
            }
            _ => stun::update_length(&mut buf),
        }
        buf
    }

    fn build_permission_request(&self, txn: &TransactionId, peer: SocketAddr) -> Vec<u8> {
        let mut buf = stun::build_header(CREATE_PERMISSION_REQUEST, txn);
        stun::append_attr(
            &mut buf,
            ATTR_XOR_PEER_ADDRESS,
            &stun::encode_xor_address(peer, txn),
        );
        self.finish_request(buf)
    }

    fn build_channel_bind_request(
        &self,
        txn: &TransactionId,
        peer: SocketAddr,
        channel: u16,
    ) -> Result<Vec<u8>> {
        if !(CHANNEL_MIN..=CHANNEL_MAX).contains(&channel) {
            bail!("Channel number must be in range 0x4000..=0x7FFF");
        }
        let mut buf = stun::build_header(CHANNEL_BIND_REQUEST, txn);
        // CHANNEL-NUMBER: channel + 2 bytes RFFU
        let mut cn = [0u8; 4];
        cn[0..2].copy_from_slice(&channel.to_be_bytes());
        stun::append_attr(&mut buf, ATTR_CHANNEL_NUMBER, &cn);
        stun::append_attr(
            &mut buf,
            ATTR_XOR_PEER_ADDRESS,
            &stun::encode_xor_address(peer, txn),
        );
        Ok(self.finish_request(buf))
    }

    fn build_refresh_request(&self, txn: &TransactionId, lifetime: u32) -> Vec<u8> {
        let mut buf = stun::build_header(REFRESH_REQUEST, txn);
        stun::append_attr(&mut buf, ATTR_LIFETIME, &lifetime.to_be_bytes());
        self.finish_request(buf)
    }
}

impl Drop for TurnClient {
    fn drop(&mut self) {
        self.deallocate();
    }
}

// ---------------------------------------------------------------------------
// Message building helpers
// ---------------------------------------------------------------------------

/// Allocate request: REQUESTED-TRANSPORT, USERNAME and, for the retry,
/// REALM + NONCE. MESSAGE-INTEGRITY is added by the caller.
pub fn build_allocate_request(
    txn_id: &TransactionId,
    username: &str,
    realm_nonce: Option<(&str, &str)>,
) -> Vec<u8> {
    let mut buf = stun::build_header(ALLOCATE_REQUEST, txn_id);

    let mut transport_val = [0u8; 4];
    transport_val[0] = TRANSPORT_UDP;
    stun::append_attr(&mut buf, ATTR_REQUESTED_TRANSPORT, &transport_val);

    append_auth_attrs(&mut buf, username, realm_nonce);
    stun::update_length(&mut buf);
    buf
}

fn append_auth_attrs(buf: &mut Vec<u8>, username: &str, realm_nonce: Option<(&str, &str)>) {
    stun::append_attr(buf, ATTR_USERNAME, username.as_bytes());
    if let Some((realm, nonce)) = realm_nonce {
        stun::append_attr(buf, ATTR_REALM, realm.as_bytes());
        stun::append_attr(buf, ATTR_NONCE, nonce.as_bytes());
    }
}

/// ChannelData frame: `[channel][length][payload]`.
pub fn build_channel_data(channel: u16, payload: &[u8]) -> Result<Vec<u8>> {
    if !(CHANNEL_MIN..=CHANNEL_MAX).contains(&channel) {
        bail!("Invalid channel number 0x{:04x}", channel);
    }
    let len = u16::try_from(payload.len()).context("ChannelData payload too large")?;
    let mut frame = Vec::with_capacity(CHANNEL_DATA_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&channel.to_be_bytes());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

// ---------------------------------------------------------------------------
// Response and frame parsing
// ---------------------------------------------------------------------------

enum TurnResponse {
    AllocateSuccess {
        relay_addr: SocketAddr,
        mapped_addr: Option<SocketAddr>,
        lifetime: u32,
    },
    Success {
        lifetime: Option<u32>,
    },
    Error {
        code: u16,
        reason: String,
        realm: Option<String>,
        nonce: Option<String>,
    },
}

fn parse_turn_response(msg: &StunMessage<'_>) -> Result<TurnResponse> {
    if msg.is_error_response() {
        let (code, reason) = msg.error_code().unwrap_or((0, String::new()));
        return Ok(TurnResponse::Error {
            code,
            reason,
            realm: msg.string_attribute(ATTR_REALM),
            nonce: msg.string_attribute(ATTR_NONCE),
        });
    }

    if msg.msg_type == ALLOCATE_RESPONSE {
        let relay_addr = msg
            .xor_address(ATTR_XOR_RELAYED_ADDRESS)
            .context("Allocate response missing XOR-RELAYED-ADDRESS")?;
        return Ok(TurnResponse::AllocateSuccess {
            relay_addr,
            mapped_addr: msg.xor_address(ATTR_XOR_MAPPED_ADDRESS),
            lifetime: msg.u32_attribute(ATTR_LIFETIME).unwrap_or(DEFAULT_LIFETIME),
        });
    }

    if msg.is_success_response() {
        return Ok(TurnResponse::Success {
            lifetime: msg.u32_attribute(ATTR_LIFETIME),
        });
    }

    bail!("Unknown TURN response type: 0x{:04x}", msg.msg_type);
}

/// One datagram received from the TURN server, classified by its leading bits.
pub enum RelayFrame<'a> {
    ChannelData { channel: u16, payload: &'a [u8] },
    DataIndication { peer: Option<SocketAddr>, payload: &'a [u8] },
    Stun(StunMessage<'a>),
    Unknown,
}

/// Split ChannelData (`01`), Data indications and other STUN traffic (`00`).
pub fn classify_frame(data: &[u8]) -> RelayFrame<'_> {
    if data.len() < CHANNEL_DATA_HEADER_SIZE {
        return RelayFrame::Unknown;
    }
    match data[0] >> 6 {
        0b01 => {
            let channel = u16::from_be_bytes([data[0], data[1]]);
            let len = u16::from_be_bytes([data[2], data[3]]) as usize;
            match data.get(CHANNEL_DATA_HEADER_SIZE..CHANNEL_DATA_HEADER_SIZE + len) {
                Some(payload) => RelayFrame::ChannelData { channel, payload },
                None => RelayFrame::Unknown,
            }
        }
        0b00 => match StunMessage::parse(data) {
            Ok(msg) if msg.msg_type == DATA_INDICATION => match msg.attribute(ATTR_DATA) {
                Some(payload) => RelayFrame::DataIndication {
                    peer: msg.xor_address(ATTR_XOR_PEER_ADDRESS),
                    payload,
                },
                None => RelayFrame::Unknown,
            },
            Ok(msg) => RelayFrame::Stun(msg),
            Err(_) => RelayFrame::Unknown,
        },
        _ => RelayFrame::Unknown,
    }
}

/// Whether a response type belongs to the request method `method`.
pub fn is_response_to(msg_type: u16, method: u16) -> bool {
    msg_type & !CLASS_MASK == method && msg_type & CLASS_MASK != 0
}

/// Scripted TURN server for tests on a [`MemoryNetwork`](crate::transport::memory::MemoryNetwork).
#[cfg(test)]
pub(crate) mod mock {
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::handshake::{HelloKind, HelloPacket};
    use crate::stun::ATTR_ERROR_CODE;
    use crate::transport::memory::MemoryNetwork;

    /// `(message type, LIFETIME)` of every STUN request the server saw.
    pub(crate) type RequestLog = Arc<Mutex<Vec<(u16, Option<u32>)>>>;

    pub(crate) struct MockTurn {
        pub realm: &'static str,
        pub nonce: &'static str,
        pub password: &'static str,
        pub relay_addr: SocketAddr,
        pub lifetime: u32,
        pub always_unauthorized: bool,
        pub answer_refresh: bool,
        pub reject_refresh: bool,
        /// Answer CreatePermission and ChannelBind with 403.
        pub reject_relay_setup: bool,
        /// Answer HELLO requests arriving as ChannelData the way the peer would.
        pub echo_hello: bool,
    }

    impl Default for MockTurn {
        fn default() -> Self {
            Self {
                realm: "example.org",
                nonce: "f//499k954d6OL34oL9FSTvy64sA",
                password: "secret",
                relay_addr: "203.0.113.50:49152".parse().unwrap(),
                lifetime: DEFAULT_LIFETIME,
                always_unauthorized: false,
                answer_refresh: true,
                reject_refresh: false,
                reject_relay_setup: false,
                echo_hello: false,
            }
        }
    }

    pub(crate) fn error_response(
        method: u16,
        txn: &TransactionId,
        code: u16,
        reason: &str,
        challenge: Option<(&str, &str)>,
    ) -> Vec<u8> {
        let mut buf = stun::build_header(method | CLASS_MASK, txn);
        let mut value = vec![0, 0, (code / 100) as u8, (code % 100) as u8];
        value.extend_from_slice(reason.as_bytes());
        stun::append_attr(&mut buf, ATTR_ERROR_CODE, &value);
        if let Some((realm, nonce)) = challenge {
            stun::append_attr(&mut buf, ATTR_REALM, realm.as_bytes());
            stun::append_attr(&mut buf, ATTR_NONCE, nonce.as_bytes());
        }
        stun::update_length(&mut buf);
        buf
    }

    /// Serve `cfg` at `addr`; the returned log records every request.
    pub(crate) fn serve(net: &MemoryNetwork, addr: SocketAddr, cfg: MockTurn) -> RequestLog {
        let log: RequestLog = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();

        net.serve(addr, move |data, from| {
            if let RelayFrame::ChannelData { channel, payload } = classify_frame(data) {
                return match HelloPacket::decode(payload) {
                    Some(p) if cfg.echo_hello && p.kind == HelloKind::Request => {
                        vec![build_channel_data(channel, &HelloPacket::response(0).encode()).unwrap()]
                    }
                    _ => vec![],
                };
            }
            let Ok(msg) = StunMessage::parse(data) else {
                return vec![];
            };
            let lifetime = msg.u32_attribute(ATTR_LIFETIME);
            sink.lock().unwrap().push((msg.msg_type, lifetime));

            let txn = msg.transaction_id;
            let username = msg.string_attribute(ATTR_USERNAME).unwrap_or_default();
            let key = auth::derive_key(&username, cfg.realm, cfg.password);
            let authed = !cfg.always_unauthorized && auth::verify_message_integrity(data, &key);

            match msg.msg_type {
                ALLOCATE_REQUEST if !authed => vec![error_response(
                    ALLOCATE_REQUEST,
                    &txn,
                    401,
                    "Unauthorized",
                    Some((cfg.realm, cfg.nonce)),
                )],
                ALLOCATE_REQUEST => {
                    let mut buf = stun::build_header(ALLOCATE_RESPONSE, &txn);
                    stun::append_attr(
                        &mut buf,
                        ATTR_XOR_RELAYED_ADDRESS,
                        &stun::encode_xor_address(cfg.relay_addr, &txn),
                    );
                    stun::append_attr(
                        &mut buf,
                        ATTR_XOR_MAPPED_ADDRESS,
                        &stun::encode_xor_address(from, &txn),
                    );
                    stun::append_attr(&mut buf, ATTR_LIFETIME, &cfg.lifetime.to_be_bytes());
                    stun::update_length(&mut buf);
                    vec![buf]
                }
                CREATE_PERMISSION_REQUEST | CHANNEL_BIND_REQUEST if cfg.reject_relay_setup => {
                    vec![error_response(msg.msg_type, &txn, 403, "Forbidden", None)]
                }
                CREATE_PERMISSION_REQUEST | CHANNEL_BIND_REQUEST => {
                    let mut buf = stun::build_header(msg.msg_type | 0x0100, &txn);
                    stun::update_length(&mut buf);
                    vec![buf]
                }
                REFRESH_REQUEST if cfg.reject_refresh => vec![error_response(
                    REFRESH_REQUEST,
                    &txn,
                    437,
                    "Allocation Mismatch",
                    None,
                )],
                REFRESH_REQUEST if cfg.answer_refresh => {
                    let mut buf = stun::build_header(REFRESH_REQUEST | 0x0100, &txn);
                    let granted = lifetime.unwrap_or(cfg.lifetime);
                    stun::append_attr(&mut buf, ATTR_LIFETIME, &granted.to_be_bytes());
                    stun::update_length(&mut buf);
                    vec![buf]
                }
                _ => vec![],
            }
        });
        log
    }
}
