//! Candidate gathering: host, then server-reflexive, then relayed.
//!
//! Each phase stops at the first server that answers. Failures are logged and
//! the next server (or phase) is tried; gathering succeeds if at least one
//! candidate came out of it.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::candidate::{Candidate, CandidateType};
use crate::config::IceConfig;
use crate::stun::{StunClient, STUN_TIMEOUT};
use crate::transport::Network;
use crate::turn::{parse_turn_url, TurnClient, TurnTransport};

/// Foundations per candidate type. One candidate of each type at most, so a
/// fixed foundation per type is enough.
const HOST_FOUNDATION: &str = "1";
const SRFLX_FOUNDATION: &str = "2";
const RELAY_FOUNDATION: &str = "3";

const DEFAULT_STUN_PORT: u16 = 3478;

/// Everything gathering produced. The TURN client owns the allocation socket
/// and must outlive the relayed candidate.
#[derive(Default)]
pub struct Gathered {
    pub candidates: Vec<Candidate>,
    pub turn: Option<TurnClient>,
}

/// Normalise a STUN server entry to `host:port`.
///
/// Accepts `stun:host[:port]` or a bare `host[:port]`; `stuns:` (TLS) entries
/// are not usable over UDP and yield `None`.
pub fn parse_stun_url(url: &str) -> Option<String> {
    let url = url.trim();
    if url.starts_with("stuns:") || url.contains("://") {
        return None;
    }
    let rest = url.strip_prefix("stun:").unwrap_or(url);
    let rest = rest.split_once('?').map_or(rest, |(h, _)| h);
    if rest.is_empty() {
        return None;
    }
    match rest.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
            Some(rest.to_string())
        }
        Some(_) => None,
        None => Some(format!("{}:{}", rest, DEFAULT_STUN_PORT)),
    }
}

pub struct Gatherer<'a> {
    network: &'a dyn Network,
    config: &'a IceConfig,
    timeout: Duration,
}

impl<'a> Gatherer<'a> {
    pub fn new(network: &'a dyn Network, config: &'a IceConfig) -> Self {
        Self {
            network,
            config,
            timeout: STUN_TIMEOUT,
        }
    }

    /// Per-transaction timeout for STUN and TURN.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run all three phases. Blocks for at most one timeout per server tried.
    pub fn gather(&self) -> Gathered {
        let mut gathered = Gathered::default();

        match self.host_candidate() {
            Ok(c) => {
                tracing::debug!("Host candidate: {}", c);
                gathered.candidates.push(c);
            }
            Err(e) => tracing::warn!("No host candidate: {:#}", e),
        }

        if let Some(c) = self.srflx_candidate() {
            tracing::debug!("Server-reflexive candidate: {}", c);
            gathered.candidates.push(c);
        }

        if let Some((c, turn)) = self.relay_candidate() {
            tracing::debug!("Relayed candidate: {}", c);
            gathered.candidates.push(c);
            gathered.turn = Some(turn);
        }

        tracing::info!("Gathered {} local candidate(s)", gathered.candidates.len());
        gathered
    }

    /// Primary interface address with the configured port (0 = ephemeral,
    /// filled in once the socket is bound).
    pub fn host_candidate(&self) -> Result<Candidate> {
        let ip = self
            .network
            .primary_ip()
            .context("Failed to determine primary interface address")?;
        Ok(Candidate::new(
            HOST_FOUNDATION,
            CandidateType::Host,
            ip.to_string(),
            self.config.host_port,
        ))
    }

    /// Ask each STUN server in turn; the first mapped address wins.
    pub fn srflx_candidate(&self) -> Option<Candidate> {
        let client = StunClient::new(self.network).with_timeout(self.timeout);
        for entry in &self.config.stun_servers {
            let Some(server) = parse_stun_url(entry) else {
                tracing::warn!("Skipping unusable STUN server entry {:?}", entry);
                continue;
            };
            match client.query(&server) {
                Ok(binding) => {
                    let base = match self.network.primary_ip() {
                        Ok(ip) => SocketAddr::new(ip, binding.local_addr.port()),
                        Err(_) => binding.local_addr,
                    };
                    return Some(
                        Candidate::new(
                            SRFLX_FOUNDATION,
                            CandidateType::ServerReflexive,
                            binding.mapped_addr.ip().to_string(),
                            binding.mapped_addr.port(),
                        )
                        .with_related(base),
                    );
                }
                Err(e) => tracing::warn!("STUN server {} failed: {:#}", server, e),
            }
        }
        None
    }

    /// Allocate on the first TURN server that accepts our credentials.
    /// Skipped entirely without credentials.
    pub fn relay_candidate(&self) -> Option<(Candidate, TurnClient)> {
        let Some((username, credential)) = self.config.turn_credentials() else {
            if !self.config.turn_servers.is_empty() {
                tracing::debug!("TURN servers configured but no credentials; skipping relay");
            }
            return None;
        };

        for entry in &self.config.turn_servers {
            let Some(server) = parse_turn_url(entry) else {
                tracing::warn!("Skipping unparseable TURN server entry {:?}", entry);
                continue;
            };
            if server.transport != TurnTransport::Udp {
                tracing::debug!("Skipping non-UDP TURN server {}", entry);
                continue;
            }

            let result = TurnClient::connect(self.network, &server, username, credential)
                .map(|c| c.with_timeout(self.timeout))
                .and_then(|mut c| {
                    let relay = c.allocate()?;
                    Ok((relay, c))
                });
            match result {
                Ok((relay, client)) => {
                    let mut candidate = Candidate::new(
                        RELAY_FOUNDATION,
                        CandidateType::Relayed,
                        relay.ip().to_string(),
                        relay.port(),
                    );
                    if let Some(mapped) = client.allocation().and_then(|a| a.mapped_addr) {
                        candidate = candidate.with_related(mapped);
                    }
                    return Some((candidate, client));
                }
                Err(e) => tracing::warn!("TURN server {} failed: {:#}", server.host_port(), e),
            }
        }
        None
    }
}
