//! ICE candidate model: the `candidate:` text codec and priority assignment.
//!
//! The text form is the contract with whatever signaling channel the caller
//! uses to ship candidates to the remote peer:
//!
//! ```text
//! candidate:<foundation> <component> <transport> <priority> <address> <port> typ <host|srflx|relay>
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const CANDIDATE_PREFIX: &str = "candidate:";
const SDP_ATTR_PREFIX: &str = "a=";

/// Local preference for every candidate; a single interface is never ranked
/// against another.
pub const LOCAL_PREFERENCE: u32 = 65535;

/// Only the RTP component exists.
pub const COMPONENT_ID: u8 = 1;

/// Minimum token count of a well-formed candidate body.
const MIN_TOKENS: usize = 8;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// ICE candidate type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CandidateType {
    #[default]
    Host,
    ServerReflexive,
    Relayed,
}

impl CandidateType {
    /// RFC 8445 type preference.
    pub fn type_preference(self) -> u32 {
        match self {
            CandidateType::Host => 126,
            CandidateType::ServerReflexive => 100,
            CandidateType::Relayed => 0,
        }
    }

    /// Whether the candidate can be used without a relay.
    pub fn is_direct(self) -> bool {
        !matches!(self, CandidateType::Relayed)
    }

    fn as_str(self) -> &'static str {
        match self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::Relayed => "relay",
        }
    }
}

/// ICE transport protocol. Only UDP is carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    #[default]
    Udp,
}

/// One address a peer may be reachable at.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Candidate {
    pub foundation: String,
    pub component: u8,
    pub transport: Transport,
    pub priority: u32,
    pub address: String,
    pub port: u16,
    pub candidate_type: CandidateType,
    /// For srflx/relay: the base address the candidate was derived from.
    pub related_address: Option<String>,
    pub related_port: Option<u16>,
}

/// Why a candidate line could not be parsed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CandidateParseError {
    #[error("candidate has {0} tokens, need at least 8")]
    TooFewTokens(usize),
    #[error("bad {field}: {value}")]
    BadNumber { field: &'static str, value: String },
    #[error("unsupported transport: {0}")]
    UnsupportedTransport(String),
    #[error("expected 'typ' keyword, got: {0}")]
    MissingTyp(String),
    #[error("unknown candidate type: {0}")]
    UnknownType(String),
}

// ---------------------------------------------------------------------------
// Construction and priority
// ---------------------------------------------------------------------------

/// Compute ICE candidate priority per RFC 8445 section 5.1.2.1.
pub fn compute_priority(candidate_type: CandidateType, component: u8) -> u32 {
    (candidate_type.type_preference() << 24) | (LOCAL_PREFERENCE << 8) | (256 - component as u32)
}

impl Candidate {
    /// Build a candidate with its priority derived from `candidate_type`.
    pub fn new(
        foundation: impl Into<String>,
        candidate_type: CandidateType,
        address: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            foundation: foundation.into(),
            component: COMPONENT_ID,
            transport: Transport::Udp,
            priority: compute_priority(candidate_type, COMPONENT_ID),
            address: address.into(),
            port,
            candidate_type,
            related_address: None,
            related_port: None,
        }
    }

    /// Attach the base address a srflx/relay candidate was derived from.
    pub fn with_related(mut self, related: SocketAddr) -> Self {
        self.related_address = Some(related.ip().to_string());
        self.related_port = Some(related.port());
        self
    }

    /// Lenient parser: strips one optional `candidate:` prefix and returns the
    /// zero-value candidate for anything malformed.
    pub fn from_string(line: &str) -> Self {
        match line.parse() {
            Ok(candidate) => candidate,
            Err(e) => {
                tracing::debug!("Rejecting candidate {:?}: {}", line, e);
                Candidate::default()
            }
        }
    }

    /// False for the zero-value candidate produced by a failed parse.
    pub fn is_valid(&self) -> bool {
        !self.foundation.is_empty() && !self.address.is_empty() && self.component != 0
    }

    /// The candidate's transport address, if the address field is a literal IP.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        let ip = self.address.parse().ok()?;
        Some(SocketAddr::new(ip, self.port))
    }
}

// ---------------------------------------------------------------------------
// Text codec
// ---------------------------------------------------------------------------

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let transport = match self.transport {
            Transport::Udp => "UDP",
        };
        write!(
            f,
            "candidate:{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            transport,
            self.priority,
            self.address,
            self.port,
            self.candidate_type.as_str()
        )?;
        if let Some(ra) = &self.related_address {
            write!(f, " raddr {}", ra)?;
        }
        if let Some(rp) = self.related_port {
            write!(f, " rport {}", rp)?;
        }
        Ok(())
    }
}

fn parse_number<T: FromStr>(field: &'static str, value: &str) -> Result<T, CandidateParseError> {
    value.parse().map_err(|_| CandidateParseError::BadNumber {
        field,
        value: value.to_string(),
    })
}

impl FromStr for Candidate {
    type Err = CandidateParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let line = line.strip_prefix(SDP_ATTR_PREFIX).unwrap_or(line);
        // Exactly one prefix is removed; a doubled prefix stays in the foundation.
        let body = line.strip_prefix(CANDIDATE_PREFIX).unwrap_or(line);

        let parts: Vec<&str> = body.split_whitespace().collect();
        if parts.len() < MIN_TOKENS {
            return Err(CandidateParseError::TooFewTokens(parts.len()));
        }

        let foundation = parts[0].to_string();
        let component: u8 = parse_number("component", parts[1])?;
        let transport = match parts[2].to_uppercase().as_str() {
            "UDP" => Transport::Udp,
            other => return Err(CandidateParseError::UnsupportedTransport(other.to_string())),
        };
        let priority: u32 = parse_number("priority", parts[3])?;
        let address = parts[4].to_string();
        let port: u16 = parse_number("port", parts[5])?;

        if parts[6] != "typ" {
            return Err(CandidateParseError::MissingTyp(parts[6].to_string()));
        }
        let candidate_type = match parts[7] {
            "host" => CandidateType::Host,
            "srflx" => CandidateType::ServerReflexive,
            "relay" => CandidateType::Relayed,
            other => return Err(CandidateParseError::UnknownType(other.to_string())),
        };

        let mut related_address = None;
        let mut related_port = None;
        let mut i = MIN_TOKENS;
        while i < parts.len() {
            match parts[i] {
                "raddr" if i + 1 < parts.len() => {
                    related_address = Some(parts[i + 1].to_string());
                    i += 2;
                }
                "rport" if i + 1 < parts.len() => {
                    related_port = Some(parse_number("rport", parts[i + 1])?);
                    i += 2;
                }
                _ => i += 1,
            }
        }

        Ok(Candidate {
            foundation,
            component,
            transport,
            priority,
            address,
            port,
            candidate_type,
            related_address,
            related_port,
        })
    }
}

/// Pick the highest-priority candidate whose type passes `eligible`.
pub fn select_best<'a>(
    candidates: &'a [Candidate],
    eligible: impl Fn(CandidateType) -> bool,
) -> Option<&'a Candidate> {
    candidates
        .iter()
        .filter(|c| c.is_valid() && c.component == COMPONENT_ID && eligible(c.candidate_type))
        .max_by_key(|c| c.priority)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
