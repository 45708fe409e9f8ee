//! STUN message codec (RFC 5389) and a one-shot binding client.
//!
//! Building is done on plain `Vec<u8>` buffers: write the header, append
//! attributes, then fix up the length. Parsing goes through [`StunMessage`],
//! which validates the header once and exposes the attribute list.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use thiserror::Error;

use crate::transport::Network;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// STUN magic cookie (RFC 5389).
pub const MAGIC_COOKIE: u32 = 0x2112A442;

/// STUN header size (type + length + magic + transaction ID).
pub const STUN_HEADER_SIZE: usize = 20;

/// STUN message types.
pub const BINDING_REQUEST: u16 = 0x0001;
pub const BINDING_RESPONSE: u16 = 0x0101;
pub const BINDING_ERROR_RESPONSE: u16 = 0x0111;

/// STUN attribute types.
pub const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
pub const ATTR_USERNAME: u16 = 0x0006;
pub const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;
pub const ATTR_ERROR_CODE: u16 = 0x0009;
pub const ATTR_REALM: u16 = 0x0014;
pub const ATTR_NONCE: u16 = 0x0015;
pub const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
pub const ATTR_FINGERPRINT: u16 = 0x8028;

/// FINGERPRINT XOR constant per RFC 5389.
const FINGERPRINT_XOR: u32 = 0x5354554e;

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

/// How long a binding transaction waits for its response.
pub const STUN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default public STUN server.
pub const DEFAULT_STUN_SERVER: &str = "stun.l.google.com:19302";

/// A STUN transaction ID.
pub type TransactionId = [u8; 12];

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Reasons a datagram is not an acceptable STUN message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StunError {
    #[error("message too short: {0} bytes")]
    TooShort(usize),
    #[error("leading bits are not 00 (not a STUN message)")]
    NotStun,
    #[error("bad magic cookie 0x{0:08x}")]
    BadMagicCookie(u32),
    #[error("declared length {declared} exceeds datagram ({available} bytes of attributes)")]
    Truncated { declared: usize, available: usize },
    #[error("unexpected message type 0x{0:04x}")]
    UnexpectedType(u16),
    #[error("transaction ID mismatch")]
    TransactionMismatch,
    #[error("missing {0} attribute")]
    MissingAttribute(&'static str),
}

// ---------------------------------------------------------------------------
// CRC-32 (IEEE 802.3) for the FINGERPRINT attribute
// ---------------------------------------------------------------------------

const CRC32_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0u32;
    while i < 256 {
        let mut crc = i;
        let mut j = 0;
        while j < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB88320;
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i as usize] = crc;
        i += 1;
    }
    table
};

fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFFFFFFu32;
    for &byte in data {
        let idx = ((crc ^ byte as u32) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[idx];
    }
    crc ^ 0xFFFFFFFF
}

// ---------------------------------------------------------------------------
// Message building
// ---------------------------------------------------------------------------

/// Generate a random 12-byte STUN transaction ID.
pub fn generate_transaction_id() -> TransactionId {
    let id = uuid::Uuid::new_v4();
    let mut txn = [0u8; 12];
    txn.copy_from_slice(&id.as_bytes()[..12]);
    txn
}

/// Start a message: header with a zero length placeholder.
pub fn build_header(msg_type: u16, transaction_id: &TransactionId) -> Vec<u8> {
    let mut buf = Vec::with_capacity(128);
    buf.extend_from_slice(&msg_type.to_be_bytes());
    buf.extend_from_slice(&0u16.to_be_bytes());
    buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    buf.extend_from_slice(transaction_id);
    buf
}

/// Append a TLV attribute, padded to a 4-byte boundary.
pub fn append_attr(buf: &mut Vec<u8>, attr_type: u16, value: &[u8]) {
    buf.extend_from_slice(&attr_type.to_be_bytes());
    buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
    buf.extend_from_slice(value);
    let pad = (4 - (value.len() % 4)) % 4;
    buf.resize(buf.len() + pad, 0);
}

/// Set the header length field to `len` bytes of attributes.
pub fn set_length(buf: &mut [u8], len: usize) {
    buf[2..4].copy_from_slice(&(len as u16).to_be_bytes());
}

/// Set the header length field to cover everything appended so far.
pub fn update_length(buf: &mut [u8]) {
    let len = buf.len() - STUN_HEADER_SIZE;
    set_length(buf, len);
}

/// Append FINGERPRINT: CRC-32 of everything before it, with the length field
/// already covering the 8-byte attribute.
pub fn append_fingerprint(buf: &mut Vec<u8>) {
    let len = buf.len() - STUN_HEADER_SIZE + 8;
    set_length(buf, len);
    let fingerprint = crc32(buf) ^ FINGERPRINT_XOR;
    append_attr(buf, ATTR_FINGERPRINT, &fingerprint.to_be_bytes());
}

fn xor_key(transaction_id: &[u8]) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    if transaction_id.len() >= 12 {
        key[4..16].copy_from_slice(&transaction_id[..12]);
    }
    key
}

/// Encode a SocketAddr as an XOR-*-ADDRESS value.
pub fn encode_xor_address(addr: SocketAddr, transaction_id: &TransactionId) -> Vec<u8> {
    let xport = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
    let key = xor_key(transaction_id);
    let mut val = vec![0];
    match addr.ip() {
        IpAddr::V4(ip) => {
            val.push(FAMILY_IPV4);
            val.extend_from_slice(&xport.to_be_bytes());
            val.extend(ip.octets().iter().zip(&key[..4]).map(|(b, k)| b ^ k));
        }
        IpAddr::V6(ip) => {
            val.push(FAMILY_IPV6);
            val.extend_from_slice(&xport.to_be_bytes());
            val.extend(ip.octets().iter().zip(&key).map(|(b, k)| b ^ k));
        }
    }
    val
}

/// Decode an XOR-*-ADDRESS value.
pub fn decode_xor_address(value: &[u8], transaction_id: &[u8]) -> Option<SocketAddr> {
    if value.len() < 4 {
        return None;
    }
    let port = u16::from_be_bytes([value[2], value[3]]) ^ (MAGIC_COOKIE >> 16) as u16;
    let key = xor_key(transaction_id);

    match value[1] {
        FAMILY_IPV4 if value.len() >= 8 => {
            let ip = Ipv4Addr::new(
                value[4] ^ key[0],
                value[5] ^ key[1],
                value[6] ^ key[2],
                value[7] ^ key[3],
            );
            Some(SocketAddr::new(IpAddr::V4(ip), port))
        }
        FAMILY_IPV6 if value.len() >= 20 => {
            let mut octets = [0u8; 16];
            for (i, octet) in octets.iter_mut().enumerate() {
                *octet = value[4 + i] ^ key[i];
            }
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

/// Decode MAPPED-ADDRESS (no XOR).
fn decode_mapped_address(value: &[u8]) -> Option<SocketAddr> {
    if value.len() < 8 || value[1] != FAMILY_IPV4 {
        return None;
    }
    let port = u16::from_be_bytes([value[2], value[3]]);
    let ip = Ipv4Addr::new(value[4], value[5], value[6], value[7]);
    Some(SocketAddr::new(IpAddr::V4(ip), port))
}

/// Build a STUN Binding Request (header only, no attributes).
pub fn build_binding_request(transaction_id: &TransactionId) -> Vec<u8> {
    build_header(BINDING_REQUEST, transaction_id)
}

/// Build a STUN Binding Success Response carrying XOR-MAPPED-ADDRESS.
pub fn build_binding_response(transaction_id: &TransactionId, mapped_addr: SocketAddr) -> Vec<u8> {
    let mut buf = build_header(BINDING_RESPONSE, transaction_id);
    append_attr(
        &mut buf,
        ATTR_XOR_MAPPED_ADDRESS,
        &encode_xor_address(mapped_addr, transaction_id),
    );
    update_length(&mut buf);
    buf
}

// ---------------------------------------------------------------------------
// Message parsing
// ---------------------------------------------------------------------------

/// Quick check: leading bits 00 and the magic cookie in place.
pub fn is_stun_message(data: &[u8]) -> bool {
    data.len() >= STUN_HEADER_SIZE
        && data[0] & 0xC0 == 0
        && u32::from_be_bytes([data[4], data[5], data[6], data[7]]) == MAGIC_COOKIE
}

/// A validated STUN message borrowing its attribute values from the datagram.
#[derive(Debug)]
pub struct StunMessage<'a> {
    pub msg_type: u16,
    pub transaction_id: TransactionId,
    attributes: Vec<(u16, &'a [u8])>,
}

impl<'a> StunMessage<'a> {
    /// Validate the header and split the attribute section.
    ///
    /// A truncated trailing attribute ends the list rather than failing the
    /// whole message.
    pub fn parse(data: &'a [u8]) -> Result<Self, StunError> {
        if data.len() < STUN_HEADER_SIZE {
            return Err(StunError::TooShort(data.len()));
        }
        if data[0] & 0xC0 != 0 {
            return Err(StunError::NotStun);
        }
        let magic = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if magic != MAGIC_COOKIE {
            return Err(StunError::BadMagicCookie(magic));
        }
        let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
        let available = data.len() - STUN_HEADER_SIZE;
        if msg_len > available {
            return Err(StunError::Truncated {
                declared: msg_len,
                available,
            });
        }

        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&data[8..20]);

        let attrs_end = STUN_HEADER_SIZE + msg_len;
        let mut attributes = Vec::new();
        let mut pos = STUN_HEADER_SIZE;
        while pos + 4 <= attrs_end {
            let attr_type = u16::from_be_bytes([data[pos], data[pos + 1]]);
            let attr_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
            let start = pos + 4;
            let end = start + attr_len;
            if end > attrs_end {
                break;
            }
            attributes.push((attr_type, &data[start..end]));
            pos = start + ((attr_len + 3) & !3);
        }

        Ok(StunMessage {
            msg_type: u16::from_be_bytes([data[0], data[1]]),
            transaction_id,
            attributes,
        })
    }

    /// First value of an attribute type.
    pub fn attribute(&self, attr_type: u16) -> Option<&'a [u8]> {
        self.attributes
            .iter()
            .find(|(t, _)| *t == attr_type)
            .map(|(_, v)| *v)
    }

    /// An attribute decoded as UTF-8 (lossy).
    pub fn string_attribute(&self, attr_type: u16) -> Option<String> {
        self.attribute(attr_type)
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    /// An XOR-encoded address attribute.
    pub fn xor_address(&self, attr_type: u16) -> Option<SocketAddr> {
        self.attribute(attr_type)
            .and_then(|v| decode_xor_address(v, &self.transaction_id))
    }

    /// A 32-bit unsigned attribute.
    pub fn u32_attribute(&self, attr_type: u16) -> Option<u32> {
        self.attribute(attr_type)
            .filter(|v| v.len() >= 4)
            .map(|v| u32::from_be_bytes([v[0], v[1], v[2], v[3]]))
    }

    /// ERROR-CODE as `(code, reason)`.
    pub fn error_code(&self) -> Option<(u16, String)> {
        let value = self.attribute(ATTR_ERROR_CODE).filter(|v| v.len() >= 4)?;
        let class = (value[2] & 0x07) as u16;
        let number = value[3] as u16;
        let reason = String::from_utf8_lossy(&value[4..]).into_owned();
        Some((class * 100 + number, reason))
    }

    /// Success-response class bits (0b10).
    pub fn is_success_response(&self) -> bool {
        self.msg_type & 0x0110 == 0x0100
    }

    /// Error-response class bits (0b11).
    pub fn is_error_response(&self) -> bool {
        self.msg_type & 0x0110 == 0x0110
    }
}

/// Parse a Binding Success Response and extract the reflexive address.
pub fn parse_binding_response(
    data: &[u8],
    expected_txn: &TransactionId,
) -> Result<SocketAddr, StunError> {
    let msg = StunMessage::parse(data)?;
    if msg.msg_type != BINDING_RESPONSE {
        return Err(StunError::UnexpectedType(msg.msg_type));
    }
    if &msg.transaction_id != expected_txn {
        return Err(StunError::TransactionMismatch);
    }
    msg.xor_address(ATTR_XOR_MAPPED_ADDRESS)
        .or_else(|| msg.attribute(ATTR_MAPPED_ADDRESS).and_then(decode_mapped_address))
        .ok_or(StunError::MissingAttribute("XOR-MAPPED-ADDRESS"))
}

// ---------------------------------------------------------------------------
// Binding client
// ---------------------------------------------------------------------------

/// Outcome of a binding transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StunBinding {
    /// Our address as seen by the server.
    pub mapped_addr: SocketAddr,
    /// The transaction socket's local address.
    pub local_addr: SocketAddr,
}

/// Performs single binding transactions, each on its own short-lived socket.
pub struct StunClient<'a> {
    network: &'a dyn Network,
    timeout: Duration,
}

impl<'a> StunClient<'a> {
    pub fn new(network: &'a dyn Network) -> Self {
        Self {
            network,
            timeout: STUN_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send one Binding Request to `server` and wait for the matching
    /// response. No retransmission: on timeout the caller moves on.
    pub fn query(&self, server: &str) -> Result<StunBinding> {
        let server_addr = self
            .network
            .resolve(server)
            .with_context(|| format!("Failed to resolve STUN server {}", server))?;

        let socket = self
            .network
            .bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
            .context("Failed to bind STUN transaction socket")?;
        let local_addr = socket.local_addr().context("local_addr")?;

        let txn_id = generate_transaction_id();
        socket
            .send_to(&build_binding_request(&txn_id), server_addr)
            .with_context(|| format!("STUN send to {} failed", server_addr))?;

        let mut buf = [0u8; 512];
        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                bail!("STUN response timeout from {}", server_addr);
            }

            let Some((len, from)) = socket
                .recv_timeout(&mut buf, remaining)
                .context("STUN recv error")?
            else {
                bail!("STUN response timeout from {}", server_addr);
            };

            let data = &buf[..len];
            if from != server_addr || !is_stun_message(data) || data[8..20] != txn_id {
                tracing::debug!("Ignoring unrelated datagram from {} during STUN query", from);
                continue;
            }

            let mapped_addr = parse_binding_response(data, &txn_id)
                .with_context(|| format!("Malformed STUN response from {}", server_addr))?;
            tracing::debug!("STUN {} reports mapped address {}", server_addr, mapped_addr);
            return Ok(StunBinding {
                mapped_addr,
                local_addr,
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
