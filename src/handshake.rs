//! Application-level HELLO handshake that confirms a path works both ways.
//!
//! Packet layout (9 bytes):
//!
//! ```text
//! 0       4      5              9
//! | magic | type | timestamp ms |
//! ```

use std::time::Duration;

/// Marks handshake packets ("ICEH").
pub const HANDSHAKE_MAGIC: u32 = 0x49434548;

pub const HELLO_REQUEST: u8 = 0x01;
pub const HELLO_RESPONSE: u8 = 0x02;

pub const HANDSHAKE_PACKET_SIZE: usize = 9;

/// Retransmit interval while nothing has been heard from the peer.
pub const HANDSHAKE_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Total time allowed for one handshake attempt.
pub const MAX_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Handshake packet kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelloKind {
    Request,
    Response,
}

/// A decoded handshake packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelloPacket {
    pub kind: HelloKind,
    /// Sender's clock in milliseconds; only used for logging.
    pub timestamp: u32,
}

impl HelloPacket {
    pub fn request(timestamp: u32) -> Self {
        Self {
            kind: HelloKind::Request,
            timestamp,
        }
    }

    pub fn response(timestamp: u32) -> Self {
        Self {
            kind: HelloKind::Response,
            timestamp,
        }
    }

    pub fn encode(&self) -> [u8; HANDSHAKE_PACKET_SIZE] {
        let mut buf = [0u8; HANDSHAKE_PACKET_SIZE];
        buf[0..4].copy_from_slice(&HANDSHAKE_MAGIC.to_be_bytes());
        buf[4] = match self.kind {
            HelloKind::Request => HELLO_REQUEST,
            HelloKind::Response => HELLO_RESPONSE,
        };
        buf[5..9].copy_from_slice(&self.timestamp.to_be_bytes());
        buf
    }

    /// `None` for anything that is not exactly a handshake packet.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() != HANDSHAKE_PACKET_SIZE {
            return None;
        }
        if u32::from_be_bytes([data[0], data[1], data[2], data[3]]) != HANDSHAKE_MAGIC {
            return None;
        }
        let kind = match data[4] {
            HELLO_REQUEST => HelloKind::Request,
            HELLO_RESPONSE => HelloKind::Response,
            _ => return None,
        };
        let timestamp = u32::from_be_bytes([data[5], data[6], data[7], data[8]]);
        Some(Self { kind, timestamp })
    }
}

/// What the handshake wants the caller to do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// Keep waiting.
    Pending,
    /// (Re)send a HELLO_REQUEST now.
    SendRequest,
    /// Both directions confirmed.
    Complete,
    /// Gave up.
    TimedOut,
}

/// Progress of one handshake attempt.
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    pub sent: bool,
    pub received: bool,
    pub elapsed_since_start: Duration,
    pub elapsed_since_last_send: Duration,
    /// A send was tried, successful or not; starts the retransmit timer.
    attempted: bool,
}

impl Handshake {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a HELLO packet went out.
    pub fn mark_sent(&mut self) {
        self.sent = true;
        self.attempted = true;
        self.elapsed_since_last_send = Duration::ZERO;
    }

    /// Record a HELLO request that could not be sent. `sent` stays false and
    /// the request is retried after the retransmit interval.
    pub fn mark_send_failed(&mut self) {
        self.attempted = true;
        self.elapsed_since_last_send = Duration::ZERO;
    }

    /// Record a HELLO packet from the peer. Returns the reply to send, if any.
    pub fn on_packet(&mut self, packet: HelloPacket, now_ms: u32) -> Option<HelloPacket> {
        self.received = true;
        match packet.kind {
            HelloKind::Request => Some(HelloPacket::response(now_ms)),
            HelloKind::Response => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.sent && self.received
    }

    /// Advance the clocks and decide the next step.
    pub fn tick(&mut self, dt: Duration) -> HandshakeStatus {
        self.elapsed_since_start += dt;
        self.elapsed_since_last_send += dt;

        if self.is_complete() {
            return HandshakeStatus::Complete;
        }
        if self.elapsed_since_start >= MAX_HANDSHAKE_TIMEOUT {
            return HandshakeStatus::TimedOut;
        }
        let due = !self.attempted || self.elapsed_since_last_send >= HANDSHAKE_RETRY_INTERVAL;
        if (!self.received || !self.sent) && due {
            return HandshakeStatus::SendRequest;
        }
        HandshakeStatus::Pending
    }
}
