//! icelink: NAT traversal for a single UDP peer-to-peer path.
//!
//! Gathers host, server-reflexive (STUN) and relayed (TURN) candidates,
//! connects over the best direct pair with a fallback to the relay, and
//! confirms the path with a small HELLO handshake before carrying
//! application datagrams.
//!
//! ```no_run
//! use std::time::Duration;
//! use icelink::{Candidate, IceAgent, IceConfig};
//!
//! let mut agent = IceAgent::with_system_network(IceConfig::load().unwrap_or_default());
//! agent.gather_candidates();
//! for c in agent.local_candidates() {
//!     println!("{}", c); // send to the peer
//! }
//! agent.add_remote_candidate(Candidate::from_string(
//!     "candidate:1 1 UDP 2130706431 192.168.1.11 5001 typ host",
//! ));
//! agent.start_connectivity_checks();
//! while !agent.state().is_terminal() {
//!     agent.tick(Duration::from_millis(50));
//!     std::thread::sleep(Duration::from_millis(50));
//! }
//! ```

pub mod agent;
pub mod auth;
pub mod candidate;
pub mod config;
pub mod gather;
pub mod handshake;
pub mod state;
pub mod stun;
pub mod transport;
pub mod turn;

pub use agent::{IceAgent, PathKind, SelectedPath};
pub use candidate::{Candidate, CandidateParseError, CandidateType, Transport};
pub use config::IceConfig;
pub use state::{ConnectionState, StateHandle};
pub use stun::StunError;
