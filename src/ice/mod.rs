//! Trickle ICE on top of the STUN/TURN stack.

mod agent;
mod candidate;
mod gather;
mod pair;
#[cfg(test)]
mod tests;

use std::fmt::Write as _;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use agent::{IceAgent, IceChannels, IceInputs, SelectedPair};
pub use candidate::{
    can_pair, candidate_priority, Candidate, CandidateInfo, CandidateType, LocalCandidate,
    RemoteCandidate,
};
pub use gather::{CandidateManager, GatherConfig};
pub use pair::{pair_priority, PairState, MAX_CHECKLIST_LEN};

/// Relay legs are charged this much extra RTT when the best pair is chosen.
pub const DEFAULT_RELAY_LATENCY_THRESHOLD: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
pub struct IceConfig {
    pub controlling: bool,
    pub relay_latency_threshold: Duration,
}

impl IceConfig {
    pub fn new(controlling: bool) -> Self {
        IceConfig {
            controlling,
            relay_latency_threshold: DEFAULT_RELAY_LATENCY_THRESHOLD,
        }
    }
}

/// ICE username fragment and password, exchanged over signaling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub ufrag: String,
    pub password: String,
}

impl Credentials {
    pub fn random() -> Self {
        Credentials {
            ufrag: hex(&crate::random_bytes::<4>()),
            password: hex(&crate::random_bytes::<16>()),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{:02x}", b);
        s
    })
}
