//! Peer-to-peer UDP connectivity establishment: a STUN/TURN client stack, candidate
//! gathering and a Trickle ICE agent.

pub mod config;
pub mod error;
pub mod ice;
pub mod net;
pub mod scope;
pub mod stun;

pub use error::{IceError, SendError, StunError};
pub use ice::{
    CandidateInfo, CandidateManager, CandidateType, Credentials, IceAgent, IceConfig,
    LocalCandidate, SelectedPair,
};
pub use scope::Scope;
pub use stun::{BindingPacer, StunManager};

/// Fill `N` bytes from the OS random source.
pub(crate) fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    getrandom::getrandom(&mut buf).expect("OS random source is available");
    buf
}
