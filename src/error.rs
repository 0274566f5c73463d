//! Error types shared across the STUN, transport and ICE layers.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Failures while encoding or decoding STUN messages.
#[derive(Debug, Error)]
pub enum StunError {
    #[error("malformed STUN message: {0}")]
    Malformed(String),

    #[error("STUN magic cookie mismatch")]
    BadMagicCookie,

    #[error("unknown comprehension-required attribute 0x{0:04x}")]
    UnknownRequiredAttribute(u16),

    #[error("{class:?} is not a valid class for {typ:?}")]
    IncompatibleClass {
        typ: crate::stun::StunType,
        class: crate::stun::StunClass,
    },

    #[error("MESSAGE-INTEGRITY verification failed")]
    IntegrityMismatch,

    #[error("MESSAGE-INTEGRITY attribute has no key to sign with")]
    MissingIntegrityKey,
}

/// Outcome of a failed datagram send.
#[derive(Debug, Error)]
pub enum SendError {
    /// The destination is known to be unreachable from this socket.
    #[error("{0} is unreachable")]
    Unreachable(SocketAddr),

    #[error("socket closed")]
    Closed,

    #[error("send failed: {0}")]
    Io(#[from] io::Error),
}

impl SendError {
    /// Whether retrying the same send can never succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(self, SendError::Unreachable(_) | SendError::Closed)
    }
}

/// Caller-visible ICE failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IceError {
    /// Nomination found no candidate pair that passed its connectivity check.
    #[error("no valid connection could be established")]
    NoValidPair,

    #[error("ICE agent closed")]
    Closed,
}
