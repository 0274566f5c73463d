//! ICE candidates and their priorities (RFC 8445 §5.1.2).

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::net::{LocalPath, Route};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateType {
    Host,
    #[serde(rename = "prflx")]
    PeerReflexive,
    #[serde(rename = "srflx")]
    ServerReflexive,
    #[serde(rename = "relay")]
    Relayed,
}

impl CandidateType {
    /// Type preference. Host sits below the reflexive types so that a public mapping is
    /// tried before a host address that is usually only reachable on the same LAN.
    pub const fn preference(self) -> u32 {
        match self {
            CandidateType::Host => 80,
            CandidateType::PeerReflexive => 110,
            CandidateType::ServerReflexive => 100,
            CandidateType::Relayed => 0,
        }
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CandidateType::Host => "host",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::Relayed => "relay",
        };
        f.write_str(name)
    }
}

/// `(type preference << 24) | (local preference << 8) | (256 - component)`, component 1.
pub fn candidate_priority(typ: CandidateType, local_preference: u16) -> u32 {
    (typ.preference() << 24) | ((local_preference as u32) << 8) | 255
}

/// Common view of local and remote candidates.
pub trait Candidate {
    fn typ(&self) -> CandidateType;
    fn address(&self) -> SocketAddr;
    fn priority(&self) -> u32;

    fn is_relayed(&self) -> bool {
        self.typ() == CandidateType::Relayed
    }
}

/// The part of a candidate that travels over signaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateInfo {
    #[serde(rename = "type")]
    pub typ: CandidateType,
    pub address: SocketAddr,
    pub priority: u32,
}

impl Candidate for CandidateInfo {
    fn typ(&self) -> CandidateType {
        self.typ
    }

    fn address(&self) -> SocketAddr {
        self.address
    }

    fn priority(&self) -> u32 {
        self.priority
    }
}

impl fmt::Display for CandidateInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.typ, self.address, self.priority)
    }
}

/// What a [`Lease`] keeps alive, identified within one candidate manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ResourceId {
    Socket(SocketAddr),
    Binding { local: SocketAddr, server: SocketAddr },
    Relay { local: SocketAddr, server: SocketAddr },
}

/// Reference on manager-owned resources, given back when dropped.
#[derive(Debug)]
pub(crate) struct Lease {
    resources: Vec<ResourceId>,
    releases: mpsc::UnboundedSender<Vec<ResourceId>>,
}

impl Lease {
    pub fn new(resources: Vec<ResourceId>, releases: mpsc::UnboundedSender<Vec<ResourceId>>) -> Self {
        Lease {
            resources,
            releases,
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let _ = self.releases.send(std::mem::take(&mut self.resources));
    }
}

/// A candidate we can send from.
#[derive(Debug)]
pub struct LocalCandidate {
    info: CandidateInfo,
    base: SocketAddr,
    local_preference: u16,
    path: LocalPath,
    lease: Option<Lease>,
}

impl LocalCandidate {
    pub(crate) fn new(
        typ: CandidateType,
        address: SocketAddr,
        base: SocketAddr,
        local_preference: u16,
        path: LocalPath,
        lease: Option<Lease>,
    ) -> Self {
        LocalCandidate {
            info: CandidateInfo {
                typ,
                address,
                priority: candidate_priority(typ, local_preference),
            },
            base,
            local_preference,
            path,
            lease,
        }
    }

    /// A peer-reflexive candidate learned from a check sent from `base`.
    pub(crate) fn peer_reflexive(address: SocketAddr, base: &LocalCandidate) -> Self {
        Self::new(
            CandidateType::PeerReflexive,
            address,
            base.base,
            base.local_preference,
            base.path.clone(),
            None,
        )
    }

    pub fn info(&self) -> CandidateInfo {
        self.info
    }

    /// Address the candidate actually sends from.
    pub fn base(&self) -> SocketAddr {
        self.base
    }

    pub fn local_preference(&self) -> u16 {
        self.local_preference
    }

    pub fn path(&self) -> &LocalPath {
        &self.path
    }

    pub fn route(&self) -> Route {
        self.path.route()
    }

    /// PRIORITY to put in checks sent from this candidate.
    pub fn peer_reflexive_priority(&self) -> u32 {
        candidate_priority(CandidateType::PeerReflexive, self.local_preference)
    }

    /// Give up this candidate's claim on its socket, binding or allocation.
    pub(crate) fn release(&mut self) {
        self.lease.take();
    }

    pub(crate) fn is_released(&self) -> bool {
        self.lease.is_none() && self.info.typ != CandidateType::PeerReflexive
    }
}

impl Candidate for LocalCandidate {
    fn typ(&self) -> CandidateType {
        self.info.typ
    }

    fn address(&self) -> SocketAddr {
        self.info.address
    }

    fn priority(&self) -> u32 {
        self.info.priority
    }
}

/// A candidate of the peer, from signaling or learned from its checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteCandidate {
    pub typ: CandidateType,
    pub address: SocketAddr,
    pub priority: u32,
}

impl From<CandidateInfo> for RemoteCandidate {
    fn from(info: CandidateInfo) -> Self {
        RemoteCandidate {
            typ: info.typ,
            address: info.address,
            priority: info.priority,
        }
    }
}

impl RemoteCandidate {
    pub fn info(&self) -> CandidateInfo {
        CandidateInfo {
            typ: self.typ,
            address: self.address,
            priority: self.priority,
        }
    }
}

impl Candidate for RemoteCandidate {
    fn typ(&self) -> CandidateType {
        self.typ
    }

    fn address(&self) -> SocketAddr {
        self.address
    }

    fn priority(&self) -> u32 {
        self.priority
    }
}

impl fmt::Display for RemoteCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.typ, self.address)
    }
}

fn is_link_local(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

/// Whether a check between `local` and `remote` can possibly work.
pub fn can_pair(local: &impl Candidate, remote: &impl Candidate) -> bool {
    let (l, r) = (local.address().ip(), remote.address().ip());
    if l.is_ipv4() != r.is_ipv4() {
        return false;
    }
    if is_link_local(l) != is_link_local(r) {
        return false;
    }
    // A relay on the public internet cannot reach a peer's private address.
    !(local.is_relayed() && is_private(r))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(typ: CandidateType, address: &str) -> CandidateInfo {
        CandidateInfo {
            typ,
            address: address.parse().unwrap(),
            priority: 0,
        }
    }

    #[test]
    fn test_priority_formula() {
        assert_eq!(candidate_priority(CandidateType::Host, 65535), 1_358_954_495);
        assert_eq!(
            candidate_priority(CandidateType::ServerReflexive, 65535),
            1_694_498_815
        );
        assert_eq!(
            candidate_priority(CandidateType::PeerReflexive, 65535),
            1_862_270_975
        );
        assert_eq!(candidate_priority(CandidateType::Relayed, 0), 255);
    }

    #[test]
    fn test_type_ordering() {
        let pref = 1000;
        let prio = |t| candidate_priority(t, pref);
        assert!(prio(CandidateType::PeerReflexive) > prio(CandidateType::ServerReflexive));
        assert!(prio(CandidateType::ServerReflexive) > prio(CandidateType::Host));
        assert!(prio(CandidateType::Host) > prio(CandidateType::Relayed));
    }

    #[test]
    fn test_pairing_filters() {
        let host4 = info(CandidateType::Host, "198.51.100.1:1");
        let host6 = info(CandidateType::Host, "[2001:db8::1]:1");
        let link_local6 = info(CandidateType::Host, "[fe80::1]:1");
        let relay = info(CandidateType::Relayed, "203.0.113.5:1");
        let private = info(CandidateType::Host, "192.168.1.20:1");
        let public = info(CandidateType::ServerReflexive, "198.51.100.2:1");

        assert!(can_pair(&host4, &public));
        assert!(!can_pair(&host4, &host6));
        assert!(!can_pair(&host6, &link_local6));
        assert!(!can_pair(&relay, &private));
        assert!(can_pair(&relay, &public));
        assert!(can_pair(&host4, &private));
    }

    #[test]
    fn test_signaling_json_shape() {
        let json = serde_json::to_value(info(CandidateType::ServerReflexive, "198.51.100.1:5000")).unwrap();
        assert_eq!(json["type"], "srflx");
        assert_eq!(json["address"], "198.51.100.1:5000");
        let back: CandidateInfo = serde_json::from_value(json).unwrap();
        assert_eq!(back.typ, CandidateType::ServerReflexive);
    }
}
