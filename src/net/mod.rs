//! UDP transport seams, interface enumeration and the per-address STUN sockets built on them.

pub mod binding;
#[cfg(test)]
pub(crate) mod memory;
pub mod relay;
pub mod socket;

use std::collections::BTreeMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use network_interface::{NetworkInterface, NetworkInterfaceConfig};

use crate::error::SendError;
use relay::RelayAllocation;
use socket::StunSocket;

/// A bound datagram socket.
#[async_trait]
pub trait UdpTransport: Send + Sync + 'static {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl UdpTransport for tokio::net::UdpSocket {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        tokio::net::UdpSocket::send_to(self, buf, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        tokio::net::UdpSocket::recv_from(self, buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        tokio::net::UdpSocket::local_addr(self)
    }
}

/// One network interface and its addresses.
#[derive(Debug, Clone)]
pub struct Interface {
    pub name: String,
    pub index: u32,
    pub addresses: Vec<IpAddr>,
}

impl Interface {
    /// Name-based guess whether this is a VPN tunnel.
    pub fn is_vpn(&self) -> bool {
        const PREFIXES: [&str; 8] = ["tun", "tap", "wg", "utun", "ppp", "ipsec", "zt", "tailscale"];
        let name = self.name.to_ascii_lowercase();
        PREFIXES.iter().any(|p| name.starts_with(p)) || name.contains("vpn")
    }
}

/// Where candidate sockets come from.
#[async_trait]
pub trait Network: Send + Sync + 'static {
    fn interfaces(&self) -> io::Result<Vec<Interface>>;
    async fn bind(&self, addr: SocketAddr) -> io::Result<Arc<dyn UdpTransport>>;
}

/// The host's real interfaces and tokio UDP sockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemNetwork;

#[async_trait]
impl Network for SystemNetwork {
    fn interfaces(&self) -> io::Result<Vec<Interface>> {
        let mut by_name: BTreeMap<String, Interface> = BTreeMap::new();
        for iface in NetworkInterface::show().map_err(io::Error::other)? {
            let entry = by_name.entry(iface.name.clone()).or_insert_with(|| Interface {
                name: iface.name.clone(),
                index: iface.index,
                addresses: Vec::new(),
            });
            for addr in &iface.addr {
                if !entry.addresses.contains(&addr.ip()) {
                    entry.addresses.push(addr.ip());
                }
            }
        }
        let mut interfaces: Vec<Interface> = by_name.into_values().collect();
        interfaces.sort_by_key(|i| i.index);
        Ok(interfaces)
    }

    async fn bind(&self, addr: SocketAddr) -> io::Result<Arc<dyn UdpTransport>> {
        let socket = tokio::net::UdpSocket::bind(addr).await?;
        Ok(Arc::new(socket))
    }
}

/// Send errors after which retrying the same destination is pointless.
pub fn is_unreachable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::AddrNotAvailable
    )
}

/// The local socket, and TURN allocation on it if any, a datagram travels through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    Direct { local: SocketAddr },
    Relayed { local: SocketAddr, server: SocketAddr },
}

/// Payload from a peer that was not STUN.
#[derive(Debug)]
pub struct InboundData {
    pub route: Route,
    pub from: SocketAddr,
    pub data: Vec<u8>,
}

pub type DataSink = tokio::sync::mpsc::UnboundedSender<InboundData>;

/// Send handle of a local candidate: its socket, or the TURN allocation on that socket.
#[derive(Clone)]
pub enum LocalPath {
    Socket(Arc<StunSocket>),
    Relay(Arc<RelayAllocation>),
}

impl LocalPath {
    pub fn route(&self) -> Route {
        match self {
            LocalPath::Socket(socket) => Route::Direct {
                local: socket.local_addr(),
            },
            LocalPath::Relay(relay) => relay.route(),
        }
    }

    pub fn socket(&self) -> &Arc<StunSocket> {
        match self {
            LocalPath::Socket(socket) => socket,
            LocalPath::Relay(relay) => relay.socket(),
        }
    }

    pub fn is_relayed(&self) -> bool {
        matches!(self, LocalPath::Relay(_))
    }

    /// Boxed because relay sends may install a permission, which itself sends through a
    /// `LocalPath`.
    pub fn send_to(&self, data: Vec<u8>, to: SocketAddr) -> BoxFuture<'_, Result<(), SendError>> {
        match self {
            LocalPath::Socket(socket) => socket.send_to(data, to).boxed(),
            LocalPath::Relay(relay) => relay.send_to(data, to).boxed(),
        }
    }

    /// Route non-STUN payloads arriving from `peer` on this path to `sink`.
    pub fn register_peer(&self, peer: SocketAddr, sink: DataSink) {
        self.socket().register_peer(self.route(), peer, sink);
    }
}

impl std::fmt::Debug for LocalPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LocalPath({:?})", self.route())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vpn_detection() {
        let iface = |name: &str| Interface {
            name: name.into(),
            index: 1,
            addresses: vec![],
        };
        assert!(iface("tun0").is_vpn());
        assert!(iface("wg0").is_vpn());
        assert!(iface("utun3").is_vpn());
        assert!(iface("NordVPN").is_vpn());
        assert!(!iface("eth0").is_vpn());
        assert!(!iface("wlan0").is_vpn());
        assert!(!iface("en0").is_vpn());
    }

    #[test]
    fn test_unreachable_classification() {
        assert!(is_unreachable(&io::Error::from(
            io::ErrorKind::NetworkUnreachable
        )));
        assert!(!is_unreachable(&io::Error::from(io::ErrorKind::WouldBlock)));
    }
}
