//! In-memory datagram network with fixed latency, plus STUN and TURN server fixtures.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::socket::StunSocket;
use super::{Interface, Network, UdpTransport};
use crate::scope::Scope;
use crate::stun::{
    BindingPacer, ChannelData, IntegrityKey, KeyLookup, NoKeys, StunAttribute, StunClass,
    StunManager, StunMessage, StunType,
};

type Packet = (Vec<u8>, SocketAddr);
type DropFilter = Box<dyn Fn(SocketAddr, SocketAddr, &[u8]) -> bool + Send + Sync>;

struct Hub {
    sockets: HashMap<SocketAddr, mpsc::UnboundedSender<Packet>>,
    unreachable: HashSet<SocketAddr>,
    /// One-to-one NAT, private to public address.
    nat: HashMap<IpAddr, IpAddr>,
    drop_filter: Option<DropFilter>,
    latency: Duration,
    next_port: u16,
}

#[derive(Clone)]
pub(crate) struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    /// Every datagram is delivered `latency` after it was sent.
    pub fn new(latency: Duration) -> Self {
        MemoryNetwork {
            hub: Arc::new(Mutex::new(Hub {
                sockets: HashMap::new(),
                unreachable: HashSet::new(),
                nat: HashMap::new(),
                drop_filter: None,
                latency,
                next_port: 40_000,
            })),
        }
    }

    /// Silently drop datagrams for which `filter(from, to, data)` is true.
    pub fn set_drop_filter(
        &self,
        filter: impl Fn(SocketAddr, SocketAddr, &[u8]) -> bool + Send + Sync + 'static,
    ) {
        self.hub.lock().drop_filter = Some(Box::new(filter));
    }

    /// Sends to `addr` fail with `NetworkUnreachable`.
    pub fn set_unreachable(&self, addr: SocketAddr) {
        self.hub.lock().unreachable.insert(addr);
    }

    /// Put `private` behind a full-cone NAT that keeps ports and shows `public` outside.
    pub fn set_nat(&self, private: &str, public: &str) {
        let private = private.parse().expect("valid test address");
        let public = public.parse().expect("valid test address");
        self.hub.lock().nat.insert(private, public);
    }

    pub fn bind(&self, addr: SocketAddr) -> io::Result<Arc<MemorySocket>> {
        let mut hub = self.hub.lock();
        let mut addr = addr;
        if addr.port() == 0 {
            loop {
                addr.set_port(hub.next_port);
                hub.next_port = hub.next_port.wrapping_add(1).max(1024);
                if !hub.sockets.contains_key(&addr) {
                    break;
                }
            }
        } else if hub.sockets.contains_key(&addr) {
            return Err(io::ErrorKind::AddrInUse.into());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        hub.sockets.insert(addr, tx);
        Ok(Arc::new(MemorySocket {
            addr,
            network: self.clone(),
            incoming: tokio::sync::Mutex::new(rx),
        }))
    }

    /// A host on this network with one `eth0` interface holding `addresses`.
    pub fn host(&self, addresses: &[&str]) -> MemoryHost {
        let addresses = addresses
            .iter()
            .map(|a| a.parse().expect("valid test address"))
            .collect();
        self.host_with(vec![Interface {
            name: "eth0".into(),
            index: 1,
            addresses,
        }])
    }

    pub fn host_with(&self, interfaces: Vec<Interface>) -> MemoryHost {
        MemoryHost {
            network: self.clone(),
            interfaces,
        }
    }

    /// A started [`StunSocket`] bound at `addr`, with its own pacer.
    pub fn stun_socket(&self, scope: &Scope, addr: &str, manager: &Arc<StunManager>) -> Arc<StunSocket> {
        let transport = self.bind(addr.parse().expect("valid test address")).expect("bind");
        let pacer = BindingPacer::new(scope, Duration::from_millis(50));
        StunSocket::start(scope, transport, manager.clone(), pacer).expect("start socket")
    }

    /// A STUN server answering Binding requests with the source address.
    pub fn spawn_stun_server(&self, scope: &Scope, addr: SocketAddr, echo_counter: bool) {
        let socket = self.bind(addr).expect("bind STUN server");
        scope.spawn(async move {
            let mut buf = vec![0u8; 2048];
            while let Ok((len, from)) = socket.recv_from(&mut buf).await {
                let Ok(request) = StunMessage::decode(&buf[..len], &NoKeys) else {
                    continue;
                };
                if request.typ() != StunType::Binding || request.class() != StunClass::Request {
                    continue;
                }
                let mut attributes = vec![StunAttribute::XorMappedAddress(from)];
                if let (true, Some((attempt, _))) = (echo_counter, request.transmit_counter()) {
                    attributes.push(StunAttribute::TransactionTransmitCounter {
                        request: attempt,
                        response: 1,
                    });
                }
                let response = StunMessage::new(
                    StunType::Binding,
                    StunClass::ResponseSuccess,
                    request.transaction_id(),
                    attributes,
                )
                .unwrap();
                let _ = socket.send_to(&response.encode().unwrap(), from).await;
            }
        });
    }

    /// A TURN server relaying from addresses on `relay_ip`.
    pub fn spawn_turn_server(
        &self,
        scope: &Scope,
        addr: SocketAddr,
        relay_ip: IpAddr,
        password: Option<&str>,
    ) -> Arc<TurnStats> {
        let server = Arc::new(TurnServer {
            network: self.clone(),
            socket: self.bind(addr).expect("bind TURN server"),
            relay_ip,
            key: password.map(IntegrityKey::short_term),
            allocations: Mutex::new(HashMap::new()),
            stats: Arc::new(TurnStats::default()),
            scope: scope.clone(),
        });
        let stats = server.stats.clone();
        scope.spawn(server.run());
        stats
    }
}

pub(crate) struct MemorySocket {
    addr: SocketAddr,
    network: MemoryNetwork,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Packet>>,
}

#[async_trait]
impl UdpTransport for MemorySocket {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        let (tx, latency, source) = {
            let hub = self.network.hub.lock();
            if hub.unreachable.contains(&target) {
                return Err(io::ErrorKind::NetworkUnreachable.into());
            }
            if hub
                .drop_filter
                .as_ref()
                .is_some_and(|drop| drop(self.addr, target, buf))
            {
                return Ok(buf.len());
            }
            let source = match hub.nat.get(&self.addr.ip()) {
                Some(public) => SocketAddr::new(*public, self.addr.port()),
                None => self.addr,
            };
            let target = hub
                .nat
                .iter()
                .find(|(_, public)| **public == target.ip())
                .map(|(private, _)| SocketAddr::new(*private, target.port()))
                .unwrap_or(target);
            match hub.sockets.get(&target) {
                Some(tx) => (tx.clone(), hub.latency, source),
                None => return Ok(buf.len()),
            }
        };
        let packet = (buf.to_vec(), source);
        if latency.is_zero() {
            let _ = tx.send(packet);
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(latency).await;
                let _ = tx.send(packet);
            });
        }
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut incoming = self.incoming.lock().await;
        let (data, from) = incoming
            .recv()
            .await
            .ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionAborted))?;
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok((len, from))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}

impl Drop for MemorySocket {
    fn drop(&mut self) {
        self.network.hub.lock().sockets.remove(&self.addr);
    }
}

pub(crate) struct MemoryHost {
    network: MemoryNetwork,
    interfaces: Vec<Interface>,
}

#[async_trait]
impl Network for MemoryHost {
    fn interfaces(&self) -> io::Result<Vec<Interface>> {
        Ok(self.interfaces.clone())
    }

    async fn bind(&self, addr: SocketAddr) -> io::Result<Arc<dyn UdpTransport>> {
        let socket: Arc<dyn UdpTransport> = self.network.bind(addr)?;
        Ok(socket)
    }
}

/// What the TURN fixture has been asked to do.
#[derive(Default)]
pub(crate) struct TurnStats {
    pub allocations: AtomicUsize,
    pub releases: AtomicUsize,
    pub refreshes: AtomicUsize,
    pub channel_binds: AtomicUsize,
    pub permissions: Mutex<Vec<IpAddr>>,
    pub channel_data_relayed: AtomicUsize,
}

struct Allocation {
    relay: Arc<MemorySocket>,
    permissions: HashSet<IpAddr>,
    channels: HashMap<u16, SocketAddr>,
}

struct TurnServer {
    network: MemoryNetwork,
    socket: Arc<MemorySocket>,
    relay_ip: IpAddr,
    key: Option<IntegrityKey>,
    allocations: Mutex<HashMap<SocketAddr, Allocation>>,
    stats: Arc<TurnStats>,
    scope: Scope,
}

impl TurnServer {
    async fn run(self: Arc<Self>) {
        let mut buf = vec![0u8; 2048];
        while let Ok((len, from)) = self.socket.recv_from(&mut buf).await {
            let data = &buf[..len];
            if let Some(frame) = ChannelData::try_decode(data) {
                self.relay_channel_data(from, frame).await;
                continue;
            }
            let keys: &dyn KeyLookup = match &self.key {
                Some(key) => key,
                None => &NoKeys,
            };
            let Ok(message) = StunMessage::decode(data, keys) else {
                continue;
            };
            if message.class() == StunClass::Indication {
                self.relay_send_indication(from, &message).await;
                continue;
            }
            if message.class() != StunClass::Request {
                continue;
            }
            let reply = self.clone().handle_request(from, &message);
            let _ = self.socket.send_to(&reply.encode().unwrap(), from).await;
        }
    }

    fn handle_request(self: Arc<Self>, from: SocketAddr, request: &StunMessage) -> StunMessage {
        if self.key.is_some() && !request.is_authenticated() {
            return self.error(request, 401, "Unauthorized");
        }
        let mut allocations = self.allocations.lock();
        match request.typ() {
            StunType::Allocate => {
                if allocations.contains_key(&from) {
                    return self.error(request, 437, "Allocation Mismatch");
                }
                let relay = self
                    .network
                    .bind(SocketAddr::new(self.relay_ip, 0))
                    .unwrap();
                let relayed = relay.addr;
                allocations.insert(
                    from,
                    Allocation {
                        relay: relay.clone(),
                        permissions: HashSet::new(),
                        channels: HashMap::new(),
                    },
                );
                self.stats.allocations.fetch_add(1, Ordering::SeqCst);
                self.scope.spawn(self.clone().run_relay(from, relay));
                self.success(
                    request,
                    vec![
                        StunAttribute::XorRelayedAddress(relayed),
                        StunAttribute::XorMappedAddress(from),
                        StunAttribute::Lifetime(600),
                    ],
                )
            }
            StunType::Refresh => {
                let lifetime = request.attributes().iter().find_map(|a| match a {
                    StunAttribute::Lifetime(l) => Some(*l),
                    _ => None,
                });
                if !allocations.contains_key(&from) {
                    return self.error(request, 437, "Allocation Mismatch");
                }
                if lifetime == Some(0) {
                    allocations.remove(&from);
                    self.stats.releases.fetch_add(1, Ordering::SeqCst);
                } else {
                    self.stats.refreshes.fetch_add(1, Ordering::SeqCst);
                }
                self.success(request, vec![StunAttribute::Lifetime(lifetime.unwrap_or(600))])
            }
            StunType::CreatePermission => {
                let Some(allocation) = allocations.get_mut(&from) else {
                    return self.error(request, 437, "Allocation Mismatch");
                };
                for attribute in request.attributes() {
                    if let StunAttribute::XorPeerAddress(peer) = attribute {
                        allocation.permissions.insert(peer.ip());
                        self.stats.permissions.lock().push(peer.ip());
                    }
                }
                self.success(request, vec![])
            }
            StunType::ChannelBind => {
                let channel = request.attributes().iter().find_map(|a| match a {
                    StunAttribute::ChannelNumber(c) => Some(*c),
                    _ => None,
                });
                let (Some(channel), Some(peer)) = (channel, request.xor_peer_address()) else {
                    return self.error(request, 400, "Bad Request");
                };
                let Some(allocation) = allocations.get_mut(&from) else {
                    return self.error(request, 437, "Allocation Mismatch");
                };
                allocation.channels.insert(channel, peer);
                allocation.permissions.insert(peer.ip());
                self.stats.channel_binds.fetch_add(1, Ordering::SeqCst);
                self.success(request, vec![])
            }
            _ => self.error(request, 400, "Bad Request"),
        }
    }

    fn success(&self, request: &StunMessage, mut attributes: Vec<StunAttribute>) -> StunMessage {
        if let Some(key) = &self.key {
            attributes.push(StunAttribute::MessageIntegrity(Some(key.clone())));
        }
        StunMessage::new(
            request.typ(),
            StunClass::ResponseSuccess,
            request.transaction_id(),
            attributes,
        )
        .unwrap()
    }

    fn error(&self, request: &StunMessage, code: u16, reason: &str) -> StunMessage {
        StunMessage::new(
            request.typ(),
            StunClass::ResponseError,
            request.transaction_id(),
            vec![StunAttribute::ErrorCode {
                code,
                reason: reason.into(),
            }],
        )
        .unwrap()
    }

    async fn relay_channel_data(&self, client: SocketAddr, frame: ChannelData) {
        let target = {
            let allocations = self.allocations.lock();
            allocations.get(&client).and_then(|a| {
                let peer = a.channels.get(&frame.channel)?;
                Some((a.relay.clone(), *peer))
            })
        };
        if let Some((relay, peer)) = target {
            self.stats.channel_data_relayed.fetch_add(1, Ordering::SeqCst);
            let _ = relay.send_to(&frame.data, peer).await;
        }
    }

    async fn relay_send_indication(&self, client: SocketAddr, message: &StunMessage) {
        if message.typ() != StunType::Send {
            return;
        }
        let (Some(peer), Some(data)) = (message.xor_peer_address(), message.data()) else {
            return;
        };
        let relay = {
            let allocations = self.allocations.lock();
            allocations
                .get(&client)
                .filter(|a| a.permissions.contains(&peer.ip()))
                .map(|a| a.relay.clone())
        };
        if let Some(relay) = relay {
            let _ = relay.send_to(data, peer).await;
        }
    }

    async fn run_relay(self: Arc<Self>, client: SocketAddr, relay: Arc<MemorySocket>) {
        let mut buf = vec![0u8; 2048];
        while let Ok((len, peer)) = relay.recv_from(&mut buf).await {
            let frame = {
                let allocations = self.allocations.lock();
                let Some(allocation) = allocations.get(&client) else {
                    return;
                };
                if !allocation.permissions.contains(&peer.ip()) {
                    continue;
                }
                let channel = allocation
                    .channels
                    .iter()
                    .find(|(_, p)| **p == peer)
                    .map(|(c, _)| *c);
                match channel {
                    Some(channel) => ChannelData {
                        channel,
                        data: buf[..len].to_vec(),
                    }
                    .encode(),
                    None => StunMessage::new(
                        StunType::Data,
                        StunClass::Indication,
                        crate::stun::TransactionId::random(),
                        vec![
                            StunAttribute::XorPeerAddress(peer),
                            StunAttribute::Data(buf[..len].to_vec()),
                        ],
                    )
                    .unwrap()
                    .encode()
                    .unwrap(),
                }
            };
            let _ = self.socket.send_to(&frame, client).await;
        }
    }
}
