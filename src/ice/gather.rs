//! Local candidate gathering and ownership of the sockets, bindings and allocations
//! behind candidates.
//!
//! Gathering runs once per manager. Every view returned by
//! [`CandidateManager::get_candidates`] receives all candidates found so far followed by
//! new ones as they appear. Each handed-out candidate holds a lease on the resources it
//! uses; when the last lease on a resource is dropped the resource is shut down, and the
//! manager is marked as partially shut down since later views can no longer get it.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, SocketAddrV6};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::{join, join_all};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::candidate::{CandidateType, Lease, LocalCandidate, ResourceId};
use crate::net::binding::StunBinding;
use crate::net::relay::{RelayAllocation, TurnServer};
use crate::net::socket::StunSocket;
use crate::net::{Interface, LocalPath, Network};
use crate::scope::Scope;
use crate::stun::{BindingPacer, StunManager};

/// Servers to discover reflexive and relayed candidates with.
#[derive(Debug, Clone, Default)]
pub struct GatherConfig {
    pub stun_servers: Vec<SocketAddr>,
    pub turn_servers: Vec<TurnServer>,
}

/// A usable local address with its place in the local-preference ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HostAddress {
    pub ip: IpAddr,
    pub scope_id: u32,
    pub local_preference: u16,
    pub vpn: bool,
}

impl HostAddress {
    fn bind_addr(&self) -> SocketAddr {
        match self.ip {
            IpAddr::V6(v6) => SocketAddr::V6(SocketAddrV6::new(v6, 0, 0, self.scope_id)),
            IpAddr::V4(_) => SocketAddr::new(self.ip, 0),
        }
    }
}

fn is_usable(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !v4.is_loopback() && !v4.is_unspecified() && !v4.is_multicast() && !v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            let site_local = (v6.segments()[0] & 0xffc0) == 0xfec0;
            !v6.is_loopback()
                && !v6.is_unspecified()
                && !v6.is_multicast()
                && !site_local
                && v6.to_ipv4_mapped().is_none()
        }
    }
}

fn is_link_local(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

/// Spread both families evenly over the ordering, IPv6 first (RFC 8421 §4).
fn interleave<T>(v6: Vec<T>, v4: Vec<T>) -> Vec<T> {
    let (n6, n4) = (v6.len(), v4.len());
    let (mut v6, mut v4) = (v6.into_iter(), v4.into_iter());
    let (mut e6, mut e4) = (0, 0);
    let mut out = Vec::with_capacity(n6 + n4);
    while e6 < n6 || e4 < n4 {
        let take_v6 = e6 < n6 && (e4 >= n4 || (e6 + 1) * n4 <= (e4 + 1) * n6);
        let next = if take_v6 {
            e6 += 1;
            v6.next()
        } else {
            e4 += 1;
            v4.next()
        };
        out.extend(next);
    }
    out
}

/// Usable addresses of `interfaces` in preference order. VPN addresses count down from
/// half the range so they always rank below physical ones.
pub(crate) fn host_addresses(interfaces: &[Interface]) -> Vec<HostAddress> {
    let (mut v6, mut v4) = (Vec::new(), Vec::new());
    for iface in interfaces {
        let vpn = iface.is_vpn();
        for &ip in &iface.addresses {
            if !is_usable(ip) {
                continue;
            }
            let scope_id = if ip.is_ipv6() && is_link_local(ip) {
                iface.index
            } else {
                0
            };
            let entry = (ip, scope_id, vpn);
            if ip.is_ipv4() {
                v4.push(entry);
            } else {
                v6.push(entry);
            }
        }
    }

    let mut physical = u16::MAX;
    let mut tunnel = u16::MAX / 2;
    interleave(v6, v4)
        .into_iter()
        .map(|(ip, scope_id, vpn)| {
            let counter = if vpn { &mut tunnel } else { &mut physical };
            let local_preference = *counter;
            *counter = counter.saturating_sub(1);
            HostAddress {
                ip,
                scope_id,
                local_preference,
                vpn,
            }
        })
        .collect()
}

#[derive(Clone)]
enum Resource {
    Socket(Arc<StunSocket>),
    Binding(Arc<StunBinding>),
    Relay(Arc<RelayAllocation>),
}

impl Resource {
    fn is_socket(&self) -> bool {
        matches!(self, Resource::Socket(_))
    }

    async fn shut_down(&self) {
        match self {
            Resource::Socket(socket) => socket.shutdown().await,
            Resource::Binding(binding) => binding.shutdown().await,
            Resource::Relay(relay) => {
                relay.release().await;
            }
        }
    }
}

/// Shut resources down, sockets last since bindings and allocations live on them.
async fn shut_down_all(mut resources: Vec<Resource>) {
    resources.sort_by_key(Resource::is_socket);
    for resource in resources {
        resource.shut_down().await;
    }
}

struct Discovered {
    typ: CandidateType,
    address: SocketAddr,
    base: SocketAddr,
    local_preference: u16,
    path: LocalPath,
    resources: Vec<ResourceId>,
}

#[derive(Default)]
struct GatherState {
    discovered: Vec<Discovered>,
    subscribers: Vec<mpsc::UnboundedSender<LocalCandidate>>,
    done: bool,
    refs: HashMap<ResourceId, usize>,
    resources: HashMap<ResourceId, Resource>,
}

impl GatherState {
    fn lease(
        &mut self,
        index: usize,
        releases: &mpsc::UnboundedSender<Vec<ResourceId>>,
    ) -> Option<LocalCandidate> {
        let found = &self.discovered[index];
        if !found.resources.iter().all(|r| self.resources.contains_key(r)) {
            return None;
        }
        for id in &found.resources {
            *self.refs.entry(*id).or_default() += 1;
        }
        Some(LocalCandidate::new(
            found.typ,
            found.address,
            found.base,
            found.local_preference,
            found.path.clone(),
            Some(Lease::new(found.resources.clone(), releases.clone())),
        ))
    }
}

struct Inner {
    scope: Scope,
    stun: Arc<StunManager>,
    pacer: BindingPacer,
    state: Arc<Mutex<GatherState>>,
    releases: mpsc::UnboundedSender<Vec<ResourceId>>,
    any_shut_down: Arc<AtomicBool>,
}

impl Inner {
    fn add_resource(&self, id: ResourceId, resource: Resource) {
        self.state.lock().resources.insert(id, resource);
    }

    fn publish(&self, found: Discovered) {
        info!(
            "Discovered {} candidate {} (base {})",
            found.typ, found.address, found.base
        );
        let mut state = self.state.lock();
        state.discovered.push(found);
        let index = state.discovered.len() - 1;
        let mut subscribers = std::mem::take(&mut state.subscribers);
        subscribers.retain(|s| !s.is_closed());
        for subscriber in &subscribers {
            if let Some(candidate) = state.lease(index, &self.releases) {
                let _ = subscriber.send(candidate);
            }
        }
        state.subscribers = subscribers;
    }
}

/// Owns the gathering task and everything candidates are built on.
pub struct CandidateManager {
    inner: Arc<Inner>,
}

impl CandidateManager {
    /// Start gathering on `network`'s interfaces.
    pub fn start(
        parent: &Scope,
        network: Arc<dyn Network>,
        stun: Arc<StunManager>,
        pacer: BindingPacer,
        config: GatherConfig,
    ) -> CandidateManager {
        let scope = parent.child();
        let (releases, release_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            scope: scope.clone(),
            stun,
            pacer,
            state: Arc::new(Mutex::new(GatherState::default())),
            releases,
            any_shut_down: Arc::new(AtomicBool::new(false)),
        });
        scope.spawn(run_releases(
            inner.state.clone(),
            inner.any_shut_down.clone(),
            release_rx,
        ));
        scope.spawn(gather(inner.clone(), network, config));
        CandidateManager { inner }
    }

    /// Every candidate found so far, then new ones until gathering finishes.
    pub fn get_candidates(&self) -> mpsc::UnboundedReceiver<LocalCandidate> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.state.lock();
        for index in 0..state.discovered.len() {
            if let Some(candidate) = state.lease(index, &self.inner.releases) {
                let _ = tx.send(candidate);
            }
        }
        if !state.done {
            state.subscribers.push(tx);
        }
        rx
    }

    /// True once any resource was shut down for lack of leases. Views created afterwards
    /// miss the candidates built on it, so callers should start a fresh manager.
    pub fn any_shut_down(&self) -> bool {
        self.inner.any_shut_down.load(Ordering::SeqCst)
    }

    pub fn is_done(&self) -> bool {
        self.inner.state.lock().done
    }

    /// Release every allocation and close every socket, whether leased or not.
    pub async fn shutdown(&self) {
        let resources: Vec<Resource> = {
            let mut state = self.inner.state.lock();
            state.done = true;
            state.subscribers.clear();
            state.refs.clear();
            state.resources.drain().map(|(_, r)| r).collect()
        };
        shut_down_all(resources).await;
        self.inner.any_shut_down.store(true, Ordering::SeqCst);
        self.inner.scope.shutdown().await;
    }
}

async fn run_releases(
    state: Arc<Mutex<GatherState>>,
    any_shut_down: Arc<AtomicBool>,
    mut releases: mpsc::UnboundedReceiver<Vec<ResourceId>>,
) {
    while let Some(ids) = releases.recv().await {
        let doomed: Vec<Resource> = {
            let mut state = state.lock();
            let mut doomed = Vec::new();
            for id in ids {
                let Some(count) = state.refs.get_mut(&id) else {
                    continue;
                };
                *count = count.saturating_sub(1);
                if *count == 0 {
                    state.refs.remove(&id);
                    if let Some(resource) = state.resources.remove(&id) {
                        debug!("Last lease on {:?} released", id);
                        doomed.push(resource);
                    }
                }
            }
            doomed
        };
        if !doomed.is_empty() {
            any_shut_down.store(true, Ordering::SeqCst);
            shut_down_all(doomed).await;
        }
    }
}

async fn gather(inner: Arc<Inner>, network: Arc<dyn Network>, config: GatherConfig) {
    let hosts = match network.interfaces() {
        Ok(interfaces) => host_addresses(&interfaces),
        Err(e) => {
            warn!("Cannot enumerate network interfaces: {}", e);
            Vec::new()
        }
    };
    if hosts.is_empty() {
        warn!("No usable local addresses");
    }

    let mut sockets = Vec::new();
    for host in &hosts {
        let addr = host.bind_addr();
        let transport = match network.bind(addr).await {
            Ok(transport) => transport,
            Err(e) => {
                warn!("Cannot bind {}: {}", addr, e);
                continue;
            }
        };
        let socket = match StunSocket::start(
            &inner.scope,
            transport,
            inner.stun.clone(),
            inner.pacer.clone(),
        ) {
            Ok(socket) => socket,
            Err(e) => {
                warn!("Cannot start socket on {}: {}", addr, e);
                continue;
            }
        };
        let local = socket.local_addr();
        inner.add_resource(ResourceId::Socket(local), Resource::Socket(socket.clone()));
        inner.publish(Discovered {
            typ: CandidateType::Host,
            address: local,
            base: local,
            local_preference: host.local_preference,
            path: LocalPath::Socket(socket.clone()),
            resources: vec![ResourceId::Socket(local)],
        });
        if !is_link_local(host.ip) {
            sockets.push((socket, host.local_preference));
        }
    }

    join_all(
        sockets
            .iter()
            .map(|(socket, preference)| discover_via_servers(&inner, socket, *preference, &config)),
    )
    .await;

    let mut state = inner.state.lock();
    state.done = true;
    state.subscribers.clear();
    info!(
        "Candidate gathering finished with {} candidates",
        state.discovered.len()
    );
}

async fn discover_via_servers(
    inner: &Inner,
    socket: &Arc<StunSocket>,
    local_preference: u16,
    config: &GatherConfig,
) {
    let local = socket.local_addr();
    let reflexive = config
        .stun_servers
        .iter()
        .filter(|server| server.is_ipv4() == local.is_ipv4())
        .map(|&server| async move {
            let Some(binding) = StunBinding::start(socket, server).await else {
                return;
            };
            let mapped = binding.mapped_address();
            if mapped == local {
                debug!("{} is not behind a NAT as seen from {}", local, server);
                binding.shutdown().await;
                return;
            }
            let id = ResourceId::Binding { local, server };
            inner.add_resource(id, Resource::Binding(binding));
            inner.publish(Discovered {
                typ: CandidateType::ServerReflexive,
                address: mapped,
                base: local,
                local_preference,
                path: LocalPath::Socket(socket.clone()),
                resources: vec![ResourceId::Socket(local), id],
            });
        });
    let relayed = config
        .turn_servers
        .iter()
        .filter(|server| server.address.is_ipv4() == local.is_ipv4())
        .map(|server| async move {
            let Some(relay) = RelayAllocation::allocate(socket, server).await else {
                return;
            };
            let id = ResourceId::Relay {
                local,
                server: server.address,
            };
            let address = relay.relayed_address();
            inner.add_resource(id, Resource::Relay(relay.clone()));
            inner.publish(Discovered {
                typ: CandidateType::Relayed,
                address,
                base: address,
                local_preference,
                path: LocalPath::Relay(relay),
                resources: vec![ResourceId::Socket(local), id],
            });
        });
    join(join_all(reflexive), join_all(relayed)).await;
}
