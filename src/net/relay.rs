//! TURN client allocation (RFC 8656) on a [`StunSocket`].
//!
//! The allocation is refreshed on a fixed period until it fails or is released. Peer
//! permissions are requested in batches by a background task; a send to a peer without a
//! permission installs one first. Once a channel is bound for a peer, traffic to it uses
//! ChannelData framing instead of Send indications.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::socket::{Endpoint, StunSocket};
use super::{LocalPath, Route};
use crate::error::SendError;
use crate::scope::Scope;
use crate::stun::channel_data::{CHANNEL_MAX, CHANNEL_MIN};
use crate::stun::{
    ChannelData, StunAttribute, StunClass, StunMessage, StunResponse, StunType, TransactionId,
};

/// Allocation refresh period.
pub const ALLOCATION_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// Permissions last 5 minutes on the server; refresh them a minute early.
pub const PERMISSION_REFRESH_INTERVAL: Duration = Duration::from_secs(4 * 60);

/// Channel bindings last 10 minutes on the server.
pub const CHANNEL_REFRESH_INTERVAL: Duration = Duration::from_secs(4 * 60);

/// Seconds requested for the allocation lifetime.
const REQUESTED_LIFETIME: u32 = 600;

/// REQUESTED-TRANSPORT value for UDP.
const TRANSPORT_UDP: u8 = 17;

/// Refresh error meaning the allocation no longer exists, which is what releasing wants.
const ALLOCATION_MISMATCH: u16 = 437;

/// Upper bound on how long releasing may hold up shutdown.
const RELEASE_TIMEOUT: Duration = Duration::from_secs(3);

/// How long a send waits for a permission another task is installing.
const PERMISSION_WAIT: Duration = Duration::from_secs(5);

/// A TURN server with optional short-term credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnServer {
    pub address: SocketAddr,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Permission {
    Requested,
    InFlight,
    Installed(Instant),
}

#[derive(Default)]
struct RelayState {
    permissions: HashMap<IpAddr, Permission>,
    channels: HashMap<SocketAddr, u16>,
    channel_peers: HashMap<u16, SocketAddr>,
    next_channel: u16,
}

pub struct RelayAllocation {
    endpoint: Endpoint,
    mapped: SocketAddr,
    relayed: SocketAddr,
    alive: AtomicBool,
    state: Mutex<RelayState>,
    permission_requests: Notify,
    /// Bumped whenever a permission batch completes.
    permissions_settled: watch::Sender<u64>,
    scope: Scope,
}

impl RelayAllocation {
    /// Allocate a relayed address on `server` through `socket`.
    pub async fn allocate(socket: &Arc<StunSocket>, server: &TurnServer) -> Option<Arc<RelayAllocation>> {
        let mut endpoint = Endpoint::new(socket.clone(), server.address);
        if let (Some(username), Some(password)) = (&server.username, &server.password) {
            endpoint = endpoint.with_credentials(username, password);
        }
        let response = endpoint
            .request(
                StunType::Allocate,
                vec![
                    StunAttribute::RequestedTransport(TRANSPORT_UDP),
                    StunAttribute::Lifetime(REQUESTED_LIFETIME),
                ],
            )
            .await?;
        if response.message.class() != StunClass::ResponseSuccess {
            warn!(
                "TURN allocation on {} refused with {:?}",
                server.address,
                response.message.error_code()
            );
            return None;
        }
        let (Some(relayed), Some(mapped)) = (
            response.message.xor_relayed_address(),
            response.message.mapped_address(),
        ) else {
            warn!("TURN allocation response from {} lacks addresses", server.address);
            return None;
        };
        info!(
            "TURN allocation on {} for {}: relayed {}, mapped {}",
            server.address,
            socket.local_addr(),
            relayed,
            mapped
        );

        let scope = socket.scope().child();
        let relay = Arc::new(RelayAllocation {
            endpoint,
            mapped,
            relayed,
            alive: AtomicBool::new(true),
            state: Mutex::new(RelayState {
                next_channel: CHANNEL_MIN,
                ..Default::default()
            }),
            permission_requests: Notify::new(),
            permissions_settled: watch::channel(0).0,
            scope: scope.clone(),
        });
        socket.add_relay(server.address, &relay);
        scope.spawn(refresh_allocation(relay.clone()));
        scope.spawn(maintain_permissions(relay.clone()));
        Some(relay)
    }

    pub fn relayed_address(&self) -> SocketAddr {
        self.relayed
    }

    pub fn mapped_address(&self) -> SocketAddr {
        self.mapped
    }

    pub fn server(&self) -> SocketAddr {
        self.endpoint.server()
    }

    pub fn socket(&self) -> &Arc<StunSocket> {
        self.endpoint.socket()
    }

    pub fn route(&self) -> Route {
        Route::Relayed {
            local: self.socket().local_addr(),
            server: self.server(),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Ask for a permission toward `peer` in the next batch.
    pub fn request_permission(&self, peer: SocketAddr) {
        let mut state = self.state.lock();
        if !state.permissions.contains_key(&peer.ip()) {
            state.permissions.insert(peer.ip(), Permission::Requested);
            drop(state);
            self.permission_requests.notify_one();
        }
    }

    /// Make sure `peer` may send to us before data goes out to it.
    async fn ensure_permission(&self, peer: SocketAddr) {
        let ip = peer.ip();
        let mut settled = self.permissions_settled.subscribe();
        let install = {
            let mut state = self.state.lock();
            match state.permissions.get(&ip).copied() {
                Some(Permission::Installed(_)) => return,
                Some(Permission::InFlight) => false,
                _ => {
                    state.permissions.insert(ip, Permission::InFlight);
                    true
                }
            }
        };
        if install {
            self.create_permissions(vec![ip], false).await;
            return;
        }
        let _ = tokio::time::timeout(PERMISSION_WAIT, async {
            while settled.changed().await.is_ok() {
                if matches!(
                    self.state.lock().permissions.get(&ip),
                    Some(Permission::Installed(_)) | None
                ) {
                    return;
                }
            }
        })
        .await;
    }

    /// Install permissions for `ips`, which the caller has marked in flight.
    async fn create_permissions(&self, ips: Vec<IpAddr>, paced: bool) {
        let attributes = ips
            .iter()
            .map(|ip| StunAttribute::XorPeerAddress(SocketAddr::new(*ip, 0)))
            .collect();
        let response = if paced {
            self.endpoint.request(StunType::CreatePermission, attributes).await
        } else {
            self.endpoint
                .request_unpaced(StunType::CreatePermission, attributes)
                .await
        };
        let ok = is_success(&response);
        {
            let mut state = self.state.lock();
            let now = Instant::now();
            for ip in &ips {
                if ok {
                    state.permissions.insert(*ip, Permission::Installed(now));
                } else {
                    state.permissions.remove(ip);
                }
            }
        }
        if ok {
            debug!("TURN permissions on {} installed for {:?}", self.server(), ips);
        } else {
            warn!("TURN permissions on {} for {:?} failed", self.server(), ips);
        }
        self.permissions_settled.send_modify(|n| *n += 1);
    }

    /// Bind a channel toward `peer` and keep it refreshed. Until the first bind succeeds,
    /// traffic to `peer` keeps using Send indications.
    pub fn bind_channel(self: &Arc<Self>, peer: SocketAddr) {
        let channel = {
            let mut state = self.state.lock();
            if state.channels.contains_key(&peer) {
                return;
            }
            if state.next_channel > CHANNEL_MAX {
                warn!("No TURN channel numbers left on {}", self.server());
                return;
            }
            let channel = state.next_channel;
            state.next_channel += 1;
            channel
        };
        self.scope.spawn(maintain_channel(self.clone(), peer, channel));
    }

    /// Send `data` to `peer` through the relay.
    pub async fn send_to(&self, data: Vec<u8>, peer: SocketAddr) -> Result<(), SendError> {
        if !self.is_alive() {
            return Err(SendError::Closed);
        }
        self.ensure_permission(peer).await;
        let channel = self.state.lock().channels.get(&peer).copied();
        let datagram = match channel {
            Some(channel) => ChannelData { channel, data }.encode(),
            None => StunMessage::new(
                StunType::Send,
                StunClass::Indication,
                TransactionId::random(),
                vec![
                    StunAttribute::XorPeerAddress(peer),
                    StunAttribute::Data(data),
                ],
            )
            .and_then(|m| m.encode())
            .map_err(|e| SendError::Io(std::io::Error::other(e)))?,
        };
        self.socket().send_to(datagram, self.server()).await
    }

    pub(crate) fn handle_channel_data(self: &Arc<Self>, frame: ChannelData) {
        let peer = self.state.lock().channel_peers.get(&frame.channel).copied();
        match peer {
            Some(peer) => self
                .socket()
                .deliver(&LocalPath::Relay(self.clone()), peer, &frame.data),
            None => debug!("ChannelData on unbound channel {:#06x}", frame.channel),
        }
    }

    pub(crate) fn handle_indication(self: &Arc<Self>, message: StunMessage) {
        if message.typ() != StunType::Data || message.class() != StunClass::Indication {
            debug!(
                "Ignoring {:?} {:?} from TURN server {}",
                message.typ(),
                message.class(),
                self.server()
            );
            return;
        }
        let (Some(peer), Some(data)) = (message.xor_peer_address(), message.data()) else {
            debug!("Data indication from {} without peer or data", self.server());
            return;
        };
        self.socket()
            .deliver(&LocalPath::Relay(self.clone()), peer, data);
    }

    /// Stop maintenance and delete the allocation on the server.
    ///
    /// Returns whether the server confirmed the allocation is gone. An allocation the
    /// server already forgot counts as released. Failures are logged; this never takes
    /// longer than a few seconds.
    pub async fn release(&self) -> bool {
        if !self.alive.swap(false, Ordering::SeqCst) {
            self.scope.shutdown().await;
            return false;
        }
        self.scope.shutdown().await;
        let request = self
            .endpoint
            .request_unpaced(StunType::Refresh, vec![StunAttribute::Lifetime(0)]);
        let released = match tokio::time::timeout(RELEASE_TIMEOUT, request).await {
            Ok(Some(response))
                if response.message.class() == StunClass::ResponseSuccess
                    || response.message.error_code() == Some(ALLOCATION_MISMATCH) =>
            {
                info!("TURN allocation {} on {} released", self.relayed, self.server());
                true
            }
            Ok(Some(response)) => {
                warn!(
                    "Releasing TURN allocation {} failed with {:?}",
                    self.relayed,
                    response.message.error_code()
                );
                false
            }
            Ok(None) | Err(_) => {
                warn!(
                    "TURN server {} did not confirm release of {}",
                    self.server(),
                    self.relayed
                );
                false
            }
        };
        self.socket().remove_relay(self.server());
        released
    }
}

fn is_success(response: &Option<StunResponse>) -> bool {
    response
        .as_ref()
        .is_some_and(|r| r.message.class() == StunClass::ResponseSuccess)
}

async fn refresh_allocation(relay: Arc<RelayAllocation>) {
    loop {
        tokio::time::sleep(ALLOCATION_REFRESH_INTERVAL).await;
        let response = relay
            .endpoint
            .request(
                StunType::Refresh,
                vec![StunAttribute::Lifetime(REQUESTED_LIFETIME)],
            )
            .await;
        if !is_success(&response) {
            warn!(
                "TURN allocation {} on {} could not be refreshed",
                relay.relayed,
                relay.server()
            );
            relay.alive.store(false, Ordering::SeqCst);
            return;
        }
        debug!("TURN allocation {} refreshed", relay.relayed);
    }
}

async fn maintain_permissions(relay: Arc<RelayAllocation>) {
    loop {
        let next_expiry = {
            let state = relay.state.lock();
            state
                .permissions
                .values()
                .filter_map(|p| match p {
                    Permission::Installed(at) => Some(*at + PERMISSION_REFRESH_INTERVAL),
                    _ => None,
                })
                .min()
        };
        match next_expiry {
            Some(at) => {
                tokio::select! {
                    _ = relay.permission_requests.notified() => {}
                    _ = tokio::time::sleep_until(at) => {}
                }
            }
            None => relay.permission_requests.notified().await,
        }

        let batch: Vec<IpAddr> = {
            let mut state = relay.state.lock();
            let now = Instant::now();
            let mut batch = Vec::new();
            for (ip, permission) in state.permissions.iter_mut() {
                let due = match permission {
                    Permission::Requested => true,
                    Permission::Installed(at) => now >= *at + PERMISSION_REFRESH_INTERVAL,
                    Permission::InFlight => false,
                };
                if due {
                    *permission = Permission::InFlight;
                    batch.push(*ip);
                }
            }
            batch
        };
        if !batch.is_empty() {
            relay.create_permissions(batch, true).await;
        }
    }
}

async fn maintain_channel(relay: Arc<RelayAllocation>, peer: SocketAddr, channel: u16) {
    loop {
        let response = relay
            .endpoint
            .request(
                StunType::ChannelBind,
                vec![
                    StunAttribute::ChannelNumber(channel),
                    StunAttribute::XorPeerAddress(peer),
                ],
            )
            .await;
        if !is_success(&response) {
            warn!(
                "Binding channel {:#06x} to {} on {} failed",
                channel,
                peer,
                relay.server()
            );
            return;
        }
        let first = {
            let mut state = relay.state.lock();
            state
                .permissions
                .insert(peer.ip(), Permission::Installed(Instant::now()));
            state.channel_peers.insert(channel, peer);
            state.channels.insert(peer, channel).is_none()
        };
        if first {
            info!("TURN channel {:#06x} bound to {} on {}", channel, peer, relay.server());
        }
        tokio::time::sleep(CHANNEL_REFRESH_INTERVAL).await;
    }
}
