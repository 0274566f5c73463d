//! A bound UDP socket shared by STUN, TURN and peer traffic.
//!
//! Outbound datagrams go through a bounded queue drained by one sender task. The receiver
//! task sorts inbound datagrams: ChannelData and Data indications from a TURN server are
//! unwrapped and re-dispatched as if they had arrived on the relayed address, STUN goes to
//! the [`StunManager`], and everything else to the data sink registered for the peer.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use super::relay::RelayAllocation;
use super::{is_unreachable, DataSink, InboundData, LocalPath, Route, UdpTransport};
use crate::error::SendError;
use crate::scope::Scope;
use crate::stun::{
    looks_like_stun, BindingPacer, ChannelData, IntegrityKey, StunAttribute, StunManager,
    StunMessage, StunRequest, StunResponse, StunType,
};

/// Datagrams waiting for the sender task.
const SEND_QUEUE_LEN: usize = 256;

const RECV_BUFFER_LEN: usize = 65_536;

/// Pause after a receive error so a persistently failing socket does not spin.
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(50);

struct Outgoing {
    data: Vec<u8>,
    to: SocketAddr,
    done: oneshot::Sender<Result<(), SendError>>,
}

#[derive(Default)]
struct SocketState {
    unreachable: HashSet<SocketAddr>,
    relays: HashMap<SocketAddr, Weak<RelayAllocation>>,
    peers: HashMap<(Route, SocketAddr), DataSink>,
}

pub struct StunSocket {
    local_addr: SocketAddr,
    outgoing: mpsc::Sender<Outgoing>,
    manager: Arc<StunManager>,
    pacer: BindingPacer,
    state: Mutex<SocketState>,
    scope: Scope,
}

impl StunSocket {
    /// Start the sender and receiver tasks for `transport` in a child of `parent`.
    pub fn start(
        parent: &Scope,
        transport: Arc<dyn UdpTransport>,
        manager: Arc<StunManager>,
        pacer: BindingPacer,
    ) -> std::io::Result<Arc<StunSocket>> {
        let local_addr = transport.local_addr()?;
        let scope = parent.child();
        let (outgoing, queue) = mpsc::channel(SEND_QUEUE_LEN);
        let socket = Arc::new(StunSocket {
            local_addr,
            outgoing,
            manager,
            pacer,
            state: Mutex::new(SocketState::default()),
            scope: scope.clone(),
        });
        scope.spawn(run_sender(transport.clone(), queue, Arc::downgrade(&socket)));
        scope.spawn(run_receiver(transport, Arc::downgrade(&socket)));
        debug!("Socket {} started", local_addr);
        Ok(socket)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn manager(&self) -> &Arc<StunManager> {
        &self.manager
    }

    pub fn pacer(&self) -> &BindingPacer {
        &self.pacer
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Queue `data` for `to` and wait until the OS accepted or refused it.
    pub async fn send_to(&self, data: Vec<u8>, to: SocketAddr) -> Result<(), SendError> {
        if self.state.lock().unreachable.contains(&to) {
            return Err(SendError::Unreachable(to));
        }
        let (done, result) = oneshot::channel();
        self.outgoing
            .send(Outgoing { data, to, done })
            .await
            .map_err(|_| SendError::Closed)?;
        result.await.map_err(|_| SendError::Closed)?
    }

    /// Deliver non-STUN datagrams from `peer` arriving via `route` to `sink`.
    ///
    /// Registrations whose receiver has gone away are dropped here.
    pub fn register_peer(&self, route: Route, peer: SocketAddr, sink: DataSink) {
        let mut state = self.state.lock();
        state.peers.retain(|_, registered| !registered.is_closed());
        state.peers.insert((route, peer), sink);
    }

    pub(crate) fn add_relay(&self, server: SocketAddr, relay: &Arc<RelayAllocation>) {
        self.state
            .lock()
            .relays
            .insert(server, Arc::downgrade(relay));
    }

    pub(crate) fn remove_relay(&self, server: SocketAddr) {
        self.state.lock().relays.remove(&server);
    }

    pub async fn shutdown(&self) {
        self.scope.shutdown().await;
        debug!("Socket {} closed", self.local_addr);
    }

    fn dispatch(self: &Arc<Self>, data: &[u8], from: SocketAddr) {
        let relay = self
            .state
            .lock()
            .relays
            .get(&from)
            .and_then(Weak::upgrade);
        match relay {
            Some(relay) => self.dispatch_from_relay_server(&relay, data, from),
            None => self.deliver(&LocalPath::Socket(self.clone()), from, data),
        }
    }

    fn dispatch_from_relay_server(
        self: &Arc<Self>,
        relay: &Arc<RelayAllocation>,
        data: &[u8],
        server: SocketAddr,
    ) {
        if let Some(frame) = ChannelData::try_decode(data) {
            relay.handle_channel_data(frame);
        } else if looks_like_stun(data) {
            let path = LocalPath::Socket(self.clone());
            if let Some(message) = self.manager.handle_datagram(data, server, &path) {
                relay.handle_indication(message);
            }
        } else {
            debug!("Unrecognised {}-byte datagram from TURN server {}", data.len(), server);
        }
    }

    /// Hand a datagram from `peer` to STUN handling or to the peer's data sink.
    pub(crate) fn deliver(&self, path: &LocalPath, peer: SocketAddr, data: &[u8]) {
        if looks_like_stun(data) {
            if let Some(message) = self.manager.handle_datagram(data, peer, path) {
                debug!(
                    "Ignoring {:?} {:?} from {} on {}",
                    message.typ(),
                    message.class(),
                    peer,
                    self.local_addr
                );
            }
            return;
        }

        let key = (path.route(), peer);
        let mut state = self.state.lock();
        let Some(sink) = state.peers.get(&key) else {
            trace!("No receiver for {} bytes from {} on {:?}", data.len(), peer, key.0);
            return;
        };
        let inbound = InboundData {
            route: key.0,
            from: peer,
            data: data.to_vec(),
        };
        if sink.send(inbound).is_err() {
            state.peers.remove(&key);
        }
    }

    fn mark_unreachable(&self, to: SocketAddr) {
        let mut state = self.state.lock();
        if state.unreachable.insert(to) {
            debug!("{} is unreachable from {}", to, self.local_addr);
        }
        // Nothing can be exchanged with `to` directly any more. Relayed traffic from the
        // same address still arrives through the TURN server.
        state
            .peers
            .retain(|(route, peer), _| *peer != to || matches!(route, Route::Relayed { .. }));
    }
}

async fn run_sender(
    transport: Arc<dyn UdpTransport>,
    mut queue: mpsc::Receiver<Outgoing>,
    socket: Weak<StunSocket>,
) {
    while let Some(Outgoing { data, to, done }) = queue.recv().await {
        let result = match transport.send_to(&data, to).await {
            Ok(_) => Ok(()),
            Err(e) if is_unreachable(&e) => {
                if let Some(socket) = socket.upgrade() {
                    socket.mark_unreachable(to);
                }
                Err(SendError::Unreachable(to))
            }
            Err(e) => Err(SendError::Io(e)),
        };
        let _ = done.send(result);
    }
}

async fn run_receiver(transport: Arc<dyn UdpTransport>, socket: Weak<StunSocket>) {
    let mut buf = vec![0u8; RECV_BUFFER_LEN];
    loop {
        let received = transport.recv_from(&mut buf).await;
        let Some(socket) = socket.upgrade() else {
            return;
        };
        match received {
            Ok((len, from)) => socket.dispatch(&buf[..len], from),
            Err(e) => {
                // ICMP errors for earlier sends surface here on some platforms.
                trace!("Receive on {} failed: {}", socket.local_addr, e);
                drop(socket);
                tokio::time::sleep(RECV_ERROR_BACKOFF).await;
            }
        }
    }
}

/// A STUN or TURN server reached through one socket, optionally with short-term credentials.
#[derive(Clone)]
pub struct Endpoint {
    socket: Arc<StunSocket>,
    server: SocketAddr,
    credentials: Option<(String, IntegrityKey)>,
}

impl Endpoint {
    pub fn new(socket: Arc<StunSocket>, server: SocketAddr) -> Self {
        Endpoint {
            socket,
            server,
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some((username.to_string(), IntegrityKey::short_term(password)));
        self
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    pub fn socket(&self) -> &Arc<StunSocket> {
        &self.socket
    }

    /// Send a request on the high-priority pacer lane.
    pub async fn request(&self, typ: StunType, attributes: Vec<StunAttribute>) -> Option<StunResponse> {
        self.socket.pacer.wait(true).await;
        self.request_unpaced(typ, attributes).await
    }

    /// Send a request without waiting for a pacer slot.
    pub async fn request_unpaced(
        &self,
        typ: StunType,
        mut attributes: Vec<StunAttribute>,
    ) -> Option<StunResponse> {
        if let Some((username, key)) = &self.credentials {
            attributes.push(StunAttribute::Username(username.clone()));
            attributes.push(StunAttribute::MessageIntegrity(Some(key.clone())));
        }
        let message = match StunMessage::request(typ, attributes) {
            Ok(message) => message,
            Err(e) => {
                warn!("Cannot build {:?} request: {}", typ, e);
                return None;
            }
        };
        let path = LocalPath::Socket(self.socket.clone());
        StunRequest::new(message, self.server)
            .execute(&self.socket.manager, &path)
            .await
    }

    /// Send an indication; there is no response to wait for.
    pub async fn indicate(&self, message: StunMessage) -> Result<(), SendError> {
        let datagram = message
            .encode()
            .map_err(|e| SendError::Io(std::io::Error::other(e)))?;
        self.socket.send_to(datagram, self.server).await
    }
}
