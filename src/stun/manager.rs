//! Demultiplexing of received STUN traffic.
//!
//! Responses are matched to outstanding client transactions by transaction id. Requests
//! are routed to the virtual server registered under the local part of their USERNAME,
//! whose password is also the key their MESSAGE-INTEGRITY is verified with.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::message::{IntegrityKey, KeyLookup, StunClass, StunMessage, TransactionId};
use crate::error::StunError;
use crate::net::LocalPath;

/// An authenticated request for a registered virtual server.
#[derive(Debug)]
pub struct InboundRequest {
    pub message: StunMessage,
    pub from: SocketAddr,
    /// Where the request arrived, and so where the response must leave from.
    pub path: LocalPath,
}

#[derive(Debug)]
pub(crate) struct InboundResponse {
    pub message: StunMessage,
    pub from: SocketAddr,
    pub received_at: Instant,
}

struct Transaction {
    key: Option<IntegrityKey>,
    responses: mpsc::UnboundedSender<InboundResponse>,
}

struct VirtualServer {
    key: IntegrityKey,
    requests: mpsc::UnboundedSender<InboundRequest>,
}

#[derive(Default)]
struct Registry {
    transactions: HashMap<TransactionId, Transaction>,
    servers: HashMap<String, VirtualServer>,
}

impl KeyLookup for Registry {
    fn lookup(
        &self,
        class: StunClass,
        transaction_id: &TransactionId,
        username: Option<&str>,
    ) -> Option<IntegrityKey> {
        if class.is_response() {
            return self
                .transactions
                .get(transaction_id)
                .and_then(|t| t.key.clone());
        }
        let ufrag = local_ufrag(username?);
        self.servers.get(ufrag).map(|s| s.key.clone())
    }
}

/// ICE usernames are `receiver:sender`; the receiver's part names the local server.
fn local_ufrag(username: &str) -> &str {
    username.split(':').next().unwrap_or(username)
}

/// Process-wide STUN dispatcher shared by every socket.
#[derive(Default)]
pub struct StunManager {
    registry: Mutex<Registry>,
}

impl StunManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Accept requests addressed to `ufrag`, authenticated with `password`.
    ///
    /// The registration lasts until the returned handle is dropped.
    pub fn register_server(self: &Arc<Self>, ufrag: &str, password: &str) -> ServerRegistration {
        let (tx, rx) = mpsc::unbounded_channel();
        let server = VirtualServer {
            key: IntegrityKey::short_term(password),
            requests: tx.clone(),
        };
        if self
            .registry
            .lock()
            .servers
            .insert(ufrag.to_string(), server)
            .is_some()
        {
            warn!("Replaced existing STUN server registration for {}", ufrag);
        }
        ServerRegistration {
            ufrag: ufrag.to_string(),
            sender: tx,
            requests: rx,
            manager: Arc::downgrade(self),
        }
    }

    /// Route responses for `id` to the returned handle until it is dropped.
    pub(crate) fn register_transaction(
        self: &Arc<Self>,
        id: TransactionId,
        key: Option<IntegrityKey>,
    ) -> PendingTransaction {
        let (tx, rx) = mpsc::unbounded_channel();
        self.registry.lock().transactions.insert(
            id,
            Transaction {
                key,
                responses: tx,
            },
        );
        PendingTransaction {
            id,
            responses: rx,
            manager: Arc::downgrade(self),
        }
    }

    /// Decode and dispatch one datagram that looks like STUN.
    ///
    /// Responses and authenticated server requests are consumed. Anything else that
    /// decodes (indications, requests for no registered server) is handed back.
    pub fn handle_datagram(
        &self,
        data: &[u8],
        from: SocketAddr,
        path: &LocalPath,
    ) -> Option<StunMessage> {
        let received_at = Instant::now();
        let registry = self.registry.lock();
        let message = match StunMessage::decode(data, &*registry) {
            Ok(message) => message,
            Err(StunError::IntegrityMismatch) => {
                warn!("Dropping STUN message from {} with bad MESSAGE-INTEGRITY", from);
                return None;
            }
            Err(e) => {
                warn!("Dropping undecodable STUN message from {}: {}", from, e);
                return None;
            }
        };

        match message.class() {
            StunClass::ResponseSuccess | StunClass::ResponseError => {
                let id = message.transaction_id();
                match registry.transactions.get(&id) {
                    Some(transaction) => {
                        let _ = transaction.responses.send(InboundResponse {
                            message,
                            from,
                            received_at,
                        });
                    }
                    None => debug!("Response {} from {} matches no transaction", id, from),
                }
                None
            }
            StunClass::Request => {
                if matches!(message.integrity(), Some(None)) {
                    warn!(
                        "Dropping {:?} request from {}: MESSAGE-INTEGRITY without a known key",
                        message.typ(),
                        from
                    );
                    return None;
                }
                let server = message
                    .username()
                    .map(local_ufrag)
                    .and_then(|ufrag| registry.servers.get(ufrag));
                match server {
                    Some(server) if message.is_authenticated() => {
                        let _ = server.requests.send(InboundRequest {
                            message,
                            from,
                            path: path.clone(),
                        });
                        None
                    }
                    Some(_) => {
                        warn!("Dropping unauthenticated {:?} request from {}", message.typ(), from);
                        None
                    }
                    None => Some(message),
                }
            }
            StunClass::Indication => Some(message),
        }
    }
}

/// Receiving end of a virtual server.
pub struct ServerRegistration {
    ufrag: String,
    sender: mpsc::UnboundedSender<InboundRequest>,
    requests: mpsc::UnboundedReceiver<InboundRequest>,
    manager: Weak<StunManager>,
}

impl ServerRegistration {
    pub async fn recv(&mut self) -> Option<InboundRequest> {
        self.requests.recv().await
    }
}

impl Drop for ServerRegistration {
    fn drop(&mut self) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let mut registry = manager.registry.lock();
        let ours = registry
            .servers
            .get(&self.ufrag)
            .is_some_and(|s| s.requests.same_channel(&self.sender));
        if ours {
            registry.servers.remove(&self.ufrag);
        }
    }
}

pub(crate) struct PendingTransaction {
    id: TransactionId,
    responses: mpsc::UnboundedReceiver<InboundResponse>,
    manager: Weak<StunManager>,
}

impl PendingTransaction {
    pub async fn recv(&mut self) -> Option<InboundResponse> {
        self.responses.recv().await
    }
}

impl Drop for PendingTransaction {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.registry.lock().transactions.remove(&self.id);
        }
    }
}
