//! Server-reflexive address discovery and keep-alive against one STUN server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use super::socket::{Endpoint, StunSocket};
use crate::scope::Scope;
use crate::stun::{StunClass, StunType};

/// Binding refresh period; keeps the NAT mapping alive.
pub const BINDING_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

pub struct StunBinding {
    server: SocketAddr,
    mapped: watch::Receiver<SocketAddr>,
    scope: Scope,
}

impl StunBinding {
    /// Query `server` from `socket`. `None` if it never answered with a mapped address.
    pub async fn start(socket: &Arc<StunSocket>, server: SocketAddr) -> Option<Arc<StunBinding>> {
        let endpoint = Endpoint::new(socket.clone(), server);
        let mapped = query(&endpoint).await?;
        info!(
            "STUN binding via {}: {} maps to {}",
            server,
            socket.local_addr(),
            mapped
        );
        let scope = socket.scope().child();
        let (tx, rx) = watch::channel(mapped);
        scope.spawn(refresh(endpoint, tx));
        Some(Arc::new(StunBinding {
            server,
            mapped: rx,
            scope,
        }))
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    pub fn mapped_address(&self) -> SocketAddr {
        *self.mapped.borrow()
    }

    /// Observe mapped-address changes; the channel closes when refreshing stops.
    pub fn subscribe(&self) -> watch::Receiver<SocketAddr> {
        self.mapped.clone()
    }

    pub async fn shutdown(&self) {
        self.scope.shutdown().await;
    }
}

async fn query(endpoint: &Endpoint) -> Option<SocketAddr> {
    let response = endpoint.request(StunType::Binding, vec![]).await?;
    if response.message.class() != StunClass::ResponseSuccess {
        debug!(
            "Binding request to {} failed with {:?}",
            endpoint.server(),
            response.message.error_code()
        );
        return None;
    }
    response.message.mapped_address()
}

async fn refresh(endpoint: Endpoint, mapped: watch::Sender<SocketAddr>) {
    loop {
        tokio::time::sleep(BINDING_REFRESH_INTERVAL).await;
        let Some(address) = query(&endpoint).await else {
            debug!(
                "STUN binding {} via {} lapsed",
                endpoint.socket().local_addr(),
                endpoint.server()
            );
            return;
        };
        if *mapped.borrow() != address {
            info!(
                "Mapped address of {} via {} changed to {}",
                endpoint.socket().local_addr(),
                endpoint.server(),
                address
            );
            mapped.send_replace(address);
        }
    }
}
