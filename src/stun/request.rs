//! A single STUN client transaction with retransmission (RFC 8489 §6.2.1).
//!
//! Each attempt is re-encoded with a TRANSACTION-TRANSMIT-COUNTER so the response can say
//! which attempt it answers, and the round-trip time is measured from that attempt rather
//! than from the first or last one.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::attribute::StunAttribute;
use super::manager::{InboundResponse, StunManager};
use super::message::{IntegrityKey, StunMessage};
use crate::net::LocalPath;

/// Wait after the first attempt; doubles with each further attempt.
pub const INITIAL_RTO: Duration = Duration::from_millis(500);

pub const MAX_ATTEMPTS: u8 = 7;

/// After the last attempt, wait this many initial RTOs for a straggling response.
const FINAL_WAIT_RTO_MULTIPLE: u32 = 16;

/// A response matched to its request.
#[derive(Debug, Clone)]
pub struct StunResponse {
    pub message: StunMessage,
    pub from: SocketAddr,
    pub rtt: Duration,
}

pub struct StunRequest {
    message: StunMessage,
    key: Option<IntegrityKey>,
    destination: SocketAddr,
}

impl StunRequest {
    /// The response is verified with the key `message` is signed with, if any.
    pub fn new(message: StunMessage, destination: SocketAddr) -> Self {
        let key = message.attributes().iter().find_map(|a| match a {
            StunAttribute::MessageIntegrity(key) => key.clone(),
            _ => None,
        });
        StunRequest {
            message,
            key,
            destination,
        }
    }

    /// How long to wait for a response after sending `attempt` (1-based).
    pub fn retransmit_timeout(attempt: u8) -> Duration {
        if attempt >= MAX_ATTEMPTS {
            INITIAL_RTO * FINAL_WAIT_RTO_MULTIPLE
        } else {
            INITIAL_RTO * (1u32 << (attempt.max(1) - 1))
        }
    }

    /// Run the transaction over `path`.
    ///
    /// Returns the first response (success or error class), or `None` on timeout or when
    /// the destination is permanently unreachable.
    pub async fn execute(self, manager: &Arc<StunManager>, path: &LocalPath) -> Option<StunResponse> {
        let id = self.message.transaction_id();
        let typ = self.message.typ();
        let mut pending = manager.register_transaction(id, self.key.clone());
        let mut sent_at: Vec<Instant> = Vec::with_capacity(MAX_ATTEMPTS as usize);

        for attempt in 1..=MAX_ATTEMPTS {
            let datagram = match self.message.with_transmit_counter(attempt, 0).encode() {
                Ok(datagram) => datagram,
                Err(e) => {
                    warn!("Cannot encode {:?} request {}: {}", typ, id, e);
                    return None;
                }
            };
            let now = Instant::now();
            sent_at.push(now);
            if let Err(e) = path.send_to(datagram, self.destination).await {
                if e.is_permanent() {
                    debug!("{:?} request {} to {} aborted: {}", typ, id, self.destination, e);
                    return None;
                }
                debug!("{:?} request {} attempt {} not sent: {}", typ, id, attempt, e);
            }

            let deadline = now + Self::retransmit_timeout(attempt);
            match tokio::time::timeout_at(deadline, pending.recv()).await {
                Ok(Some(response)) => return Some(complete(response, &sent_at)),
                Ok(None) => return None,
                Err(_) => trace!("{:?} request {} attempt {} timed out", typ, id, attempt),
            }
        }

        debug!(
            "{:?} request {} to {} got no response after {} attempts",
            typ, id, self.destination, MAX_ATTEMPTS
        );
        None
    }
}

fn complete(response: InboundResponse, sent_at: &[Instant]) -> StunResponse {
    let attempt = response
        .message
        .transmit_counter()
        .map(|(request, _)| request as usize)
        .filter(|n| (1..=sent_at.len()).contains(n))
        .unwrap_or(sent_at.len());
    let rtt = response
        .received_at
        .saturating_duration_since(sent_at[attempt - 1]);
    StunResponse {
        message: response.message,
        from: response.from,
        rtt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::memory::MemoryNetwork;
    use crate::scope::Scope;
    use crate::stun::{StunClass, StunType};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const LATENCY: Duration = Duration::from_millis(40);

    fn server() -> SocketAddr {
        "203.0.113.1:3478".parse().unwrap()
    }

    fn binding() -> StunMessage {
        StunMessage::request(StunType::Binding, vec![]).unwrap()
    }

    #[test]
    fn test_retransmit_schedule() {
        let waits: Vec<u64> = (1..=MAX_ATTEMPTS)
            .map(|n| StunRequest::retransmit_timeout(n).as_millis() as u64)
            .collect();
        assert_eq!(waits, vec![500, 1000, 2000, 4000, 8000, 16000, 8000]);
        assert_eq!(waits.iter().sum::<u64>(), 39_500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rtt_measured_from_answered_attempt() {
        let scope = Scope::new();
        let network = MemoryNetwork::new(LATENCY);
        network.spawn_stun_server(&scope, server(), true);
        let dropped = Arc::new(AtomicUsize::new(0));
        let counter = dropped.clone();
        network.set_drop_filter(move |_, to, _| {
            to == "203.0.113.1:3478".parse().unwrap() && counter.fetch_add(1, Ordering::SeqCst) < 6
        });
        let manager = StunManager::new();
        let socket = network.stun_socket(&scope, "198.51.100.1:4000", &manager);

        let start = Instant::now();
        let response = StunRequest::new(binding(), server())
            .execute(&manager, &LocalPath::Socket(socket))
            .await
            .unwrap();

        assert_eq!(response.message.class(), StunClass::ResponseSuccess);
        assert_eq!(response.message.transmit_counter().map(|c| c.0), Some(7));
        assert_eq!(response.rtt, LATENCY * 2);
        assert_eq!(Instant::now() - start, Duration::from_millis(31_500) + LATENCY * 2);
        scope.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rtt_falls_back_to_last_attempt_without_counter() {
        let scope = Scope::new();
        let network = MemoryNetwork::new(LATENCY);
        network.spawn_stun_server(&scope, server(), false);
        let manager = StunManager::new();
        let socket = network.stun_socket(&scope, "198.51.100.1:4000", &manager);

        let response = StunRequest::new(binding(), server())
            .execute(&manager, &LocalPath::Socket(socket))
            .await
            .unwrap();
        assert_eq!(response.rtt, LATENCY * 2);
        assert_eq!(response.from, server());
        scope.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_all_attempts() {
        let scope = Scope::new();
        let network = MemoryNetwork::new(LATENCY);
        let sent = Arc::new(AtomicUsize::new(0));
        let counter = sent.clone();
        network.set_drop_filter(move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });
        let manager = StunManager::new();
        let socket = network.stun_socket(&scope, "198.51.100.1:4000", &manager);

        let start = Instant::now();
        let response = StunRequest::new(binding(), server())
            .execute(&manager, &LocalPath::Socket(socket))
            .await;
        assert!(response.is_none());
        assert_eq!(sent.load(Ordering::SeqCst), MAX_ATTEMPTS as usize);
        assert_eq!(Instant::now() - start, Duration::from_millis(39_500));
        scope.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_destination_aborts() {
        let scope = Scope::new();
        let network = MemoryNetwork::new(LATENCY);
        network.set_unreachable(server());
        let manager = StunManager::new();
        let socket = network.stun_socket(&scope, "198.51.100.1:4000", &manager);

        let start = Instant::now();
        let response = StunRequest::new(binding(), server())
            .execute(&manager, &LocalPath::Socket(socket))
            .await;
        assert!(response.is_none());
        assert!(Instant::now() - start < INITIAL_RTO);
        scope.shutdown().await;
    }
}
