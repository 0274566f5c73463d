//! Two agents connecting over the in-memory network.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use super::*;
use crate::error::IceError;
use crate::net::memory::MemoryNetwork;
use crate::net::relay::TurnServer;
use crate::net::UdpTransport;
use crate::scope::Scope;
use crate::stun::{
    BindingPacer, IntegrityKey, StunAttribute, StunAttributeType, StunClass, StunManager,
    StunMessage, StunType,
};

const STUN_SERVER: &str = "203.0.113.1:3478";
const TURN_SERVER: &str = "203.0.113.2:3478";
const TURN_RELAY_IP: &str = "203.0.113.3";
const HOST_A: &str = "198.51.100.1";
const HOST_B: &str = "198.51.100.2";

struct Side {
    agent: IceAgent,
    inbound: mpsc::Receiver<Vec<u8>>,
    outbound: mpsc::Sender<Vec<u8>>,
    _candidates: CandidateManager,
}

struct Setup {
    credentials: Credentials,
    remote_credentials: oneshot::Sender<Credentials>,
    remote_candidates: mpsc::UnboundedSender<CandidateInfo>,
    trickle: mpsc::UnboundedReceiver<CandidateInfo>,
    side: Side,
}

fn start_side(
    scope: &Scope,
    network: &MemoryNetwork,
    host: &str,
    controlling: bool,
    gather: GatherConfig,
) -> Setup {
    let pacer = BindingPacer::new(scope, Duration::from_millis(50));
    start_side_with(scope, network, host, controlling, gather, pacer)
}

fn start_side_with(
    scope: &Scope,
    network: &MemoryNetwork,
    host: &str,
    controlling: bool,
    gather: GatherConfig,
    pacer: BindingPacer,
) -> Setup {
    let stun = StunManager::new();
    let candidates = CandidateManager::start(
        scope,
        Arc::new(network.host(&[host])),
        stun.clone(),
        pacer.clone(),
        gather,
    );
    let credentials = Credentials::random();
    let (credentials_tx, credentials_rx) = oneshot::channel();
    let (remote_tx, remote_rx) = mpsc::unbounded_channel();
    let (agent, channels) = IceAgent::start(
        scope,
        stun,
        pacer,
        IceConfig::new(controlling),
        IceInputs {
            local_credentials: credentials.clone(),
            remote_credentials: credentials_rx,
            local_candidates: candidates.get_candidates(),
            remote_candidates: remote_rx,
        },
    );
    let IceChannels {
        local_candidates,
        inbound,
        outbound,
    } = channels;
    Setup {
        credentials,
        remote_credentials: credentials_tx,
        remote_candidates: remote_tx,
        trickle: local_candidates,
        side: Side {
            agent,
            inbound,
            outbound,
            _candidates: candidates,
        },
    }
}

/// Exchange credentials and trickle candidates between the two sides.
fn signal(scope: &Scope, a: Setup, b: Setup) -> (Side, Side) {
    let _ = a.remote_credentials.send(b.credentials.clone());
    let _ = b.remote_credentials.send(a.credentials.clone());
    for (mut from, to) in [
        (a.trickle, b.remote_candidates),
        (b.trickle, a.remote_candidates),
    ] {
        scope.spawn(async move {
            while let Some(candidate) = from.recv().await {
                if to.send(candidate).is_err() {
                    break;
                }
            }
        });
    }
    (a.side, b.side)
}

fn gather_config(with_turn: bool) -> GatherConfig {
    GatherConfig {
        stun_servers: vec![STUN_SERVER.parse().unwrap()],
        turn_servers: if with_turn {
            vec![TurnServer {
                address: TURN_SERVER.parse().unwrap(),
                username: None,
                password: None,
            }]
        } else {
            Vec::new()
        },
    }
}

fn no_servers() -> GatherConfig {
    GatherConfig {
        stun_servers: Vec::new(),
        turn_servers: Vec::new(),
    }
}

fn servers(scope: &Scope, network: &MemoryNetwork) {
    network.spawn_stun_server(scope, STUN_SERVER.parse().unwrap(), true);
    network.spawn_turn_server(
        scope,
        TURN_SERVER.parse().unwrap(),
        TURN_RELAY_IP.parse().unwrap(),
        None,
    );
}

fn is_host_ip(addr: SocketAddr) -> bool {
    [HOST_A, HOST_B]
        .iter()
        .any(|h| addr.ip() == h.parse::<IpAddr>().unwrap())
}

fn is_behind_nat(addr: SocketAddr) -> bool {
    matches!(addr.ip(), IpAddr::V4(ip) if ip.octets()[0] == 10)
}

fn is_binding_request(data: &[u8]) -> bool {
    data.starts_with(&[0x00, 0x01])
}

async fn selected(side: &Side) -> Result<SelectedPair, IceError> {
    tokio::time::timeout(Duration::from_secs(180), side.agent.selected())
        .await
        .expect("ICE finished in time")
}

async fn exchange(a: &mut Side, b: &mut Side) {
    a.outbound.send(b"ping".to_vec()).await.unwrap();
    let got = tokio::time::timeout(Duration::from_secs(5), b.inbound.recv()).await;
    assert_eq!(got.unwrap().unwrap(), b"ping");

    b.outbound.send(b"pong".to_vec()).await.unwrap();
    let got = tokio::time::timeout(Duration::from_secs(5), a.inbound.recv()).await;
    assert_eq!(got.unwrap().unwrap(), b"pong");
}

#[tokio::test(start_paused = true)]
async fn test_direct_connection() {
    let scope = Scope::new();
    let network = MemoryNetwork::new(Duration::from_millis(20));
    servers(&scope, &network);
    let a = start_side(&scope, &network, HOST_A, true, gather_config(false));
    let b = start_side(&scope, &network, HOST_B, false, gather_config(false));
    let (mut a, mut b) = signal(&scope, a, b);

    let on_a = selected(&a).await.unwrap();
    let on_b = selected(&b).await.unwrap();
    a.agent.ready_for_data().await;
    b.agent.ready_for_data().await;

    assert_eq!(on_a.local.address, on_b.remote.address);
    assert_eq!(on_a.remote.address, on_b.local.address);
    assert_eq!(on_a.local.typ, CandidateType::Host);
    assert!(on_a.rtt.is_some());
    assert!(a.agent.is_controlling());
    assert!(!b.agent.is_controlling());
    assert_eq!(b.agent.selected_pair(), Some(on_b));

    exchange(&mut a, &mut b).await;
    a.agent.close().await;
    b.agent.close().await;
    scope.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_falls_back_to_relay() {
    let scope = Scope::new();
    let network = MemoryNetwork::new(Duration::from_millis(20));
    servers(&scope, &network);
    // The hosts cannot reach each other; only the TURN server can reach both.
    network.set_drop_filter(|from, to, _| is_host_ip(from) && is_host_ip(to));
    let a = start_side(&scope, &network, HOST_A, true, gather_config(true));
    let b = start_side(&scope, &network, HOST_B, false, gather_config(true));
    let (mut a, mut b) = signal(&scope, a, b);

    let on_a = selected(&a).await.unwrap();
    let on_b = selected(&b).await.unwrap();
    assert_eq!(on_a.local.address, on_b.remote.address);
    assert_eq!(on_a.remote.address, on_b.local.address);
    let relay_ip: IpAddr = TURN_RELAY_IP.parse().unwrap();
    assert!(on_a.local.address.ip() == relay_ip || on_a.remote.address.ip() == relay_ip);

    exchange(&mut a, &mut b).await;
    scope.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_peer_fails() {
    let scope = Scope::new();
    let network = MemoryNetwork::new(Duration::from_millis(20));
    servers(&scope, &network);
    network.set_drop_filter(|from, to, _| is_host_ip(from) && is_host_ip(to));
    let a = start_side(&scope, &network, HOST_A, true, gather_config(false));
    let b = start_side(&scope, &network, HOST_B, false, gather_config(false));
    let (a, b) = signal(&scope, a, b);

    assert_eq!(selected(&a).await, Err(IceError::NoValidPair));
    assert!(b.agent.selected_pair().is_none());
    scope.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_both_sides_behind_nat() {
    let scope = Scope::new();
    let network = MemoryNetwork::new(Duration::from_millis(20));
    servers(&scope, &network);
    network.set_nat("10.0.0.1", HOST_A);
    network.set_nat("10.0.1.1", HOST_B);
    // Private addresses are only reachable from inside their own NAT.
    network.set_drop_filter(|_, to, _| is_behind_nat(to));
    let a = start_side(&scope, &network, "10.0.0.1", true, gather_config(false));
    let b = start_side(&scope, &network, "10.0.1.1", false, gather_config(false));
    let (mut a, mut b) = signal(&scope, a, b);

    let on_a = selected(&a).await.unwrap();
    let on_b = selected(&b).await.unwrap();
    assert_eq!(on_a.local.address, on_b.remote.address);
    assert_eq!(on_a.remote.address, on_b.local.address);
    // The public mapping shows up as server- or peer-reflexive, whichever is learned first.
    assert_ne!(on_a.local.typ, CandidateType::Host);
    assert_ne!(on_b.local.typ, CandidateType::Host);
    assert_eq!(on_a.local.address.ip(), HOST_A.parse::<IpAddr>().unwrap());
    assert_eq!(on_b.local.address.ip(), HOST_B.parse::<IpAddr>().unwrap());

    exchange(&mut a, &mut b).await;
    scope.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_peer_reflexive_discovery() {
    let scope = Scope::new();
    let network = MemoryNetwork::new(Duration::from_millis(20));
    // B only knows its private address; A learns B's mapping from B's checks.
    network.set_nat("10.0.1.1", HOST_B);
    network.set_drop_filter(|_, to, _| is_behind_nat(to));
    let a = start_side(&scope, &network, HOST_A, true, no_servers());
    let b = start_side(&scope, &network, "10.0.1.1", false, no_servers());
    let (mut a, mut b) = signal(&scope, a, b);

    let on_a = selected(&a).await.unwrap();
    let on_b = selected(&b).await.unwrap();
    assert_eq!(on_a.local.typ, CandidateType::Host);
    assert_eq!(on_a.remote.typ, CandidateType::PeerReflexive);
    assert_eq!(on_a.remote.address.ip(), HOST_B.parse::<IpAddr>().unwrap());
    assert_eq!(on_b.local.typ, CandidateType::PeerReflexive);
    assert_eq!(on_b.local.address, on_a.remote.address);
    assert_eq!(on_b.remote.address, on_a.local.address);

    exchange(&mut a, &mut b).await;
    scope.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_nomination_while_own_check_in_flight() {
    let scope = Scope::new();
    let network = MemoryNetwork::new(Duration::from_millis(20));
    let start = Instant::now();
    let allow_b_checks_at = start + Duration::from_secs(35);
    let b_ip: IpAddr = HOST_B.parse().unwrap();
    // B's own checks go unanswered until after A has nominated, so B's first check is
    // still in flight when the nomination arrives and fails later.
    network.set_drop_filter(move |from, _, data| {
        from.ip() == b_ip && is_binding_request(data) && Instant::now() < allow_b_checks_at
    });
    let a = start_side(&scope, &network, HOST_A, true, no_servers());
    let b = start_side(&scope, &network, HOST_B, false, no_servers());
    let (mut a, mut b) = signal(&scope, a, b);

    let on_a = selected(&a).await.unwrap();
    assert!(Instant::now() < allow_b_checks_at);
    let on_b = selected(&b).await.unwrap();
    assert!(Instant::now() >= allow_b_checks_at);
    assert_eq!(on_a.local.address, on_b.remote.address);
    assert_eq!(on_a.remote.address, on_b.local.address);

    exchange(&mut a, &mut b).await;
    scope.shutdown().await;
}

/// Answer checks the way the ice4j-based peer does, counting requests with and without
/// USE-CANDIDATE.
fn spawn_legacy_peer(
    scope: &Scope,
    network: &MemoryNetwork,
    addr: SocketAddr,
    credentials: &Credentials,
) -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let socket = network.bind(addr).unwrap();
    let key = IntegrityKey::short_term(&credentials.password);
    let checks = Arc::new(AtomicUsize::new(0));
    let nominations = Arc::new(AtomicUsize::new(0));
    let (c, n) = (checks.clone(), nominations.clone());
    scope.spawn(async move {
        let mut buf = vec![0u8; 2048];
        while let Ok((len, from)) = socket.recv_from(&mut buf).await {
            let Ok(request) = StunMessage::decode(&buf[..len], &key) else {
                continue;
            };
            if request.class() != StunClass::Request || !request.is_authenticated() {
                continue;
            }
            if request.has(StunAttributeType::UseCandidate) {
                n.fetch_add(1, Ordering::SeqCst);
            } else {
                c.fetch_add(1, Ordering::SeqCst);
            }
            let response = StunMessage::new(
                StunType::Binding,
                StunClass::ResponseSuccess,
                request.transaction_id(),
                vec![
                    StunAttribute::XorMappedAddress(from),
                    StunAttribute::Software("ice4j.org".into()),
                    StunAttribute::MessageIntegrity(Some(key.clone())),
                ],
            )
            .unwrap();
            let _ = socket.send_to(&response.encode().unwrap(), from).await;
        }
    });
    (checks, nominations)
}

#[tokio::test(start_paused = true)]
async fn test_legacy_peer_nominated_early_without_rtt_checks() {
    let scope = Scope::new();
    let network = MemoryNetwork::new(Duration::from_millis(20));
    let peer_addr = SocketAddr::new(HOST_B.parse().unwrap(), 5000);
    let peer_credentials = Credentials::random();
    let (checks, nominations) = spawn_legacy_peer(&scope, &network, peer_addr, &peer_credentials);

    let start = Instant::now();
    let a = start_side(&scope, &network, HOST_A, true, no_servers());
    a.remote_credentials.send(peer_credentials).unwrap();
    a.remote_candidates
        .send(CandidateInfo {
            typ: CandidateType::Host,
            address: peer_addr,
            priority: candidate_priority(CandidateType::Host, 65535),
        })
        .unwrap();

    let on_a = selected(&a.side).await.unwrap();
    assert_eq!(on_a.remote.address, peer_addr);
    // Well inside the thirty seconds a regular peer gets to run checks.
    assert!(Instant::now() - start < Duration::from_secs(5));
    assert_eq!(checks.load(Ordering::SeqCst), 1);
    assert_eq!(nominations.load(Ordering::SeqCst), 1);
    a.side.agent.ready_for_data().await;
    scope.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_checks_stop_when_pacer_stops() {
    let scope = Scope::new();
    let network = MemoryNetwork::new(Duration::from_millis(20));
    let sent = Arc::new(AtomicUsize::new(0));
    let counter = sent.clone();
    network.set_drop_filter(move |_, _, data| {
        if is_binding_request(data) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        false
    });
    let pacer_scope = Scope::new();
    let pacer = BindingPacer::new(&pacer_scope, Duration::from_millis(50));
    pacer_scope.shutdown().await;

    let a = start_side_with(&scope, &network, HOST_A, true, no_servers(), pacer.clone());
    let b = start_side_with(&scope, &network, HOST_B, false, no_servers(), pacer);
    let (a, b) = signal(&scope, a, b);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(sent.load(Ordering::SeqCst), 0);
    assert!(a.agent.selected_pair().is_none());
    assert!(b.agent.selected_pair().is_none());
    scope.shutdown().await;
}

#[test]
fn test_random_credentials() {
    let one = Credentials::random();
    let two = Credentials::random();
    assert_eq!(one.ufrag.len(), 8);
    assert_eq!(one.password.len(), 32);
    assert!(one.password.chars().all(|c| c.is_ascii_hexdigit()));
    assert_ne!(one, two);
}
