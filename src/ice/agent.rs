//! The ICE agent: connectivity checks, nomination and the data path.
//!
//! All agent state sits in one [`AgentState`] behind a mutex that is only held for
//! synchronous updates. Tasks in the agent's scope feed it candidates, inbound checks and
//! check results; the application sees it through [`IceAgent`] and [`IceChannels`].

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::candidate::{can_pair, Candidate, CandidateInfo, CandidateType, LocalCandidate, RemoteCandidate};
use super::pair::{pair_priority, CandidatePair, Checklist, PairId, PairState};
use super::{Credentials, IceConfig};
use crate::error::IceError;
use crate::net::{DataSink, InboundData, LocalPath};
use crate::scope::Scope;
use crate::stun::{
    BindingPacer, InboundRequest, IntegrityKey, ServerRegistration, StunAttribute,
    StunAttributeType, StunClass, StunManager, StunMessage, StunRequest, StunResponse, StunType,
    TransactionId,
};

/// SOFTWARE substring identifying the legacy ice4j-based peer. That implementation gets
/// a shorter nomination wait and no RTT probes.
const LEGACY_PEER_MARKER: &str = "ice4j.org";

/// Least time the controlling side keeps checking before it nominates.
const MIN_NOMINATION_WAIT: Duration = Duration::from_secs(30);

/// Legacy peers: how long to hold out for a non-relayed valid pair.
const LEGACY_NON_RELAY_WAIT: Duration = Duration::from_secs(10);

/// Legacy peers: how long to let outstanding checks finish before nominating.
const LEGACY_SETTLE_WAIT: Duration = Duration::from_secs(3);

/// Transactions whose response attempts are remembered.
const RESPONSE_COUNTER_MEMORY: usize = 64;

const DATA_QUEUE_LEN: usize = 256;

/// The pair both sides settled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectedPair {
    pub local: CandidateInfo,
    pub remote: CandidateInfo,
    pub rtt: Option<Duration>,
}

/// What the caller feeds the agent.
pub struct IceInputs {
    pub local_credentials: Credentials,
    pub remote_credentials: oneshot::Receiver<Credentials>,
    pub local_candidates: mpsc::UnboundedReceiver<LocalCandidate>,
    pub remote_candidates: mpsc::UnboundedReceiver<CandidateInfo>,
}

/// Application-facing queues.
pub struct IceChannels {
    /// Local candidates to trickle to the peer.
    pub local_candidates: mpsc::UnboundedReceiver<CandidateInfo>,
    pub inbound: mpsc::Receiver<Vec<u8>>,
    pub outbound: mpsc::Sender<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckKind {
    Ordinary,
    Nomination,
    /// Extra RTT measurement on a pair that is already valid.
    Probe,
}

type Outcome = Option<Result<SelectedPair, IceError>>;

struct Shared {
    config: IceConfig,
    tie_breaker: u64,
    local_credentials: Credentials,
    stun: Arc<StunManager>,
    pacer: BindingPacer,
    state: Mutex<AgentState>,
    /// New checkable work for the check loop.
    work: Notify,
    /// Bumped on every pair state change.
    progress: watch::Sender<u64>,
    ready: watch::Sender<bool>,
    outcome: watch::Sender<Outcome>,
    signal: mpsc::UnboundedSender<CandidateInfo>,
    data_sink: DataSink,
    checks: Scope,
}

impl Shared {
    fn bump_progress(&self) {
        self.progress.send_modify(|n| *n = n.wrapping_add(1));
    }

    fn set_ready(&self) {
        self.ready.send_if_modified(|ready| !std::mem::replace(ready, true));
    }
}

#[derive(Default)]
struct AgentState {
    locals: Vec<LocalCandidate>,
    remotes: Vec<RemoteCandidate>,
    checklist: Checklist,
    next_pair_id: PairId,
    valid: Vec<PairId>,
    triggered: VecDeque<PairId>,
    selected: Option<PairId>,
    last_received: Option<PairId>,
    remote_credentials: Option<Credentials>,
    legacy_peer: Option<bool>,
    probe_cursor: usize,
    response_counters: VecDeque<(TransactionId, u8)>,
}

impl AgentState {
    fn is_relay_pair(&self, pair: &CandidatePair) -> bool {
        self.locals[pair.local].is_relayed() || self.remotes[pair.remote].is_relayed()
    }

    fn has_pending_checks(&self) -> bool {
        !self.triggered.is_empty() || self.checklist.iter().any(CandidatePair::is_pending)
    }

    fn forget_pair(&mut self, id: PairId) {
        self.valid.retain(|v| *v != id);
        self.triggered.retain(|t| *t != id);
        if self.last_received == Some(id) {
            self.last_received = None;
        }
    }

    /// Valid pair with the lowest RTT after adding `penalty` per relayed side.
    fn best_valid_pair(&self, penalty: Duration) -> Option<PairId> {
        self.valid
            .iter()
            .filter_map(|id| self.checklist.get(*id))
            .filter(|p| !self.locals[p.local].is_released())
            .filter_map(|p| {
                let legs = u32::from(self.locals[p.local].is_relayed())
                    + u32::from(self.remotes[p.remote].is_relayed());
                Some((p.rtt? + penalty * legs, p.id))
            })
            .min()
            .map(|(_, id)| id)
    }

    fn selected_pair(&self, id: PairId) -> Option<SelectedPair> {
        let pair = self.checklist.get(id)?;
        Some(SelectedPair {
            local: self.locals[pair.local].info(),
            remote: self.remotes[pair.remote].info(),
            rtt: pair.rtt,
        })
    }

    /// Record a signaled remote candidate. Returns its index if it is new. A peer-reflexive
    /// remote that turns out to be the peer's relay takes the relayed type so the relay
    /// penalty applies to its pairs.
    fn merge_remote(&mut self, info: CandidateInfo) -> Option<usize> {
        if let Some(existing) = self.remotes.iter_mut().find(|r| r.address == info.address) {
            if existing.typ == CandidateType::PeerReflexive && info.typ == CandidateType::Relayed {
                debug!("Remote candidate {} is a relay", info.address);
                existing.typ = CandidateType::Relayed;
            }
            return None;
        }
        self.remotes.push(RemoteCandidate::from(info));
        Some(self.remotes.len() - 1)
    }

    fn next_response_attempt(&mut self, id: TransactionId) -> u8 {
        if let Some((_, count)) = self.response_counters.iter_mut().find(|(t, _)| *t == id) {
            *count = count.saturating_add(1);
            return *count;
        }
        if self.response_counters.len() >= RESPONSE_COUNTER_MEMORY {
            self.response_counters.pop_front();
        }
        self.response_counters.push_back((id, 1));
        1
    }
}

/// A running ICE agent. Dropping it cancels every task; [`IceAgent::close`] also waits
/// for them.
pub struct IceAgent {
    shared: Arc<Shared>,
    scope: Scope,
}

impl IceAgent {
    pub fn start(
        parent: &Scope,
        stun: Arc<StunManager>,
        pacer: BindingPacer,
        config: IceConfig,
        inputs: IceInputs,
    ) -> (IceAgent, IceChannels) {
        let scope = parent.child();
        let (signal, signal_rx) = mpsc::unbounded_channel();
        let (data_sink, data_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(DATA_QUEUE_LEN);
        let (outbound_tx, outbound_rx) = mpsc::channel(DATA_QUEUE_LEN);

        // Register before anything is signaled so early checks from the peer are answered.
        let server = stun.register_server(
            &inputs.local_credentials.ufrag,
            &inputs.local_credentials.password,
        );
        info!(
            "ICE agent {} starting as {}",
            inputs.local_credentials.ufrag,
            if config.controlling { "controlling" } else { "controlled" }
        );

        let shared = Arc::new(Shared {
            config,
            tie_breaker: u64::from_be_bytes(crate::random_bytes()),
            local_credentials: inputs.local_credentials,
            stun,
            pacer,
            state: Mutex::new(AgentState::default()),
            work: Notify::new(),
            progress: watch::channel(0).0,
            ready: watch::channel(false).0,
            outcome: watch::channel(None).0,
            signal,
            data_sink,
            checks: scope.child(),
        });

        scope.spawn(serve_requests(shared.clone(), server));
        scope.spawn(intake_local(shared.clone(), inputs.local_candidates));
        scope.spawn(intake_remote(shared.clone(), inputs.remote_candidates));
        scope.spawn(await_credentials(shared.clone(), inputs.remote_credentials));
        scope.spawn(forward_outbound(shared.clone(), outbound_rx));
        scope.spawn(forward_inbound(shared.clone(), data_rx, inbound_tx));

        let channels = IceChannels {
            local_candidates: signal_rx,
            inbound: inbound_rx,
            outbound: outbound_tx,
        };
        (IceAgent { shared, scope }, channels)
    }

    pub fn is_controlling(&self) -> bool {
        self.shared.config.controlling
    }

    /// Resolves once application data may flow. Never resolves if ICE fails, so callers
    /// should apply their own timeout.
    pub async fn ready_for_data(&self) {
        let mut ready = self.shared.ready.subscribe();
        let _ = ready.wait_for(|ready| *ready).await;
    }

    /// Wait for the final outcome: the selected pair, or the reason none was found.
    pub async fn selected(&self) -> Result<SelectedPair, IceError> {
        let mut outcome = self.shared.outcome.subscribe();
        let result = outcome
            .wait_for(Option::is_some)
            .await
            .map_err(|_| IceError::Closed)?;
        result.clone().unwrap_or(Err(IceError::Closed))
    }

    pub fn selected_pair(&self) -> Option<SelectedPair> {
        let state = self.shared.state.lock();
        state.selected.and_then(|id| state.selected_pair(id))
    }

    /// Stop every task and release all candidates.
    pub async fn close(self) {
        self.scope.shutdown().await;
    }
}

impl Drop for IceAgent {
    fn drop(&mut self) {
        self.scope.cancel();
    }
}

async fn intake_local(shared: Arc<Shared>, mut candidates: mpsc::UnboundedReceiver<LocalCandidate>) {
    while let Some(candidate) = candidates.recv().await {
        add_local(&shared, candidate);
    }
    debug!("Local candidates complete");
}

async fn intake_remote(shared: Arc<Shared>, mut candidates: mpsc::UnboundedReceiver<CandidateInfo>) {
    while let Some(candidate) = candidates.recv().await {
        add_remote(&shared, candidate);
    }
    debug!("Remote candidates complete");
}

async fn await_credentials(shared: Arc<Shared>, credentials: oneshot::Receiver<Credentials>) {
    let Ok(credentials) = credentials.await else {
        warn!("Remote credentials never arrived; no checks will be sent");
        return;
    };
    debug!("Remote credentials received for {}", credentials.ufrag);
    shared.state.lock().remote_credentials = Some(credentials);
    shared.checks.spawn(run_checks(shared.clone()));
    if shared.config.controlling {
        shared.checks.spawn(run_nomination(shared.clone()));
    }
    shared.work.notify_one();
}

fn add_local(shared: &Shared, candidate: LocalCandidate) {
    let mut state = shared.state.lock();
    if state.selected.is_some() {
        return;
    }
    if state
        .locals
        .iter()
        .any(|l| l.address() == candidate.address() && l.base() == candidate.base())
    {
        trace!("Duplicate local candidate {}", candidate.info());
        return;
    }
    let info = candidate.info();
    state.locals.push(candidate);
    let local = state.locals.len() - 1;
    // Signal first: the peer must know a candidate before our checks from it arrive.
    let _ = shared.signal.send(info);
    debug!("Local candidate {}", info);

    if is_pairable_local(info.typ) {
        for remote in 0..state.remotes.len() {
            pair_up(shared, &mut state, local, remote);
        }
    }
    drop(state);
    shared.work.notify_one();
}

/// Reflexive locals share their base's socket and so never need their own checks.
fn is_pairable_local(typ: CandidateType) -> bool {
    matches!(typ, CandidateType::Host | CandidateType::Relayed)
}

fn add_remote(shared: &Shared, info: CandidateInfo) {
    let mut state = shared.state.lock();
    if state.selected.is_some() {
        return;
    }
    let Some(remote) = state.merge_remote(info) else {
        return;
    };
    debug!("Remote candidate {}", info);
    for local in 0..state.locals.len() {
        if is_pairable_local(state.locals[local].typ()) {
            pair_up(shared, &mut state, local, remote);
        }
    }
    drop(state);
    shared.work.notify_one();
}

/// Find or create the pair of `local` and `remote`.
fn pair_up(shared: &Shared, state: &mut AgentState, local: usize, remote: usize) -> Option<PairId> {
    if let Some(pair) = state.checklist.find(local, remote) {
        return Some(pair.id);
    }
    let (l, r) = (&state.locals[local], &state.remotes[remote]);
    if l.is_released() || !can_pair(l, r) {
        return None;
    }
    let priority = if shared.config.controlling {
        pair_priority(l.priority(), r.priority)
    } else {
        pair_priority(r.priority, l.priority())
    };
    let path = l.path().clone();
    let local_address = l.address();
    let peer = r.address;

    let id = state.next_pair_id;
    state.next_pair_id += 1;
    if let Some(evicted) = state.checklist.insert(CandidatePair::new(id, local, remote, priority)) {
        state.forget_pair(evicted.id);
        if evicted.id == id {
            trace!("Checklist full, not pairing {} with {}", local_address, peer);
            return None;
        }
    }
    path.register_peer(peer, shared.data_sink.clone());
    if let LocalPath::Relay(relay) = &path {
        // Permissions are directional: without one the peer's first check would be dropped.
        relay.request_permission(peer);
    }
    trace!("Pair {}: {} -> {}", id, state.locals[local].info(), peer);
    Some(id)
}

async fn run_checks(shared: Arc<Shared>) {
    loop {
        loop {
            {
                let state = shared.state.lock();
                if state.selected.is_some() {
                    return;
                }
                if has_work(&state) {
                    break;
                }
            }
            shared.work.notified().await;
        }
        if !shared.pacer.wait(false).await {
            debug!("Binding pacer stopped, no more checks");
            return;
        }
        let next = next_check(&mut shared.state.lock());
        if let Some((id, kind)) = next {
            start_check(&shared, id, kind);
        }
    }
}

fn has_work(state: &AgentState) -> bool {
    !state.triggered.is_empty()
        || state.checklist.iter().any(|p| p.state == PairState::Waiting)
        || (state.legacy_peer != Some(true) && !state.valid.is_empty())
}

fn next_check(state: &mut AgentState) -> Option<(PairId, CheckKind)> {
    while let Some(id) = state.triggered.pop_front() {
        if state
            .checklist
            .get(id)
            .is_some_and(|p| p.state == PairState::Waiting)
        {
            return Some((id, CheckKind::Ordinary));
        }
    }
    if let Some(pair) = state.checklist.iter().find(|p| p.state == PairState::Waiting) {
        return Some((pair.id, CheckKind::Ordinary));
    }
    if state.legacy_peer == Some(true) || state.valid.is_empty() {
        return None;
    }
    let n = state.valid.len();
    for step in 0..n {
        let index = (state.probe_cursor + step) % n;
        let id = state.valid[index];
        if state.checklist.get(id).is_some_and(|p| p.check.is_none()) {
            state.probe_cursor = (index + 1) % n;
            return Some((id, CheckKind::Probe));
        }
    }
    None
}

fn start_check(shared: &Arc<Shared>, id: PairId, kind: CheckKind) {
    let (message, path, destination, token) = {
        let mut state = shared.state.lock();
        let Some(credentials) = state.remote_credentials.clone() else {
            return;
        };
        let Some(pair) = state.checklist.get(id) else {
            return;
        };
        let local = &state.locals[pair.local];
        let destination = state.remotes[pair.remote].address;
        let mut attributes = vec![
            StunAttribute::Username(format!(
                "{}:{}",
                credentials.ufrag, shared.local_credentials.ufrag
            )),
            StunAttribute::Priority(local.peer_reflexive_priority()),
        ];
        if kind == CheckKind::Nomination {
            attributes.push(StunAttribute::UseCandidate);
        }
        attributes.push(if shared.config.controlling {
            StunAttribute::IceControlling(shared.tie_breaker)
        } else {
            StunAttribute::IceControlled(shared.tie_breaker)
        });
        attributes.push(StunAttribute::MessageIntegrity(Some(
            IntegrityKey::short_term(&credentials.password),
        )));
        let message = match StunMessage::request(StunType::Binding, attributes) {
            Ok(message) => message,
            Err(e) => {
                warn!("Cannot build connectivity check: {}", e);
                return;
            }
        };
        let path = local.path().clone();
        trace!("{:?} check {} -> {}", kind, local.info(), destination);

        let token = shared.checks.token().child_token();
        let Some(pair) = state.checklist.get_mut(id) else {
            return;
        };
        pair.cancel_check();
        pair.check = Some(token.clone());
        if kind != CheckKind::Probe {
            pair.state = PairState::InProgress;
        }
        (message, path, destination, token)
    };

    let task_shared = shared.clone();
    shared.checks.spawn(async move {
        let request = StunRequest::new(message, destination);
        let response = tokio::select! {
            _ = token.cancelled() => return,
            response = request.execute(&task_shared.stun, &path) => response,
        };
        check_completed(&task_shared, id, kind, &token, destination, response);
    });
}

fn check_completed(
    shared: &Shared,
    id: PairId,
    kind: CheckKind,
    token: &CancellationToken,
    destination: SocketAddr,
    response: Option<StunResponse>,
) {
    let mut state = shared.state.lock();
    if token.is_cancelled() || state.selected.is_some() {
        return;
    }
    let Some(pair) = state.checklist.get_mut(id) else {
        return;
    };
    pair.check = None;

    let accepted = response.filter(|r| {
        r.message.class() == StunClass::ResponseSuccess
            && r.from == destination
            && r.message.is_authenticated()
    });
    let mapped = accepted
        .as_ref()
        .and_then(|r| r.message.xor_mapped_address());
    match (accepted, mapped) {
        (Some(response), Some(mapped)) => on_check_success(shared, &mut state, id, kind, &response, mapped),
        _ => on_check_failure(shared, &mut state, id, kind),
    }
}

fn on_check_failure(shared: &Shared, state: &mut AgentState, id: PairId, kind: CheckKind) {
    if kind == CheckKind::Probe {
        trace!("RTT probe on pair {} went unanswered", id);
        return;
    }
    if let Some(pair) = state.checklist.get_mut(id) {
        if kind == CheckKind::Ordinary && std::mem::take(&mut pair.retrigger_on_failure) {
            debug!("Check on pair {} failed, retrying for the peer's check", id);
            pair.state = PairState::Waiting;
            state.triggered.push_back(id);
            shared.work.notify_one();
            return;
        }
        pair.state = PairState::Failed;
    }
    debug!("Check on pair {} failed", id);
    if kind == CheckKind::Nomination {
        warn!("Nomination check failed");
        fail(shared, state);
    }
    shared.bump_progress();
}

fn on_check_success(
    shared: &Shared,
    state: &mut AgentState,
    id: PairId,
    kind: CheckKind,
    response: &StunResponse,
    mapped: SocketAddr,
) {
    if state.legacy_peer.is_none() {
        let software = response.message.software();
        let legacy = software.is_some_and(|s| s.contains(LEGACY_PEER_MARKER));
        if legacy {
            info!("Peer runs a legacy ICE implementation ({:?})", software);
        }
        state.legacy_peer = Some(legacy);
    }

    let Some(pair) = state.checklist.get(id) else {
        return;
    };
    let (local, remote) = (pair.local, pair.remote);
    let route = state.locals[local].route();

    let mapped_local = state
        .locals
        .iter()
        .position(|l| l.address() == mapped && l.route() == route);
    let valid_local = match mapped_local {
        Some(index) => index,
        None => {
            let prflx = LocalCandidate::peer_reflexive(mapped, &state.locals[local]);
            info!("Discovered peer-reflexive candidate {}", prflx.info());
            state.locals.push(prflx);
            state.locals.len() - 1
        }
    };
    let valid = if valid_local == local {
        id
    } else {
        pair_up(shared, state, valid_local, remote).unwrap_or(id)
    };

    for pid in [id, valid] {
        if let Some(pair) = state.checklist.get_mut(pid) {
            pair.state = PairState::Succeeded;
            pair.rtt = Some(response.rtt);
        }
    }
    let mut nominate = kind == CheckKind::Nomination;
    if let Some(pair) = state.checklist.get_mut(id) {
        pair.valid_pair = Some(valid);
        nominate |= pair.nominate_on_success;
    }
    nominate |= state
        .checklist
        .get(valid)
        .is_some_and(|p| p.nominate_on_success);
    if !state.valid.contains(&valid) {
        state.valid.push(valid);
        if let Some(selected) = state.selected_pair(valid) {
            info!(
                "Valid pair {} -> {} (rtt {:?})",
                selected.local, selected.remote, response.rtt
            );
        }
    } else {
        trace!("Pair {} rtt {:?}", valid, response.rtt);
    }
    shared.bump_progress();

    if nominate {
        select_pair(shared, state, valid);
    } else if state.legacy_peer == Some(false) {
        shared.set_ready();
    }
}

/// Commit to `id`. Terminal: checks stop and every other candidate is released.
fn select_pair(shared: &Shared, state: &mut AgentState, id: PairId) {
    if state.selected.is_some() {
        return;
    }
    let Some(selected) = state.selected_pair(id) else {
        return;
    };
    let Some(pair) = state.checklist.get(id) else {
        return;
    };
    let local = pair.local;
    state.selected = Some(id);
    shared.checks.cancel();

    let route = state.locals[local].route();
    let keep_base = if is_pairable_local(state.locals[local].typ()) {
        None
    } else {
        state
            .locals
            .iter()
            .position(|l| is_pairable_local(l.typ()) && l.route() == route)
    };
    for (index, candidate) in state.locals.iter_mut().enumerate() {
        if index != local && Some(index) != keep_base {
            candidate.release();
        }
    }
    if let LocalPath::Relay(relay) = state.locals[local].path() {
        relay.bind_channel(selected.remote.address);
    }

    info!("Selected pair {} -> {}", selected.local, selected.remote);
    shared.set_ready();
    shared.outcome.send_replace(Some(Ok(selected)));
    shared.bump_progress();
}

fn fail(shared: &Shared, state: &mut AgentState) {
    if state.selected.is_some() {
        return;
    }
    shared.checks.cancel();
    shared.outcome.send_if_modified(|outcome| {
        if outcome.is_some() {
            return false;
        }
        *outcome = Some(Err(IceError::NoValidPair));
        true
    });
}

async fn serve_requests(shared: Arc<Shared>, mut server: ServerRegistration) {
    while let Some(request) = server.recv().await {
        handle_request(&shared, request).await;
    }
}

async fn handle_request(shared: &Shared, request: InboundRequest) {
    let InboundRequest {
        message,
        from,
        path,
    } = request;
    if message.typ() != StunType::Binding {
        debug!("Ignoring {:?} request from {}", message.typ(), from);
        return;
    }

    let response_attempt = shared
        .state
        .lock()
        .next_response_attempt(message.transaction_id());
    let mut attributes = vec![StunAttribute::XorMappedAddress(from)];
    if let Some((attempt, _)) = message.transmit_counter() {
        attributes.push(StunAttribute::TransactionTransmitCounter {
            request: attempt,
            response: response_attempt,
        });
    }
    attributes.push(StunAttribute::MessageIntegrity(Some(IntegrityKey::short_term(
        &shared.local_credentials.password,
    ))));
    let response = StunMessage::new(
        StunType::Binding,
        StunClass::ResponseSuccess,
        message.transaction_id(),
        attributes,
    )
    .and_then(|m| m.encode());
    match response {
        Ok(datagram) => {
            if let Err(e) = path.send_to(datagram, from).await {
                debug!("Cannot answer check from {}: {}", from, e);
            }
        }
        Err(e) => warn!("Cannot encode check response: {}", e),
    }

    let mut state = shared.state.lock();
    if state.selected.is_some() {
        return;
    }
    let route = path.route();
    let Some(local) = state
        .locals
        .iter()
        .position(|l| is_pairable_local(l.typ()) && l.route() == route)
    else {
        debug!("Check from {} arrived on an unknown path {:?}", from, route);
        return;
    };
    let remote = match state.remotes.iter().position(|r| r.address == from) {
        Some(remote) => remote,
        None => {
            state.remotes.push(RemoteCandidate {
                typ: CandidateType::PeerReflexive,
                address: from,
                priority: message.priority().unwrap_or(0),
            });
            info!("Discovered peer-reflexive remote candidate {}", from);
            state.remotes.len() - 1
        }
    };
    let Some(id) = pair_up(shared, &mut state, local, remote) else {
        return;
    };

    let use_candidate =
        !shared.config.controlling && message.has(StunAttributeType::UseCandidate);
    let Some(pair) = state.checklist.get_mut(id) else {
        return;
    };
    if use_candidate {
        if pair.state == PairState::Succeeded {
            let valid = pair
                .valid_pair
                .filter(|v| state.checklist.get(*v).is_some())
                .unwrap_or(id);
            select_pair(shared, &mut state, valid);
            return;
        }
        pair.nominate_on_success = true;
    }
    let schedule = match pair.state {
        PairState::Failed => {
            pair.state = PairState::Waiting;
            true
        }
        PairState::Waiting => !pair.had_triggered_check,
        PairState::InProgress => {
            pair.retrigger_on_failure = true;
            false
        }
        PairState::Succeeded => false,
    };
    if schedule {
        pair.had_triggered_check = true;
        state.triggered.push_back(id);
        drop(state);
        shared.work.notify_one();
    }
}

async fn run_nomination(shared: Arc<Shared>) {
    let started = Instant::now();
    let mut progress = shared.progress.subscribe();

    let legacy = loop {
        let (legacy, pending) = {
            let state = shared.state.lock();
            if state.selected.is_some() {
                return;
            }
            (state.legacy_peer, state.has_pending_checks())
        };
        if legacy == Some(true) {
            break true;
        }
        if Instant::now() >= started + MIN_NOMINATION_WAIT && !pending {
            break false;
        }
        wait_for_progress(&mut progress, started + MIN_NOMINATION_WAIT).await;
    };

    if legacy {
        let deadline = Instant::now() + LEGACY_NON_RELAY_WAIT;
        loop {
            let only_relayed = {
                let state = shared.state.lock();
                state
                    .valid
                    .iter()
                    .filter_map(|id| state.checklist.get(*id))
                    .all(|p| state.is_relay_pair(p))
            };
            if !only_relayed || Instant::now() >= deadline {
                break;
            }
            wait_for_progress(&mut progress, deadline).await;
        }
        let deadline = Instant::now() + LEGACY_SETTLE_WAIT;
        loop {
            let pending = shared.state.lock().has_pending_checks();
            if !pending || Instant::now() >= deadline {
                break;
            }
            wait_for_progress(&mut progress, deadline).await;
        }
    }

    let mut state = shared.state.lock();
    if state.selected.is_some() {
        return;
    }
    match state.best_valid_pair(shared.config.relay_latency_threshold) {
        Some(id) => {
            if let Some(best) = state.selected_pair(id) {
                info!("Nominating {} -> {} (rtt {:?})", best.local, best.remote, best.rtt);
            }
            drop(state);
            start_check(&shared, id, CheckKind::Nomination);
        }
        None => {
            warn!("No valid candidate pair found");
            fail(&shared, &mut state);
        }
    }
}

/// Wait for a pair state change, or until `deadline` if it is still ahead.
async fn wait_for_progress(progress: &mut watch::Receiver<u64>, deadline: Instant) {
    if deadline > Instant::now() {
        let _ = tokio::time::timeout_at(deadline, progress.changed()).await;
    } else {
        let _ = progress.changed().await;
    }
}

/// Pair to send application data on.
fn data_pair(shared: &Shared, state: &AgentState) -> Option<PairId> {
    if let Some(id) = state.selected {
        return Some(id);
    }
    if !shared.config.controlling {
        if let Some(id) = state.last_received {
            return Some(id);
        }
    }
    state.best_valid_pair(shared.config.relay_latency_threshold)
}

async fn forward_outbound(shared: Arc<Shared>, mut outbound: mpsc::Receiver<Vec<u8>>) {
    while let Some(data) = outbound.recv().await {
        let target = {
            let state = shared.state.lock();
            data_pair(&shared, &state).and_then(|id| {
                let pair = state.checklist.get(id)?;
                Some((
                    state.locals[pair.local].path().clone(),
                    state.remotes[pair.remote].address,
                ))
            })
        };
        match target {
            Some((path, to)) => {
                if let Err(e) = path.send_to(data, to).await {
                    debug!("Sending data to {} failed: {}", to, e);
                }
            }
            None => debug!("No usable pair yet, dropping {} bytes", data.len()),
        }
    }
}

async fn forward_inbound(
    shared: Arc<Shared>,
    mut data: mpsc::UnboundedReceiver<InboundData>,
    inbound: mpsc::Sender<Vec<u8>>,
) {
    while let Some(InboundData { route, from, data }) = data.recv().await {
        {
            let mut state = shared.state.lock();
            let received_on = state
                .valid
                .iter()
                .filter_map(|id| state.checklist.get(*id))
                .find(|p| {
                    state.remotes[p.remote].address == from
                        && state.locals[p.local].route() == route
                })
                .map(|p| p.id);
            if received_on.is_some() {
                state.last_received = received_on;
            }
        }
        if inbound.send(data).await.is_err() {
            return;
        }
    }
}
