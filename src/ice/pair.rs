//! Candidate pairs and the bounded, priority-ordered checklist.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Upper bound on checklist entries.
pub const MAX_CHECKLIST_LEN: usize = 100;

pub type PairId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    Waiting,
    InProgress,
    Succeeded,
    Failed,
}

/// RFC 8445 §6.1.2.3, with `controlling` and `controlled` the candidate priorities of
/// the respective sides.
pub fn pair_priority(controlling: u32, controlled: u32) -> u64 {
    let (g, d) = (controlling as u64, controlled as u64);
    (g.min(d) << 32) + (g.max(d) << 1) + u64::from(g > d)
}

#[derive(Debug)]
pub struct CandidatePair {
    pub id: PairId,
    /// Index into the agent's local candidates.
    pub local: usize,
    /// Index into the agent's remote candidates.
    pub remote: usize,
    pub priority: u64,
    pub state: PairState,
    pub rtt: Option<Duration>,
    /// The peer nominated this pair; select it as soon as our check succeeds.
    pub nominate_on_success: bool,
    pub had_triggered_check: bool,
    /// The peer checked this pair while our own check was in flight. If ours fails, the
    /// pair goes back on the triggered queue instead of failing.
    pub retrigger_on_failure: bool,
    /// Valid pair produced by this pair's successful check.
    pub valid_pair: Option<PairId>,
    pub(crate) check: Option<CancellationToken>,
}

impl CandidatePair {
    pub fn new(id: PairId, local: usize, remote: usize, priority: u64) -> Self {
        CandidatePair {
            id,
            local,
            remote,
            priority,
            state: PairState::Waiting,
            rtt: None,
            nominate_on_success: false,
            had_triggered_check: false,
            retrigger_on_failure: false,
            valid_pair: None,
            check: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, PairState::Waiting | PairState::InProgress)
    }

    /// Stop the check in flight for this pair, if any.
    pub(crate) fn cancel_check(&mut self) {
        if let Some(token) = self.check.take() {
            token.cancel();
        }
    }
}

/// Pairs ordered by descending priority, capped at [`MAX_CHECKLIST_LEN`].
#[derive(Debug, Default)]
pub struct Checklist {
    pairs: Vec<CandidatePair>,
}

impl Checklist {
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CandidatePair> {
        self.pairs.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut CandidatePair> {
        self.pairs.iter_mut()
    }

    pub fn get(&self, id: PairId) -> Option<&CandidatePair> {
        self.pairs.iter().find(|p| p.id == id)
    }

    pub fn get_mut(&mut self, id: PairId) -> Option<&mut CandidatePair> {
        self.pairs.iter_mut().find(|p| p.id == id)
    }

    pub fn find(&self, local: usize, remote: usize) -> Option<&CandidatePair> {
        self.pairs
            .iter()
            .find(|p| p.local == local && p.remote == remote)
    }

    /// Insert in priority order. When full, a failed pair is evicted first, otherwise the
    /// lowest-priority one that has not succeeded, which may be `pair` itself. Succeeded
    /// pairs stay so valid pairs can always be selected. Returns the evicted pair.
    pub fn insert(&mut self, pair: CandidatePair) -> Option<CandidatePair> {
        let at = self
            .pairs
            .iter()
            .position(|p| p.priority < pair.priority)
            .unwrap_or(self.pairs.len());
        self.pairs.insert(at, pair);
        if self.pairs.len() <= MAX_CHECKLIST_LEN {
            return None;
        }
        let victim = self
            .pairs
            .iter()
            .rposition(|p| p.state == PairState::Failed)
            .or_else(|| self.pairs.iter().rposition(|p| p.state != PairState::Succeeded))
            .unwrap_or(self.pairs.len() - 1);
        let mut evicted = self.pairs.remove(victim);
        evicted.cancel_check();
        Some(evicted)
    }
}
