//! Transaction and subtransaction state machines.
//!
//! A transaction owns an ordered list of subtransactions. Every subtransaction
//! is one voting round over the full voter set: voters cast their vote, the
//! first vote value whose accumulated weight reaches the threshold becomes the
//! quorum, and each voter is committed or aborted depending on whether it
//! agreed with that quorum.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use super::types::{TransactionError, TransactionId, Vote, VoteResult, Voter};

#[derive(Debug)]
struct VoterState {
    votes: u32,
    vote: Option<Vote>,
    result: VoteResult,
}

#[derive(Debug)]
struct SubtransactionState {
    voters: BTreeMap<String, VoterState>,
    quorum: Option<Vote>,
    done: bool,
}

impl SubtransactionState {
    /// Outcome for a voter given the current state, without mutating it.
    fn resolve(&self, voter: &VoterState) -> VoteResult {
        if voter.result != VoteResult::Undecided {
            return voter.result;
        }
        if !self.done {
            return VoteResult::Undecided;
        }
        match (voter.vote, self.quorum) {
            (Some(vote), Some(quorum)) if vote == quorum => VoteResult::Committed,
            (Some(_), _) => VoteResult::Aborted,
            (None, _) => VoteResult::Undecided,
        }
    }
}

/// One voting round.
#[derive(Debug)]
pub(crate) struct Subtransaction {
    threshold: u32,
    state: Mutex<SubtransactionState>,
    done_tx: watch::Sender<bool>,
}

impl Subtransaction {
    fn new(voters: &[Voter], threshold: u32) -> Self {
        let voters = voters
            .iter()
            .map(|voter| {
                (
                    voter.name.clone(),
                    VoterState {
                        votes: voter.votes,
                        vote: None,
                        result: VoteResult::Undecided,
                    },
                )
            })
            .collect();
        let (done_tx, _) = watch::channel(false);
        Self {
            threshold,
            state: Mutex::new(SubtransactionState {
                voters,
                quorum: None,
                done: false,
            }),
            done_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SubtransactionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn has_voted(&self, voter: &str) -> bool {
        self.lock()
            .voters
            .get(voter)
            .map(|state| state.vote.is_some())
            .unwrap_or(false)
    }

    fn result_of(&self, voter: &str) -> VoteResult {
        let state = self.lock();
        match state.voters.get(voter) {
            Some(entry) => state.resolve(entry),
            None => VoteResult::Undecided,
        }
    }

    fn vote(&self, voter: &str, vote: Vote) -> Result<(), TransactionError> {
        let mut state = self.lock();
        let entry = state
            .voters
            .get_mut(voter)
            .ok_or_else(|| TransactionError::UnknownVoter(voter.to_string()))?;
        if entry.vote.is_some() {
            return Err(TransactionError::DuplicateVote(voter.to_string()));
        }
        entry.vote = Some(vote);
        self.update_done(&mut state);
        Ok(())
    }

    /// Decide whether the round is over: either a vote value reached the
    /// threshold, every voter has cast, or no value can reach the threshold
    /// with the weight still outstanding.
    fn update_done(&self, state: &mut SubtransactionState) {
        if state.done {
            return;
        }

        let mut tallies: HashMap<Vote, u32> = HashMap::new();
        let mut outstanding = 0u32;
        for voter in state.voters.values() {
            match voter.vote {
                Some(vote) => *tallies.entry(vote).or_default() += voter.votes,
                None => outstanding += voter.votes,
            }
        }

        let winner = tallies
            .iter()
            .find(|(_, weight)| **weight >= self.threshold)
            .map(|(vote, _)| *vote);
        let best = tallies.values().copied().max().unwrap_or(0);

        if let Some(vote) = winner {
            state.quorum = Some(vote);
            state.done = true;
        } else if outstanding == 0 || best.saturating_add(outstanding) < self.threshold {
            state.done = true;
        }

        if state.done {
            self.done_tx.send_replace(true);
        }
    }

    /// Force every undecided voter into `result`.
    fn terminate(&self, result: VoteResult) {
        let mut state = self.lock();
        let resolved: Vec<(String, VoteResult)> = state
            .voters
            .iter()
            .map(|(name, voter)| (name.clone(), state.resolve(voter)))
            .collect();
        for (name, outcome) in resolved {
            if let Some(voter) = state.voters.get_mut(&name) {
                voter.result = if outcome == VoteResult::Undecided {
                    result
                } else {
                    outcome
                };
            }
        }
    }

    /// Try to settle the outcome for `voter`. Returns `None` while undecided.
    fn settle(&self, voter: &str) -> Result<Option<VoteResult>, TransactionError> {
        let mut state = self.lock();
        let Some(entry) = state.voters.get(voter) else {
            return Err(TransactionError::UnknownVoter(voter.to_string()));
        };
        let outcome = state.resolve(entry);
        if outcome == VoteResult::Undecided {
            return Ok(None);
        }
        if let Some(entry) = state.voters.get_mut(voter) {
            entry.result = outcome;
        }
        Ok(Some(outcome))
    }
}

/// How a transaction was terminated before completing normally.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Termination {
    Cancelled,
    Stopped,
}

/// Snapshot of a transaction used by the proxy once the request is finished.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionState {
    /// Number of voting rounds that were started.
    pub subtransactions: usize,
    /// Aggregated outcome per voter: committed iff committed in every round.
    pub results: BTreeMap<String, VoteResult>,
}

impl TransactionState {
    pub fn committed(&self, voter: &str) -> bool {
        self.results.get(voter) == Some(&VoteResult::Committed)
    }
}

#[derive(Debug)]
pub(crate) struct Transaction {
    id: TransactionId,
    voters: Vec<Voter>,
    threshold: u32,
    subtransactions: Mutex<Vec<Arc<Subtransaction>>>,
    terminated: watch::Sender<Option<Termination>>,
}

impl Transaction {
    pub(crate) fn new(
        id: TransactionId,
        voters: Vec<Voter>,
        threshold: u32,
    ) -> Result<Self, TransactionError> {
        if voters.is_empty() {
            return Err(TransactionError::NoVoters);
        }
        let mut total = 0u32;
        for (idx, voter) in voters.iter().enumerate() {
            if voters[..idx].iter().any(|other| other.name == voter.name) {
                return Err(TransactionError::DuplicateVoter(voter.name.clone()));
            }
            total = total.saturating_add(voter.votes);
        }
        if threshold == 0 || threshold > total {
            return Err(TransactionError::InvalidThreshold { threshold, total });
        }

        let (terminated, _) = watch::channel(None);
        Ok(Self {
            id,
            voters,
            threshold,
            subtransactions: Mutex::new(Vec::new()),
            terminated,
        })
    }

    pub(crate) fn id(&self) -> TransactionId {
        self.id
    }

    fn subtransactions(&self) -> MutexGuard<'_, Vec<Arc<Subtransaction>>> {
        self.subtransactions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn termination_error(&self) -> Option<TransactionError> {
        match *self.terminated.borrow() {
            Some(Termination::Cancelled) => Some(TransactionError::Cancelled),
            Some(Termination::Stopped) => Some(TransactionError::Stopped),
            None => None,
        }
    }

    /// Record a vote in the first round this voter has not taken part in
    /// yet, starting a new round once it has committed all previous ones.
    pub(crate) fn vote(&self, voter: &str, vote: Vote) -> Result<(), TransactionError> {
        if let Some(err) = self.termination_error() {
            return Err(err);
        }
        if !self.voters.iter().any(|v| v.name == voter) {
            return Err(TransactionError::UnknownVoter(voter.to_string()));
        }

        let subtransaction = {
            let mut subtransactions = self.subtransactions();
            let mut target = None;
            for subtransaction in subtransactions.iter() {
                match subtransaction.result_of(voter) {
                    VoteResult::Committed => continue,
                    VoteResult::Undecided => {
                        if subtransaction.has_voted(voter) {
                            return Err(TransactionError::DuplicateVote(voter.to_string()));
                        }
                        target = Some(subtransaction.clone());
                        break;
                    }
                    VoteResult::Aborted => return Err(TransactionError::Aborted),
                    VoteResult::Cancelled => return Err(TransactionError::Cancelled),
                    VoteResult::Stopped => return Err(TransactionError::Stopped),
                }
            }
            match target {
                Some(subtransaction) => subtransaction,
                None => {
                    let subtransaction =
                        Arc::new(Subtransaction::new(&self.voters, self.threshold));
                    subtransactions.push(subtransaction.clone());
                    subtransaction
                }
            }
        };

        subtransaction.vote(voter, vote)
    }

    /// Wait until the round this voter last voted in is decided.
    pub(crate) async fn collect(&self, voter: &str) -> Result<VoteResult, TransactionError> {
        if !self.voters.iter().any(|v| v.name == voter) {
            return Err(TransactionError::UnknownVoter(voter.to_string()));
        }
        let subtransaction = self
            .subtransactions()
            .iter()
            .rev()
            .find(|sub| sub.has_voted(voter))
            .cloned()
            .ok_or_else(|| TransactionError::NotVoted(voter.to_string()))?;

        let mut done_rx = subtransaction.done_tx.subscribe();
        let mut terminated_rx = self.terminated.subscribe();
        loop {
            if let Some(outcome) = subtransaction.settle(voter)? {
                return Ok(outcome);
            }
            tokio::select! {
                changed = done_rx.changed() => {
                    if changed.is_err() {
                        return Err(TransactionError::Cancelled);
                    }
                }
                changed = terminated_rx.changed() => {
                    if changed.is_err() {
                        return Err(TransactionError::Cancelled);
                    }
                }
            }
        }
    }

    fn terminate(&self, termination: Termination) {
        let result = match termination {
            Termination::Cancelled => VoteResult::Cancelled,
            Termination::Stopped => VoteResult::Stopped,
        };
        let applied = self.terminated.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(termination);
            true
        });
        if !applied {
            return;
        }
        for subtransaction in self.subtransactions().iter() {
            subtransaction.terminate(result);
        }
        // Wake collectors again now that their results are settled.
        self.terminated.send_modify(|_| {});
    }

    pub(crate) fn cancel(&self) {
        self.terminate(Termination::Cancelled);
    }

    pub(crate) fn stop(&self) {
        self.terminate(Termination::Stopped);
    }

    pub(crate) fn state(&self) -> TransactionState {
        let subtransactions = self.subtransactions();
        let mut results = BTreeMap::new();
        for voter in &self.voters {
            let mut aggregated = VoteResult::Undecided;
            for (idx, subtransaction) in subtransactions.iter().enumerate() {
                let outcome = subtransaction.result_of(&voter.name);
                if idx == 0 || aggregated == VoteResult::Committed {
                    aggregated = outcome;
                }
            }
            results.insert(voter.name.clone(), aggregated);
        }
        TransactionState {
            subtransactions: subtransactions.len(),
            results,
        }
    }
}
