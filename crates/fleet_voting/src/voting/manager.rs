//! Table of in-flight transactions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::transaction::{Transaction, TransactionState};
use super::types::{TransactionError, TransactionId, Vote, VoteResult, Voter};

/// Registers transactions and routes votes to them.
///
/// The table is guarded by a single mutex; each transaction carries its own
/// finer-grained locks so voters of different transactions never contend on
/// anything but the lookup.
#[derive(Debug)]
pub struct TransactionManager {
    transactions: Mutex<HashMap<TransactionId, Arc<Transaction>>>,
    rng: Mutex<StdRng>,
    collect_timeout: Option<Duration>,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            transactions: Mutex::new(HashMap::new()),
            rng: Mutex::new(StdRng::from_entropy()),
            collect_timeout: None,
        }
    }

    /// Bound how long a voter may wait for the outcome of its round.
    pub fn with_collect_timeout(mut self, timeout: Duration) -> Self {
        self.collect_timeout = Some(timeout);
        self
    }

    /// Use a deterministic id generator (tests only need this).
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<TransactionId, Arc<Transaction>>> {
        self.transactions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup(&self, id: TransactionId) -> Result<Arc<Transaction>, TransactionError> {
        self.table()
            .get(&id)
            .cloned()
            .ok_or(TransactionError::NotFound(id))
    }

    /// Register a new transaction and return its id plus a handle that
    /// cancels and forgets it.
    pub fn register(
        self: &Arc<Self>,
        voters: Vec<Voter>,
        threshold: u32,
    ) -> Result<(TransactionId, CancelHandle), TransactionError> {
        let mut table = self.table();
        let id = loop {
            let candidate: TransactionId = self
                .rng
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .gen();
            if candidate != 0 && !table.contains_key(&candidate) {
                break candidate;
            }
        };

        let voter_count = voters.len();
        let transaction = Arc::new(Transaction::new(id, voters, threshold)?);
        table.insert(id, transaction);
        tracing::debug!(
            transaction_id = id,
            voters = voter_count,
            threshold,
            "registered transaction"
        );

        Ok((
            id,
            CancelHandle {
                id,
                manager: self.clone(),
            },
        ))
    }

    /// Cast `vote` on behalf of `voter`.
    pub fn vote(
        &self,
        id: TransactionId,
        voter: &str,
        vote: &[u8],
    ) -> Result<(), TransactionError> {
        let vote = Vote::from_slice(vote)?;
        let transaction = self.lookup(id)?;
        transaction.vote(voter, vote)?;
        tracing::debug!(transaction_id = id, voter, ?vote, "vote cast");
        Ok(())
    }

    /// Block until the round `voter` last voted in is decided.
    pub async fn collect(
        &self,
        id: TransactionId,
        voter: &str,
    ) -> Result<VoteResult, TransactionError> {
        let transaction = self.lookup(id)?;
        let outcome = match self.collect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, transaction.collect(voter))
                .await
                .map_err(|_| TransactionError::Timeout)??,
            None => transaction.collect(voter).await?,
        };
        tracing::debug!(transaction_id = id, voter, ?outcome, "vote collected");
        Ok(outcome)
    }

    /// Gracefully stop a transaction: undecided voters are told to stop.
    pub fn stop(&self, id: TransactionId) -> Result<(), TransactionError> {
        let transaction = self.lookup(id)?;
        transaction.stop();
        tracing::debug!(transaction_id = transaction.id(), "transaction stopped");
        Ok(())
    }

    /// Current outcome of every voter.
    pub fn state(&self, id: TransactionId) -> Result<TransactionState, TransactionError> {
        Ok(self.lookup(id)?.state())
    }

    /// Number of transactions currently registered.
    pub fn active(&self) -> usize {
        self.table().len()
    }

    fn cancel(&self, id: TransactionId) -> Option<TransactionState> {
        let transaction = self.table().remove(&id)?;
        transaction.cancel();
        tracing::debug!(transaction_id = id, "transaction cancelled");
        Some(transaction.state())
    }
}

/// Cancels a registered transaction: undecided voters abort, decided ones
/// keep their outcome, and the transaction is dropped from the table.
#[derive(Debug)]
pub struct CancelHandle {
    id: TransactionId,
    manager: Arc<TransactionManager>,
}

impl CancelHandle {
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Cancel the transaction and return its final state, or None when it
    /// was already gone.
    pub fn cancel(self) -> Option<TransactionState> {
        self.manager.cancel(self.id)
    }
}
