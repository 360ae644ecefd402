//! Voting module wiring.
//!
//! `types` defines votes, voters and errors, `transaction` holds the
//! per-transaction and per-subtransaction state machines, and `manager` owns
//! the table of in-flight transactions.

mod manager;
mod transaction;
mod types;

pub use manager::{CancelHandle, TransactionManager};
pub use transaction::TransactionState;
pub use types::{TransactionError, TransactionId, Vote, VoteResult, Voter, VOTE_SIZE};
