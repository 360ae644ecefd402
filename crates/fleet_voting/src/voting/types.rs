//! Shared types for reference-transaction voting.

use std::fmt;

/// Identifier handed out on registration and echoed back by voters.
pub type TransactionId = u64;

/// Size of a vote in bytes (a SHA-1 digest over the reference updates).
pub const VOTE_SIZE: usize = 20;

/// A single vote cast by a replica.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Vote([u8; VOTE_SIZE]);

impl Vote {
    pub const fn new(bytes: [u8; VOTE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Build a vote from raw bytes, rejecting anything that is not exactly
    /// [`VOTE_SIZE`] bytes long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, TransactionError> {
        let array: [u8; VOTE_SIZE] = bytes
            .try_into()
            .map_err(|_| TransactionError::InvalidVoteLength(bytes.len()))?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; VOTE_SIZE] {
        &self.0
    }
}

impl fmt::Debug for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// A participant of a transaction together with its vote weight.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Voter {
    pub name: String,
    pub votes: u32,
}

impl Voter {
    pub fn new(name: impl Into<String>, votes: u32) -> Self {
        Self {
            name: name.into(),
            votes,
        }
    }
}

/// Outcome of a voter in a subtransaction (or aggregated over a transaction).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VoteResult {
    /// No decision yet.
    Undecided,
    /// The voter agreed with the quorum and may commit.
    Committed,
    /// The voter disagreed with the quorum, or no quorum was reached.
    Aborted,
    /// The transaction was cancelled before the voter was decided.
    Cancelled,
    /// The transaction was gracefully stopped before the voter was decided.
    Stopped,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransactionError {
    #[error("transaction {0} not found")]
    NotFound(TransactionId),
    #[error("voter {0:?} is not part of the transaction")]
    UnknownVoter(String),
    #[error("voter {0:?} has already cast a vote")]
    DuplicateVote(String),
    #[error("voter {0:?} has not cast a vote")]
    NotVoted(String),
    #[error("vote must be {VOTE_SIZE} bytes, got {0}")]
    InvalidVoteLength(usize),
    #[error("transaction requires at least one voter")]
    NoVoters,
    #[error("voter {0:?} is listed more than once")]
    DuplicateVoter(String),
    #[error("threshold {threshold} is unreachable with total weight {total}")]
    InvalidThreshold { threshold: u32, total: u32 },
    #[error("transaction failed a previous vote")]
    Aborted,
    #[error("transaction was cancelled")]
    Cancelled,
    #[error("transaction was stopped")]
    Stopped,
    #[error("timed out waiting for quorum")]
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vote_rejects_wrong_length() {
        assert_eq!(
            Vote::from_slice(&[1u8; 19]),
            Err(TransactionError::InvalidVoteLength(19))
        );
        assert_eq!(
            Vote::from_slice(&[1u8; 32]),
            Err(TransactionError::InvalidVoteLength(32))
        );
        assert!(Vote::from_slice(&[1u8; VOTE_SIZE]).is_ok());
    }

    #[test]
    fn vote_debug_is_hex() {
        let vote = Vote::new([0xab; VOTE_SIZE]);
        assert_eq!(format!("{vote:?}"), "ab".repeat(VOTE_SIZE));
    }
}
