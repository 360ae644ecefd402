//! Reference-transaction voting crate.
//!
//! This crate coordinates quorum votes among the replicas taking part in a
//! single mutating request. The API surface is intentionally small: the proxy
//! registers a transaction with its voters, each replica casts a vote and then
//! collects the outcome, and the proxy inspects the final state once the
//! request has finished.

pub mod voting;
