//! Transparent gRPC reverse proxy in front of replicated Git storage
//! backends.
//!
//! Every call is routed by the repository it targets: accessors go to one
//! healthy replica, mutators are fanned out to the primary and its
//! up-to-date secondaries and guarded by a reference transaction, and
//! replicas that fall behind are repaired through a persistent replication
//! queue.

pub mod auth;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod dataloss;
pub mod datastore;
pub mod election;
pub mod health;
pub mod metrics;
pub mod nodes;
pub mod peeker;
pub mod proto;
pub mod protoregistry;
pub mod protowire;
pub mod proxy;
pub mod random;
pub mod reconciler;
pub mod replicator;
pub mod router;
pub mod server;
