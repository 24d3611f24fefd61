//! Local-first, multi-writer document storage with peer-to-peer sync.
//!
//! A [`Replica`] holds one share's signed documents over a pluggable storage
//! driver, resolving concurrent writes per path. A [`Peer`](peer::Peer) is a
//! registry of replicas, and a [`SyncCoordinator`](sync::SyncCoordinator)
//! keeps two peers converged over a pluggable transport.
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod document;
pub mod error;
pub mod keys;
pub mod peer;
pub mod query;
pub mod replica;
pub mod store;
pub mod sync;
pub mod validation;

pub use self::{
    document::Document,
    keys::{AuthorAddress, AuthorKeypair, ShareAddress},
    query::Query,
    replica::{IngestOutcome, Replica, SetInput},
};
