//! Node orchestration
//!
//! Ties an identity, its writable feed, the follow graph and persisted
//! trust into one [`Node`]. The replication engine and overlay engine stay
//! behind the [`granary_model`] seams; a builder wires concrete ones in.

mod data_dir;
mod node;
mod registry;
mod trust_store;

pub use data_dir::DataDir;
pub use node::{
    Node, NodeBuilder, NodeError, ReplyTarget, TrustOptions, DEFAULT_TRUST_EXPIRATION,
};
pub use registry::FeedRegistry;
pub use trust_store::{TrustStore, TrustStoreError};
