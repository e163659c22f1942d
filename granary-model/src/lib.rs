//! Core model for Granary
//!
//! Shared building blocks used by every other crate:
//! - [`FeedKey`] — 32-byte public-key identity of a feed
//! - [`Message`] — the JSON shape stored in a feed's log
//! - [`FeedIdentity`] — the local Ed25519 keypair on disk
//! - trust-link issuance and verification
//! - collaborator traits for the log and overlay primitives

pub mod identity;
pub mod log;
pub mod message;
pub mod overlay;
pub mod trust;
pub mod types;

pub use identity::{FeedIdentity, IdentityError};
pub use log::{LogError, LogOpener, LogStorage, LogStream, MessageLog};
pub use message::{
    kind, FollowPayload, Message, OpenPayload, PostPayload, ReplyTo, TrustPayload, PROTOCOL_NAME,
    PROTOCOL_VERSION,
};
pub use overlay::{Overlay, OverlayError, OverlayNode, OverlayWatcher};
pub use trust::{TrustError, TrustLink, LINK_SIZE};
pub use types::{FeedKey, FEED_KEY_SIZE};
