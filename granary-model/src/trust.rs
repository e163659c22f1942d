//! Trust links
//!
//! A trust link is a compact signed grant binding a grantee feed key and an
//! expiration to the issuer. Installing a link into the overlay's trust store
//! is what makes the grantee's requests against the issuer's overlay
//! admissible.
//!
//! Wire form: `grantee(32) || expires_at(8, big-endian) || signature(64)`,
//! where the signature covers the first 40 bytes and verifies against the
//! issuer's public key.

use crate::identity::FeedIdentity;
use crate::types::{FeedKey, FEED_KEY_SIZE};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Total size of an encoded link in bytes.
pub const LINK_SIZE: usize = FEED_KEY_SIZE + 8 + 64;

const SIGNED_SIZE: usize = FEED_KEY_SIZE + 8;

#[derive(Error, Debug, PartialEq)]
pub enum TrustError {
    #[error("Malformed link: expected {LINK_SIZE} bytes, got {0}")]
    Malformed(usize),

    #[error("Invalid issuer key")]
    InvalidIssuer,

    #[error("Bad link signature")]
    BadSignature,

    #[error("Link expired at {0}")]
    Expired(u64),
}

/// The claims carried by a trust link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrustLink {
    pub grantee: FeedKey,
    pub expires_at: u64,
}

impl TrustLink {
    /// Issue a signed link granting `grantee` access until `expires_at`.
    pub fn issue(issuer: &FeedIdentity, grantee: FeedKey, expires_at: u64) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(LINK_SIZE);
        bytes.extend_from_slice(grantee.as_bytes());
        bytes.extend_from_slice(&expires_at.to_be_bytes());
        let signature = issuer.sign(&bytes);
        bytes.extend_from_slice(&signature.to_bytes());
        bytes
    }

    /// Parse the claims out of an encoded link without verifying it.
    pub fn parse(bytes: &[u8]) -> Result<Self, TrustError> {
        if bytes.len() != LINK_SIZE {
            return Err(TrustError::Malformed(bytes.len()));
        }
        let grantee = FeedKey::try_from(&bytes[..FEED_KEY_SIZE])
            .map_err(|_| TrustError::Malformed(bytes.len()))?;
        let mut expiry = [0u8; 8];
        expiry.copy_from_slice(&bytes[FEED_KEY_SIZE..SIGNED_SIZE]);
        Ok(Self { grantee, expires_at: u64::from_be_bytes(expiry) })
    }

    /// Verify an encoded link against the issuer's public key and the clock.
    pub fn verify(issuer: &FeedKey, bytes: &[u8], now: u64) -> Result<Self, TrustError> {
        let link = Self::parse(bytes)?;

        let verifying_key =
            VerifyingKey::from_bytes(issuer.as_bytes()).map_err(|_| TrustError::InvalidIssuer)?;
        let signature = Signature::from_slice(&bytes[SIGNED_SIZE..])
            .map_err(|_| TrustError::BadSignature)?;
        verifying_key
            .verify(&bytes[..SIGNED_SIZE], &signature)
            .map_err(|_| TrustError::BadSignature)?;

        if link.expires_at <= now {
            return Err(TrustError::Expired(link.expires_at));
        }
        Ok(link)
    }
}

/// Current time in whole seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
