//! Content identifiers.
//!
//! A [`Cid`] is the SHA-256 digest of a block's bytes. Two blocks with the
//! same bytes always share a CID, on every replica.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

/// A 32-byte SHA-256 content identifier.
///
/// Ordering is byte-lexicographic and is used as the final tie-break when
/// resolving concurrent writes, so it must never depend on anything but
/// content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cid([u8; 32]);

impl Cid {
    /// Digest `bytes` into their content identifier.
    pub fn digest(bytes: &[u8]) -> Self {
        let mut out = [0u8; 32];
        out.copy_from_slice(&Sha256::digest(bytes));
        Cid(out)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Cid(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex encoding (64 chars).
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Parse a 64-char hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 64 || !s.is_ascii() {
            return None;
        }
        let mut bytes = [0u8; 32];
        for (slot, pair) in bytes.iter_mut().zip(s.as_bytes().chunks(2)) {
            let pair = std::str::from_utf8(pair).ok()?;
            *slot = u8::from_str_radix(pair, 16).ok()?;
        }
        Some(Cid(bytes))
    }

    /// First 8 hex chars, for logs.
    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({}..)", self.short())
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

// CIDs travel inside JSON-encoded nodes and change feeds, so they serialize
// as hex strings rather than byte arrays.
impl Serialize for Cid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Cid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Cid::from_hex(&s).ok_or_else(|| de::Error::custom(format!("invalid cid: {}", s)))
    }
}

/// The causal frontier: the CIDs of nodes with no known children.
///
/// Kept sorted and free of duplicates so two equal frontiers compare equal.
pub type ClockHead = Vec<Cid>;

/// Sort and dedup a head set in place.
pub fn normalize_head(head: &mut ClockHead) {
    head.sort();
    head.dedup();
}
