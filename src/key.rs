//! Identity keys and numeric identity IDs.

use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

/// Numeric identity ID carried in the data plane.
///
/// Valid IDs are in the allocator's configured `[min, max]` range with
/// `min >= 1`; zero is reserved and never allocated. Absence is expressed
/// with `Option<IdentityId>`, not a sentinel. Rendered as a base-10 ASCII
/// integer in the KV store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IdentityId(pub u64);

impl IdentityId {
    /// Raw numeric value.
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for IdentityId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(IdentityId)
    }
}

impl From<u64> for IdentityId {
    fn from(raw: u64) -> Self {
        IdentityId(raw)
    }
}

/// Capability trait for allocator keys.
///
/// A key is an opaque description of an equivalence class of workloads
/// (for example the sorted label set of a pod). Two keys are equal iff
/// their canonical encodings are equal; the canonical string is the key's
/// identity in the KV store and must be stable across nodes and versions.
pub trait IdentityKey: Clone + Send + Sync + 'static {
    /// Stable canonical encoding of this key.
    fn canonical(&self) -> String;

    /// Reconstruct a key from its canonical encoding.
    ///
    /// Returns a human-readable reason on failure; the allocator logs and
    /// skips store entries whose value fails to parse.
    fn parse(raw: &str) -> Result<Self, String>;
}

impl IdentityKey for String {
    fn canonical(&self) -> String {
        self.clone()
    }

    fn parse(raw: &str) -> Result<Self, String> {
        Ok(raw.to_string())
    }
}
