//! Block summaries and scan ranges

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Block hash length in bytes
pub const BLOCK_HASH_LEN: usize = 32;

/// Fixed-size block hash
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockHash(pub [u8; BLOCK_HASH_LEN]);

impl BlockHash {
    /// Build a hash from a byte slice, `None` if the length is wrong
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; BLOCK_HASH_LEN]>::try_from(bytes).ok().map(Self)
    }

    /// Parse a hex-encoded hash
    pub fn from_hex(hex_str: &str) -> Option<Self> {
        hex::decode(hex_str)
            .ok()
            .and_then(|bytes| Self::from_slice(&bytes))
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; BLOCK_HASH_LEN] {
        &self.0
    }

    /// Hex encoding
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", self.to_hex())
    }
}

impl Serialize for BlockHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for BlockHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid block hash: {}", s)))
    }
}

/// Compact block summary received from the chain source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSummary {
    /// Block height
    pub height: u64,
    /// Block hash
    pub hash: BlockHash,
    /// Previous block hash
    pub prev_hash: BlockHash,
    /// Block timestamp (Unix epoch)
    #[serde(default)]
    pub time: u32,
    /// Opaque data consumed by the scanner
    #[serde(default, with = "hex_bytes")]
    pub payload: Vec<u8>,
}

impl BlockSummary {
    /// Whether `self` directly extends `parent`
    pub fn extends(&self, parent: &BlockSummary) -> bool {
        self.height == parent.height + 1 && self.prev_hash == parent.hash
    }
}

/// Inclusive, ascending height range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScanRange {
    /// First height (inclusive)
    pub start: u64,
    /// Last height (inclusive)
    pub end: u64,
}

impl ScanRange {
    /// Create a range, `None` if `start > end`
    pub fn new(start: u64, end: u64) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    /// Range covering one height
    pub fn single(height: u64) -> Self {
        Self {
            start: height,
            end: height,
        }
    }

    /// Number of heights in the range
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Always false: a range holds at least one height
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Whether `height` lies in the range
    pub fn contains(&self, height: u64) -> bool {
        (self.start..=self.end).contains(&height)
    }

    /// Iterate heights in ascending order
    pub fn heights(&self) -> std::ops::RangeInclusive<u64> {
        self.start..=self.end
    }
}

impl fmt::Display for ScanRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
