use crate::error::GatewayError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A shard configuration as stored and exchanged as JSON.
///
/// ```json
/// { "version": 1, "shards": [ { "id": 4, "url": "http://..." }, ... ] }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardConfig {
    pub version: i32,
    pub shards: Vec<ShardEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardEntry {
    pub id: i32,
    pub url: String,
}

/// The binary tail a shard id encodes.
///
/// A shard id's binary representation, with the leading 1 bit dropped, is the
/// suffix of the request-id bit space that shard covers: id 1 is the empty
/// suffix (whole space), id 4 (`100`) is suffix `00`, id 7 (`111`) is `11`.
/// A request id whose last `len` bits equal `bits` belongs to this shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShardSuffix {
    pub bits: u32,
    pub len: u32,
}

impl ShardSuffix {
    /// Decode a shard id into its suffix. Ids must be strictly positive.
    pub fn from_shard_id(id: i32) -> Result<Self, GatewayError> {
        if id <= 0 {
            return Err(GatewayError::InvalidShardConfig(format!(
                "shard id must be positive, got {id}"
            )));
        }
        let id = id as u32;
        let len = 31 - id.leading_zeros();
        let bits = id - (1 << len);
        Ok(Self { bits, len })
    }

    /// Bit mask selecting this suffix's tail.
    #[inline]
    pub fn mask(&self) -> u32 {
        if self.len == 0 {
            0
        } else {
            (1u32 << self.len) - 1
        }
    }

    /// Does a request-id tail fall under this suffix?
    #[inline]
    pub fn matches_tail(&self, tail: u32) -> bool {
        tail & self.mask() == self.bits
    }

    /// Is `self` a (bit-)prefix of `other`? Two such suffixes overlap, which
    /// makes routing ambiguous.
    pub fn is_prefix_of(&self, other: &ShardSuffix) -> bool {
        self.len <= other.len && other.bits & self.mask() == self.bits
    }

    /// Reconstruct the shard id this suffix came from.
    pub fn shard_id(&self) -> i32 {
        ((1u32 << self.len) | self.bits) as i32
    }
}

impl fmt::Display for ShardSuffix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.len == 0 {
            write!(f, "(empty)")
        } else {
            for i in (0..self.len).rev() {
                write!(f, "{}", (self.bits >> i) & 1)?;
            }
            Ok(())
        }
    }
}
