//! Shard key hashing and index reduction.

use std::fmt;

/// How a caller picks one target among a tag's ordered pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ShardKey {
    /// Direct position, reduced modulo the pool length
    Index(i64),
    /// Content key, hashed with [`hash`] and reduced modulo the pool length
    Hash(String),
}

impl ShardKey {
    /// Hash any value by its `Display` form.
    pub fn display(value: &impl fmt::Display) -> Self {
        Self::Hash(value.to_string())
    }

    /// Bucket for a pool of `len` targets. `len` must be non-zero.
    ///
    /// Reduction happens on the low 32 bits of the index or hash so that
    /// existing shard assignments keep landing on the same targets.
    pub fn bucket(&self, len: usize) -> usize {
        debug_assert!(len > 0, "bucket() on an empty pool");
        let raw = match self {
            Self::Index(i) => *i as u64,
            Self::Hash(s) => hash(s),
        };
        ((raw as u32) % (len as u32)) as usize
    }
}

impl From<i64> for ShardKey {
    fn from(value: i64) -> Self {
        Self::Index(value)
    }
}

impl From<i32> for ShardKey {
    fn from(value: i32) -> Self {
        Self::Index(value.into())
    }
}

impl From<u32> for ShardKey {
    fn from(value: u32) -> Self {
        Self::Index(value.into())
    }
}

impl From<usize> for ShardKey {
    fn from(value: usize) -> Self {
        Self::Index(value as i64)
    }
}

impl From<&str> for ShardKey {
    fn from(value: &str) -> Self {
        Self::Hash(value.to_string())
    }
}

impl From<String> for ShardKey {
    fn from(value: String) -> Self {
        Self::Hash(value)
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(i) => write!(f, "#{i}"),
            Self::Hash(s) => write!(f, "{s:?}"),
        }
    }
}

/// Polynomial rolling hash (`h = 31*h + c` over code points).
///
/// Cheap and stable across processes; not collision resistant.
pub fn hash(key: &str) -> u64 {
    key.chars()
        .fold(0u64, |h, c| h.wrapping_mul(31).wrapping_add(c as u64))
}
