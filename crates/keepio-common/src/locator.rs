//! Block locators
//!
//! A locator names an immutable block by the MD5 of its content and its
//! size: `<32 lowercase hex>+<size>[+hint...]`. Hints ride along for routing
//! and permission purposes but never take part in integrity checks.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Length of a hex-encoded MD5 digest
pub const HASH_LEN: usize = 32;

/// Content-addressed block identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Locator {
    hash: String,
    size: u64,
    hints: Vec<String>,
}

impl Locator {
    /// Build a locator from a hash and size
    pub fn new(hash: impl Into<String>, size: u64) -> Result<Self> {
        let hash = hash.into();
        if !is_block_hash(&hash) {
            return Err(Error::InvalidLocator(hash));
        }
        Ok(Self {
            hash,
            size,
            hints: Vec::new(),
        })
    }

    /// Compute the locator for `data`
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self {
            hash: format!("{:x}", md5::compute(data)),
            size: data.len() as u64,
            hints: Vec::new(),
        }
    }

    /// Hex-encoded content hash
    #[must_use]
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Block size in bytes
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Hint segments following the size
    #[must_use]
    pub fn hints(&self) -> &[String] {
        &self.hints
    }

    /// Append a hint segment
    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hints.push(hint.into());
        self
    }

    /// Same block, without hints that only make sense on a remote cluster
    #[must_use]
    pub fn local(&self) -> Self {
        Self {
            hash: self.hash.clone(),
            size: self.size,
            hints: self
                .hints
                .iter()
                .filter(|h| !h.starts_with('R'))
                .cloned()
                .collect(),
        }
    }

    /// Check that `data` is the content this locator names
    pub fn verify(&self, data: &[u8]) -> Result<()> {
        let actual = format!("{:x}", md5::compute(data));
        if actual != self.hash {
            return Err(Error::ChecksumMismatch {
                expected: self.hash.clone(),
                actual,
            });
        }
        if data.len() as u64 != self.size {
            return Err(Error::ChecksumMismatch {
                expected: format!("{} bytes", self.size),
                actual: format!("{} bytes", data.len()),
            });
        }
        Ok(())
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.hash, self.size)?;
        for hint in &self.hints {
            write!(f, "+{hint}")?;
        }
        Ok(())
    }
}

impl FromStr for Locator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('+');
        let hash = parts.next().unwrap_or_default();
        if !is_block_hash(hash) {
            return Err(Error::InvalidLocator(s.to_string()));
        }
        let size = parts
            .next()
            .and_then(|p| p.parse::<u64>().ok())
            .ok_or_else(|| Error::InvalidLocator(s.to_string()))?;
        let hints = parts.map(str::to_string).collect::<Vec<_>>();
        if hints.iter().any(String::is_empty) {
            return Err(Error::InvalidLocator(s.to_string()));
        }
        Ok(Self {
            hash: hash.to_string(),
            size,
            hints,
        })
    }
}

/// Whether `key` has the shape of a block hash (32 lowercase hex digits)
#[must_use]
pub fn is_block_hash(key: &str) -> bool {
    let mut digest = [0u8; HASH_LEN / 2];
    !key.bytes().any(|b| b.is_ascii_uppercase()) && hex::decode_to_slice(key, &mut digest).is_ok()
}
