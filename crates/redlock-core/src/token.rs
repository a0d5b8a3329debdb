//! Lock tokens and resource sets

use std::collections::HashSet;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use rand::RngCore;

use crate::error::{LockError, Result};

/// Bytes of entropy per token
pub const TOKEN_BYTES: usize = 16;

/// Random value written to every store for one acquisition
///
/// Extend and release only succeed on stores that still hold this exact value.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Token(Arc<str>);

impl Token {
    /// Draw a fresh 128-bit token from the thread-local CSPRNG
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::rng().fill_bytes(&mut bytes);
        Token(const_hex::encode(bytes).into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Token {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Debug for Token {
    // Only a prefix, the full value is a capability
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Token({}..)", &self.0[..8.min(self.0.len())])
    }
}

/// Validated, ordered set of resource identifiers locked as one unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSet {
    keys: Arc<[String]>,
}

impl ResourceSet {
    pub fn new<I, S>(ids: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys: Vec<String> = ids.into_iter().map(Into::into).collect();
        if keys.is_empty() {
            return Err(LockError::configuration(
                "resource set must contain at least one identifier",
            ));
        }

        let mut seen = HashSet::with_capacity(keys.len());
        for key in &keys {
            if key.trim().is_empty() {
                return Err(LockError::configuration(
                    "resource identifiers must not be empty",
                ));
            }
            if !seen.insert(key.as_str()) {
                return Err(LockError::configuration(format!(
                    "duplicate resource identifier '{}'",
                    key
                )));
            }
        }

        Ok(Self { keys: keys.into() })
    }

    /// Convenience for the common single-resource case
    pub fn single(id: impl Into<String>) -> Result<Self> {
        Self::new([id.into()])
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub(crate) fn shared(&self) -> Arc<[String]> {
        self.keys.clone()
    }
}

impl Display for ResourceSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.keys.join(", "))
    }
}
