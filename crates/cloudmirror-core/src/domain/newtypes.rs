//! Domain newtypes with validation
//!
//! This module provides strongly-typed wrappers for remote identifiers,
//! continuation tokens, content hashes and entry names. Each newtype ensures
//! data validity at construction time.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::DomainError;

/// Alias understood by the remote service as "the account root"
const ROOT_ALIAS: &str = "root";

// ============================================================================
// EntryId
// ============================================================================

/// Opaque remote identifier of an entry
///
/// Stable across renames and moves. The remote service owns the format; we
/// only require it to be non-empty and free of control characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntryId(String);

impl EntryId {
    /// Create a new EntryId
    ///
    /// # Errors
    /// Returns error if the ID is empty or contains control characters
    pub fn new(id: String) -> Result<Self, DomainError> {
        if id.is_empty() {
            return Err(DomainError::InvalidEntryId(
                "Entry ID cannot be empty".to_string(),
            ));
        }

        if id.chars().any(char::is_control) {
            return Err(DomainError::InvalidEntryId(format!(
                "Entry ID contains invalid characters: {id:?}"
            )));
        }

        Ok(Self(id))
    }

    /// The alias the remote resolves to the account root record
    #[must_use]
    pub fn root_alias() -> Self {
        Self(ROOT_ALIAS.to_string())
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for EntryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntryId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for EntryId {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<EntryId> for String {
    fn from(id: EntryId) -> Self {
        id.0
    }
}

// ============================================================================
// ContinuationToken
// ============================================================================

/// Opaque cursor into the remote change history
///
/// The token is opaque - we don't validate its contents, only that it's non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContinuationToken(String);

impl ContinuationToken {
    /// Create a new ContinuationToken
    ///
    /// # Errors
    /// Returns error if the token is empty
    pub fn new(token: String) -> Result<Self, DomainError> {
        if token.is_empty() {
            return Err(DomainError::InvalidToken(
                "Continuation token cannot be empty".to_string(),
            ));
        }

        Ok(Self(token))
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ContinuationToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ContinuationToken {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for ContinuationToken {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<ContinuationToken> for String {
    fn from(token: ContinuationToken) -> Self {
        token.0
    }
}

// ============================================================================
// ContentHash
// ============================================================================

/// Content checksum exactly as reported by the remote service
///
/// Never computed locally; the algorithm is whatever the remote uses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    /// Create a new ContentHash
    ///
    /// # Errors
    /// Returns error if the hash is empty or contains whitespace
    pub fn new(hash: String) -> Result<Self, DomainError> {
        if hash.is_empty() {
            return Err(DomainError::InvalidHash("Hash cannot be empty".to_string()));
        }

        if hash.chars().any(char::is_whitespace) {
            return Err(DomainError::InvalidHash(format!(
                "Hash contains whitespace: {hash:?}"
            )));
        }

        Ok(Self(hash))
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ContentHash {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for ContentHash {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.0
    }
}

// ============================================================================
// EntryName
// ============================================================================

/// A single path segment naming an entry among its siblings
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntryName(String);

impl EntryName {
    /// Create a new EntryName
    ///
    /// # Errors
    /// Returns error if the name is empty, `.`/`..`, or contains `/` or NUL
    pub fn new(name: String) -> Result<Self, DomainError> {
        if name.is_empty() {
            return Err(DomainError::InvalidName("Name cannot be empty".to_string()));
        }

        if name == "." || name == ".." {
            return Err(DomainError::InvalidName(format!(
                "Name cannot be a relative segment: {name}"
            )));
        }

        if name.contains('/') || name.contains('\0') {
            return Err(DomainError::InvalidName(format!(
                "Name contains a path separator or NUL: {name:?}"
            )));
        }

        Ok(Self(name))
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for EntryName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntryName {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for EntryName {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<EntryName> for String {
    fn from(name: EntryName) -> Self {
        name.0
    }
}

// ============================================================================
// Tests
// ============================================================================
