//! Core identifier types for quote-relay
//!
//! Documents are numeric quote identifiers; token namespaces and token ids
//! are opaque strings.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Quote/document identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(pub u64);

impl DocumentId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Postgres BIGINT representation
    pub fn as_i64(&self) -> i64 {
        self.0 as i64
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for DocumentId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Token namespace (scoped to a single document)
///
/// A namespace usually names a category of external lookup, e.g. the
/// request key passed to the guarded request wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenNamespace(pub String);

impl TokenNamespace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self(namespace.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TokenNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TokenNamespace {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TokenNamespace {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Opaque token identifier, unique within a namespace
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(pub String);

impl TokenId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TokenId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TokenId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Kind of delta recorded against a document (`data`, `ratedata`, ...)
///
/// Kept as a string because it is read back from storage; the encoder's
/// event-type lookup decides which kinds are publishable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeltaKind(pub String);

impl DeltaKind {
    pub const DATA: &'static str = "data";
    pub const RATEDATA: &'static str = "ratedata";

    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn data() -> Self {
        Self(Self::DATA.to_string())
    }

    pub fn ratedata() -> Self {
        Self(Self::RATEDATA.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeltaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeltaKind {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
