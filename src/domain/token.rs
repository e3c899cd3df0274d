//! Request tokens and their lifecycle
//!
//! A token represents one attempt at an asynchronous request. It moves
//! through a fixed state machine:
//!
//! ```text
//! (none) --create--> ACTIVE --complete--> DONE --accept--> ACCEPTED
//!                                              \--kill----> DEAD
//! ```
//!
//! The state a token is known to be in is carried in its type
//! (`Token<Active>`, `Token<Done>`, ...), so only an active token can be
//! completed and only a done token can be accepted or killed. Tokens read
//! back from storage arrive as [`AnyToken`] and must be narrowed at runtime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

use super::{DocumentId, TokenId, TokenNamespace};

/// Persisted token state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenState {
    /// Request issued, not yet completed
    Active,
    /// Request completed (successfully or not)
    Done,
    /// Result was used by the caller
    Accepted,
    /// Result was discarded
    Dead,
}

impl TokenState {
    pub const ALL: [TokenState; 4] = [
        TokenState::Active,
        TokenState::Done,
        TokenState::Accepted,
        TokenState::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TokenState::Active => "ACTIVE",
            TokenState::Done => "DONE",
            TokenState::Accepted => "ACCEPTED",
            TokenState::Dead => "DEAD",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ACTIVE" => Some(TokenState::Active),
            "DONE" => Some(TokenState::Done),
            "ACCEPTED" => Some(TokenState::Accepted),
            "DEAD" => Some(TokenState::Dead),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TokenState::Accepted | TokenState::Dead)
    }

    /// Whether a token currently in `from` (`None` = does not exist yet)
    /// may be written with state `to`.
    pub fn is_valid_transition(from: Option<TokenState>, to: TokenState) -> bool {
        matches!(
            (from, to),
            (None, TokenState::Active)
                | (Some(TokenState::Active), TokenState::Done)
                | (Some(TokenState::Done), TokenState::Accepted)
                | (Some(TokenState::Done), TokenState::Dead)
        )
    }
}

impl fmt::Display for TokenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State + timestamp + payload of a single token write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenStatus {
    pub state: TokenState,
    pub timestamp: DateTime<Utc>,
    pub data: Option<String>,
}

/// Result of a token read or write at the storage layer.
///
/// The `prev_*` fields describe the namespace as it was immediately before
/// the write (for reads: as it currently is). They are captured in the same
/// atomic operation as the write itself.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenData {
    /// Token the operation applied to
    pub id: TokenId,
    /// Status after the operation
    pub status: TokenStatus,
    /// Status of this token before the operation (None on creation)
    pub prev_status: Option<TokenStatus>,
    /// Last token written in the namespace before the operation
    pub prev_last: Option<TokenId>,
    /// Last token to enter each state before the operation
    pub prev_state: HashMap<TokenState, TokenId>,
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::Active {}
    impl Sealed for super::Done {}
    impl Sealed for super::Accepted {}
    impl Sealed for super::Dead {}
}

/// Type-level token state
pub trait TokenStateMarker: sealed::Sealed + fmt::Debug + Clone + Send + Sync + 'static {
    const STATE: TokenState;
}

#[derive(Debug, Clone, Copy)]
pub struct Active;
#[derive(Debug, Clone, Copy)]
pub struct Done;
#[derive(Debug, Clone, Copy)]
pub struct Accepted;
#[derive(Debug, Clone, Copy)]
pub struct Dead;

impl TokenStateMarker for Active {
    const STATE: TokenState = TokenState::Active;
}
impl TokenStateMarker for Done {
    const STATE: TokenState = TokenState::Done;
}
impl TokenStateMarker for Accepted {
    const STATE: TokenState = TokenState::Accepted;
}
impl TokenStateMarker for Dead {
    const STATE: TokenState = TokenState::Dead;
}

/// A token known to be in state `S`
#[derive(Debug, Clone)]
pub struct Token<S: TokenStateMarker> {
    id: TokenId,
    document_id: DocumentId,
    namespace: TokenNamespace,
    timestamp: DateTime<Utc>,
    data: Option<String>,
    last_mismatch: bool,
    last_created: bool,
    _state: PhantomData<S>,
}

/// Precedence metadata computed when a token is written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Precedence {
    pub last_mismatch: bool,
    pub last_created: bool,
}

impl<S: TokenStateMarker> Token<S> {
    pub(crate) fn new(
        document_id: DocumentId,
        namespace: TokenNamespace,
        status: TokenStatus,
        id: TokenId,
        precedence: Precedence,
    ) -> Self {
        debug_assert_eq!(status.state, S::STATE);
        Self {
            id,
            document_id,
            namespace,
            timestamp: status.timestamp,
            data: status.data,
            last_mismatch: precedence.last_mismatch,
            last_created: precedence.last_created,
            _state: PhantomData,
        }
    }

    pub fn id(&self) -> &TokenId {
        &self.id
    }

    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    pub fn namespace(&self) -> &TokenNamespace {
        &self.namespace
    }

    pub fn state(&self) -> TokenState {
        S::STATE
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn data(&self) -> Option<&str> {
        self.data.as_deref()
    }

    /// Another token was written in this namespace since this one
    pub fn last_mismatch(&self) -> bool {
        self.last_mismatch
    }

    /// No newer token has been created in this namespace
    pub fn last_created(&self) -> bool {
        self.last_created
    }
}

/// Returned when a token read from storage is not in the expected state
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("token {token_id} is {actual}, expected {expected}")]
pub struct TokenStateMismatch {
    pub token_id: TokenId,
    pub expected: TokenState,
    pub actual: TokenState,
}

/// A token in a state only known at runtime
#[derive(Debug, Clone)]
pub enum AnyToken {
    Active(Token<Active>),
    Done(Token<Done>),
    Accepted(Token<Accepted>),
    Dead(Token<Dead>),
}

macro_rules! narrow {
    ($name:ident, $variant:ident, $marker:ty) => {
        pub fn $name(self) -> Result<Token<$marker>, TokenStateMismatch> {
            match self {
                AnyToken::$variant(token) => Ok(token),
                other => Err(TokenStateMismatch {
                    token_id: other.id().clone(),
                    expected: <$marker as TokenStateMarker>::STATE,
                    actual: other.state(),
                }),
            }
        }
    };
}

impl AnyToken {
    pub(crate) fn from_status(
        document_id: DocumentId,
        namespace: TokenNamespace,
        id: TokenId,
        status: TokenStatus,
        precedence: Precedence,
    ) -> Self {
        match status.state {
            TokenState::Active => {
                AnyToken::Active(Token::new(document_id, namespace, status, id, precedence))
            }
            TokenState::Done => {
                AnyToken::Done(Token::new(document_id, namespace, status, id, precedence))
            }
            TokenState::Accepted => {
                AnyToken::Accepted(Token::new(document_id, namespace, status, id, precedence))
            }
            TokenState::Dead => {
                AnyToken::Dead(Token::new(document_id, namespace, status, id, precedence))
            }
        }
    }

    pub fn state(&self) -> TokenState {
        match self {
            AnyToken::Active(_) => TokenState::Active,
            AnyToken::Done(_) => TokenState::Done,
            AnyToken::Accepted(_) => TokenState::Accepted,
            AnyToken::Dead(_) => TokenState::Dead,
        }
    }

    pub fn id(&self) -> &TokenId {
        match self {
            AnyToken::Active(t) => t.id(),
            AnyToken::Done(t) => t.id(),
            AnyToken::Accepted(t) => t.id(),
            AnyToken::Dead(t) => t.id(),
        }
    }

    pub fn last_created(&self) -> bool {
        match self {
            AnyToken::Active(t) => t.last_created(),
            AnyToken::Done(t) => t.last_created(),
            AnyToken::Accepted(t) => t.last_created(),
            AnyToken::Dead(t) => t.last_created(),
        }
    }

    pub fn data(&self) -> Option<&str> {
        match self {
            AnyToken::Active(t) => t.data(),
            AnyToken::Done(t) => t.data(),
            AnyToken::Accepted(t) => t.data(),
            AnyToken::Dead(t) => t.data(),
        }
    }

    narrow!(into_active, Active, Active);
    narrow!(into_done, Done, Done);
    narrow!(into_accepted, Accepted, Accepted);
    narrow!(into_dead, Dead, Dead);
}
