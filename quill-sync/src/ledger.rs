//! Request correlation ledger.
//!
//! Every asynchronous local-storage call carries a unique request token.
//! Each in-flight operation class keeps its tokens in a [`PendingSet`];
//! completion callbacks look up and remove the token to route the reply
//! to the right operation. A token lives in at most one pending set at a
//! time. A callback whose token no set owns is not ours — other consumers
//! share the same local-storage channel — and must be a complete no-op.
//!
//! Stage transitions are gated on groups of pending sets all being empty
//! simultaneously, evaluated after every single completion: a dynamic
//! join barrier rather than a fixed wait-for-N.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

/// Opaque correlation identifier attached to every asynchronous
/// local-storage call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestToken(Uuid);

impl RequestToken {
    /// Allocates a fresh token.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RequestToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The set of tokens for one class of in-flight requests.
#[derive(Debug, Clone, Default)]
pub struct PendingSet {
    tokens: HashSet<RequestToken>,
}

impl PendingSet {
    /// Creates an empty pending set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh token and records it as pending.
    pub fn issue(&mut self) -> RequestToken {
        let token = RequestToken::new();
        self.tokens.insert(token);
        token
    }

    /// Removes the token if present. Returns false for tokens this set
    /// does not own — the caller must then treat the callback as not ours.
    pub fn take(&mut self, token: RequestToken) -> bool {
        self.tokens.remove(&token)
    }

    /// Whether the token is pending in this set.
    #[must_use]
    pub fn contains(&self, token: RequestToken) -> bool {
        self.tokens.contains(&token)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Drops all pending tokens. Used by the end-of-pass state reset.
    pub fn clear(&mut self) {
        self.tokens.clear();
    }
}

/// Whether every pending set in the group is empty at once — the stage
/// barrier condition.
pub fn all_settled<'a>(sets: impl IntoIterator<Item = &'a PendingSet>) -> bool {
    sets.into_iter().all(PendingSet::is_empty)
}
