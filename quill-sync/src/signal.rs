//! Signals the sync managers emit to the external orchestrator.

use quill_types::{Guid, Usn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A progress or outcome signal produced by either sync manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Signal {
    /// The current pass failed and has halted. Not retried automatically.
    Failure(String),

    /// The pass completed. Carries the latest known update counts to hand
    /// to the next pass as its resume point.
    Finished {
        last_update_count: Usn,
        per_linked_notebook_update_counts: HashMap<Guid, Usn>,
        /// Another client pushed changes concurrently; a fresh incremental
        /// download-merge pass should run after this one.
        should_repeat_incremental_sync: bool,
    },

    /// The remote service rate-limited a call; a retry timer for the given
    /// number of seconds is armed. Informational, not a failure.
    RateLimitExceeded(u32),

    /// The server has newer data than this upload round assumed. The
    /// expected reaction is to re-run the download merge before resuming.
    ConflictDetected,

    /// A pushed entity's returned USN skipped ahead of the tracked update
    /// count — some other client is writing concurrently.
    ShouldRepeatIncrementalSync,

    /// Progress is frozen. When `pending_authentication` is true, the pass
    /// resumes only after fresh credentials arrive.
    Paused { pending_authentication: bool },

    /// A stop request has been honored; no local-storage mutation was left
    /// half-issued.
    Stopped,

    /// The primary account's authentication token has expired; a fresh one
    /// is needed before the pass can resume.
    RequestAuthToken,

    /// Authentication tokens are needed for the given linked notebooks
    /// (guid plus share key where known).
    RequestAuthTokensForLinkedNotebooks(Vec<(Guid, Option<String>)>),
}
