//! Error types for the sync core.

use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in the sync core.
///
/// All of these are terminal for the current pass — there is no
/// partial-success continuation. Recoverable remote conditions (rate
/// limits, auth expiry, data conflicts) never surface here; they are
/// handled in-band by the managers.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Protocol violation: entity missing a required guid or USN,
    /// malformed chunk, or an internal-consistency lookup miss.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A manager halted its pass with a failure signal. Storage and
    /// remote failures surface here; the message names the operation
    /// that failed.
    #[error("sync pass failed: {0}")]
    PassFailed(String),

    /// The pass was stopped before completing.
    #[error("sync pass stopped")]
    Stopped,

    /// A channel to a collaborator closed mid-pass.
    #[error("channel closed")]
    ChannelClosed,
}
