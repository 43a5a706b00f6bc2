//! I/O effects requested by the sync managers.
//!
//! The managers are pure state machines: every input handed to them
//! returns a list of [`Action`]s for the driver to execute. The managers
//! never perform I/O themselves.

use crate::ledger::RequestToken;
use crate::protocol::{AuthToken, NoteFetchOptions};
use crate::signal::Signal;
use crate::storage::{AnyEntity, StorageRequest};
use crate::timer::CallSite;
use quill_types::{Guid, Usn};
use std::time::Duration;

/// One I/O effect for the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Issue a local-storage request.
    Storage(StorageRequest),

    /// Fetch the next change batch from the note service.
    FetchChunk { after_usn: Usn, full_sync_only: bool },

    /// Fetch a note's full body and resources.
    FetchNoteContent {
        token: RequestToken,
        guid: Guid,
        options: NoteFetchOptions,
    },

    /// Create the entity on the note service.
    PushCreate {
        token: RequestToken,
        entity: AnyEntity,
        linked_auth: Option<AuthToken>,
    },

    /// Update the entity on the note service.
    PushUpdate {
        token: RequestToken,
        entity: AnyEntity,
        linked_auth: Option<AuthToken>,
    },

    /// Arm the single-shot retry timer for a call site.
    StartTimer { site: CallSite, after: Duration },

    /// Cancel every outstanding retry timer.
    CancelTimers,

    /// Surface a signal to the external orchestrator.
    Emit(Signal),
}
