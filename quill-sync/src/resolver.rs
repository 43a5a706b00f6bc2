//! Entity duplicate resolver.
//!
//! Decides, for a remote entity from a change batch and a local-storage
//! lookup result, whether to adopt the remote version, keep-and-rename the
//! conflicted local version, or insert a brand-new record. The decision
//! rests on update-sequence-number comparison and the local dirty flag —
//! never on field-level three-way merges.

use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, SecondsFormat, Utc};
use quill_types::{EntityKind, Guid, LocalId, SyncedEntity};
use thiserror::Error;
use tracing::debug;

/// Prefix given to the renamed local copy when a genuine edit conflict is
/// detected.
pub const CONFLICT_PREFIX: &str = "Conflicted";

/// Why a working-list lookup found nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FindError {
    #[error("nothing to search")]
    EmptyList,
    #[error("queried element has no guid")]
    EmptyGuid,
    #[error("queried element has no name")]
    EmptyName,
    #[error("no matching element")]
    NotFound,
}

/// Locates an element by guid. Checks the front element first — the
/// common case is streaming encounter order — then scans the rest.
pub fn find_by_guid<E: SyncedEntity>(list: &[E], guid: &Guid) -> Result<usize, FindError> {
    if guid.is_nil() {
        return Err(FindError::EmptyGuid);
    }
    let Some(front) = list.first() else {
        return Err(FindError::EmptyList);
    };
    if front.guid() == Some(*guid) {
        return Ok(0);
    }
    list.iter()
        .skip(1)
        .position(|e| e.guid() == Some(*guid))
        .map(|i| i + 1)
        .ok_or(FindError::NotFound)
}

/// Locates an element by display name, case-insensitively. Notes compare
/// on title. Same front-element fast path as [`find_by_guid`].
pub fn find_by_name<E: SyncedEntity>(list: &[E], name: &str) -> Result<usize, FindError> {
    if name.is_empty() {
        return Err(FindError::EmptyName);
    }
    let Some(front) = list.first() else {
        return Err(FindError::EmptyList);
    };
    let needle = name.to_lowercase();
    if front.display_name().to_lowercase() == needle {
        return Ok(0);
    }
    list.iter()
        .skip(1)
        .position(|e| e.display_name().to_lowercase() == needle)
        .map(|i| i + 1)
        .ok_or(FindError::NotFound)
}

/// The outcome of resolving a remote entity against its local duplicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution<E> {
    /// Local is already current or ahead — nothing to do.
    AlreadyCurrent,
    /// The remote copy is authoritative and the local one carries no
    /// unsynchronized edits: replace local content with this record
    /// (local id preserved, dirty cleared).
    RemoteWins(E),
    /// Genuine edit conflict: the user ends up with two objects instead
    /// of a lossy merge. `renamed_local` keeps the local edits under a
    /// "Conflicted" name, stripped of guid and USN so it re-uploads as
    /// new; `remote_to_add` is the server's canonical copy, queued as a
    /// brand-new add once the rename update settles.
    Conflict { renamed_local: E, remote_to_add: E },
}

/// Resolves a remote change-batch entity against the matching local one.
///
/// The remote side must carry a guid and USN; their absence is an
/// unrecoverable protocol violation that aborts the pass.
pub fn resolve<E: SyncedEntity>(
    remote: &E,
    local: &E,
    now: DateTime<Utc>,
) -> SyncResult<Resolution<E>> {
    let remote_guid = remote.guid().ok_or_else(|| {
        SyncError::Protocol(format!("remote {} has no guid", E::KIND))
    })?;
    let remote_usn = remote.usn().ok_or_else(|| {
        SyncError::Protocol(format!("remote {} {remote_guid} has no usn", E::KIND))
    })?;

    // A linked notebook is a pointer to another account's shared notebook;
    // there is no local content to merge, the remote copy always wins.
    if E::KIND == EntityKind::LinkedNotebook {
        return Ok(Resolution::RemoteWins(adopt(remote, local)));
    }

    let remote_is_newer = match local.usn() {
        None => true,
        Some(local_usn) => remote_usn > local_usn,
    };
    if !remote_is_newer {
        return Ok(Resolution::AlreadyCurrent);
    }

    if !local.is_dirty() {
        debug!(
            kind = %E::KIND,
            guid = %remote_guid,
            "remote copy is newer and local is clean, adopting remote"
        );
        return Ok(Resolution::RemoteWins(adopt(remote, local)));
    }

    let mut renamed_local = local.clone();
    renamed_local.set_display_name(conflict_name(local.display_name(), now));
    renamed_local.set_dirty(true);
    renamed_local.set_guid(None);
    renamed_local.set_usn(None);

    let mut remote_to_add = remote.clone();
    remote_to_add.set_local_id(LocalId::new());
    remote_to_add.set_dirty(false);

    debug!(
        kind = %E::KIND,
        guid = %remote_guid,
        renamed = %renamed_local.display_name(),
        "edit conflict, keeping both copies"
    );

    Ok(Resolution::Conflict {
        renamed_local,
        remote_to_add,
    })
}

/// Replaces local content with remote content, preserving the local id.
fn adopt<E: SyncedEntity>(remote: &E, local: &E) -> E {
    let mut adopted = remote.clone();
    adopted.set_local_id(local.local_id());
    adopted.set_dirty(false);
    adopted
}

fn conflict_name(original: &str, now: DateTime<Utc>) -> String {
    format!(
        "{CONFLICT_PREFIX} {original} ({})",
        now.to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_types::Tag;

    #[test]
    fn conflict_name_contains_prefix_and_original() {
        let name = conflict_name("Work", Utc::now());
        assert!(name.starts_with("Conflicted Work ("));
    }

    #[test]
    fn find_by_guid_front_fast_path() {
        let mut a = Tag::new("a");
        let guid = Guid::new();
        a.guid = Some(guid);
        let list = vec![a, Tag::new("b")];
        assert_eq!(find_by_guid(&list, &guid), Ok(0));
    }
}
