//! Sync chunks — paginated change batches from the note service.
//!
//! A chunk is one page of the service's change history: created/updated
//! entities per kind, expunged-guid lists per kind, and two USN markers
//! bounding the page. Chunks are buffered for one full-sync pass, then
//! flattened into a single working list per kind.

use crate::entity::{LinkedNotebook, Note, Notebook, SavedSearch, SyncedEntity, Tag};
use crate::ids::{Guid, Usn};
use serde::{Deserialize, Serialize};

/// One page of the remote service's change history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncChunk {
    /// Highest USN contained in this chunk.
    pub chunk_high_usn: Usn,
    /// The account's current total USN at the time the chunk was built.
    /// The client has caught up once `chunk_high_usn` reaches this.
    pub account_update_count: Usn,

    pub tags: Vec<Tag>,
    pub searches: Vec<SavedSearch>,
    pub notebooks: Vec<Notebook>,
    pub notes: Vec<Note>,
    pub linked_notebooks: Vec<LinkedNotebook>,

    pub expunged_tags: Vec<Guid>,
    pub expunged_searches: Vec<Guid>,
    pub expunged_notebooks: Vec<Guid>,
    pub expunged_notes: Vec<Guid>,
    pub expunged_linked_notebooks: Vec<Guid>,
}

impl SyncChunk {
    /// Creates an empty chunk with the given USN markers.
    #[must_use]
    pub fn new(chunk_high_usn: Usn, account_update_count: Usn) -> Self {
        Self {
            chunk_high_usn,
            account_update_count,
            ..Self::default()
        }
    }

    /// Whether this chunk is the last page of the download.
    #[must_use]
    pub fn is_last(&self) -> bool {
        self.chunk_high_usn >= self.account_update_count
    }
}

/// Flattens a kind across a buffered chunk sequence into one working list.
///
/// Within the sequence, a later occurrence of a guid replaces an earlier
/// one, and expunge lists delete matching elements from everything seen so
/// far. Elements without a guid are kept as-is; the merge pipeline treats
/// them as a protocol violation when it gets to them.
pub fn flatten<E, I, X>(chunks: &[SyncChunk], items: I, expunged: X) -> Vec<E>
where
    E: SyncedEntity,
    I: Fn(&SyncChunk) -> &[E],
    X: Fn(&SyncChunk) -> &[Guid],
{
    let mut out: Vec<E> = Vec::new();
    for chunk in chunks {
        for item in items(chunk) {
            let existing = item
                .guid()
                .and_then(|guid| out.iter().position(|e| e.guid() == Some(guid)));
            match existing {
                Some(idx) => out[idx] = item.clone(),
                None => out.push(item.clone()),
            }
        }
        for guid in expunged(chunk) {
            out.retain(|e| e.guid() != Some(*guid));
        }
    }
    out
}

/// Per-kind flatten helpers over a buffered chunk sequence.
impl SyncChunk {
    pub fn flatten_tags(chunks: &[SyncChunk]) -> Vec<Tag> {
        flatten(chunks, |c| &c.tags, |c| &c.expunged_tags)
    }

    pub fn flatten_searches(chunks: &[SyncChunk]) -> Vec<SavedSearch> {
        flatten(chunks, |c| &c.searches, |c| &c.expunged_searches)
    }

    pub fn flatten_notebooks(chunks: &[SyncChunk]) -> Vec<Notebook> {
        flatten(chunks, |c| &c.notebooks, |c| &c.expunged_notebooks)
    }

    pub fn flatten_notes(chunks: &[SyncChunk]) -> Vec<Note> {
        flatten(chunks, |c| &c.notes, |c| &c.expunged_notes)
    }

    pub fn flatten_linked_notebooks(chunks: &[SyncChunk]) -> Vec<LinkedNotebook> {
        flatten(
            chunks,
            |c| &c.linked_notebooks,
            |c| &c.expunged_linked_notebooks,
        )
    }
}
