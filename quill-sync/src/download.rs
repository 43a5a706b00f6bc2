//! Full/incremental download-and-merge manager.
//!
//! Pulls paginated change batches from the note service until the client
//! has caught up with the account's current update count, then drives
//! strictly ordered per-kind merge pipelines against local storage:
//! tags, saved searches, linked notebooks, notebooks, and finally notes
//! once both the tag and notebook pipelines have fully settled. Duplicate
//! detection and conflict resolution go through [`crate::resolver`].
//!
//! The manager is a pure state machine in the sans-I/O style: every input
//! returns the [`Action`]s the driver must perform. All shared state is
//! touched only from these handlers, so the whole pass is single-threaded
//! cooperative with no locks.

use crate::action::Action;
use crate::ledger::{all_settled, PendingSet, RequestToken};
use crate::protocol::{NoteFetchOptions, RemoteError, RemoteErrorCode};
use crate::resolver::{self, Resolution};
use crate::signal::Signal;
use crate::storage::{AnyEntity, StorageReply, StorageRequest};
use crate::timer::CallSite;
use chrono::Utc;
use quill_types::{
    EntityKind, Guid, LinkedNotebook, Note, Notebook, SavedSearch, SyncChunk, SyncedEntity, Tag,
    Usn,
};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Fetching,
    Merging,
    Finished,
    Failed,
    Stopped,
}

/// Merge pipeline stages, in the order they unblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Tags,
    Searches,
    LinkedNotebooks,
    Notebooks,
    Notes,
    Done,
}

/// Whether a note lands in local storage as an add or an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NoteTarget {
    Add,
    Update,
}

/// A note waiting to be persisted once its owning notebook is known.
#[derive(Debug, Clone)]
struct NoteWrite {
    note: Note,
    target: NoteTarget,
    /// For conflict chains: the server's canonical copy to add once this
    /// write settles.
    then_add: Option<AnyEntity>,
}

/// What an outstanding storage request was for.
#[derive(Debug, Clone)]
enum Op {
    FindByGuid { kind: EntityKind, guid: Guid },
    FindByName { kind: EntityKind, guid: Guid },
    FindNotebookForNote { notebook_guid: Guid },
    Add { kind: EntityKind },
    Update { kind: EntityKind, then_add: Option<AnyEntity> },
}

/// Per-kind pending request sets.
#[derive(Debug, Default)]
struct KindLedger {
    find_guid: PendingSet,
    find_name: PendingSet,
    add: PendingSet,
    update: PendingSet,
}

impl KindLedger {
    fn settled(&self) -> bool {
        all_settled([&self.find_guid, &self.find_name, &self.add, &self.update])
    }

    fn clear(&mut self) {
        self.find_guid.clear();
        self.find_name.clear();
        self.add.clear();
        self.update.clear();
    }
}

/// The download merge orchestrator.
pub struct FullSyncManager {
    phase: Phase,
    stage: Stage,
    stop_requested: bool,

    after_usn: Usn,
    full_sync_only: bool,
    account_update_count: Usn,
    chunks: Vec<SyncChunk>,

    tags: Vec<Tag>,
    searches: Vec<SavedSearch>,
    notebooks: Vec<Notebook>,
    notes: Vec<Note>,
    linked_notebooks: Vec<LinkedNotebook>,

    ledgers: [KindLedger; 5],
    ops: HashMap<RequestToken, Op>,

    /// Outstanding full-note-content fetches.
    note_content: PendingSet,
    content_ops: HashMap<RequestToken, (Note, NoteTarget)>,
    /// Content fetches parked behind a rate-limit retry timer.
    deferred_fetches: HashMap<Guid, (Note, NoteTarget)>,

    /// Notebooks needed to persist notes, resolved lazily and kept for
    /// the rest of the pass.
    notebook_cache: HashMap<Guid, Notebook>,
    notebook_lookup: PendingSet,
    waiting_notes: HashMap<Guid, Vec<NoteWrite>>,
}

impl Default for FullSyncManager {
    fn default() -> Self {
        Self::new()
    }
}

impl FullSyncManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            stage: Stage::Tags,
            stop_requested: false,
            after_usn: Usn::default(),
            full_sync_only: false,
            account_update_count: Usn::default(),
            chunks: Vec::new(),
            tags: Vec::new(),
            searches: Vec::new(),
            notebooks: Vec::new(),
            notes: Vec::new(),
            linked_notebooks: Vec::new(),
            ledgers: Default::default(),
            ops: HashMap::new(),
            note_content: PendingSet::new(),
            content_ops: HashMap::new(),
            deferred_fetches: HashMap::new(),
            notebook_cache: HashMap::new(),
            notebook_lookup: PendingSet::new(),
            waiting_notes: HashMap::new(),
        }
    }

    /// Whether the pass has reached a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, Phase::Finished | Phase::Failed | Phase::Stopped)
    }

    /// Begins a pass, resuming from `after_usn` (zero for a full sync).
    pub fn start(&mut self, after_usn: Usn, full_sync_only: bool) -> Vec<Action> {
        self.clear();
        self.phase = Phase::Fetching;
        self.stage = Stage::Tags;
        self.stop_requested = false;
        self.after_usn = after_usn;
        self.full_sync_only = full_sync_only;
        info!(after_usn = %after_usn, "starting download merge pass");
        vec![Action::FetchChunk {
            after_usn,
            full_sync_only,
        }]
    }

    /// Requests cancellation; honored once every pending request settles
    /// so no local-storage mutation is left half-issued.
    pub fn stop(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.is_terminal() {
            return actions;
        }
        self.stop_requested = true;
        if self.phase == Phase::Merging && self.nothing_pending() {
            self.honor_stop(&mut actions);
        }
        actions
    }

    /// Feeds the next change batch from the note service.
    pub fn handle_chunk(&mut self, chunk: SyncChunk) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.phase != Phase::Fetching {
            return actions;
        }
        if self.stop_requested {
            self.honor_stop(&mut actions);
            return actions;
        }

        self.after_usn = chunk.chunk_high_usn;
        self.account_update_count = chunk.account_update_count;
        let last = chunk.is_last();
        debug!(
            chunk_high_usn = %chunk.chunk_high_usn,
            account_update_count = %chunk.account_update_count,
            "buffered change batch"
        );
        self.chunks.push(chunk);

        if !last {
            actions.push(Action::FetchChunk {
                after_usn: self.after_usn,
                full_sync_only: self.full_sync_only,
            });
            return actions;
        }

        self.begin_merge(&mut actions);
        actions
    }

    /// A chunk fetch failed; the whole pass aborts.
    pub fn handle_chunk_failed(&mut self, error: RemoteError) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.phase != Phase::Fetching {
            return actions;
        }
        self.fail(
            format!("failed to download sync chunks: {error}"),
            &mut actions,
        );
        actions
    }

    /// Routes a local-storage reply back to its in-flight operation.
    /// Replies whose token no pending set owns are not ours and are
    /// ignored entirely.
    pub fn handle_storage_reply(&mut self, reply: StorageReply) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.phase != Phase::Merging {
            return actions;
        }
        let token = reply.token();
        let Some(op) = self.ops.remove(&token) else {
            return actions;
        };

        match (op, reply) {
            (Op::FindByGuid { kind, guid }, StorageReply::FoundByGuid { entity, .. }) => {
                self.ledger_mut(kind).find_guid.take(token);
                self.on_found(kind, guid, entity, &mut actions);
            }
            (Op::FindByGuid { kind, guid }, StorageReply::NotFoundByGuid { .. }) => {
                self.ledger_mut(kind).find_guid.take(token);
                // The remote element may still collide by name with a
                // local entity that was never synchronized.
                self.issue_find_by_name(kind, guid, &mut actions);
            }
            (Op::FindByName { kind, guid }, StorageReply::FoundByName { entity, .. }) => {
                self.ledger_mut(kind).find_name.take(token);
                self.on_found(kind, guid, entity, &mut actions);
            }
            (Op::FindByName { kind, guid }, StorageReply::NotFoundByName { .. }) => {
                self.ledger_mut(kind).find_name.take(token);
                self.on_new(kind, guid, &mut actions);
            }
            (
                Op::FindNotebookForNote { notebook_guid },
                StorageReply::FoundByGuid { entity, .. },
            ) => {
                self.notebook_lookup.take(token);
                let AnyEntity::Notebook(notebook) = entity else {
                    self.fail(
                        format!("local storage returned a non-notebook for {notebook_guid}"),
                        &mut actions,
                    );
                    return actions;
                };
                self.notebook_cache.insert(notebook_guid, notebook.clone());
                for write in self.waiting_notes.remove(&notebook_guid).unwrap_or_default() {
                    self.emit_note_write(write, notebook.clone(), &mut actions);
                }
            }
            (Op::FindNotebookForNote { notebook_guid }, StorageReply::NotFoundByGuid { .. }) => {
                self.notebook_lookup.take(token);
                self.fail(
                    format!(
                        "notebook {notebook_guid} needed for a downloaded note is absent from \
                         local storage"
                    ),
                    &mut actions,
                );
                return actions;
            }
            (Op::Add { kind }, StorageReply::AddCompleted { .. }) => {
                self.ledger_mut(kind).add.take(token);
                debug!(kind = %kind, "merged remote element into local storage");
            }
            (Op::Update { kind, then_add }, StorageReply::UpdateCompleted { .. }) => {
                self.ledger_mut(kind).update.take(token);
                if let Some(entity) = then_add {
                    // The rename settled; the server's canonical copy now
                    // goes in as a brand-new record.
                    self.issue_add(entity, &mut actions);
                }
            }
            (Op::Add { kind }, StorageReply::AddFailed { message, .. }) => {
                self.ledger_mut(kind).add.take(token);
                self.fail(format!("add {kind} failed: {message}"), &mut actions);
                return actions;
            }
            (Op::Update { kind, .. }, StorageReply::UpdateFailed { message, .. }) => {
                self.ledger_mut(kind).update.take(token);
                self.fail(format!("update {kind} failed: {message}"), &mut actions);
                return actions;
            }
            (Op::FindByGuid { kind, .. }, StorageReply::FindFailed { message, .. }) => {
                self.ledger_mut(kind).find_guid.take(token);
                self.fail(
                    format!("find {kind} by guid failed: {message}"),
                    &mut actions,
                );
                return actions;
            }
            (Op::FindByName { kind, .. }, StorageReply::FindFailed { message, .. }) => {
                self.ledger_mut(kind).find_name.take(token);
                self.fail(
                    format!("find {kind} by name failed: {message}"),
                    &mut actions,
                );
                return actions;
            }
            (Op::FindNotebookForNote { .. }, StorageReply::FindFailed { message, .. }) => {
                self.notebook_lookup.take(token);
                self.fail(
                    format!("find notebook for note failed: {message}"),
                    &mut actions,
                );
                return actions;
            }
            (op, reply) => {
                self.fail(
                    format!("mismatched local-storage reply {reply:?} for operation {op:?}"),
                    &mut actions,
                );
                return actions;
            }
        }

        self.maybe_advance(&mut actions);
        actions
    }

    /// Feeds the result of a full-note-content fetch.
    pub fn handle_note_content(
        &mut self,
        token: RequestToken,
        result: Result<Note, RemoteError>,
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.phase != Phase::Merging {
            return actions;
        }
        if !self.note_content.take(token) {
            return actions;
        }
        let Some((mut note, target)) = self.content_ops.remove(&token) else {
            return actions;
        };

        match result {
            Ok(full) => {
                note.content = full.content;
                note.resources = full.resources;
                self.ensure_notebook(
                    NoteWrite {
                        note,
                        target,
                        then_add: None,
                    },
                    &mut actions,
                );
            }
            Err(RemoteError {
                code: RemoteErrorCode::RateLimitReached { duration_s },
                ..
            }) => {
                // Defer the add/update via a timer rather than retrying
                // immediately.
                let Some(guid) = note.guid() else {
                    self.fail(
                        "rate-limited content fetch for a note without a guid".into(),
                        &mut actions,
                    );
                    return actions;
                };
                warn!(%guid, duration_s, "note content fetch rate-limited");
                self.deferred_fetches.insert(guid, (note, target));
                actions.push(Action::StartTimer {
                    site: CallSite::GetFullNoteData(guid),
                    after: Duration::from_secs(u64::from(duration_s)),
                });
                actions.push(Action::Emit(Signal::RateLimitExceeded(duration_s)));
            }
            Err(error) => {
                self.fail(
                    format!("failed to download full note data: {error}"),
                    &mut actions,
                );
                return actions;
            }
        }

        self.maybe_advance(&mut actions);
        actions
    }

    /// A retry timer fired; re-issues the deferred operation verbatim.
    pub fn handle_timer_fired(&mut self, site: CallSite) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.phase != Phase::Merging {
            return actions;
        }
        if let CallSite::GetFullNoteData(guid) = site {
            if let Some((note, target)) = self.deferred_fetches.remove(&guid) {
                self.start_content_fetch(note, target, &mut actions);
            }
        }
        actions
    }

    // ── Merge pipeline ───────────────────────────────────────────

    fn begin_merge(&mut self, actions: &mut Vec<Action>) {
        self.phase = Phase::Merging;
        self.tags = SyncChunk::flatten_tags(&self.chunks);
        self.searches = SyncChunk::flatten_searches(&self.chunks);
        self.notebooks = SyncChunk::flatten_notebooks(&self.chunks);
        self.notes = SyncChunk::flatten_notes(&self.chunks);
        self.linked_notebooks = SyncChunk::flatten_linked_notebooks(&self.chunks);
        self.chunks.clear();
        info!(
            tags = self.tags.len(),
            searches = self.searches.len(),
            notebooks = self.notebooks.len(),
            notes = self.notes.len(),
            linked_notebooks = self.linked_notebooks.len(),
            "change batches drained, merging"
        );

        self.stage = Stage::Tags;
        self.launch_stage::<Tag>(actions);
        self.maybe_advance(actions);
    }

    /// Advances through the stage pipeline as far as the barriers allow.
    /// Called after every settled request, giving barrier semantics by
    /// dynamic reference counting rather than a fixed wait-for-N.
    fn maybe_advance(&mut self, actions: &mut Vec<Action>) {
        if self.phase != Phase::Merging {
            return;
        }
        if self.stop_requested {
            if self.nothing_pending() {
                self.honor_stop(actions);
            }
            return;
        }
        loop {
            match self.stage {
                Stage::Tags => {
                    if !self.kind_settled(EntityKind::Tag) {
                        return;
                    }
                    self.stage = Stage::Searches;
                    self.launch_stage::<SavedSearch>(actions);
                }
                Stage::Searches => {
                    if !self.kind_settled(EntityKind::SavedSearch) {
                        return;
                    }
                    self.stage = Stage::LinkedNotebooks;
                    self.launch_stage::<LinkedNotebook>(actions);
                }
                Stage::LinkedNotebooks => {
                    if !self.kind_settled(EntityKind::LinkedNotebook) {
                        return;
                    }
                    self.stage = Stage::Notebooks;
                    self.launch_stage::<Notebook>(actions);
                }
                Stage::Notebooks => {
                    // Notes need resolved notebooks for the add/update
                    // call signature and resolved tags for their tag
                    // references; both pending sets must be empty at once.
                    if !(self.kind_settled(EntityKind::Notebook)
                        && self.kind_settled(EntityKind::Tag))
                    {
                        return;
                    }
                    self.stage = Stage::Notes;
                    self.launch_stage::<Note>(actions);
                }
                Stage::Notes => {
                    if !self.notes_settled() || !self.all_settled_overall() {
                        return;
                    }
                    self.stage = Stage::Done;
                    self.phase = Phase::Finished;
                    info!(last_update_count = %self.account_update_count, "download merge finished");
                    actions.push(Action::Emit(Signal::Finished {
                        last_update_count: self.account_update_count,
                        per_linked_notebook_update_counts: HashMap::new(),
                        should_repeat_incremental_sync: false,
                    }));
                    let account_update_count = self.account_update_count;
                    self.clear();
                    self.account_update_count = account_update_count;
                    return;
                }
                Stage::Done => return,
            }
            if self.phase != Phase::Merging {
                return;
            }
        }
    }

    fn launch_stage<E: Slot>(&mut self, actions: &mut Vec<Action>) {
        let mut guids = Vec::with_capacity(E::working(self).len());
        let mut missing_guid = false;
        for element in E::working(self).iter() {
            match element.guid() {
                Some(guid) if !guid.is_nil() => guids.push(guid),
                _ => missing_guid = true,
            }
        }
        if missing_guid {
            self.fail(
                format!("change batch carries a {} without a guid", E::KIND),
                actions,
            );
            return;
        }
        if guids.is_empty() {
            return;
        }
        debug!(kind = %E::KIND, count = guids.len(), "merging remote elements");
        for guid in guids {
            let token = self.ledger_mut(E::KIND).find_guid.issue();
            self.ops.insert(token, Op::FindByGuid { kind: E::KIND, guid });
            actions.push(Action::Storage(StorageRequest::FindByGuid {
                token,
                kind: E::KIND,
                guid,
            }));
        }
    }

    fn on_found(&mut self, kind: EntityKind, guid: Guid, local: AnyEntity, actions: &mut Vec<Action>) {
        match kind {
            EntityKind::Tag => self.resolve_found::<Tag>(guid, local, actions),
            EntityKind::SavedSearch => self.resolve_found::<SavedSearch>(guid, local, actions),
            EntityKind::Notebook => self.resolve_found::<Notebook>(guid, local, actions),
            EntityKind::Note => self.resolve_found::<Note>(guid, local, actions),
            EntityKind::LinkedNotebook => {
                self.resolve_found::<LinkedNotebook>(guid, local, actions)
            }
        }
    }

    fn resolve_found<E: Slot>(&mut self, guid: Guid, local: AnyEntity, actions: &mut Vec<Action>) {
        let Some(local) = E::from_any(local) else {
            self.fail(
                format!("local storage returned a different kind for {} {guid}", E::KIND),
                actions,
            );
            return;
        };
        let idx = match resolver::find_by_guid(E::working(self), &guid) {
            Ok(idx) => idx,
            Err(error) => {
                self.fail(
                    format!("cannot locate {} {guid} in the working list: {error}", E::KIND),
                    actions,
                );
                return;
            }
        };
        // The element has been actioned whatever the outcome.
        let remote = E::working(self).remove(idx);

        match resolver::resolve(&remote, &local, Utc::now()) {
            Ok(Resolution::AlreadyCurrent) => {}
            Ok(Resolution::RemoteWins(updated)) => {
                self.issue_update(updated.into(), None, actions);
            }
            Ok(Resolution::Conflict {
                renamed_local,
                remote_to_add,
            }) => {
                self.issue_update(renamed_local.into(), Some(remote_to_add.into()), actions);
            }
            Err(error) => self.fail(error.to_string(), actions),
        }
    }

    fn issue_find_by_name(&mut self, kind: EntityKind, guid: Guid, actions: &mut Vec<Action>) {
        match kind {
            EntityKind::Tag => self.find_name_for::<Tag>(guid, actions),
            EntityKind::SavedSearch => self.find_name_for::<SavedSearch>(guid, actions),
            EntityKind::Notebook => self.find_name_for::<Notebook>(guid, actions),
            EntityKind::Note => self.find_name_for::<Note>(guid, actions),
            EntityKind::LinkedNotebook => self.find_name_for::<LinkedNotebook>(guid, actions),
        }
    }

    fn find_name_for<E: Slot>(&mut self, guid: Guid, actions: &mut Vec<Action>) {
        let idx = match resolver::find_by_guid(E::working(self), &guid) {
            Ok(idx) => idx,
            Err(error) => {
                self.fail(
                    format!("cannot locate {} {guid} in the working list: {error}", E::KIND),
                    actions,
                );
                return;
            }
        };
        let name = E::working(self)[idx].display_name().to_string();
        if name.is_empty() {
            self.fail(
                format!("change batch carries a {} {guid} without a name", E::KIND),
                actions,
            );
            return;
        }
        let token = self.ledger_mut(E::KIND).find_name.issue();
        self.ops.insert(token, Op::FindByName { kind: E::KIND, guid });
        actions.push(Action::Storage(StorageRequest::FindByName {
            token,
            kind: E::KIND,
            name,
        }));
    }

    fn on_new(&mut self, kind: EntityKind, guid: Guid, actions: &mut Vec<Action>) {
        match kind {
            EntityKind::Tag => self.add_new::<Tag>(guid, actions),
            EntityKind::SavedSearch => self.add_new::<SavedSearch>(guid, actions),
            EntityKind::Notebook => self.add_new::<Notebook>(guid, actions),
            EntityKind::Note => self.add_new::<Note>(guid, actions),
            EntityKind::LinkedNotebook => self.add_new::<LinkedNotebook>(guid, actions),
        }
    }

    fn add_new<E: Slot>(&mut self, guid: Guid, actions: &mut Vec<Action>) {
        let idx = match resolver::find_by_guid(E::working(self), &guid) {
            Ok(idx) => idx,
            Err(error) => {
                self.fail(
                    format!("cannot locate {} {guid} in the working list: {error}", E::KIND),
                    actions,
                );
                return;
            }
        };
        let mut fresh = E::working(self).remove(idx);
        fresh.set_dirty(false);
        self.issue_add(fresh.into(), actions);
    }

    fn issue_add(&mut self, entity: AnyEntity, actions: &mut Vec<Action>) {
        match entity {
            AnyEntity::Note(note) => {
                self.start_content_fetch(note, NoteTarget::Add, actions);
            }
            other => {
                let kind = other.kind();
                let token = self.ledger_mut(kind).add.issue();
                self.ops.insert(token, Op::Add { kind });
                actions.push(Action::Storage(StorageRequest::Add {
                    token,
                    entity: other,
                }));
            }
        }
    }

    fn issue_update(
        &mut self,
        entity: AnyEntity,
        then_add: Option<AnyEntity>,
        actions: &mut Vec<Action>,
    ) {
        match entity {
            AnyEntity::Note(note) if note.guid.is_some() => {
                // Remote-sourced note: full body and resources first.
                self.start_content_fetch(note, NoteTarget::Update, actions);
            }
            AnyEntity::Note(note) => {
                // Renamed conflicted local note: its content is already
                // local, only the owning notebook is needed.
                self.ensure_notebook(
                    NoteWrite {
                        note,
                        target: NoteTarget::Update,
                        then_add,
                    },
                    actions,
                );
            }
            other => {
                let kind = other.kind();
                let token = self.ledger_mut(kind).update.issue();
                self.ops.insert(token, Op::Update { kind, then_add });
                actions.push(Action::Storage(StorageRequest::Update {
                    token,
                    entity: other,
                }));
            }
        }
    }

    fn start_content_fetch(&mut self, note: Note, target: NoteTarget, actions: &mut Vec<Action>) {
        let Some(guid) = note.guid() else {
            self.fail("cannot fetch content for a note without a guid".into(), actions);
            return;
        };
        let token = self.note_content.issue();
        self.content_ops.insert(token, (note, target));
        actions.push(Action::FetchNoteContent {
            token,
            guid,
            options: NoteFetchOptions::default(),
        });
    }

    fn ensure_notebook(&mut self, write: NoteWrite, actions: &mut Vec<Action>) {
        let Some(notebook_guid) = write.note.notebook_guid else {
            self.fail(
                format!("note '{}' has no notebook guid", write.note.title),
                actions,
            );
            return;
        };
        if let Some(notebook) = self.notebook_cache.get(&notebook_guid).cloned() {
            self.emit_note_write(write, notebook, actions);
            return;
        }
        let need_lookup = !self.waiting_notes.contains_key(&notebook_guid);
        self.waiting_notes
            .entry(notebook_guid)
            .or_default()
            .push(write);
        if need_lookup {
            let token = self.notebook_lookup.issue();
            self.ops.insert(token, Op::FindNotebookForNote { notebook_guid });
            actions.push(Action::Storage(StorageRequest::FindByGuid {
                token,
                kind: EntityKind::Notebook,
                guid: notebook_guid,
            }));
        }
    }

    fn emit_note_write(&mut self, write: NoteWrite, notebook: Notebook, actions: &mut Vec<Action>) {
        let NoteWrite {
            note,
            target,
            then_add,
        } = write;
        match target {
            NoteTarget::Add => {
                let token = self.ledger_mut(EntityKind::Note).add.issue();
                self.ops.insert(token, Op::Add { kind: EntityKind::Note });
                actions.push(Action::Storage(StorageRequest::AddNote {
                    token,
                    note,
                    notebook,
                }));
            }
            NoteTarget::Update => {
                let token = self.ledger_mut(EntityKind::Note).update.issue();
                self.ops.insert(
                    token,
                    Op::Update {
                        kind: EntityKind::Note,
                        then_add,
                    },
                );
                actions.push(Action::Storage(StorageRequest::UpdateNote {
                    token,
                    note,
                    notebook,
                }));
            }
        }
    }

    // ── Bookkeeping ──────────────────────────────────────────────

    fn ledger_mut(&mut self, kind: EntityKind) -> &mut KindLedger {
        &mut self.ledgers[kind.index()]
    }

    fn kind_settled(&self, kind: EntityKind) -> bool {
        let list_empty = match kind {
            EntityKind::Tag => self.tags.is_empty(),
            EntityKind::SavedSearch => self.searches.is_empty(),
            EntityKind::Notebook => self.notebooks.is_empty(),
            EntityKind::Note => self.notes.is_empty(),
            EntityKind::LinkedNotebook => self.linked_notebooks.is_empty(),
        };
        list_empty && self.ledgers[kind.index()].settled()
    }

    fn notes_settled(&self) -> bool {
        self.kind_settled(EntityKind::Note)
            && self.note_content.is_empty()
            && self.notebook_lookup.is_empty()
            && self.waiting_notes.is_empty()
            && self.deferred_fetches.is_empty()
    }

    fn all_settled_overall(&self) -> bool {
        EntityKind::ALL.iter().all(|kind| self.kind_settled(*kind)) && self.notes_settled()
    }

    fn nothing_pending(&self) -> bool {
        self.ops.is_empty()
            && self.note_content.is_empty()
            && self.notebook_lookup.is_empty()
    }

    fn honor_stop(&mut self, actions: &mut Vec<Action>) {
        self.phase = Phase::Stopped;
        self.clear();
        actions.push(Action::CancelTimers);
        actions.push(Action::Emit(Signal::Stopped));
        info!("download merge pass stopped");
    }

    fn fail(&mut self, message: String, actions: &mut Vec<Action>) {
        if self.phase == Phase::Failed {
            return;
        }
        warn!(message, "download merge pass failed");
        self.phase = Phase::Failed;
        self.clear();
        actions.push(Action::Emit(Signal::Failure(message)));
    }

    /// Resets every transient container; nothing persists across passes
    /// except the resume-point USNs handed to the caller.
    fn clear(&mut self) {
        self.chunks.clear();
        self.tags.clear();
        self.searches.clear();
        self.notebooks.clear();
        self.notes.clear();
        self.linked_notebooks.clear();
        for ledger in &mut self.ledgers {
            ledger.clear();
        }
        self.ops.clear();
        self.note_content.clear();
        self.content_ops.clear();
        self.deferred_fetches.clear();
        self.notebook_cache.clear();
        self.notebook_lookup.clear();
        self.waiting_notes.clear();
    }
}

/// Access to the per-kind working list, dispatched through the closed
/// entity-kind set.
trait Slot: SyncedEntity + Into<AnyEntity> {
    fn working(mgr: &mut FullSyncManager) -> &mut Vec<Self>;
    fn from_any(entity: AnyEntity) -> Option<Self>;
}

impl Slot for Tag {
    fn working(mgr: &mut FullSyncManager) -> &mut Vec<Self> {
        &mut mgr.tags
    }
    fn from_any(entity: AnyEntity) -> Option<Self> {
        match entity {
            AnyEntity::Tag(e) => Some(e),
            _ => None,
        }
    }
}

impl Slot for SavedSearch {
    fn working(mgr: &mut FullSyncManager) -> &mut Vec<Self> {
        &mut mgr.searches
    }
    fn from_any(entity: AnyEntity) -> Option<Self> {
        match entity {
            AnyEntity::SavedSearch(e) => Some(e),
            _ => None,
        }
    }
}

impl Slot for Notebook {
    fn working(mgr: &mut FullSyncManager) -> &mut Vec<Self> {
        &mut mgr.notebooks
    }
    fn from_any(entity: AnyEntity) -> Option<Self> {
        match entity {
            AnyEntity::Notebook(e) => Some(e),
            _ => None,
        }
    }
}

impl Slot for Note {
    fn working(mgr: &mut FullSyncManager) -> &mut Vec<Self> {
        &mut mgr.notes
    }
    fn from_any(entity: AnyEntity) -> Option<Self> {
        match entity {
            AnyEntity::Note(e) => Some(e),
            _ => None,
        }
    }
}

impl Slot for LinkedNotebook {
    fn working(mgr: &mut FullSyncManager) -> &mut Vec<Self> {
        &mut mgr.linked_notebooks
    }
    fn from_any(entity: AnyEntity) -> Option<Self> {
        match entity {
            AnyEntity::LinkedNotebook(e) => Some(e),
            _ => None,
        }
    }
}
