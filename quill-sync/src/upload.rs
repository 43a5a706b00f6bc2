//! Upload manager for locally modified entities.
//!
//! Lists every dirty entity from local storage — the user's own account
//! plus each linked-notebook partition — and pushes them to the note
//! service in dependency order: tags, saved searches, notebooks, then
//! notes. One push is in flight at a time. Entities without a service
//! guid are created, the rest are updated; after every successful push
//! the cleaned-up record (new USN, dirty flag dropped) is written back
//! to local storage, and the pass does not finish until those write-backs
//! settle.
//!
//! Update counts advance only when the returned USN is exactly one ahead
//! of the tracked count; a skip means another client wrote concurrently
//! and the caller is told to run a fresh incremental download afterwards.

use crate::action::Action;
use crate::ledger::{PendingSet, RequestToken};
use crate::protocol::{AuthToken, RemoteError, RemoteErrorCode};
use crate::signal::Signal;
use crate::storage::{AnyEntity, StorageReply, StorageRequest};
use crate::timer::CallSite;
use chrono::Utc;
use quill_types::{
    EntityKind, Guid, LinkedNotebook, ListFilter, ListOrder, Note, Notebook, OrderDirection,
    SavedSearch, SyncedEntity, Tag, Usn,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tracing::{debug, info, warn};

/// The kinds that get pushed, in dependency order.
const PUSH_ORDER: [EntityKind; 4] = [
    EntityKind::Tag,
    EntityKind::SavedSearch,
    EntityKind::Notebook,
    EntityKind::Note,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Listing,
    Pushing,
    Paused,
    Finished,
    Failed,
    Stopped,
}

/// What an outstanding list request was for.
#[derive(Debug, Clone, Copy)]
enum ListOp {
    LinkedNotebooks,
    Own(EntityKind),
    Linked { kind: EntityKind },
}

/// What an outstanding post-push storage request was for.
#[derive(Debug, Clone)]
enum CleanupOp {
    /// Plain metadata write-back.
    Write,
    /// Notebook lookup needed before a note write-back can be issued.
    FindNotebookFor(Box<Note>),
}

#[derive(Debug, Clone)]
struct InFlight {
    token: RequestToken,
    kind: EntityKind,
    create: bool,
    linked: Option<Guid>,
}

/// The result of one push call against the note service.
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    /// A create call succeeded; the service-assigned record comes back
    /// with its new guid and USN.
    Created(AnyEntity),
    /// An update call succeeded with this new USN.
    Updated(Usn),
}

/// The send-local-changes orchestrator.
pub struct SendLocalChangesManager {
    phase: Phase,
    stop_requested: bool,
    pending_authentication: bool,
    listing_complete: bool,

    update_count: Usn,
    linked_update_counts: HashMap<Guid, Usn>,
    should_repeat: bool,

    list_pending: PendingSet,
    list_ops: HashMap<RequestToken, ListOp>,
    linked_notebooks: Vec<LinkedNotebook>,

    tags: VecDeque<Tag>,
    searches: VecDeque<SavedSearch>,
    notebooks: VecDeque<Notebook>,
    notes: VecDeque<Note>,

    auth_tokens: HashMap<Guid, AuthToken>,
    push_pending: PendingSet,
    in_flight: Option<InFlight>,
    waiting_on_timer: bool,

    cleanup: PendingSet,
    cleanup_ops: HashMap<RequestToken, CleanupOp>,
}

impl Default for SendLocalChangesManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SendLocalChangesManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            stop_requested: false,
            pending_authentication: false,
            listing_complete: false,
            update_count: Usn::default(),
            linked_update_counts: HashMap::new(),
            should_repeat: false,
            list_pending: PendingSet::new(),
            list_ops: HashMap::new(),
            linked_notebooks: Vec::new(),
            tags: VecDeque::new(),
            searches: VecDeque::new(),
            notebooks: VecDeque::new(),
            notes: VecDeque::new(),
            auth_tokens: HashMap::new(),
            push_pending: PendingSet::new(),
            in_flight: None,
            waiting_on_timer: false,
            cleanup: PendingSet::new(),
            cleanup_ops: HashMap::new(),
        }
    }

    /// Whether the pass has reached a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, Phase::Finished | Phase::Failed | Phase::Stopped)
    }

    /// Whether the pass is paused waiting for credentials or a resume.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.phase == Phase::Paused
    }

    /// Begins a pass. The update counts are the resume point produced by
    /// the preceding download-merge pass.
    pub fn start(
        &mut self,
        update_count: Usn,
        linked_update_counts: HashMap<Guid, Usn>,
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        self.clear();
        self.phase = Phase::Listing;
        self.stop_requested = false;
        self.pending_authentication = false;
        self.should_repeat = false;
        self.update_count = update_count;
        self.linked_update_counts = linked_update_counts;
        info!(update_count = %update_count, "starting upload pass");
        self.begin_listing(&mut actions);
        actions
    }

    /// Stores fresh linked-notebook credentials handed over after a
    /// [`Signal::RequestAuthTokensForLinkedNotebooks`].
    pub fn set_linked_auth_tokens(&mut self, tokens: HashMap<Guid, AuthToken>) -> Vec<Action> {
        self.auth_tokens.extend(tokens);
        if self.phase == Phase::Paused && self.pending_authentication {
            self.resume()
        } else {
            Vec::new()
        }
    }

    /// Freezes the pass. In-flight remote calls are not cancelled; their
    /// results are absorbed without launching further pushes.
    pub fn pause(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if !matches!(self.phase, Phase::Listing | Phase::Pushing) {
            return actions;
        }
        self.enter_pause(false, &mut actions);
        actions
    }

    /// Resumes a paused pass, restarting the listing if it never finished.
    pub fn resume(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.phase != Phase::Paused {
            return actions;
        }
        if self.pending_authentication && !self.request_missing_auth(&mut actions) {
            // Still missing tokens; the request signal was re-emitted.
            return actions;
        }
        self.pending_authentication = false;
        self.waiting_on_timer = false;
        if self.listing_complete {
            debug!("resuming upload pass at the push queue");
            self.phase = Phase::Pushing;
            self.maybe_push(&mut actions);
        } else {
            debug!("resuming upload pass by relisting");
            self.phase = Phase::Listing;
            self.drop_queues();
            self.begin_listing(&mut actions);
        }
        actions
    }

    /// Requests cancellation; honored once every pending request settles.
    pub fn stop(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.is_terminal() {
            return actions;
        }
        self.stop_requested = true;
        if self.nothing_pending() {
            self.honor_stop(&mut actions);
        }
        actions
    }

    /// Routes a local-storage reply back to its in-flight operation.
    /// Replies whose token no pending set owns are ignored entirely.
    pub fn handle_storage_reply(&mut self, reply: StorageReply) -> Vec<Action> {
        let mut actions = Vec::new();
        let token = reply.token();
        if let Some(op) = self.list_ops.remove(&token) {
            self.list_pending.take(token);
            self.on_list_reply(op, reply, &mut actions);
        } else if let Some(op) = self.cleanup_ops.remove(&token) {
            self.cleanup.take(token);
            self.on_cleanup_reply(op, reply, &mut actions);
        }
        actions
    }

    /// Feeds the result of a push call issued via [`Action::PushCreate`]
    /// or [`Action::PushUpdate`].
    pub fn handle_push_result(
        &mut self,
        token: RequestToken,
        result: Result<PushOutcome, RemoteError>,
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        if !self.push_pending.take(token) {
            return actions;
        }
        let Some(in_flight) = self.in_flight.take() else {
            return actions;
        };
        if in_flight.token != token {
            // A stale result for a push superseded by pause/resume.
            return actions;
        }

        match result {
            Ok(outcome) => {
                self.on_push_success(&in_flight, outcome, &mut actions);
                if self.stop_requested {
                    if self.nothing_pending() {
                        self.honor_stop(&mut actions);
                    }
                    return actions;
                }
                self.maybe_push(&mut actions);
            }
            Err(error) => {
                // A stop filed while this push was in flight takes
                // precedence over retry or pause handling.
                if self.stop_requested {
                    if self.nothing_pending() {
                        self.honor_stop(&mut actions);
                    }
                    return actions;
                }
                self.on_push_error(&in_flight, error, &mut actions);
            }
        }
        actions
    }

    /// A rate-limit retry timer fired; re-issues the push verbatim.
    pub fn handle_timer_fired(&mut self, site: CallSite) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.phase != Phase::Pushing || !self.waiting_on_timer {
            return actions;
        }
        let expected = match site {
            CallSite::PushTags => EntityKind::Tag,
            CallSite::PushSearches => EntityKind::SavedSearch,
            CallSite::PushNotebooks => EntityKind::Notebook,
            CallSite::PushNotes => EntityKind::Note,
            CallSite::GetFullNoteData(_) => return actions,
        };
        if self.next_kind() == Some(expected) {
            self.waiting_on_timer = false;
            self.maybe_push(&mut actions);
        }
        actions
    }

    // ── Listing ──────────────────────────────────────────────────

    fn begin_listing(&mut self, actions: &mut Vec<Action>) {
        self.listing_complete = false;
        for kind in PUSH_ORDER {
            self.issue_list(ListOp::Own(kind), kind, None, actions);
        }
        let token = self.list_pending.issue();
        self.list_ops.insert(token, ListOp::LinkedNotebooks);
        actions.push(Action::Storage(StorageRequest::ListLinkedNotebooks { token }));
    }

    fn issue_list(
        &mut self,
        op: ListOp,
        kind: EntityKind,
        linked_notebook: Option<Guid>,
        actions: &mut Vec<Action>,
    ) {
        let token = self.list_pending.issue();
        self.list_ops.insert(token, op);
        // Never-synchronized entities go up even when their dirty flag
        // was never set.
        actions.push(Action::Storage(StorageRequest::List {
            token,
            kind,
            filter: ListFilter::DIRTY | ListFilter::NON_LOCAL,
            limit: u32::MAX,
            offset: 0,
            order: ListOrder::NoOrder,
            direction: OrderDirection::Ascending,
            linked_notebook,
        }));
    }

    fn on_list_reply(&mut self, op: ListOp, reply: StorageReply, actions: &mut Vec<Action>) {
        if self.phase != Phase::Listing {
            return;
        }
        match (op, reply) {
            (ListOp::LinkedNotebooks, StorageReply::ListLinkedNotebooksCompleted { linked_notebooks, .. }) => {
                for linked in &linked_notebooks {
                    let Some(guid) = linked.guid() else {
                        continue;
                    };
                    for kind in PUSH_ORDER {
                        self.issue_list(ListOp::Linked { kind }, kind, Some(guid), actions);
                    }
                }
                self.linked_notebooks = linked_notebooks;
            }
            (ListOp::Own(_) | ListOp::Linked { .. }, StorageReply::ListCompleted { entities, .. }) => {
                for entity in entities {
                    self.enqueue(entity);
                }
            }
            (_, StorageReply::ListFailed { message, .. }) => {
                self.fail(format!("listing local changes failed: {message}"), actions);
                return;
            }
            (op, reply) => {
                self.fail(
                    format!("mismatched local-storage reply {reply:?} for listing {op:?}"),
                    actions,
                );
                return;
            }
        }

        if self.stop_requested {
            if self.nothing_pending() {
                self.honor_stop(actions);
            }
            return;
        }
        if self.list_pending.is_empty() {
            self.listing_complete = true;
            info!(
                tags = self.tags.len(),
                searches = self.searches.len(),
                notebooks = self.notebooks.len(),
                notes = self.notes.len(),
                "local changes listed, pushing"
            );
            if self.request_missing_auth(actions) {
                self.phase = Phase::Pushing;
                self.maybe_push(actions);
            }
        }
    }

    fn enqueue(&mut self, entity: AnyEntity) {
        match entity {
            AnyEntity::Tag(e) => self.tags.push_back(e),
            AnyEntity::SavedSearch(e) => self.searches.push_back(e),
            AnyEntity::Notebook(e) => self.notebooks.push_back(e),
            AnyEntity::Note(e) => self.notes.push_back(e),
            // Linked notebooks are owned by other accounts and never
            // pushed from here.
            AnyEntity::LinkedNotebook(_) => {}
        }
    }

    fn drop_queues(&mut self) {
        self.tags.clear();
        self.searches.clear();
        self.notebooks.clear();
        self.notes.clear();
        self.linked_notebooks.clear();
        self.list_ops.clear();
        self.list_pending.clear();
    }

    // ── Pushing ──────────────────────────────────────────────────

    /// Checks every linked partition in the queues has a fresh token.
    /// Returns false after emitting the credential request and pausing.
    fn request_missing_auth(&mut self, actions: &mut Vec<Action>) -> bool {
        let now = Utc::now();
        let mut needed: HashSet<Guid> = HashSet::new();
        let referenced = self
            .tags
            .iter()
            .filter_map(SyncedEntity::linked_notebook_guid)
            .chain(self.searches.iter().filter_map(SyncedEntity::linked_notebook_guid))
            .chain(self.notebooks.iter().filter_map(SyncedEntity::linked_notebook_guid))
            .chain(self.notes.iter().filter_map(SyncedEntity::linked_notebook_guid));
        for guid in referenced {
            match self.auth_tokens.get(&guid) {
                Some(token) if !token.is_stale(now) => {}
                _ => {
                    needed.insert(guid);
                }
            }
        }
        if needed.is_empty() {
            return true;
        }

        let mut request: Vec<(Guid, Option<String>)> = needed
            .into_iter()
            .map(|guid| {
                let share_key = self
                    .linked_notebooks
                    .iter()
                    .find(|l| l.guid() == Some(guid))
                    .and_then(|l| l.share_key.clone());
                (guid, share_key)
            })
            .collect();
        request.sort_by_key(|(guid, _)| guid.as_uuid());
        warn!(count = request.len(), "missing or stale linked-notebook credentials");
        actions.push(Action::Emit(Signal::RequestAuthTokensForLinkedNotebooks(request)));
        self.enter_pause(true, actions);
        false
    }

    fn next_kind(&self) -> Option<EntityKind> {
        if !self.tags.is_empty() {
            Some(EntityKind::Tag)
        } else if !self.searches.is_empty() {
            Some(EntityKind::SavedSearch)
        } else if !self.notebooks.is_empty() {
            Some(EntityKind::Notebook)
        } else if !self.notes.is_empty() {
            Some(EntityKind::Note)
        } else {
            None
        }
    }

    fn front(&self, kind: EntityKind) -> Option<AnyEntity> {
        match kind {
            EntityKind::Tag => self.tags.front().cloned().map(AnyEntity::Tag),
            EntityKind::SavedSearch => self.searches.front().cloned().map(AnyEntity::SavedSearch),
            EntityKind::Notebook => self.notebooks.front().cloned().map(AnyEntity::Notebook),
            EntityKind::Note => self.notes.front().cloned().map(AnyEntity::Note),
            EntityKind::LinkedNotebook => None,
        }
    }

    fn pop_front(&mut self, kind: EntityKind) -> Option<AnyEntity> {
        match kind {
            EntityKind::Tag => self.tags.pop_front().map(AnyEntity::Tag),
            EntityKind::SavedSearch => self.searches.pop_front().map(AnyEntity::SavedSearch),
            EntityKind::Notebook => self.notebooks.pop_front().map(AnyEntity::Notebook),
            EntityKind::Note => self.notes.pop_front().map(AnyEntity::Note),
            EntityKind::LinkedNotebook => None,
        }
    }

    fn maybe_push(&mut self, actions: &mut Vec<Action>) {
        if self.phase != Phase::Pushing || self.in_flight.is_some() || self.waiting_on_timer {
            return;
        }
        let Some(kind) = self.next_kind() else {
            self.try_finish(actions);
            return;
        };
        let Some(entity) = self.front(kind) else {
            return;
        };

        if let AnyEntity::Note(note) = &entity {
            if note.notebook_guid.is_none() {
                self.fail(
                    format!("note '{}' has no notebook and cannot be pushed", note.title),
                    actions,
                );
                return;
            }
        }

        let linked = entity.linked_notebook_guid();
        let linked_auth = match linked {
            Some(guid) => match self.auth_tokens.get(&guid) {
                Some(token) => Some(token.clone()),
                None => {
                    // Tokens were checked before pushing began; this can
                    // only mean they were invalidated mid-pass.
                    if !self.request_missing_auth(actions) {
                        return;
                    }
                    self.auth_tokens.get(&guid).cloned()
                }
            },
            None => None,
        };

        let create = entity.guid().is_none();
        let token = self.push_pending.issue();
        self.in_flight = Some(InFlight {
            token,
            kind,
            create,
            linked,
        });
        debug!(kind = %kind, create, "pushing local change");
        actions.push(if create {
            Action::PushCreate {
                token,
                entity,
                linked_auth,
            }
        } else {
            Action::PushUpdate {
                token,
                entity,
                linked_auth,
            }
        });
    }

    fn on_push_success(
        &mut self,
        in_flight: &InFlight,
        outcome: PushOutcome,
        actions: &mut Vec<Action>,
    ) {
        let Some(pushed) = self.pop_front(in_flight.kind) else {
            self.fail(
                format!("push queue for {} drained out from under an in-flight push", in_flight.kind),
                actions,
            );
            return;
        };

        let settled = match outcome {
            PushOutcome::Created(created) => {
                if created.kind() != in_flight.kind {
                    self.fail(
                        format!(
                            "service returned a {} for a {} create",
                            created.kind(),
                            in_flight.kind
                        ),
                        actions,
                    );
                    return;
                }
                let (Some(guid), Some(usn)) = (created.guid(), created.usn()) else {
                    self.fail(
                        format!(
                            "service returned a created {} without a guid and usn",
                            in_flight.kind
                        ),
                        actions,
                    );
                    return;
                };
                // The returned record need not round-trip local fields
                // like the storage identifier; graft the service-assigned
                // identity onto the element we pushed instead.
                with_created_identity(pushed, guid, usn)
            }
            PushOutcome::Updated(usn) => with_push_metadata(pushed, usn),
        };

        let Some(usn) = settled.usn() else {
            self.fail(
                format!("service returned a {} without a usn", in_flight.kind),
                actions,
            );
            return;
        };
        self.advance_count(usn, in_flight.linked, actions);
        self.write_back(settled, actions);
    }

    /// Advances the relevant update count if the new USN is contiguous;
    /// a skip leaves the count untouched and flags the pass for a repeat
    /// incremental download.
    fn advance_count(&mut self, usn: Usn, linked: Option<Guid>, actions: &mut Vec<Action>) {
        let count = match linked {
            None => &mut self.update_count,
            Some(guid) => self.linked_update_counts.entry(guid).or_default(),
        };
        if usn == count.next() {
            *count = usn;
        } else {
            debug!(
                returned = %usn,
                tracked = %count,
                "pushed usn skipped ahead, another client is writing"
            );
            self.should_repeat = true;
            actions.push(Action::Emit(Signal::ShouldRepeatIncrementalSync));
        }
    }

    /// Persists the post-push record (service guid, new USN, dirty flag
    /// dropped) back to local storage.
    fn write_back(&mut self, entity: AnyEntity, actions: &mut Vec<Action>) {
        match entity {
            AnyEntity::Note(note) => {
                let Some(notebook_guid) = note.notebook_guid else {
                    self.fail(format!("pushed note '{}' lost its notebook", note.title), actions);
                    return;
                };
                let token = self.cleanup.issue();
                self.cleanup_ops
                    .insert(token, CleanupOp::FindNotebookFor(Box::new(note)));
                actions.push(Action::Storage(StorageRequest::FindByGuid {
                    token,
                    kind: EntityKind::Notebook,
                    guid: notebook_guid,
                }));
            }
            other => {
                let token = self.cleanup.issue();
                self.cleanup_ops.insert(token, CleanupOp::Write);
                actions.push(Action::Storage(StorageRequest::Update {
                    token,
                    entity: other,
                }));
            }
        }
    }

    fn on_push_error(&mut self, in_flight: &InFlight, error: RemoteError, actions: &mut Vec<Action>) {
        match error.code {
            RemoteErrorCode::RateLimitReached { duration_s } => {
                let site = match in_flight.kind {
                    EntityKind::Tag => CallSite::PushTags,
                    EntityKind::SavedSearch => CallSite::PushSearches,
                    EntityKind::Notebook => CallSite::PushNotebooks,
                    EntityKind::Note | EntityKind::LinkedNotebook => CallSite::PushNotes,
                };
                warn!(kind = %in_flight.kind, duration_s, "push rate-limited");
                self.waiting_on_timer = true;
                actions.push(Action::StartTimer {
                    site,
                    after: Duration::from_secs(u64::from(duration_s)),
                });
                actions.push(Action::Emit(Signal::RateLimitExceeded(duration_s)));
            }
            RemoteErrorCode::AuthExpired => match in_flight.linked {
                None => {
                    warn!("primary account token expired mid-push");
                    actions.push(Action::Emit(Signal::RequestAuthToken));
                    self.enter_pause(true, actions);
                }
                Some(guid) => {
                    let now = Utc::now();
                    let cached_still_fresh = self
                        .auth_tokens
                        .get(&guid)
                        .is_some_and(|t| !t.is_stale(now));
                    if cached_still_fresh {
                        // The service rejected a token we believe is
                        // fresh; refreshing would loop forever.
                        self.fail(
                            format!(
                                "linked notebook {guid} rejected a token that has not reached \
                                 its expiry"
                            ),
                            actions,
                        );
                        return;
                    }
                    self.auth_tokens.remove(&guid);
                    if self.request_missing_auth(actions) {
                        // The dropped token should have shown up as
                        // missing; pause either way.
                        self.enter_pause(true, actions);
                    }
                }
            },
            RemoteErrorCode::DataConflict if !in_flight.create => {
                info!(kind = %in_flight.kind, "server holds newer data, pausing for a merge");
                actions.push(Action::Emit(Signal::ConflictDetected));
                self.enter_pause(false, actions);
            }
            _ => {
                self.fail(
                    format!("pushing a {} failed: {error}", in_flight.kind),
                    actions,
                );
            }
        }
    }

    // ── Cleanup write-backs ──────────────────────────────────────

    fn on_cleanup_reply(&mut self, op: CleanupOp, reply: StorageReply, actions: &mut Vec<Action>) {
        match (op, reply) {
            (CleanupOp::Write, StorageReply::UpdateCompleted { .. }) => {}
            (CleanupOp::Write, StorageReply::UpdateFailed { message, .. }) => {
                self.fail(format!("post-push write-back failed: {message}"), actions);
                return;
            }
            (CleanupOp::FindNotebookFor(note), StorageReply::FoundByGuid { entity, .. }) => {
                let AnyEntity::Notebook(notebook) = entity else {
                    self.fail(
                        "local storage returned a non-notebook for a note write-back".into(),
                        actions,
                    );
                    return;
                };
                let token = self.cleanup.issue();
                self.cleanup_ops.insert(token, CleanupOp::Write);
                actions.push(Action::Storage(StorageRequest::UpdateNote {
                    token,
                    note: *note,
                    notebook,
                }));
            }
            (CleanupOp::FindNotebookFor(note), StorageReply::NotFoundByGuid { .. }) => {
                self.fail(
                    format!("notebook for pushed note '{}' is absent from local storage", note.title),
                    actions,
                );
                return;
            }
            (
                CleanupOp::FindNotebookFor(_),
                StorageReply::FindFailed { message, .. },
            ) => {
                self.fail(format!("post-push notebook lookup failed: {message}"), actions);
                return;
            }
            (op, reply) => {
                self.fail(
                    format!("mismatched local-storage reply {reply:?} for write-back {op:?}"),
                    actions,
                );
                return;
            }
        }

        if self.stop_requested {
            if self.nothing_pending() {
                self.honor_stop(actions);
            }
            return;
        }
        self.try_finish(actions);
    }

    // ── Bookkeeping ──────────────────────────────────────────────

    fn try_finish(&mut self, actions: &mut Vec<Action>) {
        if self.phase != Phase::Pushing
            || self.next_kind().is_some()
            || self.in_flight.is_some()
            || !self.cleanup.is_empty()
        {
            return;
        }
        self.phase = Phase::Finished;
        info!(
            last_update_count = %self.update_count,
            should_repeat = self.should_repeat,
            "upload pass finished"
        );
        actions.push(Action::Emit(Signal::Finished {
            last_update_count: self.update_count,
            per_linked_notebook_update_counts: self.linked_update_counts.clone(),
            should_repeat_incremental_sync: self.should_repeat,
        }));
    }

    fn nothing_pending(&self) -> bool {
        self.list_pending.is_empty() && self.in_flight.is_none() && self.cleanup.is_empty()
    }

    fn enter_pause(&mut self, pending_authentication: bool, actions: &mut Vec<Action>) {
        self.phase = Phase::Paused;
        self.pending_authentication = pending_authentication;
        self.waiting_on_timer = false;
        actions.push(Action::CancelTimers);
        actions.push(Action::Emit(Signal::Paused {
            pending_authentication,
        }));
    }

    fn honor_stop(&mut self, actions: &mut Vec<Action>) {
        self.phase = Phase::Stopped;
        self.clear();
        actions.push(Action::CancelTimers);
        actions.push(Action::Emit(Signal::Stopped));
        info!("upload pass stopped");
    }

    fn fail(&mut self, message: String, actions: &mut Vec<Action>) {
        if self.phase == Phase::Failed {
            return;
        }
        warn!(message, "upload pass failed");
        self.phase = Phase::Failed;
        self.clear();
        actions.push(Action::Emit(Signal::Failure(message)));
    }

    fn clear(&mut self) {
        self.listing_complete = false;
        self.waiting_on_timer = false;
        self.drop_queues();
        self.push_pending.clear();
        self.in_flight = None;
        self.cleanup.clear();
        self.cleanup_ops.clear();
    }
}

/// Applies the service-assigned guid and USN from a create call to the
/// local entity and drops its dirty flag, ready for the write-back.
fn with_created_identity(entity: AnyEntity, guid: Guid, usn: Usn) -> AnyEntity {
    fn apply<E: SyncedEntity>(mut entity: E, guid: Guid, usn: Usn) -> E {
        entity.set_guid(Some(guid));
        entity.set_usn(Some(usn));
        entity.set_dirty(false);
        entity
    }
    match entity {
        AnyEntity::Tag(e) => AnyEntity::Tag(apply(e, guid, usn)),
        AnyEntity::SavedSearch(e) => AnyEntity::SavedSearch(apply(e, guid, usn)),
        AnyEntity::Notebook(e) => AnyEntity::Notebook(apply(e, guid, usn)),
        AnyEntity::Note(e) => AnyEntity::Note(apply(e, guid, usn)),
        AnyEntity::LinkedNotebook(e) => AnyEntity::LinkedNotebook(apply(e, guid, usn)),
    }
}

/// Applies the service-assigned USN to an updated entity and drops its
/// dirty flag, ready for the write-back.
fn with_push_metadata(entity: AnyEntity, usn: Usn) -> AnyEntity {
    fn apply<E: SyncedEntity>(mut entity: E, usn: Usn) -> E {
        entity.set_usn(Some(usn));
        entity.set_dirty(false);
        entity
    }
    match entity {
        AnyEntity::Tag(e) => AnyEntity::Tag(apply(e, usn)),
        AnyEntity::SavedSearch(e) => AnyEntity::SavedSearch(apply(e, usn)),
        AnyEntity::Notebook(e) => AnyEntity::Notebook(apply(e, usn)),
        AnyEntity::Note(e) => AnyEntity::Note(apply(e, usn)),
        AnyEntity::LinkedNotebook(e) => AnyEntity::LinkedNotebook(apply(e, usn)),
    }
}
