//! Tests for the send-local-changes manager, driven end-to-end against
//! the in-memory local store with a simulated note service.

use chrono::{Duration as ChronoDuration, Utc};
use pretty_assertions::assert_eq;
use quill_sync::storage::mock::InMemoryStore;
use quill_sync::upload::PushOutcome;
use quill_sync::{
    Action, AnyEntity, AuthToken, CallSite, RemoteError, RequestToken, SendLocalChangesManager,
    Signal,
};
use quill_types::{
    Guid, LinkedNotebook, LocalId, Note, Notebook, SavedSearch, SyncedEntity, Tag, Usn,
};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

// ── harness ─────────────────────────────────────────────────────

/// Synchronous driver: answers storage requests from the in-memory store
/// and serves pushes from a simulated note service that assigns USNs
/// sequentially. Failures are scripted per entity display name.
struct Harness {
    mgr: SendLocalChangesManager,
    store: InMemoryStore,
    next_usn: i32,
    failures: HashMap<String, VecDeque<RemoteError>>,
    /// Every push attempt: (was create, entity, linked auth secret).
    pushes: Vec<(bool, AnyEntity, Option<String>)>,
    signals: Vec<Signal>,
    timers: Vec<(CallSite, Duration)>,
}

impl Harness {
    fn new() -> Self {
        Self {
            mgr: SendLocalChangesManager::new(),
            store: InMemoryStore::new(),
            next_usn: 0,
            failures: HashMap::new(),
            pushes: Vec::new(),
            signals: Vec::new(),
            timers: Vec::new(),
        }
    }

    fn fail_next_for(&mut self, name: &str, error: RemoteError) {
        self.failures
            .entry(name.to_string())
            .or_default()
            .push_back(error);
    }

    fn start(&mut self, update_count: i32) {
        let actions = self.mgr.start(Usn::new(update_count), HashMap::new());
        self.run(actions);
    }

    fn run(&mut self, initial: Vec<Action>) {
        let mut pending: VecDeque<Action> = initial.into();
        while let Some(action) = pending.pop_front() {
            match action {
                Action::Storage(request) => {
                    let reply = self.store.handle(request);
                    pending.extend(self.mgr.handle_storage_reply(reply));
                }
                Action::PushCreate {
                    token,
                    entity,
                    linked_auth,
                } => {
                    let result = self.serve_push(true, entity, linked_auth.as_ref());
                    pending.extend(self.mgr.handle_push_result(token, result));
                }
                Action::PushUpdate {
                    token,
                    entity,
                    linked_auth,
                } => {
                    let result = self.serve_push(false, entity, linked_auth.as_ref());
                    pending.extend(self.mgr.handle_push_result(token, result));
                }
                Action::StartTimer { site, after } => self.timers.push((site, after)),
                Action::CancelTimers => {}
                Action::Emit(signal) => self.signals.push(signal),
                other => panic!("upload pass produced {other:?}"),
            }
        }
    }

    fn serve_push(
        &mut self,
        create: bool,
        entity: AnyEntity,
        auth: Option<&AuthToken>,
    ) -> Result<PushOutcome, RemoteError> {
        let name = entity.display_name().to_string();
        self.pushes
            .push((create, entity.clone(), auth.map(|a| a.secret.clone())));
        if let Some(queue) = self.failures.get_mut(&name) {
            if let Some(error) = queue.pop_front() {
                return Err(error);
            }
        }
        self.next_usn += 1;
        if create {
            Ok(PushOutcome::Created(assign_identity(
                entity,
                Usn::new(self.next_usn),
            )))
        } else {
            Ok(PushOutcome::Updated(Usn::new(self.next_usn)))
        }
    }

    fn fire_timer(&mut self, site: CallSite) {
        let actions = self.mgr.handle_timer_fired(site);
        self.run(actions);
    }

    fn resume(&mut self) {
        let actions = self.mgr.resume();
        self.run(actions);
    }

    fn attempts_for(&self, name: &str) -> usize {
        self.pushes
            .iter()
            .filter(|(_, entity, _)| entity.display_name() == name)
            .count()
    }

    fn finished(&self) -> Option<(Usn, bool)> {
        self.signals.iter().find_map(|signal| match signal {
            Signal::Finished {
                last_update_count,
                should_repeat_incremental_sync,
                ..
            } => Some((*last_update_count, *should_repeat_incremental_sync)),
            _ => None,
        })
    }

    fn failure(&self) -> Option<&str> {
        self.signals.iter().find_map(|signal| match signal {
            Signal::Failure(message) => Some(message.as_str()),
            _ => None,
        })
    }
}

fn assign_identity(entity: AnyEntity, usn: Usn) -> AnyEntity {
    fn apply<E: SyncedEntity>(mut entity: E, usn: Usn) -> E {
        if entity.guid().is_none() {
            entity.set_guid(Some(Guid::new()));
        }
        entity.set_usn(Some(usn));
        entity.set_dirty(false);
        // A record reconstructed from the wire does not carry the
        // caller's storage identifier.
        entity.set_local_id(LocalId::new());
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

// ── fixtures ────────────────────────────────────────────────────

fn synced_notebook(name: &str, usn: i32) -> Notebook {
    let mut notebook = Notebook::new(name);
    notebook.guid = Some(Guid::new());
    notebook.usn = Some(Usn::new(usn));
    notebook.dirty = false;
    notebook
}

fn edited_note(title: &str, usn: i32, notebook: &Notebook) -> Note {
    let mut note = Note::new(title);
    note.guid = Some(Guid::new());
    note.usn = Some(Usn::new(usn));
    note.dirty = true;
    note.notebook_guid = notebook.guid;
    note.content = Some("<p>edited</p>".to_string());
    note
}

fn fresh_token(secret: &str) -> AuthToken {
    AuthToken::new(secret, Utc::now() + ChronoDuration::hours(24))
}

// ── happy paths ─────────────────────────────────────────────────

#[test]
fn nothing_dirty_finishes_without_pushing() {
    let mut harness = Harness::new();
    harness.store.insert(synced_notebook("clean", 3));
    harness.start(3);

    assert!(harness.pushes.is_empty());
    assert_eq!(harness.finished(), Some((Usn::new(3), false)));
}

#[test]
fn pushes_follow_dependency_order_and_write_back() {
    let mut harness = Harness::new();
    harness.next_usn = 4;
    let notebook = synced_notebook("Existing", 2);
    let note = edited_note("Draft", 4, &notebook);
    harness.store.insert(Tag::new("urgent"));
    harness.store.insert(SavedSearch::new("recent", "created:day"));
    harness.store.insert(Notebook::new("Fresh Notebook"));
    harness.store.insert(notebook);
    harness.store.insert(note);

    harness.start(4);

    let order: Vec<&str> = harness
        .pushes
        .iter()
        .map(|(_, entity, _)| entity.display_name())
        .collect();
    assert_eq!(order, vec!["urgent", "recent", "Fresh Notebook", "Draft"]);

    // New entities are created, already-synchronized ones updated.
    assert!(harness.pushes[0].0);
    assert!(harness.pushes[1].0);
    assert!(harness.pushes[2].0);
    assert!(!harness.pushes[3].0);

    // Contiguous USNs 5..=8 advance the tracked count every time.
    assert_eq!(harness.finished(), Some((Usn::new(8), false)));

    // Write-backs left local storage clean and identified.
    let tag = &harness.store.tags[0];
    assert!(tag.guid.is_some());
    assert!(!tag.dirty);
    assert_eq!(tag.usn, Some(Usn::new(5)));
    let note = &harness.store.notes[0];
    assert!(!note.dirty);
    assert_eq!(note.usn, Some(Usn::new(8)));
}

#[test]
fn never_synchronized_clean_entity_is_still_pushed() {
    let mut harness = Harness::new();
    // No USN and no dirty flag, e.g. a record imported behind the
    // engine's back.
    let mut notebook = Notebook::new("imported");
    notebook.dirty = false;
    harness.store.insert(notebook);

    harness.start(0);

    assert_eq!(harness.attempts_for("imported"), 1);
    assert!(harness.pushes[0].0, "created, not updated");
    assert!(harness.finished().is_some());
    assert!(harness.store.notebooks[0].guid.is_some());
    assert_eq!(harness.store.notebooks[0].usn, Some(Usn::new(1)));
}

#[test]
fn created_identity_is_grafted_onto_the_local_record() {
    let mut harness = Harness::new();
    let tag = Tag::new("reconstructed");
    let local_id = tag.local_id;
    harness.store.insert(tag);

    harness.start(0);

    assert!(harness.finished().is_some(), "{:?}", harness.signals);
    // The write-back found the local row even though the service's
    // returned record carried a foreign storage identifier.
    assert_eq!(harness.store.tags.len(), 1);
    let stored = &harness.store.tags[0];
    assert_eq!(stored.local_id, local_id);
    assert!(stored.guid.is_some());
    assert_eq!(stored.usn, Some(Usn::new(1)));
    assert!(!stored.dirty);
}

#[test]
fn usn_skip_flags_a_repeat_incremental_sync() {
    let mut harness = Harness::new();
    // Another client already pushed USNs 5..10.
    harness.next_usn = 10;
    harness.store.insert(Tag::new("mine"));

    harness.start(4);

    assert!(harness.signals.contains(&Signal::ShouldRepeatIncrementalSync));
    let (count, repeat) = harness.finished().expect("pass still finishes");
    assert!(repeat);
    // The tracked count is left untouched so the next incremental pass
    // downloads the foreign changes.
    assert_eq!(count, Usn::new(4));
}

// ── rate limiting ───────────────────────────────────────────────

#[test]
fn rate_limited_push_retries_exactly_once_after_the_timer() {
    let mut harness = Harness::new();
    harness.store.insert(Tag::new("throttled"));
    harness.fail_next_for("throttled", RemoteError::rate_limit(30));

    harness.start(0);

    assert!(harness.finished().is_none());
    assert_eq!(harness.timers, vec![(CallSite::PushTags, Duration::from_secs(30))]);
    assert!(harness.signals.contains(&Signal::RateLimitExceeded(30)));
    assert_eq!(harness.attempts_for("throttled"), 1);

    harness.fire_timer(CallSite::PushTags);

    assert_eq!(harness.attempts_for("throttled"), 2);
    assert!(harness.finished().is_some());
}

// ── authentication ──────────────────────────────────────────────

#[test]
fn primary_auth_expiry_pauses_until_resumed() {
    let mut harness = Harness::new();
    harness.store.insert(Tag::new("blocked"));
    harness.fail_next_for("blocked", RemoteError::auth_expired());

    harness.start(0);

    assert!(harness.signals.contains(&Signal::RequestAuthToken));
    assert!(harness.signals.contains(&Signal::Paused {
        pending_authentication: true
    }));
    assert!(harness.mgr.is_paused());

    // The driver refreshed the primary token out of band.
    harness.resume();

    assert_eq!(harness.attempts_for("blocked"), 2);
    assert!(harness.finished().is_some());
}

#[test]
fn linked_notebook_changes_wait_for_their_tokens() {
    let mut harness = Harness::new();
    let mut linked = LinkedNotebook::new("Team Share");
    let partition = Guid::new();
    linked.guid = Some(partition);
    linked.usn = Some(Usn::new(1));
    linked.share_key = Some("share-key".to_string());
    harness.store.insert(linked);

    let mut tag = Tag::new("shared tag");
    tag.linked_notebook_guid = Some(partition);
    harness.store.insert(tag);

    harness.start(0);

    assert!(harness.signals.contains(&Signal::RequestAuthTokensForLinkedNotebooks(
        vec![(partition, Some("share-key".to_string()))]
    )));
    assert!(harness.signals.contains(&Signal::Paused {
        pending_authentication: true
    }));
    assert!(harness.pushes.is_empty(), "nothing is pushed without credentials");

    let actions = harness
        .mgr
        .set_linked_auth_tokens(HashMap::from([(partition, fresh_token("linked-secret"))]));
    harness.run(actions);

    assert_eq!(harness.attempts_for("shared tag"), 1);
    assert_eq!(harness.pushes[0].2.as_deref(), Some("linked-secret"));
    assert!(harness.finished().is_some());
}

// ── conflicts and fatal errors ──────────────────────────────────

#[test]
fn data_conflict_on_update_pauses_for_a_merge() {
    let mut harness = Harness::new();
    harness.next_usn = 2;
    let mut tag = Tag::new("diverged");
    tag.guid = Some(Guid::new());
    tag.usn = Some(Usn::new(2));
    harness.store.insert(tag);
    harness.fail_next_for("diverged", RemoteError::data_conflict());

    harness.start(2);

    assert!(harness.signals.contains(&Signal::ConflictDetected));
    assert!(harness.signals.contains(&Signal::Paused {
        pending_authentication: false
    }));
    assert!(harness.finished().is_none());

    // After the merge pass ran elsewhere, resuming retries the element.
    harness.resume();
    assert_eq!(harness.attempts_for("diverged"), 2);
    assert!(harness.finished().is_some());
}

#[test]
fn bad_data_format_on_create_is_fatal() {
    let mut harness = Harness::new();
    harness.store.insert(Tag::new("malformed"));
    harness.fail_next_for("malformed", RemoteError::bad_data_format("name"));

    harness.start(0);

    assert!(harness.failure().is_some());
    assert!(harness.mgr.is_terminal());
    assert_eq!(harness.attempts_for("malformed"), 1, "never retried");
}

// ── request correlation ─────────────────────────────────────────

#[test]
fn stray_push_result_is_a_complete_no_op() {
    let mut harness = Harness::new();
    harness.store.insert(Tag::new("t"));
    harness.start(0);
    assert!(harness.finished().is_some());

    let actions = harness
        .mgr
        .handle_push_result(RequestToken::new(), Ok(PushOutcome::Updated(Usn::new(99))));
    assert!(actions.is_empty());
}

// ── stop ────────────────────────────────────────────────────────

#[test]
fn stop_while_parked_on_a_timer_is_honored_immediately() {
    let mut harness = Harness::new();
    harness.store.insert(Tag::new("parked"));
    harness.fail_next_for("parked", RemoteError::rate_limit(60));
    harness.start(0);
    assert!(harness.finished().is_none());

    let actions = harness.mgr.stop();
    harness.run(actions);

    assert!(harness.signals.contains(&Signal::Stopped));
    assert!(harness.mgr.is_terminal());
    // The parked element was never re-pushed.
    assert_eq!(harness.attempts_for("parked"), 1);
}

#[test]
fn stop_during_an_in_flight_push_wins_over_a_rate_limit() {
    let mut harness = Harness::new();
    harness.store.insert(Tag::new("mid-flight"));

    // Drive the listing by hand so the push result can be delayed past
    // the stop request.
    let mut pending: VecDeque<Action> =
        harness.mgr.start(Usn::new(0), HashMap::new()).into();
    let mut push_token = None;
    while let Some(action) = pending.pop_front() {
        match action {
            Action::Storage(request) => {
                let reply = harness.store.handle(request);
                pending.extend(harness.mgr.handle_storage_reply(reply));
            }
            Action::PushCreate { token, .. } => push_token = Some(token),
            Action::Emit(_) => {}
            other => panic!("unexpected action {other:?}"),
        }
    }
    let token = push_token.expect("the dirty tag goes out as a create");

    assert!(
        harness.mgr.stop().is_empty(),
        "stop waits for the in-flight push"
    );
    let actions = harness
        .mgr
        .handle_push_result(token, Err(RemoteError::rate_limit(30)));
    harness.run(actions);

    assert!(harness.signals.contains(&Signal::Stopped));
    assert!(harness.timers.is_empty(), "no retry timer is armed");
    assert!(harness.mgr.is_terminal());
}
