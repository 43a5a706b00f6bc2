//! End-to-end tests for the async runner over the scriptable note
//! service and the in-memory local store.

use chrono::{Duration as ChronoDuration, Utc};
use pretty_assertions::assert_eq;
use quill_sync::protocol::mock::ScriptedNoteStore;
use quill_sync::storage::mock::{serve, InMemoryStore};
use quill_sync::{
    AuthToken, RunnerConfig, Signal, SyncCommand, SyncError, SyncOutcome, SyncRunner,
};
use quill_types::{Guid, Note, Notebook, SavedSearch, SyncChunk, Tag, Usn};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

fn fresh_token() -> AuthToken {
    AuthToken::new("primary-secret", Utc::now() + ChronoDuration::hours(24))
}

fn synced_notebook(name: &str, usn: i32) -> Notebook {
    let mut notebook = Notebook::new(name);
    notebook.guid = Some(Guid::new());
    notebook.usn = Some(Usn::new(usn));
    notebook.dirty = false;
    notebook
}

fn note_metadata(title: &str, usn: i32, notebook: &Notebook) -> Note {
    let mut note = Note::new(title);
    note.guid = Some(Guid::new());
    note.usn = Some(Usn::new(usn));
    note.dirty = false;
    note.notebook_guid = notebook.guid;
    note
}

struct TestRun {
    outcome: Result<SyncOutcome, SyncError>,
    signals: Vec<Signal>,
    store: Arc<Mutex<InMemoryStore>>,
}

/// Wires a runner to the scripted service and the shared store, runs one
/// full pass pair, and collects every emitted signal.
async fn run_sync(client: Arc<ScriptedNoteStore>, seed: InMemoryStore) -> TestRun {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let store = Arc::new(Mutex::new(seed));
    let (storage_tx, storage_request_rx) = mpsc::channel(64);
    let (storage_reply_tx, storage_reply_rx) = mpsc::channel(64);
    let server = serve(Arc::clone(&store), storage_request_rx, storage_reply_tx);

    let (signal_tx, mut signal_rx) = mpsc::channel(64);
    let (command_tx, command_rx) = mpsc::channel::<SyncCommand>(8);

    let runner = SyncRunner::new(
        client,
        fresh_token(),
        storage_tx,
        storage_reply_rx,
        signal_tx,
        command_rx,
        RunnerConfig::default(),
    );
    let outcome = runner.run(Usn::new(0), false).await;
    drop(command_tx);
    server.abort();

    let mut signals = Vec::new();
    while let Some(signal) = signal_rx.recv().await {
        signals.push(signal);
    }
    TestRun {
        outcome,
        signals,
        store,
    }
}

#[tokio::test]
async fn full_run_downloads_then_uploads() {
    let client = Arc::new(ScriptedNoteStore::new());

    // Remote history: one notebook, one note.
    let notebook = synced_notebook("Remote Notebook", 1);
    let note = note_metadata("Remote Note", 2, &notebook);
    let mut body = note.clone();
    body.content = Some("<p>from the service</p>".to_string());
    client.put_note_body(body);
    let mut chunk = SyncChunk::new(Usn::new(2), Usn::new(2));
    chunk.notebooks.push(notebook);
    chunk.notes.push(note);
    client.push_chunk(chunk);
    // The upload pass continues the same USN sequence.
    client.set_next_usn(Usn::new(2));

    // One local change waiting to go up.
    let mut seed = InMemoryStore::new();
    seed.insert(SavedSearch::new("starred", "tag:starred"));

    let run = run_sync(Arc::clone(&client), seed).await;

    let outcome = run.outcome.expect("both passes complete");
    assert_eq!(outcome.last_update_count, Usn::new(3));
    assert!(!outcome.should_repeat_incremental_sync);

    // Download landed the remote entities with fetched content.
    let store = run.store.lock().await;
    assert_eq!(store.notebooks.len(), 1);
    assert_eq!(store.notes.len(), 1);
    assert_eq!(
        store.notes[0].content.as_deref(),
        Some("<p>from the service</p>")
    );

    // Upload created the search and wrote its identity back.
    let pushed = client.pushed_searches();
    assert_eq!(pushed.len(), 1);
    assert_eq!(pushed[0].name, "starred");
    assert!(store.searches[0].guid.is_some());
    assert!(!store.searches[0].dirty);

    // One Finished signal per pass.
    let finishes = run
        .signals
        .iter()
        .filter(|s| matches!(s, Signal::Finished { .. }))
        .count();
    assert_eq!(finishes, 2);
}

#[tokio::test]
async fn empty_remote_and_clean_store_is_a_quiet_run() {
    let client = Arc::new(ScriptedNoteStore::new());
    client.push_chunk(SyncChunk::new(Usn::new(0), Usn::new(0)));

    let run = run_sync(Arc::clone(&client), InMemoryStore::new()).await;

    let outcome = run.outcome.expect("nothing to do still finishes");
    assert_eq!(outcome.last_update_count, Usn::new(0));
    assert_eq!(client.call_count("get_sync_chunk"), 1);
    assert!(client.pushed_tags().is_empty());
}

#[tokio::test]
async fn chunk_download_failure_surfaces_as_a_failed_pass() {
    // No scripted chunk: the service reports an unexpected error.
    let client = Arc::new(ScriptedNoteStore::new());

    let mut seed = InMemoryStore::new();
    seed.insert(Tag::new("never sent"));

    let run = run_sync(client, seed).await;

    assert!(matches!(run.outcome, Err(SyncError::PassFailed(_))));
    assert!(run
        .signals
        .iter()
        .any(|s| matches!(s, Signal::Failure(_))));
}
