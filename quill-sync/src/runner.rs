//! Async driver for the sync managers.
//!
//! The managers are pure state machines; this runner owns the I/O. It
//! feeds storage replies, remote-call completions, commands and timer
//! expiries into the active manager, executes the [`Action`]s that come
//! back, and forwards emitted [`Signal`]s to the orchestrating
//! application. One full run is a download-merge pass followed by an
//! upload pass seeded with the download's resume point.

use crate::action::Action;
use crate::download::FullSyncManager;
use crate::error::{SyncError, SyncResult};
use crate::ledger::RequestToken;
use crate::protocol::{AuthToken, NoteStoreClient, RemoteError};
use crate::signal::Signal;
use crate::storage::{AnyEntity, StorageReply, StorageRequest};
use crate::timer::DelayQueue;
use crate::upload::{PushOutcome, SendLocalChangesManager};
use quill_types::{Guid, Note, SyncChunk, Usn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

/// Tunables for one runner instance.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Page size for change-batch downloads.
    pub max_entries: u32,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self { max_entries: 50 }
    }
}

/// External control commands accepted mid-run.
#[derive(Debug, Clone)]
pub enum SyncCommand {
    /// Freeze the upload pass (no effect while downloading).
    Pause,
    /// Resume a paused upload pass.
    Resume,
    /// Abort the run at the next settle point.
    Stop,
    /// Hand over fresh linked-notebook credentials.
    SetLinkedAuthTokens(HashMap<Guid, AuthToken>),
}

/// The final resume point of a completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOutcome {
    pub last_update_count: Usn,
    pub per_linked_notebook_update_counts: HashMap<Guid, Usn>,
    /// Another client pushed concurrently; run a fresh incremental pass.
    pub should_repeat_incremental_sync: bool,
}

/// Completions from spawned remote calls.
enum RemoteEvent {
    Chunk(Result<SyncChunk, RemoteError>),
    NoteContent(RequestToken, Result<Note, RemoteError>),
    Push(RequestToken, Result<PushOutcome, RemoteError>),
}

/// Terminal signals observed while forwarding.
#[derive(Default)]
struct Observed {
    finished: Option<(Usn, HashMap<Guid, Usn>, bool)>,
    failure: Option<String>,
    stopped: bool,
}

/// Drives one download-merge pass and one upload pass to completion.
pub struct SyncRunner {
    client: Arc<dyn NoteStoreClient>,
    auth: AuthToken,
    config: RunnerConfig,
    storage_tx: mpsc::Sender<StorageRequest>,
    storage_rx: mpsc::Receiver<StorageReply>,
    signal_tx: mpsc::Sender<Signal>,
    command_rx: mpsc::Receiver<SyncCommand>,
    timers: DelayQueue,
    remote_tx: mpsc::Sender<RemoteEvent>,
    remote_rx: mpsc::Receiver<RemoteEvent>,
}

impl SyncRunner {
    pub fn new(
        client: Arc<dyn NoteStoreClient>,
        auth: AuthToken,
        storage_tx: mpsc::Sender<StorageRequest>,
        storage_rx: mpsc::Receiver<StorageReply>,
        signal_tx: mpsc::Sender<Signal>,
        command_rx: mpsc::Receiver<SyncCommand>,
        config: RunnerConfig,
    ) -> Self {
        let (remote_tx, remote_rx) = mpsc::channel(64);
        Self {
            client,
            auth,
            config,
            storage_tx,
            storage_rx,
            signal_tx,
            command_rx,
            timers: DelayQueue::new(),
            remote_tx,
            remote_rx,
        }
    }

    /// Runs a download-merge pass from `after_usn`, then an upload pass
    /// from the resulting resume point.
    pub async fn run(mut self, after_usn: Usn, full_sync_only: bool) -> SyncResult<SyncOutcome> {
        let mut download = FullSyncManager::new();
        let actions = download.start(after_usn, full_sync_only);
        let downloaded = self.drive_download(&mut download, actions).await?;
        info!(last_update_count = %downloaded.0, "download pass complete, uploading");

        let mut upload = SendLocalChangesManager::new();
        let actions = upload.start(downloaded.0, downloaded.1);
        let uploaded = self.drive_upload(&mut upload, actions).await?;

        Ok(SyncOutcome {
            last_update_count: uploaded.0,
            per_linked_notebook_update_counts: uploaded.1,
            should_repeat_incremental_sync: downloaded.2 || uploaded.2,
        })
    }

    async fn drive_download(
        &mut self,
        mgr: &mut FullSyncManager,
        initial: Vec<Action>,
    ) -> SyncResult<(Usn, HashMap<Guid, Usn>, bool)> {
        let mut observed = Observed::default();
        self.dispatch(initial, &mut observed).await?;

        while !mgr.is_terminal() {
            let actions = self.next_download_input(mgr).await?;
            self.dispatch(actions, &mut observed).await?;
        }
        settle(observed)
    }

    async fn next_download_input(&mut self, mgr: &mut FullSyncManager) -> SyncResult<Vec<Action>> {
        let deadline = self.timers.next_deadline();
        let timer = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            reply = self.storage_rx.recv() => {
                let reply = reply.ok_or(SyncError::ChannelClosed)?;
                Ok(mgr.handle_storage_reply(reply))
            }
            event = self.remote_rx.recv() => {
                match event.ok_or(SyncError::ChannelClosed)? {
                    RemoteEvent::Chunk(Ok(chunk)) => Ok(mgr.handle_chunk(chunk)),
                    RemoteEvent::Chunk(Err(error)) => Ok(mgr.handle_chunk_failed(error)),
                    RemoteEvent::NoteContent(token, result) => {
                        Ok(mgr.handle_note_content(token, result))
                    }
                    // A push completion cannot arrive while downloading.
                    RemoteEvent::Push(..) => Ok(Vec::new()),
                }
            }
            command = self.command_rx.recv() => {
                match command.ok_or(SyncError::ChannelClosed)? {
                    SyncCommand::Stop => Ok(mgr.stop()),
                    SyncCommand::Pause | SyncCommand::Resume
                    | SyncCommand::SetLinkedAuthTokens(_) => {
                        debug!("command only applies to the upload pass, ignoring");
                        Ok(Vec::new())
                    }
                }
            }
            () = timer => {
                let mut actions = Vec::new();
                for site in self.timers.pop_due(Instant::now()) {
                    actions.extend(mgr.handle_timer_fired(site));
                }
                Ok(actions)
            }
        }
    }

    async fn drive_upload(
        &mut self,
        mgr: &mut SendLocalChangesManager,
        initial: Vec<Action>,
    ) -> SyncResult<(Usn, HashMap<Guid, Usn>, bool)> {
        let mut observed = Observed::default();
        self.dispatch(initial, &mut observed).await?;

        while !mgr.is_terminal() {
            let actions = self.next_upload_input(mgr).await?;
            self.dispatch(actions, &mut observed).await?;
        }
        settle(observed)
    }

    async fn next_upload_input(
        &mut self,
        mgr: &mut SendLocalChangesManager,
    ) -> SyncResult<Vec<Action>> {
        let deadline = self.timers.next_deadline();
        let timer = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            reply = self.storage_rx.recv() => {
                let reply = reply.ok_or(SyncError::ChannelClosed)?;
                Ok(mgr.handle_storage_reply(reply))
            }
            event = self.remote_rx.recv() => {
                match event.ok_or(SyncError::ChannelClosed)? {
                    RemoteEvent::Push(token, result) => Ok(mgr.handle_push_result(token, result)),
                    // Leftovers from the download pass.
                    RemoteEvent::Chunk(_) | RemoteEvent::NoteContent(..) => Ok(Vec::new()),
                }
            }
            command = self.command_rx.recv() => {
                match command.ok_or(SyncError::ChannelClosed)? {
                    SyncCommand::Pause => Ok(mgr.pause()),
                    SyncCommand::Resume => Ok(mgr.resume()),
                    SyncCommand::Stop => Ok(mgr.stop()),
                    SyncCommand::SetLinkedAuthTokens(tokens) => {
                        Ok(mgr.set_linked_auth_tokens(tokens))
                    }
                }
            }
            () = timer => {
                let mut actions = Vec::new();
                for site in self.timers.pop_due(Instant::now()) {
                    actions.extend(mgr.handle_timer_fired(site));
                }
                Ok(actions)
            }
        }
    }

    /// Executes a batch of manager actions.
    async fn dispatch(&mut self, actions: Vec<Action>, observed: &mut Observed) -> SyncResult<()> {
        for action in actions {
            match action {
                Action::Storage(request) => {
                    self.storage_tx
                        .send(request)
                        .await
                        .map_err(|_| SyncError::ChannelClosed)?;
                }
                Action::FetchChunk {
                    after_usn,
                    full_sync_only,
                } => {
                    let client = Arc::clone(&self.client);
                    let auth = self.auth.clone();
                    let max_entries = self.config.max_entries;
                    let tx = self.remote_tx.clone();
                    tokio::spawn(async move {
                        let result = client
                            .get_sync_chunk(after_usn, max_entries, full_sync_only, &auth)
                            .await;
                        let _ = tx.send(RemoteEvent::Chunk(result)).await;
                    });
                }
                Action::FetchNoteContent {
                    token,
                    guid,
                    options,
                } => {
                    let client = Arc::clone(&self.client);
                    let tx = self.remote_tx.clone();
                    tokio::spawn(async move {
                        let result = client.get_note(guid, options).await;
                        let _ = tx.send(RemoteEvent::NoteContent(token, result)).await;
                    });
                }
                Action::PushCreate {
                    token,
                    entity,
                    linked_auth,
                } => {
                    let client = Arc::clone(&self.client);
                    let tx = self.remote_tx.clone();
                    tokio::spawn(async move {
                        let result = push_create(&*client, entity, linked_auth.as_ref()).await;
                        let _ = tx.send(RemoteEvent::Push(token, result)).await;
                    });
                }
                Action::PushUpdate {
                    token,
                    entity,
                    linked_auth,
                } => {
                    let client = Arc::clone(&self.client);
                    let tx = self.remote_tx.clone();
                    tokio::spawn(async move {
                        let result = push_update(&*client, entity, linked_auth.as_ref()).await;
                        let _ = tx.send(RemoteEvent::Push(token, result)).await;
                    });
                }
                Action::StartTimer { site, after } => {
                    self.timers.schedule(Instant::now(), after, site);
                }
                Action::CancelTimers => self.timers.cancel_all(),
                Action::Emit(signal) => {
                    match &signal {
                        Signal::Finished {
                            last_update_count,
                            per_linked_notebook_update_counts,
                            should_repeat_incremental_sync,
                        } => {
                            observed.finished = Some((
                                *last_update_count,
                                per_linked_notebook_update_counts.clone(),
                                *should_repeat_incremental_sync,
                            ));
                        }
                        Signal::Failure(message) => observed.failure = Some(message.clone()),
                        Signal::Stopped => observed.stopped = true,
                        _ => {}
                    }
                    self.signal_tx
                        .send(signal)
                        .await
                        .map_err(|_| SyncError::ChannelClosed)?;
                }
            }
        }
        Ok(())
    }
}

fn settle(observed: Observed) -> SyncResult<(Usn, HashMap<Guid, Usn>, bool)> {
    if let Some(message) = observed.failure {
        return Err(SyncError::PassFailed(message));
    }
    if observed.stopped {
        return Err(SyncError::Stopped);
    }
    observed
        .finished
        .ok_or_else(|| SyncError::Protocol("pass ended without a terminal signal".into()))
}

async fn push_create(
    client: &dyn NoteStoreClient,
    entity: AnyEntity,
    linked_auth: Option<&AuthToken>,
) -> Result<PushOutcome, RemoteError> {
    let created = match entity {
        AnyEntity::Tag(e) => AnyEntity::Tag(client.create_tag(&e, linked_auth).await?),
        AnyEntity::SavedSearch(e) => {
            AnyEntity::SavedSearch(client.create_saved_search(&e, linked_auth).await?)
        }
        AnyEntity::Notebook(e) => {
            AnyEntity::Notebook(client.create_notebook(&e, linked_auth).await?)
        }
        AnyEntity::Note(e) => AnyEntity::Note(client.create_note(&e, linked_auth).await?),
        AnyEntity::LinkedNotebook(_) => {
            return Err(RemoteError::unexpected(
                "linked notebooks are owned upstream and cannot be created from here",
            ));
        }
    };
    Ok(PushOutcome::Created(created))
}

async fn push_update(
    client: &dyn NoteStoreClient,
    entity: AnyEntity,
    linked_auth: Option<&AuthToken>,
) -> Result<PushOutcome, RemoteError> {
    let usn = match entity {
        AnyEntity::Tag(e) => client.update_tag(&e, linked_auth).await?,
        AnyEntity::SavedSearch(e) => client.update_saved_search(&e, linked_auth).await?,
        AnyEntity::Notebook(e) => client.update_notebook(&e, linked_auth).await?,
        AnyEntity::Note(e) => client.update_note(&e, linked_auth).await?,
        AnyEntity::LinkedNotebook(_) => {
            return Err(RemoteError::unexpected(
                "linked notebooks are owned upstream and cannot be updated from here",
            ));
        }
    };
    Ok(PushOutcome::Updated(usn))
}
