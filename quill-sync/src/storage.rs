//! Local storage contract.
//!
//! Local storage is an external collaborator shared with arbitrarily many
//! other consumers, addressed exclusively through asynchronous
//! request/reply messages correlated by [`RequestToken`] — never by
//! assuming reply order matches request order. Notes are persisted with
//! their owning notebook alongside; the add/update call signature for
//! notes requires both.

use crate::ledger::RequestToken;
use quill_types::{
    EntityKind, Guid, LinkedNotebook, ListFilter, ListOrder, Note, Notebook, OrderDirection,
    SavedSearch, SyncedEntity, Tag, Usn,
};
use serde::{Deserialize, Serialize};

/// A synchronized entity of any kind, for transport through the storage
/// channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AnyEntity {
    Tag(Tag),
    SavedSearch(SavedSearch),
    Notebook(Notebook),
    Note(Note),
    LinkedNotebook(LinkedNotebook),
}

impl AnyEntity {
    #[must_use]
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Tag(_) => EntityKind::Tag,
            Self::SavedSearch(_) => EntityKind::SavedSearch,
            Self::Notebook(_) => EntityKind::Notebook,
            Self::Note(_) => EntityKind::Note,
            Self::LinkedNotebook(_) => EntityKind::LinkedNotebook,
        }
    }

    #[must_use]
    pub fn guid(&self) -> Option<Guid> {
        match self {
            Self::Tag(e) => e.guid(),
            Self::SavedSearch(e) => e.guid(),
            Self::Notebook(e) => e.guid(),
            Self::Note(e) => e.guid(),
            Self::LinkedNotebook(e) => e.guid(),
        }
    }

    #[must_use]
    pub fn usn(&self) -> Option<Usn> {
        match self {
            Self::Tag(e) => e.usn(),
            Self::SavedSearch(e) => e.usn(),
            Self::Notebook(e) => e.usn(),
            Self::Note(e) => e.usn(),
            Self::LinkedNotebook(e) => e.usn(),
        }
    }

    #[must_use]
    pub fn display_name(&self) -> &str {
        match self {
            Self::Tag(e) => e.display_name(),
            Self::SavedSearch(e) => e.display_name(),
            Self::Notebook(e) => e.display_name(),
            Self::Note(e) => e.display_name(),
            Self::LinkedNotebook(e) => e.display_name(),
        }
    }

    #[must_use]
    pub fn linked_notebook_guid(&self) -> Option<Guid> {
        match self {
            Self::Tag(e) => e.linked_notebook_guid(),
            Self::SavedSearch(e) => e.linked_notebook_guid(),
            Self::Notebook(e) => e.linked_notebook_guid(),
            Self::Note(e) => e.linked_notebook_guid(),
            Self::LinkedNotebook(e) => e.linked_notebook_guid(),
        }
    }
}

impl From<Tag> for AnyEntity {
    fn from(e: Tag) -> Self {
        Self::Tag(e)
    }
}
impl From<SavedSearch> for AnyEntity {
    fn from(e: SavedSearch) -> Self {
        Self::SavedSearch(e)
    }
}
impl From<Notebook> for AnyEntity {
    fn from(e: Notebook) -> Self {
        Self::Notebook(e)
    }
}
impl From<Note> for AnyEntity {
    fn from(e: Note) -> Self {
        Self::Note(e)
    }
}
impl From<LinkedNotebook> for AnyEntity {
    fn from(e: LinkedNotebook) -> Self {
        Self::LinkedNotebook(e)
    }
}

/// A request issued to local storage. Every variant carries the token its
/// reply will echo back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StorageRequest {
    Add {
        token: RequestToken,
        entity: AnyEntity,
    },
    Update {
        token: RequestToken,
        entity: AnyEntity,
    },
    /// Notes are persisted with their owning notebook alongside.
    AddNote {
        token: RequestToken,
        note: Note,
        notebook: Notebook,
    },
    UpdateNote {
        token: RequestToken,
        note: Note,
        notebook: Notebook,
    },
    FindByGuid {
        token: RequestToken,
        kind: EntityKind,
        guid: Guid,
    },
    /// Case-insensitive name lookup; notes match on title.
    FindByName {
        token: RequestToken,
        kind: EntityKind,
        name: String,
    },
    List {
        token: RequestToken,
        kind: EntityKind,
        filter: ListFilter,
        limit: u32,
        offset: u32,
        order: ListOrder,
        direction: OrderDirection,
        /// Restricts the listing to one linked notebook's entities;
        /// `None` lists the user's own account.
        linked_notebook: Option<Guid>,
    },
    ListLinkedNotebooks {
        token: RequestToken,
    },
}

impl StorageRequest {
    /// The correlation token this request carries.
    #[must_use]
    pub fn token(&self) -> RequestToken {
        match self {
            Self::Add { token, .. }
            | Self::Update { token, .. }
            | Self::AddNote { token, .. }
            | Self::UpdateNote { token, .. }
            | Self::FindByGuid { token, .. }
            | Self::FindByName { token, .. }
            | Self::List { token, .. }
            | Self::ListLinkedNotebooks { token } => *token,
        }
    }
}

/// An asynchronous reply from local storage. "Not found" is a normal
/// outcome for find requests; the `Failed` variants indicate a corrupted
/// or unavailable local environment and are fatal to the pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StorageReply {
    AddCompleted { token: RequestToken },
    AddFailed { token: RequestToken, message: String },
    UpdateCompleted { token: RequestToken },
    UpdateFailed { token: RequestToken, message: String },
    FoundByGuid { token: RequestToken, entity: AnyEntity },
    NotFoundByGuid { token: RequestToken },
    FoundByName { token: RequestToken, entity: AnyEntity },
    NotFoundByName { token: RequestToken },
    FindFailed { token: RequestToken, message: String },
    ListCompleted { token: RequestToken, entities: Vec<AnyEntity> },
    ListLinkedNotebooksCompleted { token: RequestToken, linked_notebooks: Vec<LinkedNotebook> },
    ListFailed { token: RequestToken, message: String },
}

impl StorageReply {
    /// The correlation token this reply echoes.
    #[must_use]
    pub fn token(&self) -> RequestToken {
        match self {
            Self::AddCompleted { token }
            | Self::AddFailed { token, .. }
            | Self::UpdateCompleted { token }
            | Self::UpdateFailed { token, .. }
            | Self::FoundByGuid { token, .. }
            | Self::NotFoundByGuid { token }
            | Self::FoundByName { token, .. }
            | Self::NotFoundByName { token }
            | Self::FindFailed { token, .. }
            | Self::ListCompleted { token, .. }
            | Self::ListLinkedNotebooksCompleted { token, .. }
            | Self::ListFailed { token, .. } => *token,
        }
    }
}

/// An in-memory local store for testing and for driving the managers
/// end-to-end without a real database.
pub mod mock {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::{mpsc, Mutex};

    /// In-memory local storage that answers [`StorageRequest`]s
    /// synchronously.
    #[derive(Debug, Default, Clone)]
    pub struct InMemoryStore {
        pub tags: Vec<Tag>,
        pub searches: Vec<SavedSearch>,
        pub notebooks: Vec<Notebook>,
        pub notes: Vec<Note>,
        pub linked_notebooks: Vec<LinkedNotebook>,
    }

    impl InMemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Seeds the store with an entity.
        pub fn insert(&mut self, entity: impl Into<AnyEntity>) {
            match entity.into() {
                AnyEntity::Tag(e) => self.tags.push(e),
                AnyEntity::SavedSearch(e) => self.searches.push(e),
                AnyEntity::Notebook(e) => self.notebooks.push(e),
                AnyEntity::Note(e) => self.notes.push(e),
                AnyEntity::LinkedNotebook(e) => self.linked_notebooks.push(e),
            }
        }

        /// Answers one request.
        pub fn handle(&mut self, request: StorageRequest) -> StorageReply {
            match request {
                StorageRequest::Add { token, entity } => {
                    self.insert(entity);
                    StorageReply::AddCompleted { token }
                }
                StorageRequest::AddNote { token, note, .. } => {
                    self.notes.push(note);
                    StorageReply::AddCompleted { token }
                }
                StorageRequest::Update { token, entity } => match self.replace(entity) {
                    Ok(()) => StorageReply::UpdateCompleted { token },
                    Err(message) => StorageReply::UpdateFailed { token, message },
                },
                StorageRequest::UpdateNote { token, note, .. } => {
                    match self.replace(AnyEntity::Note(note)) {
                        Ok(()) => StorageReply::UpdateCompleted { token },
                        Err(message) => StorageReply::UpdateFailed { token, message },
                    }
                }
                StorageRequest::FindByGuid { token, kind, guid } => {
                    match self.find(kind, |e| e.guid() == Some(guid)) {
                        Some(entity) => StorageReply::FoundByGuid { token, entity },
                        None => StorageReply::NotFoundByGuid { token },
                    }
                }
                StorageRequest::FindByName { token, kind, name } => {
                    let needle = name.to_lowercase();
                    match self.find(kind, |e| e.display_name().to_lowercase() == needle) {
                        Some(entity) => StorageReply::FoundByName { token, entity },
                        None => StorageReply::NotFoundByName { token },
                    }
                }
                StorageRequest::List {
                    token,
                    kind,
                    filter,
                    linked_notebook,
                    ..
                } => {
                    let entities = self.list(kind, filter, linked_notebook);
                    StorageReply::ListCompleted { token, entities }
                }
                StorageRequest::ListLinkedNotebooks { token } => {
                    StorageReply::ListLinkedNotebooksCompleted {
                        token,
                        linked_notebooks: self.linked_notebooks.clone(),
                    }
                }
            }
        }

        fn find<F>(&self, kind: EntityKind, pred: F) -> Option<AnyEntity>
        where
            F: Fn(&AnyEntity) -> bool,
        {
            fn scan<E: SyncedEntity + Clone + Into<AnyEntity>, F: Fn(&AnyEntity) -> bool>(
                list: &[E],
                pred: F,
            ) -> Option<AnyEntity> {
                list.iter()
                    .map(|e| e.clone().into())
                    .find(|e: &AnyEntity| pred(e))
            }
            match kind {
                EntityKind::Tag => scan(&self.tags, pred),
                EntityKind::SavedSearch => scan(&self.searches, pred),
                EntityKind::Notebook => scan(&self.notebooks, pred),
                EntityKind::Note => scan(&self.notes, pred),
                EntityKind::LinkedNotebook => scan(&self.linked_notebooks, pred),
            }
        }

        fn list(
            &self,
            kind: EntityKind,
            filter: ListFilter,
            linked_notebook: Option<Guid>,
        ) -> Vec<AnyEntity> {
            fn select<E: SyncedEntity + Clone + Into<AnyEntity>>(
                list: &[E],
                filter: ListFilter,
                linked_notebook: Option<Guid>,
            ) -> Vec<AnyEntity> {
                list.iter()
                    .filter(|e| e.linked_notebook_guid() == linked_notebook)
                    .filter(|e| filter.matches(*e))
                    .map(|e| e.clone().into())
                    .collect()
            }
            match kind {
                EntityKind::Tag => select(&self.tags, filter, linked_notebook),
                EntityKind::SavedSearch => select(&self.searches, filter, linked_notebook),
                EntityKind::Notebook => select(&self.notebooks, filter, linked_notebook),
                EntityKind::Note => select(&self.notes, filter, linked_notebook),
                EntityKind::LinkedNotebook => {
                    select(&self.linked_notebooks, filter, linked_notebook)
                }
            }
        }

        fn replace(&mut self, entity: AnyEntity) -> Result<(), String> {
            fn swap<E: SyncedEntity>(list: &mut [E], entity: E) -> Result<(), String> {
                match list
                    .iter_mut()
                    .find(|e| e.local_id() == entity.local_id())
                {
                    Some(slot) => {
                        *slot = entity;
                        Ok(())
                    }
                    None => Err(format!(
                        "no {} with local id {} to update",
                        E::KIND,
                        entity.local_id()
                    )),
                }
            }
            match entity {
                AnyEntity::Tag(e) => swap(&mut self.tags, e),
                AnyEntity::SavedSearch(e) => swap(&mut self.searches, e),
                AnyEntity::Notebook(e) => swap(&mut self.notebooks, e),
                AnyEntity::Note(e) => swap(&mut self.notes, e),
                AnyEntity::LinkedNotebook(e) => swap(&mut self.linked_notebooks, e),
            }
        }
    }

    /// Serves an [`InMemoryStore`] over the storage channels until the
    /// request channel closes. The store stays inspectable through the
    /// shared handle.
    pub fn serve(
        store: Arc<Mutex<InMemoryStore>>,
        mut requests: mpsc::Receiver<StorageRequest>,
        replies: mpsc::Sender<StorageReply>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                let reply = store.lock().await.handle(request);
                if replies.send(reply).await.is_err() {
                    break;
                }
            }
        })
    }
}
