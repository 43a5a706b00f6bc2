//! Synchronized entity records.
//!
//! The five entity kinds the sync engine moves between local storage and
//! the remote note service: tags, saved searches, notebooks, notes and
//! linked notebooks. All are value-like records keyed by a stable remote
//! guid once synchronized, plus a local-storage identifier that exists
//! from the moment the record is first persisted.
//!
//! Per-kind dispatch goes through the closed [`EntityKind`] set and the
//! [`SyncedEntity`] trait rather than one specialized code path per kind.

use crate::ids::{Guid, LocalId, Usn};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The closed set of entity kinds the engine synchronizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Tag,
    SavedSearch,
    Notebook,
    Note,
    LinkedNotebook,
}

impl EntityKind {
    /// All kinds, in download merge order.
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Tag,
        EntityKind::SavedSearch,
        EntityKind::LinkedNotebook,
        EntityKind::Notebook,
        EntityKind::Note,
    ];

    /// Dense index for per-kind bookkeeping tables.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            EntityKind::Tag => 0,
            EntityKind::SavedSearch => 1,
            EntityKind::Notebook => 2,
            EntityKind::Note => 3,
            EntityKind::LinkedNotebook => 4,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Tag => "tag",
            EntityKind::SavedSearch => "saved search",
            EntityKind::Notebook => "notebook",
            EntityKind::Note => "note",
            EntityKind::LinkedNotebook => "linked notebook",
        };
        write!(f, "{name}")
    }
}

/// Capability shared by every synchronized entity record.
///
/// A `usn` of `None` means the entity has never been synchronized (purely
/// local, newly created). `dirty` marks unsynchronized local edits. The
/// display name doubles as a secondary matching key when guid lookup
/// fails; for notes it is the title.
pub trait SyncedEntity: Clone + fmt::Debug {
    /// The kind tag for this record type.
    const KIND: EntityKind;

    fn local_id(&self) -> LocalId;
    fn set_local_id(&mut self, id: LocalId);

    fn guid(&self) -> Option<Guid>;
    fn set_guid(&mut self, guid: Option<Guid>);

    fn usn(&self) -> Option<Usn>;
    fn set_usn(&mut self, usn: Option<Usn>);

    fn is_dirty(&self) -> bool;
    fn set_dirty(&mut self, dirty: bool);

    fn display_name(&self) -> &str;
    fn set_display_name(&mut self, name: String);

    /// The linked notebook this entity belongs to, if it lives in another
    /// account's shared notebook.
    fn linked_notebook_guid(&self) -> Option<Guid> {
        None
    }
}

/// A tag. Tags form a hierarchy through `parent_guid`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub local_id: LocalId,
    pub guid: Option<Guid>,
    pub usn: Option<Usn>,
    pub dirty: bool,
    pub name: String,
    pub parent_guid: Option<Guid>,
    pub parent_local_id: Option<LocalId>,
    pub linked_notebook_guid: Option<Guid>,
}

impl Tag {
    /// Creates a new, never-synchronized local tag.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            local_id: LocalId::new(),
            guid: None,
            usn: None,
            dirty: true,
            name: name.into(),
            parent_guid: None,
            parent_local_id: None,
            linked_notebook_guid: None,
        }
    }
}

impl SyncedEntity for Tag {
    const KIND: EntityKind = EntityKind::Tag;

    fn local_id(&self) -> LocalId {
        self.local_id
    }
    fn set_local_id(&mut self, id: LocalId) {
        self.local_id = id;
    }
    fn guid(&self) -> Option<Guid> {
        self.guid
    }
    fn set_guid(&mut self, guid: Option<Guid>) {
        self.guid = guid;
    }
    fn usn(&self) -> Option<Usn> {
        self.usn
    }
    fn set_usn(&mut self, usn: Option<Usn>) {
        self.usn = usn;
    }
    fn is_dirty(&self) -> bool {
        self.dirty
    }
    fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }
    fn display_name(&self) -> &str {
        &self.name
    }
    fn set_display_name(&mut self, name: String) {
        self.name = name;
    }
    fn linked_notebook_guid(&self) -> Option<Guid> {
        self.linked_notebook_guid
    }
}

/// A saved search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedSearch {
    pub local_id: LocalId,
    pub guid: Option<Guid>,
    pub usn: Option<Usn>,
    pub dirty: bool,
    pub name: String,
    pub query: String,
}

impl SavedSearch {
    /// Creates a new, never-synchronized local saved search.
    #[must_use]
    pub fn new(name: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            local_id: LocalId::new(),
            guid: None,
            usn: None,
            dirty: true,
            name: name.into(),
            query: query.into(),
        }
    }
}

impl SyncedEntity for SavedSearch {
    const KIND: EntityKind = EntityKind::SavedSearch;

    fn local_id(&self) -> LocalId {
        self.local_id
    }
    fn set_local_id(&mut self, id: LocalId) {
        self.local_id = id;
    }
    fn guid(&self) -> Option<Guid> {
        self.guid
    }
    fn set_guid(&mut self, guid: Option<Guid>) {
        self.guid = guid;
    }
    fn usn(&self) -> Option<Usn> {
        self.usn
    }
    fn set_usn(&mut self, usn: Option<Usn>) {
        self.usn = usn;
    }
    fn is_dirty(&self) -> bool {
        self.dirty
    }
    fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }
    fn display_name(&self) -> &str {
        &self.name
    }
    fn set_display_name(&mut self, name: String) {
        self.name = name;
    }
}

/// A notebook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notebook {
    pub local_id: LocalId,
    pub guid: Option<Guid>,
    pub usn: Option<Usn>,
    pub dirty: bool,
    pub name: String,
    pub default_notebook: bool,
    pub linked_notebook_guid: Option<Guid>,
}

impl Notebook {
    /// Creates a new, never-synchronized local notebook.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            local_id: LocalId::new(),
            guid: None,
            usn: None,
            dirty: true,
            name: name.into(),
            default_notebook: false,
            linked_notebook_guid: None,
        }
    }
}

impl SyncedEntity for Notebook {
    const KIND: EntityKind = EntityKind::Notebook;

    fn local_id(&self) -> LocalId {
        self.local_id
    }
    fn set_local_id(&mut self, id: LocalId) {
        self.local_id = id;
    }
    fn guid(&self) -> Option<Guid> {
        self.guid
    }
    fn set_guid(&mut self, guid: Option<Guid>) {
        self.guid = guid;
    }
    fn usn(&self) -> Option<Usn> {
        self.usn
    }
    fn set_usn(&mut self, usn: Option<Usn>) {
        self.usn = usn;
    }
    fn is_dirty(&self) -> bool {
        self.dirty
    }
    fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }
    fn display_name(&self) -> &str {
        &self.name
    }
    fn set_display_name(&mut self, name: String) {
        self.name = name;
    }
    fn linked_notebook_guid(&self) -> Option<Guid> {
        self.linked_notebook_guid
    }
}

/// An attachment carried by a note. The body is fetched separately from
/// note metadata and may be absent until the full-content fetch completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub guid: Option<Guid>,
    pub mime: String,
    pub body: Option<Vec<u8>>,
}

/// A note. Change batches carry note metadata only; `content` and resource
/// bodies are fetched in a separate remote call before the note can be
/// persisted locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub local_id: LocalId,
    pub guid: Option<Guid>,
    pub usn: Option<Usn>,
    pub dirty: bool,
    pub title: String,
    pub notebook_guid: Option<Guid>,
    pub tag_guids: Vec<Guid>,
    pub content: Option<String>,
    pub resources: Vec<Resource>,
    pub linked_notebook_guid: Option<Guid>,
}

impl Note {
    /// Creates a new, never-synchronized local note.
    #[must_use]
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            local_id: LocalId::new(),
            guid: None,
            usn: None,
            dirty: true,
            title: title.into(),
            notebook_guid: None,
            tag_guids: Vec::new(),
            content: None,
            resources: Vec::new(),
            linked_notebook_guid: None,
        }
    }
}

impl SyncedEntity for Note {
    const KIND: EntityKind = EntityKind::Note;

    fn local_id(&self) -> LocalId {
        self.local_id
    }
    fn set_local_id(&mut self, id: LocalId) {
        self.local_id = id;
    }
    fn guid(&self) -> Option<Guid> {
        self.guid
    }
    fn set_guid(&mut self, guid: Option<Guid>) {
        self.guid = guid;
    }
    fn usn(&self) -> Option<Usn> {
        self.usn
    }
    fn set_usn(&mut self, usn: Option<Usn>) {
        self.usn = usn;
    }
    fn is_dirty(&self) -> bool {
        self.dirty
    }
    fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }
    fn display_name(&self) -> &str {
        &self.title
    }
    fn set_display_name(&mut self, name: String) {
        self.title = name;
    }
    fn linked_notebook_guid(&self) -> Option<Guid> {
        self.linked_notebook_guid
    }
}

/// A pointer to another account's shared notebook. Carries no mergeable
/// local content; conflict resolution always adopts the remote copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkedNotebook {
    pub local_id: LocalId,
    pub guid: Option<Guid>,
    pub usn: Option<Usn>,
    pub dirty: bool,
    pub share_name: String,
    pub share_key: Option<String>,
    pub note_store_url: Option<String>,
    pub username: Option<String>,
}

impl LinkedNotebook {
    /// Creates a new linked notebook record.
    #[must_use]
    pub fn new(share_name: impl Into<String>) -> Self {
        Self {
            local_id: LocalId::new(),
            guid: None,
            usn: None,
            dirty: false,
            share_name: share_name.into(),
            share_key: None,
            note_store_url: None,
            username: None,
        }
    }
}

impl SyncedEntity for LinkedNotebook {
    const KIND: EntityKind = EntityKind::LinkedNotebook;

    fn local_id(&self) -> LocalId {
        self.local_id
    }
    fn set_local_id(&mut self, id: LocalId) {
        self.local_id = id;
    }
    fn guid(&self) -> Option<Guid> {
        self.guid
    }
    fn set_guid(&mut self, guid: Option<Guid>) {
        self.guid = guid;
    }
    fn usn(&self) -> Option<Usn> {
        self.usn
    }
    fn set_usn(&mut self, usn: Option<Usn>) {
        self.usn = usn;
    }
    fn is_dirty(&self) -> bool {
        self.dirty
    }
    fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }
    fn display_name(&self) -> &str {
        &self.share_name
    }
    fn set_display_name(&mut self, name: String) {
        self.share_name = name;
    }
}
