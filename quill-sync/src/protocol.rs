//! Remote note-service contract.
//!
//! The remote side is an opaque RPC boundary: CRUD calls per entity kind,
//! paginated change-batch retrieval, and a structured error taxonomy
//! carrying rate-limit hints. The managers never call it directly — the
//! driver does the I/O and feeds results back in.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use quill_types::{Guid, LinkedNotebook, Note, Notebook, SavedSearch, SyncChunk, Tag, Usn};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// How close to expiry a cached auth token counts as stale and triggers
/// a refresh before any push depending on it.
pub const AUTH_STALENESS_HOURS: i64 = 6;

/// Error codes the note service can return.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteErrorCode {
    /// The call was rate-limited; retry after the given number of seconds.
    RateLimitReached { duration_s: u32 },
    /// The authentication token has expired.
    AuthExpired,
    /// The server holds newer data than the call assumed.
    DataConflict,
    /// A field of the request was structurally invalid.
    BadDataFormat { parameter: Option<String> },
    /// An account limit was hit (e.g. too many tags).
    LimitReached { parameter: Option<String> },
    /// The caller lacks permission for the operation.
    PermissionDenied { parameter: Option<String> },
    /// Anything the taxonomy does not cover.
    Unexpected,
}

impl fmt::Display for RemoteErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn with_param(
            f: &mut fmt::Formatter<'_>,
            what: &str,
            parameter: &Option<String>,
        ) -> fmt::Result {
            match parameter {
                Some(p) => write!(f, "{what} (offending field: {p})"),
                None => write!(f, "{what}"),
            }
        }

        match self {
            Self::RateLimitReached { duration_s } => {
                write!(f, "rate limit reached, retry after {duration_s}s")
            }
            Self::AuthExpired => write!(f, "authentication token expired"),
            Self::DataConflict => write!(f, "data conflict with newer server state"),
            Self::BadDataFormat { parameter } => with_param(f, "bad data format", parameter),
            Self::LimitReached { parameter } => with_param(f, "limit reached", parameter),
            Self::PermissionDenied { parameter } => with_param(f, "permission denied", parameter),
            Self::Unexpected => write!(f, "unexpected service error"),
        }
    }
}

/// A structured failure from the note service.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct RemoteError {
    pub code: RemoteErrorCode,
    pub message: String,
}

impl RemoteError {
    pub fn new(code: RemoteErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn rate_limit(duration_s: u32) -> Self {
        Self::new(
            RemoteErrorCode::RateLimitReached { duration_s },
            "service is throttling this client",
        )
    }

    pub fn auth_expired() -> Self {
        Self::new(RemoteErrorCode::AuthExpired, "token no longer valid")
    }

    pub fn data_conflict() -> Self {
        Self::new(
            RemoteErrorCode::DataConflict,
            "server has a newer version of this object",
        )
    }

    pub fn bad_data_format(parameter: impl Into<String>) -> Self {
        Self::new(
            RemoteErrorCode::BadDataFormat {
                parameter: Some(parameter.into()),
            },
            "request field is structurally invalid",
        )
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorCode::Unexpected, message)
    }
}

/// An authentication token plus its expiration timestamp, either for the
/// primary account or scoped to one linked notebook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthToken {
    pub secret: String,
    pub expires_at: DateTime<Utc>,
}

impl AuthToken {
    pub fn new(secret: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            secret: secret.into(),
            expires_at,
        }
    }

    /// Whether the token expires within the given window of `now`.
    #[must_use]
    pub fn expires_within(&self, now: DateTime<Utc>, window: Duration) -> bool {
        now + window >= self.expires_at
    }

    /// Whether the token is within [`AUTH_STALENESS_HOURS`] of expiry and
    /// should be refreshed before anything is pushed under it.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.expires_within(now, Duration::hours(AUTH_STALENESS_HOURS))
    }
}

/// Which parts of a note to include in a full-content fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteFetchOptions {
    pub with_content: bool,
    pub with_resource_data: bool,
    pub with_resource_recognition: bool,
    pub with_resource_alternate_data: bool,
}

impl Default for NoteFetchOptions {
    fn default() -> Self {
        Self {
            with_content: true,
            with_resource_data: true,
            with_resource_recognition: false,
            with_resource_alternate_data: false,
        }
    }
}

/// The remote note-service client the driver talks to.
///
/// Create calls return the created entity with its service-assigned guid
/// and USN; update calls return the new USN. `linked_auth` must carry the
/// linked notebook's token when the entity lives in another account's
/// shared notebook, and `None` for the primary account.
#[async_trait]
pub trait NoteStoreClient: Send + Sync {
    async fn get_sync_chunk(
        &self,
        after_usn: Usn,
        max_entries: u32,
        full_sync_only: bool,
        auth: &AuthToken,
    ) -> Result<SyncChunk, RemoteError>;

    async fn get_linked_notebook_sync_chunk(
        &self,
        linked_notebook: &LinkedNotebook,
        after_usn: Usn,
        max_entries: u32,
        full_sync_only: bool,
        auth: &AuthToken,
    ) -> Result<SyncChunk, RemoteError>;

    /// Fetches a note's full body and resources; chunk entries carry
    /// metadata only.
    async fn get_note(&self, guid: Guid, options: NoteFetchOptions) -> Result<Note, RemoteError>;

    async fn create_tag(&self, tag: &Tag, linked_auth: Option<&AuthToken>)
        -> Result<Tag, RemoteError>;

    async fn update_tag(&self, tag: &Tag, linked_auth: Option<&AuthToken>)
        -> Result<Usn, RemoteError>;

    async fn create_saved_search(
        &self,
        search: &SavedSearch,
        linked_auth: Option<&AuthToken>,
    ) -> Result<SavedSearch, RemoteError>;

    async fn update_saved_search(
        &self,
        search: &SavedSearch,
        linked_auth: Option<&AuthToken>,
    ) -> Result<Usn, RemoteError>;

    async fn create_notebook(
        &self,
        notebook: &Notebook,
        linked_auth: Option<&AuthToken>,
    ) -> Result<Notebook, RemoteError>;

    async fn update_notebook(
        &self,
        notebook: &Notebook,
        linked_auth: Option<&AuthToken>,
    ) -> Result<Usn, RemoteError>;

    async fn create_note(
        &self,
        note: &Note,
        linked_auth: Option<&AuthToken>,
    ) -> Result<Note, RemoteError>;

    async fn update_note(
        &self,
        note: &Note,
        linked_auth: Option<&AuthToken>,
    ) -> Result<Usn, RemoteError>;
}

/// A scriptable in-memory note service for testing.
pub mod mock {
    use super::*;
    use quill_types::SyncedEntity;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Inner {
        chunks: VecDeque<SyncChunk>,
        note_bodies: HashMap<Guid, Note>,
        /// Scripted failures per call site, popped in order before the
        /// call is allowed to succeed.
        failures: HashMap<&'static str, VecDeque<RemoteError>>,
        calls: HashMap<&'static str, u32>,
        next_usn: i32,
        pushed_tags: Vec<Tag>,
        pushed_searches: Vec<SavedSearch>,
        pushed_notebooks: Vec<Notebook>,
        pushed_notes: Vec<Note>,
    }

    /// A programmable [`NoteStoreClient`]: chunks are served in scripted
    /// order, failures can be queued per call site, and every push is
    /// recorded with a freshly allocated USN.
    #[derive(Default)]
    pub struct ScriptedNoteStore {
        inner: Mutex<Inner>,
    }

    impl ScriptedNoteStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queues a chunk to be served by the next `get_sync_chunk` call.
        pub fn push_chunk(&self, chunk: SyncChunk) {
            self.inner.lock().unwrap().chunks.push_back(chunk);
        }

        /// Registers the full body for a note guid, served by `get_note`.
        pub fn put_note_body(&self, note: Note) {
            let guid = note.guid.expect("note body needs a guid");
            self.inner.lock().unwrap().note_bodies.insert(guid, note);
        }

        /// Queues a failure for the next call to the named site
        /// (e.g. `"create_tag"`, `"get_note"`).
        pub fn fail_next(&self, site: &'static str, error: RemoteError) {
            self.inner
                .lock()
                .unwrap()
                .failures
                .entry(site)
                .or_default()
                .push_back(error);
        }

        /// Number of calls made to the named site so far.
        pub fn call_count(&self, site: &str) -> u32 {
            self.inner.lock().unwrap().calls.get(site).copied().unwrap_or(0)
        }

        /// Sets the USN the next successful push will be assigned.
        pub fn set_next_usn(&self, usn: Usn) {
            self.inner.lock().unwrap().next_usn = usn.get();
        }

        pub fn pushed_tags(&self) -> Vec<Tag> {
            self.inner.lock().unwrap().pushed_tags.clone()
        }

        pub fn pushed_searches(&self) -> Vec<SavedSearch> {
            self.inner.lock().unwrap().pushed_searches.clone()
        }

        pub fn pushed_notebooks(&self) -> Vec<Notebook> {
            self.inner.lock().unwrap().pushed_notebooks.clone()
        }

        pub fn pushed_notes(&self) -> Vec<Note> {
            self.inner.lock().unwrap().pushed_notes.clone()
        }

        /// Records the call and pops a scripted failure if one is queued.
        fn begin(&self, site: &'static str) -> Result<(), RemoteError> {
            let mut inner = self.inner.lock().unwrap();
            *inner.calls.entry(site).or_insert(0) += 1;
            if let Some(queue) = inner.failures.get_mut(site) {
                if let Some(error) = queue.pop_front() {
                    return Err(error);
                }
            }
            Ok(())
        }

        fn create<E: SyncedEntity>(&self, site: &'static str, entity: &E) -> Result<E, RemoteError> {
            self.begin(site)?;
            let mut inner = self.inner.lock().unwrap();
            inner.next_usn += 1;
            let mut created = entity.clone();
            created.set_guid(Some(Guid::new()));
            created.set_usn(Some(Usn::new(inner.next_usn)));
            created.set_dirty(false);
            Ok(created)
        }

        fn update<E: SyncedEntity>(&self, site: &'static str, entity: &E) -> Result<Usn, RemoteError> {
            self.begin(site)?;
            if entity.guid().is_none() {
                return Err(RemoteError::bad_data_format("guid"));
            }
            let mut inner = self.inner.lock().unwrap();
            inner.next_usn += 1;
            Ok(Usn::new(inner.next_usn))
        }
    }

    #[async_trait]
    impl NoteStoreClient for ScriptedNoteStore {
        async fn get_sync_chunk(
            &self,
            _after_usn: Usn,
            _max_entries: u32,
            _full_sync_only: bool,
            _auth: &AuthToken,
        ) -> Result<SyncChunk, RemoteError> {
            self.begin("get_sync_chunk")?;
            self.inner
                .lock()
                .unwrap()
                .chunks
                .pop_front()
                .ok_or_else(|| RemoteError::unexpected("no scripted chunk left"))
        }

        async fn get_linked_notebook_sync_chunk(
            &self,
            _linked_notebook: &LinkedNotebook,
            after_usn: Usn,
            max_entries: u32,
            full_sync_only: bool,
            auth: &AuthToken,
        ) -> Result<SyncChunk, RemoteError> {
            self.get_sync_chunk(after_usn, max_entries, full_sync_only, auth)
                .await
        }

        async fn get_note(
            &self,
            guid: Guid,
            _options: NoteFetchOptions,
        ) -> Result<Note, RemoteError> {
            self.begin("get_note")?;
            self.inner
                .lock()
                .unwrap()
                .note_bodies
                .get(&guid)
                .cloned()
                .ok_or_else(|| RemoteError::unexpected(format!("no scripted body for note {guid}")))
        }

        async fn create_tag(
            &self,
            tag: &Tag,
            _linked_auth: Option<&AuthToken>,
        ) -> Result<Tag, RemoteError> {
            let created = self.create("create_tag", tag)?;
            self.inner.lock().unwrap().pushed_tags.push(created.clone());
            Ok(created)
        }

        async fn update_tag(
            &self,
            tag: &Tag,
            _linked_auth: Option<&AuthToken>,
        ) -> Result<Usn, RemoteError> {
            let usn = self.update("update_tag", tag)?;
            let mut updated = tag.clone();
            updated.usn = Some(usn);
            self.inner.lock().unwrap().pushed_tags.push(updated);
            Ok(usn)
        }

        async fn create_saved_search(
            &self,
            search: &SavedSearch,
            _linked_auth: Option<&AuthToken>,
        ) -> Result<SavedSearch, RemoteError> {
            let created = self.create("create_saved_search", search)?;
            self.inner
                .lock()
                .unwrap()
                .pushed_searches
                .push(created.clone());
            Ok(created)
        }

        async fn update_saved_search(
            &self,
            search: &SavedSearch,
            _linked_auth: Option<&AuthToken>,
        ) -> Result<Usn, RemoteError> {
            let usn = self.update("update_saved_search", search)?;
            let mut updated = search.clone();
            updated.usn = Some(usn);
            self.inner.lock().unwrap().pushed_searches.push(updated);
            Ok(usn)
        }

        async fn create_notebook(
            &self,
            notebook: &Notebook,
            _linked_auth: Option<&AuthToken>,
        ) -> Result<Notebook, RemoteError> {
            let created = self.create("create_notebook", notebook)?;
            self.inner
                .lock()
                .unwrap()
                .pushed_notebooks
                .push(created.clone());
            Ok(created)
        }

        async fn update_notebook(
            &self,
            notebook: &Notebook,
            _linked_auth: Option<&AuthToken>,
        ) -> Result<Usn, RemoteError> {
            let usn = self.update("update_notebook", notebook)?;
            let mut updated = notebook.clone();
            updated.usn = Some(usn);
            self.inner.lock().unwrap().pushed_notebooks.push(updated);
            Ok(usn)
        }

        async fn create_note(
            &self,
            note: &Note,
            _linked_auth: Option<&AuthToken>,
        ) -> Result<Note, RemoteError> {
            let created = self.create("create_note", note)?;
            self.inner.lock().unwrap().pushed_notes.push(created.clone());
            Ok(created)
        }

        async fn update_note(
            &self,
            note: &Note,
            _linked_auth: Option<&AuthToken>,
        ) -> Result<Usn, RemoteError> {
            let usn = self.update("update_note", note)?;
            let mut updated = note.clone();
            updated.usn = Some(usn);
            self.inner.lock().unwrap().pushed_notes.push(updated);
            Ok(usn)
        }
    }
}
