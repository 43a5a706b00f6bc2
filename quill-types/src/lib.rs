//! Shared value types for the Quill note synchronization engine.
//!
//! Everything here is a plain value: typed identifiers, the five
//! synchronized entity records, change-batch pages and list filters.
//! The sync logic itself lives in `quill-sync`.

mod chunk;
mod entity;
mod filter;
mod ids;

pub use chunk::{flatten, SyncChunk};
pub use entity::{
    EntityKind, LinkedNotebook, Note, Notebook, Resource, SavedSearch, SyncedEntity, Tag,
};
pub use filter::{ListFilter, ListOrder, OrderDirection};
pub use ids::{Guid, LocalId, Usn};
