//! List filter flags for local-storage list requests.

use crate::entity::SyncedEntity;
use serde::{Deserialize, Serialize};
use std::ops::BitOr;

/// Filter flags recognized by local-storage list operations.
///
/// `DIRTY` selects entities with unsynchronized local edits; `NON_LOCAL`
/// selects entities that have never been synchronized (no USN yet). Flags
/// combine with `|` for union semantics; `ALL` selects everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListFilter(u8);

impl ListFilter {
    /// No filtering — every entity matches.
    pub const ALL: Self = Self(0);
    /// Entities with unsynchronized local modifications.
    pub const DIRTY: Self = Self(1);
    /// Entities never synchronized (newly created, no USN).
    pub const NON_LOCAL: Self = Self(1 << 1);

    /// Whether all of `other`'s flags are set on `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether the given entity passes this filter.
    #[must_use]
    pub fn matches<E: SyncedEntity>(self, entity: &E) -> bool {
        if self == Self::ALL {
            return true;
        }
        (self.contains(Self::DIRTY) && entity.is_dirty())
            || (self.contains(Self::NON_LOCAL) && entity.usn().is_none())
    }
}

impl BitOr for ListFilter {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl Default for ListFilter {
    fn default() -> Self {
        Self::ALL
    }
}

/// Sort key for local-storage list operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ListOrder {
    #[default]
    NoOrder,
    ByName,
    ByUpdateSequenceNumber,
}

/// Sort direction for local-storage list operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OrderDirection {
    #[default]
    Ascending,
    Descending,
}
