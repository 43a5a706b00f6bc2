//! Tests for entity records and the shared entity capability.

use pretty_assertions::assert_eq;
use quill_types::{
    EntityKind, Guid, LinkedNotebook, LocalId, ListFilter, Note, Notebook, SavedSearch,
    SyncedEntity, Tag, Usn,
};

// ── construction defaults ───────────────────────────────────────

#[test]
fn new_tag_is_dirty_and_unsynchronized() {
    let tag = Tag::new("inbox");
    assert!(tag.is_dirty());
    assert_eq!(tag.guid(), None);
    assert_eq!(tag.usn(), None);
    assert_eq!(tag.display_name(), "inbox");
}

#[test]
fn new_note_has_no_notebook_or_content() {
    let note = Note::new("draft");
    assert!(note.is_dirty());
    assert_eq!(note.notebook_guid, None);
    assert_eq!(note.content, None);
    assert!(note.resources.is_empty());
}

#[test]
fn new_linked_notebook_is_clean() {
    let linked = LinkedNotebook::new("shared project");
    assert!(!linked.is_dirty());
    assert_eq!(linked.display_name(), "shared project");
}

#[test]
fn local_ids_are_unique() {
    assert_ne!(Tag::new("a").local_id(), Tag::new("a").local_id());
}

// ── trait accessors ─────────────────────────────────────────────

#[test]
fn set_and_get_sync_metadata() {
    let mut search = SavedSearch::new("todo", "tag:todo");
    let guid = Guid::new();
    search.set_guid(Some(guid));
    search.set_usn(Some(Usn::new(12)));
    search.set_dirty(false);
    assert_eq!(search.guid(), Some(guid));
    assert_eq!(search.usn(), Some(Usn::new(12)));
    assert!(!search.is_dirty());
}

#[test]
fn display_name_maps_to_note_title() {
    let mut note = Note::new("old");
    note.set_display_name("new".to_string());
    assert_eq!(note.title, "new");
    assert_eq!(note.display_name(), "new");
}

#[test]
fn linked_notebook_guid_defaults_to_none_for_searches() {
    let search = SavedSearch::new("q", "query");
    assert_eq!(search.linked_notebook_guid(), None);
}

#[test]
fn linked_notebook_guid_surfaces_for_partitioned_kinds() {
    let partition = Guid::new();
    let mut notebook = Notebook::new("shared");
    notebook.linked_notebook_guid = Some(partition);
    assert_eq!(notebook.linked_notebook_guid(), Some(partition));
}

// ── entity kinds ────────────────────────────────────────────────

#[test]
fn kind_indexes_are_dense_and_distinct() {
    let mut seen = [false; 5];
    for kind in EntityKind::ALL {
        let idx = kind.index();
        assert!(idx < 5);
        assert!(!seen[idx], "duplicate index for {kind}");
        seen[idx] = true;
    }
}

#[test]
fn kind_constants_match_records() {
    assert_eq!(Tag::KIND, EntityKind::Tag);
    assert_eq!(SavedSearch::KIND, EntityKind::SavedSearch);
    assert_eq!(Notebook::KIND, EntityKind::Notebook);
    assert_eq!(Note::KIND, EntityKind::Note);
    assert_eq!(LinkedNotebook::KIND, EntityKind::LinkedNotebook);
}

// ── identifiers ─────────────────────────────────────────────────

#[test]
fn guid_round_trips_through_display_and_parse() {
    let guid = Guid::new();
    let parsed = Guid::parse(&guid.to_string()).unwrap();
    assert_eq!(guid, parsed);
}

#[test]
fn guid_serializes_transparently() {
    let guid = Guid::new();
    let json = serde_json::to_string(&guid).unwrap();
    assert_eq!(json, format!("\"{guid}\""));
}

#[test]
fn usn_next_increments() {
    assert_eq!(Usn::new(41).next(), Usn::new(42));
    assert!(Usn::new(42) > Usn::new(41));
}

#[test]
fn usn_serializes_as_plain_integer() {
    let json = serde_json::to_string(&Usn::new(7)).unwrap();
    assert_eq!(json, "7");
}

#[test]
fn local_id_round_trips_through_from_str() {
    let id = LocalId::new();
    let parsed: LocalId = id.to_string().parse().unwrap();
    assert_eq!(id, parsed);
}

// ── list filters ────────────────────────────────────────────────

#[test]
fn all_filter_matches_everything() {
    let mut tag = Tag::new("t");
    tag.set_dirty(false);
    tag.set_usn(Some(Usn::new(1)));
    assert!(ListFilter::ALL.matches(&tag));
}

#[test]
fn dirty_filter_selects_only_dirty() {
    let dirty = Tag::new("d");
    let mut clean = Tag::new("c");
    clean.set_dirty(false);
    clean.set_usn(Some(Usn::new(1)));
    assert!(ListFilter::DIRTY.matches(&dirty));
    assert!(!ListFilter::DIRTY.matches(&clean));
}

#[test]
fn non_local_filter_selects_never_synchronized() {
    let mut fresh = Tag::new("f");
    fresh.set_dirty(false);
    let mut synced = Tag::new("s");
    synced.set_dirty(false);
    synced.set_usn(Some(Usn::new(3)));
    assert!(ListFilter::NON_LOCAL.matches(&fresh));
    assert!(!ListFilter::NON_LOCAL.matches(&synced));
}

#[test]
fn combined_filter_is_a_union() {
    let filter = ListFilter::DIRTY | ListFilter::NON_LOCAL;
    let dirty_synced = {
        let mut t = Tag::new("a");
        t.set_usn(Some(Usn::new(1)));
        t
    };
    let clean_fresh = {
        let mut t = Tag::new("b");
        t.set_dirty(false);
        t
    };
    let clean_synced = {
        let mut t = Tag::new("c");
        t.set_dirty(false);
        t.set_usn(Some(Usn::new(2)));
        t
    };
    assert!(filter.matches(&dirty_synced));
    assert!(filter.matches(&clean_fresh));
    assert!(!filter.matches(&clean_synced));
}
