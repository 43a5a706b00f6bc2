//! Tests for change-batch pages and cross-chunk flattening.

use pretty_assertions::assert_eq;
use quill_types::{Guid, SyncChunk, SyncedEntity, Tag, Usn};

fn synced_tag(name: &str, guid: Guid, usn: i32) -> Tag {
    let mut tag = Tag::new(name);
    tag.guid = Some(guid);
    tag.usn = Some(Usn::new(usn));
    tag.dirty = false;
    tag
}

// ── pagination markers ──────────────────────────────────────────

#[test]
fn chunk_is_last_when_high_usn_reaches_account_count() {
    assert!(SyncChunk::new(Usn::new(10), Usn::new(10)).is_last());
    assert!(!SyncChunk::new(Usn::new(5), Usn::new(10)).is_last());
}

// ── flattening ──────────────────────────────────────────────────

#[test]
fn flatten_concatenates_across_chunks() {
    let mut first = SyncChunk::new(Usn::new(2), Usn::new(4));
    first.tags.push(synced_tag("a", Guid::new(), 1));
    let mut second = SyncChunk::new(Usn::new(4), Usn::new(4));
    second.tags.push(synced_tag("b", Guid::new(), 3));

    let tags = SyncChunk::flatten_tags(&[first, second]);
    assert_eq!(tags.len(), 2);
    assert_eq!(tags[0].name, "a");
    assert_eq!(tags[1].name, "b");
}

#[test]
fn later_occurrence_of_a_guid_replaces_earlier() {
    let guid = Guid::new();
    let mut first = SyncChunk::new(Usn::new(2), Usn::new(4));
    first.tags.push(synced_tag("old name", guid, 1));
    let mut second = SyncChunk::new(Usn::new(4), Usn::new(4));
    second.tags.push(synced_tag("new name", guid, 4));

    let tags = SyncChunk::flatten_tags(&[first, second]);
    assert_eq!(tags.len(), 1);
    assert_eq!(tags[0].name, "new name");
    assert_eq!(tags[0].usn(), Some(Usn::new(4)));
}

#[test]
fn expunge_removes_elements_seen_earlier() {
    let doomed = Guid::new();
    let survivor = Guid::new();
    let mut first = SyncChunk::new(Usn::new(2), Usn::new(4));
    first.tags.push(synced_tag("doomed", doomed, 1));
    first.tags.push(synced_tag("survivor", survivor, 2));
    let mut second = SyncChunk::new(Usn::new(4), Usn::new(4));
    second.expunged_tags.push(doomed);

    let tags = SyncChunk::flatten_tags(&[first, second]);
    assert_eq!(tags.len(), 1);
    assert_eq!(tags[0].guid(), Some(survivor));
}

#[test]
fn expunge_of_an_unseen_guid_is_a_no_op() {
    let mut chunk = SyncChunk::new(Usn::new(1), Usn::new(1));
    chunk.tags.push(synced_tag("kept", Guid::new(), 1));
    chunk.expunged_tags.push(Guid::new());

    let tags = SyncChunk::flatten_tags(&[chunk]);
    assert_eq!(tags.len(), 1);
}

#[test]
fn flatten_keeps_kinds_separate() {
    let mut chunk = SyncChunk::new(Usn::new(3), Usn::new(3));
    chunk.tags.push(synced_tag("tag", Guid::new(), 1));
    let notes = SyncChunk::flatten_notes(std::slice::from_ref(&chunk));
    assert!(notes.is_empty());
    assert_eq!(SyncChunk::flatten_tags(&[chunk]).len(), 1);
}
