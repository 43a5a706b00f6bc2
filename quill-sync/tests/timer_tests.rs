//! Tests for the retry timer queue.

use quill_sync::{CallSite, DelayQueue};
use quill_types::Guid;
use std::time::Duration;
use tokio::time::Instant;

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

// ── scheduling ──────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn nothing_due_before_the_deadline() {
    let mut queue = DelayQueue::new();
    let now = Instant::now();
    queue.schedule(now, secs(30), CallSite::PushTags);

    assert!(queue.pop_due(now + secs(29)).is_empty());
    assert_eq!(queue.pop_due(now + secs(30)), vec![CallSite::PushTags]);
    assert!(queue.is_empty());
}

#[tokio::test(start_paused = true)]
async fn due_timers_pop_in_fire_order() {
    let mut queue = DelayQueue::new();
    let now = Instant::now();
    queue.schedule(now, secs(20), CallSite::PushNotes);
    queue.schedule(now, secs(10), CallSite::PushTags);

    assert_eq!(
        queue.pop_due(now + secs(30)),
        vec![CallSite::PushTags, CallSite::PushNotes]
    );
}

#[tokio::test(start_paused = true)]
async fn next_deadline_tracks_the_earliest_live_timer() {
    let mut queue = DelayQueue::new();
    let now = Instant::now();
    assert_eq!(queue.next_deadline(), None);

    queue.schedule(now, secs(20), CallSite::PushNotes);
    queue.schedule(now, secs(10), CallSite::PushTags);
    assert_eq!(queue.next_deadline(), Some(now + secs(10)));
}

// ── one live timer per call site ────────────────────────────────

#[tokio::test(start_paused = true)]
async fn rescheduling_a_site_replaces_its_timer() {
    let mut queue = DelayQueue::new();
    let now = Instant::now();
    queue.schedule(now, secs(10), CallSite::PushTags);
    queue.schedule(now, secs(60), CallSite::PushTags);

    // The first timer's deadline passes without firing.
    assert!(queue.pop_due(now + secs(10)).is_empty());
    assert_eq!(queue.pop_due(now + secs(60)), vec![CallSite::PushTags]);
}

#[tokio::test(start_paused = true)]
async fn per_note_fetch_sites_are_independent() {
    let mut queue = DelayQueue::new();
    let now = Instant::now();
    let a = Guid::new();
    let b = Guid::new();
    queue.schedule(now, secs(10), CallSite::GetFullNoteData(a));
    queue.schedule(now, secs(10), CallSite::GetFullNoteData(b));

    let due = queue.pop_due(now + secs(10));
    assert_eq!(due.len(), 2);
    assert!(due.contains(&CallSite::GetFullNoteData(a)));
    assert!(due.contains(&CallSite::GetFullNoteData(b)));
}

// ── cancellation ────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn cancelled_site_never_fires() {
    let mut queue = DelayQueue::new();
    let now = Instant::now();
    queue.schedule(now, secs(10), CallSite::PushTags);
    queue.cancel_site(CallSite::PushTags);

    assert!(queue.is_empty());
    assert!(queue.pop_due(now + secs(60)).is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancel_all_clears_every_live_timer() {
    let mut queue = DelayQueue::new();
    let now = Instant::now();
    queue.schedule(now, secs(10), CallSite::PushTags);
    queue.schedule(now, secs(20), CallSite::PushNotes);
    queue.cancel_all();

    assert!(queue.is_empty());
    assert_eq!(queue.next_deadline(), None);
    assert!(queue.pop_due(now + secs(60)).is_empty());
}

#[tokio::test(start_paused = true)]
async fn next_deadline_skips_cancelled_entries() {
    let mut queue = DelayQueue::new();
    let now = Instant::now();
    queue.schedule(now, secs(10), CallSite::PushTags);
    queue.schedule(now, secs(20), CallSite::PushNotes);
    queue.cancel_site(CallSite::PushTags);

    assert_eq!(queue.next_deadline(), Some(now + secs(20)));
}
