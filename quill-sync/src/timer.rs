//! Delayed-task queue for rate-limit retries.
//!
//! Both managers share the same retry discipline: a rate-limited remote
//! call arms a single-shot timer for the server-specified wait, and the
//! same operation is re-invoked verbatim when it fires. At most one timer
//! is live per call site; arming a site that already has one replaces it.
//! The queue is a plain fire-time priority queue owned by the core — no
//! dependence on any UI toolkit's timer identifiers.

use quill_types::Guid;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

/// The call sites that can be rate-limited and retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallSite {
    PushTags,
    PushSearches,
    PushNotebooks,
    PushNotes,
    /// Full-content fetch for one note during download merge.
    GetFullNoteData(Guid),
}

/// Handle to one scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

#[derive(Debug, PartialEq, Eq)]
struct Entry {
    fire_at: Instant,
    id: TimerId,
    site: CallSite,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.fire_at.cmp(&other.fire_at).then(self.id.cmp(&other.id))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A priority queue of single-shot retry timers, keyed by fire time.
///
/// Pure over injected `Instant`s so tests never sleep; the driver decides
/// when to poll [`DelayQueue::pop_due`].
#[derive(Debug, Default)]
pub struct DelayQueue {
    heap: BinaryHeap<Reverse<Entry>>,
    live: HashMap<CallSite, TimerId>,
    cancelled: HashSet<TimerId>,
    next_id: u64,
}

impl DelayQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a single-shot timer for the call site, replacing any timer
    /// already live for it.
    pub fn schedule(&mut self, now: Instant, after: Duration, site: CallSite) -> TimerId {
        if let Some(old) = self.live.remove(&site) {
            self.cancelled.insert(old);
        }
        self.next_id += 1;
        let id = TimerId(self.next_id);
        self.heap.push(Reverse(Entry {
            fire_at: now + after,
            id,
            site,
        }));
        self.live.insert(site, id);
        id
    }

    /// Cancels the live timer for a call site, if any.
    pub fn cancel_site(&mut self, site: CallSite) {
        if let Some(id) = self.live.remove(&site) {
            self.cancelled.insert(id);
        }
    }

    /// Cancels every outstanding timer. Used on pause, so a later resume
    /// re-derives pending work from the settled lists rather than from a
    /// stale timer firing.
    pub fn cancel_all(&mut self) {
        for id in self.live.values() {
            self.cancelled.insert(*id);
        }
        self.live.clear();
    }

    /// The earliest live fire time, if any timer is outstanding.
    #[must_use]
    pub fn next_deadline(&mut self) -> Option<Instant> {
        loop {
            let Reverse(front) = self.heap.peek()?;
            let (fire_at, id) = (front.fire_at, front.id);
            if !self.cancelled.contains(&id) {
                return Some(fire_at);
            }
            self.heap.pop();
            self.cancelled.remove(&id);
        }
    }

    /// Pops every timer due at or before `now`, in fire order.
    pub fn pop_due(&mut self, now: Instant) -> Vec<CallSite> {
        let mut due = Vec::new();
        while let Some(Reverse(front)) = self.heap.peek() {
            if front.fire_at > now {
                break;
            }
            let (id, site) = (front.id, front.site);
            self.heap.pop();
            if self.cancelled.remove(&id) {
                continue;
            }
            self.live.remove(&site);
            due.push(site);
        }
        due
    }

    /// Whether any timer is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}
