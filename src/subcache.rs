//! SubCache: the subject-subscription index the pub loop owns exclusively
//! (spec.md §3 Sub/SubCache, §4.8).
//!
//! The spec buckets `Sub` nodes into a fixed 1024-entry chained hash table
//! keyed on `cid^sid` specifically so a single-threaded pub loop can walk
//! it lock-free. Since this crate gives the pub loop its own exclusive
//! owning task rather than letting other threads reach into the table
//! directly (mirroring the teacher's rule in `comms.rs` that only the
//! `Gate`'s own task mutates its `Slab<UpdateSender>`), a plain `HashMap`
//! keyed the same way gets the same single-writer property without the
//! fixed bucket count, which only mattered for the original's manual
//! allocator.
use std::collections::HashMap;
use std::sync::Arc;

use crate::upgraded::Upgraded;

/// `(cid, sid)` — unique per subscription.
pub type SubKey = (u64, u64);

struct Sub {
    upgraded: Arc<Upgraded>,
    subject: String,
}

/// Matches a published subject against a subscribed pattern using NATS-style
/// tokenization: tokens are separated by `.`; `*` matches exactly one
/// token; a trailing `>` matches all remaining tokens; anything else
/// requires exact token equality (spec.md §4.8, "Subject matcher").
pub fn subject_match(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some(">"), None) => return false,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (Some(_), _) => return false,
            (None, None) => return true,
            (None, Some(_)) => return false,
        }
    }
}

/// The pub loop's exclusive subscription index.
#[derive(Default)]
pub struct SubCache {
    subs: HashMap<SubKey, Sub>,
}

impl SubCache {
    pub fn new() -> Self {
        SubCache::default()
    }

    /// Records a subscription. Mirrors spec.md §4.8's `subscribe` command:
    /// the caller is responsible for also calling
    /// [`Upgraded::add_subject`]/`dec_pending` — `SubCache` only owns the
    /// lookup index, not the `Upgraded`'s own subject set.
    pub fn subscribe(&mut self, key: SubKey, upgraded: Arc<Upgraded>, subject: String) {
        self.subs.insert(key, Sub { upgraded, subject });
    }

    /// Removes one subscription (`Some(sid)` inside the key) or every
    /// subscription belonging to `cid` (`subject` filter applied by the
    /// caller beforehand via [`SubCache::unsubscribe_all`]).
    pub fn unsubscribe(&mut self, key: SubKey) {
        self.subs.remove(&key);
    }

    /// Removes every subscription for a given connection id, e.g. on
    /// `unsubscribe(up, NULL)` or connection teardown.
    pub fn unsubscribe_all(&mut self, cid: u64) {
        self.subs.retain(|k, _| k.0 != cid);
    }

    /// Returns every upgraded connection whose subscribed pattern matches
    /// `subject`, deduplicated by connection id so a connection subscribed
    /// to two overlapping patterns receives the publish once — the pub
    /// loop enqueues at most one `Res` per `Con` regardless of how many of
    /// its subjects matched.
    pub fn matching(&self, subject: &str) -> Vec<Arc<Upgraded>> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for sub in self.subs.values() {
            if subject_match(&sub.subject, subject) && seen.insert(sub.upgraded.cid) {
                out.push(Arc::clone(&sub.upgraded));
            }
        }
        out
    }

    /// Returns every distinct `Upgraded` currently subscribed under `cid`,
    /// used to update an `Upgraded`'s own subject set on unsubscribe
    /// without the caller needing to track it separately.
    pub fn matching_by_cid(&self, cid: u64) -> Vec<Arc<Upgraded>> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for (key, sub) in self.subs.iter() {
            if key.0 == cid && seen.insert(sub.upgraded.cid) {
                out.push(Arc::clone(&sub.upgraded));
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exact_subjects_require_equality() {
        assert!(subject_match("a.b.c", "a.b.c"));
        assert!(!subject_match("a.b.c", "a.b.d"));
        assert!(!subject_match("a.b.c", "a.b"));
    }

    #[test]
    fn star_matches_exactly_one_token() {
        assert!(subject_match("a.*.c", "a.b.c"));
        assert!(!subject_match("a.*.c", "a.b.x.c"));
    }

    #[test]
    fn greater_than_matches_all_remaining_tokens() {
        assert!(subject_match("a.>", "a.b.c.d"));
        assert!(subject_match("a.>", "a.b"));
        assert!(!subject_match("a.>", "a"));
    }

    fn upgraded(cid: u64) -> Arc<Upgraded> {
        let (tx, _rx) = crate::queue::bounded(8);
        let (pub_tx, _pub_rx) = crate::queue::bounded(8);
        Arc::new(Upgraded::new(cid, tx, pub_tx))
    }

    #[test]
    fn matching_dedupes_by_connection_id() {
        let mut cache = SubCache::new();
        let up = upgraded(1);
        cache.subscribe((1, 1), Arc::clone(&up), "a.*".into());
        cache.subscribe((1, 2), Arc::clone(&up), "a.b".into());
        let hits = cache.matching("a.b");
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn unsubscribe_all_removes_every_key_for_a_connection() {
        let mut cache = SubCache::new();
        let up = upgraded(1);
        cache.subscribe((1, 1), Arc::clone(&up), "a.*".into());
        cache.subscribe((1, 2), Arc::clone(&up), "b.*".into());
        cache.unsubscribe_all(1);
        assert!(cache.is_empty());
    }
}
