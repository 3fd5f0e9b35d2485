//! Lifecycle of a WS/SSE connection once it has left plain HTTP (spec.md
//! §3, Upgraded).
//!
//! The spec's `Upgraded` is a manually refcounted node in a doubly-linked
//! global list, visited by the pub loop under a mutex, with a cyclic
//! Con↔Upgraded pointer pair that cleanup must unwind carefully ("cleanup
//! drops exactly one of them, the other is cleared when refcount reaches
//! zero"). `Arc` plus a `Weak` back-pointer gets the same lifecycle for
//! free: the global subscription list and the connection task both hold an
//! `Arc<Upgraded>`; when the last one drops, the object is gone without a
//! hand-rolled refcount. `pending` stays an explicit atomic counter because
//! it isn't a lifetime count — it is back-pressure bookkeeping that
//! `SubCache::publish`/`write` must inspect without taking any lock at all
//! (spec.md §4.8, "Rate limit").
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use arc_swap::ArcSwapOption;

use crate::hooks::PushHandler;
use crate::pubsub::Pub;
use crate::queue::Sender;
use crate::response::Res;
use crate::text::Text;

/// One subscribable pattern held by an upgraded connection. Stored as
/// owned strings since subjects are few per connection and rarely change
/// after the initial subscribe burst.
pub type Subject = String;

/// The write-side handle a pub loop or push dispatcher uses to deliver a
/// [`Res`] onto the connection that owns this `Upgraded`, without reaching
/// into connection-task internals.
pub struct Upgraded {
    pub cid: u64,
    subjects: RwLock<Vec<Subject>>,
    pending: AtomicI64,
    outbox: Sender<Res>,
    /// The handle back into the pub loop, so a `PushHandler` can subscribe,
    /// unsubscribe, or publish in response to an incoming frame without the
    /// loop exposing `SubCache` itself to application code (spec.md §4.8).
    pub_queue: Sender<Pub>,
    /// The PUSH handler attached at upgrade time (spec.md §4.6 item 3). An
    /// `ArcSwapOption` rather than a plain `RwLock<Option<..>>` since it's
    /// written exactly once, at upgrade, then read on every subsequent
    /// frame/publish from whichever worker task handles it.
    handler: ArcSwapOption<dyn PushHandler>,
}

impl Upgraded {
    pub fn new(cid: u64, outbox: Sender<Res>, pub_queue: Sender<Pub>) -> Self {
        Upgraded {
            cid,
            subjects: RwLock::new(Vec::new()),
            pending: AtomicI64::new(0),
            outbox,
            pub_queue,
            handler: ArcSwapOption::empty(),
        }
    }

    /// Attaches (or clears) the PUSH handler for this connection. Called
    /// once, at the HTTP→WS/SSE upgrade transition in `conn.rs`.
    pub fn set_handler(&self, handler: Option<Arc<dyn PushHandler>>) {
        self.handler.store(handler);
    }

    pub fn handler(&self) -> Option<Arc<dyn PushHandler>> {
        self.handler.load_full()
    }

    /// Adds a subject if it isn't already present (spec.md §4.8:
    /// "add the subject to Upgraded.subjects (dedup by string equality)").
    pub fn add_subject(&self, subject: Subject) {
        let mut subjects = self.subjects.write().unwrap();
        if !subjects.iter().any(|s| *s == subject) {
            subjects.push(subject);
        }
    }

    /// Removes a single subject, or every subject when `subject` is `None`
    /// (spec.md §4.8: "for NULL remove all").
    pub fn remove_subject(&self, subject: Option<&str>) {
        let mut subjects = self.subjects.write().unwrap();
        match subject {
            Some(s) => subjects.retain(|existing| existing != s),
            None => subjects.clear(),
        }
    }

    pub fn subjects(&self) -> Vec<Subject> {
        self.subjects.read().unwrap().clone()
    }

    pub fn pending(&self) -> i64 {
        self.pending.load(Ordering::Acquire)
    }

    pub fn inc_pending(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    pub fn dec_pending(&self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }

    /// Enqueues a response directly on this connection, subject to
    /// `max_push_pending` back-pressure (spec.md §4.8, "Rate limit").
    /// Returns `false` without enqueueing when the cap is hit, exactly the
    /// "the caller observes this as back-pressure" contract.
    pub fn try_write(&self, res: Res, max_push_pending: i64) -> bool {
        if max_push_pending > 0 && self.pending() >= max_push_pending {
            return false;
        }
        match self.outbox.try_push(res) {
            Ok(()) => {
                self.inc_pending();
                true
            }
            Err(_) => false,
        }
    }

    /// Subscribes this connection to `subject` (spec.md §4.8 `pub_sub`).
    /// Counted against `pending` the same as a direct write, since a
    /// subscribe that never reaches the pub loop (queue full/closed) must
    /// not leave the counter incremented forever.
    pub fn subscribe(self: &Arc<Self>, sid: u64, subject: impl Into<String>) {
        self.inc_pending();
        let subject = subject.into();
        if self
            .pub_queue
            .try_push(Pub::Subscribe { key: (self.cid, sid), upgraded: Arc::clone(self), subject })
            .is_err()
        {
            self.dec_pending();
        }
    }

    /// Unsubscribes one subscription (`sid`/`subject` given) or all of this
    /// connection's subscriptions (both `None`) (spec.md §4.8 `pub_unsub`).
    pub fn unsubscribe(&self, sid: Option<u64>, subject: Option<String>) {
        let _ = self.pub_queue.try_push(Pub::Unsubscribe { cid: self.cid, sid, subject });
    }

    /// Publishes `text` to every subscriber of `subject` (spec.md §4.8
    /// `pub_publish`).
    pub fn publish(&self, subject: impl Into<String>, text: Text) {
        let _ = self.pub_queue.try_push(Pub::Publish { subject: subject.into(), text });
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::text::Text;

    fn upgraded() -> Upgraded {
        let (tx, _rx) = crate::queue::bounded(8);
        let (pub_tx, _pub_rx) = crate::queue::bounded(8);
        Upgraded::new(1, tx, pub_tx)
    }

    #[test]
    fn add_subject_dedupes_by_equality() {
        let up = upgraded();
        up.add_subject("a.b".into());
        up.add_subject("a.b".into());
        assert_eq!(up.subjects(), vec!["a.b".to_string()]);
    }

    #[test]
    fn remove_subject_none_clears_all() {
        let up = upgraded();
        up.add_subject("a.b".into());
        up.add_subject("c.d".into());
        up.remove_subject(None);
        assert!(up.subjects().is_empty());
    }

    #[test]
    fn try_write_refuses_once_pending_hits_the_cap() {
        let up = upgraded();
        let res = || Res::Ready(crate::response::Resolved::new(Text::create(b"x"), false));
        assert!(up.try_write(res(), 1));
        assert!(!up.try_write(res(), 1));
        assert_eq!(up.pending(), 1);
    }

    #[test]
    fn try_write_is_unbounded_when_cap_is_zero() {
        let up = upgraded();
        let res = || Res::Ready(crate::response::Resolved::new(Text::create(b"x"), false));
        for _ in 0..5 {
            assert!(up.try_write(res(), 0));
        }
    }
}
