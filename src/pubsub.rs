//! The pub command enum and the single-consumer pub loop that mutates
//! [`SubCache`] and fans responses out to subscribers (spec.md §4.8).
//!
//! Grounded on `comms::Gate::update_data` for the fan-out shape (iterate
//! subscribers, try to send, drop ones that can't take it) and on
//! `comms::GateAgent`/`Link` for the command-enum-over-a-channel pattern
//! that lets every other task talk to a single owning task without a lock.
use std::sync::Arc;

use log::{debug, warn};

use crate::queue::Receiver;
use crate::response::{Res, Resolved};
use crate::subcache::SubCache;
use crate::text::Text;
use crate::upgraded::Upgraded;

/// A command passed through the pub queue (spec.md §3, Pub).
pub enum Pub {
    Subscribe { key: (u64, u64), upgraded: Arc<Upgraded>, subject: String },
    Unsubscribe { cid: u64, sid: Option<u64>, subject: Option<String> },
    Publish { subject: String, text: Text },
    Write { upgraded: Arc<Upgraded>, text: Text },
    Close { upgraded: Arc<Upgraded> },
}

/// Runs the pub loop until its receiving end of the pub queue is closed
/// (i.e. every `Sender<Pub>` clone — one per worker/connection — has been
/// dropped), matching spec.md §5's "the pub loop exits when pub-queue
/// drains" shutdown behavior: a closed mpsc channel only reports `None`
/// once it is both closed and empty.
pub async fn run(mut queue: Receiver<Pub>, max_push_pending: i64) {
    let mut cache = SubCache::new();
    while let Some(cmd) = queue.pop().await {
        handle(&mut cache, cmd, max_push_pending);
    }
    debug!("pub loop exiting: queue drained");
}

fn handle(cache: &mut SubCache, cmd: Pub, max_push_pending: i64) {
    match cmd {
        Pub::Subscribe { key, upgraded, subject } => {
            upgraded.add_subject(subject.clone());
            cache.subscribe(key, upgraded.clone(), subject);
            upgraded.dec_pending();
        }
        Pub::Unsubscribe { cid, sid, subject } => {
            upgraded_remove_subject(cache, cid, subject.as_deref());
            match sid {
                Some(sid) => cache.unsubscribe((cid, sid)),
                None => cache.unsubscribe_all(cid),
            }
        }
        Pub::Publish { subject, text } => {
            for upgraded in cache.matching(&subject) {
                let res = Res::Ready(Resolved::new(text.clone(), false));
                if !upgraded.try_write(res, max_push_pending) {
                    warn!("dropping publish to cid {}: back-pressure", upgraded.cid);
                }
            }
        }
        Pub::Write { upgraded, text } => {
            let res = Res::Ready(Resolved::new(text, false));
            if !upgraded.try_write(res, max_push_pending) {
                warn!("dropping write to cid {}: back-pressure", upgraded.cid);
            }
        }
        Pub::Close { upgraded } => {
            let res = Res::Ready(Resolved::new(Text::create(&[][..]), true));
            let _ = upgraded.try_write(res, 0);
            cache.unsubscribe_all(upgraded.cid);
        }
    }
}

/// Best-effort removal of a subject from its owning `Upgraded`'s own set
/// (the cache only stores the lookup index; the authoritative subject list
/// lives on the `Upgraded` itself).
fn upgraded_remove_subject(cache: &SubCache, cid: u64, subject: Option<&str>) {
    for upgraded in cache.matching_by_cid(cid) {
        upgraded.remove_subject(subject);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn upgraded(cid: u64) -> (Arc<Upgraded>, crate::queue::Receiver<Res>) {
        let (tx, rx) = crate::queue::bounded(8);
        let (pub_tx, _pub_rx) = crate::queue::bounded(8);
        (Arc::new(Upgraded::new(cid, tx, pub_tx)), rx)
    }

    #[test]
    fn subscribe_then_publish_delivers_to_matching_subscriber() {
        let mut cache = SubCache::new();
        let (up, mut rx) = upgraded(1);
        handle(&mut cache, Pub::Subscribe {
            key: (1, 1),
            upgraded: up.clone(),
            subject: "news.*".into(),
        }, 0);
        handle(&mut cache, Pub::Publish {
            subject: "news.sports".into(),
            text: Text::create(b"goal"),
        }, 0);
        let res = rx.try_pop().expect("expected a delivered response");
        match res {
            Res::Ready(r) => assert_eq!(r.text.as_bytes(), b"goal"),
            _ => panic!("expected a ready response"),
        }
    }

    #[test]
    fn publish_does_not_deliver_to_non_matching_subscriber() {
        let mut cache = SubCache::new();
        let (up, mut rx) = upgraded(1);
        handle(&mut cache, Pub::Subscribe {
            key: (1, 1),
            upgraded: up,
            subject: "news.weather".into(),
        }, 0);
        handle(&mut cache, Pub::Publish {
            subject: "news.sports".into(),
            text: Text::create(b"goal"),
        }, 0);
        assert!(rx.try_pop().is_none());
    }

    #[test]
    fn close_drops_all_subscriptions_for_the_connection() {
        let mut cache = SubCache::new();
        let (up, _rx) = upgraded(1);
        handle(&mut cache, Pub::Subscribe {
            key: (1, 1),
            upgraded: up.clone(),
            subject: "a.*".into(),
        }, 0);
        handle(&mut cache, Pub::Close { upgraded: up }, 0);
        assert!(cache.is_empty());
    }
}
