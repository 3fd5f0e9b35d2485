//! The outbound response slot attached to a connection's write queue.
//!
//! The spec's `Res` is a node in a per-`Con` singly-linked FIFO whose
//! `message` field starts `NULL` and is atomically published by a worker
//! once the handler has run; the ready loop observes "message != NULL" as
//! "ready to send" and otherwise treats the Con as blocked on that slot,
//! which is exactly what gives same-connection responses their ordering
//! guarantee (§5 "Ordering").
//!
//! The direct translation of "an atomic pointer a worker publishes once and
//! a reader observes" is a Rust one-shot channel: [`oneshot::Receiver`]
//! resolves exactly once, and `.await`ing it blocks the connection's write
//! task on precisely the slot the spec says it must block on, with no
//! spinning and no explicit atomics required. This is the realization
//! DESIGN NOTES §9 calls out directly: "Res becomes a receive-once channel
//! carrying the Text; the reader selects between 'socket writable' and
//! 'next Res ready'."
use tokio::sync::oneshot;

use crate::text::Text;

/// What a connection does for framing, decided by the Con's current kind.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnKind {
    Http,
    Ws,
    Sse,
}

/// The resolved contents of a response once its producer is done with it.
#[derive(Debug)]
pub struct Resolved {
    pub text: Text,
    /// Drop the connection after this response is fully written.
    pub close: bool,
}

impl Resolved {
    pub fn new(text: Text, close: bool) -> Self {
        Resolved { text, close }
    }
}

/// One entry in a connection's outbound queue.
///
/// `Ready` is used for responses the connection task can build itself with
/// no worker round-trip (canned 400/404/411/431 errors, the page cache hit
/// path). `Deferred` is used for anything dispatched to a hook: the
/// connection task creates the channel, keeps the receiver in its own
/// queue (preserving arrival order) and hands the sender to the worker via
/// the matching [`crate::request::Request`].
#[derive(Debug)]
pub enum Res {
    Ready(Resolved),
    Deferred(oneshot::Receiver<Resolved>),
}

impl Res {
    /// Creates a deferred slot, returning the queue entry and the sender
    /// side a worker (or push handler) will eventually resolve.
    pub fn deferred() -> (Res, oneshot::Sender<Resolved>) {
        let (tx, rx) = oneshot::channel();
        (Res::Deferred(rx), tx)
    }

    /// Waits for this entry to resolve. `Ready` resolves immediately;
    /// `Deferred` resolves once its sender is used or dropped. A dropped
    /// sender (a worker panicked, or the task was cancelled) degrades to a
    /// canned 500 rather than hanging the connection forever.
    pub async fn resolve(self) -> Resolved {
        match self {
            Res::Ready(r) => r,
            Res::Deferred(rx) => rx.await.unwrap_or_else(|_| Resolved {
                text: Text::create(canned_500().as_bytes()),
                close: true,
            }),
        }
    }
}

fn canned_500() -> String {
    let body = "CoreError: worker terminated without a response";
    format!(
        "HTTP/1.1 500 Internal Server Error\r\n\
         Content-Length: {}\r\n\r\n{}",
        body.len(),
        body
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn ready_resolves_immediately() {
        let res = Res::Ready(Resolved::new(Text::create(b"hi"), false));
        let resolved = res.resolve().await;
        assert_eq!(resolved.text.as_bytes(), b"hi");
        assert!(!resolved.close);
    }

    #[tokio::test]
    async fn deferred_resolves_once_sender_is_used() {
        let (res, tx) = Res::deferred();
        tx.send(Resolved::new(Text::create(b"ok"), true)).unwrap();
        let resolved = res.resolve().await;
        assert_eq!(resolved.text.as_bytes(), b"ok");
        assert!(resolved.close);
    }

    #[tokio::test]
    async fn dropped_sender_degrades_to_canned_500() {
        let (res, tx) = Res::deferred();
        drop(tx);
        let resolved = res.resolve().await;
        assert!(resolved.close);
        assert!(resolved.text.as_bytes().starts_with(b"HTTP/1.1 500"));
    }
}
