//! The worker pool: a fixed number of tasks popping jobs from the eval
//! queue and producing response [`Text`] values (spec.md §4.6).
//!
//! Grounded on the teacher's unit/target tasks in `manager.rs`, which are
//! likewise "a fixed set of long-running tasks each pulling off one shared
//! channel" — the same shape, generalized from RTR data processing to HTTP
//! hook dispatch. `N` workers are plain `tokio::spawn`ed tasks rather than
//! OS threads (spec.md §5 allows either: "N worker threads ... may be 0
//! meaning the caller's thread runs the worker loop" — here N=0 degrades
//! to running one job inline rather than spawning nothing, since there is
//! no separate "caller thread" in an async runtime).
use std::sync::Arc;

use log::error;
use tokio::sync::oneshot;

use crate::handler::HandlerResponse;
use crate::hooks::HookKind;
use crate::pubsub::Pub;
use crate::queue::{Receiver, Sender};
use crate::request::{Method, Request};
use crate::response::Resolved;
use crate::text::Text;
use crate::ws;

/// One unit of work dispatched to a worker: a parsed request plus the
/// sender side of the oneshot the connection task is already blocked on.
///
/// Push requests (spec.md §4.6: "Push Reqs carry the Upgraded pointer") set
/// `respond` to `None` since "no response is queued for these".
pub struct Job {
    pub request: Request,
    pub respond: Option<oneshot::Sender<Resolved>>,
    pub head: bool,
}

/// Runs one worker loop until the eval queue is closed and drained.
pub async fn run(mut jobs: Receiver<Job>, pub_queue: Sender<Pub>) {
    while let Some(job) = jobs.pop().await {
        handle_job(job, &pub_queue).await;
    }
}

/// Runs one worker popping off an eval queue shared by the rest of the
/// pool (spec.md §4.6: "a fixed number of workers pop Reqs from the
/// eval-queue"). The spec's `Queue` has a `multi_pop` flag for exactly
/// this case; here that's a `Mutex` around the single-consumer channel
/// end rather than a hand-rolled lock-free pop, since only one worker
/// can be mid-`pop` at a time regardless.
pub async fn run_pooled(jobs: Arc<tokio::sync::Mutex<Receiver<Job>>>, pub_queue: Sender<Pub>) {
    loop {
        let job = { jobs.lock().await.pop().await };
        match job {
            Some(job) => handle_job(job, &pub_queue).await,
            None => return,
        }
    }
}

async fn handle_job(job: Job, pub_queue: &Sender<Pub>) {
    let Job { request, respond, head } = job;

    if request.method.is_push() {
        dispatch_push(request, pub_queue).await;
        return;
    }

    let hook = match &request.hook {
        Some(hook) => Arc::clone(hook),
        None => {
            if let Some(respond) = respond {
                let _ = respond.send(Resolved::new(HandlerResponse::not_found().render(head), false));
            }
            return;
        }
    };

    let response = match hook.kind {
        HookKind::Base | HookKind::Wab | HookKind::Rack | HookKind::Func => {
            run_handler_catching_panics(&hook, &request)
        }
    };

    let (text, close) = finish_response(&request, response, head);
    if let Some(respond) = respond {
        let _ = respond.send(Resolved::new(text, close));
    }
}

/// Calls into the handler, turning a panic into the canned 500 spec.md
/// §4.6 describes ("Errors escaping a handler produce ... and set
/// Res.close=true").
fn run_handler_catching_panics(hook: &crate::hooks::Hook, request: &Request) -> HandlerResponse {
    let handler = Arc::clone(&hook.handler);
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(request)));
    match outcome {
        Ok(resp) => resp,
        Err(panic) => {
            let message = panic_message(&panic);
            error!("handler panicked: {message}");
            HandlerResponse::with_body(500, format!("CoreError: {message}"))
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Renders a handler's response into wire bytes, upgrading the connection
/// to WS/SSE when the handler opted in (spec.md §4.6 items 3–4).
fn finish_response(request: &Request, response: HandlerResponse, head: bool) -> (Text, bool) {
    use crate::request::Upgrade;

    if response.status < 300 {
        match request.upgrade {
            Upgrade::Ws => {
                if let Some(key) = request.header("Sec-WebSocket-Key") {
                    let protocol = request.header("Sec-WebSocket-Protocol");
                    return (Text::from(ws::handshake_response(key, protocol)), false);
                }
            }
            Upgrade::Sse => {
                let preamble = "HTTP/1.1 200 OK\r\n\
                     Content-Type: text/event-stream\r\n\
                     Cache-Control: no-cache\r\n\
                     Connection: keep-alive\r\n\r\nretry: 5\n\n";
                return (Text::from(preamble.to_string()), false);
            }
            Upgrade::None => {}
        }
    }

    let close = response.status >= 500;
    (response.render(head), close)
}

/// Invokes the handler method matching a push request's pseudo-method. No
/// response is queued; `ON_CLOSE` additionally emits a `pub_close`
/// (spec.md §4.6: "ON_CLOSE emits a pub_close into the pub queue").
async fn dispatch_push(request: Request, pub_queue: &Sender<Pub>) {
    let upgraded = match &request.upgraded {
        Some(u) => Arc::clone(u),
        None => return,
    };
    let handler = upgraded.handler();

    match request.method {
        Method::OnMsg => {
            if let Some(h) = &handler {
                h.on_message(&upgraded, request.body(), false);
            }
        }
        Method::OnBin => {
            if let Some(h) = &handler {
                h.on_message(&upgraded, request.body(), true);
            }
        }
        Method::OnClose => {
            if let Some(h) = &handler {
                h.on_close(&upgraded);
            }
            let _ = pub_queue.push(Pub::Close { upgraded }).await;
        }
        Method::OnShutdown => {
            if let Some(h) = &handler {
                h.on_shutdown(&upgraded);
            }
        }
        Method::OnEmpty => {
            if let Some(h) = &handler {
                h.on_drained(&upgraded);
            }
        }
        Method::OnError => {
            if let Some(h) = &handler {
                let message = String::from_utf8_lossy(request.body());
                h.on_error(&upgraded, &message);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::request::Upgrade;

    #[test]
    fn finish_response_switches_to_ws_handshake_on_opt_in() {
        let mut req = Request::new(
            Method::Get,
            bytes::Bytes::from_static(b"/ws"),
            bytes::Bytes::new(),
            vec![("Sec-WebSocket-Key".into(), bytes::Bytes::from_static(b"dGhlIHNhbXBsZSBub25jZQ=="))],
            bytes::Bytes::new(),
        );
        req.upgrade = Upgrade::Ws;
        let (text, close) = finish_response(&req, HandlerResponse::new(200), false);
        assert!(String::from_utf8_lossy(text.as_bytes()).contains("101 Switching Protocols"));
        assert!(!close);
    }

    #[test]
    fn finish_response_leaves_plain_responses_alone() {
        let req = Request::new(
            Method::Get,
            bytes::Bytes::from_static(b"/"),
            bytes::Bytes::new(),
            Vec::new(),
            bytes::Bytes::new(),
        );
        let (text, close) = finish_response(&req, HandlerResponse::with_body(200, "hi"), false);
        assert!(String::from_utf8_lossy(text.as_bytes()).starts_with("HTTP/1.1 200 OK"));
        assert!(!close);
    }

    #[test]
    fn server_errors_close_the_connection() {
        let req = Request::new(
            Method::Get,
            bytes::Bytes::from_static(b"/"),
            bytes::Bytes::new(),
            Vec::new(),
            bytes::Bytes::new(),
        );
        let (_, close) = finish_response(&req, HandlerResponse::with_body(500, "boom"), false);
        assert!(close);
    }
}
