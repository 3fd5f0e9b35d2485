//! The per-connection state machine: HTTP request parsing, WebSocket frame
//! multiplexing, SSE upgrade, and the outgoing response queue (spec.md §3
//! Con, §4.4, §4.5).
//!
//! spec.md describes this as one `ready loop` thread owning every live
//! socket's readiness callbacks. In an async runtime the natural
//! realization — sanctioned by the spec's own §9 DESIGN NOTES — is one task
//! per connection, `select!`ing between "more bytes arrived",
//! "a queued response is ready to write", and "the idle deadline passed".
//! The central loop disappears into the scheduler; everything else about
//! the state machine (pipelining, the WS/SSE transition, hijack, the idle
//! timeout's soft-close) is preserved.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use crate::handler::HandlerResponse;
use crate::hooks::{HookTable, PushHandler};
use crate::metrics::ServerMetrics;
use crate::page_cache::{Lookup, PageCache};
use crate::pubsub::Pub;
use crate::queue::{self, Sender};
use crate::request::{Method, Request, Upgrade};
use crate::response::{Res, Resolved};
use crate::text::Text;
use crate::upgraded::Upgraded;
use crate::worker::Job;
use crate::ws;

const READ_CHUNK: usize = 8 * 1024;
const IDLE_TIMEOUT: Duration = Duration::from_secs(5);
const SOFT_CLOSE_TIMEOUT: Duration = Duration::from_millis(500);
const OUTBOX_CAPACITY: usize = 256;

static NEXT_CID: AtomicU64 = AtomicU64::new(1);

pub fn next_connection_id() -> u64 {
    NEXT_CID.fetch_add(1, Ordering::Relaxed)
}

/// The connection's framing mode, mirroring `Con.kind`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Kind {
    Http,
    Ws,
    Sse,
}

/// Shared, read-mostly state every connection task needs a handle to.
pub struct Shared {
    pub hooks: Arc<HookTable>,
    pub page_cache: Arc<PageCache>,
    pub worker_queue: Sender<Job>,
    pub pub_queue: Sender<Pub>,
    pub max_push_pending: i64,
    pub metrics: Arc<ServerMetrics>,
    /// Strict header-byte validation (spec.md §6 `pedantic`): rejects
    /// header names/values containing bytes outside the RFC 7230 allowed
    /// set instead of passing them through to handlers verbatim.
    pub pedantic: bool,
    /// Static files beat hooks on a GET (spec.md §6 `root_first`): when
    /// set, a GET first consults the page cache and only falls through to
    /// the hook table on a cache miss, reversing the default priority.
    pub root_first: bool,
}

/// Runs one connection to completion. `pedantic` enables strict header
/// byte validation (spec.md §6).
pub async fn run<S>(mut stream: S, cid: u64, shared: Arc<Shared>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    shared.metrics.connection_opened();

    let mut kind = Kind::Http;
    let mut read_buf = Vec::with_capacity(READ_CHUNK);
    let mut deadline = Instant::now() + IDLE_TIMEOUT;
    let mut closing = false;

    // Created lazily on the WS/SSE transition; holds the write side the
    // pub loop or a push handler uses to enqueue responses out-of-band
    // from the request/response cycle.
    let mut outbox: Option<queue::Receiver<Res>> = None;
    let mut upgraded: Option<Arc<Upgraded>> = None;

    loop {
        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);

        let mut chunk = [0u8; READ_CHUNK];
        let read_result = tokio::select! {
            biased;
            res = stream.read(&mut chunk) => Some(res),
            Some(res) = recv_outbox(&mut outbox) => {
                if !write_resolved(&mut stream, res).await {
                    break;
                }
                deadline = Instant::now() + IDLE_TIMEOUT;
                None
            }
            _ = &mut sleep => {
                if closing {
                    debug!("cid {cid}: idle timeout during soft-close, dropping");
                    break;
                }
                closing = true;
                deadline = Instant::now() + SOFT_CLOSE_TIMEOUT;
                None
            }
        };

        let n = match read_result {
            None => continue,
            Some(Ok(0)) => break,
            Some(Ok(n)) => n,
            Some(Err(e)) => {
                warn!("cid {cid}: read error: {e}");
                break;
            }
        };
        read_buf.extend_from_slice(&chunk[..n]);
        deadline = Instant::now() + IDLE_TIMEOUT;
        closing = false;

        match kind {
            Kind::Http => {
                match drive_http(&mut read_buf, cid, &shared, &mut stream).await {
                    HttpOutcome::Continue => {}
                    HttpOutcome::Upgrade(new_kind, (up, rx)) => {
                        kind = new_kind;
                        outbox = Some(rx);
                        upgraded = Some(up);
                    }
                    HttpOutcome::Close => break,
                }
            }
            Kind::Ws => {
                if !drive_ws(&mut read_buf, cid, &shared, &upgraded, &mut stream).await {
                    break;
                }
            }
            Kind::Sse => {
                // SSE connections never read further application data;
                // any bytes the client sends are simply discarded.
                read_buf.clear();
            }
        }
    }

    if let Some(up) = upgraded {
        let job = Job {
            request: Request::push(Method::OnClose, up, bytes::Bytes::new()),
            respond: None,
            head: false,
        };
        let _ = shared.worker_queue.try_push(job);
    }

    shared.metrics.connection_closed();
}

async fn recv_outbox(outbox: &mut Option<queue::Receiver<Res>>) -> Option<Option<Res>> {
    match outbox {
        Some(rx) => Some(rx.pop().await),
        None => std::future::pending().await,
    }
}

async fn write_resolved<S: AsyncWrite + Unpin>(stream: &mut S, res: Option<Res>) -> bool {
    let res = match res {
        Some(r) => r,
        None => return true,
    };
    let resolved = res.resolve().await;
    if stream.write_all(resolved.text.as_bytes()).await.is_err() {
        return false;
    }
    !resolved.close
}

enum HttpOutcome {
    Continue,
    Upgrade(Kind, (Arc<Upgraded>, queue::Receiver<Res>)),
    Close,
}

/// Parses and dispatches as many complete HTTP messages as `read_buf`
/// currently holds (spec.md §4.4: "shift any bytes beyond mlen ... resume
/// parsing (pipelining)").
async fn drive_http<S>(
    read_buf: &mut Vec<u8>,
    cid: u64,
    shared: &Arc<Shared>,
    stream: &mut S,
) -> HttpOutcome
where
    S: AsyncWrite + Unpin,
{
    loop {
        let parsed = match parse_request(read_buf, shared.pedantic) {
            Ok(Some(p)) => p,
            Ok(None) => return HttpOutcome::Continue,
            Err(status) => {
                let resp = HandlerResponse::with_body(status, crate::handler::reason_phrase(status));
                let _ = stream.write_all(resp.render(false).as_bytes()).await;
                return HttpOutcome::Close;
            }
        };

        let consumed = parsed.consumed;
        let mut request = parsed.request;
        let head = parsed.head;

        // spec.md §6 `root_first`: static files beat hooks on a GET. Serve
        // straight from the page cache before the hook table is even
        // consulted; a miss falls through to the normal hook-first path
        // below exactly as if `root_first` were unset.
        if shared.root_first && request.method == Method::Get {
            if let Lookup::Hit(text) = shared.page_cache.lookup(request.path()).await {
                shared.metrics.page_cache_hit();
                if stream.write_all(text.as_bytes()).await.is_err() {
                    return HttpOutcome::Close;
                }
                read_buf.drain(..consumed);
                let close_requested = request.header("connection")
                    .map(|v| v.eq_ignore_ascii_case("close"))
                    .unwrap_or(false)
                    || (!parsed.keep_alive
                        && !request.header("connection")
                            .map(|v| v.eq_ignore_ascii_case("keep-alive"))
                            .unwrap_or(false));
                if close_requested {
                    return HttpOutcome::Close;
                }
                continue;
            }
            shared.metrics.page_cache_miss();
        }

        if let Some(hook) = shared.hooks.matches(request.method, request.path()) {
            request.hook = Some(Arc::clone(hook));
        }

        let close_requested = request.header("connection")
            .map(|v| v.eq_ignore_ascii_case("close"))
            .unwrap_or(false);
        let keepalive_requested = request.header("connection")
            .map(|v| v.eq_ignore_ascii_case("keep-alive"))
            .unwrap_or(false);
        // spec.md §2 Open Question: an HTTP/1.0 request without an explicit
        // `Connection: keep-alive` closes by default, mirroring the
        // protocol's own default rather than treating every connection as
        // persistent.
        let close_requested = close_requested || (!parsed.keep_alive && !keepalive_requested);

        let upgrade_requested = request.upgrade;

        if request.hook.is_none() {
            if request.method == Method::Get {
                match shared.page_cache.lookup(request.path()).await {
                    Lookup::Hit(text) => {
                        shared.metrics.page_cache_hit();
                        if stream.write_all(text.as_bytes()).await.is_err() {
                            return HttpOutcome::Close;
                        }
                        read_buf.drain(..consumed);
                        if close_requested {
                            return HttpOutcome::Close;
                        }
                        continue;
                    }
                    Lookup::NotFound | Lookup::Rejected => {
                        shared.metrics.page_cache_miss();
                        if let Some(hook) = shared.hooks.not_found() {
                            request.hook = Some(Arc::clone(hook));
                        } else {
                            let resp = HandlerResponse::not_found();
                            let _ = stream.write_all(resp.render(head).as_bytes()).await;
                            return HttpOutcome::Close;
                        }
                    }
                }
            } else if let Some(hook) = shared.hooks.not_found() {
                request.hook = Some(Arc::clone(hook));
            } else {
                let resp = HandlerResponse::not_found();
                let _ = stream.write_all(resp.render(false).as_bytes()).await;
                return HttpOutcome::Close;
            }
        }

        read_buf.drain(..consumed);

        // Captured before `request` moves into the `Job`, so the worker
        // that runs the handler and the upgrade transition below agree on
        // which push handler (if any) this route opted into (spec.md
        // §4.6 item 3).
        let push_handler: Option<Arc<dyn PushHandler>> =
            request.hook.as_ref().and_then(|h| h.push.clone());

        let (res, tx) = Res::deferred();
        let job = Job { request, respond: Some(tx), head };
        if shared.worker_queue.push(job).await.is_err() {
            return HttpOutcome::Close;
        }

        let resolved = res.resolve().await;
        if stream.write_all(resolved.text.as_bytes()).await.is_err() {
            return HttpOutcome::Close;
        }

        if resolved.close || close_requested {
            return HttpOutcome::Close;
        }

        match upgrade_requested {
            Upgrade::Ws if resolved.text.as_bytes().starts_with(b"HTTP/1.1 101") => {
                let (tx, rx) = queue::bounded(OUTBOX_CAPACITY);
                let up = Arc::new(Upgraded::new(cid, tx, shared.pub_queue.clone()));
                if let Some(h) = &push_handler {
                    h.on_open(&up);
                }
                up.set_handler(push_handler);
                return HttpOutcome::Upgrade(Kind::Ws, (up, rx));
            }
            Upgrade::Sse if resolved.text.as_bytes().starts_with(b"HTTP/1.1 200") => {
                let (tx, rx) = queue::bounded(OUTBOX_CAPACITY);
                let up = Arc::new(Upgraded::new(cid, tx, shared.pub_queue.clone()));
                if let Some(h) = &push_handler {
                    h.on_open(&up);
                }
                up.set_handler(push_handler);
                return HttpOutcome::Upgrade(Kind::Sse, (up, rx));
            }
            _ => {}
        }
    }
}

struct ParsedRequest {
    request: Request,
    consumed: usize,
    head: bool,
    /// Whether this message's own HTTP version defaults to a persistent
    /// connection (HTTP/1.1) or not (HTTP/1.0), absent any explicit
    /// `Connection` header (spec.md §2 Open Question on HTTP/1.0 default).
    keep_alive: bool,
}

/// Header-name and header-value bytes `pedantic` mode rejects with 400,
/// per RFC 7230 §3.2's `field-name`/`field-vchar` grammar: header names
/// are tokens (no separators/CTLs), values are printable-or-tab.
fn header_name_is_pedantic_valid(name: &[u8]) -> bool {
    !name.is_empty() && name.iter().all(|&b| {
        b.is_ascii_alphanumeric() || matches!(b, b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*'
            | b'+' | b'-' | b'.' | b'^' | b'_' | b'`' | b'|' | b'~')
    })
}

fn header_value_is_pedantic_valid(value: &[u8]) -> bool {
    value.iter().all(|&b| b == b'\t' || (0x20..=0x7e).contains(&b) || b >= 0x80)
}

/// Parses one HTTP message out of the front of `buf` using `httparse`.
/// Returns `Ok(None)` when the headers aren't complete yet; returns
/// `Err(status)` for malformed input the caller should answer with a
/// canned error (400/411/431). In `pedantic` mode, header names/values
/// outside the RFC 7230 token/field-vchar grammar are rejected with 400
/// instead of passed through verbatim (spec.md §6 `pedantic`).
fn parse_request(buf: &[u8], pedantic: bool) -> Result<Option<ParsedRequest>, u16> {
    const MAX_HEADERS: usize = 64;
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let header_end = match req.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(_) => return Err(400),
    };

    let method_token = req.method.ok_or(400)?;
    let method = Method::parse(method_token).ok_or(400)?;
    let head = method == Method::Head;
    let path_and_query = req.path.ok_or(400)?;
    let (path, query) = match path_and_query.split_once('?') {
        Some((p, q)) => (p, q),
        None => (path_and_query, ""),
    };
    let keep_alive = req.version == Some(1);

    let mut content_length = 0usize;
    let mut upgrade = Upgrade::None;
    let mut saw_upgrade_header = false;
    let mut saw_connection_upgrade = false;
    let mut owned_headers = Vec::with_capacity(req.headers.len());

    for h in req.headers.iter() {
        if pedantic && (!header_name_is_pedantic_valid(h.name.as_bytes())
            || !header_value_is_pedantic_valid(h.value)) {
            return Err(400);
        }
        let name = h.name.to_string();
        let value = bytes::Bytes::copy_from_slice(h.value);
        if name.eq_ignore_ascii_case("content-length") {
            content_length = std::str::from_utf8(h.value).ok()
                .and_then(|v| v.parse().ok())
                .ok_or(400)?;
        } else if name.eq_ignore_ascii_case("upgrade")
            && h.value.eq_ignore_ascii_case(b"websocket") {
            saw_upgrade_header = true;
        } else if name.eq_ignore_ascii_case("connection")
            && std::str::from_utf8(h.value).unwrap_or("").to_ascii_lowercase().contains("upgrade") {
            saw_connection_upgrade = true;
        } else if name.eq_ignore_ascii_case("accept")
            && h.value.eq_ignore_ascii_case(b"text/event-stream") {
            upgrade = Upgrade::Sse;
        }
        owned_headers.push((name, value));
    }
    if saw_upgrade_header && saw_connection_upgrade {
        upgrade = Upgrade::Ws;
    }

    if method.requires_content_length() && content_length == 0
        && !owned_headers.iter().any(|(n, _)| n.eq_ignore_ascii_case("content-length")) {
        return Err(411);
    }

    let total = header_end + content_length;
    if buf.len() < total {
        return Ok(None);
    }

    let body = bytes::Bytes::copy_from_slice(&buf[header_end..total]);
    let mut request = Request::new(
        method,
        bytes::Bytes::copy_from_slice(path.as_bytes()),
        bytes::Bytes::copy_from_slice(query.as_bytes()),
        owned_headers,
        body,
    );
    request.upgrade = upgrade;

    Ok(Some(ParsedRequest { request, consumed: total, head, keep_alive }))
}

/// Reads and dispatches as many complete WebSocket frames as `read_buf`
/// holds, writing PONGs and tearing down on CLOSE (spec.md §4.5,
/// "WebSocket read").
async fn drive_ws<S>(
    read_buf: &mut Vec<u8>,
    cid: u64,
    shared: &Arc<Shared>,
    upgraded: &Option<Arc<Upgraded>>,
    stream: &mut S,
) -> bool
where
    S: AsyncWrite + Unpin,
{
    let upgraded = match upgraded {
        Some(u) => u,
        None => return false,
    };

    loop {
        match ws::decode(read_buf) {
            ws::Decoded::Incomplete => return true,
            ws::Decoded::Invalid(reason) => {
                warn!("cid {cid}: invalid ws frame: {reason}");
                let _ = stream.write_all(ws::encode_close().as_bytes()).await;
                return false;
            }
            ws::Decoded::Frame { opcode, payload, consumed } => {
                read_buf.drain(..consumed);
                match opcode {
                    ws::OpCode::Text => {
                        dispatch_push(shared, Arc::clone(upgraded), Method::OnMsg, payload).await;
                    }
                    ws::OpCode::Binary => {
                        dispatch_push(shared, Arc::clone(upgraded), Method::OnBin, payload).await;
                    }
                    ws::OpCode::Ping => {
                        if stream.write_all(ws::encode_pong(&payload).as_bytes()).await.is_err() {
                            return false;
                        }
                    }
                    ws::OpCode::Pong => {}
                    ws::OpCode::Close => {
                        let _ = stream.write_all(ws::encode_close().as_bytes()).await;
                        dispatch_push(shared, Arc::clone(upgraded), Method::OnClose, Vec::new()).await;
                        return false;
                    }
                    ws::OpCode::Continuation => unreachable!("rejected by decode"),
                }
            }
        }
    }
}

async fn dispatch_push(shared: &Arc<Shared>, upgraded: Arc<Upgraded>, method: Method, payload: Vec<u8>) {
    let job = Job {
        request: Request::push(method, upgraded, bytes::Bytes::from(payload)),
        respond: None,
        head: false,
    };
    if shared.worker_queue.try_push(job).is_err() {
        warn!("eval queue full; dropping push event");
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_request_reports_incomplete_on_partial_headers() {
        let buf = b"GET / HTTP/1.1\r\nHost: x";
        assert!(matches!(parse_request(buf, false), Ok(None)));
    }

    #[test]
    fn parse_request_rejects_unknown_method() {
        let buf = b"TRACE / HTTP/1.1\r\n\r\n";
        assert!(matches!(parse_request(buf, false), Err(400)));
    }

    #[test]
    fn parse_request_requires_content_length_on_post() {
        let buf = b"POST /x HTTP/1.1\r\nHost: a\r\n\r\n";
        assert!(matches!(parse_request(buf, false), Err(411)));
    }

    #[test]
    fn parse_request_detects_websocket_upgrade() {
        let buf = b"GET /ws HTTP/1.1\r\nHost: a\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";
        let parsed = parse_request(buf, false).unwrap().unwrap();
        assert_eq!(parsed.request.upgrade, Upgrade::Ws);
    }

    #[test]
    fn parse_request_splits_path_and_query() {
        let buf = b"GET /a/b?x=1 HTTP/1.1\r\nHost: a\r\n\r\n";
        let parsed = parse_request(buf, false).unwrap().unwrap();
        assert_eq!(parsed.request.path(), "/a/b");
        assert_eq!(parsed.request.query(), "x=1");
    }

    #[test]
    fn parse_request_waits_for_full_body() {
        let buf = b"POST /x HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\n\r\nhi";
        assert!(matches!(parse_request(buf, false), Ok(None)));
    }
}
