//! The parsed HTTP request ([`Request`]) and its method table.
use std::sync::Arc;

use crate::hooks::Hook;
use crate::upgraded::Upgraded;

/// Request methods, including the push pseudo-methods synthesized from
/// WebSocket/SSE events (spec.md §3, Request).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Connect,
    Patch,
    /// Matches any method when used as a hook's registered method.
    All,
    /// A text WebSocket frame or a decoded SSE-bound message delivered.
    OnMsg,
    /// A binary WebSocket frame.
    OnBin,
    /// The peer closed a WS/SSE connection.
    OnClose,
    /// The server is shutting down with this connection still open.
    OnShutdown,
    /// A push response's pending queue has drained.
    OnEmpty,
    /// The connection hit a protocol or I/O error.
    OnError,
}

impl Method {
    /// Parses a request-line method token. Returns `None` for unknown
    /// tokens so the caller can respond 400, per spec.md §4.5 ("Method
    /// table is fixed; unknown → 400").
    pub fn parse(token: &str) -> Option<Self> {
        Some(match token {
            "GET" => Method::Get,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "HEAD" => Method::Head,
            "OPTIONS" => Method::Options,
            "CONNECT" => Method::Connect,
            "PATCH" => Method::Patch,
            _ => return None,
        })
    }

    /// Whether this method requires a `Content-Length` (spec.md §4.5:
    /// "For PUT/POST/PATCH, Content-Length is required").
    pub fn requires_content_length(self) -> bool {
        matches!(self, Method::Post | Method::Put | Method::Patch)
    }

    pub fn is_push(self) -> bool {
        matches!(
            self,
            Method::OnMsg
                | Method::OnBin
                | Method::OnClose
                | Method::OnShutdown
                | Method::OnEmpty
                | Method::OnError
        )
    }
}

/// Which upgrade, if any, the request is asking for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Upgrade {
    None,
    Ws,
    Sse,
}

/// A parsed HTTP message, or a synthesized push event.
///
/// The spec describes `Req` as three `(start, len)` slices into one
/// contiguous message buffer. We keep the ergonomics that implies (cheap,
/// GC/allocator-owned byte ranges) by storing `bytes::Bytes` slices — each
/// `Bytes::slice` is a refcounted view into the same backing allocation, so
/// `path()`/`query()`/`body()` are zero-copy the same way the spec's
/// pointer-into-buffer fields are.
pub struct Request {
    pub method: Method,
    pub upgrade: Upgrade,
    path: bytes::Bytes,
    query: bytes::Bytes,
    headers: Vec<(String, bytes::Bytes)>,
    body: bytes::Bytes,
    /// Set once the router has matched a hook for this request.
    pub hook: Option<Arc<Hook>>,
    /// Set for push requests (ON_MSG/ON_BIN/ON_CLOSE/...): the upgraded
    /// connection the event came from.
    pub upgraded: Option<Arc<Upgraded>>,
}

impl Request {
    pub fn new(
        method: Method,
        path: bytes::Bytes,
        query: bytes::Bytes,
        headers: Vec<(String, bytes::Bytes)>,
        body: bytes::Bytes,
    ) -> Self {
        Request {
            method,
            upgrade: Upgrade::None,
            path,
            query,
            headers,
            body,
            hook: None,
            upgraded: None,
        }
    }

    /// Builds a push request synthesized from a WS/SSE event (spec.md §4.6,
    /// "Push Reqs carry the Upgraded pointer").
    pub fn push(method: Method, upgraded: Arc<Upgraded>, body: bytes::Bytes) -> Self {
        Request {
            method,
            upgrade: Upgrade::None,
            path: bytes::Bytes::new(),
            query: bytes::Bytes::new(),
            headers: Vec::new(),
            body,
            hook: None,
            upgraded: Some(upgraded),
        }
    }

    pub fn path(&self) -> &str {
        std::str::from_utf8(&self.path).unwrap_or("")
    }

    pub fn query(&self) -> &str {
        std::str::from_utf8(&self.query).unwrap_or("")
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| std::str::from_utf8(v).ok())
    }

    pub fn headers(&self) -> &[(String, bytes::Bytes)] {
        &self.headers
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn method_parse_rejects_unknown_tokens() {
        assert_eq!(Method::parse("GET"), Some(Method::Get));
        assert_eq!(Method::parse("TRACE"), None);
    }

    #[test]
    fn requires_content_length_matches_spec() {
        assert!(Method::Post.requires_content_length());
        assert!(!Method::Get.requires_content_length());
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let req = Request::new(
            Method::Get,
            bytes::Bytes::from_static(b"/"),
            bytes::Bytes::new(),
            vec![("Content-Type".into(), bytes::Bytes::from_static(b"text/plain"))],
            bytes::Bytes::new(),
        );
        assert_eq!(req.header("content-type"), Some("text/plain"));
    }
}
