//! The route table: an insertion-ordered list of [`Hook`]s matched linearly
//! against `(method, path)`, plus the glob matcher the router uses.
//!
//! Grounded on the teacher's `units`/`targets` tag-dispatch enums
//! (`#[serde(tag = "type")]` in `units/mod.rs`) for the shape of
//! [`HookKind`], and on `comms::Gate`'s "iterate, act, retain" style for
//! [`HookTable::matches`] — a hot-path linear scan over a small `Vec`
//! rather than a trie, matching spec.md §4.9's "linear scan in insertion
//! order" precisely.
use std::sync::Arc;

use crate::queue::Sender;
use crate::request::Method;
use crate::upgraded::Upgraded;

/// What kind of handler a [`Hook`] invokes, and the call-shape that implies.
///
/// The four application-facing kinds come straight from spec.md §4.6; `Push`
/// is the fifth, carrying no handler handle of its own since push dispatch
/// resolves through the [`crate::upgraded::Upgraded`] it's attached to
/// instead of through the hook table.
#[derive(Clone, Debug)]
pub enum HookKind {
    /// `on_request(req, res)` fills in status/headers/body directly.
    Base,
    /// Rack-style `call(env) -> (status, headers, body)`.
    Rack,
    /// Same call shape as `Base`; semantic contract is create/read/update/delete.
    Wab,
    /// A native function with no boxing beyond the `Arc<dyn Fn>` itself.
    Func,
}

/// A request handler: boxed once at registration time and invoked by
/// whichever worker pops the matching request.
pub type Handler = Arc<dyn Fn(&crate::request::Request) -> crate::handler::HandlerResponse + Send + Sync>;

/// The PUSH handler contract (spec.md §6, "Handler contracts", *PUSH*):
/// `on_open`/`on_message`/`on_close`/`on_drained`/`on_error`/`on_shutdown`
/// "as available". Every method defaults to a no-op so a hook that only
/// cares about messages doesn't have to stub out the rest.
pub trait PushHandler: Send + Sync {
    fn on_open(&self, _up: &Arc<Upgraded>) {}
    fn on_message(&self, _up: &Arc<Upgraded>, _payload: &[u8], _binary: bool) {}
    fn on_close(&self, _up: &Arc<Upgraded>) {}
    fn on_drained(&self, _up: &Arc<Upgraded>) {}
    fn on_error(&self, _up: &Arc<Upgraded>, _message: &str) {}
    fn on_shutdown(&self, _up: &Arc<Upgraded>) {}
}

/// One entry in the hook table (spec.md §3, Hook).
pub struct Hook {
    pub method: Method,
    pub pattern: String,
    pub kind: HookKind,
    pub handler: Handler,
    /// The worker queue this hook's requests are dispatched to. `None`
    /// means "the shared pool", matching spec.md's "target-queue" being
    /// optional per hook.
    pub target_queue: Option<Sender<crate::worker::Job>>,
    /// Set when this hook opts a successful WS/SSE upgrade into push
    /// dispatch (spec.md §4.6 item 3: "the handler registered a push
    /// handler in the environment"). Carried from the matched [`Hook`]
    /// onto the resulting [`Upgraded`](crate::upgraded::Upgraded).
    pub push: Option<Arc<dyn PushHandler>>,
}

impl Hook {
    pub fn new(method: Method, pattern: impl Into<String>, kind: HookKind, handler: Handler) -> Self {
        Hook { method, pattern: pattern.into(), kind, handler, target_queue: None, push: None }
    }

    pub fn with_target_queue(mut self, queue: Sender<crate::worker::Job>) -> Self {
        self.target_queue = Some(queue);
        self
    }

    pub fn with_push(mut self, push: Arc<dyn PushHandler>) -> Self {
        self.push = Some(push);
        self
    }
}

impl std::fmt::Debug for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Hook")
            .field("method", &self.method)
            .field("pattern", &self.pattern)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Matches a route pattern against a path per spec.md §4.9's glob rules:
/// literal bytes match byte-for-byte; a lone `*` matches one non-empty,
/// `/`-free token; a trailing `**` matches the remainder, including `/`.
/// A trailing `/` on the request path is ignored.
pub fn glob_match(pattern: &str, path: &str) -> bool {
    let path = path.strip_suffix('/').unwrap_or(path);
    match_segments(pattern.as_bytes(), path.as_bytes())
}

fn match_segments(pattern: &[u8], path: &[u8]) -> bool {
    if pattern == b"**" {
        return true;
    }
    if let Some(rest) = pattern.strip_prefix(b"**") {
        // A trailing `**` must consume everything remaining; it is only
        // meaningful at the end of a pattern in this grammar.
        return rest.is_empty();
    }
    if let Some(&b'*') = pattern.first() {
        let pattern_rest = &pattern[1..];
        // `*` must consume at least one byte and never crosses a `/`.
        let mut i = 0;
        while i < path.len() && path[i] != b'/' {
            i += 1;
            if match_segments(pattern_rest, &path[i..]) {
                return true;
            }
        }
        return false;
    }
    match (pattern.first(), path.first()) {
        (None, None) => true,
        (None, Some(_)) | (Some(_), None) => false,
        (Some(p), Some(c)) if p == c => match_segments(&pattern[1..], &path[1..]),
        _ => false,
    }
}

/// The ordered route table.
///
/// Construction-time only mutation (`push`) plus a read-mostly `matches`
/// scan mirrors the spec's "kept as an insertion-ordered list; iteration is
/// linear at match time" — there's no benefit to a concurrent map here since
/// hooks are registered once at startup before the server starts accepting.
#[derive(Default)]
pub struct HookTable {
    hooks: Vec<Arc<Hook>>,
    not_found: Option<Arc<Hook>>,
}

impl HookTable {
    pub fn new() -> Self {
        HookTable::default()
    }

    pub fn register(&mut self, hook: Hook) {
        self.hooks.push(Arc::new(hook));
    }

    pub fn register_not_found(&mut self, hook: Hook) {
        self.not_found = Some(Arc::new(hook));
    }

    pub fn not_found(&self) -> Option<&Arc<Hook>> {
        self.not_found.as_ref()
    }

    /// Returns the first hook whose method and pattern match, per spec.md
    /// §4.9: "method equals hook.method (or hook.method is ALL) ... the
    /// first match wins."
    pub fn matches(&self, method: Method, path: &str) -> Option<&Arc<Hook>> {
        self.hooks.iter().find(|hook| {
            (hook.method == method || hook.method == Method::All)
                && glob_match(&hook.pattern, path)
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn literal_pattern_matches_byte_for_byte() {
        assert!(glob_match("/status", "/status"));
        assert!(!glob_match("/status", "/statuses"));
    }

    #[test]
    fn single_star_matches_one_bounded_token() {
        assert!(glob_match("/users/*", "/users/42"));
        assert!(!glob_match("/users/*", "/users/42/posts"));
        assert!(!glob_match("/users/*", "/users/"));
    }

    #[test]
    fn double_star_matches_remainder_including_slashes() {
        assert!(glob_match("/static/**", "/static/css/app.css"));
        assert!(glob_match("/static/**", "/static/a"));
    }

    #[test]
    fn trailing_slash_on_request_path_is_ignored() {
        assert!(glob_match("/users/*", "/users/42/"));
    }

    #[test]
    fn first_registered_match_wins() {
        let mut table = HookTable::new();
        table.register(Hook::new(
            Method::Get, "/users/*", HookKind::Base,
            Arc::new(|_| crate::handler::HandlerResponse::not_found()),
        ));
        table.register(Hook::new(
            Method::Get, "/users/admin", HookKind::Base,
            Arc::new(|_| crate::handler::HandlerResponse::not_found()),
        ));
        let hit = table.matches(Method::Get, "/users/admin").unwrap();
        assert_eq!(hit.pattern, "/users/*");
    }

    #[test]
    fn all_method_hooks_match_any_method() {
        let mut table = HookTable::new();
        table.register(Hook::new(
            Method::All, "/ping", HookKind::Base,
            Arc::new(|_| crate::handler::HandlerResponse::not_found()),
        ));
        assert!(table.matches(Method::Post, "/ping").is_some());
    }
}
