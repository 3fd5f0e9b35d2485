//! The response value a hook handler produces, independent of which
//! [`crate::hooks::HookKind`] invoked it.
//!
//! spec.md §4.6 describes two call shapes — BASE/WAB fill in a preallocated
//! response object, RACK-style returns a `(status, headers, body)` tuple —
//! but both resolve to the same wire shape once the worker is done with
//! them. `HandlerResponse` is that common target, the way the teacher's
//! `ResponseBuilder` (`src/http.rs`) is the common target for its own
//! several response-construction call sites.
use crate::text::Text;

/// Status codes that must not carry `Content-Length` or `Content-Type`
/// (spec.md §4.6, item 2).
pub const NO_BODY_HEADERS: &[u16] = &[100, 101, 102, 204, 205, 304];

#[derive(Clone, Debug)]
pub struct HandlerResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HandlerResponse {
    pub fn new(status: u16) -> Self {
        HandlerResponse { status, headers: Vec::new(), body: Vec::new() }
    }

    pub fn with_body(status: u16, body: impl Into<Vec<u8>>) -> Self {
        HandlerResponse { status, headers: Vec::new(), body: body.into() }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// The canned 404 used when no hook and no cached file matches (spec.md
    /// §8 scenario 2): empty body, explicit close, since there's nothing
    /// left in the route table for this connection to stay open for.
    pub fn not_found() -> Self {
        HandlerResponse::new(404).header("Connection", "Close")
    }

    /// Renders the status line, headers, and `Content-Length`/`Content-Type`
    /// framing into one wire-ready [`Text`], dropping any `Content-Length`
    /// the handler supplied (spec.md §4.6: "filtered headers (drop
    /// Content-Length from the returned set; server computes it)").
    ///
    /// `head` suppresses the body bytes while still computing
    /// `Content-Length` over them, per spec.md §4.6 item: "On HEAD, body
    /// length is 0 but Content-Length is still computed over the body."
    pub fn render(&self, head: bool) -> Text {
        let reason = reason_phrase(self.status);
        let suppress_length = NO_BODY_HEADERS.contains(&self.status);

        let mut head_text = format!("HTTP/1.1 {} {}\r\n", self.status, reason);
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            head_text.push_str(name);
            head_text.push_str(": ");
            head_text.push_str(value);
            head_text.push_str("\r\n");
        }
        if !suppress_length {
            head_text.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        }
        head_text.push_str("\r\n");

        let body: &[u8] = if head { &[] } else { &self.body };
        let mut builder = Text::allocate(head_text.len() + body.len());
        builder.append(head_text.as_bytes());
        builder.append(body);
        builder.finish()
    }
}

/// Looks up the reason phrase for a status code from the fixed ~70-entry
/// table spec.md §6 describes, falling back to a generic phrase for codes
/// the table doesn't carry so a handler can still return an arbitrary
/// status without the server refusing to serialize it.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        102 => "Processing",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        203 => "Non-Authoritative Information",
        204 => "No Content",
        205 => "Reset Content",
        206 => "Partial Content",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        417 => "Expectation Failed",
        422 => "Unprocessable Entity",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn render_computes_content_length_and_drops_handler_supplied_one() {
        let resp = HandlerResponse::with_body(200, "hi")
            .header("Content-Length", "999")
            .header("X-Test", "a");
        let text = resp.render(false);
        let rendered = String::from_utf8_lossy(text.as_bytes()).into_owned();
        assert!(rendered.contains("Content-Length: 2\r\n"));
        assert!(!rendered.contains("999"));
        assert!(rendered.ends_with("hi"));
    }

    #[test]
    fn head_suppresses_body_but_keeps_length() {
        let resp = HandlerResponse::with_body(200, "hello");
        let text = resp.render(true);
        let rendered = String::from_utf8_lossy(text.as_bytes()).into_owned();
        assert!(rendered.contains("Content-Length: 5\r\n"));
        assert!(rendered.ends_with("\r\n\r\n"));
    }

    #[test]
    fn no_body_statuses_omit_content_length() {
        let resp = HandlerResponse::new(204);
        let text = resp.render(false);
        let rendered = String::from_utf8_lossy(text.as_bytes()).into_owned();
        assert!(!rendered.contains("Content-Length"));
    }
}
