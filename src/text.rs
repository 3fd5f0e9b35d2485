//! Shared, append-extendable byte buffers for wire payloads.
//!
//! Every outbound message — a cached static page, a worker's response body,
//! a WebSocket frame, an SSE event — ends up as a [`Text`]. The type is a
//! thin, cheaply-clonable wrapper around [`bytes::Bytes`]: cloning shares the
//! same backing allocation the way the spec's reference-counted Text does,
//! and [`Text::append`] grows by the same `old + old/2` policy the spec
//! describes, handing back a value the caller reassigns.
use bytes::{Bytes, BytesMut};

/// An immutable, reference-counted byte buffer.
///
/// `Text` is `Clone` and clones are cheap (an atomic refcount bump on the
/// underlying `Bytes`, per the crate's own implementation) — this is the
/// natural Rust realization of the spec's `{len, alen, refcount, bytes[]}`
/// struct with explicit `ref`/`release`: there is nothing to call, the
/// refcount is managed for us and the buffer is freed when the last clone
/// drops.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Text(Bytes);

impl Text {
    /// Creates a `Text` by copying the given bytes.
    pub fn create(bytes: &[u8]) -> Self {
        Text(Bytes::copy_from_slice(bytes))
    }

    /// Returns an empty `Text` with at least `cap` bytes of reserved
    /// capacity, ready to be grown with [`Builder`].
    pub fn allocate(cap: usize) -> Builder {
        Builder(BytesMut::with_capacity(cap))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the bytes starting at `cursor`, for the write path's partial
    /// sends.
    pub fn remaining_from(&self, cursor: usize) -> &[u8] {
        &self.0[cursor.min(self.0.len())..]
    }
}

impl From<Vec<u8>> for Text {
    fn from(v: Vec<u8>) -> Self {
        Text(Bytes::from(v))
    }
}

impl From<String> for Text {
    fn from(v: String) -> Self {
        Text(Bytes::from(v.into_bytes()))
    }
}

impl From<&'static [u8]> for Text {
    fn from(v: &'static [u8]) -> Self {
        Text(Bytes::from_static(v))
    }
}

impl From<Bytes> for Text {
    fn from(v: Bytes) -> Self {
        Text(v)
    }
}

impl AsRef<[u8]> for Text {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A growable buffer under construction.
///
/// Mirrors the spec's distinction between a shared, immutable `Text` and the
/// mutable builder used while assembling one: `append` here can freely
/// reallocate (growing by `old + old/2` whenever the current capacity would
/// overflow) because a `Builder` is never shared across threads — the spec's
/// "callers must not share a Text they intend to mutate" rule is enforced by
/// the type system instead of by convention.
pub struct Builder(BytesMut);

impl Builder {
    pub fn append(&mut self, bytes: &[u8]) -> &mut Self {
        let needed = self.0.len() + bytes.len();
        if needed > self.0.capacity() {
            let mut grown = self.0.capacity() + self.0.capacity() / 2;
            if grown < needed {
                grown = needed;
            }
            self.0.reserve(grown - self.0.capacity());
        }
        self.0.extend_from_slice(bytes);
        self
    }

    pub fn prepend(self, bytes: &[u8]) -> Self {
        let mut out = BytesMut::with_capacity(bytes.len() + self.0.len());
        out.extend_from_slice(bytes);
        out.extend_from_slice(&self.0);
        Builder(out)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn finish(self) -> Text {
        Text(self.0.freeze())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn append_grows_and_keeps_content() {
        let mut b = Text::allocate(4);
        b.append(b"hel").append(b"lo, world");
        assert_eq!(b.finish().as_bytes(), b"hello, world");
    }

    #[test]
    fn clone_shares_storage() {
        let a = Text::create(b"abc");
        let b = a.clone();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn prepend_adds_a_prefix() {
        let b = Text::allocate(4).append(b"world").prepend(b"hello ");
        assert_eq!(b.finish().as_bytes(), b"hello world");
    }

    #[test]
    fn remaining_from_tracks_write_cursor() {
        let t = Text::create(b"0123456789");
        assert_eq!(t.remaining_from(4), b"456789");
        assert_eq!(t.remaining_from(10), b"");
    }
}
