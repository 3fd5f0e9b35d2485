//! The builtin extension-to-MIME-type table used by the page cache.
use std::collections::HashMap;
use std::sync::RwLock;

const BUILTIN: &[(&str, &str)] = &[
    ("html", "text/html"),
    ("htm", "text/html"),
    ("css", "text/css"),
    ("js", "text/javascript"),
    ("mjs", "text/javascript"),
    ("json", "application/json"),
    ("txt", "text/plain"),
    ("md", "text/markdown"),
    ("xml", "application/xml"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("svg", "image/svg+xml"),
    ("ico", "image/x-icon"),
    ("webp", "image/webp"),
    ("woff", "font/woff"),
    ("woff2", "font/woff2"),
    ("ttf", "font/ttf"),
    ("wasm", "application/wasm"),
    ("pdf", "application/pdf"),
    ("zip", "application/zip"),
    ("mp4", "video/mp4"),
    ("mp3", "audio/mpeg"),
];

/// The default fallback content type for files whose extension isn't
/// registered.
pub const DEFAULT: &str = "application/octet-stream";

/// A mutable extension → MIME type table.
///
/// Seeded from [`BUILTIN`]; hosts can add or override entries via
/// [`MimeTable::set`] (the spec's `mime_set(ext, type)`). Reads vastly
/// outnumber writes (one lookup per cache miss vs. a handful of calls at
/// startup), so a `RwLock<HashMap<..>>` is the right tool rather than the
/// lock-free `ArcSwap` used for the page cache's own entries.
#[derive(Debug)]
pub struct MimeTable {
    table: RwLock<HashMap<String, &'static str>>,
    overrides: RwLock<HashMap<String, String>>,
}

impl Default for MimeTable {
    fn default() -> Self {
        let table = BUILTIN.iter()
            .map(|(ext, ty)| (ext.to_string(), *ty))
            .collect();
        MimeTable {
            table: RwLock::new(table),
            overrides: RwLock::new(HashMap::new()),
        }
    }
}

impl MimeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or overrides the content type for an extension.
    pub fn set(&self, ext: &str, content_type: impl Into<String>) {
        self.overrides.write().unwrap()
            .insert(ext.to_ascii_lowercase(), content_type.into());
    }

    /// Looks up the content type for a file path by its extension.
    pub fn lookup(&self, path: &str) -> String {
        let ext = match path.rsplit_once('.') {
            Some((_, ext)) => ext.to_ascii_lowercase(),
            None => return DEFAULT.to_string(),
        };
        if let Some(ty) = self.overrides.read().unwrap().get(&ext) {
            return ty.clone();
        }
        self.table.read().unwrap().get(&ext).copied()
            .unwrap_or(DEFAULT).to_string()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn looks_up_known_extension() {
        let t = MimeTable::new();
        assert_eq!(t.lookup("/index.html"), "text/html");
    }

    #[test]
    fn unknown_extension_falls_back_to_default() {
        let t = MimeTable::new();
        assert_eq!(t.lookup("/file.unknownext"), DEFAULT);
    }

    #[test]
    fn set_overrides_builtin() {
        let t = MimeTable::new();
        t.set("html", "application/xhtml+xml");
        assert_eq!(t.lookup("/index.html"), "application/xhtml+xml");
    }
}
