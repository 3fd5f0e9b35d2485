//! Configuration.
//!
//! Configuration is loaded from a TOML file, mirroring the teacher's
//! `Config`/command-line-overlay split but generalized to this crate's own
//! options record (spec.md §6 "Configuration"). Paths are stored as
//! `daemonbase::config::ConfigPath`, which resolves relative paths against
//! the directory the config file lives in the same way the teacher's units
//! resolve `identity`/`files` paths.
use std::path::Path;

use clap::Parser;
use daemonbase::config::ConfigPath;
use daemonbase::error::{ExitError, Failed};
use log::error;
use serde::Deserialize;

use crate::http;
use crate::log::{LogArgs, LogConfig};
use crate::response::ConnKind;

//------------ Args -----------------------------------------------------------

/// Command line arguments.
#[derive(Parser, Debug)]
#[command(name = "corehttpd", version, about = "An HTTP/1.1 server with WebSocket and SSE fan-out")]
pub struct Args {
    /// Path to the config file.
    #[arg(short, long, value_name = "PATH")]
    pub config: String,

    #[command(flatten)]
    pub log: LogArgs,
}

//------------ Config ---------------------------------------------------------

/// The full, resolved configuration for a run of the server.
#[derive(Clone, Deserialize)]
pub struct Config {
    /// Listen URLs, e.g. `"http://127.0.0.1:8080"` or `"unix:///tmp/x.sock"`.
    #[serde(default = "default_bind")]
    pub bind: Vec<String>,

    /// Worker thread count (spec.md §6 `thread_count`), 0 meaning the
    /// caller's own thread runs the worker loop inline.
    #[serde(default = "default_thread_count")]
    pub thread_count: usize,

    /// Listener replicas per configured bind, sharing the listen socket via
    /// `SO_REUSEPORT` (spec.md §5: "Optional worker processes may be forked
    /// pre-accept"). 1 means a single accept loop per bind.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Per-connection push queue cap; 0 means unbounded (spec.md §6
    /// `max_push_pending`).
    #[serde(default)]
    pub max_push_pending: i64,

    /// Static files beat hooks on a GET (spec.md §6 `root_first`).
    #[serde(default)]
    pub root_first: bool,

    /// Strict header-byte validation (spec.md §6 `pedantic`).
    #[serde(default)]
    pub pedantic: bool,

    /// Document root for the page cache.
    #[serde(default)]
    pub root: Option<ConfigPath>,

    /// Named path groups (spec.md §3 Group/Dir).
    #[serde(default)]
    pub groups: Vec<GroupConfig>,

    /// Extra MIME type overrides, `extension -> content-type`.
    #[serde(default)]
    pub mime_types: Vec<(String, String)>,

    /// The ambient admin/metrics HTTP surface.
    #[serde(default)]
    pub http: Option<http::Server>,

    /// Logging configuration.
    #[serde(default)]
    pub log: LogConfig,
}

fn default_bind() -> Vec<String> {
    vec!["http://127.0.0.1:8080".into()]
}

fn default_thread_count() -> usize {
    4
}

fn default_worker_count() -> usize {
    1
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind: default_bind(),
            thread_count: default_thread_count(),
            worker_count: default_worker_count(),
            max_push_pending: 0,
            root_first: false,
            pedantic: false,
            root: None,
            groups: Vec::new(),
            mime_types: Vec::new(),
            http: None,
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Loads and parses the config file at `path`.
    pub fn from_file(path: &Path) -> Result<Self, ExitError> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            error!("Failed to read config file '{}': {}", path.display(), err);
            ExitError::default()
        })?;
        toml::from_str(&text).map_err(|err| {
            error!("Failed to parse config file '{}': {}", path.display(), err);
            ExitError::default()
        })
    }

    /// Applies command-line overrides (currently only logging) on top of
    /// the values loaded from the config file.
    pub fn apply_args(&mut self, args: &Args, cur_dir: &Path) -> Result<(), Failed> {
        self.log.update_with_args(&args.log, cur_dir)
    }

    /// The list of binds as `(url, kind)` pairs, all starting life as
    /// `ConnKind::Http` — upgrades to WS/SSE happen per-request, not
    /// per-bind.
    pub fn binds(&self) -> impl Iterator<Item = (&str, ConnKind)> {
        self.bind.iter().map(|u| (u.as_str(), ConnKind::Http))
    }
}

//------------ GroupConfig -----------------------------------------------------

/// One named path group: a URL prefix mapped to an ordered list of
/// directories to search (spec.md §3 Group/Dir, §4.9's `path_group`).
#[derive(Clone, Deserialize)]
pub struct GroupConfig {
    pub prefix: String,
    pub dirs: Vec<ConfigPath>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.thread_count, 4);
        assert_eq!(cfg.worker_count, 1);
        assert_eq!(cfg.max_push_pending, 0);
        assert!(!cfg.root_first);
        assert!(!cfg.pedantic);
    }

    #[test]
    fn parses_minimal_toml() {
        let toml = r#"
            bind = ["http://127.0.0.1:9000"]
            thread_count = 8
        "#;
        let cfg: Config = toml::from_str(toml).unwrap();
        assert_eq!(cfg.bind, vec!["http://127.0.0.1:9000".to_string()]);
        assert_eq!(cfg.thread_count, 8);
    }

    #[test]
    fn parses_groups() {
        let toml = r#"
            [[groups]]
            prefix = "/assets"
            dirs = ["/var/www/assets"]
        "#;
        let cfg: Config = toml::from_str(toml).unwrap();
        assert_eq!(cfg.groups.len(), 1);
        assert_eq!(cfg.groups[0].prefix, "/assets");
    }
}
