//! Owns every long-lived piece of server state and starts the tasks that
//! realize the spec's ready loop, worker pool, and pub loop on top of a
//! tokio runtime (spec.md §0 "Architecture", §9 "Global mutable state").
//!
//! Grounded on the teacher's own `Manager`: there, `Manager::load` builds up
//! units/targets/gates from config before `Manager::spawn` sets everything
//! running. Here there's no unit/target graph — [`Manager`] instead builds a
//! [`HookTable`] and a [`PageCache`] from [`Config`], then [`Manager::start`]
//! spawns the worker pool, the pub loop, and one accept loop per configured
//! bind (times `worker_count` `SO_REUSEPORT` replicas), mirroring the
//! teacher's "build first, spawn once" shape exactly.
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use daemonbase::error::ExitError;
use log::{error, info};
use tokio::sync::watch;

use crate::bind;
use crate::config::Config;
use crate::conn::Shared;
use crate::hooks::{Handler, Hook, HookKind, HookTable, PushHandler};
use crate::http;
use crate::metrics::{self, ServerMetrics};
use crate::page_cache::PageCache;
use crate::pubsub::{self, Pub};
use crate::queue;
use crate::request::Method;
use crate::worker;

/// How long the listen loops get to stop accepting before the pub/eval
/// queues are given up on during shutdown (spec.md §5 "Cancellation": the
/// ready loop drains briefly, then workers are given a hard deadline).
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(2);

const EVAL_QUEUE_CAPACITY: usize = 1024;
const PUB_QUEUE_CAPACITY: usize = 1024;

/// Builds up routes and static-file configuration, then starts the server
/// (spec.md §6, "Hook API": `register`/`register_not_found`/`add_mime`/
/// `path_group`/`set_root`/`start`/`shutdown`).
pub struct Manager {
    config: Config,
    hooks: HookTable,
    page_cache: Arc<PageCache>,
    metrics: metrics::Collection,
    server_metrics: Arc<ServerMetrics>,
    http_resources: http::Resources,
}

impl Manager {
    /// Builds a `Manager` from a loaded [`Config`], pre-populating the page
    /// cache from `config.root`/`config.groups`/`config.mime_types` the way
    /// the teacher's `Manager::load` pre-populates units from config.
    pub fn new(config: Config) -> Self {
        let page_cache = Arc::new(PageCache::new());
        if let Some(root) = &config.root {
            let root: PathBuf = root.clone().into();
            page_cache.set_root(root);
        }
        for group in &config.groups {
            let dirs: Vec<PathBuf> = group.dirs.iter().cloned().map(Into::into).collect();
            page_cache.path_group(group.prefix.clone(), dirs);
        }
        for (ext, content_type) in &config.mime_types {
            page_cache.add_mime(ext, content_type.clone());
        }

        Manager {
            config,
            hooks: HookTable::new(),
            page_cache,
            metrics: metrics::Collection::default(),
            server_metrics: ServerMetrics::new(),
            http_resources: http::Resources::default(),
        }
    }

    /// Registers a request hook (spec.md §6 `register`).
    pub fn register(&mut self, method: Method, pattern: impl Into<String>, kind: HookKind, handler: Handler) {
        self.hooks.register(Hook::new(method, pattern, kind, handler));
    }

    /// Registers a hook that also opts successful WS/SSE upgrades on its
    /// route into push dispatch (spec.md §4.6 item 3).
    pub fn register_push(
        &mut self,
        method: Method,
        pattern: impl Into<String>,
        kind: HookKind,
        handler: Handler,
        push: Arc<dyn PushHandler>,
    ) {
        self.hooks.register(Hook::new(method, pattern, kind, handler).with_push(push));
    }

    /// Registers the fallback hook invoked when nothing else — no matching
    /// hook, no cached file — answers a request (spec.md §6
    /// `register_not_found`).
    pub fn register_not_found(&mut self, method: Method, pattern: impl Into<String>, kind: HookKind, handler: Handler) {
        self.hooks.register_not_found(Hook::new(method, pattern, kind, handler));
    }

    pub fn set_root(&self, path: impl Into<PathBuf>) {
        self.page_cache.set_root(path);
    }

    pub fn path_group(&self, prefix: impl Into<String>, dirs: Vec<PathBuf>) {
        self.page_cache.path_group(prefix, dirs);
    }

    pub fn add_mime(&self, ext: &str, content_type: impl Into<String>) {
        self.page_cache.add_mime(ext, content_type);
    }

    pub fn metrics(&self) -> metrics::Collection {
        self.metrics.clone()
    }

    pub fn http_resources(&self) -> http::Resources {
        self.http_resources.clone()
    }

    /// Starts every long-lived task on `runtime` and returns a handle that
    /// can later be used to shut the server down (spec.md §6 `start`).
    ///
    /// `worker_count` listener replicas are bound per configured bind URL,
    /// each sharing the listen socket via `SO_REUSEPORT` — the async
    /// realization of spec.md §5's "optional worker processes... each an
    /// independent replica". `thread_count` worker tasks share one eval
    /// queue behind a mutex (`worker::run_pooled`), realizing the spec's
    /// `Queue` `multi_pop` mode.
    pub fn start(mut self, runtime: &tokio::runtime::Runtime) -> Result<RunningServer, ExitError> {
        let server_metrics: Arc<dyn crate::metrics::Source> = self.server_metrics.clone();
        self.metrics.register(Arc::from("corehttpd"), Arc::downgrade(&server_metrics));

        let hooks = Arc::new(std::mem::take(&mut self.hooks));

        let (eval_tx, eval_rx) = queue::bounded::<worker::Job>(EVAL_QUEUE_CAPACITY);
        let (pub_tx, pub_rx) = queue::bounded::<Pub>(PUB_QUEUE_CAPACITY);

        let shared = Arc::new(Shared {
            hooks,
            page_cache: Arc::clone(&self.page_cache),
            worker_queue: eval_tx.clone(),
            pub_queue: pub_tx.clone(),
            max_push_pending: self.config.max_push_pending,
            metrics: Arc::clone(&self.server_metrics),
            pedantic: self.config.pedantic,
            root_first: self.config.root_first,
        });

        let worker_count = self.config.thread_count.max(1);
        let eval_rx = Arc::new(tokio::sync::Mutex::new(eval_rx));
        let mut worker_handles = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let eval_rx = Arc::clone(&eval_rx);
            let pub_tx = pub_tx.clone();
            worker_handles.push(runtime.spawn(worker::run_pooled(eval_rx, pub_tx)));
        }

        let pub_handle = runtime.spawn(pubsub::run(pub_rx, self.config.max_push_pending));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut listen_handles = Vec::new();
        let replicas = self.config.worker_count.max(1);
        for (url, kind) in self.config.binds() {
            for _ in 0..replicas {
                let bind_config = bind::parse_listen_url(url, kind)
                    .map_err(|e| { error!("bad listen url {url}: {e}"); ExitError::default() })?;
                let listener = bind::bind(&bind_config)
                    .map_err(|e| { error!("failed to bind {url}: {e}"); ExitError::default() })?;
                let shared = Arc::clone(&shared);
                let shutdown_rx = shutdown_rx.clone();
                listen_handles.push(runtime.spawn(crate::listen::run(bind_config, listener, shared, shutdown_rx)));
            }
        }

        if let Some(admin) = &self.config.http {
            admin.run(self.metrics.clone(), self.http_resources.clone(), runtime)?;
        }

        info!("corehttpd started: {} bind(s), {worker_count} worker(s), {replicas} listener replica(s) each",
            listen_handles.len());

        Ok(RunningServer {
            shutdown_tx,
            listen_handles,
            worker_handles,
            pub_handle,
            eval_tx,
            pub_tx,
        })
    }
}

/// A handle to a running server, returned by [`Manager::start`].
pub struct RunningServer {
    shutdown_tx: watch::Sender<bool>,
    listen_handles: Vec<tokio::task::JoinHandle<()>>,
    worker_handles: Vec<tokio::task::JoinHandle<()>>,
    pub_handle: tokio::task::JoinHandle<()>,
    /// Kept alive so the eval/pub queues don't close out from under
    /// in-flight connections the instant `shutdown` is called; dropped at
    /// the end of `shutdown` once the listen loops have stopped accepting.
    eval_tx: queue::Sender<worker::Job>,
    pub_tx: queue::Sender<Pub>,
}

impl RunningServer {
    /// Stops accepting new connections immediately, then waits up to
    /// [`SHUTDOWN_DRAIN`] for in-flight connections to finish and the
    /// worker/pub loops to drain (spec.md §5 "Cancellation").
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.listen_handles {
            let _ = handle.await;
        }

        drop(self.eval_tx);
        drop(self.pub_tx);

        let drain = async {
            for handle in self.worker_handles {
                let _ = handle.await;
            }
            let _ = self.pub_handle.await;
        };
        if tokio::time::timeout(SHUTDOWN_DRAIN, drain).await.is_err() {
            error!("shutdown: worker/pub loops did not drain within {:?}", SHUTDOWN_DRAIN);
        }
    }
}
