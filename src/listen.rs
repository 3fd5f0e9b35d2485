//! The listen loop: accepts on every configured [`Bind`](crate::bind::Bind)
//! and spawns a connection task per accepted socket (spec.md §4.3).
//!
//! Grounded on `units/rtr.rs`'s `Tcp::run` / `spawn_listener`, which binds a
//! std listener, converts it with `TcpListener::from_std`, then loops
//! `accept()` + `tokio::spawn` — the same shape used here, generalized to
//! also accept on Unix-domain binds and to apply the per-connection
//! `TCP_NODELAY`/`SO_KEEPALIVE` spec.md §4.3 requires before the
//! connection task ever sees the socket.
use std::sync::Arc;

use log::{error, info};
use socket2::TcpKeepalive;

use crate::bind::{BindConfig, Listener};
use crate::conn::{self, Shared};
use crate::response::ConnKind;

/// Runs the accept loop for one bind until told to stop. Each accepted
/// connection is assigned the next connection id and spawned as its own
/// task; the listen loop itself never touches connection state again
/// (spec.md §3: "Created by the listen loop, destroyed by the ready loop").
pub async fn run(config: BindConfig, listener: Listener, shared: Arc<Shared>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    info!("listening on {:?} ({:?})", config.addr, config.kind);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("listen loop for {:?} stopping: shutdown requested", config.addr);
                    return;
                }
            }
            accepted = accept_one(&listener) => {
                match accepted {
                    Ok(stream) => spawn_connection(stream, config.kind, Arc::clone(&shared)),
                    Err(e) => {
                        error!("accept() failed on {:?}: {e}", config.addr);
                    }
                }
            }
        }
    }
}

enum AcceptedStream {
    Tcp(tokio::net::TcpStream),
    Unix(tokio::net::UnixStream),
}

async fn accept_one(listener: &Listener) -> std::io::Result<AcceptedStream> {
    match listener {
        Listener::Tcp(l) => {
            let (stream, _addr) = l.accept().await?;
            configure_tcp(&stream);
            Ok(AcceptedStream::Tcp(stream))
        }
        Listener::Unix(l) => {
            let (stream, _addr) = l.accept().await?;
            Ok(AcceptedStream::Unix(stream))
        }
    }
}

/// Sets `TCP_NODELAY` and `SO_KEEPALIVE` on a freshly accepted socket
/// (spec.md §4.3: "On accept(): set non-blocking, SO_KEEPALIVE, TCP_NODELAY").
/// Non-blocking mode is already implied by using a tokio socket.
fn configure_tcp(stream: &tokio::net::TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        error!("TCP_NODELAY: {e}");
    }
    let sock = socket2::SockRef::from(stream);
    let keepalive = TcpKeepalive::new().with_time(std::time::Duration::from_secs(60));
    if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
        error!("SO_KEEPALIVE: {e}");
    }
}

fn spawn_connection(stream: AcceptedStream, kind: ConnKind, shared: Arc<Shared>) {
    let cid = conn::next_connection_id();
    tokio::spawn(async move {
        match stream {
            AcceptedStream::Tcp(s) => conn::run(s, cid, shared).await,
            AcceptedStream::Unix(s) => conn::run(s, cid, shared).await,
        }
    });
    let _ = kind;
}
