//! Listen URL parsing and listener construction (spec.md §3 Bind, §4.3,
//! §6 "Listen URLs").
//!
//! Grounded on the reifydb `simple_ws_server` example's use of `socket2` to
//! set `SO_REUSEPORT`/`SO_REUSEADDR` before handing the socket to the async
//! runtime — exactly the knob spec.md §5 needs for "Optional worker
//! *processes* may be forked pre-accept (each is an independent replica
//! sharing the listen socket via SO_REUSEPORT)". `socket2` is used only to
//! build the socket; the accept loop itself runs on a `tokio::net::TcpListener`
//! converted from the configured `std::net::TcpListener`, matching the
//! teacher's `units/rtr.rs` style of building a std listener then handing
//! it to tokio via `from_std`.
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, UnixListener};
use url::Url;

use crate::error::{CoreError, Kind};
use crate::response::ConnKind;

/// The parsed form of a listen URL (spec.md §6): `http://host:port`,
/// `tcp://host:port`, or `unix:///path`. `https://`/`ssl://` are accepted by
/// the parser but rejected at bind time, matching "reserved but not
/// implemented in the core".
#[derive(Clone, Debug)]
pub enum ListenAddr {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

#[derive(Clone, Debug)]
pub struct BindConfig {
    pub addr: ListenAddr,
    pub kind: ConnKind,
}

/// Parses one of spec.md §6's listen URL forms, including bracketed IPv6
/// hosts and the empty-host `http://:port` shorthand for "all interfaces".
/// `url::Url` already implements the RFC 3986 host-parsing rules this
/// needs, so the parser itself just maps scheme/host/port onto our
/// `ListenAddr` rather than re-deriving bracket handling by hand.
pub fn parse_listen_url(listen_url: &str, kind: ConnKind) -> Result<BindConfig, CoreError> {
    if let Some(path) = listen_url.strip_prefix("unix://") {
        return Ok(BindConfig { addr: ListenAddr::Unix(PathBuf::from(path)), kind });
    }

    let url = Url::parse(listen_url)
        .map_err(|e| CoreError::new(Kind::Arg, format!("bad listen url {listen_url}: {e}")))?;

    match url.scheme() {
        "http" | "tcp" => {
            let ip: IpAddr = match url.host_str() {
                Some("") | None => IpAddr::from([0, 0, 0, 0]),
                Some(host) => host.trim_start_matches('[').trim_end_matches(']').parse()
                    .map_err(|_| CoreError::new(Kind::Arg, format!("bad host in {listen_url}")))?,
            };
            let port = url.port().ok_or_else(|| CoreError::new(Kind::Arg, format!("missing port in {listen_url}")))?;
            Ok(BindConfig { addr: ListenAddr::Tcp(SocketAddr::new(ip, port)), kind })
        }
        "https" | "ssl" => {
            Err(CoreError::new(Kind::NotImplemented, format!("{}:// is reserved but not implemented", url.scheme())))
        }
        other => Err(CoreError::new(Kind::Arg, format!("unknown listen scheme {other}"))),
    }
}

/// A bound, not-yet-accepting listener plus the metadata a connection
/// inherits from the Bind it arrived on (spec.md §3: "provides scheme and
/// per-kind read/write hooks").
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// Builds a TCP listener with `SO_REUSEPORT`, `SO_REUSEADDR`, `TCP_NODELAY`
/// and a non-blocking mode set before the socket is handed to tokio,
/// matching spec.md §4.3's accept-time setup list minus `SO_KEEPALIVE`
/// (applied per-connection in `conn.rs`, since `socket2` only configures it
/// on already-accepted sockets here).
pub fn bind(config: &BindConfig) -> Result<Listener, CoreError> {
    match &config.addr {
        ListenAddr::Tcp(addr) => {
            let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
            let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
                .map_err(|e| CoreError::new(Kind::Network, format!("socket(): {e}")))?;
            socket.set_reuse_address(true)
                .map_err(|e| CoreError::new(Kind::Network, format!("SO_REUSEADDR: {e}")))?;
            #[cfg(unix)]
            socket.set_reuse_port(true)
                .map_err(|e| CoreError::new(Kind::Network, format!("SO_REUSEPORT: {e}")))?;
            socket.set_nonblocking(true)
                .map_err(|e| CoreError::new(Kind::Network, format!("O_NONBLOCK: {e}")))?;
            socket.bind(&(*addr).into())
                .map_err(|e| CoreError::new(Kind::Network, format!("bind({addr}): {e}")))?;
            socket.listen(1024)
                .map_err(|e| CoreError::new(Kind::Network, format!("listen(): {e}")))?;
            let std_listener: std::net::TcpListener = socket.into();
            let listener = TcpListener::from_std(std_listener)
                .map_err(|e| CoreError::new(Kind::Network, format!("from_std: {e}")))?;
            Ok(Listener::Tcp(listener))
        }
        ListenAddr::Unix(path) => {
            let _ = std::fs::remove_file(path);
            let listener = UnixListener::bind(path)
                .map_err(|e| CoreError::new(Kind::Network, format!("bind({}): {e}", path.display())))?;
            Ok(Listener::Unix(listener))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_tcp_host_and_port() {
        let cfg = parse_listen_url("http://127.0.0.1:8080", ConnKind::Http).unwrap();
        assert!(matches!(cfg.addr, ListenAddr::Tcp(a) if a.port() == 8080));
    }

    #[test]
    fn parses_wildcard_host_port_form() {
        let cfg = parse_listen_url("tcp://:9000", ConnKind::Http).unwrap();
        assert!(matches!(cfg.addr, ListenAddr::Tcp(a) if a.port() == 9000));
    }

    #[test]
    fn parses_unix_socket_paths() {
        let cfg = parse_listen_url("unix:///tmp/corehttpd.sock", ConnKind::Http).unwrap();
        assert!(matches!(cfg.addr, ListenAddr::Unix(p) if p == PathBuf::from("/tmp/corehttpd.sock")));
    }

    #[test]
    fn https_is_reserved_but_rejected() {
        let err = parse_listen_url("https://example.com:443", ConnKind::Http).unwrap_err();
        assert_eq!(err.kind(), Kind::NotImplemented);
    }

    #[test]
    fn unknown_scheme_is_an_error() {
        assert!(parse_listen_url("ftp://host:21", ConnKind::Http).is_err());
    }
}
