//! The gateway object and per-stream routing.
//!
//! [`Gateway`] is the one explicit registry constructed at startup: identity,
//! node table, active-stream table, listener registry, named handlers. Each
//! accepted connection runs [`Gateway::handle_accepted`] for its whole life:
//! sniff, optional TLS termination, then exactly one of {local handler, mesh
//! forward over a live multiplexer, direct dial}, then the counted splice.
//! Terminal accounting fires exactly once through the stream guard, panics
//! from handler code included.

use crate::config::{GatewayConfig, ListenerConfig, Protocol};
use crate::listener::ListenerRegistry;
use crate::node::NodeTable;
use crate::tls::{tls_accept, NodeIdentity};
use futures_util::FutureExt;
use mgate_core::{
    is_identity, sniff_stream, BoxConn, GateError, GateResult, Sniffed, Stream, StreamGuard,
    StreamInfo, StreamTable,
};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error};

/// In-process stream handler, invoked synchronously by the router; the
/// stream closes when the handler returns.
pub trait Handler: Send + Sync {
    fn handle<'a>(
        &'a self,
        stream: &'a mut Stream,
    ) -> Pin<Box<dyn Future<Output = GateResult<()>> + Send + 'a>>;
}

/// Where a destination resolved to.
pub enum Upstream {
    /// An in-process handler (local delivery).
    Handler(Arc<dyn Handler>),
    /// An established byte stream to the destination.
    Io(BoxConn),
}

/// The gateway instance. Constructed once, shared by `Arc`.
pub struct Gateway {
    pub config: GatewayConfig,
    pub identity: Arc<NodeIdentity>,
    pub nodes: Arc<NodeTable>,
    pub streams: Arc<StreamTable>,
    pub secret: Vec<u8>,
    pub listeners: ListenerRegistry,
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
}

impl Gateway {
    pub fn new(config: GatewayConfig, identity: NodeIdentity) -> Self {
        let secret = config
            .secret
            .clone()
            .unwrap_or_else(mgate_core::generate_secret);
        Self {
            config,
            identity: Arc::new(identity),
            nodes: Arc::new(NodeTable::new()),
            streams: Arc::new(StreamTable::new()),
            secret,
            listeners: ListenerRegistry::new(),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_handler(&self, name: &str, handler: Arc<dyn Handler>) {
        self.handlers
            .write()
            .unwrap()
            .insert(name.to_string(), handler);
    }

    pub fn handler(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.read().unwrap().get(name).cloned()
    }

    /// Bind every configured listener and start the reverse-tunnel keepers.
    pub async fn start(self: &Arc<Self>) -> GateResult<()> {
        for cfg in self.config.listeners.clone() {
            self.listeners.add(self, cfg).await?;
        }
        crate::h2r::maintain_pinned_peers(self.clone());
        Ok(())
    }

    /// Full lifetime of one accepted connection.
    pub async fn handle_accepted(self: Arc<Self>, tcp: TcpStream, cfg: Arc<ListenerConfig>) {
        let info = Arc::new(StreamInfo::new(cfg.protocol.tag()));
        info.set_listener(&cfg.address);
        let mut guard = StreamGuard::new(self.streams.clone(), info.clone());

        if let Err(e) = self.dispatch(Box::new(tcp), &cfg, &info).await {
            match &e {
                GateError::Sniff(_) | GateError::Handshake(_) | GateError::Cancelled => {
                    info.set_read_err(&e.to_string())
                }
                _ => info.set_proxy_read_err(&e.to_string()),
            }
            debug!(stream_id = info.stream_id, error = %e, "stream failed");
        }
        guard.finish();
    }

    /// Sniff / terminate / route one stream according to the listener config.
    async fn dispatch(
        self: &Arc<Self>,
        io: BoxConn,
        cfg: &Arc<ListenerConfig>,
        info: &Arc<StreamInfo>,
    ) -> GateResult<()> {
        match cfg.protocol {
            Protocol::Tcp => {
                if let Some(dest) = &cfg.forward_to {
                    info.set_dest(dest);
                }
                self.route(io, cfg, info).await
            }
            Protocol::Socks5 => crate::socks::handle(self, io, info).await,
            Protocol::Https => {
                let alpn = alpn_or_default(cfg);
                let (tls, tls_info) = tls_accept(io, &self.identity, &alpn, None).await?;
                info.set_tls(tls_info.clone());
                self.dispatch_tls(Box::new(tls), tls_info.alpn.as_deref(), cfg, info)
                    .await
            }
            Protocol::Tls => {
                let (sniffed, replay) = sniff_stream(io).await?;
                let sni = match sniffed {
                    Sniffed::Tls { sni } => sni,
                    other => {
                        return Err(GateError::Sniff(format!(
                            "expected TLS on {}, got {}",
                            cfg.address,
                            other.tag()
                        )))
                    }
                };
                let alpn = alpn_or_default(cfg);
                let (tls, mut tls_info) =
                    tls_accept(Box::new(replay) as BoxConn, &self.identity, &alpn, None).await?;
                tls_info.sni = tls_info.sni.or(sni);
                info.set_tls(tls_info.clone());
                self.dispatch_tls(Box::new(tls), tls_info.alpn.as_deref(), cfg, info)
                    .await
            }
            Protocol::Http => {
                let (sniffed, replay) = sniff_stream(io).await?;
                info.set_stream_type(sniffed.tag());
                match sniffed {
                    Sniffed::Socks5 => {
                        crate::socks::handle(self, Box::new(replay), info).await
                    }
                    Sniffed::Tls { sni } => {
                        let alpn = alpn_or_default(cfg);
                        let (tls, mut tls_info) =
                            tls_accept(Box::new(replay) as BoxConn, &self.identity, &alpn, None)
                                .await?;
                        tls_info.sni = tls_info.sni.or(sni);
                        info.set_tls(tls_info.clone());
                        self.dispatch_tls(Box::new(tls), tls_info.alpn.as_deref(), cfg, info)
                            .await
                    }
                    Sniffed::H2Preface => {
                        // plaintext H2 (h2c): serve the mesh surface without
                        // a session identity, token auth only
                        crate::proxy::serve_session(self.clone(), Box::new(replay) as BoxConn, None)
                            .await
                    }
                    Sniffed::Http1 => self.handle_http1(Box::new(replay), cfg, info).await,
                }
            }
            Protocol::Virtual => Err(GateError::Config(
                "virtual listener cannot accept connections".into(),
            )),
        }
    }

    /// Post-termination dispatch, selected by negotiated ALPN.
    async fn dispatch_tls(
        self: &Arc<Self>,
        io: BoxConn,
        alpn: Option<&str>,
        cfg: &Arc<ListenerConfig>,
        info: &Arc<StreamInfo>,
    ) -> GateResult<()> {
        match alpn {
            // reverse tunnel: the dialing peer serves, we open the H2 client
            Some("h2r") => crate::h2r::accept_reverse(self, io, info).await,
            Some("h2") => {
                crate::proxy::serve_session(self.clone(), io, info.peer_identity()).await
            }
            _ => {
                // plain stream under TLS: handler or forward
                if info.dest().is_empty() {
                    let dest = cfg
                        .forward_to
                        .clone()
                        .or_else(|| info.tls().and_then(|t| t.sni).map(|s| format!("{s}:443")));
                    if let Some(dest) = dest {
                        info.set_dest(&dest);
                    }
                }
                self.route(io, cfg, info).await
            }
        }
    }

    /// HTTP/1.x origin with no facade registered: forward when the listener
    /// says so, else answer 501 and close.
    async fn handle_http1(
        self: &Arc<Self>,
        mut io: BoxConn,
        cfg: &Arc<ListenerConfig>,
        info: &Arc<StreamInfo>,
    ) -> GateResult<()> {
        if cfg.forward_to.is_some() || cfg.handler.is_some() {
            if let Some(dest) = &cfg.forward_to {
                info.set_dest(dest);
            }
            return self.route(io, cfg, info).await;
        }
        io.write_all(b"HTTP/1.1 501 Not Implemented\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
            .await?;
        io.shutdown().await?;
        Ok(())
    }

    /// Exactly one of: local handler, mesh forward, direct dial.
    pub async fn route(
        self: &Arc<Self>,
        io: BoxConn,
        cfg: &Arc<ListenerConfig>,
        info: &Arc<StreamInfo>,
    ) -> GateResult<()> {
        if let Some(name) = &cfg.handler {
            let handler = self
                .handler(name)
                .ok_or_else(|| GateError::Config(format!("unknown handler {name}")))?;
            let mut stream = Stream {
                info: info.clone(),
                io,
            };
            return run_handler(&handler, &mut stream).await;
        }

        let dest = info.dest();
        if dest.is_empty() {
            return Err(GateError::Dial("no destination for stream".into()));
        }
        match self.connect(&dest, info.peer_identity().as_deref()).await? {
            Upstream::Handler(handler) => {
                let mut stream = Stream {
                    info: info.clone(),
                    io,
                };
                run_handler(&handler, &mut stream).await
            }
            Upstream::Io(up) => splice(io, up, info).await,
        }
    }

    /// Resolve `dest` to an upstream: self-delivery, mesh forward through a
    /// live multiplexer, or direct dial (identity-pinned when the host is a
    /// recognized node).
    ///
    /// A mesh-forward round-trip failure surfaces as an error — no fallback
    /// to direct dial.
    pub async fn connect(
        self: &Arc<Self>,
        dest: &str,
        from: Option<&str>,
    ) -> GateResult<Upstream> {
        let (host, port) = split_host_port(dest)?;

        if host == self.identity.identity {
            return self.connect_local(port).await;
        }

        if is_identity(&host) {
            let node = self
                .nodes
                .get(&host)
                .ok_or_else(|| GateError::Dial(format!("unknown peer {host}")))?;

            if let Some(mux) = node.muxer() {
                debug!(peer = %mgate_core::short_id(&host), dest = %dest, "mesh forward");
                let stream = mux.open_stream_from(dest, from).await?;
                node.touch();
                return Ok(Upstream::Io(Box::new(stream)));
            }

            let addr = node
                .addr()
                .ok_or_else(|| GateError::Dial(format!("no route to peer {host}")))?;
            let tcp = TcpStream::connect(&addr)
                .await
                .map_err(|e| GateError::Dial(format!("dial {addr}: {e}")))?;
            let (tls, _) =
                crate::tls::tls_connect(tcp, &self.identity, Some(&host), &["h2", "http/1.1"], None)
                    .await?;
            node.touch();
            return Ok(Upstream::Io(Box::new(tls)));
        }

        let tcp = TcpStream::connect(dest)
            .await
            .map_err(|e| GateError::Dial(format!("dial {dest}: {e}")))?;
        Ok(Upstream::Io(Box::new(tcp)))
    }

    /// Delivery to this node: a listener registered for the port (handler or
    /// forward override), else the local loopback port.
    async fn connect_local(self: &Arc<Self>, port: u16) -> GateResult<Upstream> {
        if let Some(cfg) = self.listeners.find_by_port(port) {
            if let Some(name) = &cfg.handler {
                let handler = self
                    .handler(name)
                    .ok_or_else(|| GateError::Config(format!("unknown handler {name}")))?;
                return Ok(Upstream::Handler(handler));
            }
            if let Some(fwd) = &cfg.forward_to {
                let tcp = TcpStream::connect(fwd)
                    .await
                    .map_err(|e| GateError::Dial(format!("dial {fwd}: {e}")))?;
                return Ok(Upstream::Io(Box::new(tcp)));
            }
        }
        let addr = format!("127.0.0.1:{port}");
        let tcp = TcpStream::connect(&addr)
            .await
            .map_err(|e| GateError::Dial(format!("dial {addr}: {e}")))?;
        Ok(Upstream::Io(Box::new(tcp)))
    }
}

/// Invoke a handler, recovering panics into an error so cleanup always runs.
pub(crate) async fn run_handler(
    handler: &Arc<dyn Handler>,
    stream: &mut Stream,
) -> GateResult<()> {
    let stream_id = stream.info.stream_id;
    match AssertUnwindSafe(handler.handle(stream)).catch_unwind().await {
        Ok(res) => res,
        Err(payload) => {
            let msg = panic_message(payload);
            let backtrace = std::backtrace::Backtrace::force_capture();
            error!(stream_id, panic = %msg, %backtrace, "handler panicked");
            Err(GateError::Panic(msg))
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Split `host:port`, accepting bracketed IPv6 hosts.
pub fn split_host_port(dest: &str) -> GateResult<(String, u16)> {
    let (host, port) = dest
        .rsplit_once(':')
        .ok_or_else(|| GateError::Dial(format!("destination {dest} has no port")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| GateError::Dial(format!("destination {dest} has a bad port")))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok((host.to_string(), port))
}

fn alpn_or_default(cfg: &ListenerConfig) -> Vec<&str> {
    if cfg.alpn.is_empty() {
        vec!["h2r", "h2", "http/1.1"]
    } else {
        cfg.alpn.iter().map(|s| s.as_str()).collect()
    }
}

/// Bidirectional copy with stream accounting.
///
/// Both directions run to completion before returning; EOF on one side
/// half-closes the other. Errors land in the stream's terminal error slots
/// (client side in read/write, upstream side in the proxy slots).
pub async fn splice(client: BoxConn, upstream: BoxConn, info: &Arc<StreamInfo>) -> GateResult<()> {
    let (mut cr, mut cw) = tokio::io::split(client);
    let (mut ur, mut uw) = tokio::io::split(upstream);

    let forward = async {
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            match cr.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    info.note_read(n);
                    if let Err(e) = uw.write_all(&buf[..n]).await {
                        info.set_proxy_write_err(&e.to_string());
                        break;
                    }
                }
                Err(e) => {
                    info.set_read_err(&e.to_string());
                    break;
                }
            }
        }
        let _ = uw.shutdown().await;
    };

    let backward = async {
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            match ur.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    info.note_write(n);
                    if let Err(e) = cw.write_all(&buf[..n]).await {
                        info.set_write_err(&e.to_string());
                        break;
                    }
                }
                Err(e) => {
                    info.set_proxy_read_err(&e.to_string());
                    break;
                }
            }
        }
        let _ = cw.shutdown().await;
    };

    tokio::join!(forward, backward);
    Ok(())
}
