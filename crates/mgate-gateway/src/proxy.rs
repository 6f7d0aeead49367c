//! The mesh HTTP/2 surface.
//!
//! Served over any established H2 session — a terminated `https` listener,
//! a plaintext h2c stream, or either side of a reverse tunnel. Paths:
//!
//! - `POST /dm/<host:port>` / `CONNECT` — raw TCP proxy through the router
//! - `POST /hbone/<port>` — proxy to a local port on this node
//! - `POST /h2r/` — reverse-tunnel registration
//! - `GET /dm/id` — identity echo
//! - `GET /dm/streams`, `GET /dm/nodes` — JSON debug dumps
//!
//! Requests are authenticated by the session's client-cert identity when
//! present, else by a bearer token in `Authorization`. The effective
//! identity travels in the internal `from` header, which is honored only
//! from authenticated mesh sessions and stripped otherwise.

use crate::mux::{H2Stream, DM_PREFIX, FROM_HEADER, H2R_PATH, HBONE_PREFIX, ID_PATH};
use crate::router::{run_handler, splice, Gateway, Upstream};
use bytes::Bytes;
use h2::server::SendResponse;
use h2::RecvStream;
use mgate_core::{GateError, GateResult, Stream, StreamGuard, StreamInfo, TlsInfo};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

/// Serve one H2 session. `session_identity` is the peer identity from the
/// TLS layer, `None` for plaintext or cert-less sessions.
pub async fn serve_session<S>(
    gateway: Arc<Gateway>,
    io: S,
    session_identity: Option<String>,
) -> GateResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut conn = h2::server::handshake(io)
        .await
        .map_err(|e| GateError::Tunnel(format!("h2 server handshake: {e}")))?;

    while let Some(result) = conn.accept().await {
        let (req, respond) = result.map_err(|e| GateError::Tunnel(format!("h2 accept: {e}")))?;
        let gw = gateway.clone();
        let sid = session_identity.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_request(gw, req, respond, sid).await {
                debug!(error = %e, "mesh request failed");
            }
        });
    }
    Ok(())
}

/// One request on the mesh surface.
async fn handle_request(
    gateway: Arc<Gateway>,
    req: http::Request<RecvStream>,
    mut respond: SendResponse<Bytes>,
    session_identity: Option<String>,
) -> GateResult<()> {
    let (parts, body) = req.into_parts();

    // The inbound `from` header is only meaningful when the request arrived
    // over an authenticated mesh session; anonymous senders cannot assert an
    // origin.
    let hop_from = parts
        .headers
        .get(FROM_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let token_subject = parts
        .headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .and_then(|t| mgate_core::verify_token(&gateway.secret, t).ok());

    let effective = match (&session_identity, hop_from, token_subject) {
        (Some(_), Some(from), _) => Some(from),
        (Some(sid), None, _) => Some(sid.clone()),
        (None, _, Some(subject)) => Some(subject),
        (None, _, None) => None,
    };

    let path = parts.uri.path().to_string();
    let method = parts.method.clone();

    if method == http::Method::GET && path == ID_PATH {
        return send_body(&mut respond, 200, gateway.identity.identity.clone().into());
    }
    if method == http::Method::GET && path == "/dm/streams" {
        let json = serde_json::to_vec(&gateway.streams.snapshot())
            .map_err(|e| GateError::Other(format!("stats: {e}")))?;
        return send_body(&mut respond, 200, json.into());
    }
    if method == http::Method::GET && path == "/dm/nodes" {
        let json = serde_json::to_vec(&gateway.nodes.snapshot())
            .map_err(|e| GateError::Other(format!("stats: {e}")))?;
        return send_body(&mut respond, 200, json.into());
    }

    if path == H2R_PATH {
        let Some(peer) = effective else {
            send_error(&mut respond, 403, "reverse registration requires identity");
            return Ok(());
        };
        let resp = http::Response::builder().status(200).body(()).unwrap();
        let send = respond
            .send_response(resp, false)
            .map_err(|e| GateError::Tunnel(format!("h2r response: {e}")))?;
        let duplex = H2Stream::new(send, body);
        return crate::h2r::register_reverse_mux(&gateway, duplex, peer).await;
    }

    // remaining paths are raw TCP proxies and need an authenticated origin
    let dest = if method == http::Method::CONNECT {
        parts.uri.authority().map(|a| a.to_string())
    } else if let Some(rest) = path.strip_prefix(HBONE_PREFIX) {
        rest.parse::<u16>()
            .ok()
            .map(|port| format!("{}:{}", gateway.identity.identity, port))
    } else if let Some(rest) = path.strip_prefix(DM_PREFIX) {
        Some(rest.to_string())
    } else {
        send_error(&mut respond, 404, "no such path");
        return Ok(());
    };

    let Some(dest) = dest else {
        send_error(&mut respond, 400, "missing destination");
        return Ok(());
    };
    if effective.is_none() {
        send_error(&mut respond, 403, "authentication required");
        return Ok(());
    }

    proxy_request(gateway, &dest, effective, body, respond).await
}

/// CONNECT-equivalent proxy: resolve through the router, answer 200, splice
/// the request body against the upstream. Dial failures answer 5xx with an
/// `error` header; cleanup fires exactly once through the stream guard.
async fn proxy_request(
    gateway: Arc<Gateway>,
    dest: &str,
    from: Option<String>,
    body: RecvStream,
    mut respond: SendResponse<Bytes>,
) -> GateResult<()> {
    let info = Arc::new(StreamInfo::new("vstream"));
    info.set_dest(dest);
    if let Some(from) = &from {
        info.set_tls(TlsInfo {
            alpn: None,
            peer_identity: Some(from.clone()),
            sni: None,
        });
    }
    let mut guard = StreamGuard::new(gateway.streams.clone(), info.clone());

    let upstream = match gateway.connect(dest, from.as_deref()).await {
        Ok(up) => up,
        Err(e) => {
            info.set_proxy_read_err(&e.to_string());
            warn!(dest = %dest, error = %e, "mesh proxy dial failed");
            send_error(&mut respond, 502, &e.to_string());
            guard.finish();
            return Err(e);
        }
    };

    let resp = http::Response::builder().status(200).body(()).unwrap();
    let send = respond
        .send_response(resp, false)
        .map_err(|e| GateError::Tunnel(format!("proxy response: {e}")))?;
    let duplex = H2Stream::new(send, body);

    let result = match upstream {
        Upstream::Handler(handler) => {
            let mut stream = Stream {
                info: info.clone(),
                io: Box::new(duplex),
            };
            run_handler(&handler, &mut stream).await
        }
        Upstream::Io(up) => splice(Box::new(duplex), up, &info).await,
    };
    if let Err(e) = &result {
        info.set_proxy_read_err(&e.to_string());
    }
    guard.finish();
    result
}

fn send_body(respond: &mut SendResponse<Bytes>, status: u16, body: Bytes) -> GateResult<()> {
    let resp = http::Response::builder().status(status).body(()).unwrap();
    let mut send = respond
        .send_response(resp, false)
        .map_err(|e| GateError::Tunnel(format!("response: {e}")))?;
    send.send_data(body, true)
        .map_err(|e| GateError::Tunnel(format!("response body: {e}")))?;
    Ok(())
}

/// Answer an error status with the reason in an `error` header.
fn send_error(respond: &mut SendResponse<Bytes>, status: u16, msg: &str) {
    let safe: String = msg
        .chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '?' })
        .collect();
    let resp = http::Response::builder()
        .status(status)
        .header("error", safe)
        .body(())
        .unwrap();
    let _ = respond.send_response(resp, true);
}
