//! HTTP/2 multiplexer plumbing.
//!
//! A [`Muxer`] is an established H2 client session to a peer, over which
//! logical streams are opened as CONNECT-equivalent requests (`POST
//! /dm/<host:port>`, body = forward direction, response body = reverse).
//! [`H2Stream`] adapts one such request/response pair — in either role — to
//! `AsyncRead + AsyncWrite`, so the rest of the gateway can splice it like
//! any other connection.

use bytes::Bytes;
use h2::client::SendRequest;
use h2::{RecvStream, SendStream};
use mgate_core::{GateError, GateResult};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

/// Max bytes sent per H2 DATA chunk from the write adapter.
const WRITE_CHUNK: usize = 16 * 1024;

/// Internal header carrying the effective peer identity across hops.
pub const FROM_HEADER: &str = "from";

/// Path prefix for CONNECT-equivalent raw TCP proxying.
pub const DM_PREFIX: &str = "/dm/";

/// Path prefix for local-port proxying on the serving node.
pub const HBONE_PREFIX: &str = "/hbone/";

/// Reverse-tunnel registration path.
pub const H2R_PATH: &str = "/h2r/";

/// Identity echo path, used for the initial identification round-trip.
pub const ID_PATH: &str = "/dm/id";

fn h2_io_err(e: h2::Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::BrokenPipe, e)
}

/// A bidirectional byte stream over one HTTP/2 stream.
///
/// Works for both roles: a client's (request `SendStream`, response
/// `RecvStream`) or a server's (request `RecvStream`, response
/// `SendStream`).
#[derive(Debug)]
pub struct H2Stream {
    send: SendStream<Bytes>,
    recv: RecvStream,
    rbuf: Bytes,
    sent_eos: bool,
}

impl H2Stream {
    pub fn new(send: SendStream<Bytes>, recv: RecvStream) -> Self {
        Self {
            send,
            recv,
            rbuf: Bytes::new(),
            sent_eos: false,
        }
    }
}

impl AsyncRead for H2Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.rbuf.is_empty() {
            let n = self.rbuf.len().min(buf.remaining());
            let chunk = self.rbuf.split_to(n);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        match ready!(self.recv.poll_data(cx)) {
            None => Poll::Ready(Ok(())),
            Some(Ok(data)) => {
                let _ = self.recv.flow_control().release_capacity(data.len());
                let mut data = data;
                let n = data.len().min(buf.remaining());
                buf.put_slice(&data.split_to(n));
                self.rbuf = data;
                Poll::Ready(Ok(()))
            }
            Some(Err(e)) => Poll::Ready(Err(h2_io_err(e))),
        }
    }
}

impl AsyncWrite for H2Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let want = buf.len().min(WRITE_CHUNK);
        loop {
            self.send.reserve_capacity(want);
            match ready!(self.send.poll_capacity(cx)) {
                // spurious zero grant; ask again
                Some(Ok(0)) => continue,
                Some(Ok(n)) => {
                    let n = n.min(buf.len());
                    self.send
                        .send_data(Bytes::copy_from_slice(&buf[..n]), false)
                        .map_err(h2_io_err)?;
                    return Poll::Ready(Ok(n));
                }
                Some(Err(e)) => return Poll::Ready(Err(h2_io_err(e))),
                None => {
                    return Poll::Ready(Err(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "h2 stream closed",
                    )))
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        // DATA frames are pushed as capacity arrives; nothing buffered here
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.sent_eos {
            self.sent_eos = true;
            self.send.send_data(Bytes::new(), true).map_err(h2_io_err)?;
        }
        Poll::Ready(Ok(()))
    }
}

/// An established H2 client session to a peer.
///
/// Cloneable handle; the node table stores at most one per peer and replaces
/// it wholesale. `epoch` identifies the session so only its own cleanup can
/// clear it from the table.
#[derive(Clone)]
pub struct Muxer {
    pub epoch: u64,
    pub peer: String,
    send: SendRequest<Bytes>,
}

impl std::fmt::Debug for Muxer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Muxer")
            .field("epoch", &self.epoch)
            .field("peer", &mgate_core::short_id(&self.peer))
            .finish()
    }
}

impl Muxer {
    /// Open a CONNECT-equivalent stream to `dest` through this session.
    pub async fn open_stream(&self, dest: &str) -> GateResult<H2Stream> {
        self.open_stream_from(dest, None).await
    }

    /// Open a stream to `dest`, carrying the originating peer identity in
    /// the internal `from` header when forwarding on behalf of another hop.
    pub async fn open_stream_from(&self, dest: &str, from: Option<&str>) -> GateResult<H2Stream> {
        let send = self.send.clone();
        let mut send = send
            .ready()
            .await
            .map_err(|e| GateError::Dial(format!("mux not ready: {e}")))?;

        let mut builder = http::Request::builder()
            .method(http::Method::POST)
            .uri(format!("http://{}{}{}", crate::tls::MESH_SNI, DM_PREFIX, dest));
        if let Some(from) = from {
            builder = builder.header(FROM_HEADER, from);
        }
        let req = builder
            .body(())
            .map_err(|e| GateError::Dial(format!("bad forward request: {e}")))?;

        let (resp_fut, send_stream) = send
            .send_request(req, false)
            .map_err(|e| GateError::Dial(format!("mux send failed: {e}")))?;
        let resp = resp_fut
            .await
            .map_err(|e| GateError::Dial(format!("mux round-trip failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(GateError::Dial(format!(
                "mesh forward refused: {}",
                resp.status()
            )));
        }
        Ok(H2Stream::new(send_stream, resp.into_body()))
    }

    /// Open the reverse-registration stream: `POST /h2r/` with the request
    /// body as the reverse data channel. The returned duplex carries a whole
    /// HTTP/2 session in the other direction.
    pub async fn open_reverse(&self) -> GateResult<H2Stream> {
        let send = self.send.clone();
        let mut send = send
            .ready()
            .await
            .map_err(|e| GateError::Tunnel(format!("mux not ready: {e}")))?;

        let req = http::Request::builder()
            .method(http::Method::POST)
            .uri(format!("http://{}{}", crate::tls::MESH_SNI, H2R_PATH))
            .body(())
            .map_err(|e| GateError::Tunnel(format!("bad h2r request: {e}")))?;

        let (resp_fut, send_stream) = send
            .send_request(req, false)
            .map_err(|e| GateError::Tunnel(format!("h2r send failed: {e}")))?;
        let resp = resp_fut
            .await
            .map_err(|e| GateError::Tunnel(format!("h2r round-trip failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(GateError::Tunnel(format!(
                "reverse registration refused: {}",
                resp.status()
            )));
        }
        Ok(H2Stream::new(send_stream, resp.into_body()))
    }

    /// GET a small resource over the session, returning the body.
    pub async fn get(&self, path: &str) -> GateResult<Bytes> {
        let send = self.send.clone();
        let mut send = send
            .ready()
            .await
            .map_err(|e| GateError::Tunnel(format!("mux not ready: {e}")))?;

        let req = http::Request::builder()
            .method(http::Method::GET)
            .uri(format!("http://{}{}", crate::tls::MESH_SNI, path))
            .body(())
            .map_err(|e| GateError::Tunnel(format!("bad request: {e}")))?;

        let (resp_fut, _) = send
            .send_request(req, true)
            .map_err(|e| GateError::Tunnel(format!("mux send failed: {e}")))?;
        let resp = resp_fut
            .await
            .map_err(|e| GateError::Tunnel(format!("round-trip failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(GateError::Tunnel(format!("status {}", resp.status())));
        }
        let mut body = resp.into_body();
        let mut out = Vec::new();
        while let Some(chunk) = body.data().await {
            let chunk = chunk.map_err(|e| GateError::Tunnel(format!("body error: {e}")))?;
            let _ = body.flow_control().release_capacity(chunk.len());
            out.extend_from_slice(&chunk);
        }
        Ok(Bytes::from(out))
    }
}

/// Run the client half of an H2 handshake over `io` and return a [`Muxer`].
///
/// The connection driver is spawned; `on_close` runs when the session ends,
/// however it ends — the hook the node table uses to drop its reference.
pub async fn connect_muxer<S, F>(
    io: S,
    epoch: u64,
    peer: &str,
    on_close: F,
) -> GateResult<Muxer>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    F: FnOnce() + Send + 'static,
{
    let (send, connection) = h2::client::handshake(io)
        .await
        .map_err(|e| GateError::Tunnel(format!("h2 client handshake: {e}")))?;

    let peer_copy = peer.to_string();
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!(peer = %mgate_core::short_id(&peer_copy), error = %e, "mux connection ended");
        }
        on_close();
    });

    let send = send
        .ready()
        .await
        .map_err(|e| GateError::Tunnel(format!("h2 not ready: {e}")))?;
    Ok(Muxer {
        epoch,
        peer: peer.to_string(),
        send,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Echo server: accepts one stream, mirrors its body into the response.
    async fn echo_server(io: tokio::io::DuplexStream) {
        let mut conn = h2::server::handshake(io).await.unwrap();
        while let Some(result) = conn.accept().await {
            let (req, mut respond) = result.unwrap();
            tokio::spawn(async move {
                let mut body = req.into_body();
                let resp = http::Response::builder().status(200).body(()).unwrap();
                let mut send = respond.send_response(resp, false).unwrap();
                while let Some(chunk) = body.data().await {
                    let chunk = chunk.unwrap();
                    let _ = body.flow_control().release_capacity(chunk.len());
                    send.reserve_capacity(chunk.len());
                    send.send_data(chunk, false).unwrap();
                }
                send.send_data(Bytes::new(), true).unwrap();
            });
        }
    }

    #[tokio::test]
    async fn h2_stream_round_trip() {
        let (c, s) = tokio::io::duplex(64 * 1024);
        tokio::spawn(echo_server(s));

        let mux = connect_muxer(c, 1, &"ab".repeat(32), || {}).await.unwrap();
        let mut stream = mux.open_stream("127.0.0.1:9").await.unwrap();

        stream.write_all(b"Hello world").await.unwrap();
        let mut buf = vec![0u8; 11];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"Hello world");

        stream.write_all(b"chunk2").await.unwrap();
        let mut buf2 = vec![0u8; 6];
        stream.read_exact(&mut buf2).await.unwrap();
        assert_eq!(&buf2, b"chunk2");

        // half-close propagates as EOF after the echo drains
        stream.shutdown().await.unwrap();
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn node_table_keeps_most_recent_muxer() {
        let table = crate::node::NodeTable::new();
        let id = "ef".repeat(32);
        let node = table.get_or_create(&id);

        let (c1, s1) = tokio::io::duplex(64 * 1024);
        let (c2, s2) = tokio::io::duplex(64 * 1024);
        tokio::spawn(echo_server(s1));
        tokio::spawn(echo_server(s2));

        let e1 = table.next_epoch();
        let e2 = table.next_epoch();
        let m1 = connect_muxer(c1, e1, &id, || {}).await.unwrap();
        let m2 = connect_muxer(c2, e2, &id, || {}).await.unwrap();

        // later session wins regardless of install order
        node.set_muxer(m2);
        node.set_muxer(m1);
        assert_eq!(node.muxer().unwrap().epoch, e2);

        // the superseded session's cleanup cannot clear the newer muxer
        assert!(!node.clear_muxer(e1));
        assert!(node.muxer().is_some());
        assert!(node.clear_muxer(e2));
        assert!(node.muxer().is_none());
    }

    #[tokio::test]
    async fn on_close_fires_when_session_ends() {
        let (c, s) = tokio::io::duplex(64 * 1024);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let tx = std::sync::Mutex::new(Some(tx));
        let mux = connect_muxer(c, 1, &"cd".repeat(32), move || {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(());
            }
        })
        .await
        .unwrap();
        drop(mux);
        drop(s); // peer goes away
        tokio::time::timeout(std::time::Duration::from_secs(5), rx)
            .await
            .expect("on_close not observed")
            .unwrap();
    }
}
