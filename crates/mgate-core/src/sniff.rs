//! Wire-protocol sniffing.
//!
//! Classifies the first bytes of an accepted connection (SOCKS5, TLS with
//! SNI extraction, H2 preface, HTTP/1.x) without consuming them: everything
//! read during classification is preserved in a [`PrefixedStream`] and
//! replayed to whichever handler is selected next.
//!
//! The ClientHello parser is deliberately strict: any length inconsistency
//! is a hard failure, not a fallback to "unknown".

use crate::error::{GateError, GateResult};
use bytes::Bytes;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Upper bound on bytes examined before classification must have succeeded.
pub const MAX_SNIFF: usize = 8192;

/// Upper bound on the ClientHello record length we are willing to parse.
const MAX_TLS_RECORD: usize = 4096;

/// The HTTP/2 client connection preface.
pub const H2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// HTTP/1.x leading tokens. A match on any of these classifies the stream
/// as HTTP/1 (the request line is left in place for the HTTP handler).
const HTTP1_TOKENS: &[&[u8]] = &[
    b"GET ",
    b"POST ",
    b"PUT ",
    b"HEAD ",
    b"DELETE ",
    b"OPTIONS ",
    b"PATCH ",
    b"CONNECT ",
    b"HTTP/1.1",
    b"HTTP/2.0",
];

/// TLS extension number for server_name.
const EXTENSION_SERVER_NAME: u16 = 0;

/// Result of classifying a stream prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sniffed {
    /// SOCKS5 greeting (version byte 5). The negotiation itself is handled
    /// by the SOCKS handler, which answers it in place.
    Socks5,
    /// TLS ClientHello; `sni` is the server_name if one was present.
    Tls { sni: Option<String> },
    /// Literal HTTP/2 client preface.
    H2Preface,
    /// HTTP/1.x request line.
    Http1,
}

impl Sniffed {
    /// Protocol tag recorded on the stream.
    pub fn tag(&self) -> &'static str {
        match self {
            Sniffed::Socks5 => "socks5",
            Sniffed::Tls { .. } => "tls",
            Sniffed::H2Preface => "h2",
            Sniffed::Http1 => "http",
        }
    }
}

/// Classify a stream prefix.
///
/// Returns `Ok(None)` when more bytes are needed, `Ok(Some(_))` on a match,
/// and an error once no protocol can match (or a TLS record is malformed).
/// Deterministic in the prefix alone: feeding the same bytes in different
/// chunkings yields the same classification.
pub fn classify(prefix: &[u8]) -> GateResult<Option<Sniffed>> {
    if prefix.is_empty() {
        return Ok(None);
    }

    if prefix[0] == 5 {
        return Ok(Some(Sniffed::Socks5));
    }

    if prefix[0] == 22 {
        if prefix.len() < 2 {
            return Ok(None);
        }
        if prefix[1] != 3 {
            return Err(GateError::Sniff(format!(
                "TLS record with unknown version byte {}",
                prefix[1]
            )));
        }
        return Ok(parse_client_hello(prefix)?.map(|sni| Sniffed::Tls { sni }));
    }

    if prefix.len() >= H2_PREFACE.len() && prefix.starts_with(H2_PREFACE) {
        return Ok(Some(Sniffed::H2Preface));
    }
    let mut pending = H2_PREFACE.starts_with(prefix);

    for token in HTTP1_TOKENS {
        if prefix.len() >= token.len() && prefix.starts_with(token) {
            return Ok(Some(Sniffed::Http1));
        }
        if token.starts_with(prefix) {
            pending = true;
        }
    }

    if pending {
        if prefix.len() >= MAX_SNIFF {
            return Err(GateError::Sniff("no protocol match within bound".into()));
        }
        return Ok(None);
    }
    Err(GateError::Sniff(format!(
        "unrecognized protocol, first byte {:#x}",
        prefix[0]
    )))
}

/// Parse a TLS ClientHello record and extract the SNI hostname.
///
/// `buf` starts at the record header. Returns `Ok(None)` until the full
/// record is buffered, `Ok(Some(sni))` once parsed. The field walk mirrors
/// the ClientHello wire layout: fixed header, session id, cipher suites,
/// compression methods, then extensions.
pub fn parse_client_hello(buf: &[u8]) -> GateResult<Option<Option<String>>> {
    if buf.len() < 5 {
        return Ok(None);
    }
    if buf[0] != 22 {
        return Err(GateError::Sniff("not a TLS handshake record".into()));
    }

    let record_len = ((buf[3] as usize) << 8) | buf[4] as usize;
    if record_len > MAX_TLS_RECORD {
        return Err(GateError::Sniff(format!(
            "TLS record too large: {record_len}"
        )));
    }
    if buf.len() < 5 + record_len {
        return Ok(None);
    }

    let hello = &buf[5..5 + record_len];
    let ch_len = record_len;
    if ch_len < 39 {
        return Err(GateError::Sniff("ClientHello too short".into()));
    }
    if hello[0] != 1 {
        return Err(GateError::Sniff(format!(
            "handshake type {} is not ClientHello",
            hello[0]
        )));
    }

    // hello[1..4] is the handshake length, hello[4..6] the client version,
    // hello[6..38] the random.
    let session_id_len = hello[38] as usize;
    if session_id_len > 32 || ch_len < 39 + session_id_len {
        return Err(GateError::Sniff("bad session id length".into()));
    }
    let mut off = 39 + session_id_len;

    if ch_len < off + 2 {
        return Err(GateError::Sniff("truncated cipher suites".into()));
    }
    let cipher_suite_len = ((hello[off] as usize) << 8) | hello[off + 1] as usize;
    off += 2;
    // cipher suites are u16s, so the byte count must be even
    if cipher_suite_len % 2 == 1 || ch_len - off < 2 + cipher_suite_len {
        return Err(GateError::Sniff("bad cipher suite length".into()));
    }
    off += cipher_suite_len;

    let compression_len = hello[off] as usize;
    off += 1;
    if ch_len - off < 1 + compression_len {
        return Err(GateError::Sniff("bad compression length".into()));
    }
    off += compression_len;

    if off + 2 > ch_len {
        return Err(GateError::Sniff("missing extensions".into()));
    }
    let extensions_len = ((hello[off] as usize) << 8) | hello[off + 1] as usize;
    off += 2;
    if extensions_len != ch_len - off {
        return Err(GateError::Sniff("extensions length mismatch".into()));
    }

    let mut server_name = None;
    while off < ch_len {
        if ch_len - off < 4 {
            return Err(GateError::Sniff("truncated extension header".into()));
        }
        let extension = ((hello[off] as u16) << 8) | hello[off + 1] as u16;
        off += 2;
        let length = ((hello[off] as usize) << 8) | hello[off + 1] as usize;
        off += 2;
        if off + length > ch_len {
            return Err(GateError::Sniff("extension overruns record".into()));
        }

        if extension == EXTENSION_SERVER_NAME {
            let mut d = &hello[off..off + length];
            if d.len() < 2 {
                return Err(GateError::Sniff("bad server_name extension".into()));
            }
            let names_len = ((d[0] as usize) << 8) | d[1] as usize;
            d = &d[2..];
            if d.len() != names_len {
                return Err(GateError::Sniff("server_name list length mismatch".into()));
            }
            while !d.is_empty() {
                if d.len() < 3 {
                    return Err(GateError::Sniff("truncated server_name entry".into()));
                }
                let name_type = d[0];
                let name_len = ((d[1] as usize) << 8) | d[2] as usize;
                d = &d[3..];
                if d.len() < name_len {
                    return Err(GateError::Sniff("server_name entry overruns list".into()));
                }
                if name_type == 0 {
                    let name = std::str::from_utf8(&d[..name_len])
                        .map_err(|_| GateError::Sniff("server_name not utf-8".into()))?;
                    // An SNI value may not include a trailing dot (RFC 6066).
                    if name.ends_with('.') {
                        return Err(GateError::Sniff("server_name has trailing dot".into()));
                    }
                    server_name = Some(name.to_string());
                    break;
                }
                d = &d[name_len..];
            }
        }

        off += length;
    }

    Ok(Some(server_name))
}

/// Read from `io` until the prefix classifies, then hand back the
/// classification plus a [`PrefixedStream`] that replays every sniffed byte.
pub async fn sniff_stream<S>(mut io: S) -> GateResult<(Sniffed, PrefixedStream<S>)>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    loop {
        if let Some(sniffed) = classify(&buf)? {
            return Ok((sniffed, PrefixedStream::new(Bytes::from(buf), io)));
        }
        if buf.len() >= MAX_SNIFF {
            return Err(GateError::Sniff("no protocol match within bound".into()));
        }
        let n = io.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(GateError::Sniff("eof during sniff".into()));
        }
    }
}

/// A stream with a buffered prefix that is served before the inner stream.
///
/// Reads drain the prefix first, then fall through; writes and shutdown go
/// straight to the inner stream.
#[derive(Debug)]
pub struct PrefixedStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }

    /// Bytes still waiting to be replayed.
    pub fn prefix_remaining(&self) -> usize {
        self.prefix.len()
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_parts(self) -> (Bytes, S) {
        (self.prefix, self.inner)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            let chunk = self.prefix.split_to(n);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Build a syntactically valid ClientHello record carrying `sni`.
    pub(crate) fn build_client_hello(sni: Option<&str>) -> Vec<u8> {
        let mut extensions = Vec::new();
        if let Some(name) = sni {
            let mut ext = Vec::new();
            let entry_len = 3 + name.len();
            ext.extend_from_slice(&(entry_len as u16).to_be_bytes()); // server_name_list len
            ext.push(0); // name_type host_name
            ext.extend_from_slice(&(name.len() as u16).to_be_bytes());
            ext.extend_from_slice(name.as_bytes());

            extensions.extend_from_slice(&EXTENSION_SERVER_NAME.to_be_bytes());
            extensions.extend_from_slice(&(ext.len() as u16).to_be_bytes());
            extensions.extend_from_slice(&ext);
        }
        // an unrelated extension, to exercise the scan
        extensions.extend_from_slice(&23u16.to_be_bytes()); // extended_master_secret
        extensions.extend_from_slice(&0u16.to_be_bytes());

        let mut body = Vec::new();
        body.extend_from_slice(&[3, 3]); // client version
        body.extend_from_slice(&[0xab; 32]); // random
        body.push(0); // session id length
        body.extend_from_slice(&2u16.to_be_bytes()); // cipher suites length
        body.extend_from_slice(&[0x13, 0x01]); // TLS_AES_128_GCM_SHA256
        body.push(1); // compression methods length
        body.push(0); // null
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = Vec::new();
        handshake.push(1); // ClientHello
        let len = body.len();
        handshake.extend_from_slice(&[(len >> 16) as u8, (len >> 8) as u8, len as u8]);
        handshake.extend_from_slice(&body);

        let mut record = vec![22, 3, 1];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn classifies_socks5() {
        assert_eq!(classify(&[5]).unwrap(), Some(Sniffed::Socks5));
    }

    #[test]
    fn classifies_h2_preface() {
        assert_eq!(classify(&H2_PREFACE[..10]).unwrap(), None);
        assert_eq!(classify(H2_PREFACE).unwrap(), Some(Sniffed::H2Preface));
    }

    #[test]
    fn classifies_http1() {
        assert_eq!(classify(b"GE").unwrap(), None);
        assert_eq!(classify(b"GET / HTTP/1.1\r\n").unwrap(), Some(Sniffed::Http1));
        assert_eq!(classify(b"CONNECT example.com:443").unwrap(), Some(Sniffed::Http1));
    }

    #[test]
    fn rejects_garbage() {
        assert!(classify(b"\x00\x01\x02\x03").is_err());
        assert!(classify(b"XYZZY").is_err());
    }

    #[test]
    fn extracts_sni() {
        let hello = build_client_hello(Some("b.example.com"));
        assert_eq!(
            classify(&hello).unwrap(),
            Some(Sniffed::Tls {
                sni: Some("b.example.com".into())
            })
        );
    }

    #[test]
    fn hello_without_sni() {
        let hello = build_client_hello(None);
        assert_eq!(classify(&hello).unwrap(), Some(Sniffed::Tls { sni: None }));
    }

    #[test]
    fn chunking_does_not_change_classification() {
        let hello = build_client_hello(Some("chunked.example.com"));
        // every proper prefix needs more bytes; the full record matches
        for end in 0..hello.len() {
            assert_eq!(
                classify(&hello[..end]).unwrap(),
                None,
                "prefix of {end} bytes should be inconclusive"
            );
        }
        assert_eq!(
            classify(&hello).unwrap(),
            Some(Sniffed::Tls {
                sni: Some("chunked.example.com".into())
            })
        );
    }

    #[test]
    fn rejects_record_version() {
        assert!(classify(&[22, 4]).is_err());
    }

    #[test]
    fn rejects_oversized_record() {
        let mut hello = build_client_hello(Some("x.example.com"));
        hello[3] = 0xff;
        hello[4] = 0xff;
        assert!(classify(&hello).is_err());
    }

    #[test]
    fn rejects_bad_session_id() {
        let mut hello = build_client_hello(Some("x.example.com"));
        hello[5 + 38] = 33; // session id length > 32
        assert!(classify(&hello).is_err());
    }

    #[test]
    fn rejects_odd_cipher_len() {
        let mut hello = build_client_hello(Some("x.example.com"));
        // cipher suite length sits right after the (empty) session id
        hello[5 + 39 + 1] = 3;
        assert!(classify(&hello).is_err());
    }

    #[test]
    fn rejects_extension_length_mismatch() {
        let mut hello = build_client_hello(Some("x.example.com"));
        let ext_off = 5 + 39 + 2 + 2 + 1 + 1;
        hello[ext_off] = 0xff;
        assert!(classify(&hello).is_err());
    }

    #[test]
    fn rejects_trailing_dot() {
        let hello = build_client_hello(Some("bad.example.com."));
        assert!(classify(&hello).is_err());
    }

    #[tokio::test]
    async fn sniff_stream_replays_prefix() {
        let (mut client, server) = tokio::io::duplex(1024);
        let hello = build_client_hello(Some("replay.example.com"));

        let h = hello.clone();
        let writer = tokio::spawn(async move {
            // drip the hello in 7-byte chunks to force refills
            for chunk in h.chunks(7) {
                client.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
            client
        });

        let (sniffed, mut replay) = sniff_stream(server).await.unwrap();
        assert_eq!(
            sniffed,
            Sniffed::Tls {
                sni: Some("replay.example.com".into())
            }
        );
        assert_eq!(replay.prefix_remaining(), hello.len());

        let mut buf = vec![0u8; hello.len()];
        replay.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, hello);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn sniff_stream_eof_is_error() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        assert!(sniff_stream(server).await.is_err());
    }
}
